use crate::clock::Clock;
use crate::error::{HookError, Result};
use crate::store::{JsonFile, Snapshot};
use crate::types::{Hook, HookPatch, HookStatus, NewHook};
use crate::validation;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

const HOOKS_FILE: &str = "hooks.json";

/// Owns hook definitions. Every mutation is a single critical section on
/// the map, so concurrent deliveries of one hook never lose counter updates.
/// The file write happens after the section ends.
pub struct HookRegistry {
    hooks: RwLock<HashMap<String, Hook>>,
    file: Option<JsonFile>,
    clock: Arc<dyn Clock>,
}

impl HookRegistry {
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            hooks: RwLock::new(HashMap::new()),
            file: None,
            clock,
        }
    }

    /// Load `hooks.json` from `data_dir` and persist every later mutation there.
    pub fn open(data_dir: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let file = JsonFile::new(data_dir, HOOKS_FILE);
        let hooks = file
            .load::<Hook>()?
            .into_iter()
            .map(|h| (h.id.clone(), h))
            .collect();
        Ok(Self {
            hooks: RwLock::new(hooks),
            file: Some(file),
            clock,
        })
    }

    pub async fn create(&self, new: NewHook) -> Result<Hook> {
        let max_retries = new.max_retries.unwrap_or(validation::DEFAULT_MAX_RETRIES);
        let timeout_secs = new.timeout_secs.unwrap_or(validation::DEFAULT_TIMEOUT_SECS);

        validation::validate_name(&new.name)?;
        validation::validate_url(&new.url)?;
        validation::validate_events(&new.events)?;
        validation::validate_max_retries(max_retries)?;
        validation::validate_timeout(timeout_secs)?;
        validation::validate_headers(&new.headers)?;

        let id = format!("hook_{}", &Uuid::new_v4().to_string()[..8]);
        let now = self.clock.now();
        let hook = Hook {
            id: id.clone(),
            name: new.name.trim().to_string(),
            description: new.description,
            url: new.url,
            events: new.events.into_iter().collect(),
            status: HookStatus::Active,
            secret: new.secret.filter(|s| !s.is_empty()),
            headers: new.headers,
            max_retries,
            timeout_secs,
            filter_group_ids: new.filter_group_ids,
            filter_ticket_statuses: new.filter_ticket_statuses,
            success_count: 0,
            failure_count: 0,
            last_triggered_at: None,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        let persisted = {
            let mut hooks = self.hooks.write().await;
            hooks.insert(id.clone(), hook.clone());
            self.snapshot(&hooks)
        };
        let persisted = match persisted {
            Ok(snapshot) => self.write(snapshot).await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            self.hooks.write().await.remove(&id);
            return Err(e);
        }

        tracing::info!(target: "hook_delivery", hook_id = %id, url = %hook.url, "Hook registered");
        Ok(hook)
    }

    pub async fn get(&self, id: &str) -> Option<Hook> {
        self.hooks.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Hook> {
        let hooks = self.hooks.read().await;
        let mut items: Vec<Hook> = hooks.values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    pub async fn list_active_by_event(&self, event: &str) -> Vec<Hook> {
        let hooks = self.hooks.read().await;
        let mut items: Vec<Hook> = hooks
            .values()
            .filter(|h| h.is_active() && h.events.contains(event))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    /// Merge `patch` into the stored hook. The hook is left untouched if any
    /// patched field fails validation.
    pub async fn update(&self, id: &str, patch: HookPatch) -> Result<Hook> {
        let mut hooks = self.hooks.write().await;
        let mut next = hooks
            .get(id)
            .cloned()
            .ok_or_else(|| HookError::HookNotFound(id.to_string()))?;

        if let Some(name) = patch.name {
            validation::validate_name(&name)?;
            next.name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            next.description = description;
        }
        if let Some(url) = patch.url {
            validation::validate_url(&url)?;
            next.url = url;
        }
        if let Some(events) = patch.events {
            validation::validate_events(&events)?;
            next.events = events.into_iter().collect();
        }
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(secret) = patch.secret {
            next.secret = secret.filter(|s| !s.is_empty());
        }
        if let Some(headers) = patch.headers {
            validation::validate_headers(&headers)?;
            next.headers = headers;
        }
        if let Some(max_retries) = patch.max_retries {
            validation::validate_max_retries(max_retries)?;
            next.max_retries = max_retries;
        }
        if let Some(timeout_secs) = patch.timeout_secs {
            validation::validate_timeout(timeout_secs)?;
            next.timeout_secs = timeout_secs;
        }
        if let Some(groups) = patch.filter_group_ids {
            next.filter_group_ids = groups;
        }
        if let Some(statuses) = patch.filter_ticket_statuses {
            next.filter_ticket_statuses = statuses;
        }
        next.updated_at = self.clock.now();

        hooks.insert(id.to_string(), next.clone());
        let snapshot = self.snapshot(&hooks)?;
        drop(hooks);
        self.write(snapshot).await?;
        Ok(next)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let snapshot = {
            let mut hooks = self.hooks.write().await;
            if hooks.remove(id).is_none() {
                return Ok(false);
            }
            self.snapshot(&hooks)?
        };
        self.write(snapshot).await?;
        tracing::info!(target: "hook_delivery", hook_id = %id, "Hook deleted");
        Ok(true)
    }

    pub async fn activate(&self, id: &str) -> Result<Hook> {
        self.set_status(id, HookStatus::Active).await
    }

    pub async fn deactivate(&self, id: &str) -> Result<Hook> {
        self.set_status(id, HookStatus::Inactive).await
    }

    async fn set_status(&self, id: &str, status: HookStatus) -> Result<Hook> {
        let (updated, snapshot) = {
            let mut hooks = self.hooks.write().await;
            let hook = hooks
                .get_mut(id)
                .ok_or_else(|| HookError::HookNotFound(id.to_string()))?;
            hook.status = status;
            hook.updated_at = self.clock.now();
            let updated = hook.clone();
            (updated, self.snapshot(&hooks)?)
        };
        self.write(snapshot).await?;
        Ok(updated)
    }

    /// Deactivate an active hook and record why. Returns `false` when the
    /// hook was already inactive or is gone.
    pub async fn trip(&self, id: &str, reason: &str) -> Result<bool> {
        let snapshot = {
            let mut hooks = self.hooks.write().await;
            let Some(hook) = hooks.get_mut(id) else {
                return Ok(false);
            };
            if !hook.is_active() {
                return Ok(false);
            }
            hook.status = HookStatus::Inactive;
            hook.last_error = Some(reason.to_string());
            hook.updated_at = self.clock.now();
            self.snapshot(&hooks)?
        };
        self.write(snapshot).await?;
        Ok(true)
    }

    pub async fn record_success(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let snapshot = {
            let mut hooks = self.hooks.write().await;
            let hook = hooks
                .get_mut(id)
                .ok_or_else(|| HookError::HookNotFound(id.to_string()))?;
            hook.success_count += 1;
            hook.last_triggered_at = Some(at);
            hook.last_success_at = Some(at);
            self.snapshot(&hooks)?
        };
        self.write(snapshot).await
    }

    pub async fn record_failure(&self, id: &str, at: DateTime<Utc>, error: &str) -> Result<()> {
        let snapshot = {
            let mut hooks = self.hooks.write().await;
            let hook = hooks
                .get_mut(id)
                .ok_or_else(|| HookError::HookNotFound(id.to_string()))?;
            hook.failure_count += 1;
            hook.last_triggered_at = Some(at);
            hook.last_failure_at = Some(at);
            hook.last_error = Some(error.to_string());
            self.snapshot(&hooks)?
        };
        self.write(snapshot).await
    }

    fn snapshot(&self, hooks: &HashMap<String, Hook>) -> Result<Option<Snapshot>> {
        let Some(file) = &self.file else {
            return Ok(None);
        };
        let mut items: Vec<&Hook> = hooks.values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        file.snapshot(&items).map(Some)
    }

    async fn write(&self, snapshot: Option<Snapshot>) -> Result<()> {
        match (&self.file, snapshot) {
            (Some(file), Some(snapshot)) => file.write(snapshot).await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn registry() -> HookRegistry {
        HookRegistry::in_memory(Arc::new(SystemClock))
    }

    fn new_hook(events: &[&str]) -> NewHook {
        NewHook {
            name: "support bot".into(),
            url: "https://hooks.example.com/support".into(),
            events: events.iter().map(|e| e.to_string()).collect(),
            ..NewHook::default()
        }
    }

    #[tokio::test]
    async fn create_applies_defaults() {
        let reg = registry();
        let hook = reg.create(new_hook(&["ticket.created"])).await.unwrap();
        assert!(hook.id.starts_with("hook_"));
        assert_eq!(hook.status, HookStatus::Active);
        assert_eq!(hook.max_retries, validation::DEFAULT_MAX_RETRIES);
        assert_eq!(hook.timeout_secs, validation::DEFAULT_TIMEOUT_SECS);
        assert_eq!(reg.get(&hook.id).await.unwrap().name, "support bot");
    }

    #[tokio::test]
    async fn create_rejects_invalid_definitions() {
        let reg = registry();
        assert!(matches!(
            reg.create(new_hook(&[])).await,
            Err(HookError::Validation(_))
        ));

        let mut bad_url = new_hook(&["ticket.created"]);
        bad_url.url = "hooks.example.com".into();
        assert!(reg.create(bad_url).await.is_err());

        let mut bad_retries = new_hook(&["ticket.created"]);
        bad_retries.max_retries = Some(42);
        assert!(reg.create(bad_retries).await.is_err());

        assert!(reg.list().await.is_empty());
    }

    #[tokio::test]
    async fn update_merges_and_keeps_hook_on_invalid_patch() {
        let reg = registry();
        let hook = reg.create(new_hook(&["ticket.created"])).await.unwrap();

        let patch = HookPatch {
            events: Some(vec!["ticket.closed".into(), "message.sent".into()]),
            timeout_secs: Some(5),
            ..HookPatch::default()
        };
        let updated = reg.update(&hook.id, patch).await.unwrap();
        assert_eq!(updated.name, hook.name);
        assert_eq!(updated.timeout_secs, 5);
        assert!(updated.events.contains("message.sent"));
        assert!(!updated.events.contains("ticket.created"));

        let bad = HookPatch {
            name: Some("renamed".into()),
            url: Some("nope".into()),
            ..HookPatch::default()
        };
        assert!(reg.update(&hook.id, bad).await.is_err());
        assert_eq!(reg.get(&hook.id).await.unwrap().name, hook.name);
    }

    #[tokio::test]
    async fn inactive_hooks_are_not_listed_for_events() {
        let reg = registry();
        let a = reg.create(new_hook(&["ticket.created"])).await.unwrap();
        let b = reg.create(new_hook(&["ticket.created"])).await.unwrap();
        reg.create(new_hook(&["message.sent"])).await.unwrap();

        reg.deactivate(&b.id).await.unwrap();
        let active = reg.list_active_by_event("ticket.created").await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        reg.activate(&b.id).await.unwrap();
        assert_eq!(reg.list_active_by_event("ticket.created").await.len(), 2);
    }

    #[tokio::test]
    async fn delete_reports_whether_hook_existed() {
        let reg = registry();
        let hook = reg.create(new_hook(&["ticket.created"])).await.unwrap();
        assert!(reg.delete(&hook.id).await.unwrap());
        assert!(!reg.delete(&hook.id).await.unwrap());
        assert!(reg.get(&hook.id).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_counter_updates_are_not_lost() {
        let reg = Arc::new(registry());
        let hook = reg.create(new_hook(&["ticket.created"])).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..50 {
            let reg = reg.clone();
            let id = hook.id.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    reg.record_success(&id, Utc::now()).await.unwrap();
                } else {
                    reg.record_failure(&id, Utc::now(), "HTTP 500").await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let hook = reg.get(&hook.id).await.unwrap();
        assert_eq!(hook.success_count, 25);
        assert_eq!(hook.failure_count, 25);
    }

    #[tokio::test]
    async fn trip_only_affects_active_hooks() {
        let reg = registry();
        let hook = reg.create(new_hook(&["ticket.created"])).await.unwrap();
        assert!(reg.trip(&hook.id, "too many failures").await.unwrap());
        assert!(!reg.trip(&hook.id, "too many failures").await.unwrap());

        let hook = reg.get(&hook.id).await.unwrap();
        assert_eq!(hook.status, HookStatus::Inactive);
        assert_eq!(hook.last_error.as_deref(), Some("too many failures"));
    }
}
