use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ─── Hooks ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    Active,
    Inactive,
    /// Parked by an operator or imported in a failed state; only `activate`
    /// brings it back.
    Failed,
}

impl HookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for HookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url: String,
    pub events: BTreeSet<String>,
    pub status: HookStatus,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub max_retries: u32,
    pub timeout_secs: u64,
    #[serde(default)]
    pub filter_group_ids: Vec<String>,
    #[serde(default)]
    pub filter_ticket_statuses: Vec<String>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Hook {
    pub fn is_active(&self) -> bool {
        self.status == HookStatus::Active
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    /// Every configured filter axis must accept the trigger's options.
    pub fn matches(&self, options: &MatchOptions) -> bool {
        axis_allows(&self.filter_group_ids, options.group_id.as_deref())
            && axis_allows(&self.filter_ticket_statuses, options.ticket_status.as_deref())
    }
}

fn axis_allows(filter: &[String], value: Option<&str>) -> bool {
    match value {
        Some(v) if !filter.is_empty() => filter.iter().any(|f| f == v),
        _ => true,
    }
}

/// Registration input for a new hook.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewHook {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub filter_group_ids: Vec<String>,
    #[serde(default)]
    pub filter_ticket_statuses: Vec<String>,
}

/// Partial update. Absent fields are left untouched; for `description` and
/// `secret` an explicit `null` clears the value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub events: Option<Vec<String>>,
    #[serde(default)]
    pub status: Option<HookStatus>,
    #[serde(default, deserialize_with = "present")]
    pub secret: Option<Option<String>>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub filter_group_ids: Option<Vec<String>>,
    #[serde(default)]
    pub filter_ticket_statuses: Option<Vec<String>>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Extra context supplied by the producer of an event, checked against the
/// hook's filter allow-lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchOptions {
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub ticket_status: Option<String>,
}

impl MatchOptions {
    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            ..Self::default()
        }
    }
}

/// Body posted to receivers. Serialized once per trigger.
#[derive(Debug, Serialize)]
pub struct HookPayload<'a> {
    pub event: &'a str,
    pub timestamp: String,
    pub data: &'a serde_json::Value,
}

// ─── Delivery logs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub id: String,
    pub hook_id: String,
    pub event: String,
    /// Exact JSON body captured at trigger time; retries resend these bytes.
    pub payload: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(default)]
    pub response_status: Option<u16>,
    #[serde(default)]
    pub response_body: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Set while a sweep owns this log.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryLog {
    pub fn new(hook_id: &str, event: &str, payload: String, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hook_id: hook_id.to_string(),
            event: event.to_string(),
            payload,
            status: DeliveryStatus::Pending,
            attempts: 1,
            response_status: None,
            response_body: None,
            error_message: None,
            duration_ms: None,
            next_retry_at: None,
            claimed_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_attempt(
        &mut self,
        response_status: Option<u16>,
        response_body: Option<String>,
        error: Option<String>,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) {
        self.response_status = response_status;
        self.response_body = response_body;
        self.error_message = error;
        self.duration_ms = Some(duration_ms);
        self.updated_at = now;
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) {
        self.status = DeliveryStatus::Success;
        self.next_retry_at = None;
        self.claimed_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn schedule_retry(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = DeliveryStatus::Retrying;
        self.next_retry_at = Some(at);
        self.claimed_at = None;
        self.updated_at = now;
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = DeliveryStatus::Failed;
        self.error_message = Some(error.into());
        self.next_retry_at = None;
        self.claimed_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

// ─── Stats ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HookStats {
    pub hook_id: String,
    pub total_triggers: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub in_flight: u64,
    /// Percentage of logged triggers that were delivered, 0–100.
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub by_event: BTreeMap<String, EventStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook_with_filters(groups: &[&str], statuses: &[&str]) -> Hook {
        let now = Utc::now();
        Hook {
            id: "hook_1".into(),
            name: "filters".into(),
            description: None,
            url: "http://example.com/hook".into(),
            events: ["ticket.created".to_string()].into_iter().collect(),
            status: HookStatus::Active,
            secret: None,
            headers: BTreeMap::new(),
            max_retries: 3,
            timeout_secs: 10,
            filter_group_ids: groups.iter().map(|s| s.to_string()).collect(),
            filter_ticket_statuses: statuses.iter().map(|s| s.to_string()).collect(),
            success_count: 0,
            failure_count: 0,
            last_triggered_at: None,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn unfiltered_hook_matches_any_group() {
        let hook = hook_with_filters(&[], &[]);
        assert!(hook.matches(&MatchOptions::group("G1")));
        assert!(hook.matches(&MatchOptions::group("G2")));
        assert!(hook.matches(&MatchOptions::default()));
    }

    #[test]
    fn group_filter_rejects_other_groups() {
        let hook = hook_with_filters(&["G1"], &[]);
        assert!(hook.matches(&MatchOptions::group("G1")));
        assert!(!hook.matches(&MatchOptions::group("G2")));
    }

    #[test]
    fn filters_combine_with_and() {
        let hook = hook_with_filters(&["G1"], &["open"]);
        let both = MatchOptions {
            group_id: Some("G1".into()),
            ticket_status: Some("open".into()),
        };
        let wrong_status = MatchOptions {
            group_id: Some("G1".into()),
            ticket_status: Some("closed".into()),
        };
        assert!(hook.matches(&both));
        assert!(!hook.matches(&wrong_status));
    }

    #[test]
    fn patch_distinguishes_null_from_missing() {
        let patch: HookPatch = serde_json::from_str(r#"{"secret": null}"#).unwrap();
        assert_eq!(patch.secret, Some(None));
        assert!(patch.description.is_none());

        let patch: HookPatch = serde_json::from_str(r#"{"secret": "s3"}"#).unwrap();
        assert_eq!(patch.secret, Some(Some("s3".to_string())));
    }

    #[test]
    fn failing_a_log_clears_retry_schedule() {
        let now = Utc::now();
        let mut log = DeliveryLog::new("hook_1", "ticket.created", "{}".into(), now);
        log.schedule_retry(now + chrono::Duration::minutes(2), now);
        assert_eq!(log.status, DeliveryStatus::Retrying);

        log.fail("HTTP 500", now);
        assert_eq!(log.status, DeliveryStatus::Failed);
        assert!(log.next_retry_at.is_none());
        assert_eq!(log.completed_at, Some(now));
    }
}
