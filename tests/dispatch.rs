mod common;

use common::{engine, hook_for, Receiver, SECRET};
use nexus_hook_dispatcher::signer;
use nexus_hook_dispatcher::{DeliveryStatus, MatchOptions, NewHook};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[tokio::test]
async fn delivers_only_to_subscribed_hooks() {
    let created = Receiver::start(200).await;
    let closed = Receiver::start(200).await;
    let (engine, _clock) = engine();

    engine
        .create_hook(hook_for(&created.url, &["ticket.created"]))
        .await
        .unwrap();
    engine
        .create_hook(hook_for(&closed.url, &["ticket.closed"]))
        .await
        .unwrap();

    let dispatch = engine
        .trigger("ticket.created", json!({"ticket_id": 1}), MatchOptions::default())
        .await;
    assert_eq!(dispatch.hook_count(), 1);
    assert_eq!(dispatch.completed().await, 1);

    assert_eq!(created.request_count(), 1);
    assert_eq!(closed.request_count(), 0);
}

#[tokio::test]
async fn unfiltered_hook_receives_every_group() {
    let receiver = Receiver::start(200).await;
    let (engine, _clock) = engine();
    engine
        .create_hook(hook_for(&receiver.url, &["ticket.created"]))
        .await
        .unwrap();

    for group in ["G1", "G2"] {
        engine
            .trigger("ticket.created", json!({"group": group}), MatchOptions::group(group))
            .await
            .completed()
            .await;
    }
    assert_eq!(receiver.request_count(), 2);
}

#[tokio::test]
async fn group_filter_excludes_other_groups() {
    let receiver = Receiver::start(200).await;
    let (engine, _clock) = engine();
    engine
        .create_hook(NewHook {
            filter_group_ids: vec!["G1".into()],
            ..hook_for(&receiver.url, &["ticket.created"])
        })
        .await
        .unwrap();

    let excluded = engine
        .trigger("ticket.created", json!({}), MatchOptions::group("G2"))
        .await;
    assert!(excluded.is_empty());

    engine
        .trigger("ticket.created", json!({}), MatchOptions::group("G1"))
        .await
        .completed()
        .await;
    assert_eq!(receiver.request_count(), 1);
    assert_eq!(engine.delivery_logs(None, None).await.len(), 1);
}

#[tokio::test]
async fn ticket_status_filter_combines_with_group_filter() {
    let receiver = Receiver::start(200).await;
    let (engine, _clock) = engine();
    engine
        .create_hook(NewHook {
            filter_group_ids: vec!["G1".into()],
            filter_ticket_statuses: vec!["open".into()],
            ..hook_for(&receiver.url, &["ticket.updated"])
        })
        .await
        .unwrap();

    let closed_in_g1 = MatchOptions {
        group_id: Some("G1".into()),
        ticket_status: Some("closed".into()),
    };
    assert!(engine
        .trigger("ticket.updated", json!({}), closed_in_g1)
        .await
        .is_empty());

    let open_in_g1 = MatchOptions {
        group_id: Some("G1".into()),
        ticket_status: Some("open".into()),
    };
    assert_eq!(
        engine
            .trigger("ticket.updated", json!({}), open_in_g1)
            .await
            .hook_count(),
        1
    );
}

#[tokio::test]
async fn inactive_hooks_are_skipped() {
    let receiver = Receiver::start(200).await;
    let (engine, _clock) = engine();
    let hook = engine
        .create_hook(hook_for(&receiver.url, &["message.sent"]))
        .await
        .unwrap();
    engine.deactivate_hook(&hook.id).await.unwrap();

    let dispatch = engine
        .trigger("message.sent", json!({}), MatchOptions::default())
        .await;
    assert!(dispatch.is_empty());
    assert!(engine.delivery_logs(None, None).await.is_empty());
}

#[tokio::test]
async fn successful_delivery_is_logged_once() {
    let receiver = Receiver::start(200).await;
    let (engine, _clock) = engine();
    let hook = engine
        .create_hook(hook_for(&receiver.url, &["ticket.assigned"]))
        .await
        .unwrap();

    engine
        .trigger("ticket.assigned", json!({"ticket_id": 7}), MatchOptions::default())
        .await
        .completed()
        .await;

    let logs = engine.delivery_logs(Some(&hook.id), None).await;
    assert_eq!(logs.len(), 1);
    let log = &logs[0];
    assert_eq!(log.status, DeliveryStatus::Success);
    assert_eq!(log.attempts, 1);
    assert_eq!(log.response_status, Some(200));
    assert!(log.next_retry_at.is_none());
    assert!(log.completed_at.is_some());
    assert_eq!(log.response_body.as_deref(), Some("receiver answered 200"));

    let hook = engine.get_hook(&hook.id).await.unwrap();
    assert_eq!(hook.success_count, 1);
    assert_eq!(hook.failure_count, 0);
    assert!(hook.last_success_at.is_some());
    assert!(hook.last_triggered_at.is_some());
}

#[tokio::test]
async fn failing_sibling_does_not_affect_other_hooks() {
    let healthy = Receiver::start(200).await;
    let broken = Receiver::start(500).await;
    let (engine, _clock) = engine();
    let good = engine
        .create_hook(hook_for(&healthy.url, &["ticket.created"]))
        .await
        .unwrap();
    let bad = engine
        .create_hook(hook_for(&broken.url, &["ticket.created"]))
        .await
        .unwrap();

    let dispatch = engine
        .trigger("ticket.created", json!({}), MatchOptions::default())
        .await;
    assert_eq!(dispatch.completed().await, 2);

    let good_log = &engine.delivery_logs(Some(&good.id), None).await[0];
    let bad_log = &engine.delivery_logs(Some(&bad.id), None).await[0];
    assert_eq!(good_log.status, DeliveryStatus::Success);
    assert_eq!(bad_log.status, DeliveryStatus::Retrying);
    assert_eq!(bad_log.error_message.as_deref(), Some("HTTP 500"));
}

#[tokio::test]
async fn unreachable_hook_records_connection_failure() {
    let (engine, _clock) = engine();
    let url = format!("http://127.0.0.1:{}/hook", common::closed_port());
    let hook = engine
        .create_hook(hook_for(&url, &["ticket.created"]))
        .await
        .unwrap();

    engine
        .trigger("ticket.created", json!({}), MatchOptions::default())
        .await
        .completed()
        .await;

    let log = &engine.delivery_logs(Some(&hook.id), None).await[0];
    assert_eq!(log.status, DeliveryStatus::Retrying);
    assert!(log.response_status.is_none());
    assert!(log.error_message.is_some());
}

#[tokio::test]
async fn signature_verifies_against_received_body() {
    let receiver = Receiver::start(200).await;
    let (engine, _clock) = engine();
    engine
        .create_hook(NewHook {
            secret: Some(SECRET.into()),
            ..hook_for(&receiver.url, &["user.mentioned"])
        })
        .await
        .unwrap();

    engine
        .trigger("user.mentioned", json!({"user_id": "u1"}), MatchOptions::default())
        .await
        .completed()
        .await;

    let request = &receiver.requests()[0];
    let signature = request.header("x-hook-signature").unwrap();
    assert!(signature.starts_with("sha256="));
    assert!(signer::verify(&request.body, SECRET, signature));
    assert!(!signer::verify(&request.body, "wrong-secret", signature));

    let body = request.body_json();
    assert_eq!(body["event"], "user.mentioned");
    assert_eq!(body["data"]["user_id"], "u1");
    assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn sends_delivery_headers_and_custom_headers() {
    let receiver = Receiver::start(200).await;
    let (engine, _clock) = engine();
    let mut headers = BTreeMap::new();
    headers.insert("X-Team".to_string(), "support".to_string());
    let hook = engine
        .create_hook(NewHook {
            headers,
            ..hook_for(&receiver.url, &["topic.linked"])
        })
        .await
        .unwrap();

    engine
        .trigger("topic.linked", json!({}), MatchOptions::default())
        .await
        .completed()
        .await;

    let request = &receiver.requests()[0];
    let log = &engine.delivery_logs(Some(&hook.id), None).await[0];
    assert_eq!(request.header("x-team"), Some("support"));
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.header("x-hook-event"), Some("topic.linked"));
    assert_eq!(request.header("x-hook-delivery"), Some(log.id.as_str()));
    assert!(request.header("x-hook-timestamp").is_some());
    assert!(request.header("x-hook-attempt").is_none());
    assert!(request.header("x-hook-signature").is_none());
}

#[tokio::test]
async fn reserved_custom_headers_are_rejected() {
    let (engine, _clock) = engine();
    let mut headers = BTreeMap::new();
    headers.insert("X-Hook-Signature".to_string(), "sha256=forged".to_string());

    let err = engine
        .create_hook(NewHook {
            headers,
            ..hook_for("https://example.com/hook", &["ticket.created"])
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot be overridden"), "{err}");
}

#[tokio::test]
async fn trigger_returns_before_slow_receiver_answers() {
    let receiver = Receiver::slow(Duration::from_millis(800)).await;
    let (engine, _clock) = engine();
    engine
        .create_hook(hook_for(&receiver.url, &["ticket.reopened"]))
        .await
        .unwrap();

    let start = Instant::now();
    let dispatch = engine
        .trigger("ticket.reopened", json!({}), MatchOptions::default())
        .await;
    assert!(start.elapsed() < Duration::from_millis(400));
    assert_eq!(dispatch.hook_count(), 1);

    // Detached deliveries still finish.
    drop(dispatch);
    assert!(receiver.wait_for(1, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn unknown_event_matches_nothing() {
    let receiver = Receiver::start(200).await;
    let (engine, _clock) = engine();
    engine
        .create_hook(hook_for(&receiver.url, &["ticket.created"]))
        .await
        .unwrap();

    let dispatch = engine
        .trigger("ticket.exploded", json!({}), MatchOptions::default())
        .await;
    assert!(dispatch.is_empty());
}
