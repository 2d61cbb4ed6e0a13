//! End-to-end recovery: health check → classification → bounded reconnection.

mod common;

use std::time::Duration;

use common::{ScriptedUpstream, container, down, up};
use radio_relay::config::AppConfig;
use radio_relay::domain::{BroadcastId, DisconnectionCategory};
use radio_relay::reconnection::{ReconnectionEvent, ReconnectionStatus, Topic, TopicSubscription};

fn config(max_attempts: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.health.startup_grace_ms = 0;
    config.reconnection.max_attempts = max_attempts;
    config
}

async fn collect_until_terminal(subscription: &mut TopicSubscription) -> Vec<ReconnectionEvent> {
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(300), async {
        while let Some(event) = subscription.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
    })
    .await
    .expect("recovery did not finish");
    events
}

#[tokio::test(start_paused = true)]
async fn test_source_drop_recovers_on_second_attempt() {
    let upstream = ScriptedUpstream::new(vec![down(), down(), up()]);
    let services = container(&config(5), upstream.clone());
    let id = BroadcastId::from(42);
    let mut events = services
        .reconnection
        .subscribe_topic(Topic::Broadcast(id.clone()));

    services.health_monitor.watch(id.clone());
    let report = services.health_monitor.check(&id).await.unwrap();
    assert_eq!(report.category, DisconnectionCategory::SourceDisconnected);
    assert!(report.triggered_recovery);

    let events = collect_until_terminal(&mut events).await;
    let statuses: Vec<_> = events.iter().map(|e| (e.status, e.attempt_number)).collect();
    assert_eq!(
        statuses,
        vec![
            (ReconnectionStatus::Started, 0),
            (ReconnectionStatus::Attempting, 1),
            (ReconnectionStatus::Attempting, 2),
            (ReconnectionStatus::Success, 2),
        ]
    );
    assert!(events.iter().all(|e| e.status != ReconnectionStatus::Failed));
    assert!(events.iter().all(|e| e.max_attempts == 5));
    assert_eq!(events[0].next_delay_ms, Some(1_000));
    assert_eq!(events[1].next_delay_ms, Some(2_000));
    assert_eq!(
        events[0].disconnection_type,
        DisconnectionCategory::SourceDisconnected
    );

    assert!(!services.reconnection.is_reconnecting(&id));
    assert!(services.reconnection.attempt(&id).is_none());
    assert_eq!(upstream.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_recovery_waits_for_operator() {
    let upstream = ScriptedUpstream::new(vec![down()]);
    let services = container(&config(2), upstream.clone());
    services.initialize();
    let id = BroadcastId::from(42);
    let mut events = services.reconnection.subscribe_topic(Topic::Global);

    services.health_monitor.watch(id.clone());
    assert!(services.health_monitor.check(&id).await.unwrap().triggered_recovery);

    let events = collect_until_terminal(&mut events).await;
    let last = events.last().unwrap();
    assert_eq!(last.status, ReconnectionStatus::Failed);
    assert_eq!(last.attempt_number, 2);
    assert_eq!(events.len(), 4);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(services.health_monitor.is_exhausted(&id));
    // No relay is running, so the broadcast is no longer probed.
    assert!(!services.health_monitor.is_watching(&id));

    let calls = upstream.calls();
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(!services.reconnection.is_reconnecting(&id));
    assert!(services.health_monitor.latest(&id).is_none());
    assert_eq!(upstream.calls(), calls);

    services.end_broadcast(&id);
    assert!(!services.health_monitor.is_exhausted(&id));
    services.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_operator_end_silences_recovery() {
    let upstream = ScriptedUpstream::new(vec![down()]);
    let services = container(&config(5), upstream.clone());
    let id = BroadcastId::from(42);
    let mut events = services
        .reconnection
        .subscribe_topic(Topic::Broadcast(id.clone()));

    services.health_monitor.watch(id.clone());
    services.health_monitor.check(&id).await.unwrap();
    let started = events.recv().await.unwrap();
    assert_eq!(started.status, ReconnectionStatus::Started);

    assert!(services.end_broadcast(&id));
    let calls = upstream.calls();

    let next = tokio::time::timeout(Duration::from_secs(120), events.recv()).await;
    assert!(next.is_err(), "no events after operator end");
    assert_eq!(upstream.calls(), calls);
}
