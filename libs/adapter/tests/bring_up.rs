//! Deferred bring-up through the notification hub

mod common;

use common::{Harness, CHANNEL, WAIT};
use relay_adapter::test_utils::{wait_until, CollectingBinding};
use relay_adapter::{
    Adapter, AdapterError, AdapterSettings, BringUp, LoopbackConfig, MediaState, Phase,
    StatusIndication, TransportError, DRIVER_TAG,
};
use std::time::Duration;

fn pending_harness(config: LoopbackConfig) -> Harness {
    Harness::new(
        AdapterSettings::named("relay0"),
        config,
        false,
        CollectingBinding::new(),
    )
}

fn media_connects(h: &Harness) -> usize {
    h.binding
        .statuses()
        .iter()
        .filter(|s| **s == StatusIndication::MediaConnect)
        .count()
}

#[tokio::test]
async fn test_not_ready_then_notification_brings_up_once() {
    let h = pending_harness(LoopbackConfig::default());

    assert_eq!(h.adapter.initialize().await.unwrap(), BringUp::Pending);
    assert_eq!(h.adapter.phase(), Phase::Initializing);
    assert_eq!(h.adapter.media_connect_status(), MediaState::Disconnected);
    assert_eq!(h.hub.subscriber_count(CHANNEL), 1);
    assert_eq!(h.provider.open_count(), 0);

    // Several announcements before the first deferred attempt runs
    h.provider.set_ready();
    h.provider.announce_ready();
    h.provider.announce_ready();

    assert!(wait_until(WAIT, || h.adapter.phase() == Phase::Ready).await);
    assert!(wait_until(WAIT, || media_connects(&h) == 1).await);

    // Later announcements are ignored once Ready
    h.provider.announce_ready();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.provider.open_count(), 1);
    assert_eq!(media_connects(&h), 1);
    assert_eq!(h.adapter.media_connect_status(), MediaState::Connected);
    assert!(h.adapter.query_counters().retry_notifications >= 1);
    assert!(!h.adapter.removal_requested());

    h.adapter.halt().await;
    assert_eq!(h.hub.subscriber_count(CHANNEL), 0);
}

#[tokio::test]
async fn test_spurious_notification_keeps_waiting() {
    let h = pending_harness(LoopbackConfig::default());
    assert_eq!(h.adapter.initialize().await.unwrap(), BringUp::Pending);

    h.hub.notify(CHANNEL, "someone-else");
    assert!(wait_until(WAIT, || h.adapter.query_counters().bring_up_attempts == 2).await);
    assert!(wait_until(WAIT, || h.adapter.outstanding_refs() == 1).await);

    assert_eq!(h.adapter.phase(), Phase::Initializing);
    assert!(!h.adapter.removal_requested());
    assert_eq!(h.hub.subscriber_count(CHANNEL), 1);

    h.adapter.halt().await;
    assert_eq!(h.adapter.phase(), Phase::Halted);
}

#[tokio::test]
async fn test_own_announcements_ignored() {
    let h = pending_harness(LoopbackConfig::default());
    assert_eq!(h.adapter.initialize().await.unwrap(), BringUp::Pending);

    // A second instance of the same driver announces itself with our tag
    let other = Adapter::attach(
        AdapterSettings::named("relay1"),
        &h.context,
        h.binding.clone(),
    )
    .unwrap();
    assert_eq!(other.initialize().await.unwrap(), BringUp::Pending);
    h.hub.notify(CHANNEL, DRIVER_TAG);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.adapter.query_counters().bring_up_attempts, 1);
    assert_eq!(other.query_counters().bring_up_attempts, 1);
    assert_eq!(h.hub.subscriber_count(CHANNEL), 2);

    other.halt().await;
    h.adapter.halt().await;
    assert_eq!(h.hub.subscriber_count(CHANNEL), 0);
}

#[tokio::test]
async fn test_deferred_failure_requests_removal() {
    let config = LoopbackConfig {
        fail_controls: Some(TransportError::failed(0xC000_0001, "query failed")),
        ..Default::default()
    };
    let h = pending_harness(config);
    assert_eq!(h.adapter.initialize().await.unwrap(), BringUp::Pending);

    h.provider.set_ready();
    assert!(wait_until(WAIT, || h.adapter.removal_requested()).await);

    assert_eq!(h.adapter.phase(), Phase::Initializing);
    assert!(h.lower().is_closed());
    assert_eq!(media_connects(&h), 0);

    h.adapter.halt().await;
}

#[tokio::test]
async fn test_immediate_failure_is_returned() {
    let config = LoopbackConfig {
        fail_controls: Some(TransportError::failed(0xC000_0001, "query failed")),
        ..Default::default()
    };
    let h = Harness::new(
        AdapterSettings::named("relay0"),
        config,
        true,
        CollectingBinding::new(),
    );

    let err = h.adapter.initialize().await.unwrap_err();
    assert!(matches!(err, AdapterError::Transport(TransportError::Failed { .. })));
    assert_eq!(h.adapter.send_pool_stats().free, 0);

    h.adapter.halt().await;
    assert_eq!(h.adapter.phase(), Phase::Halted);
}

#[tokio::test]
async fn test_halt_before_transport_arrives() {
    let h = pending_harness(LoopbackConfig::default());
    assert_eq!(h.adapter.initialize().await.unwrap(), BringUp::Pending);

    h.adapter.halt().await;
    assert_eq!(h.adapter.phase(), Phase::Halted);
    assert_eq!(h.hub.subscriber_count(CHANNEL), 0);

    // Arrives too late; nobody is listening any more
    h.provider.set_ready();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.provider.open_count(), 0);
    assert!(matches!(
        h.adapter.initialize().await,
        Err(AdapterError::Halting { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_initialize_racing_halt_ends_halted() {
    for round in 0..50 {
        let h = Harness::new(
            AdapterSettings::named("relay0"),
            LoopbackConfig::default(),
            round % 2 == 0,
            CollectingBinding::new(),
        );

        let initializing = {
            let adapter = h.adapter.clone();
            tokio::spawn(async move { adapter.initialize().await })
        };
        let halting = {
            let adapter = h.adapter.clone();
            tokio::spawn(async move { adapter.halt().await })
        };
        match initializing.await.unwrap() {
            Ok(_) | Err(AdapterError::Halting { .. }) => {}
            Err(e) => panic!("unexpected initialize failure: {}", e),
        }
        halting.await.unwrap();

        assert_eq!(h.adapter.phase(), Phase::Halted, "round {}", round);
        assert_eq!(h.hub.subscriber_count(CHANNEL), 0, "round {}", round);
        assert!(wait_until(WAIT, || h.adapter.outstanding_refs() == 0).await);
        assert!(!h.adapter.status_polling());
    }
}
