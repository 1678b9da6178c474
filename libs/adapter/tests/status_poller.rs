//! Status watch: media state tracking and reposting

mod common;

use bytes::Bytes;
use common::{Harness, WAIT};
use relay_adapter::test_utils::wait_until;
use relay_adapter::{
    AdapterSettings, IoStatus, LoopbackConfig, MediaState, Phase, StatusCompletion,
    StatusIndication,
};
use std::time::Duration;

async fn polling() -> Harness {
    let h = Harness::ready(AdapterSettings::named("relay0"), LoopbackConfig::manual()).await;
    let lower = h.lower();
    assert!(wait_until(WAIT, || lower.has_status_watch()).await);
    assert!(h.adapter.status_polling());
    h
}

#[tokio::test]
async fn test_media_state_follows_indications() {
    let h = polling().await;
    let lower = h.lower();
    assert_eq!(h.adapter.media_connect_status(), MediaState::Connected);

    assert!(lower.complete_status(StatusCompletion::indication(
        StatusIndication::MediaDisconnect
    )));
    assert_eq!(h.adapter.media_connect_status(), MediaState::Disconnected);

    // Reposted from a deferred task
    assert!(wait_until(WAIT, || lower.has_status_watch()).await);
    assert!(lower.complete_status(StatusCompletion::indication(
        StatusIndication::MediaConnect
    )));
    assert_eq!(h.adapter.media_connect_status(), MediaState::Connected);
    assert!(wait_until(WAIT, || lower.has_status_watch()).await);

    assert_eq!(
        h.binding.statuses(),
        vec![StatusIndication::MediaDisconnect, StatusIndication::MediaConnect]
    );
    assert_eq!(h.adapter.query_counters().status_indications, 2);

    h.adapter.halt().await;
    assert!(!h.adapter.status_polling());
}

#[tokio::test]
async fn test_other_indications_forwarded_unchanged() {
    let h = polling().await;
    let lower = h.lower();
    let indication = StatusIndication::Other {
        code: 0x4001_0007,
        payload: Bytes::from_static(b"\x01\x02"),
    };

    assert!(lower.complete_status(StatusCompletion::indication(indication.clone())));
    assert!(wait_until(WAIT, || lower.has_status_watch()).await);

    assert_eq!(h.binding.statuses(), vec![indication]);
    assert_eq!(h.adapter.media_connect_status(), MediaState::Connected);

    h.adapter.halt().await;
}

#[tokio::test]
async fn test_warning_reposts_without_indication() {
    let h = polling().await;
    let lower = h.lower();

    assert!(lower.complete_status(StatusCompletion::failed(IoStatus::Warning(0x8000_0005))));
    assert!(wait_until(WAIT, || lower.has_status_watch()).await);
    assert!(h.adapter.status_polling());
    assert!(h.binding.statuses().is_empty());

    h.adapter.halt().await;
}

#[tokio::test]
async fn test_error_stops_polling() {
    let h = polling().await;
    let lower = h.lower();

    assert!(lower.complete_status(StatusCompletion::failed(IoStatus::Error(0xC000_0001))));
    assert!(!h.adapter.status_polling());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!lower.has_status_watch());

    // The adapter keeps working without a watch
    assert_eq!(h.adapter.phase(), Phase::Ready);
    h.adapter.halt().await;
    assert_eq!(h.adapter.outstanding_refs(), 0);
}

#[tokio::test]
async fn test_halt_cancels_outstanding_watch() {
    let h = polling().await;
    let lower = h.lower();

    h.adapter.halt().await;
    assert!(!lower.has_status_watch());
    assert!(!h.adapter.status_polling());
    assert_eq!(h.adapter.phase(), Phase::Halted);
    assert!(h.binding.statuses().is_empty());
}
