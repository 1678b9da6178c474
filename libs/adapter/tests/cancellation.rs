//! Cancellation racing completion: every transfer is disposed exactly once
//! and halt waits for all of them

mod common;

use common::{frame_to, Harness, CHANNEL, WAIT};
use relay_adapter::test_utils::wait_until;
use relay_adapter::{
    AdapterError, AdapterSettings, IoStatus, LoopbackConfig, MacAddress, Phase, SendStatus,
    StatusCompletion, SubmitOutcome,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

const PEER: MacAddress = MacAddress([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_halt_races_write_completions() {
    for round in 0..25 {
        let settings = AdapterSettings::named(format!("race{}", round)).with_pools(8, 2, 1);
        let h = Harness::ready(settings, LoopbackConfig::manual()).await;
        let lower = h.lower();

        let tokens: Vec<_> = (0..8u8)
            .map(|i| h.adapter.submit_frame(frame_to(PEER, i)).token().unwrap())
            .collect();
        let ids = lower.pending_write_ids();
        assert_eq!(ids.len(), 8);

        let completer = {
            let lower = Arc::clone(&lower);
            thread::spawn(move || {
                for id in ids {
                    lower.complete_write(id, IoStatus::Success);
                }
            })
        };

        h.adapter.halt().await;
        completer.join().unwrap();

        let completions = h.binding.send_completions();
        let mut per_token: HashMap<u64, usize> = HashMap::new();
        for (token, status) in &completions {
            assert!(matches!(status, SendStatus::Success | SendStatus::Aborted));
            *per_token.entry(*token).or_default() += 1;
        }
        for token in &tokens {
            assert_eq!(per_token.get(token), Some(&1), "round {} token {}", round, token);
        }
        assert_eq!(completions.len(), tokens.len());

        assert_eq!(h.adapter.phase(), Phase::Halted);
        assert_eq!(h.adapter.outstanding_refs(), 0);
        assert_eq!(h.adapter.send_pool_stats().busy, 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_halt_waits_for_late_cancel_completions() {
    let config = LoopbackConfig {
        complete_on_cancel: false,
        ..LoopbackConfig::manual()
    };
    let settings = AdapterSettings::named("relay0").with_pools(4, 2, 1);
    let h = Harness::ready(settings, config).await;
    let lower = h.lower();
    assert!(wait_until(WAIT, || lower.pending_reads() == 2).await);

    for i in 0..4u8 {
        h.adapter.submit_frame(frame_to(PEER, i));
    }
    let ids = lower.pending_write_ids();

    let adapter = h.adapter.clone();
    let halt = tokio::spawn(async move { adapter.halt().await });

    // Cancel requested for every write, but nothing has completed
    assert!(wait_until(WAIT, || ids.iter().all(|id| lower.cancelled().contains(id))).await);
    assert_eq!(h.adapter.phase(), Phase::Halting);
    assert!(!halt.is_finished());
    assert!(h.binding.send_completions().is_empty());

    for id in &ids {
        assert!(lower.complete_write(*id, IoStatus::Cancelled));
    }
    // Reads and the status watch are still outstanding on the loopback too
    while lower.fail_next_read(IoStatus::Cancelled) {}
    assert!(lower.complete_status(StatusCompletion::failed(IoStatus::Cancelled)));

    halt.await.unwrap();
    assert_eq!(h.adapter.phase(), Phase::Halted);

    let completions = h.binding.send_completions();
    assert_eq!(completions.len(), 4);
    assert!(completions.iter().all(|(_, s)| *s == SendStatus::Aborted));
    assert_eq!(h.adapter.query_counters().cancelled_transfers, 4 + 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_halt_races_read_completions() {
    for round in 0..25 {
        let settings = AdapterSettings::named(format!("rx{}", round)).with_pools(2, 8, 8);
        let h = Harness::ready(settings, LoopbackConfig::manual()).await;
        let lower = h.lower();
        h.adapter.set_packet_filter(0x0001).unwrap();
        assert!(wait_until(WAIT, || lower.pending_reads() == 8).await);

        let station = h.adapter.current_address();
        let delivering = {
            let lower = Arc::clone(&lower);
            thread::spawn(move || {
                let mut delivered = 0;
                for tag in 0..8u8 {
                    if lower.deliver(&frame_to(station, tag)) {
                        delivered += 1;
                    }
                }
                delivered
            })
        };

        h.adapter.halt().await;
        let delivered = delivering.join().unwrap();

        let counters = h.adapter.query_counters();
        assert_eq!(counters.good_receives as usize, h.binding.received().len());
        assert!(h.binding.received().len() <= delivered);
        assert_eq!(h.adapter.phase(), Phase::Halted);
        assert_eq!(h.adapter.outstanding_refs(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_references_only_fall_during_halt() {
    let config = LoopbackConfig {
        complete_on_cancel: false,
        ..LoopbackConfig::manual()
    };
    let settings = AdapterSettings::named("relay0").with_pools(4, 4, 4);
    let h = Harness::ready(settings, config).await;
    let lower = h.lower();
    h.adapter.set_packet_filter(0x0001).unwrap();
    assert!(wait_until(WAIT, || lower.pending_reads() == 4).await);
    for i in 0..4u8 {
        h.adapter.submit_frame(frame_to(PEER, i));
    }
    let write_ids = lower.pending_write_ids();
    assert_eq!(write_ids.len(), 4);

    let adapter = h.adapter.clone();
    let halt = tokio::spawn(async move { adapter.halt().await });

    // Four writes, four reads and the status watch
    assert!(wait_until(WAIT, || lower.cancelled().len() == 9).await);
    // Halt has dropped the base reference
    assert!(wait_until(WAIT, || h.adapter.outstanding_refs() == 9).await);
    let mut last = h.adapter.outstanding_refs();

    // Completions, resubmissions and announcements after halt began
    let station = h.adapter.current_address();
    for tag in 0..4u8 {
        let reads = lower.pending_reads();
        assert!(lower.deliver(&frame_to(station, tag)));
        assert!(matches!(
            h.adapter.submit_frame(frame_to(PEER, tag)),
            SubmitOutcome::Rejected(_)
        ));
        assert!(matches!(
            h.adapter.set_packet_filter(0x0009),
            Err(AdapterError::Halting { .. })
        ));
        h.hub.notify(CHANNEL, "lower0");

        assert_eq!(lower.pending_reads(), reads - 1);
        let now = h.adapter.outstanding_refs();
        assert!(now < last, "references rose from {} to {}", last, now);
        last = now;
    }
    assert_eq!(h.binding.received().len(), 4);

    for id in &write_ids {
        assert!(lower.complete_write(*id, IoStatus::Cancelled));
    }
    assert!(lower.complete_status(StatusCompletion::failed(IoStatus::Cancelled)));
    assert!(h.adapter.outstanding_refs() <= last);

    halt.await.unwrap();
    assert_eq!(h.adapter.phase(), Phase::Halted);
    assert_eq!(h.adapter.outstanding_refs(), 0);

    // Nothing was reposted behind the halt
    assert!(!lower.deliver(&frame_to(station, 9)));
    assert_eq!(lower.pending_reads(), 0);
    assert!(lower.pending_write_ids().is_empty());
    assert!(!h.adapter.status_polling());
}
