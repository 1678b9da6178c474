use crate::receive::ReceivedFrame;
use crate::transport::StatusIndication;
use crate::upper::{ProtocolBinding, SendStatus, SendToken};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A protocol binding that records every upward callback for testing
#[derive(Debug, Default)]
pub struct CollectingBinding {
    sends: Mutex<Vec<(SendToken, SendStatus)>>,
    frames: Mutex<Vec<Bytes>>,
    statuses: Mutex<Vec<StatusIndication>>,
    /// Handles kept alive when `retain_frames` is set
    retained: Mutex<Vec<ReceivedFrame>>,
    retain_frames: AtomicBool,
}

impl CollectingBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep received frame handles instead of dropping them after copying
    pub fn retaining() -> Self {
        let binding = Self::default();
        binding.retain_frames.store(true, Ordering::Release);
        binding
    }

    pub fn send_completions(&self) -> Vec<(SendToken, SendStatus)> {
        self.sends.lock().clone()
    }

    pub fn received(&self) -> Vec<Bytes> {
        self.frames.lock().clone()
    }

    pub fn statuses(&self) -> Vec<StatusIndication> {
        self.statuses.lock().clone()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.lock().len()
    }

    /// Drop every retained handle, returning their blocks
    pub fn release_retained(&self) -> usize {
        let frames = std::mem::take(&mut *self.retained.lock());
        frames.len()
    }

    /// Take retained handles out without dropping them
    pub fn take_retained(&self) -> Vec<ReceivedFrame> {
        std::mem::take(&mut *self.retained.lock())
    }
}

impl ProtocolBinding for CollectingBinding {
    fn send_complete(&self, token: SendToken, status: SendStatus) {
        self.sends.lock().push((token, status));
    }

    fn indicate_receive(&self, frame: ReceivedFrame) {
        self.frames.lock().push(frame.to_bytes());
        if self.retain_frames.load(Ordering::Acquire) {
            self.retained.lock().push(frame);
        }
    }

    fn indicate_status(&self, indication: StatusIndication) {
        self.statuses.lock().push(indication);
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
