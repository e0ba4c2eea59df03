//! State shared between the control surface, the capture producer and the
//! pipeline thread

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::session::metrics::SessionMetrics;

/// Externally visible session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Streaming,
    /// Audio could not be brought up; the session never streams
    Failed,
}

/// Level-triggered wake signal with timeout.
///
/// A `notify` that arrives while nobody waits is remembered, so the next
/// `wait` returns immediately.
#[derive(Debug, Default)]
pub struct Wakeup {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    /// Wait for a notification or `timeout`. Returns true if notified.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

/// Cross-thread session state.
///
/// `streaming` and `epoch` are the only fields the data path reads without a
/// buffer lock; the rest are settings and counters.
#[derive(Debug)]
pub struct SessionShared {
    streaming: AtomicBool,
    epoch: AtomicU64,
    shutdown: AtomicBool,
    failed: AtomicBool,
    mic_gain: AtomicU32,
    dc_offset_removal: AtomicBool,
    aec_enabled: AtomicBool,
    dc_reset: AtomicBool,
    pub wakeup: Wakeup,
    pub metrics: SessionMetrics,
}

impl SessionShared {
    pub fn new(mic_gain: f32, dc_offset_removal: bool, aec_enabled: bool) -> Self {
        Self {
            streaming: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            mic_gain: AtomicU32::new(mic_gain.to_bits()),
            dc_offset_removal: AtomicBool::new(dc_offset_removal),
            aec_enabled: AtomicBool::new(aec_enabled),
            dc_reset: AtomicBool::new(false),
            wakeup: Wakeup::new(),
            metrics: SessionMetrics::new(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Enter Streaming: new epoch, then raise the flag
    pub fn begin_streaming(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.streaming.store(true, Ordering::Release);
        epoch
    }

    /// Leave Streaming: drop the flag, then new epoch
    pub fn end_streaming(&self) -> u64 {
        self.streaming.store(false, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wakeup.notify();
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn mic_gain(&self) -> f32 {
        f32::from_bits(self.mic_gain.load(Ordering::Relaxed))
    }

    pub fn set_mic_gain(&self, gain: f32) {
        self.mic_gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn dc_offset_removal(&self) -> bool {
        self.dc_offset_removal.load(Ordering::Relaxed)
    }

    pub fn set_dc_offset_removal(&self, enabled: bool) {
        self.dc_offset_removal.store(enabled, Ordering::Relaxed);
    }

    pub fn aec_enabled(&self) -> bool {
        self.aec_enabled.load(Ordering::Relaxed)
    }

    pub fn set_aec_enabled(&self, enabled: bool) {
        self.aec_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Ask the capture producer to forget its DC estimate
    pub fn request_dc_reset(&self) {
        self.dc_reset.store(true, Ordering::Release);
    }

    /// Consume a pending DC reset request
    pub fn take_dc_reset(&self) -> bool {
        self.dc_reset.swap(false, Ordering::AcqRel)
    }

    pub fn state(&self) -> StreamState {
        if self.is_failed() {
            StreamState::Failed
        } else if self.is_streaming() {
            StreamState::Streaming
        } else {
            StreamState::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_epoch_bumps_on_every_transition() {
        let shared = SessionShared::new(1.0, false, false);
        assert_eq!(shared.epoch(), 0);
        assert_eq!(shared.begin_streaming(), 1);
        assert!(shared.is_streaming());
        assert_eq!(shared.end_streaming(), 2);
        assert!(!shared.is_streaming());
        assert_eq!(shared.state(), StreamState::Idle);

        shared.mark_failed();
        assert_eq!(shared.state(), StreamState::Failed);
    }

    #[test]
    fn test_wakeup_remembers_early_notify() {
        let wakeup = Wakeup::new();
        wakeup.notify();
        let start = Instant::now();
        assert!(wakeup.wait(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!wakeup.wait(Duration::from_millis(5)));
    }

    #[test]
    fn test_wakeup_from_other_thread() {
        let shared = Arc::new(SessionShared::new(1.0, false, false));
        let notifier = shared.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.request_shutdown();
        });

        let start = Instant::now();
        while !shared.is_shutdown() && start.elapsed() < Duration::from_secs(2) {
            shared.wakeup.wait(Duration::from_millis(500));
        }
        handle.join().unwrap();
        assert!(shared.is_shutdown());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_dc_reset_is_consumed_once() {
        let shared = SessionShared::new(4.0, true, false);
        assert!(!shared.take_dc_reset());
        shared.request_dc_reset();
        assert!(shared.take_dc_reset());
        assert!(!shared.take_dc_reset());
        assert_eq!(shared.mic_gain(), 4.0);
    }
}
