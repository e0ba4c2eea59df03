//! Capture channel: the single-producer/single-consumer path from the
//! microphone callback to the pipeline thread
//!
//! The producer half runs on whatever thread the microphone calls back on. It
//! conditions the audio and commits it to the mic ring buffer only if the
//! session epoch it started under is still current once the buffer lock is
//! held, so frames captured before a stop or restart never leak into the next
//! session.

use std::sync::Arc;

use crate::audio::buffer::{SharedRingBuffer, WriteOutcome};
use crate::audio::dsp::{MicConditioner, SampleWidth};
use crate::constants::{FRAME_BYTES, LOCK_TIMEOUT};
use crate::session::state::SessionShared;

/// Largest conditioned chunk committed in one piece
const MAX_COMMIT_BYTES: usize = FRAME_BYTES * 4;

/// Create the two halves of a capture channel over `buffer`
pub fn capture_channel(
    buffer: SharedRingBuffer,
    shared: Arc<SessionShared>,
    width: SampleWidth,
) -> (CaptureProducer, CaptureConsumer) {
    let producer = CaptureProducer {
        buffer: buffer.clone(),
        shared,
        conditioner: MicConditioner::new(width),
        scratch: vec![0u8; MAX_COMMIT_BYTES],
    };
    (producer, CaptureConsumer { buffer })
}

/// Writing half, owned by the microphone callback. Not `Clone`.
pub struct CaptureProducer {
    buffer: SharedRingBuffer,
    shared: Arc<SessionShared>,
    conditioner: MicConditioner,
    scratch: Vec<u8>,
}

impl CaptureProducer {
    /// Condition and buffer one captured block.
    ///
    /// Returns the outcome of the last commit. A commit rejected for lack of
    /// space or lock contention counts one transmit drop; one rejected because
    /// the session stopped or restarted does not.
    pub fn push(&mut self, raw: &[u8]) -> WriteOutcome {
        if !self.shared.is_streaming() {
            return WriteOutcome::Stale;
        }
        let epoch = self.shared.epoch();

        if self.shared.take_dc_reset() {
            self.conditioner.reset();
        }

        let gain = self.shared.mic_gain();
        let remove_dc = self.shared.dc_offset_removal();
        let step = self.conditioner.width().bytes();
        let raw_per_commit = MAX_COMMIT_BYTES / 2 * step;

        let mut outcome = WriteOutcome::Committed;
        for block in raw.chunks(raw_per_commit) {
            let n = self.conditioner.condition(block, gain, remove_dc, &mut self.scratch);
            if n == 0 {
                continue;
            }
            outcome = self.commit(epoch, n);
            if outcome == WriteOutcome::Stale {
                break;
            }
        }
        outcome
    }

    fn commit(&self, epoch: u64, len: usize) -> WriteOutcome {
        let shared = &self.shared;
        let outcome = self.buffer.try_write_exact_for(&self.scratch[..len], LOCK_TIMEOUT, || {
            shared.is_streaming() && shared.epoch() == epoch
        });

        match outcome {
            WriteOutcome::Full | WriteOutcome::Contended => {
                shared.metrics.record_tx_drop();
                tracing::trace!("Capture frame dropped ({:?})", outcome);
            }
            WriteOutcome::Stale => tracing::trace!("Discarded capture frame from epoch {}", epoch),
            WriteOutcome::Committed => {}
        }
        outcome
    }
}

/// Reading half, owned by the pipeline thread. Not `Clone`.
pub struct CaptureConsumer {
    buffer: SharedRingBuffer,
}

impl CaptureConsumer {
    /// Take exactly one frame. False if a whole frame is not buffered or the
    /// lock could not be taken in time.
    pub fn pop_frame(&mut self, frame: &mut [u8]) -> bool {
        self.buffer.try_read_exact_for(frame, LOCK_TIMEOUT)
    }

    pub fn available(&self) -> usize {
        self.buffer.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::create_shared_buffer;

    fn setup(capacity: usize, gain: f32) -> (Arc<SessionShared>, CaptureProducer, CaptureConsumer) {
        let shared = Arc::new(SessionShared::new(gain, false, false));
        let (producer, consumer) = capture_channel(create_shared_buffer(capacity), shared.clone(), SampleWidth::S16);
        (shared, producer, consumer)
    }

    #[test]
    fn test_ignored_while_idle() {
        let (shared, mut producer, consumer) = setup(2048, 1.0);
        assert_eq!(producer.push(&[1u8; 512]), WriteOutcome::Stale);
        assert_eq!(consumer.available(), 0);
        assert_eq!(shared.metrics.tx_drops(), 0);
    }

    #[test]
    fn test_drop_accounting_per_call() {
        let (shared, mut producer, mut consumer) = setup(2048, 1.0);
        shared.begin_streaming();

        let mut committed = 0;
        for _ in 0..10 {
            if producer.push(&[0x22u8; 512]) == WriteOutcome::Committed {
                committed += 1;
            }
        }

        assert_eq!(committed, 4);
        assert_eq!(shared.metrics.tx_drops(), 6);

        let mut frame = [0u8; 512];
        for _ in 0..4 {
            assert!(consumer.pop_frame(&mut frame));
        }
        assert!(!consumer.pop_frame(&mut frame));
    }

    #[test]
    fn test_epoch_change_invalidates_commit() {
        let (shared, mut producer, consumer) = setup(2048, 1.0);
        shared.begin_streaming();
        assert_eq!(producer.push(&[1u8; 512]), WriteOutcome::Committed);

        // A restart between capture and commit
        let epoch = shared.epoch();
        shared.end_streaming();
        shared.begin_streaming();
        producer.scratch[..4].copy_from_slice(&[9, 9, 9, 9]);
        assert_eq!(producer.commit(epoch, 4), WriteOutcome::Stale);

        assert_eq!(consumer.available(), 512);
        assert_eq!(shared.metrics.tx_drops(), 0);
    }

    #[test]
    fn test_gain_applied_before_buffering() {
        let (shared, mut producer, mut consumer) = setup(2048, 4.0);
        shared.begin_streaming();

        let raw: Vec<u8> = std::iter::repeat(1000i16.to_le_bytes()).take(256).flatten().collect();
        producer.push(&raw);

        let mut frame = [0u8; 512];
        assert!(consumer.pop_frame(&mut frame));
        assert_eq!(i16::from_le_bytes([frame[0], frame[1]]), 4000);

        shared.set_mic_gain(100.0);
        producer.push(&raw);
        assert!(consumer.pop_frame(&mut frame));
        assert_eq!(i16::from_le_bytes([frame[0], frame[1]]), i16::MAX);
    }

    #[test]
    fn test_dc_reset_request_applies_on_next_push() {
        let (shared, mut producer, mut consumer) = setup(4096, 1.0);
        shared.set_dc_offset_removal(true);
        shared.begin_streaming();

        let biased: Vec<u8> = std::iter::repeat(2000i16.to_le_bytes()).take(256).flatten().collect();
        producer.push(&biased);
        let mut frame = [0u8; 512];
        assert!(consumer.pop_frame(&mut frame));
        assert!(frame.iter().all(|&b| b == 0));

        // New bias level after a reset is removed from the first sample on
        let shifted: Vec<u8> = std::iter::repeat((-500i16).to_le_bytes()).take(256).flatten().collect();
        shared.request_dc_reset();
        producer.push(&shifted);
        assert!(consumer.pop_frame(&mut frame));
        assert!(frame.iter().all(|&b| b == 0));
    }
}
