//! Latest-frame hand-off between the capture thread and request handlers.
//!
//! A [`FrameSlot`] holds exactly one frame: each publish replaces the
//! previous frame wholesale, so a reader only ever observes the newest
//! capture (depth-1 buffer, last-write-wins). Readiness and freshness are
//! signalled through a `tokio::sync::watch` sequence number instead of
//! polling sleeps, so consumers can await "any frame" or "a frame newer
//! than X" without busy-waiting.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;

use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotState {
    /// Number of frames published so far. 0 means no frame has ever landed.
    seq: u64,
    /// Set when the producer terminates; waits fail from then on.
    closed: bool,
}

/// A single guarded slot holding the most recently captured frame.
pub struct FrameSlot {
    frame: Mutex<Option<Frame>>,
    state_tx: watch::Sender<SlotState>,
}

impl FrameSlot {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(SlotState {
            seq: 0,
            closed: false,
        });
        Self {
            frame: Mutex::new(None),
            state_tx,
        }
    }

    /// Publish a new frame, replacing whatever was in the slot.
    ///
    /// The first publish marks the slot ready.
    pub fn publish(&self, frame: Frame) {
        {
            let mut slot = self.frame.lock().unwrap();
            *slot = Some(frame);
        }
        self.state_tx.send_modify(|s| s.seq += 1);
    }

    /// Snapshot of the current frame, if any has been published.
    pub fn latest(&self) -> Option<Frame> {
        self.frame.lock().unwrap().clone()
    }

    /// Sequence number of the most recent publish (0 = never published).
    pub fn sequence(&self) -> u64 {
        self.state_tx.borrow().seq
    }

    /// Whether at least one frame has been published.
    pub fn ready(&self) -> bool {
        self.state_tx.borrow().seq > 0
    }

    /// Whether the producer has terminated.
    pub fn is_closed(&self) -> bool {
        self.state_tx.borrow().closed
    }

    /// Mark the producer as terminated. Pending and future waits fail.
    pub fn close(&self) {
        self.state_tx.send_modify(|s| s.closed = true);
    }

    /// Wait until the first frame has been published.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        let wait = rx.wait_for(|s| s.seq > 0 || s.closed);
        let state = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| anyhow::anyhow!("Timed out waiting for first frame"))?
            .map_err(|_| anyhow::anyhow!("Frame slot dropped"))?;
        if state.closed && state.seq == 0 {
            anyhow::bail!("Frame source ended before producing a frame");
        }
        Ok(())
    }

    /// Wait for a frame published strictly after sequence number `after`,
    /// then return it.
    ///
    /// Passing the current [`sequence`](Self::sequence) guarantees the
    /// returned frame is fresher than anything already in the slot.
    pub async fn next_frame(&self, after: u64, timeout: Duration) -> Result<Frame> {
        let mut rx = self.state_tx.subscribe();
        let wait = rx.wait_for(|s| s.seq > after || s.closed);
        let state = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| anyhow::anyhow!("Timed out waiting for a fresh frame"))?
            .map_err(|_| anyhow::anyhow!("Frame slot dropped"))?;
        if state.seq <= after {
            anyhow::bail!("Frame source ended");
        }
        drop(state);

        self.frame
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Frame slot empty after publish"))
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn solid_frame(tag: u8) -> Frame {
        Frame {
            width: 2,
            height: 2,
            data: vec![tag; 12],
            timestamp_us: tag as u64,
        }
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let slot = FrameSlot::new();
        for i in 1..=5 {
            slot.publish(solid_frame(i));
        }
        // Only the 5th frame is observable.
        assert_eq!(slot.sequence(), 5);
        assert_eq!(slot.latest().unwrap().data[0], 5);
    }

    #[tokio::test]
    async fn test_not_ready_until_first_publish() {
        let slot = FrameSlot::new();
        assert!(!slot.ready());
        slot.publish(solid_frame(1));
        assert!(slot.ready());
    }

    #[tokio::test]
    async fn test_wait_ready_blocks_until_publish() {
        let slot = Arc::new(FrameSlot::new());

        let writer = slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.publish(solid_frame(7));
        });

        slot.wait_ready(Duration::from_secs(2)).await.unwrap();
        assert_eq!(slot.latest().unwrap().data[0], 7);
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let slot = FrameSlot::new();
        assert!(slot.wait_ready(Duration::from_millis(20)).await.is_err());
    }

    #[tokio::test]
    async fn test_next_frame_is_strictly_newer() {
        let slot = Arc::new(FrameSlot::new());
        slot.publish(solid_frame(1));
        let seq = slot.sequence();

        let writer = slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.publish(solid_frame(2));
        });

        // Must not hand back frame 1 even though it is already in the slot.
        let frame = slot.next_frame(seq, Duration::from_secs(2)).await.unwrap();
        assert_eq!(frame.data[0], 2);
    }

    #[tokio::test]
    async fn test_closed_slot_fails_waiters() {
        let slot = Arc::new(FrameSlot::new());

        let closer = slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        assert!(slot.wait_ready(Duration::from_secs(2)).await.is_err());
        assert!(slot
            .next_frame(0, Duration::from_secs(2))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_after_frames_keeps_latest_readable() {
        let slot = FrameSlot::new();
        slot.publish(solid_frame(3));
        slot.close();
        // The slot still holds the last frame, but fresh-frame waits fail.
        assert!(slot.latest().is_some());
        assert!(slot
            .next_frame(slot.sequence(), Duration::from_millis(50))
            .await
            .is_err());
    }
}
