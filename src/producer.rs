//! Background capture loop feeding the frame slot.
//!
//! Camera I/O is blocking, so the producer runs on a dedicated OS thread
//! and publishes into the shared [`FrameSlot`]. The slot's watch channel
//! carries readiness back to async request handlers.

use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::frame::Frame;
use crate::slot::FrameSlot;

/// Anything that can produce frames, one blocking call at a time.
///
/// The real implementation is [`crate::camera::Camera`]; tests substitute
/// synthetic sources.
pub trait FrameSource: Send + 'static {
    fn capture(&mut self) -> Result<Frame>;
}

/// Deferred device open, so the device is only touched once a request
/// arrives. Called again to reopen after a capture thread dies.
pub type SourceOpener = Box<dyn Fn() -> Result<Box<dyn FrameSource>> + Send + Sync + 'static>;

struct Inner {
    slot: Arc<FrameSlot>,
    running: bool,
}

/// Owns the capture thread of a listener process.
///
/// At most one thread runs at a time. A device-open or read failure ends
/// the thread and closes its slot; the next [`ensure_started`] call
/// reopens the device into a fresh slot, so a dead camera read does not
/// take the listener down for good.
///
/// [`ensure_started`]: Self::ensure_started
pub struct FrameProducer {
    opener: Arc<SourceOpener>,
    inner: Mutex<Inner>,
}

impl FrameProducer {
    pub fn new(opener: SourceOpener) -> Self {
        Self {
            opener: Arc::new(opener),
            inner: Mutex::new(Inner {
                slot: Arc::new(FrameSlot::new()),
                running: false,
            }),
        }
    }

    /// The slot the current capture thread publishes into.
    pub fn slot(&self) -> Arc<FrameSlot> {
        self.inner.lock().unwrap().slot.clone()
    }

    /// Spawn the capture thread if none is alive, reopening the device if
    /// a previous thread died. Returns the slot being published into.
    pub fn ensure_started(&self) -> Arc<FrameSlot> {
        let mut inner = self.inner.lock().unwrap();
        if inner.running && !inner.slot.is_closed() {
            return inner.slot.clone();
        }
        if inner.running {
            tracing::info!("Capture thread died, reopening the device");
        }

        let slot = Arc::new(FrameSlot::new());
        inner.slot = slot.clone();
        inner.running = true;

        let opener = self.opener.clone();
        let publish_slot = slot.clone();
        std::thread::spawn(move || {
            run_capture_loop(&opener, &publish_slot);
        });
        slot
    }

    /// Whether a capture thread has ever been spawned.
    pub fn started(&self) -> bool {
        self.inner.lock().unwrap().running
    }
}

fn run_capture_loop(opener: &SourceOpener, slot: &FrameSlot) {
    let mut source = match opener() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Could not open frame source: {}", e);
            slot.close();
            return;
        }
    };

    tracing::debug!("Capture loop running");

    loop {
        match source.capture() {
            Ok(frame) => slot.publish(frame),
            Err(e) => {
                tracing::error!("Frame read failed, stopping capture: {}", e);
                break;
            }
        }
    }

    // Release the device before signalling closed, so a reopen can succeed.
    drop(source);
    slot.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingSource {
        n: u8,
        limit: u8,
    }

    impl FrameSource for CountingSource {
        fn capture(&mut self) -> Result<Frame> {
            if self.n >= self.limit {
                anyhow::bail!("device gone");
            }
            self.n += 1;
            std::thread::sleep(Duration::from_millis(5));
            Ok(Frame {
                width: 2,
                height: 2,
                data: vec![self.n; 12],
                timestamp_us: self.n as u64,
            })
        }
    }

    fn counting_opener(limit: u8) -> SourceOpener {
        Box::new(move || Ok(Box::new(CountingSource { n: 0, limit }) as Box<dyn FrameSource>))
    }

    async fn wait_closed(slot: &FrameSlot) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !slot.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_producer_publishes_until_read_failure() {
        let producer = FrameProducer::new(counting_opener(3));

        let slot = producer.ensure_started();
        slot.wait_ready(Duration::from_secs(2)).await.unwrap();

        // The loop ends after 3 frames; the slot closes but keeps the last frame.
        wait_closed(&slot).await;
        assert_eq!(slot.sequence(), 3);
        assert_eq!(slot.latest().unwrap().data[0], 3);
    }

    #[tokio::test]
    async fn test_open_failure_closes_slot() {
        let producer = FrameProducer::new(Box::new(|| anyhow::bail!("no such device")));

        let slot = producer.ensure_started();
        assert!(slot.wait_ready(Duration::from_secs(2)).await.is_err());
        assert!(slot.is_closed());
    }

    #[tokio::test]
    async fn test_ensure_started_returns_same_slot_while_running() {
        let producer = FrameProducer::new(counting_opener(255));

        let first = producer.ensure_started();
        let second = producer.ensure_started();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(producer.started());

        first.wait_ready(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_reopens_after_read_failure() {
        let opens = Arc::new(AtomicU32::new(0));
        let counter = opens.clone();
        let producer = FrameProducer::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSource { n: 0, limit: 1 }) as Box<dyn FrameSource>)
        }));

        let slot = producer.ensure_started();
        slot.wait_ready(Duration::from_secs(2)).await.unwrap();
        wait_closed(&slot).await;

        // A dead capture thread is replaced on the next request.
        let slot = producer.ensure_started();
        slot.wait_ready(Duration::from_secs(2)).await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reopen_retries_after_open_failure() {
        let opens = Arc::new(AtomicU32::new(0));
        let counter = opens.clone();
        let producer = FrameProducer::new(Box::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("device busy");
            }
            Ok(Box::new(CountingSource { n: 0, limit: 255 }) as Box<dyn FrameSource>)
        }));

        let slot = producer.ensure_started();
        assert!(slot.wait_ready(Duration::from_secs(2)).await.is_err());

        let slot = producer.ensure_started();
        slot.wait_ready(Duration::from_secs(2)).await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }
}
