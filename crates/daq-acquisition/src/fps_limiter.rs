//! Rate-limited hand-off of frames to a display consumer.

use daq_core::frame_pool::SharedFrame;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Display consumer fed by the pipeline.
///
/// Called from pipeline threads; implementations must return quickly.
/// `None` means acquisition has finished and the disk stage is still
/// writing.
pub trait FrameSink: Send + Sync {
    fn show(&self, frame: Option<SharedFrame>);
}

/// Forwards at most `fps` frames per second to a [`FrameSink`].
///
/// Frames arriving inside the current interval are dropped. `fps == 0`
/// forwards every frame. The "still writing" sentinel is always forwarded.
pub struct FpsLimiter {
    sink: Arc<dyn FrameSink>,
    interval: Option<Duration>,
    last: Mutex<Option<Instant>>,
}

impl FpsLimiter {
    #[must_use]
    pub fn new(sink: Arc<dyn FrameSink>, fps: f64) -> Self {
        let interval = (fps.is_finite() && fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps));
        Self {
            sink,
            interval,
            last: Mutex::new(None),
        }
    }

    /// Offer a frame. Returns `true` if it was forwarded.
    pub fn offer(&self, frame: Option<SharedFrame>) -> bool {
        if frame.is_some() {
            if let Some(interval) = self.interval {
                let now = Instant::now();
                let mut last = self.last.lock();
                if last.is_some_and(|t| now.duration_since(t) < interval) {
                    return false;
                }
                *last = Some(now);
            }
        }
        self.sink.show(frame);
        true
    }
}
