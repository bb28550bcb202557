//! Free list of deep [`Frame`] shells for the acquisition pipeline.
//!
//! Wraps [`daq_pool::Pool`] with the frame-specific parts: every shell is
//! built for the pool's current [`AcqCfg`], frames are reset when they come
//! back, and [`FramePool::setup`] only starts a new generation when the
//! configuration actually changed.
//!
//! Frames leave the pool as [`PooledFrame`] guards and go back on drop. The
//! pipeline wraps them in [`SharedFrame`] once they are handed to more than
//! one consumer.

use crate::frame::{AcqCfg, Frame};
use bitflags::bitflags;
use daq_pool::{Loaned, Pool};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A frame on loan from the pool.
pub type PooledFrame = Loaned<Frame>;

/// A pooled frame shared between pipeline stages.
pub type SharedFrame = Arc<PooledFrame>;

bitflags! {
    /// Extra work for [`FramePool::ensure_ready`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnsureOps: u8 {
        /// Release free frames above the target first.
        const SHRINK = 0b01;
        /// Fault in the payload pages of newly built frames.
        const PREFETCH = 0b10;
    }
}

#[derive(Debug, Clone)]
struct PoolConfig {
    cfg: Arc<AcqCfg>,
    deep_copy: bool,
}

pub struct FramePool {
    pool: Pool<Frame>,
    config: Mutex<Option<PoolConfig>>,
    prefetch: Arc<AtomicBool>,
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: Pool::new(),
            config: Mutex::new(None),
            prefetch: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Configure the pool for `cfg`. Returns `true` if the pool was
    /// reinitialised, `false` if the existing frames already match.
    pub fn setup(&self, cfg: Arc<AcqCfg>, deep_copy: bool) -> bool {
        let mut current = self.config.lock();
        if let Some(c) = current.as_ref() {
            if c.deep_copy == deep_copy && *c.cfg == *cfg {
                return false;
            }
        }

        let factory_cfg = Arc::clone(&cfg);
        let prefetch = Arc::clone(&self.prefetch);
        self.pool.setup(
            move || match Frame::new(Arc::clone(&factory_cfg), deep_copy) {
                Ok(frame) => {
                    if prefetch.load(Ordering::Relaxed) {
                        frame.prefetch();
                    }
                    Some(frame)
                }
                Err(err) => {
                    warn!(error = %err, "Failed to allocate frame");
                    None
                }
            },
            Some(|frame: &mut Frame| frame.reset()),
        );
        debug!(
            frame_bytes = cfg.frame_bytes,
            roi_count = cfg.roi_count,
            allocator = %cfg.allocator,
            deep_copy,
            "Frame pool configured"
        );
        *current = Some(PoolConfig { cfg, deep_copy });
        true
    }

    /// Make at least `target` frames available. Returns `false` if the pool
    /// is not configured or allocation failed.
    pub fn ensure_ready(&self, target: usize, ops: EnsureOps) -> bool {
        if ops.contains(EnsureOps::SHRINK) {
            self.pool.shrink_to(target);
        }
        self.prefetch
            .store(ops.contains(EnsureOps::PREFETCH), Ordering::Relaxed);
        self.pool.ensure_ready(target)
    }

    /// Take a frame without allocating. `None` if the pool is empty.
    #[must_use]
    pub fn take(&self) -> Option<PooledFrame> {
        self.pool.take()
    }

    /// Release free frames until at most `target` remain.
    pub fn shrink(&self, target: usize) -> usize {
        let released = self.pool.shrink_to(target);
        if released > 0 {
            debug!(released, remaining = self.pool.size(), "Frame pool shrunk");
        }
        released
    }

    /// Number of free frames.
    #[must_use]
    pub fn size(&self) -> usize {
        self.pool.size()
    }

    /// Number of frames currently on loan.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }

    #[must_use]
    pub fn cfg(&self) -> Option<Arc<AcqCfg>> {
        self.config.lock().as_ref().map(|c| Arc::clone(&c.cfg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BitmapFormat, FrameInfo};
    use crate::region::Region;

    fn cfg(w: u16) -> Arc<AcqCfg> {
        Arc::new(AcqCfg::single_region(
            Region::from_rect(0, 0, w, w),
            BitmapFormat::Mono16,
            16,
        ))
    }

    #[test]
    fn unconfigured_pool_is_not_ready() {
        let pool = FramePool::new();
        assert!(!pool.ensure_ready(1, EnsureOps::empty()));
        assert!(pool.take().is_none());
    }

    #[test]
    fn ensure_ready_meets_target() {
        let pool = FramePool::new();
        assert!(pool.setup(cfg(8), true));
        assert!(pool.ensure_ready(5, EnsureOps::PREFETCH));
        assert!(pool.size() >= 5);
    }

    #[test]
    fn identical_setup_keeps_frames() {
        let pool = FramePool::new();
        pool.setup(cfg(8), true);
        pool.ensure_ready(3, EnsureOps::empty());
        assert!(!pool.setup(cfg(8), true));
        assert_eq!(pool.size(), 3);

        assert!(pool.setup(cfg(16), true));
        assert_eq!(pool.size(), 0);
        assert!(!pool.setup(cfg(16), true));
        assert!(pool.setup(cfg(16), false));
    }

    #[test]
    fn returned_frames_are_reset() {
        let pool = FramePool::new();
        pool.setup(cfg(4), true);
        pool.ensure_ready(1, EnsureOps::empty());

        let frame = pool.take().unwrap();
        frame.set_info(FrameInfo::new(42));
        drop(frame);

        let frame = pool.take().unwrap();
        assert_eq!(frame.frame_nr(), 0);
    }

    #[test]
    fn shrink_op_trims_before_refill() {
        let pool = FramePool::new();
        pool.setup(cfg(4), true);
        pool.ensure_ready(10, EnsureOps::empty());
        assert!(pool.ensure_ready(3, EnsureOps::SHRINK));
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.shrink(0), 3);
    }

    #[test]
    fn frames_from_old_config_are_discarded() {
        let pool = FramePool::new();
        pool.setup(cfg(4), true);
        pool.ensure_ready(2, EnsureOps::empty());
        let stale = pool.take().unwrap();
        pool.setup(cfg(6), true);
        drop(stale);
        assert_eq!(pool.size(), 0);
        assert!(pool.ensure_ready(1, EnsureOps::empty()));
        assert_eq!(pool.cfg().unwrap().frame_bytes, 6 * 6 * 2);
    }
}
