//! Circular receive buffer.
//!
//! One contiguous aligned block of `slot_count × frame_bytes` bytes that the
//! driver fills round-robin, plus one shallow [`Frame`] per slot aliasing it.
//!
//! # Design
//!
//! The buffer is the sole owner of the backing storage. Shallow frames hold
//! a `Weak` back-reference and a slot index, so they never keep the block
//! alive and cannot outlive it unnoticed. Each slot records the frame number
//! it currently holds; readers name the frame they expect and get `false`
//! once the driver has reused the slot.
//!
//! A small pad is allocated past the last slot. Some drivers write a few
//! bytes beyond the announced buffer size at the end of a sequence.

use daq_core::frame::{AcqCfg, Frame, FrameInfo, SlotSource};
use daq_core::AcqResult;
use daq_pool::AlignedBuf;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Bytes allocated past the last slot.
pub const CIRC_BUFFER_PAD: usize = 16;

struct Block {
    data: AlignedBuf,
    /// Frame number held by each slot, 0 if never written.
    slot_frames: Vec<u32>,
    /// frame_nr -> slot for every frame still present.
    index: HashMap<u32, usize>,
    latest: Option<usize>,
}

pub struct CircBuffer {
    cfg: Arc<AcqCfg>,
    block: RwLock<Block>,
    frames: Vec<Arc<Frame>>,
}

impl CircBuffer {
    /// Allocate the block with the configured allocator and build one
    /// shallow frame per slot.
    pub fn new(cfg: Arc<AcqCfg>, slot_count: usize) -> AcqResult<Arc<Self>> {
        let slot_count = slot_count.max(1);
        let size = cfg.frame_bytes * slot_count + CIRC_BUFFER_PAD;
        let data = cfg.allocator.allocate(cfg.allocator.aligned_size(size))?;
        debug!(
            slots = slot_count,
            frame_bytes = cfg.frame_bytes,
            bytes = data.len(),
            "Allocated circular buffer"
        );

        Ok(Arc::new_cyclic(|weak: &Weak<CircBuffer>| {
            let frames = (0..slot_count)
                .map(|i| {
                    let source = weak.clone() as Weak<dyn SlotSource>;
                    Arc::new(Frame::new_shallow(Arc::clone(&cfg), source, i))
                })
                .collect();
            CircBuffer {
                cfg: Arc::clone(&cfg),
                block: RwLock::new(Block {
                    data,
                    slot_frames: vec![0; slot_count],
                    index: HashMap::with_capacity(slot_count),
                    latest: None,
                }),
                frames,
            }
        }))
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.cfg.frame_bytes
    }

    /// Driver side: fill slot `index` with frame `info` and publish it.
    ///
    /// `fill` receives exactly `frame_bytes` bytes.
    pub fn write_slot(&self, index: usize, info: FrameInfo, fill: impl FnOnce(&mut [u8])) {
        let Some(frame) = self.frames.get(index) else {
            return;
        };
        let frame_bytes = self.cfg.frame_bytes;
        {
            let mut block = self.block.write();
            let old = block.slot_frames[index];
            if old != 0 {
                block.index.remove(&old);
            }
            let start = index * frame_bytes;
            fill(&mut block.data.as_mut_slice()[start..start + frame_bytes]);
            block.slot_frames[index] = info.frame_nr;
            block.index.insert(info.frame_nr, index);
            block.latest = Some(index);
        }
        frame.set_info(info);
    }

    /// Shallow frame for slot `index`.
    #[must_use]
    pub fn frame_at(&self, index: usize) -> Option<Arc<Frame>> {
        self.frames.get(index).cloned()
    }

    /// Slot most recently written.
    #[must_use]
    pub fn latest_index(&self) -> Option<usize> {
        self.block.read().latest
    }

    /// Slot currently holding `frame_nr`.
    #[must_use]
    pub fn index_of(&self, frame_nr: u32) -> Option<usize> {
        self.block.read().index.get(&frame_nr).copied()
    }

    /// All shallow frames, in slot order.
    pub fn frames(&self) -> impl Iterator<Item = &Arc<Frame>> {
        self.frames.iter()
    }
}

impl SlotSource for CircBuffer {
    fn with_slot(&self, index: usize, frame_nr: u32, f: &mut dyn FnMut(&[u8])) -> bool {
        let block = self.block.read();
        if block.slot_frames.get(index) != Some(&frame_nr) || frame_nr == 0 {
            return false;
        }
        let start = index * self.cfg.frame_bytes;
        f(&block.data.as_slice()[start..start + self.cfg.frame_bytes]);
        true
    }
}
