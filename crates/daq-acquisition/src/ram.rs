//! Host RAM budget for the save queue.
//!
//! The save queue may hold `max(total × 90 %, available − 2 GiB)` worth of
//! frames. The update thread re-evaluates the budget while acquiring so the
//! queue follows what the host can actually spare.

use sysinfo::System;

const MIB: u64 = 1024 * 1024;

/// RAM kept free for the rest of the system, in MiB.
pub const RAM_RESERVE_MB: u64 = 2048;

/// Smallest save queue, regardless of RAM.
pub const MIN_SAVE_QUEUE_FRAMES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RamInfo {
    pub total_mb: u64,
    pub available_mb: u64,
}

impl RamInfo {
    /// Bytes the save queue may occupy.
    #[must_use]
    pub fn budget_bytes(&self) -> u64 {
        let ninety_percent = self.total_mb * 9 / 10;
        let spare = self.available_mb.saturating_sub(RAM_RESERVE_MB);
        ninety_percent.max(spare) * MIB
    }
}

/// Reads host memory through `sysinfo`.
pub struct RamProbe {
    system: System,
}

impl Default for RamProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl RamProbe {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    pub fn sample(&mut self) -> RamInfo {
        self.system.refresh_memory();
        RamInfo {
            total_mb: self.system.total_memory() / MIB,
            available_mb: self.system.available_memory() / MIB,
        }
    }
}

/// Save-queue capacity in frames for `frame_bytes`-sized frames.
#[must_use]
pub fn save_queue_capacity(ram: RamInfo, frame_bytes: usize, cap: Option<usize>) -> usize {
    let frames = ram.budget_bytes() / frame_bytes.max(1) as u64;
    let frames = usize::try_from(frames)
        .unwrap_or(usize::MAX)
        .max(MIN_SAVE_QUEUE_FRAMES);
    match cap {
        Some(cap) => frames.min(cap.max(MIN_SAVE_QUEUE_FRAMES)),
        None => frames,
    }
}
