//! Pipeline counters and the snapshots built from them.
//!
//! Counters are relaxed atomics written by one stage each and read by the
//! update thread. Snapshots are plain values for printing and for tests.

use crate::drop_log::DropStats;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    // Callback stage
    pub uncaught: AtomicU64,
    // Acquisition stage
    pub acquired: AtomicU64,
    pub lost: AtomicU64,
    pub out_of_order: AtomicU64,
    pub bytes_acquired: AtomicU64,
    pub last_handling_nr: AtomicU32,
    // Disk stage
    pub processed: AtomicU64,
    pub saved: AtomicU64,
    pub unsaved: AtomicU64,
    pub bytes_saved: AtomicU64,
    pub files_written: AtomicU64,
}

impl Counters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn acq(&self, uncaught: DropStats) -> AcqStats {
        AcqStats {
            frames_total: u64::from(self.last_handling_nr.load(Ordering::Relaxed)),
            frames_acquired: Self::get(&self.acquired),
            frames_lost: Self::get(&self.lost),
            out_of_order: Self::get(&self.out_of_order),
            frames_uncaught: Self::get(&self.uncaught),
            bytes_acquired: Self::get(&self.bytes_acquired),
            uncaught,
        }
    }

    pub fn disk(&self, unsaved: DropStats, relinked_frames: u64) -> DiskStats {
        DiskStats {
            frames_processed: Self::get(&self.processed),
            frames_saved: Self::get(&self.saved),
            frames_unsaved: Self::get(&self.unsaved),
            bytes_saved: Self::get(&self.bytes_saved),
            files_written: Self::get(&self.files_written),
            relinked_frames,
            unsaved,
        }
    }
}

/// Acquisition-side statistics.
///
/// `frames_acquired + frames_lost == frames_total`. Out-of-order frames are
/// counted separately and belong to neither.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcqStats {
    /// Highest frame number handled.
    pub frames_total: u64,
    pub frames_acquired: u64,
    /// Frames missing from the number sequence or unreadable from the
    /// camera buffer.
    pub frames_lost: u64,
    pub out_of_order: u64,
    /// Frames the callback could not queue (full queue or empty pool).
    pub frames_uncaught: u64,
    pub bytes_acquired: u64,
    pub uncaught: DropStats,
}

/// Disk-side statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiskStats {
    /// Frames taken off the save queue.
    pub frames_processed: u64,
    pub frames_saved: u64,
    /// Frames dropped because the save queue was full.
    pub frames_unsaved: u64,
    pub bytes_saved: u64,
    pub files_written: u64,
    /// Frames whose particle ids were assigned by the tracker.
    pub relinked_frames: u64,
    pub unsaved: DropStats,
}

/// Live view sampled by the update thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub acq: AcqStats,
    pub disk: DiskStats,
    pub queued_to_process: usize,
    pub queued_to_save: usize,
    pub save_capacity: usize,
    pub elapsed: Duration,
}

/// Final outcome of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub acq: AcqStats,
    pub disk: DiskStats,
    pub aborted: bool,
    /// First fatal error, if the run ended on one.
    pub error: Option<String>,
    pub elapsed: Duration,
}
