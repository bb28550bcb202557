//! Textual progress and end-of-run summaries.
//!
//! All output goes through `tracing` at `info` on [`PROGRESS_TARGET`], so a
//! subscriber can route or silence it separately from diagnostics.

use crate::stats::{PipelineStats, RunSummary};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::info;

pub const PROGRESS_TARGET: &str = "daq_acquisition::progress";

const MIB: f64 = 1024.0 * 1024.0;

/// What the pipeline is doing, shown at the end of each progress line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Acquiring,
    /// Acquisition finished, saving what is queued.
    Writing,
    Aborting,
}

impl RunPhase {
    fn label(self) -> &'static str {
        match self {
            RunPhase::Acquiring => "acquiring",
            RunPhase::Writing => "writing",
            RunPhase::Aborting => "aborting",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    elapsed: Duration,
    acquired: u64,
    bytes_acquired: u64,
}

/// Builds progress lines, computing rates against the previous line.
#[derive(Debug, Default)]
pub struct ProgressPrinter {
    last: Option<Sample>,
}

impl ProgressPrinter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Format one line and remember `stats` as the new rate baseline.
    pub fn line(&mut self, stats: &PipelineStats, phase: RunPhase) -> String {
        let now = Sample {
            elapsed: stats.elapsed,
            acquired: stats.acq.frames_acquired,
            bytes_acquired: stats.acq.bytes_acquired,
        };
        let base = self.last.unwrap_or(Sample {
            elapsed: Duration::ZERO,
            acquired: 0,
            bytes_acquired: 0,
        });
        self.last = Some(now);

        let secs = now.elapsed.saturating_sub(base.elapsed).as_secs_f64();
        let (fps, mibs) = if secs > 0.0 {
            (
                (now.acquired - base.acquired.min(now.acquired)) as f64 / secs,
                (now.bytes_acquired - base.bytes_acquired.min(now.bytes_acquired)) as f64
                    / MIB
                    / secs,
            )
        } else {
            (0.0, 0.0)
        };

        let acq = &stats.acq;
        let disk = &stats.disk;
        let mut line = format!(
            "caught {}, lost {}, {fps:.1} fps, {mibs:.1} MiB/s",
            acq.frames_acquired, acq.frames_lost
        );
        if acq.frames_uncaught > 0 {
            let _ = write!(line, ", uncaught {}", acq.frames_uncaught);
        }
        let _ = write!(
            line,
            " | queued {}/{}, dropped {}, processed {}, saved {} | {}",
            stats.queued_to_save,
            stats.save_capacity,
            disk.frames_unsaved,
            disk.frames_processed,
            disk.frames_saved,
            phase.label()
        );
        line
    }

    /// Format and log one line.
    pub fn print(&mut self, stats: &PipelineStats, phase: RunPhase) {
        let line = self.line(stats, phase);
        info!(target: PROGRESS_TARGET, "{line}");
    }
}

/// Log the acquisition and disk statistics blocks of a finished run.
pub fn log_summary(summary: &RunSummary) {
    let acq = &summary.acq;
    let disk = &summary.disk;
    let secs = summary.elapsed.as_secs_f64();
    let avg_fps = if secs > 0.0 {
        acq.frames_acquired as f64 / secs
    } else {
        0.0
    };

    info!(
        target: PROGRESS_TARGET,
        frames_total = acq.frames_total,
        frames_acquired = acq.frames_acquired,
        frames_lost = acq.frames_lost,
        out_of_order = acq.out_of_order,
        frames_uncaught = acq.frames_uncaught,
        "Acquisition stats: {} of {} frames acquired, {} lost, {} out of order, {avg_fps:.1} fps average",
        acq.frames_acquired,
        acq.frames_total,
        acq.frames_lost,
        acq.out_of_order
    );
    info!(target: PROGRESS_TARGET, "Uncaught frames: {}", acq.uncaught);

    info!(
        target: PROGRESS_TARGET,
        frames_processed = disk.frames_processed,
        frames_saved = disk.frames_saved,
        frames_unsaved = disk.frames_unsaved,
        files = disk.files_written,
        "Disk stats: {} processed, {} saved in {} file(s) ({:.1} MiB), {} dropped",
        disk.frames_processed,
        disk.frames_saved,
        disk.files_written,
        disk.bytes_saved as f64 / MIB,
        disk.frames_unsaved
    );
    info!(target: PROGRESS_TARGET, "Unsaved frames: {}", disk.unsaved);
    if disk.relinked_frames > 0 {
        info!(target: PROGRESS_TARGET, "Relinked particles in {} frame(s)", disk.relinked_frames);
    }

    match &summary.error {
        Some(err) => info!(target: PROGRESS_TARGET, error = %err, "Acquisition stopped"),
        None if summary.aborted => info!(target: PROGRESS_TARGET, "Acquisition stopped"),
        None => info!(target: PROGRESS_TARGET, "Acquisition finished"),
    }
}
