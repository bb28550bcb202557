//! Streaming acquisition pipeline for PVCAM-style cameras.
//!
//! [`Acquisition`] configures a [`daq_driver_pvcam::Camera`], then moves
//! every delivered frame from the camera's circular buffer through a
//! bounded process queue, a deep copy into pooled memory, a RAM-budgeted
//! save queue and finally a [`daq_storage::FileSave`] writer. Particle
//! tracking and a rate-limited display hand-off hook into the stages.
//!
//! ```no_run
//! use daq_acquisition::Acquisition;
//! use daq_core::settings::Settings;
//! use daq_driver_pvcam::{Camera, FakeCamera, FakeCameraConfig};
//! use std::sync::Arc;
//!
//! # fn main() -> daq_core::AcqResult<()> {
//! let camera = Arc::new(FakeCamera::new(FakeCameraConfig::default()));
//! camera.open("FakeCamera", None)?;
//! let acq = Acquisition::new(camera);
//! acq.start(&Settings::default())?;
//! let aborted = acq.wait_for_stop();
//! # let _ = aborted;
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod configure;
pub mod drop_log;
pub mod fps_limiter;
pub mod progress;
pub mod queue;
pub mod ram;
pub mod stats;
pub mod tracking;

pub use acquisition::{
    process_queue_capacity, AcqState, Acquisition, ACQ_WAIT_TIMEOUT, POOL_READY_FRAMES,
    RAM_CHECK_TICKS, UPDATE_INTERVAL,
};
pub use configure::{applied_settings, configure_camera, FixUp};
pub use drop_log::{DropLog, DropStats};
pub use fps_limiter::{FpsLimiter, FrameSink};
pub use progress::{log_summary, ProgressPrinter, RunPhase, PROGRESS_TARGET};
pub use queue::{FrameQueue, Wait};
pub use ram::{save_queue_capacity, RamInfo, RamProbe};
pub use stats::{AcqStats, DiskStats, PipelineStats, RunSummary};
pub use tracking::FrameTracker;
