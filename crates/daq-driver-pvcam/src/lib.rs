//! Camera abstraction for the streaming pipeline.
//!
//! Component layout:
//! - `params`: parameter tree with typed errors
//! - `circ_buffer`: circular receive buffer and its shallow frames
//! - `fake`: synthetic camera used by tests and the demo binary
//!
//! # Threading
//!
//! The driver delivers end-of-frame notifications on its own thread through
//! an [`EofCallback`]. The callback must return quickly: it may take one
//! short lock, never allocate, and reports back whether the acquisition
//! should continue. Everything else on [`Camera`] is called from pipeline
//! threads, so implementations use interior mutability and are shared as
//! `Arc<dyn Camera>`.

pub mod components;
pub mod fake;

use daq_core::frame::{AcqCfg, Frame, FrameInfo};
use daq_core::settings::Settings;
use daq_core::AcqResult;
use std::fmt;
use std::sync::Arc;

pub use crate::components::circ_buffer::{CircBuffer, CIRC_BUFFER_PAD};
pub use crate::components::params::{
    CameraResult, EnumItem, ParamAccess, ParamEntry, ParamId, ParamTree,
};
pub use crate::fake::{FakeCamera, FakeCameraConfig, FakeHooks};

/// What the pipeline wants the driver to do after an end-of-frame callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    /// Stop delivering frames; the pipeline is shutting down.
    Abort,
}

/// End-of-frame notification. `None` means the driver could not report
/// the frame; the pipeline must treat it as fatal.
pub type EofCallback = Arc<dyn Fn(Option<&FrameInfo>) -> CallbackAction + Send + Sync>;

/// Called when the device disappears while open.
pub type RemovalCallback = Box<dyn Fn() + Send + Sync>;

/// Acquisition status as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqStatus {
    Inactive,
    Active,
    /// The driver stopped on its own (readout failure, device lost).
    Failed,
}

impl fmt::Display for AcqStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AcqStatus::Inactive => "inactive",
            AcqStatus::Active => "active",
            AcqStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Static description of a camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub index: u16,
    pub name: String,
    pub sensor_width: u16,
    pub sensor_height: u16,
    pub bit_depth: u16,
}

/// A camera the pipeline can drive.
pub trait Camera: Send + Sync {
    /// Cameras attached to this driver.
    fn enumerate(&self) -> AcqResult<Vec<CameraInfo>>;

    fn open(&self, name: &str, on_removed: Option<RemovalCallback>) -> AcqResult<()>;

    fn close(&self) -> AcqResult<()>;

    fn is_open(&self) -> bool;

    /// Info for the open camera.
    fn info(&self) -> Option<CameraInfo>;

    fn params(&self) -> &ParamTree;

    /// Prepare an acquisition and allocate the circular buffer.
    /// Returns the size of one frame in bytes.
    fn setup_exp(&self, settings: &Settings) -> AcqResult<usize>;

    /// Configuration of the last successful [`Camera::setup_exp`].
    fn acq_cfg(&self) -> Option<Arc<AcqCfg>>;

    fn start_exp(&self, on_eof: EofCallback) -> AcqResult<()>;

    /// Stop delivering frames. Idempotent. Must not be called from inside
    /// the end-of-frame callback.
    fn stop_exp(&self) -> AcqResult<()>;

    /// Software trigger for trigger-mode exposures.
    fn trigger(&self) -> AcqResult<()>;

    /// Point `out` at the most recently delivered frame (shallow).
    fn latest_frame(&self, out: &Frame) -> bool;

    /// Slot index of the most recently delivered frame.
    fn latest_frame_index(&self) -> Option<usize>;

    /// Shallow frame for slot `index` of the circular buffer.
    fn frame_at(&self, index: usize) -> Option<Arc<Frame>>;

    /// Slot currently holding `frame`'s frame number.
    fn frame_index_of(&self, frame: &Frame) -> Option<usize>;

    fn acq_status(&self) -> AcqStatus;
}
