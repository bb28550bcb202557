//! `daq-core`
//!
//! Shared types for the camera streaming stack: the error taxonomy, sensor
//! regions, frames and their pool, decoded camera metadata, particle
//! trajectories and the run settings.
//!
//! ## Key Types
//!
//! - [`Frame`]: one exposure, either aliasing a camera buffer slot (shallow)
//!   or owning an aligned copy (deep)
//! - [`FramePool`]: free list of deep frames built for one [`AcqCfg`]
//! - [`FrameMetadata`]: decoded per-frame and per-ROI camera metadata
//! - [`Settings`]: validated, read-only run configuration
//! - [`AcqError`] / [`CameraError`]: typed failures returned by every crate
//!   in the workspace

pub mod error;
pub mod frame;
pub mod frame_pool;
pub mod metadata;
pub mod region;
pub mod settings;
pub mod trajectory;

pub use error::{AcqError, AcqResult, CameraError, ParamAttr};
pub use frame::{AcqCfg, BitmapFormat, Frame, FrameInfo, SlotRef, SlotSource};
pub use frame_pool::{EnsureOps, FramePool, PooledFrame, SharedFrame};
pub use metadata::{ExtItem, ExtMetadata, FrameMetadata, MetadataBuilder};
pub use region::{implied_region, Region};
pub use settings::{AcqMode, Settings, StorageType};
pub use trajectory::{
    Particle, ParticleEvent, ParticleState, Trajectories, Trajectory, TrajectoryPoint,
};

pub use daq_pool::{AllocatorType, PAGE_SIZE};
