//! `daq-tracking`
//!
//! Particle tracking for centroid-track acquisitions.
//!
//! - [`ParticleTracker`]: backend interface assigning stable particle ids,
//!   with the [`NearestNeighbourTracker`] implementation
//! - [`ParticleLinker`]: bounded per-particle position history
//! - [`TrackingContext`]: decodes a frame's centroid metadata, decides
//!   between trusting camera ids and relinking, and feeds the linker

pub mod context;
pub mod linker;
pub mod tracker;

pub use context::{particle_event, TrackingContext, PASS_THROUGH_LIFETIME};
pub use linker::ParticleLinker;
pub use tracker::{NearestNeighbourFactory, NearestNeighbourTracker, ParticleTracker, TrackerFactory};
