//! Per-run tracking context used by the disk stage.
//!
//! In centroid-track mode every data ROI of a frame is one particle. The
//! camera reports the zeroth and second moment in the ROI's extended
//! metadata and usually a particle id as well. When every ROI carries a
//! non-zero id the camera's identities are trusted; otherwise the whole
//! frame is relinked by the tracker backend.

use crate::linker::ParticleLinker;
use crate::tracker::ParticleTracker;
use daq_core::metadata::{
    FrameMetadata, MdRoi, EXT_TAG_PARTICLE_ID, EXT_TAG_PARTICLE_M0, EXT_TAG_PARTICLE_M2,
};
use daq_core::settings::TrackingSettings;
use daq_core::trajectory::{Particle, ParticleEvent, ParticleState, Trajectories};
use daq_core::{AcqError, AcqResult};
use std::sync::Arc;
use tracing::{debug, trace};

/// Lifetime reported for particles whose ids came from the camera.
pub const PASS_THROUGH_LIFETIME: u32 = 10;

pub struct TrackingContext {
    tracker: Box<dyn ParticleTracker>,
    linker: ParticleLinker,
    relinked_frames: u64,
}

impl TrackingContext {
    #[must_use]
    pub fn new(tracker: Box<dyn ParticleTracker>, settings: &TrackingSettings) -> Self {
        Self {
            tracker,
            linker: ParticleLinker::new(settings.max_particles, settings.trajectory_duration),
            relinked_frames: 0,
        }
    }

    /// Frames whose ids had to be assigned by the tracker.
    #[must_use]
    pub fn relinked_frames(&self) -> u64 {
        self.relinked_frames
    }

    /// Link the particles of one frame and return the updated trajectories.
    pub fn process(&mut self, md: &FrameMetadata) -> AcqResult<Arc<Trajectories>> {
        let frame_nr = md.header.frame_nr;
        let mut events = Vec::with_capacity(md.rois.len());
        let mut ids = Vec::with_capacity(md.rois.len());
        for roi in md.rois.iter().filter(|r| !r.is_header_only()) {
            events.push(particle_event(roi)?);
            ids.push(roi.ext.get_u32(EXT_TAG_PARTICLE_ID)?.unwrap_or(0));
        }

        let particles = if ids.contains(&0) {
            self.relinked_frames += 1;
            debug!(frame_nr, particles = events.len(), "Relinking particles");
            self.tracker.track(frame_nr, &events)?
        } else {
            let particles: Vec<Particle> = events
                .iter()
                .zip(&ids)
                .map(|(event, &id)| Particle {
                    id,
                    event: *event,
                    lifetime: PASS_THROUGH_LIFETIME,
                    state: ParticleState::Continuation,
                })
                .collect();
            self.tracker.observe(frame_nr, &particles);
            particles
        };

        self.linker.add_particles(frame_nr, &particles);
        let trajectories = self.linker.trajectories();
        trace!(frame_nr, trajectories = trajectories.len(), "Tracked frame");
        Ok(Arc::new(trajectories))
    }

    /// Drop all tracker and linker state.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.linker.clear();
        self.relinked_frames = 0;
    }
}

/// Centroid event of a data ROI. M0 and M2 are mandatory.
pub fn particle_event(roi: &MdRoi) -> AcqResult<ParticleEvent> {
    let required = |tag: u8, name: &str| -> AcqResult<u32> {
        roi.ext.get_u32(tag)?.ok_or_else(|| {
            AcqError::format(format!(
                "ROI {} has no {name} extended metadata",
                roi.header.roi_nr
            ))
        })
    };
    let (center_x, center_y) = roi.header.region.center();
    Ok(ParticleEvent {
        roi_nr: roi.header.roi_nr,
        center_x,
        center_y,
        m0: required(EXT_TAG_PARTICLE_M0, "PARTICLE_M0")?,
        m2: required(EXT_TAG_PARTICLE_M2, "PARTICLE_M2")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::NearestNeighbourTracker;
    use daq_core::metadata::{
        ExtItem, ExtMetadata, MdFrameHeader, MetadataBuilder, EXT_TYPE_UNS16,
        MD_ROI_FLAG_HEADER_ONLY,
    };
    use daq_core::Region;
    use tracing_test::traced_test;

    fn frame(frame_nr: u32, rois: &[(u16, Option<ExtMetadata>)]) -> FrameMetadata {
        let mut b = MetadataBuilder::new(MdFrameHeader {
            frame_nr,
            ..Default::default()
        });
        for (i, (x, ext)) in rois.iter().enumerate() {
            let flags = if ext.is_none() { MD_ROI_FLAG_HEADER_ONLY } else { 0 };
            b.push_roi(
                i as u16 + 1,
                Region::from_rect(*x, 10, 3, 3),
                flags,
                ext.clone().unwrap_or_default(),
                2,
            );
        }
        let mut bytes = Vec::new();
        b.encode(&mut bytes, |_, px| px.fill(0));
        FrameMetadata::decode(&bytes).unwrap()
    }

    fn moments(id: Option<u32>) -> ExtMetadata {
        let mut ext = ExtMetadata::default();
        if let Some(id) = id {
            ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_ID, id));
        }
        ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_M0, 500));
        ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_M2, 1 << 19));
        ext
    }

    fn context() -> TrackingContext {
        let settings = TrackingSettings::default();
        TrackingContext::new(
            Box::new(NearestNeighbourTracker::from_settings(&settings)),
            &settings,
        )
    }

    #[test]
    fn camera_ids_pass_through() {
        let mut ctx = context();
        let md = frame(1, &[(10, Some(moments(Some(7)))), (50, Some(moments(Some(9))))]);
        let set = ctx.process(&md).unwrap();
        assert_eq!(set.get(7).unwrap().lifetime, PASS_THROUGH_LIFETIME);
        assert!(set.get(9).is_some());
        assert_eq!(ctx.relinked_frames(), 0);
    }

    #[test]
    #[traced_test]
    fn zero_id_triggers_relink() {
        let mut ctx = context();
        let md = frame(1, &[(10, Some(moments(Some(0)))), (50, Some(moments(Some(4))))]);
        let set = ctx.process(&md).unwrap();
        let ids: Vec<_> = set.sample_counts().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(ctx.relinked_frames(), 1);
        assert!(logs_contain("Relinking particles"));
    }

    #[test]
    fn header_only_rois_are_skipped() {
        let mut ctx = context();
        let md = frame(1, &[(10, Some(moments(Some(3)))), (50, None)]);
        let set = ctx.process(&md).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn missing_moment_is_a_format_error() {
        let mut ext = ExtMetadata::default();
        ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_M0, 1));
        let md = frame(1, &[(10, Some(ext))]);
        assert!(matches!(context().process(&md), Err(AcqError::Format(_))));
    }

    #[test]
    fn mistyped_id_is_a_format_error() {
        let mut ext = moments(None);
        ext.push(ExtItem {
            tag: EXT_TAG_PARTICLE_ID,
            value_type: EXT_TYPE_UNS16,
            value: vec![1, 0],
        });
        let md = frame(1, &[(10, Some(ext))]);
        assert!(matches!(context().process(&md), Err(AcqError::Format(_))));
    }
}
