//! Particle tracking inside the disk stage.

use daq_core::frame::Frame;
use daq_core::settings::TrackingSettings;
use daq_core::trajectory::Trajectories;
use daq_core::{AcqError, AcqResult};
use daq_driver_pvcam::Camera;
use daq_tracking::{TrackerFactory, TrackingContext};
use std::sync::Arc;
use tracing::trace;

/// Links the particles of each saved frame and attaches the trajectories.
///
/// Owns the tracker backend, so it stays on the thread that created it.
pub struct FrameTracker {
    ctx: TrackingContext,
}

impl FrameTracker {
    pub fn new(factory: &dyn TrackerFactory, settings: &TrackingSettings) -> AcqResult<Self> {
        let tracker = factory.create(settings)?;
        Ok(Self {
            ctx: TrackingContext::new(tracker, settings),
        })
    }

    /// Link `frame`'s particles and attach the resulting trajectories to it.
    pub fn track(&mut self, frame: &Frame) -> AcqResult<Arc<Trajectories>> {
        let md = frame.metadata()?.ok_or_else(|| {
            AcqError::format(format!(
                "frame {} carries no metadata to track",
                frame.frame_nr()
            ))
        })?;
        let trajectories = self.ctx.process(&md)?;
        frame.set_trajectories(Some(Arc::clone(&trajectories)));
        Ok(trajectories)
    }

    #[must_use]
    pub fn relinked_frames(&self) -> u64 {
        self.ctx.relinked_frames()
    }
}

/// Give the camera-buffer frame holding `frame` the same trajectories, so
/// viewers reading the buffer see them. Skipped if the slot was reused.
pub fn attach_to_camera_slot(camera: &dyn Camera, frame: &Frame, trajectories: Arc<Trajectories>) {
    let Some(slot) = camera
        .frame_index_of(frame)
        .and_then(|index| camera.frame_at(index))
    else {
        trace!(frame_nr = frame.frame_nr(), "Camera slot already reused");
        return;
    };
    if slot.frame_nr() == frame.frame_nr() {
        slot.set_trajectories(Some(trajectories));
    }
}

/// Drop trajectories from every camera-buffer frame.
pub fn clear_camera_slots(camera: &dyn Camera, slot_count: usize) {
    for index in 0..slot_count {
        if let Some(slot) = camera.frame_at(index) {
            slot.set_trajectories(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::frame::{AcqCfg, BitmapFormat, FrameInfo};
    use daq_core::metadata::{
        ExtItem, ExtMetadata, MdFrameHeader, MetadataBuilder, EXT_TAG_PARTICLE_ID,
        EXT_TAG_PARTICLE_M0, EXT_TAG_PARTICLE_M2,
    };
    use daq_core::region::Region;
    use daq_tracking::NearestNeighbourFactory;

    fn centroid_frame(frame_nr: u32, ids: &[Option<u32>]) -> Frame {
        let mut b = MetadataBuilder::new(MdFrameHeader {
            frame_nr,
            ..Default::default()
        });
        for (i, id) in ids.iter().enumerate() {
            let mut ext = ExtMetadata::default();
            if let Some(id) = id {
                ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_ID, *id));
            }
            ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_M0, 100));
            ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_M2, 1 << 19));
            let x = 10 + 40 * i as u16 + frame_nr as u16;
            b.push_roi(i as u16 + 1, Region::from_rect(x, 20, 3, 3), 0, ext, 2);
        }
        let mut bytes = Vec::new();
        b.encode(&mut bytes, |_, px| px.fill(0));

        let cfg = Arc::new(AcqCfg {
            frame_bytes: bytes.len(),
            roi_count: ids.len() as u16,
            bitmap_format: BitmapFormat::Mono16,
            implied_region: Region::from_rect(0, 0, 128, 64),
            regions: vec![Region::from_rect(0, 0, 128, 64)],
            has_metadata: true,
            allocator: Default::default(),
            bit_depth: 16,
            color_mask: 0,
            frame_size_varies: true,
        });
        let frame = Frame::new(cfg, true).unwrap();
        frame.fill_data(|d| d.copy_from_slice(&bytes)).unwrap();
        frame.set_info(FrameInfo::new(frame_nr));
        frame
    }

    #[test]
    fn three_frames_two_particles() {
        let settings = TrackingSettings::default();
        let mut tracker = FrameTracker::new(&NearestNeighbourFactory, &settings).unwrap();

        tracker.track(&centroid_frame(1, &[Some(0), Some(0)])).unwrap();
        tracker.track(&centroid_frame(2, &[Some(1), Some(2)])).unwrap();
        let last = centroid_frame(3, &[None, None]);
        let set = tracker.track(&last).unwrap();

        assert_eq!(tracker.relinked_frames(), 2);
        let mut counts: Vec<_> = set.sample_counts().collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![(1, 3), (2, 3)]);
        assert_eq!(last.trajectories().unwrap(), set);
    }

    #[test]
    fn frames_without_metadata_are_rejected() {
        let cfg = Arc::new(AcqCfg::single_region(
            Region::from_rect(0, 0, 4, 4),
            BitmapFormat::Mono16,
            16,
        ));
        let frame = Frame::new(cfg, true).unwrap();
        let mut tracker =
            FrameTracker::new(&NearestNeighbourFactory, &TrackingSettings::default()).unwrap();
        assert!(matches!(tracker.track(&frame), Err(AcqError::Format(_))));
    }
}
