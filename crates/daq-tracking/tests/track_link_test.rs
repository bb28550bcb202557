//! Tracking across frames: camera ids, relinking and trajectory history.

use daq_core::metadata::{
    ExtItem, ExtMetadata, FrameMetadata, MdFrameHeader, MetadataBuilder, EXT_TAG_PARTICLE_ID,
    EXT_TAG_PARTICLE_M0, EXT_TAG_PARTICLE_M2,
};
use daq_core::settings::TrackingSettings;
use daq_core::Region;
use daq_tracking::{NearestNeighbourFactory, TrackerFactory, TrackingContext};

/// Two particles drifting one pixel per frame along x.
fn frame(frame_nr: u32, ids: Option<[u32; 2]>) -> FrameMetadata {
    let mut b = MetadataBuilder::new(MdFrameHeader {
        frame_nr,
        ..Default::default()
    });
    for (i, base_x) in [100u16, 300].into_iter().enumerate() {
        let mut ext = ExtMetadata::default();
        if let Some(ids) = ids {
            ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_ID, ids[i]));
        }
        ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_M0, 1000));
        ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_M2, 2 << 19));
        let x = base_x + frame_nr as u16;
        b.push_roi(i as u16 + 1, Region::from_rect(x - 2, 98, 5, 5), 0, ext, 2);
    }
    let mut bytes = Vec::new();
    b.encode(&mut bytes, |_, px| px.fill(0));
    FrameMetadata::decode(&bytes).unwrap()
}

fn context() -> TrackingContext {
    let settings = TrackingSettings::default();
    let tracker = NearestNeighbourFactory.create(&settings).unwrap();
    TrackingContext::new(tracker, &settings)
}

#[test]
fn zero_ids_then_camera_ids_then_missing_ids() {
    let mut ctx = context();

    let set1 = ctx.process(&frame(1, Some([0, 0]))).unwrap();
    let ids: Vec<_> = set1.sample_counts().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![1, 2]);

    ctx.process(&frame(2, Some([1, 2]))).unwrap();

    let set3 = ctx.process(&frame(3, None)).unwrap();
    assert_eq!(set3.len(), 2);
    for id in [1, 2] {
        let t = set3.get(id).unwrap();
        assert_eq!(t.points.len(), 3);
        assert_eq!(
            t.points.iter().map(|p| p.frame_nr).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }
    assert_eq!(set3.get(1).unwrap().points[2].x, 103);
    assert_eq!(set3.get(2).unwrap().points[0].x, 301);
    assert_eq!(ctx.relinked_frames(), 2);
}

#[test]
fn history_depth_follows_trajectory_duration() {
    let settings = TrackingSettings {
        trajectory_duration: 4,
        ..Default::default()
    };
    let tracker = NearestNeighbourFactory.create(&settings).unwrap();
    let mut ctx = TrackingContext::new(tracker, &settings);
    let mut last = None;
    for nr in 1..=10 {
        last = Some(ctx.process(&frame(nr, Some([1, 2]))).unwrap());
    }
    let set = last.unwrap();
    assert_eq!(set.max_points, 4);
    assert!(set.sample_counts().all(|(_, n)| n == 4));

    ctx.reset();
    assert!(ctx.process(&frame(11, None)).unwrap().get(1).unwrap().points.len() == 1);
}
