//! PRD files written by `PrdFileSave` read back through `PrdReader`.

use daq_core::frame::{AcqCfg, BitmapFormat, Frame, FrameInfo};
use daq_core::metadata::{ExtItem, ExtMetadata, MdFrameHeader, MetadataBuilder};
use daq_core::region::Region;
use daq_core::trajectory::{Trajectories, Trajectory, TrajectoryPoint};
use daq_pool::AllocatorType;
use daq_storage::prd::PRD_VERSION;
use daq_storage::{header_alignment, FileSave, PrdFileSave, PrdOptions, PrdReader};
use std::sync::Arc;

const FRAME_EXT_TAG: u8 = 40;

fn metadata_frame_bytes(frame_nr: u32) -> Vec<u8> {
    let mut b = MetadataBuilder::new(MdFrameHeader {
        frame_nr,
        ..Default::default()
    });
    b.ext.push(ExtItem::uns32(FRAME_EXT_TAG, frame_nr * 10));
    b.push_roi(1, Region::from_rect(0, 0, 16, 8), 0, ExtMetadata::default(), 2);
    b.push_roi(2, Region::from_rect(16, 8, 16, 8), 0, ExtMetadata::default(), 2);
    let mut bytes = Vec::new();
    b.encode(&mut bytes, |i, px| px.fill(i as u8 + 1));
    bytes
}

fn trajectories(frame_nr: u32) -> Trajectories {
    let mut set = Trajectories::new(4, 3);
    set.trajectories.push(Trajectory {
        roi_nr: 1,
        particle_id: 11,
        lifetime: 2,
        points: (1..=frame_nr)
            .map(|f| TrajectoryPoint {
                frame_nr: f,
                x: 10 + f as u16,
                y: 20,
            })
            .collect(),
    });
    set
}

fn write_file(path: &std::path::Path, allocator: AllocatorType, frames: u32) -> Arc<AcqCfg> {
    let sample = metadata_frame_bytes(1);
    let cfg = Arc::new(AcqCfg {
        frame_bytes: sample.len(),
        roi_count: 2,
        bitmap_format: BitmapFormat::Mono16,
        implied_region: Region::from_rect(0, 0, 32, 16),
        regions: vec![
            Region::from_rect(0, 0, 16, 8),
            Region::from_rect(16, 8, 16, 8),
        ],
        has_metadata: true,
        allocator,
        bit_depth: 16,
        color_mask: 0,
        frame_size_varies: false,
    });
    let options = PrdOptions {
        exposure_resolution: 1,
        alignment: header_alignment(allocator),
        trajectories: Some((4, 3)),
        wb_scales: [1.0, 1.0, 1.0],
    };
    let mut writer = PrdFileSave::new(path, Arc::clone(&cfg), options);
    writer.open().unwrap();
    for nr in 1..=frames {
        let frame = Frame::new(Arc::clone(&cfg), true).unwrap();
        let bytes = metadata_frame_bytes(nr);
        frame.fill_data(|d| d.copy_from_slice(&bytes)).unwrap();
        frame.set_info(FrameInfo {
            frame_nr: nr,
            exposure_time: 5,
            readout_time: 1234,
            timestamp_bof: u64::from(nr) * 1000,
            timestamp_eof: u64::from(nr) * 1000 + 500,
        });
        frame.set_trajectories(Some(Arc::new(trajectories(nr))));
        writer.write_frame(&frame).unwrap();
    }
    writer.close().unwrap();
    cfg
}

fn check_file(path: &std::path::Path, cfg: &AcqCfg, frames: u32) {
    let reader = PrdReader::open(path).unwrap();
    let header = *reader.header();
    assert_eq!(header.version, PRD_VERSION);
    assert_eq!(header.frame_count, frames);
    assert_eq!(header.frame_size as usize, cfg.frame_bytes);
    assert_eq!(header.exposure_resolution, 1);
    assert_eq!(header.region, cfg.implied_region);

    let records: Vec<_> = reader.map(Result::unwrap).collect();
    assert_eq!(records.len(), frames as usize);
    for (i, record) in records.iter().enumerate() {
        let nr = i as u32 + 1;
        assert_eq!(record.meta.frame_number, nr);
        assert_eq!(record.meta.roi_count, 2);
        assert_eq!(record.meta.timestamp_eof(), u64::from(nr) * 1000 + 500);
        assert_eq!(record.payload, metadata_frame_bytes(nr));

        let ext = ExtMetadata::decode(&record.ext_dyn).unwrap();
        assert_eq!(ext.get_u32(FRAME_EXT_TAG).unwrap(), Some(nr * 10));

        let set = record.trajectories.as_ref().unwrap();
        let points = &set.get(11).unwrap().points;
        assert_eq!(points.len(), nr.min(3) as usize);
        assert_eq!(points.last().unwrap().frame_nr, nr);
    }
}

#[test]
fn natural_alignment_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("natural.prd");
    let cfg = write_file(&path, AllocatorType::Default, 5);
    check_file(&path, &cfg, 5);
}

#[test]
fn page_aligned_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("paged.prd");
    let cfg = write_file(&path, AllocatorType::Align4k, 4);
    check_file(&path, &cfg, 4);
    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len % 4096, 0);
}
