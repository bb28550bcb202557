//! End-to-end runs of the acquisition pipeline against the synthetic camera.
//!
//! ```bash
//! cargo test -p daq-acquisition --test pipeline_scenarios
//! ```

use daq_acquisition::{AcqState, Acquisition, FrameSink};
use daq_core::error::AcqError;
use daq_core::frame::{AcqCfg, Frame};
use daq_core::frame_pool::SharedFrame;
use daq_core::region::Region;
use daq_core::settings::{
    AcqMode, CentroidsMode, CentroidsSettings, ExposureResolution, Settings, StorageType,
};
use daq_core::AcqResult;
use daq_driver_pvcam::{Camera, FakeCamera, FakeCameraConfig, FakeHooks, ParamEntry, ParamId};
use daq_storage::{DefaultStorageFactory, FileSave, PrdReader, StorageFactory};
use parking_lot::Mutex;
use serial_test::serial;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn open_camera(config: FakeCameraConfig, hooks: FakeHooks) -> Arc<FakeCamera> {
    let cam = Arc::new(FakeCamera::with_hooks(config, hooks));
    cam.open("FakeCamera", None).unwrap();
    cam
}

fn prd_settings(dir: &Path, prefix: &str) -> Settings {
    Settings {
        storage_type: StorageType::Prd,
        save_dir: dir.to_path_buf(),
        save_prefix: prefix.to_string(),
        ..Default::default()
    }
}

fn prd_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "prd"))
        .collect();
    files.sort();
    files
}

fn frame_numbers(path: &Path) -> Vec<u32> {
    PrdReader::open(path)
        .unwrap()
        .map(|r| r.unwrap().meta.frame_number)
        .collect()
}

#[derive(Default)]
struct CollectingSink {
    frames: Mutex<Vec<u32>>,
    still_writing: Mutex<usize>,
}

impl FrameSink for CollectingSink {
    fn show(&self, frame: Option<SharedFrame>) {
        match frame {
            Some(frame) => self.frames.lock().push(frame.frame_nr()),
            None => *self.still_writing.lock() += 1,
        }
    }
}

/// Writers that take `delay` per frame.
struct SlowStorage {
    inner: DefaultStorageFactory,
    delay: Duration,
}

struct SlowFile {
    inner: Box<dyn FileSave>,
    delay: Duration,
}

impl StorageFactory for SlowStorage {
    fn frames_per_file(&self, cfg: &AcqCfg, settings: &Settings) -> AcqResult<usize> {
        self.inner.frames_per_file(cfg, settings)
    }

    fn create(
        &self,
        index: usize,
        cfg: &Arc<AcqCfg>,
        settings: &Settings,
    ) -> AcqResult<Box<dyn FileSave>> {
        Ok(Box::new(SlowFile {
            inner: self.inner.create(index, cfg, settings)?,
            delay: self.delay,
        }))
    }
}

impl FileSave for SlowFile {
    fn open(&mut self) -> AcqResult<()> {
        self.inner.open()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn write_frame(&mut self, frame: &Frame) -> AcqResult<()> {
        std::thread::sleep(self.delay);
        self.inner.write_frame(frame)
    }

    fn close(&mut self) -> AcqResult<()> {
        self.inner.close()
    }

    fn frames_written(&self) -> u32 {
        self.inner.frames_written()
    }

    fn path(&self) -> &Path {
        self.inner.path()
    }
}

#[test]
#[serial]
fn multi_roi_snap_sequence_to_single_prd() {
    let dir = tempfile::tempdir().unwrap();
    let config = FakeCameraConfig {
        sensor_width: 512,
        sensor_height: 512,
        fps: 200.0,
        ..Default::default()
    };
    let cam = open_camera(config, FakeHooks::default());
    let sink = Arc::new(CollectingSink::default());
    let acq = Acquisition::new(cam.clone()).with_display(sink.clone());

    let settings = Settings {
        regions: vec![
            Region::from_rect(0, 0, 128, 128),
            Region::from_rect(256, 0, 128, 128),
            Region::from_rect(0, 256, 128, 128),
            Region::from_rect(256, 256, 128, 128),
        ],
        acq_frame_count: 10,
        buffer_frame_count: 10,
        display_fps: 0.0,
        max_stack_size: 64 * 1024 * 1024,
        ..prd_settings(dir.path(), "rois_")
    };
    acq.start(&settings).unwrap();
    assert!(!acq.wait_for_stop());

    let summary = acq.summary().unwrap();
    assert_eq!(summary.acq.frames_total, 10);
    assert_eq!(summary.acq.frames_acquired, 10);
    assert_eq!(summary.acq.frames_lost, 0);
    assert_eq!(summary.disk.frames_saved, 10);
    assert_eq!(summary.disk.files_written, 1);
    assert!(summary.error.is_none());

    let files = prd_files(dir.path());
    assert_eq!(files.len(), 1);
    let reader = PrdReader::open(&files[0]).unwrap();
    assert_eq!(reader.header().frame_count, 10);
    assert_eq!(frame_numbers(&files[0]), (1..=10).collect::<Vec<_>>());

    assert_eq!(*sink.frames.lock(), (1..=10).collect::<Vec<_>>());
    assert_eq!(acq.state(), AcqState::Stopped);
    assert_eq!(cam.start_count(), 1);
    assert_eq!(cam.stop_count(), 1);
}

#[test]
#[serial]
fn slow_disk_drops_frames_but_keeps_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = FakeCameraConfig {
        sensor_width: 128,
        sensor_height: 64,
        fps: 200.0,
        ..Default::default()
    };
    let cam = open_camera(config, FakeHooks::default());
    let storage = Arc::new(SlowStorage {
        inner: DefaultStorageFactory::default(),
        delay: Duration::from_millis(25),
    });
    let acq = Acquisition::new(cam.clone()).with_storage(storage);

    let settings = Settings {
        acq_mode: AcqMode::LiveCircBuffer,
        buffer_frame_count: 4,
        max_save_queue_frames: Some(2),
        max_stack_size: 256 * 1024 * 1024,
        ..prd_settings(dir.path(), "live_")
    };
    acq.start(&settings).unwrap();
    assert!(acq.is_running());
    std::thread::sleep(Duration::from_millis(600));
    acq.request_abort(false);
    assert!(acq.wait_for_stop());

    let summary = acq.summary().unwrap();
    assert!(summary.disk.frames_unsaved > 0);
    assert!(summary.disk.frames_saved > 0);
    assert_eq!(summary.acq.frames_uncaught, 0);
    assert!(summary.disk.frames_saved + summary.disk.frames_unsaved <= summary.acq.frames_acquired);
    assert_eq!(
        summary.acq.frames_acquired + summary.acq.frames_lost,
        summary.acq.frames_total
    );

    let files = prd_files(dir.path());
    assert_eq!(files.len(), 1);
    let numbers = frame_numbers(&files[0]);
    assert_eq!(numbers.len() as u64, summary.disk.frames_saved);
    assert!(numbers.windows(2).all(|w| w[0] < w[1]));
}

#[test]
#[serial]
fn single_slot_buffer_reports_drops_without_stalling() {
    let dir = tempfile::tempdir().unwrap();
    let config = FakeCameraConfig {
        sensor_width: 64,
        sensor_height: 32,
        fps: 0.0,
        ..Default::default()
    };
    let hooks = FakeHooks {
        frame_numbers: Some((1..=5000).collect()),
        ..Default::default()
    };
    let cam = open_camera(config, hooks);
    let acq = Acquisition::new(cam.clone());

    let settings = Settings {
        acq_mode: AcqMode::LiveCircBuffer,
        buffer_frame_count: 1,
        max_save_queue_frames: Some(64),
        max_stack_size: 256 * 1024 * 1024,
        ..prd_settings(dir.path(), "one_")
    };
    acq.start(&settings).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    acq.request_abort(false);
    let stopping = Instant::now();
    assert!(acq.wait_for_stop());
    assert!(stopping.elapsed() < Duration::from_secs(2));
    assert_eq!(acq.state(), AcqState::Stopped);

    let summary = acq.summary().unwrap();
    assert!(summary.acq.frames_lost + summary.acq.frames_uncaught > 0);
    assert_eq!(
        summary.acq.frames_acquired + summary.acq.frames_lost,
        summary.acq.frames_total
    );
    assert!(summary.disk.frames_saved > 0);

    let files = prd_files(dir.path());
    assert_eq!(files.len(), 1);
    let numbers = frame_numbers(&files[0]);
    assert_eq!(numbers.len() as u64, summary.disk.frames_saved);
    assert!(numbers.windows(2).all(|w| w[0] < w[1]));
}

#[test]
#[serial]
fn prd_header_records_applied_exposure_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let config = FakeCameraConfig {
        sensor_width: 64,
        sensor_height: 32,
        fps: 500.0,
        ..Default::default()
    };
    let cam = open_camera(config, FakeHooks::default());
    cam.params().insert(ParamEntry::enumeration(
        ParamId::ExposureResolution,
        0,
        &[(0, "One Millisecond")],
    ));
    let acq = Acquisition::new(cam.clone());

    let settings = Settings {
        exposure_resolution: ExposureResolution::Microseconds,
        fix_user_input: true,
        acq_frame_count: 3,
        buffer_frame_count: 4,
        max_stack_size: 16 * 1024 * 1024,
        ..prd_settings(dir.path(), "res_")
    };
    acq.start(&settings).unwrap();
    assert!(!acq.wait_for_stop());

    let files = prd_files(dir.path());
    assert_eq!(files.len(), 1);
    let header = *PrdReader::open(&files[0]).unwrap().header();
    assert_eq!(
        header.exposure_resolution,
        ExposureResolution::Milliseconds.to_pvcam() as u16
    );
    assert_eq!(header.frame_count, 3);
}

#[test]
#[serial]
fn tracking_attaches_trajectories_to_saved_frames() {
    let dir = tempfile::tempdir().unwrap();
    let config = FakeCameraConfig {
        fps: 100.0,
        particle_count: 2,
        ..Default::default()
    };
    let hooks = FakeHooks {
        particle_ids: Some(Arc::new(|frame_nr, i| match frame_nr {
            1 => Some(0),
            2 => Some(i as u32 + 1),
            _ => None,
        })),
        ..Default::default()
    };
    let cam = open_camera(config, hooks);
    let sink = Arc::new(CollectingSink::default());
    let acq = Acquisition::new(cam.clone()).with_display(sink.clone());

    let settings = Settings {
        acq_mode: AcqMode::SnapCircBuffer,
        acq_frame_count: 3,
        buffer_frame_count: 8,
        metadata_enabled: true,
        centroids: CentroidsSettings {
            enabled: true,
            mode: CentroidsMode::Track,
            radius: 3,
            count: 2,
        },
        display_fps: 0.0,
        max_stack_size: 64 * 1024 * 1024,
        ..prd_settings(dir.path(), "track_")
    };
    assert!(settings.is_tracking());
    acq.start(&settings).unwrap();
    assert!(!acq.wait_for_stop());

    let summary = acq.summary().unwrap();
    assert_eq!(summary.disk.frames_saved, 3);
    assert_eq!(summary.disk.relinked_frames, 2);
    assert!(summary.error.is_none());

    let files = prd_files(dir.path());
    assert_eq!(files.len(), 1);
    let records: Vec<_> = PrdReader::open(&files[0])
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(records.len(), 3);
    for record in &records {
        let set = record.trajectories.as_ref().unwrap();
        assert_eq!(set.len(), 2);
    }

    // Tracked frames reach the display from the disk stage, with trajectories.
    assert_eq!(*sink.frames.lock(), vec![1, 2, 3]);
    assert_eq!(*sink.still_writing.lock(), 0);
}

#[test]
#[serial]
fn stacked_prd_splits_into_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = FakeCameraConfig {
        sensor_width: 512,
        sensor_height: 1024,
        fps: 400.0,
        ..Default::default()
    };
    let cam = open_camera(config, FakeHooks::default());
    let acq = Acquisition::new(cam);

    let settings = Settings {
        acq_mode: AcqMode::SnapCircBuffer,
        acq_frame_count: 250,
        buffer_frame_count: 32,
        max_stack_size: 10 * 1024 * 1024,
        ..prd_settings(dir.path(), "stack_")
    };
    acq.start(&settings).unwrap();
    assert!(!acq.wait_for_stop());

    let summary = acq.summary().unwrap();
    assert_eq!(summary.acq.frames_lost, 0);
    assert_eq!(summary.disk.frames_saved, 250);
    assert_eq!(summary.disk.files_written, 28);

    let files = prd_files(dir.path());
    assert_eq!(files.len(), 28);
    assert_eq!(files[0].file_name().unwrap(), "stack_000.prd");
    for file in &files[..27] {
        assert_eq!(PrdReader::open(file).unwrap().header().frame_count, 9);
    }
    assert_eq!(PrdReader::open(&files[27]).unwrap().header().frame_count, 7);
    assert_eq!(frame_numbers(&files[27]), (244..=250).collect::<Vec<_>>());
}

#[test]
#[serial]
fn out_of_order_frame_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let config = FakeCameraConfig {
        sensor_width: 128,
        sensor_height: 64,
        fps: 100.0,
        ..Default::default()
    };
    let hooks = FakeHooks {
        frame_numbers: Some(vec![1, 2, 4, 3, 5]),
        ..Default::default()
    };
    let cam = open_camera(config, hooks);
    let acq = Acquisition::new(cam);

    let settings = Settings {
        acq_mode: AcqMode::SnapCircBuffer,
        acq_frame_count: 5,
        buffer_frame_count: 8,
        max_stack_size: 16 * 1024 * 1024,
        ..prd_settings(dir.path(), "ooo_")
    };
    acq.start(&settings).unwrap();
    assert!(!acq.wait_for_stop());

    let summary = acq.summary().unwrap();
    assert_eq!(summary.acq.out_of_order, 1);
    assert_eq!(summary.acq.frames_lost, 1);
    assert_eq!(summary.acq.frames_acquired, 4);
    assert_eq!(summary.acq.frames_total, 5);
    assert_eq!(summary.acq.uncaught.first, vec![3]);

    let files = prd_files(dir.path());
    assert_eq!(frame_numbers(&files[0]), vec![1, 2, 4, 5]);
}

#[test]
#[serial]
fn null_notification_aborts_run() {
    let hooks = FakeHooks {
        null_callback_at: Some(1),
        ..Default::default()
    };
    let config = FakeCameraConfig {
        sensor_width: 128,
        sensor_height: 64,
        fps: 100.0,
        ..Default::default()
    };
    let cam = open_camera(config, hooks);
    let acq = Acquisition::new(cam.clone());

    acq.start(&Settings::default()).unwrap();
    assert!(acq.wait_for_stop());

    let summary = acq.summary().unwrap();
    assert!(summary.aborted);
    assert!(summary.error.is_some());
    assert_eq!(summary.acq.frames_acquired, 0);
    assert_eq!(cam.start_count(), 1);
    assert_eq!(cam.stop_count(), 1);
}

#[test]
#[serial]
fn camera_failure_stops_run_after_timeout_poll() {
    let hooks = FakeHooks {
        fail_after: Some(3),
        ..Default::default()
    };
    let config = FakeCameraConfig {
        sensor_width: 128,
        sensor_height: 64,
        fps: 100.0,
        ..Default::default()
    };
    let cam = open_camera(config, hooks);
    let acq = Acquisition::new(cam);

    acq.start(&Settings::default()).unwrap();
    assert!(acq.wait_for_stop());
    let summary = acq.summary().unwrap();
    assert_eq!(summary.acq.frames_acquired, 3);
}

#[test]
#[serial]
fn repeated_abort_and_restart() {
    let config = FakeCameraConfig {
        sensor_width: 128,
        sensor_height: 64,
        fps: 200.0,
        ..Default::default()
    };
    let cam = open_camera(config, FakeHooks::default());
    let acq = Acquisition::new(cam.clone());

    let live = Settings {
        acq_mode: AcqMode::LiveCircBuffer,
        buffer_frame_count: 8,
        ..Default::default()
    };
    acq.start(&live).unwrap();
    assert!(matches!(acq.start(&live), Err(AcqError::State(_))));
    std::thread::sleep(Duration::from_millis(100));
    acq.request_abort(false);
    acq.request_abort(true);
    assert!(acq.wait_for_stop());
    assert!(!acq.wait_for_stop());
    assert_eq!(acq.state(), AcqState::Stopped);

    let snap = Settings {
        acq_frame_count: 5,
        buffer_frame_count: 5,
        ..Default::default()
    };
    acq.start(&snap).unwrap();
    assert!(!acq.wait_for_stop());
    assert_eq!(acq.summary().unwrap().acq.frames_acquired, 5);
    assert_eq!(cam.start_count(), 2);
    assert_eq!(cam.stop_count(), 2);
}

#[test]
#[serial]
fn stack_too_small_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = FakeCameraConfig {
        sensor_width: 512,
        sensor_height: 1024,
        ..Default::default()
    };
    let cam = open_camera(config, FakeHooks::default());
    let acq = Acquisition::new(cam.clone());

    let settings = Settings {
        max_stack_size: 1024 * 1024,
        ..prd_settings(dir.path(), "small_")
    };
    assert!(matches!(acq.start(&settings), Err(AcqError::Config(_))));
    assert!(!acq.is_running());
    assert_eq!(cam.start_count(), 0);
    assert!(prd_files(dir.path()).is_empty());
}

#[test]
#[serial]
fn closed_camera_is_rejected() {
    let cam = Arc::new(FakeCamera::new(FakeCameraConfig::default()));
    let acq = Acquisition::new(cam);
    assert!(acq.start(&Settings::default()).is_err());
    assert_eq!(acq.state(), AcqState::Idle);
}
