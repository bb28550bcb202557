//! Integration tests for the synthetic camera through the `Camera` trait.
//!
//! ```bash
//! cargo test -p daq-driver-pvcam --test fake_camera_test
//! ```

use daq_core::frame::FrameInfo;
use daq_core::settings::{AcqMode, Settings};
use daq_driver_pvcam::{
    AcqStatus, CallbackAction, Camera, FakeCamera, FakeCameraConfig, ParamId,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn camera() -> Arc<dyn Camera> {
    let config = FakeCameraConfig {
        sensor_width: 128,
        sensor_height: 64,
        fps: 500.0,
        ..Default::default()
    };
    Arc::new(FakeCamera::new(config))
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn enumerate_and_open_by_name() {
    let cam = camera();
    let cams = cam.enumerate().unwrap();
    assert_eq!(cams.len(), 1);
    assert_eq!(cams[0].sensor_width, 128);

    assert!(cam.info().is_none());
    cam.open(&cams[0].name, None).unwrap();
    assert!(cam.is_open());
    assert_eq!(cam.info().unwrap().name, "FakeCamera");
    cam.close().unwrap();
    assert!(!cam.is_open());
}

#[test]
fn parameters_expose_sensor_and_ranges() {
    let cam = camera();
    let params = cam.params();
    assert_eq!(params.get(ParamId::SensorWidth).unwrap(), 128);
    assert_eq!(params.get(ParamId::GainIndex).unwrap(), 1);
    assert!(params.set(ParamId::GainIndex, 7).unwrap_err().is_fixable());
    assert!(params.set(ParamId::BitDepth, 8).is_err());
    assert!(params.snapshot().len() >= 15);
}

#[test]
fn live_stream_runs_until_stopped() {
    let cam = camera();
    cam.open("FakeCamera", None).unwrap();
    let frame_bytes = cam
        .setup_exp(&Settings {
            acq_mode: AcqMode::LiveCircBuffer,
            buffer_frame_count: 4,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(frame_bytes, 128 * 64 * 2);

    let count = Arc::new(AtomicU32::new(0));
    let last = Arc::new(AtomicU32::new(0));
    let (c, l) = (Arc::clone(&count), Arc::clone(&last));
    cam.start_exp(Arc::new(move |info: Option<&FrameInfo>| {
        c.fetch_add(1, Ordering::SeqCst);
        if let Some(info) = info {
            l.store(info.frame_nr, Ordering::SeqCst);
        }
        CallbackAction::Continue
    }))
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) >= 10));
    assert_eq!(cam.acq_status(), AcqStatus::Active);
    cam.stop_exp().unwrap();
    cam.stop_exp().unwrap();
    assert_eq!(cam.acq_status(), AcqStatus::Inactive);

    let stopped_at = count.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::SeqCst), stopped_at);
    assert_eq!(last.load(Ordering::SeqCst), stopped_at);

    let latest = cam.latest_frame_index().unwrap();
    let frame = cam.frame_at(latest).unwrap();
    assert_eq!(frame.frame_nr(), stopped_at);
    assert_eq!(cam.frame_index_of(&frame), Some(latest));
}

#[test]
fn callback_abort_ends_delivery() {
    let cam = camera();
    cam.open("FakeCamera", None).unwrap();
    cam.setup_exp(&Settings {
        acq_mode: AcqMode::LiveCircBuffer,
        ..Default::default()
    })
    .unwrap();
    let count = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&count);
    cam.start_exp(Arc::new(move |_: Option<&FrameInfo>| {
        if c.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
            CallbackAction::Abort
        } else {
            CallbackAction::Continue
        }
    }))
    .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        cam.acq_status() == AcqStatus::Inactive && count.load(Ordering::SeqCst) == 3
    }));
    cam.stop_exp().unwrap();
}

#[test]
fn removal_callback_fires() {
    let fake = Arc::new(FakeCamera::new(FakeCameraConfig::default()));
    let removed = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&removed);
    fake.open("FakeCamera", Some(Box::new(move || r.store(true, Ordering::SeqCst))))
        .unwrap();
    fake.simulate_removal();
    assert!(removed.load(Ordering::SeqCst));
    assert_eq!(fake.acq_status(), AcqStatus::Failed);
}

#[test]
fn config_deserializes_with_defaults() {
    let config: FakeCameraConfig =
        serde_json::from_str(r#"{ "sensor_width": 256, "bit_depth": 8 }"#).unwrap();
    assert_eq!(config.sensor_width, 256);
    assert_eq!(config.sensor_height, 1024);
    assert_eq!(config.name, "FakeCamera");

    let cam = FakeCamera::new(config);
    cam.open("FakeCamera", None).unwrap();
    assert_eq!(cam.setup_exp(&Settings::default()).unwrap(), 256 * 1024);
}
