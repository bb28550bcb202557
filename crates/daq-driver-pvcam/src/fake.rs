//! Synthetic camera.
//!
//! `FakeCamera` implements [`Camera`] without hardware: a generator thread
//! plays the driver, filling the circular buffer with a test pattern (and,
//! when enabled, embedded metadata with particle centroids) at a configured
//! frame rate and invoking the end-of-frame callback for each frame.
//!
//! [`FakeHooks`] lets tests script driver misbehaviour: injected frame
//! number sequences, a null notification, a status failure, or particle
//! ids that change from frame to frame.

use crate::components::circ_buffer::CircBuffer;
use crate::components::params::{ParamEntry, ParamId, ParamTree};
use crate::{AcqStatus, CallbackAction, Camera, CameraInfo, EofCallback, RemovalCallback};
use daq_core::error::{AcqError, AcqResult, CameraError};
use daq_core::frame::{AcqCfg, BitmapFormat, Frame, FrameInfo};
use daq_core::metadata::{
    max_frame_bytes, ExtItem, ExtMetadata, MdFrameHeader, MetadataBuilder, EXT_TAG_PARTICLE_ID,
    EXT_TAG_PARTICLE_M0, EXT_TAG_PARTICLE_M2,
};
use daq_core::region::{implied_region, Region};
use daq_core::settings::{ExposureMode, Settings};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Size of the extended metadata carried by one centroid ROI (ID, M0, M2).
const CENTROID_EXT_BYTES: usize = 3 * 8;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeCameraConfig {
    pub name: String,
    pub sensor_width: u16,
    pub sensor_height: u16,
    pub bit_depth: u16,
    /// Bayer mask, 0 for a mono sensor.
    pub color_mask: u8,
    /// Frame rate; 0 delivers frames as fast as possible.
    pub fps: f64,
    /// Particles visible to the centroid engine.
    pub particle_count: u16,
    pub readout_time_us: u32,
}

impl Default for FakeCameraConfig {
    fn default() -> Self {
        Self {
            name: "FakeCamera".to_string(),
            sensor_width: 1024,
            sensor_height: 1024,
            bit_depth: 16,
            color_mask: 0,
            fps: 100.0,
            particle_count: 8,
            readout_time_us: 500,
        }
    }
}

/// Particle id reported for `(frame_nr, particle_index)`; `None` omits the
/// id item from the ROI's metadata.
pub type ParticleIdFn = Arc<dyn Fn(u32, usize) -> Option<u32> + Send + Sync>;

/// Scripted driver behaviour for tests.
#[derive(Clone, Default)]
pub struct FakeHooks {
    /// Frame numbers to deliver, in order. The acquisition ends after the
    /// last one.
    pub frame_numbers: Option<Vec<u32>>,
    /// Deliver a null notification in place of the n-th frame (1-based).
    pub null_callback_at: Option<u32>,
    /// Report [`AcqStatus::Failed`] and stop after this many frames.
    pub fail_after: Option<u32>,
    pub particle_ids: Option<ParticleIdFn>,
}

impl fmt::Debug for FakeHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeHooks")
            .field("frame_numbers", &self.frame_numbers)
            .field("null_callback_at", &self.null_callback_at)
            .field("fail_after", &self.fail_after)
            .field("particle_ids", &self.particle_ids.is_some())
            .finish()
    }
}

// =============================================================================
// Acquisition plan
// =============================================================================

#[derive(Debug, Clone)]
struct CentroidPlan {
    count: usize,
    radius: u16,
}

#[derive(Debug, Clone)]
struct FramePlan {
    frame_limit: Option<u32>,
    period: Option<Duration>,
    time_lapse_delay: Option<Duration>,
    exposure: u32,
    exposure_unit_ns: u64,
    exposure_mode: ExposureMode,
    vtm_exposures: Vec<u16>,
    centroids: Option<CentroidPlan>,
}

struct ExpSetup {
    cfg: Arc<AcqCfg>,
    buffer: Arc<CircBuffer>,
    plan: FramePlan,
}

struct OpenState {
    on_removed: Option<RemovalCallback>,
}

struct Shared {
    running: AtomicBool,
    status: Mutex<AcqStatus>,
    triggers: Mutex<u32>,
    trigger_cv: Condvar,
}

// =============================================================================
// FakeCamera
// =============================================================================

pub struct FakeCamera {
    config: FakeCameraConfig,
    hooks: FakeHooks,
    params: ParamTree,
    open: Mutex<Option<OpenState>>,
    setup: RwLock<Option<ExpSetup>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
}

impl FakeCamera {
    #[must_use]
    pub fn new(config: FakeCameraConfig) -> Self {
        Self::with_hooks(config, FakeHooks::default())
    }

    #[must_use]
    pub fn with_hooks(config: FakeCameraConfig, hooks: FakeHooks) -> Self {
        let params = ParamTree::new([
            ParamEntry::read_only(ParamId::SensorWidth, i64::from(config.sensor_width)),
            ParamEntry::read_only(ParamId::SensorHeight, i64::from(config.sensor_height)),
            ParamEntry::read_only(ParamId::BitDepth, i64::from(config.bit_depth)),
            ParamEntry::read_only(ParamId::ColorMode, i64::from(config.color_mask)),
            ParamEntry::enumeration(
                ParamId::ExposureResolution,
                0,
                &[(0, "One Millisecond"), (1, "One Microsecond"), (2, "One Second")],
            ),
            ParamEntry::enumeration(
                ParamId::ExposureMode,
                0,
                &[(0, "Timed"), (3, "Trigger"), (5, "Variable Timed")],
            ),
            ParamEntry::enumeration(
                ParamId::ClearMode,
                1,
                &[
                    (0, "Never"),
                    (1, "Pre-Exposure"),
                    (2, "Pre-Sequence"),
                    (3, "Post-Sequence"),
                    (4, "Pre-Post Sequence"),
                    (5, "Pre-Exposure Post-Sequence"),
                ],
            ),
            ParamEntry::enumeration(ParamId::ReadoutPort, 0, &[(0, "Sensitivity"), (1, "Speed")]),
            ParamEntry::range(ParamId::SpeedIndex, 0, 0, 2),
            ParamEntry::range(ParamId::GainIndex, 1, 1, 3),
            ParamEntry::flag(ParamId::MetadataEnabled, false),
            ParamEntry::flag(ParamId::CentroidsEnabled, false),
            ParamEntry::enumeration(
                ParamId::CentroidsMode,
                0,
                &[(0, "Locate"), (1, "Track"), (2, "Blob")],
            ),
            ParamEntry::range(ParamId::CentroidsRadius, 3, 1, 15),
            ParamEntry::range(ParamId::CentroidsCount, 100, 1, 500),
        ]);
        Self {
            config,
            hooks,
            params,
            open: Mutex::new(None),
            setup: RwLock::new(None),
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                status: Mutex::new(AcqStatus::Inactive),
                triggers: Mutex::new(0),
                trigger_cv: Condvar::new(),
            }),
            worker: Mutex::new(None),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &FakeCameraConfig {
        &self.config
    }

    /// Successful `start_exp` calls so far.
    #[must_use]
    pub fn start_count(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// `stop_exp` calls that stopped a running acquisition.
    #[must_use]
    pub fn stop_count(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Behave as if the device was unplugged.
    pub fn simulate_removal(&self) {
        warn!(camera = %self.config.name, "Simulating camera removal");
        *self.shared.status.lock() = AcqStatus::Failed;
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(cb) = self.open.lock().as_ref().and_then(|o| o.on_removed.as_ref()) {
            cb();
        }
    }

    fn camera_info(&self) -> CameraInfo {
        CameraInfo {
            index: 0,
            name: self.config.name.clone(),
            sensor_width: self.config.sensor_width,
            sensor_height: self.config.sensor_height,
            bit_depth: self.config.bit_depth,
        }
    }

    fn sensor_region(&self) -> Region {
        Region::from_rect(0, 0, self.config.sensor_width, self.config.sensor_height)
    }

    fn check_regions(&self, regions: &[Region]) -> AcqResult<()> {
        let sensor = self.sensor_region();
        for r in regions {
            if !r.is_valid() || r.s2 > sensor.s2 || r.p2 > sensor.p2 {
                return Err(CameraError::InvalidRoi(format!(
                    "region {r} does not fit sensor {sensor}"
                ))
                .into());
            }
        }
        Ok(())
    }

    fn join_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Fake camera generator thread panicked");
            }
        }
    }
}

impl Camera for FakeCamera {
    fn enumerate(&self) -> AcqResult<Vec<CameraInfo>> {
        Ok(vec![self.camera_info()])
    }

    fn open(&self, name: &str, on_removed: Option<RemovalCallback>) -> AcqResult<()> {
        if name != self.config.name {
            return Err(CameraError::NotFound(name.to_string()).into());
        }
        let mut open = self.open.lock();
        if open.is_some() {
            return Err(AcqError::state(format!("camera '{name}' is already open")));
        }
        *open = Some(OpenState { on_removed });
        info!(camera = name, "Camera opened");
        Ok(())
    }

    fn close(&self) -> AcqResult<()> {
        self.stop_exp()?;
        *self.setup.write() = None;
        if self.open.lock().take().is_some() {
            info!(camera = %self.config.name, "Camera closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.lock().is_some()
    }

    fn info(&self) -> Option<CameraInfo> {
        self.is_open().then(|| self.camera_info())
    }

    fn params(&self) -> &ParamTree {
        &self.params
    }

    fn setup_exp(&self, settings: &Settings) -> AcqResult<usize> {
        if !self.is_open() {
            return Err(CameraError::NotOpen.into());
        }
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(AcqError::state("cannot set up while acquiring"));
        }

        let user_regions = if settings.regions.is_empty() {
            vec![self.sensor_region()]
        } else {
            settings.regions.clone()
        };
        self.check_regions(&user_regions)?;
        let implied = implied_region(&user_regions).ok_or_else(|| {
            CameraError::InvalidRoi("regions must share the same binning".to_string())
        })?;

        let bit_depth = self.params.get(ParamId::BitDepth)? as u16;
        let color_mask = self.params.get(ParamId::ColorMode)? as u8;
        let bitmap_format = if bit_depth <= 8 {
            BitmapFormat::Mono8
        } else {
            BitmapFormat::Mono16
        };
        let bpp = bitmap_format.bytes_per_pixel();
        let has_metadata = self.params.get_bool(ParamId::MetadataEnabled)?;
        let centroids = (has_metadata && self.params.get_bool(ParamId::CentroidsEnabled)?)
            .then(|| -> AcqResult<CentroidPlan> {
                let count = self.params.get(ParamId::CentroidsCount)? as usize;
                Ok(CentroidPlan {
                    count: count.min(usize::from(self.config.particle_count)),
                    radius: self.params.get(ParamId::CentroidsRadius)? as u16,
                })
            })
            .transpose()?;

        let (frame_bytes, roi_count, regions) = match &centroids {
            Some(c) => {
                let side = u32::from(c.radius) * 2 + 1;
                let roi_bytes = (side * side) as usize * bpp;
                (
                    max_frame_bytes(c.count, roi_bytes, CENTROID_EXT_BYTES),
                    c.count as u16,
                    user_regions,
                )
            }
            None if has_metadata => {
                let data: usize = user_regions.iter().map(|r| r.pixel_count() * bpp).sum();
                let bytes = max_frame_bytes(user_regions.len(), 0, 0) + data;
                (bytes, user_regions.len() as u16, user_regions)
            }
            None => {
                let data: usize = user_regions.iter().map(|r| r.pixel_count() * bpp).sum();
                (data, user_regions.len() as u16, user_regions)
            }
        };

        let cfg = Arc::new(AcqCfg {
            frame_bytes,
            roi_count,
            bitmap_format,
            implied_region: implied,
            regions,
            has_metadata,
            allocator: settings.allocator,
            bit_depth,
            color_mask,
            frame_size_varies: centroids.is_some(),
        });
        let buffer = CircBuffer::new(Arc::clone(&cfg), settings.buffer_frame_count as usize)?;

        let exposure_mode = ExposureMode::from_pvcam(self.params.get(ParamId::ExposureMode)? as i32);
        let exposure_resolution = daq_core::settings::ExposureResolution::from_pvcam(
            self.params.get(ParamId::ExposureResolution)? as i32,
        );
        let frame_limit = match &self.hooks.frame_numbers {
            Some(seq) => Some(seq.len() as u32),
            None => settings.frame_limit(),
        };
        let plan = FramePlan {
            frame_limit,
            period: (self.config.fps > 0.0).then(|| Duration::from_secs_f64(1.0 / self.config.fps)),
            time_lapse_delay: (settings.acq_mode.is_time_lapse() && settings.time_lapse_delay_ms > 0)
                .then(|| Duration::from_millis(u64::from(settings.time_lapse_delay_ms))),
            exposure: settings.exposure,
            exposure_unit_ns: exposure_resolution.unit_ns(),
            exposure_mode,
            vtm_exposures: settings.vtm_exposures.clone(),
            centroids,
        };

        debug!(
            frame_bytes,
            roi_count,
            metadata = has_metadata,
            buffer_frames = buffer.slot_count(),
            "Fake camera set up"
        );
        *self.setup.write() = Some(ExpSetup { cfg, buffer, plan });
        Ok(frame_bytes)
    }

    fn acq_cfg(&self) -> Option<Arc<AcqCfg>> {
        self.setup.read().as_ref().map(|s| Arc::clone(&s.cfg))
    }

    fn start_exp(&self, on_eof: EofCallback) -> AcqResult<()> {
        let (cfg, buffer, plan) = {
            let setup = self.setup.read();
            let Some(setup) = setup.as_ref() else {
                return Err(AcqError::state("start_exp called before setup_exp"));
            };
            (
                Arc::clone(&setup.cfg),
                Arc::clone(&setup.buffer),
                setup.plan.clone(),
            )
        };
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(AcqError::state("acquisition already running"));
        }
        // A previous run may have ended on its own; reap it first.
        self.join_worker();
        *self.shared.status.lock() = AcqStatus::Active;
        *self.shared.triggers.lock() = 0;

        let generator = Generator {
            config: self.config.clone(),
            hooks: self.hooks.clone(),
            shared: Arc::clone(&self.shared),
            cfg,
            buffer,
            plan,
            on_eof,
        };
        let handle = std::thread::Builder::new()
            .name("fake-camera".into())
            .spawn(move || generator.run())
            .map_err(|e| CameraError::DriverCall {
                call: "start_exp",
                message: e.to_string(),
            })?;
        *self.worker.lock() = Some(handle);
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        info!(camera = %self.config.name, "Acquisition started");
        Ok(())
    }

    fn stop_exp(&self) -> AcqResult<()> {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        self.shared.trigger_cv.notify_all();
        let had_worker = self.worker.lock().is_some();
        self.join_worker();
        if was_running || had_worker {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            let mut status = self.shared.status.lock();
            if *status == AcqStatus::Active {
                *status = AcqStatus::Inactive;
            }
            info!(camera = %self.config.name, "Acquisition stopped");
        }
        Ok(())
    }

    fn trigger(&self) -> AcqResult<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(AcqError::state("trigger sent while not acquiring"));
        }
        *self.shared.triggers.lock() += 1;
        self.shared.trigger_cv.notify_one();
        Ok(())
    }

    fn latest_frame(&self, out: &Frame) -> bool {
        let setup = self.setup.read();
        let Some(setup) = setup.as_ref() else {
            return false;
        };
        let Some(frame) = setup.buffer.latest_index().and_then(|i| setup.buffer.frame_at(i)) else {
            return false;
        };
        out.copy_from(&frame).is_ok()
    }

    fn latest_frame_index(&self) -> Option<usize> {
        self.setup.read().as_ref()?.buffer.latest_index()
    }

    fn frame_at(&self, index: usize) -> Option<Arc<Frame>> {
        self.setup.read().as_ref()?.buffer.frame_at(index)
    }

    fn frame_index_of(&self, frame: &Frame) -> Option<usize> {
        self.setup.read().as_ref()?.buffer.index_of(frame.frame_nr())
    }

    fn acq_status(&self) -> AcqStatus {
        *self.shared.status.lock()
    }
}

impl Drop for FakeCamera {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.trigger_cv.notify_all();
        self.join_worker();
    }
}

// =============================================================================
// Generator thread
// =============================================================================

struct Generator {
    config: FakeCameraConfig,
    hooks: FakeHooks,
    shared: Arc<Shared>,
    cfg: Arc<AcqCfg>,
    buffer: Arc<CircBuffer>,
    plan: FramePlan,
    on_eof: EofCallback,
}

impl Generator {
    fn run(self) {
        let started = Instant::now();
        let mut next_due = started;
        let mut scratch = Vec::with_capacity(self.buffer.frame_bytes());
        let mut seq: u32 = 0;
        let mut failed = false;

        while self.shared.running.load(Ordering::SeqCst) {
            if self.plan.frame_limit.is_some_and(|limit| seq >= limit) {
                break;
            }
            if self.plan.exposure_mode == ExposureMode::Trigger && !self.wait_for_trigger() {
                break;
            }
            if seq > 0 {
                if let Some(delay) = self.plan.time_lapse_delay {
                    std::thread::sleep(delay);
                }
            }
            if let Some(period) = self.plan.period {
                next_due += period;
                let now = Instant::now();
                if next_due > now {
                    std::thread::sleep(next_due - now);
                }
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }

            seq += 1;
            if self.hooks.fail_after.is_some_and(|n| seq > n) {
                warn!(frames = seq - 1, "Fake camera reporting readout failure");
                failed = true;
                break;
            }
            if self.hooks.null_callback_at == Some(seq) {
                if (self.on_eof)(None) == CallbackAction::Abort {
                    break;
                }
                continue;
            }

            let frame_nr = self
                .hooks
                .frame_numbers
                .as_ref()
                .and_then(|s| s.get(seq as usize - 1).copied())
                .unwrap_or(seq);
            let info = self.frame_info(frame_nr, seq, started.elapsed());
            let slot = (seq as usize - 1) % self.buffer.slot_count();
            let cfg = &self.cfg;

            if cfg.has_metadata {
                scratch.clear();
                self.encode_metadata(&info, &mut scratch);
                self.buffer.write_slot(slot, info, |dst| {
                    let n = scratch.len().min(dst.len());
                    dst[..n].copy_from_slice(&scratch[..n]);
                    dst[n..].fill(0);
                });
            } else {
                self.buffer.write_slot(slot, info, |dst| {
                    fill_rois(dst, cfg, frame_nr);
                });
            }

            if (self.on_eof)(Some(&info)) == CallbackAction::Abort {
                debug!(frame_nr, "Callback requested abort");
                break;
            }
        }

        *self.shared.status.lock() = if failed {
            AcqStatus::Failed
        } else {
            AcqStatus::Inactive
        };
        self.shared.running.store(false, Ordering::SeqCst);
        debug!(frames = seq, "Fake camera generator finished");
    }

    /// Block until a trigger arrives. `false` if the acquisition stopped.
    fn wait_for_trigger(&self) -> bool {
        let mut pending = self.shared.triggers.lock();
        while *pending == 0 {
            if !self.shared.running.load(Ordering::SeqCst) {
                return false;
            }
            self.shared
                .trigger_cv
                .wait_for(&mut pending, Duration::from_millis(100));
        }
        *pending -= 1;
        true
    }

    fn frame_info(&self, frame_nr: u32, seq: u32, elapsed: Duration) -> FrameInfo {
        let exposure = match self.plan.exposure_mode {
            ExposureMode::VariableTimed if !self.plan.vtm_exposures.is_empty() => {
                let i = (seq as usize - 1) % self.plan.vtm_exposures.len();
                u32::from(self.plan.vtm_exposures[i])
            }
            _ => self.plan.exposure,
        };
        let exposure_100ns = u64::from(exposure) * self.plan.exposure_unit_ns / 100;
        let eof = (elapsed.as_nanos() / 100) as u64;
        FrameInfo {
            frame_nr,
            exposure_time: exposure,
            readout_time: self.config.readout_time_us * 100,
            timestamp_bof: eof.saturating_sub(exposure_100ns),
            timestamp_eof: eof,
        }
    }

    fn encode_metadata(&self, info: &FrameInfo, out: &mut Vec<u8>) {
        let cfg = &self.cfg;
        let mut builder = MetadataBuilder::new(MdFrameHeader {
            frame_nr: info.frame_nr,
            timestamp_bof: info.timestamp_bof as u32,
            timestamp_eof: info.timestamp_eof as u32,
            timestamp_res_ns: 100,
            exposure_time: info.exposure_time,
            exposure_time_res_ns: self.plan.exposure_unit_ns.min(u64::from(u32::MAX)) as u32,
            roi_timestamp_res_ns: 100,
            bit_depth: cfg.bit_depth as u8,
            color_mask: cfg.color_mask,
            image_format: cfg.bitmap_format.code(),
            ..Default::default()
        });
        let bpp = cfg.bitmap_format.bytes_per_pixel();

        let regions: Vec<Region> = match &self.plan.centroids {
            Some(c) => (0..c.count)
                .map(|i| {
                    let (cx, cy) = self.particle_position(i, c, info.frame_nr);
                    let side = c.radius * 2 + 1;
                    Region::from_rect(cx - c.radius, cy - c.radius, side, side)
                })
                .collect(),
            None => cfg.regions.clone(),
        };
        for (i, region) in regions.iter().enumerate() {
            let mut ext = ExtMetadata::default();
            if self.plan.centroids.is_some() {
                let id = match &self.hooks.particle_ids {
                    Some(f) => f(info.frame_nr, i),
                    None => Some(i as u32 + 1),
                };
                if let Some(id) = id {
                    ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_ID, id));
                }
                ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_M0, 1000 + 10 * i as u32));
                ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_M2, (2 + i as u32) << 19));
            }
            builder.push_roi(i as u16 + 1, *region, 0, ext, bpp);
        }

        let max = max_sample(cfg.bit_depth);
        builder.encode(out, |i, px| {
            let width = regions.get(i).map_or(1, |r| r.width() as usize);
            fill_pattern(px, width, bpp, info.frame_nr, max);
        });
    }

    /// Particles drift one pixel per frame along x, spaced evenly across
    /// the sensor, kept far enough from the edges for a full ROI.
    fn particle_position(&self, i: usize, c: &CentroidPlan, frame_nr: u32) -> (u16, u16) {
        let w = u32::from(self.config.sensor_width);
        let h = u32::from(self.config.sensor_height);
        let r = u32::from(c.radius);
        let span = w.saturating_sub(2 * r + 1).max(1);
        let x = r + (w / (c.count as u32 + 1) * (i as u32 + 1) + frame_nr) % span;
        let y = (h / 2).clamp(r, h.saturating_sub(r + 1).max(r));
        (x as u16, y as u16)
    }
}

fn max_sample(bit_depth: u16) -> u32 {
    if bit_depth >= 32 {
        u32::MAX
    } else {
        (1u32 << bit_depth.max(1)) - 1
    }
}

/// Diagonal gradient shifted by the frame number.
fn fill_pattern(dst: &mut [u8], width: usize, bpp: usize, frame_nr: u32, max: u32) {
    let width = width.max(1);
    for (i, px) in dst.chunks_exact_mut(bpp).enumerate() {
        let (x, y) = (i % width, i / width);
        let v = ((x + y) as u32 + frame_nr) & max;
        match bpp {
            1 => px[0] = v as u8,
            2 => px.copy_from_slice(&(v as u16).to_le_bytes()),
            _ => px.copy_from_slice(&v.to_le_bytes()[..bpp.min(4)]),
        }
    }
}

/// Concatenated ROI data without metadata.
fn fill_rois(dst: &mut [u8], cfg: &AcqCfg, frame_nr: u32) {
    let bpp = cfg.bitmap_format.bytes_per_pixel();
    let max = max_sample(cfg.bit_depth);
    let mut offset = 0;
    for r in &cfg.regions {
        let len = r.pixel_count() * bpp;
        let end = (offset + len).min(dst.len());
        fill_pattern(&mut dst[offset..end], r.width() as usize, bpp, frame_nr, max);
        offset = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::metadata::FrameMetadata;
    use std::sync::mpsc;

    fn open_camera(config: FakeCameraConfig, hooks: FakeHooks) -> FakeCamera {
        let cam = FakeCamera::with_hooks(config, hooks);
        cam.open("FakeCamera", None).unwrap();
        cam
    }

    fn small() -> FakeCameraConfig {
        FakeCameraConfig {
            sensor_width: 64,
            sensor_height: 64,
            fps: 0.0,
            ..Default::default()
        }
    }

    fn collect(cam: &FakeCamera) -> Vec<Option<u32>> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        cam.start_exp(Arc::new(move |info: Option<&FrameInfo>| {
            let _ = tx.lock().send(info.map(|i| i.frame_nr));
            CallbackAction::Continue
        }))
        .unwrap();
        let mut out = Vec::new();
        while let Ok(nr) = rx.recv_timeout(Duration::from_secs(2)) {
            out.push(nr);
        }
        cam.stop_exp().unwrap();
        out
    }

    #[test]
    fn open_requires_matching_name() {
        let cam = FakeCamera::new(small());
        assert!(matches!(
            cam.open("Other", None),
            Err(AcqError::Camera(CameraError::NotFound(_)))
        ));
        assert!(matches!(
            cam.setup_exp(&Settings::default()),
            Err(AcqError::Camera(CameraError::NotOpen))
        ));
    }

    #[test]
    fn multi_roi_frame_bytes() {
        let cam = open_camera(
            FakeCameraConfig {
                sensor_width: 512,
                sensor_height: 512,
                ..small()
            },
            FakeHooks::default(),
        );
        let settings = Settings {
            regions: (0..4).map(|i| Region::from_rect(i * 128, 0, 128, 128)).collect(),
            ..Default::default()
        };
        assert_eq!(cam.setup_exp(&settings).unwrap(), 131_072);
        assert_eq!(cam.acq_cfg().unwrap().roi_count, 4);
    }

    #[test]
    fn region_outside_sensor_is_rejected() {
        let cam = open_camera(small(), FakeHooks::default());
        let settings = Settings {
            regions: vec![Region::from_rect(60, 0, 10, 10)],
            ..Default::default()
        };
        assert!(matches!(
            cam.setup_exp(&settings),
            Err(AcqError::Camera(CameraError::InvalidRoi(_)))
        ));
    }

    #[test]
    fn snap_delivers_frame_count_then_goes_inactive() {
        let cam = open_camera(small(), FakeHooks::default());
        cam.setup_exp(&Settings {
            acq_frame_count: 5,
            ..Default::default()
        })
        .unwrap();
        let seen = collect(&cam);
        assert_eq!(seen, (1..=5).map(Some).collect::<Vec<_>>());
        assert_eq!(cam.acq_status(), AcqStatus::Inactive);
        assert_eq!(cam.start_count(), 1);
        assert_eq!(cam.stop_count(), 1);
    }

    #[test]
    fn injected_sequence_and_null_callback() {
        let hooks = FakeHooks {
            frame_numbers: Some(vec![1, 2, 4, 3, 5]),
            null_callback_at: Some(2),
            ..Default::default()
        };
        let cam = open_camera(small(), hooks);
        cam.setup_exp(&Settings::default()).unwrap();
        let seen = collect(&cam);
        assert_eq!(seen, vec![Some(1), None, Some(4), Some(3), Some(5)]);
    }

    #[test]
    fn latest_frame_points_at_buffer_slot() {
        let cam = open_camera(small(), FakeHooks::default());
        cam.setup_exp(&Settings {
            acq_frame_count: 3,
            buffer_frame_count: 4,
            ..Default::default()
        })
        .unwrap();
        collect(&cam);

        let cfg = cam.acq_cfg().unwrap();
        let out = Frame::new(cfg, false).unwrap();
        assert!(cam.latest_frame(&out));
        assert_eq!(out.frame_nr(), 3);
        assert_eq!(cam.latest_frame_index(), Some(2));
        assert_eq!(cam.frame_index_of(&out), Some(2));
        assert!(out.with_data(|d| d.len()).is_some());
    }

    #[test]
    fn centroid_frames_carry_particle_metadata() {
        let cam = open_camera(
            FakeCameraConfig {
                particle_count: 2,
                ..small()
            },
            FakeHooks::default(),
        );
        cam.params().set_bool(ParamId::MetadataEnabled, true).unwrap();
        cam.params().set_bool(ParamId::CentroidsEnabled, true).unwrap();
        cam.params().set(ParamId::CentroidsMode, 1).unwrap();
        cam.setup_exp(&Settings {
            acq_frame_count: 1,
            ..Default::default()
        })
        .unwrap();
        collect(&cam);

        let frame = cam.frame_at(0).unwrap();
        let md = frame.metadata().unwrap().unwrap();
        assert_eq!(md.header.frame_nr, 1);
        assert_eq!(md.rois.len(), 2);
        let ids: Vec<_> = md
            .rois
            .iter()
            .map(|r| r.ext.get_u32(EXT_TAG_PARTICLE_ID).unwrap())
            .collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
        assert!(cam.acq_cfg().unwrap().frame_size_varies);
    }

    #[test]
    fn metadata_frames_decode_with_all_regions() {
        let cam = open_camera(small(), FakeHooks::default());
        cam.params().set_bool(ParamId::MetadataEnabled, true).unwrap();
        let regions = vec![Region::from_rect(0, 0, 8, 8), Region::from_rect(16, 16, 4, 4)];
        cam.setup_exp(&Settings {
            regions: regions.clone(),
            acq_frame_count: 1,
            ..Default::default()
        })
        .unwrap();
        collect(&cam);

        let bytes = cam.frame_at(0).unwrap().with_data(<[u8]>::to_vec).unwrap();
        let md = FrameMetadata::decode(&bytes).unwrap();
        let decoded: Vec<_> = md.rois.iter().map(|r| r.header.region).collect();
        assert_eq!(decoded, regions);
    }

    #[test]
    fn failure_hook_reports_failed_status() {
        let cam = open_camera(
            small(),
            FakeHooks {
                fail_after: Some(2),
                ..Default::default()
            },
        );
        cam.setup_exp(&Settings {
            acq_mode: daq_core::AcqMode::LiveCircBuffer,
            ..Default::default()
        })
        .unwrap();
        let seen = collect(&cam);
        assert_eq!(seen.len(), 2);
        assert_eq!(cam.acq_status(), AcqStatus::Failed);
    }

    #[test]
    fn trigger_mode_waits_for_software_trigger() {
        let cam = Arc::new(open_camera(small(), FakeHooks::default()));
        cam.params().set(ParamId::ExposureMode, 3).unwrap();
        cam.setup_exp(&Settings {
            acq_frame_count: 2,
            ..Default::default()
        })
        .unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        cam.start_exp(Arc::new(move |info: Option<&FrameInfo>| {
            let _ = tx.lock().send(info.map(|i| i.frame_nr));
            CallbackAction::Continue
        }))
        .unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        cam.trigger().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Some(1));
        cam.stop_exp().unwrap();
    }
}
