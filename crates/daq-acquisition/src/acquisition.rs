//! The acquisition pipeline.
//!
//! Three named threads plus the camera's callback thread:
//!
//! ```text
//! camera callback ──► to_process ──► acq stage ──► to_save ──► disk stage ──► FileSave
//!   (shallow copy)                  (deep copy,               (tracking,
//!                                    loss accounting)          stacking)
//!                         update stage: progress line every 500 ms, RAM budget
//! ```
//!
//! # Loss accounting
//!
//! - The callback never blocks. A frame it cannot queue (empty pool, full
//!   `to_process`) is *uncaught*; gaps in the numbers the callback sees go
//!   to the same drop log.
//! - The acq stage counts every gap against the highest frame number it has
//!   handled as *lost*, including frames before the first one. Frames that
//!   arrive with a number at or below that are dropped as out of order and
//!   not counted as lost.
//! - A full `to_save` drops the frame as *unsaved*.
//!
//! # Shutdown
//!
//! [`Acquisition::request_abort`] with `abort_buffered == false` stops the
//! camera and lets the disk stage drain `to_save`; with `true` queued frames
//! are abandoned. [`Acquisition::wait_for_stop`] joins the acq, disk and
//! update threads in that order.

use crate::configure::{applied_settings, configure_camera};
use crate::drop_log::DropLog;
use crate::fps_limiter::{FpsLimiter, FrameSink};
use crate::progress::{log_summary, ProgressPrinter, RunPhase};
use crate::queue::{FrameQueue, Wait};
use crate::ram::{save_queue_capacity, RamProbe};
use crate::stats::{Counters, PipelineStats, RunSummary};
use crate::tracking::{attach_to_camera_slot, clear_camera_slots, FrameTracker};
use daq_core::error::CameraError;
use daq_core::frame::{AcqCfg, FrameInfo};
use daq_core::frame_pool::{EnsureOps, FramePool, PooledFrame, SharedFrame};
use daq_core::settings::{Settings, StorageType};
use daq_core::{AcqError, AcqResult};
use daq_driver_pvcam::{AcqStatus, CallbackAction, Camera, EofCallback};
use daq_storage::{DefaultStorageFactory, FileSave, StorageFactory};
use daq_tracking::{NearestNeighbourFactory, TrackerFactory};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Longest the acq stage waits for a frame before polling the camera.
pub const ACQ_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Period of the update stage.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// Update ticks between save-queue capacity checks.
pub const RAM_CHECK_TICKS: u64 = 8;

/// Free frames the acq stage keeps in the pool for the callback.
pub const POOL_READY_FRAMES: usize = 3;

/// Capacity of `to_process` for a camera buffer of `buffer_frames`.
#[must_use]
pub fn process_queue_capacity(buffer_frames: u32) -> usize {
    (buffer_frames as usize / 2 + 1).max(2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqState {
    Idle,
    Starting,
    Running,
    /// No new frames are taken; queued frames are still being saved.
    Draining,
    Stopped,
}

impl fmt::Display for AcqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AcqState::Idle => "idle",
            AcqState::Starting => "starting",
            AcqState::Running => "running",
            AcqState::Draining => "draining",
            AcqState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

impl AcqState {
    /// Whether the pipeline may move from `self` to `next`. A stopped
    /// pipeline returns to `Idle` before it can start again.
    #[must_use]
    pub fn can_enter(self, next: AcqState) -> bool {
        use AcqState::{Draining, Idle, Running, Starting, Stopped};
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Idle | Running)
                | (Starting | Running, Draining)
                | (Stopped, Idle)
                | (Starting | Running | Draining, Stopped)
        )
    }
}

/// Move `state` to `next` if the transition is allowed.
fn advance(state: &mut AcqState, next: AcqState) -> bool {
    if !state.can_enter(next) {
        return false;
    }
    debug!(from = %state, to = %next, "Acquisition state changed");
    *state = next;
    true
}

// =============================================================================
// Thread signalling
// =============================================================================

/// One-shot readiness report from a freshly spawned stage.
#[derive(Default)]
struct Latch {
    state: Mutex<Option<bool>>,
    cv: Condvar,
}

impl Latch {
    fn set(&self, ok: bool) {
        *self.state.lock() = Some(ok);
        self.cv.notify_all();
    }

    fn wait(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if let Some(ok) = *state {
                return ok;
            }
            self.cv.wait(&mut state);
        }
    }
}

/// Wake-up for the update stage. Counts notifications so a wake-up sent
/// before the stage starts waiting is not lost.
#[derive(Default)]
struct Signal {
    count: Mutex<u64>,
    cv: Condvar,
}

impl Signal {
    fn notify(&self) {
        *self.count.lock() += 1;
        self.cv.notify_all();
    }

    fn wait(&self, seen: &mut u64, timeout: Duration) {
        let mut count = self.count.lock();
        if *count == *seen {
            self.cv.wait_for(&mut count, timeout);
        }
        *seen = *count;
    }
}

// =============================================================================
// Run: state shared by the stages of one acquisition
// =============================================================================

struct Run {
    settings: Settings,
    cfg: Arc<AcqCfg>,
    camera: Arc<dyn Camera>,
    pool: Arc<FramePool>,
    storage: Arc<dyn StorageFactory>,
    display: Option<FpsLimiter>,
    frames_per_file: usize,

    to_process: FrameQueue<PooledFrame>,
    to_save: FrameQueue<SharedFrame>,

    acq_abort: AtomicBool,
    disk_abort: AtomicBool,
    acq_done: AtomicBool,
    disk_done: AtomicBool,

    last_callback_nr: AtomicU32,
    counters: Counters,
    uncaught: Mutex<DropLog>,
    unsaved: Mutex<DropLog>,
    relinked_frames: AtomicU64,

    /// Message of the first fatal error.
    error: Mutex<Option<String>>,
    /// Error that kept the camera from starting, handed back by `start`.
    start_error: Mutex<Option<AcqError>>,

    state: Arc<Mutex<AcqState>>,
    update: Signal,
    started: Instant,
}

impl Run {
    fn request_abort(&self, abort_buffered: bool) {
        let first = !self.acq_abort.swap(true, Ordering::SeqCst);
        let first_hard = abort_buffered && !self.disk_abort.swap(true, Ordering::SeqCst);
        if first || first_hard {
            debug!(abort_buffered, "Abort requested");
        }
        self.enter_draining();
        self.to_process.notify_all();
        if abort_buffered {
            self.to_save.notify_all();
        }
        self.update.notify();
    }

    /// Record a fatal error and abort without draining.
    fn fail(&self, err: impl fmt::Display) {
        let msg = err.to_string();
        error!(error = %msg, "Acquisition failed");
        self.error.lock().get_or_insert(msg);
        self.request_abort(true);
    }

    fn enter_draining(&self) {
        advance(&mut self.state.lock(), AcqState::Draining);
    }

    fn is_finished(&self, last_handling_nr: u32) -> bool {
        self.settings
            .frame_limit()
            .is_some_and(|limit| last_handling_nr >= limit)
    }

    fn phase(&self) -> RunPhase {
        if self.acq_abort.load(Ordering::SeqCst) {
            RunPhase::Aborting
        } else if self.acq_done.load(Ordering::SeqCst) {
            RunPhase::Writing
        } else {
            RunPhase::Acquiring
        }
    }

    fn stats(&self) -> PipelineStats {
        PipelineStats {
            acq: self.counters.acq(self.uncaught.lock().stats()),
            disk: self.counters.disk(
                self.unsaved.lock().stats(),
                self.relinked_frames.load(Ordering::Relaxed),
            ),
            queued_to_process: self.to_process.len(),
            queued_to_save: self.to_save.len(),
            save_capacity: self.to_save.capacity(),
            elapsed: self.started.elapsed(),
        }
    }

    fn summary(&self) -> RunSummary {
        let stats = self.stats();
        let error = self.error.lock().clone();
        RunSummary {
            acq: stats.acq,
            disk: stats.disk,
            aborted: error.is_some()
                || self.acq_abort.load(Ordering::SeqCst)
                || self.disk_abort.load(Ordering::SeqCst),
            error,
            elapsed: stats.elapsed,
        }
    }

    // -------------------------------------------------------------------------
    // Callback stage
    // -------------------------------------------------------------------------

    fn on_eof(&self, info: Option<&FrameInfo>) -> CallbackAction {
        let Some(info) = info else {
            self.fail("camera delivered an end-of-frame notification without frame info");
            return CallbackAction::Abort;
        };
        if self.acq_abort.load(Ordering::SeqCst) {
            return CallbackAction::Abort;
        }
        let frame_nr = info.frame_nr;
        if !info.is_valid() {
            trace!("Invalid capture reported by camera");
            Counters::add(&self.counters.uncaught, 1);
            return CallbackAction::Continue;
        }

        let last = self.last_callback_nr.load(Ordering::Relaxed);
        if frame_nr > last.saturating_add(1) {
            self.uncaught.lock().record_range(last + 1, frame_nr - 1);
        }
        if frame_nr > last {
            self.last_callback_nr.store(frame_nr, Ordering::Relaxed);
        }

        let Some(frame) = self.pool.take() else {
            trace!(frame_nr, "Frame pool empty");
            self.uncaught_frame(frame_nr);
            return CallbackAction::Continue;
        };
        if !self.camera.latest_frame(&frame) {
            trace!(frame_nr, "Latest frame unavailable");
            self.uncaught_frame(frame_nr);
            return CallbackAction::Continue;
        }
        if self.to_process.push(frame).is_err() {
            trace!(frame_nr, "Process queue full");
            self.uncaught_frame(frame_nr);
        }
        CallbackAction::Continue
    }

    fn uncaught_frame(&self, frame_nr: u32) {
        Counters::add(&self.counters.uncaught, 1);
        self.uncaught.lock().record(frame_nr);
    }

    // -------------------------------------------------------------------------
    // Acq stage
    // -------------------------------------------------------------------------

    fn acq_loop(self: &Arc<Self>, ready: &Latch) {
        let weak = Arc::downgrade(self);
        let on_eof: EofCallback = Arc::new(move |info: Option<&FrameInfo>| match weak.upgrade() {
            Some(run) => run.on_eof(info),
            None => CallbackAction::Abort,
        });
        if let Err(err) = self.camera.start_exp(on_eof) {
            error!(error = %err, "Failed to start camera");
            self.error.lock().get_or_insert(err.to_string());
            *self.start_error.lock() = Some(err);
            self.request_abort(true);
            self.finish_acq();
            ready.set(false);
            return;
        }
        ready.set(true);

        let mut last_handling_nr = 0u32;
        while !self.acq_abort.load(Ordering::SeqCst) {
            let waited = self.to_process.wait_pop(Some(ACQ_WAIT_TIMEOUT), || {
                self.acq_abort.load(Ordering::SeqCst)
            });
            match waited {
                Wait::Item(frame) => {
                    last_handling_nr = self.handle_new_frame(frame, last_handling_nr);
                }
                Wait::Stopped => break,
                Wait::TimedOut => {
                    let status = self.camera.acq_status();
                    if status != AcqStatus::Active {
                        warn!(%status, "Camera stopped delivering frames");
                        self.request_abort(false);
                        break;
                    }
                    debug!(timeout = ?ACQ_WAIT_TIMEOUT, "No frame received");
                    continue;
                }
            }
            if self.is_finished(last_handling_nr) {
                info!(frames = last_handling_nr, "All frames acquired");
                break;
            }
            if !self.pool.ensure_ready(POOL_READY_FRAMES, EnsureOps::empty()) {
                warn!("Could not refill frame pool");
            }
        }

        if let Err(err) = self.camera.stop_exp() {
            warn!(error = %err, "Failed to stop camera");
        }
        let discarded = self.to_process.clear();
        if discarded > 0 {
            debug!(discarded, "Discarded frames not yet handled");
        }
        self.finish_acq();
    }

    /// Deep-copy one frame and move it to the save queue. Returns the new
    /// highest handled frame number.
    fn handle_new_frame(&self, frame: PooledFrame, last_handling_nr: u32) -> u32 {
        let frame_nr = frame.frame_nr();
        let copied = frame.copy_data();

        if frame_nr <= last_handling_nr {
            trace!(frame_nr, last_handling_nr, "Out-of-order frame dropped");
            Counters::add(&self.counters.out_of_order, 1);
            return last_handling_nr;
        }
        let gap = frame_nr - last_handling_nr - 1;
        if gap > 0 {
            debug!(frame_nr, lost = gap, "Frames lost");
            Counters::add(&self.counters.lost, u64::from(gap));
        }
        self.counters
            .last_handling_nr
            .store(frame_nr, Ordering::Relaxed);

        if let Err(err) = copied {
            debug!(frame_nr, error = %err, "Frame overwritten before copy");
            Counters::add(&self.counters.lost, 1);
            return frame_nr;
        }
        Counters::add(&self.counters.acquired, 1);
        Counters::add(&self.counters.bytes_acquired, self.cfg.frame_bytes as u64);

        let frame: SharedFrame = Arc::new(frame);
        if !self.settings.is_tracking() {
            if let Some(display) = &self.display {
                display.offer(Some(Arc::clone(&frame)));
            }
        }
        if self.to_save.push(frame).is_err() {
            trace!(frame_nr, "Save queue full");
            Counters::add(&self.counters.unsaved, 1);
            self.unsaved.lock().record(frame_nr);
        }
        frame_nr
    }

    fn finish_acq(&self) {
        self.acq_done.store(true, Ordering::SeqCst);
        self.enter_draining();
        self.to_save.notify_all();
        self.update.notify();
    }

    // -------------------------------------------------------------------------
    // Disk stage
    // -------------------------------------------------------------------------

    fn disk_loop(&self, ready: &Latch, mut tracker: Option<FrameTracker>) {
        ready.set(true);
        let mut file: Option<Box<dyn FileSave>> = None;
        let mut rel_index = 0usize;

        loop {
            let waited = self.to_save.wait_pop(None, || {
                self.disk_abort.load(Ordering::SeqCst) || self.acq_done.load(Ordering::SeqCst)
            });
            let Wait::Item(frame) = waited else {
                break;
            };
            if self.disk_abort.load(Ordering::SeqCst) {
                break;
            }
            Counters::add(&self.counters.processed, 1);
            if let Err(err) = self.save_frame(&frame, tracker.as_mut(), &mut file, &mut rel_index)
            {
                self.fail(err);
                break;
            }
        }

        if let Some(mut open) = file.take() {
            match open.close() {
                Ok(()) => Counters::add(&self.counters.files_written, 1),
                Err(err) => self.fail(err),
            }
        }
        if let Some(tracker) = tracker {
            self.relinked_frames
                .store(tracker.relinked_frames(), Ordering::Relaxed);
        }
        self.disk_done.store(true, Ordering::SeqCst);
        self.update.notify();
    }

    fn save_frame(
        &self,
        frame: &SharedFrame,
        tracker: Option<&mut FrameTracker>,
        file: &mut Option<Box<dyn FileSave>>,
        rel_index: &mut usize,
    ) -> AcqResult<()> {
        let frame_nr = frame.frame_nr();
        match tracker {
            Some(tracker) => {
                let trajectories = tracker.track(frame)?;
                attach_to_camera_slot(self.camera.as_ref(), frame, trajectories);
                if let Some(display) = &self.display {
                    display.offer(Some(Arc::clone(frame)));
                }
            }
            None => {
                if self.acq_done.load(Ordering::SeqCst) {
                    if let Some(display) = &self.display {
                        display.offer(None);
                    }
                }
            }
        }

        if !self.settings.should_save(frame_nr.saturating_sub(1)) {
            return Ok(());
        }
        if *rel_index % self.frames_per_file == 0 {
            if let Some(mut done) = file.take() {
                done.close()?;
                Counters::add(&self.counters.files_written, 1);
            }
            let index = *rel_index / self.frames_per_file;
            let mut next = self.storage.create(index, &self.cfg, &self.settings)?;
            next.open()?;
            debug!(path = %next.path().display(), "Opened output file");
            *file = Some(next);
        }
        let Some(out) = file.as_mut() else {
            return Err(AcqError::state("no output file open"));
        };
        out.write_frame(frame)?;
        *rel_index += 1;
        Counters::add(&self.counters.saved, 1);
        Counters::add(&self.counters.bytes_saved, self.cfg.frame_bytes as u64);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Update stage
    // -------------------------------------------------------------------------

    fn update_loop(&self, ready: &Latch) {
        ready.set(true);
        let mut printer = ProgressPrinter::new();
        let mut probe = RamProbe::new();
        let mut seen = 0u64;
        let mut tick = 0u64;

        loop {
            self.update.wait(&mut seen, UPDATE_INTERVAL);
            let acq_done = self.acq_done.load(Ordering::SeqCst);
            if acq_done && self.disk_done.load(Ordering::SeqCst) {
                break;
            }
            tick += 1;
            if !acq_done && tick % RAM_CHECK_TICKS == 0 {
                let capacity = save_queue_capacity(
                    probe.sample(),
                    self.cfg.frame_bytes,
                    self.settings.max_save_queue_frames,
                );
                if capacity != self.to_save.capacity() {
                    debug!(capacity, "Save queue resized");
                    self.to_save.set_capacity(capacity);
                }
            }
            printer.print(&self.stats(), self.phase());
        }
        printer.print(&self.stats(), self.phase());
    }
}

// =============================================================================
// Acquisition
// =============================================================================

#[derive(Default)]
struct Threads {
    acq: Option<JoinHandle<()>>,
    disk: Option<JoinHandle<()>>,
    update: Option<JoinHandle<()>>,
}

fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> AcqResult<JoinHandle<()>> {
    Ok(std::thread::Builder::new().name(name.to_string()).spawn(f)?)
}

/// Drives one camera through repeated acquisitions.
///
/// Storage writers, tracking backends and the display consumer are
/// injected; defaults are the PRD/TIFF writers and the nearest-neighbour
/// tracker.
pub struct Acquisition {
    camera: Arc<dyn Camera>,
    storage: Arc<dyn StorageFactory>,
    trackers: Arc<dyn TrackerFactory>,
    display: Option<Arc<dyn FrameSink>>,
    pool: Arc<FramePool>,
    state: Arc<Mutex<AcqState>>,
    run: Mutex<Option<Arc<Run>>>,
    threads: Mutex<Threads>,
    last_summary: Mutex<Option<RunSummary>>,
}

impl Acquisition {
    #[must_use]
    pub fn new(camera: Arc<dyn Camera>) -> Self {
        Self {
            camera,
            storage: Arc::new(DefaultStorageFactory::default()),
            trackers: Arc::new(NearestNeighbourFactory),
            display: None,
            pool: Arc::new(FramePool::new()),
            state: Arc::new(Mutex::new(AcqState::Idle)),
            run: Mutex::new(None),
            threads: Mutex::new(Threads::default()),
            last_summary: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn StorageFactory>) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn with_trackers(mut self, trackers: Arc<dyn TrackerFactory>) -> Self {
        self.trackers = trackers;
        self
    }

    #[must_use]
    pub fn with_display(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.display = Some(sink);
        self
    }

    #[must_use]
    pub fn camera(&self) -> &Arc<dyn Camera> {
        &self.camera
    }

    #[must_use]
    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    #[must_use]
    pub fn state(&self) -> AcqState {
        *self.state.lock()
    }

    /// True from `start` until `wait_for_stop` has joined every thread.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            AcqState::Starting | AcqState::Running | AcqState::Draining
        )
    }

    /// Live statistics of the current run.
    #[must_use]
    pub fn stats(&self) -> Option<PipelineStats> {
        self.run.lock().as_ref().map(|run| run.stats())
    }

    /// Outcome of the last finished run.
    #[must_use]
    pub fn summary(&self) -> Option<RunSummary> {
        self.last_summary.lock().clone()
    }

    /// Configure the camera and launch the pipeline.
    ///
    /// On error no pipeline thread is left running.
    pub fn start(&self, settings: &Settings) -> AcqResult<()> {
        {
            let mut state = self.state.lock();
            if *state == AcqState::Stopped {
                advance(&mut state, AcqState::Idle);
            }
            if !advance(&mut state, AcqState::Starting) {
                return Err(AcqError::state(format!("acquisition is {}", *state)));
            }
        }

        let run = match self.prepare(settings) {
            Ok(run) => run,
            Err(err) => {
                advance(&mut self.state.lock(), AcqState::Idle);
                return Err(err);
            }
        };
        *self.run.lock() = Some(Arc::clone(&run));

        if let Err(err) = self.launch(&run) {
            run.request_abort(true);
            self.wait_for_stop();
            return Err(err);
        }
        let mut state = self.state.lock();
        if *state == AcqState::Starting {
            advance(&mut state, AcqState::Running);
        }
        Ok(())
    }

    fn prepare(&self, settings: &Settings) -> AcqResult<Arc<Run>> {
        settings.validate()?;
        if !self.camera.is_open() {
            return Err(CameraError::NotOpen.into());
        }
        configure_camera(self.camera.as_ref(), settings)?;
        let settings = &applied_settings(self.camera.as_ref(), settings);
        let frame_bytes = self.camera.setup_exp(settings)?;
        let cfg = self
            .camera
            .acq_cfg()
            .ok_or_else(|| AcqError::state("camera reported no acquisition configuration"))?;

        let frames_per_file = if settings.storage_type == StorageType::None {
            1
        } else {
            self.storage.frames_per_file(&cfg, settings)?
        };

        self.pool.setup(Arc::clone(&cfg), true);
        let process_capacity = process_queue_capacity(settings.buffer_frame_count);
        if !self.pool.ensure_ready(
            process_capacity + POOL_READY_FRAMES,
            EnsureOps::SHRINK | EnsureOps::PREFETCH,
        ) {
            return Err(AcqError::state(format!(
                "could not allocate {} frames of {frame_bytes} bytes",
                process_capacity + POOL_READY_FRAMES
            )));
        }
        let save_capacity = save_queue_capacity(
            RamProbe::new().sample(),
            frame_bytes,
            settings.max_save_queue_frames,
        );

        info!(
            mode = %settings.acq_mode,
            storage = %settings.storage_type,
            frame_bytes,
            roi_count = cfg.roi_count,
            process_capacity,
            save_capacity,
            frames_per_file,
            tracking = settings.is_tracking(),
            "Starting acquisition"
        );

        Ok(Arc::new(Run {
            settings: settings.clone(),
            cfg,
            camera: Arc::clone(&self.camera),
            pool: Arc::clone(&self.pool),
            storage: Arc::clone(&self.storage),
            display: self
                .display
                .as_ref()
                .map(|sink| FpsLimiter::new(Arc::clone(sink), settings.display_fps)),
            frames_per_file,
            to_process: FrameQueue::new(process_capacity),
            to_save: FrameQueue::new(save_capacity),
            acq_abort: AtomicBool::new(false),
            disk_abort: AtomicBool::new(false),
            acq_done: AtomicBool::new(false),
            disk_done: AtomicBool::new(false),
            last_callback_nr: AtomicU32::new(0),
            counters: Counters::default(),
            uncaught: Mutex::new(DropLog::new()),
            unsaved: Mutex::new(DropLog::new()),
            relinked_frames: AtomicU64::new(0),
            error: Mutex::new(None),
            start_error: Mutex::new(None),
            state: Arc::clone(&self.state),
            update: Signal::default(),
            started: Instant::now(),
        }))
    }

    /// Spawn disk, update and acq stages, each waiting for the previous one
    /// to report ready.
    fn launch(&self, run: &Arc<Run>) -> AcqResult<()> {
        let tracker = if run.settings.is_tracking() {
            Some(FrameTracker::new(
                self.trackers.as_ref(),
                &run.settings.tracking,
            )?)
        } else {
            None
        };

        let ready = Arc::new(Latch::default());
        let handle = spawn("acq-disk", {
            let run = Arc::clone(run);
            let ready = Arc::clone(&ready);
            move || run.disk_loop(&ready, tracker)
        })?;
        self.threads.lock().disk = Some(handle);
        if !ready.wait() {
            return Err(AcqError::state("disk stage failed to start"));
        }

        let ready = Arc::new(Latch::default());
        let handle = spawn("acq-update", {
            let run = Arc::clone(run);
            let ready = Arc::clone(&ready);
            move || run.update_loop(&ready)
        })?;
        self.threads.lock().update = Some(handle);
        if !ready.wait() {
            return Err(AcqError::state("update stage failed to start"));
        }

        let ready = Arc::new(Latch::default());
        let handle = spawn("acq-frames", {
            let run = Arc::clone(run);
            let ready = Arc::clone(&ready);
            move || run.acq_loop(&ready)
        })?;
        self.threads.lock().acq = Some(handle);
        if !ready.wait() {
            return Err(run
                .start_error
                .lock()
                .take()
                .unwrap_or_else(|| AcqError::state("acquisition stage failed to start")));
        }
        Ok(())
    }

    /// Stop the run. With `abort_buffered` frames waiting to be saved are
    /// abandoned. Idempotent and safe from any thread.
    pub fn request_abort(&self, abort_buffered: bool) {
        if let Some(run) = self.run.lock().as_ref() {
            run.request_abort(abort_buffered);
        }
    }

    /// Join the acq, disk and update threads and release the run.
    ///
    /// Returns `true` if the run was aborted or failed, `false` if it
    /// finished on its own or nothing was running.
    pub fn wait_for_stop(&self) -> bool {
        let threads = std::mem::take(&mut *self.threads.lock());
        let Some(run) = self.run.lock().clone() else {
            return false;
        };

        for (stage, handle) in [
            ("acq", threads.acq),
            ("disk", threads.disk),
            ("update", threads.update),
        ] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    run.fail(format!("{stage} stage panicked"));
                }
            }
        }

        if run.disk_abort.load(Ordering::SeqCst) {
            clear_camera_slots(
                self.camera.as_ref(),
                run.settings.buffer_frame_count as usize,
            );
        }
        run.to_process.clear();
        run.to_save.clear();

        let summary = run.summary();
        log_summary(&summary);
        *self.run.lock() = None;
        self.pool.shrink(POOL_READY_FRAMES);
        advance(&mut self.state.lock(), AcqState::Stopped);
        let aborted = summary.aborted;
        *self.last_summary.lock() = Some(summary);
        aborted
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if self.run.lock().is_some() {
            self.request_abort(true);
            self.wait_for_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_queue_capacity_clamps() {
        assert_eq!(process_queue_capacity(1), 2);
        assert_eq!(process_queue_capacity(4), 3);
        assert_eq!(process_queue_capacity(100), 51);
    }

    #[test]
    fn restart_passes_through_idle() {
        use AcqState::{Draining, Idle, Running, Starting, Stopped};
        assert!(!Stopped.can_enter(Starting));
        assert!(Stopped.can_enter(Idle));
        assert!(Idle.can_enter(Starting));

        let mut state = Stopped;
        assert!(!advance(&mut state, Starting));
        assert_eq!(state, Stopped);
        assert!(advance(&mut state, Idle));
        assert!(advance(&mut state, Starting));

        assert!(Starting.can_enter(Running));
        assert!(Running.can_enter(Draining));
        assert!(!Draining.can_enter(Running));
        assert!(Draining.can_enter(Stopped));
        assert!(!Idle.can_enter(Stopped));
    }

    #[test]
    fn latch_reports_value() {
        let latch = Arc::new(Latch::default());
        let setter = {
            let latch = Arc::clone(&latch);
            std::thread::spawn(move || latch.set(false))
        };
        assert!(!latch.wait());
        setter.join().unwrap();
    }

    #[test]
    fn signal_sent_before_wait_is_kept() {
        let signal = Signal::default();
        let mut seen = 0;
        signal.notify();
        let started = Instant::now();
        signal.wait(&mut seen, Duration::from_secs(5));
        assert_eq!(seen, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
