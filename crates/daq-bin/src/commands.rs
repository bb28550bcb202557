//! Subcommand implementations.

use crate::config::AppConfig;
use anyhow::{anyhow, bail, Context, Result};
use daq_acquisition::Acquisition;
use daq_core::region::Region;
use daq_core::settings::{AcqMode, Settings, StorageType};
use daq_driver_pvcam::{Camera, CameraInfo, FakeCamera};
use daq_storage::PrdReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Command-line overrides for `run`.
#[derive(Debug, Default, Clone, clap::Args)]
pub struct RunOverrides {
    /// Camera to open, by name.
    #[arg(long)]
    pub camera: Option<String>,

    /// Camera to open, by position in `list` output.
    #[arg(long)]
    pub cam_index: Option<u16>,

    /// Acquisition mode (snap-sequence, snap-circ-buffer, snap-time-lapse,
    /// live-circ-buffer, live-time-lapse).
    #[arg(long)]
    pub mode: Option<AcqMode>,

    /// Frames to acquire in snap modes.
    #[arg(long, short = 'n')]
    pub frames: Option<u32>,

    /// Frames in the camera's circular buffer.
    #[arg(long)]
    pub buffer_frames: Option<u32>,

    /// Exposure time in the configured resolution.
    #[arg(long, short = 'e')]
    pub exposure: Option<u32>,

    /// Region as `x,y,width,height`. Repeat for multiple ROIs.
    #[arg(long = "roi", value_parser = parse_region)]
    pub regions: Vec<Region>,

    /// Output format (none, prd, tiff, big-tiff).
    #[arg(long)]
    pub storage: Option<StorageType>,

    #[arg(long)]
    pub save_dir: Option<PathBuf>,

    #[arg(long)]
    pub save_prefix: Option<String>,

    /// Largest output file in bytes; 0 writes one frame per file.
    #[arg(long)]
    pub max_stack_size: Option<u64>,

    /// Upper bound on frames waiting to be written.
    #[arg(long)]
    pub max_save_queue: Option<usize>,

    /// Replace rejected camera parameters by their defaults.
    #[arg(long)]
    pub fix_user_input: bool,

    /// Frame rate of the synthetic camera; 0 runs as fast as possible.
    #[arg(long)]
    pub camera_fps: Option<f64>,
}

impl RunOverrides {
    pub fn apply(&self, cfg: &mut AppConfig) {
        let s = &mut cfg.acquisition;
        if let Some(name) = &self.camera {
            s.cam_name = Some(name.clone());
        }
        if let Some(index) = self.cam_index {
            s.cam_index = index;
        }
        if let Some(mode) = self.mode {
            s.acq_mode = mode;
        }
        if let Some(frames) = self.frames {
            s.acq_frame_count = frames;
        }
        if let Some(frames) = self.buffer_frames {
            s.buffer_frame_count = frames;
        }
        if let Some(exposure) = self.exposure {
            s.exposure = exposure;
        }
        if !self.regions.is_empty() {
            s.regions.clone_from(&self.regions);
        }
        if let Some(storage) = self.storage {
            s.storage_type = storage;
        }
        if let Some(dir) = &self.save_dir {
            s.save_dir.clone_from(dir);
        }
        if let Some(prefix) = &self.save_prefix {
            s.save_prefix.clone_from(prefix);
        }
        if let Some(size) = self.max_stack_size {
            s.max_stack_size = size;
        }
        if let Some(frames) = self.max_save_queue {
            s.max_save_queue_frames = Some(frames);
        }
        if self.fix_user_input {
            s.fix_user_input = true;
        }
        if let Some(fps) = self.camera_fps {
            cfg.camera.fps = fps;
        }
    }
}

/// Parse `x,y,width,height`.
pub fn parse_region(s: &str) -> Result<Region, String> {
    let parts: Vec<u16> = s
        .split(',')
        .map(|p| p.trim().parse::<u16>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid region '{s}': {e}"))?;
    let [x, y, w, h] = parts[..] else {
        return Err(format!("region '{s}' must be x,y,width,height"));
    };
    if w == 0 || h == 0 {
        return Err(format!("region '{s}' is empty"));
    }
    Ok(Region::from_rect(x, y, w, h))
}

/// Pick the camera named by `cam_name`, or the one at `cam_index`.
pub fn select_camera(cameras: &[CameraInfo], settings: &Settings) -> Result<CameraInfo> {
    let available = || {
        cameras
            .iter()
            .map(|c| format!("{}: {}", c.index, c.name))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let found = match &settings.cam_name {
        Some(name) => cameras.iter().find(|c| &c.name == name).ok_or_else(|| {
            anyhow!("no camera named '{name}' (available: {})", available())
        })?,
        None => cameras
            .iter()
            .find(|c| c.index == settings.cam_index)
            .ok_or_else(|| {
                anyhow!(
                    "no camera at index {} (available: {})",
                    settings.cam_index,
                    available()
                )
            })?,
    };
    Ok(found.clone())
}

pub fn list(cfg: &AppConfig) -> Result<()> {
    let camera = FakeCamera::new(cfg.camera.clone());
    let cameras = camera.enumerate().context("failed to enumerate cameras")?;
    if cameras.is_empty() {
        println!("No cameras found");
        return Ok(());
    }
    for cam in cameras {
        println!(
            "{}: {} ({}x{}, {}-bit)",
            cam.index, cam.name, cam.sensor_width, cam.sensor_height, cam.bit_depth
        );
    }
    Ok(())
}

/// Run one acquisition until it finishes or Ctrl-C stops it.
///
/// The first Ctrl-C stops the camera and lets queued frames be written, the
/// second abandons them.
pub async fn run(cfg: AppConfig) -> Result<()> {
    let settings: Settings = cfg.acquisition.clone();
    let camera = Arc::new(FakeCamera::new(cfg.camera.clone()));
    let cameras = camera.enumerate().context("failed to enumerate cameras")?;
    let selected = select_camera(&cameras, &settings)?;
    camera
        .open(&selected.name, None)
        .with_context(|| format!("failed to open camera '{}'", selected.name))?;

    let acq = Arc::new(Acquisition::new(camera.clone()));
    let started = {
        let acq = Arc::clone(&acq);
        tokio::task::spawn_blocking(move || acq.start(&settings))
            .await
            .context("start task failed")?
    };
    if let Err(err) = started {
        let _ = camera.close();
        return Err(err).context("failed to start acquisition");
    }

    let mut waiter = {
        let acq = Arc::clone(&acq);
        tokio::task::spawn_blocking(move || acq.wait_for_stop())
    };
    let mut interrupts = 0u32;
    let aborted = loop {
        tokio::select! {
            joined = &mut waiter => break joined.context("acquisition task failed")?,
            signal = tokio::signal::ctrl_c(), if interrupts < 2 => {
                signal.context("failed to listen for Ctrl-C")?;
                interrupts += 1;
                if interrupts == 1 {
                    warn!("Stopping acquisition, press Ctrl-C again to discard queued frames");
                    acq.request_abort(false);
                } else {
                    warn!("Discarding queued frames");
                    acq.request_abort(true);
                }
            }
        }
    };

    camera.close().context("failed to close camera")?;
    if let Some(summary) = acq.summary() {
        if let Some(err) = summary.error {
            bail!("acquisition failed: {err}");
        }
    }
    info!(aborted, "Done");
    Ok(())
}

/// Print the header and records of a PRD file.
pub fn inspect(path: &Path, max_records: Option<usize>) -> Result<()> {
    if path.extension().is_some_and(|e| e != "prd") {
        bail!("only PRD files can be inspected: {}", path.display());
    }
    let reader =
        PrdReader::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let h = reader.header();
    println!("{}", path.display());
    println!("  version       0x{:02x}", h.version);
    println!("  region        {}", h.region);
    println!("  bit depth     {}", h.bit_depth);
    println!("  frames        {}", h.frame_count);
    println!("  frame size    {} B", h.frame_size);
    println!("  alignment     {}", h.alignment);
    println!("  size varies   {}", h.frame_size_varies());
    if h.color_mask != 0 {
        println!("  color mask    {}", h.color_mask);
    }

    let limit = max_records.unwrap_or(usize::MAX);
    for (i, record) in reader.take(limit).enumerate() {
        let record = record.with_context(|| format!("failed to read record {i}"))?;
        let m = &record.meta;
        let trajectories = record
            .trajectories
            .as_ref()
            .map_or(String::new(), |t| format!(", {} trajectories", t.len()));
        println!(
            "  #{:<6} frame {:<8} bof {:<12} eof {:<12} rois {}{trajectories}",
            i,
            m.frame_number,
            m.timestamp_bof(),
            m.timestamp_eof(),
            m.roi_count
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_parsing() {
        assert_eq!(
            parse_region("10, 20, 30, 40").unwrap(),
            Region::from_rect(10, 20, 30, 40)
        );
        assert!(parse_region("1,2,3").is_err());
        assert!(parse_region("1,2,0,4").is_err());
        assert!(parse_region("a,b,c,d").is_err());
    }

    #[test]
    fn overrides_replace_config_values() {
        let mut cfg = AppConfig::default();
        let overrides = RunOverrides {
            mode: Some(AcqMode::LiveCircBuffer),
            frames: Some(42),
            storage: Some(StorageType::Prd),
            max_save_queue: Some(8),
            camera_fps: Some(0.0),
            regions: vec![Region::from_rect(0, 0, 64, 64)],
            ..Default::default()
        };
        overrides.apply(&mut cfg);
        assert_eq!(cfg.acquisition.acq_mode, AcqMode::LiveCircBuffer);
        assert_eq!(cfg.acquisition.acq_frame_count, 42);
        assert_eq!(cfg.acquisition.storage_type, StorageType::Prd);
        assert_eq!(cfg.acquisition.max_save_queue_frames, Some(8));
        assert_eq!(cfg.acquisition.regions.len(), 1);
        assert_eq!(cfg.camera.fps, 0.0);
        assert_eq!(cfg.acquisition.buffer_frame_count, 10);
        assert_eq!(cfg.acquisition.cam_name, None);
    }

    fn cameras() -> Vec<CameraInfo> {
        ["FakeCamera", "Spare"]
            .iter()
            .zip(0u16..)
            .map(|(name, index)| CameraInfo {
                index,
                name: (*name).to_string(),
                sensor_width: 64,
                sensor_height: 64,
                bit_depth: 16,
            })
            .collect()
    }

    #[test]
    fn camera_override_selects_by_name() {
        let mut cfg = AppConfig::default();
        RunOverrides {
            camera: Some("Spare".into()),
            ..Default::default()
        }
        .apply(&mut cfg);
        assert_eq!(cfg.acquisition.cam_name.as_deref(), Some("Spare"));
        let picked = select_camera(&cameras(), &cfg.acquisition).unwrap();
        assert_eq!(picked.index, 1);
    }

    #[test]
    fn camera_index_selects_when_no_name_given() {
        let settings = Settings {
            cam_index: 1,
            ..Default::default()
        };
        assert_eq!(select_camera(&cameras(), &settings).unwrap().name, "Spare");
        assert_eq!(
            select_camera(&cameras(), &Settings::default()).unwrap().name,
            "FakeCamera"
        );
    }

    #[test]
    fn unknown_camera_is_an_error() {
        let by_name = Settings {
            cam_name: Some("NoSuchCamera".into()),
            ..Default::default()
        };
        let err = select_camera(&cameras(), &by_name).unwrap_err().to_string();
        assert!(err.contains("no camera named 'NoSuchCamera'"));
        assert!(err.contains("0: FakeCamera, 1: Spare"));

        let by_index = Settings {
            cam_index: 7,
            ..Default::default()
        };
        let err = select_camera(&cameras(), &by_index).unwrap_err().to_string();
        assert!(err.contains("no camera at index 7"));
    }
}
