//! Acquisition settings.
//!
//! [`Settings`] is the read-only configuration the pipeline consumes. It is
//! deserialised with serde (every field has a default) and layered by the
//! binary with figment: defaults, then a TOML file, then `PVCAM_STREAM_*`
//! environment variables, then command-line overrides.
//!
//! After loading, [`Settings::validate`] checks the cross-field rules that
//! serde cannot express, such as sequence length vs buffer depth or
//! time-lapse requirements for variable timed mode.

use crate::error::{AcqError, AcqResult};
use crate::region::Region;
use daq_pool::AllocatorType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// =============================================================================
// Enumerations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AcqMode {
    /// Fixed-length sequence held entirely in the camera buffer.
    #[default]
    SnapSequence,
    /// Fixed number of frames through the circular buffer.
    SnapCircBuffer,
    /// Fixed number of single-frame exposures with a delay in between.
    SnapTimeLapse,
    /// Continuous circular-buffer streaming until aborted.
    LiveCircBuffer,
    /// Continuous time-lapse until aborted.
    LiveTimeLapse,
}

impl AcqMode {
    pub const ALL: [AcqMode; 5] = [
        AcqMode::SnapSequence,
        AcqMode::SnapCircBuffer,
        AcqMode::SnapTimeLapse,
        AcqMode::LiveCircBuffer,
        AcqMode::LiveTimeLapse,
    ];

    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, AcqMode::LiveCircBuffer | AcqMode::LiveTimeLapse)
    }

    #[must_use]
    pub fn is_time_lapse(self) -> bool {
        matches!(self, AcqMode::SnapTimeLapse | AcqMode::LiveTimeLapse)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AcqMode::SnapSequence => "snap-sequence",
            AcqMode::SnapCircBuffer => "snap-circ-buffer",
            AcqMode::SnapTimeLapse => "snap-time-lapse",
            AcqMode::LiveCircBuffer => "live-circ-buffer",
            AcqMode::LiveTimeLapse => "live-time-lapse",
        }
    }
}

impl fmt::Display for AcqMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AcqMode {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| AcqError::config(format!("unknown acquisition mode '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageType {
    #[default]
    None,
    Prd,
    Tiff,
    BigTiff,
}

impl StorageType {
    pub const ALL: [StorageType; 4] = [
        StorageType::None,
        StorageType::Prd,
        StorageType::Tiff,
        StorageType::BigTiff,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StorageType::None => "none",
            StorageType::Prd => "prd",
            StorageType::Tiff => "tiff",
            StorageType::BigTiff => "big-tiff",
        }
    }

    /// File extension without the dot. `None` when nothing is written.
    #[must_use]
    pub fn extension(self) -> Option<&'static str> {
        match self {
            StorageType::None => None,
            StorageType::Prd => Some("prd"),
            StorageType::Tiff | StorageType::BigTiff => Some("tiff"),
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| AcqError::config(format!("unknown storage type '{s}'")))
    }
}

/// Exposure timing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExposureMode {
    #[default]
    Timed,
    /// Each exposure waits for a software or hardware trigger.
    Trigger,
    /// Exposure time cycles through `vtm_exposures`.
    VariableTimed,
}

impl ExposureMode {
    pub fn to_pvcam(self) -> i32 {
        match self {
            ExposureMode::Timed => 0,
            ExposureMode::Trigger => 3,
            ExposureMode::VariableTimed => 5,
        }
    }

    pub fn from_pvcam(value: i32) -> Self {
        match value {
            3 => ExposureMode::Trigger,
            5 => ExposureMode::VariableTimed,
            _ => ExposureMode::Timed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExposureResolution {
    #[default]
    Milliseconds,
    Microseconds,
    Seconds,
}

impl ExposureResolution {
    pub fn from_pvcam(value: i32) -> Self {
        match value {
            1 => ExposureResolution::Microseconds,
            2 => ExposureResolution::Seconds,
            _ => ExposureResolution::Milliseconds,
        }
    }

    pub fn to_pvcam(self) -> i32 {
        match self {
            ExposureResolution::Milliseconds => 0,
            ExposureResolution::Microseconds => 1,
            ExposureResolution::Seconds => 2,
        }
    }

    /// Length of one exposure unit in nanoseconds.
    #[must_use]
    pub fn unit_ns(self) -> u64 {
        match self {
            ExposureResolution::Microseconds => 1_000,
            ExposureResolution::Milliseconds => 1_000_000,
            ExposureResolution::Seconds => 1_000_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClearMode {
    Never,
    PreExposure,
    PreSequence,
    PostSequence,
    PrePostSequence,
    PreExposurePostSequence,
}

impl ClearMode {
    pub fn from_pvcam(value: i32) -> Self {
        match value {
            0 => ClearMode::Never,
            2 => ClearMode::PreSequence,
            3 => ClearMode::PostSequence,
            4 => ClearMode::PrePostSequence,
            5 => ClearMode::PreExposurePostSequence,
            _ => ClearMode::PreExposure,
        }
    }

    pub fn to_pvcam(self) -> i32 {
        match self {
            ClearMode::Never => 0,
            ClearMode::PreExposure => 1,
            ClearMode::PreSequence => 2,
            ClearMode::PostSequence => 3,
            ClearMode::PrePostSequence => 4,
            ClearMode::PreExposurePostSequence => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CentroidsMode {
    #[default]
    Locate,
    Track,
    Blob,
}

impl CentroidsMode {
    pub fn from_pvcam(value: i32) -> Self {
        match value {
            1 => CentroidsMode::Track,
            2 => CentroidsMode::Blob,
            _ => CentroidsMode::Locate,
        }
    }

    pub fn to_pvcam(self) -> i32 {
        match self {
            CentroidsMode::Locate => 0,
            CentroidsMode::Track => 1,
            CentroidsMode::Blob => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DebayerAlgorithm {
    #[default]
    Nearest,
    Bilinear,
}

// =============================================================================
// Setting groups
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentroidsSettings {
    pub enabled: bool,
    pub mode: CentroidsMode,
    pub radius: u16,
    pub count: u16,
}

impl Default for CentroidsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: CentroidsMode::Locate,
            radius: 5,
            count: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    /// Frames a lost particle may stay unmatched before its id is retired.
    pub link_frames: u16,
    /// Maximum centroid displacement (pixels) between linked observations.
    pub max_distance: u16,
    pub cpu_only: bool,
    /// History depth kept per trajectory, in frames.
    pub trajectory_duration: u16,
    /// Upper bound on simultaneously tracked particles.
    pub max_particles: u32,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            link_frames: 10,
            max_distance: 25,
            cpu_only: false,
            trajectory_duration: 10,
            max_particles: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorSettings {
    pub wb_scale_red: f32,
    pub wb_scale_green: f32,
    pub wb_scale_blue: f32,
    pub debayer_alg: DebayerAlgorithm,
}

impl Default for ColorSettings {
    fn default() -> Self {
        Self {
            wb_scale_red: 1.0,
            wb_scale_green: 1.0,
            wb_scale_blue: 1.0,
            debayer_alg: DebayerAlgorithm::Nearest,
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Camera to open, by position in the driver's camera list.
    pub cam_index: u16,
    /// Camera to open, by name. Takes precedence over `cam_index`.
    pub cam_name: Option<String>,
    /// Frames to acquire in snap modes.
    pub acq_frame_count: u32,
    /// Depth of the camera's circular buffer, in frames.
    pub buffer_frame_count: u32,
    pub allocator: AllocatorType,
    /// Output regions; empty means full sensor.
    pub regions: Vec<Region>,
    pub exposure: u32,
    pub exposure_resolution: ExposureResolution,
    pub exposure_mode: ExposureMode,
    pub vtm_exposures: Vec<u16>,
    pub time_lapse_delay_ms: u32,
    pub acq_mode: AcqMode,

    pub storage_type: StorageType,
    pub save_dir: PathBuf,
    pub save_prefix: String,
    pub save_digits: u8,
    /// Save only the first N frames (0 with `save_last == 0` saves all).
    pub save_first: u32,
    /// Save only the last N frames of a snap sequence.
    pub save_last: u32,
    /// Byte cap per output file; 0 writes one frame per file.
    pub max_stack_size: u64,
    /// Hard cap on the RAM-derived save queue capacity.
    pub max_save_queue_frames: Option<usize>,

    /// Replace rejected parameter values with the camera default.
    pub fix_user_input: bool,
    pub metadata_enabled: bool,
    pub centroids: CentroidsSettings,
    pub tracking: TrackingSettings,
    pub color: ColorSettings,

    pub readout_port: Option<i32>,
    pub speed_index: Option<i32>,
    pub gain_index: Option<i32>,
    pub clear_mode: Option<ClearMode>,

    /// Frames per second forwarded to the display sink.
    pub display_fps: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cam_index: 0,
            cam_name: None,
            acq_frame_count: 10,
            buffer_frame_count: 10,
            allocator: AllocatorType::Default,
            regions: Vec::new(),
            exposure: 10,
            exposure_resolution: ExposureResolution::Milliseconds,
            exposure_mode: ExposureMode::Timed,
            vtm_exposures: Vec::new(),
            time_lapse_delay_ms: 0,
            acq_mode: AcqMode::SnapSequence,
            storage_type: StorageType::None,
            save_dir: PathBuf::from("."),
            save_prefix: String::new(),
            save_digits: 3,
            save_first: 0,
            save_last: 0,
            max_stack_size: 0,
            max_save_queue_frames: None,
            fix_user_input: false,
            metadata_enabled: false,
            centroids: CentroidsSettings::default(),
            tracking: TrackingSettings::default(),
            color: ColorSettings::default(),
            readout_port: None,
            speed_index: None,
            gain_index: None,
            clear_mode: None,
            display_fps: 20.0,
        }
    }
}

impl Settings {
    /// Particle tracking runs in the disk stage.
    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.metadata_enabled && self.centroids.enabled && self.centroids.mode == CentroidsMode::Track
    }

    /// Number of frames the run ends after, `None` for live modes.
    #[must_use]
    pub fn frame_limit(&self) -> Option<u32> {
        (!self.acq_mode.is_live()).then_some(self.acq_frame_count)
    }

    /// Whether the frame at 0-based acquisition index `index` is saved.
    #[must_use]
    pub fn should_save(&self, index: u32) -> bool {
        if self.storage_type == StorageType::None {
            return false;
        }
        if self.save_first == 0 && self.save_last == 0 {
            return true;
        }
        if index < self.save_first {
            return true;
        }
        self.save_last > 0 && index >= self.acq_frame_count.saturating_sub(self.save_last)
    }

    /// Path of output file number `index`.
    #[must_use]
    pub fn file_name(&self, index: usize) -> Option<PathBuf> {
        let ext = self.storage_type.extension()?;
        let digits = usize::from(self.save_digits);
        Some(
            self.save_dir
                .join(format!("{}{index:0digits$}.{ext}", self.save_prefix)),
        )
    }

    /// Check cross-field rules.
    pub fn validate(&self) -> AcqResult<()> {
        if self.buffer_frame_count == 0 {
            return Err(AcqError::config("buffer_frame_count must be at least 1"));
        }
        if !self.acq_mode.is_live() && self.acq_frame_count == 0 {
            return Err(AcqError::config("acq_frame_count must be at least 1"));
        }
        if self.acq_mode == AcqMode::SnapSequence && self.acq_frame_count > self.buffer_frame_count
        {
            return Err(AcqError::config(format!(
                "snap-sequence needs acq_frame_count ({}) <= buffer_frame_count ({})",
                self.acq_frame_count, self.buffer_frame_count
            )));
        }
        if self.acq_mode.is_live() && self.save_last > 0 {
            return Err(AcqError::config("save_last cannot be used in live modes"));
        }
        if self.exposure_mode == ExposureMode::VariableTimed {
            if !self.acq_mode.is_time_lapse() {
                return Err(AcqError::config(
                    "variable timed exposure requires a time-lapse acquisition mode",
                ));
            }
            if self.vtm_exposures.is_empty() {
                return Err(AcqError::config(
                    "variable timed exposure requires a non-empty vtm_exposures list",
                ));
            }
        }
        if !(1..=10).contains(&self.save_digits) {
            return Err(AcqError::config("save_digits must be between 1 and 10"));
        }
        if let Some(bad) = self.regions.iter().find(|r| !r.is_valid()) {
            return Err(AcqError::config(format!("invalid region {bad}")));
        }
        if self.centroids.enabled && !self.metadata_enabled {
            return Err(AcqError::config("centroids require metadata_enabled"));
        }
        if self.is_tracking() && self.tracking.max_particles == 0 {
            return Err(AcqError::config("tracking.max_particles must be at least 1"));
        }
        let wb = [
            self.color.wb_scale_red,
            self.color.wb_scale_green,
            self.color.wb_scale_blue,
        ];
        if wb.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(AcqError::config("white-balance scales must be positive"));
        }
        if self.display_fps.is_nan() || self.display_fps < 0.0 {
            return Err(AcqError::config("display_fps must not be negative"));
        }
        Ok(())
    }
}
