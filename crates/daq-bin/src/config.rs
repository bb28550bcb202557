//! Layered configuration for `pvcam-stream`.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. TOML file given with `--config`
//! 3. environment variables prefixed `PVCAM_STREAM_`, nested keys split on
//!    `__` (e.g. `PVCAM_STREAM_ACQUISITION__ACQ_FRAME_COUNT=50`)
//! 4. command-line overrides
//!
//! ```toml
//! [camera]
//! sensor_width = 2048
//! fps = 250.0
//!
//! [acquisition]
//! acq_mode = "snap-circ-buffer"
//! acq_frame_count = 500
//! storage_type = "prd"
//! save_dir = "/data/run1"
//! max_stack_size = 1073741824
//! ```

use daq_core::settings::Settings;
use daq_driver_pvcam::FakeCameraConfig;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_PREFIX: &str = "PVCAM_STREAM_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Synthetic camera the pipeline runs against.
    pub camera: FakeCameraConfig,
    pub acquisition: Settings,
}

impl AppConfig {
    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file_exact(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
