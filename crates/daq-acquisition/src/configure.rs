//! Camera parameter configuration before `setup_exp`.
//!
//! Each setting maps to one camera parameter. A rejected value either fails
//! the start, or with `fix_user_input` falls back to the camera's default
//! and logs what was changed.

use daq_core::error::CameraError;
use daq_core::settings::{ExposureMode, ExposureResolution, Settings};
use daq_core::AcqResult;
use daq_driver_pvcam::{Camera, ParamId, ParamTree};
use tracing::{debug, warn};

/// A parameter write that was replaced by the camera default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixUp {
    pub param: ParamId,
    pub requested: i64,
    pub applied: i64,
}

struct Writer<'a> {
    params: &'a ParamTree,
    fix_user_input: bool,
    fixups: Vec<FixUp>,
}

impl Writer<'_> {
    /// Write `value`. When `required` is false a missing parameter is
    /// skipped instead of failing.
    fn write(&mut self, id: ParamId, value: i64, required: bool) -> AcqResult<()> {
        if !required && !self.params.is_available(id) {
            debug!(param = id.name(), "Parameter not available, skipped");
            return Ok(());
        }
        match self.params.set(id, value) {
            Ok(()) => Ok(()),
            Err(err) if self.fix_user_input && err.is_fixable() => self.fix(id, value, &err),
            Err(err) => Err(err.into()),
        }
    }

    fn fix(&mut self, id: ParamId, requested: i64, err: &CameraError) -> AcqResult<()> {
        let applied = self.params.reset_to_default(id)?;
        warn!(
            param = id.name(),
            requested,
            applied,
            reason = %err,
            "Fixed up parameter value"
        );
        self.fixups.push(FixUp {
            param: id,
            requested,
            applied,
        });
        Ok(())
    }
}

/// Apply `settings` to the camera's parameters.
///
/// Returns the values that were replaced by defaults. Settings left at
/// their default are skipped when the camera lacks the parameter.
pub fn configure_camera(camera: &dyn Camera, settings: &Settings) -> AcqResult<Vec<FixUp>> {
    let mut w = Writer {
        params: camera.params(),
        fix_user_input: settings.fix_user_input,
        fixups: Vec::new(),
    };

    // Port, speed and gain depend on each other; write them in that order.
    if let Some(port) = settings.readout_port {
        w.write(ParamId::ReadoutPort, i64::from(port), true)?;
    }
    if let Some(speed) = settings.speed_index {
        w.write(ParamId::SpeedIndex, i64::from(speed), true)?;
    }
    if let Some(gain) = settings.gain_index {
        w.write(ParamId::GainIndex, i64::from(gain), true)?;
    }
    if let Some(clear) = settings.clear_mode {
        w.write(ParamId::ClearMode, i64::from(clear.to_pvcam()), true)?;
    }

    w.write(
        ParamId::ExposureResolution,
        i64::from(settings.exposure_resolution.to_pvcam()),
        settings.exposure_resolution != ExposureResolution::default(),
    )?;
    w.write(
        ParamId::ExposureMode,
        i64::from(settings.exposure_mode.to_pvcam()),
        settings.exposure_mode != ExposureMode::default(),
    )?;

    w.write(
        ParamId::MetadataEnabled,
        i64::from(settings.metadata_enabled),
        settings.metadata_enabled,
    )?;
    let centroids = &settings.centroids;
    w.write(
        ParamId::CentroidsEnabled,
        i64::from(centroids.enabled),
        centroids.enabled,
    )?;
    if centroids.enabled {
        w.write(ParamId::CentroidsMode, i64::from(centroids.mode.to_pvcam()), true)?;
        w.write(ParamId::CentroidsRadius, i64::from(centroids.radius), true)?;
        w.write(ParamId::CentroidsCount, i64::from(centroids.count), true)?;
    }

    debug!(fixups = w.fixups.len(), "Camera configured");
    Ok(w.fixups)
}

/// `settings` with the values the camera actually applied.
///
/// After a fix-up the camera may run with a different exposure setup than
/// requested; files must describe what was applied.
#[must_use]
pub fn applied_settings(camera: &dyn Camera, settings: &Settings) -> Settings {
    let params = camera.params();
    let mut applied = settings.clone();
    if let Ok(value) = params.get(ParamId::ExposureResolution) {
        applied.exposure_resolution = ExposureResolution::from_pvcam(value as i32);
    }
    if let Ok(value) = params.get(ParamId::ExposureMode) {
        applied.exposure_mode = ExposureMode::from_pvcam(value as i32);
    }
    applied
}
