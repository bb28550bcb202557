//! Camera parameter tree.
//!
//! Mirrors the driver's parameter model: every parameter has availability,
//! access rights, a current value, a default, a range and (for enumerated
//! parameters) a list of named items. All values are carried as `i64`.
//!
//! # SDK Pattern
//!
//! Availability is checked before every access, the way the driver requires
//! `ATTR_AVAIL` to be queried before `ATTR_CURRENT`. Failures come back as
//! [`CameraError`] carrying the parameter name, the attribute and a message,
//! so the configuration layer can decide whether to fall back to the default.

use daq_core::error::{CameraError, ParamAttr};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;

pub type CameraResult<T> = Result<T, CameraError>;

/// Parameters the acquisition stack reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamId {
    SensorWidth,
    SensorHeight,
    BitDepth,
    ColorMode,
    ExposureResolution,
    ExposureMode,
    ClearMode,
    ReadoutPort,
    SpeedIndex,
    GainIndex,
    MetadataEnabled,
    CentroidsEnabled,
    CentroidsMode,
    CentroidsRadius,
    CentroidsCount,
}

impl ParamId {
    /// Driver-side name, used in logs and errors.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ParamId::SensorWidth => "PARAM_SER_SIZE",
            ParamId::SensorHeight => "PARAM_PAR_SIZE",
            ParamId::BitDepth => "PARAM_BIT_DEPTH",
            ParamId::ColorMode => "PARAM_COLOR_MODE",
            ParamId::ExposureResolution => "PARAM_EXP_RES",
            ParamId::ExposureMode => "PARAM_EXPOSURE_MODE",
            ParamId::ClearMode => "PARAM_CLEAR_MODE",
            ParamId::ReadoutPort => "PARAM_READOUT_PORT",
            ParamId::SpeedIndex => "PARAM_SPDTAB_INDEX",
            ParamId::GainIndex => "PARAM_GAIN_INDEX",
            ParamId::MetadataEnabled => "PARAM_METADATA_ENABLED",
            ParamId::CentroidsEnabled => "PARAM_CENTROIDS_ENABLED",
            ParamId::CentroidsMode => "PARAM_CENTROIDS_MODE",
            ParamId::CentroidsRadius => "PARAM_CENTROIDS_RADIUS",
            ParamId::CentroidsCount => "PARAM_CENTROIDS_COUNT",
        }
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamAccess {
    ReadOnly,
    ReadWrite,
}

/// One named value of an enumerated parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumItem {
    pub value: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamEntry {
    pub id: ParamId,
    pub available: bool,
    pub access: ParamAccess,
    pub current: i64,
    pub default: i64,
    pub min: i64,
    pub max: i64,
    /// Allowed values for enumerated parameters; empty for ranges.
    pub items: Vec<EnumItem>,
}

impl ParamEntry {
    /// Read-write numeric parameter with a range.
    #[must_use]
    pub fn range(id: ParamId, default: i64, min: i64, max: i64) -> Self {
        Self {
            id,
            available: true,
            access: ParamAccess::ReadWrite,
            current: default,
            default,
            min,
            max,
            items: Vec::new(),
        }
    }

    /// Read-only value.
    #[must_use]
    pub fn read_only(id: ParamId, value: i64) -> Self {
        Self {
            access: ParamAccess::ReadOnly,
            ..Self::range(id, value, value, value)
        }
    }

    /// Read-write boolean.
    #[must_use]
    pub fn flag(id: ParamId, default: bool) -> Self {
        Self::range(id, i64::from(default), 0, 1)
    }

    /// Read-write enumeration.
    #[must_use]
    pub fn enumeration(id: ParamId, default: i64, items: &[(i64, &str)]) -> Self {
        let min = items.iter().map(|i| i.0).min().unwrap_or(default);
        let max = items.iter().map(|i| i.0).max().unwrap_or(default);
        Self {
            items: items
                .iter()
                .map(|&(value, name)| EnumItem {
                    value,
                    name: name.to_string(),
                })
                .collect(),
            ..Self::range(id, default, min, max)
        }
    }

    #[must_use]
    pub fn unavailable(self) -> Self {
        Self {
            available: false,
            ..self
        }
    }

    fn accepts(&self, value: i64) -> bool {
        if self.items.is_empty() {
            (self.min..=self.max).contains(&value)
        } else {
            self.items.iter().any(|i| i.value == value)
        }
    }

    /// Name of the current enumeration item, if any.
    #[must_use]
    pub fn current_name(&self) -> Option<&str> {
        self.items
            .iter()
            .find(|i| i.value == self.current)
            .map(|i| i.name.as_str())
    }
}

/// Thread-safe set of camera parameters.
#[derive(Debug, Default)]
pub struct ParamTree {
    entries: RwLock<BTreeMap<ParamId, ParamEntry>>,
}

impl ParamTree {
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = ParamEntry>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().map(|e| (e.id, e)).collect()),
        }
    }

    pub fn insert(&self, entry: ParamEntry) {
        self.entries.write().insert(entry.id, entry);
    }

    #[must_use]
    pub fn is_available(&self, id: ParamId) -> bool {
        self.entries.read().get(&id).is_some_and(|e| e.available)
    }

    /// Snapshot of one entry.
    pub fn entry(&self, id: ParamId) -> CameraResult<ParamEntry> {
        let entries = self.entries.read();
        match entries.get(&id) {
            Some(e) if e.available => Ok(e.clone()),
            _ => Err(not_available(id, ParamAttr::Available)),
        }
    }

    pub fn get(&self, id: ParamId) -> CameraResult<i64> {
        self.entry(id).map(|e| e.current)
    }

    pub fn get_bool(&self, id: ParamId) -> CameraResult<bool> {
        self.get(id).map(|v| v != 0)
    }

    pub fn default_of(&self, id: ParamId) -> CameraResult<i64> {
        self.entry(id).map(|e| e.default)
    }

    /// Write a value after checking availability, access and range.
    pub fn set(&self, id: ParamId, value: i64) -> CameraResult<()> {
        let mut entries = self.entries.write();
        let entry = match entries.get_mut(&id) {
            Some(e) if e.available => e,
            _ => return Err(not_available(id, ParamAttr::Available)),
        };
        if entry.access == ParamAccess::ReadOnly {
            return Err(CameraError::ParamNotWritable {
                param: id.name().to_string(),
                attr: ParamAttr::Access,
                message: "parameter is read-only".to_string(),
            });
        }
        if !entry.accepts(value) {
            let message = if entry.items.is_empty() {
                format!("{value} outside [{}, {}]", entry.min, entry.max)
            } else {
                format!("{value} is not a valid enumeration item")
            };
            return Err(CameraError::InvalidValue {
                param: id.name().to_string(),
                attr: ParamAttr::Current,
                message,
            });
        }
        entry.current = value;
        Ok(())
    }

    pub fn set_bool(&self, id: ParamId, value: bool) -> CameraResult<()> {
        self.set(id, i64::from(value))
    }

    /// Restore the default value. Returns the value written.
    pub fn reset_to_default(&self, id: ParamId) -> CameraResult<i64> {
        let mut entries = self.entries.write();
        match entries.get_mut(&id) {
            Some(e) if e.available => {
                e.current = e.default;
                Ok(e.default)
            }
            _ => Err(not_available(id, ParamAttr::Default)),
        }
    }

    /// Every available parameter, in id order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ParamEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| e.available)
            .cloned()
            .collect()
    }
}

fn not_available(id: ParamId, attr: ParamAttr) -> CameraError {
    CameraError::ParamNotAvailable {
        param: id.name().to_string(),
        attr,
        message: "parameter is not supported by this camera".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> ParamTree {
        ParamTree::new([
            ParamEntry::read_only(ParamId::SensorWidth, 2048),
            ParamEntry::range(ParamId::GainIndex, 1, 1, 3),
            ParamEntry::enumeration(ParamId::ExposureMode, 0, &[(0, "Timed"), (3, "Trigger")]),
            ParamEntry::flag(ParamId::CentroidsEnabled, false).unavailable(),
        ])
    }

    #[test]
    fn get_and_set_within_range() {
        let t = tree();
        t.set(ParamId::GainIndex, 3).unwrap();
        assert_eq!(t.get(ParamId::GainIndex).unwrap(), 3);
        assert_eq!(t.reset_to_default(ParamId::GainIndex).unwrap(), 1);
    }

    #[test]
    fn read_only_rejects_writes() {
        let err = tree().set(ParamId::SensorWidth, 1).unwrap_err();
        assert!(matches!(err, CameraError::ParamNotWritable { .. }));
        assert_eq!(err.param(), Some("PARAM_SER_SIZE"));
    }

    #[test]
    fn enumeration_checks_items_not_range() {
        let t = tree();
        let err = t.set(ParamId::ExposureMode, 2).unwrap_err();
        assert!(err.is_fixable());
        t.set(ParamId::ExposureMode, 3).unwrap();
        assert_eq!(t.entry(ParamId::ExposureMode).unwrap().current_name(), Some("Trigger"));
    }

    #[test]
    fn unavailable_parameters_report_availability() {
        let t = tree();
        assert!(!t.is_available(ParamId::CentroidsEnabled));
        assert!(matches!(
            t.get(ParamId::CentroidsEnabled),
            Err(CameraError::ParamNotAvailable { attr: ParamAttr::Available, .. })
        ));
        assert!(t.get(ParamId::ClearMode).is_err());
        assert_eq!(t.snapshot().len(), 3);
    }
}
