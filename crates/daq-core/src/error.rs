//! Error types for the acquisition stack.
//!
//! Built with `thiserror`. Two enums cover everything the pipeline can
//! report:
//!
//! - **`CameraError`**: parameter access and driver-call failures. Parameter
//!   errors carry the parameter name, the attribute being accessed and the
//!   driver's message, so the configuration layer can decide whether to fall
//!   back to the device default.
//! - **`AcqError`**: the run-level taxonomy (camera, allocation, I/O, format,
//!   state, abort, configuration). `#[from]` conversions let `?` lift
//!   lower-level errors.
//!
//! Errors raised on the camera callback path are never propagated; the
//! pipeline turns them into per-frame loss accounting instead.

use daq_pool::AllocError;
use std::fmt;
use thiserror::Error;

/// Parameter attribute being queried or written when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamAttr {
    Available,
    Access,
    Current,
    Default,
    Min,
    Max,
    Count,
    Type,
}

impl fmt::Display for ParamAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ParamAttr::Available => "available",
            ParamAttr::Access => "access",
            ParamAttr::Current => "current",
            ParamAttr::Default => "default",
            ParamAttr::Min => "min",
            ParamAttr::Max => "max",
            ParamAttr::Count => "count",
            ParamAttr::Type => "type",
        };
        f.write_str(label)
    }
}

/// Camera and driver failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("parameter {param} is not available ({attr}): {message}")]
    ParamNotAvailable {
        param: String,
        attr: ParamAttr,
        message: String,
    },

    #[error("parameter {param} is not writable ({attr}): {message}")]
    ParamNotWritable {
        param: String,
        attr: ParamAttr,
        message: String,
    },

    #[error("invalid value for parameter {param} ({attr}): {message}")]
    InvalidValue {
        param: String,
        attr: ParamAttr,
        message: String,
    },

    #[error("driver call {call} failed: {message}")]
    DriverCall { call: &'static str, message: String },

    #[error("invalid ROI: {0}")]
    InvalidRoi(String),

    #[error("camera is not open")]
    NotOpen,

    #[error("camera '{0}' not found")]
    NotFound(String),
}

impl CameraError {
    /// Name of the parameter involved, for parameter errors.
    #[must_use]
    pub fn param(&self) -> Option<&str> {
        match self {
            CameraError::ParamNotAvailable { param, .. }
            | CameraError::ParamNotWritable { param, .. }
            | CameraError::InvalidValue { param, .. } => Some(param),
            _ => None,
        }
    }

    /// True for errors the configuration layer may repair by falling back to
    /// the parameter's default value.
    #[must_use]
    pub fn is_fixable(&self) -> bool {
        matches!(self, CameraError::InvalidValue { .. })
    }
}

/// Convenience alias for results using [`AcqError`].
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Run-level error taxonomy.
#[derive(Error, Debug)]
pub enum AcqError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("allocation error: {0}")]
    Alloc(#[from] AllocError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing, truncated or mistyped on-wire or on-disk data.
    #[error("format error: {0}")]
    Format(String),

    /// Operation invalid for the current acquisition state.
    #[error("state error: {0}")]
    State(String),

    #[error("abort requested")]
    AbortRequested,

    /// Settings failed semantic validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl AcqError {
    pub fn format(msg: impl Into<String>) -> Self {
        AcqError::Format(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        AcqError::State(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        AcqError::Config(msg.into())
    }
}
