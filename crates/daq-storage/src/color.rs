//! Bayer demosaicing for colour sensors.
//!
//! The TIFF writer converts raw mosaic frames to RGB through a [`Debayer`]
//! backend held in a [`ColorContext`]. [`BayerDebayer`] is the built-in
//! backend; acquisitions may inject another one.

use crate::bitmap::Bitmap;
use daq_core::frame::AcqCfg;
use daq_core::settings::{ColorSettings, DebayerAlgorithm};
use daq_core::{AcqError, AcqResult};
use std::sync::Arc;

/// Colour of the top-left 2×2 cell, as reported by the sensor's colour mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BayerPattern {
    Rggb,
    Grbg,
    Gbrg,
    Bggr,
}

impl BayerPattern {
    /// `None` for mono sensors and unknown masks.
    #[must_use]
    pub fn from_color_mask(mask: u8) -> Option<Self> {
        match mask {
            2 => Some(BayerPattern::Rggb),
            3 => Some(BayerPattern::Grbg),
            4 => Some(BayerPattern::Gbrg),
            5 => Some(BayerPattern::Bggr),
            _ => None,
        }
    }

    /// Channel (0 red, 1 green, 2 blue) sampled at `(x, y)`.
    #[must_use]
    pub fn channel_at(self, x: u32, y: u32) -> usize {
        let cell = [
            [[0, 1], [1, 2]],
            [[1, 0], [2, 1]],
            [[1, 2], [0, 1]],
            [[2, 1], [1, 0]],
        ][self as usize];
        cell[(y & 1) as usize][(x & 1) as usize]
    }
}

/// Mosaic-to-RGB conversion.
pub trait Debayer: Send + Sync {
    /// Convert the single-channel `src` into the interleaved RGB `dst` of the
    /// same size and sample width.
    fn debayer(&self, src: &Bitmap, pattern: BayerPattern, dst: &mut Bitmap) -> AcqResult<()>;
}

/// Built-in demosaicing with white-balance scaling.
#[derive(Debug, Clone, PartialEq)]
pub struct BayerDebayer {
    algorithm: DebayerAlgorithm,
    wb_scales: [f32; 3],
    max_value: u32,
}

impl BayerDebayer {
    #[must_use]
    pub fn new(algorithm: DebayerAlgorithm, wb_scales: [f32; 3], bit_depth: u16) -> Self {
        let max_value = if bit_depth >= 32 {
            u32::MAX
        } else {
            (1u32 << bit_depth.max(1)) - 1
        };
        Self {
            algorithm,
            wb_scales,
            max_value,
        }
    }

    #[must_use]
    pub fn from_settings(color: &ColorSettings, bit_depth: u16) -> Self {
        Self::new(
            color.debayer_alg,
            [color.wb_scale_red, color.wb_scale_green, color.wb_scale_blue],
            bit_depth,
        )
    }

    /// Raw value of `channel` at `(x, y)` before white balance.
    fn interpolate(&self, src: &Bitmap, pattern: BayerPattern, x: u32, y: u32, channel: usize) -> u32 {
        if pattern.channel_at(x, y) == channel {
            return src.sample(x, y, 0);
        }
        let x0 = x.saturating_sub(1);
        let y0 = y.saturating_sub(1);
        let x1 = (x + 1).min(src.width() - 1);
        let y1 = (y + 1).min(src.height() - 1);
        let mut sum = 0u64;
        let mut count = 0u64;
        for ny in y0..=y1 {
            for nx in x0..=x1 {
                if pattern.channel_at(nx, ny) != channel {
                    continue;
                }
                let v = u64::from(src.sample(nx, ny, 0));
                if self.algorithm == DebayerAlgorithm::Nearest {
                    return v as u32;
                }
                sum += v;
                count += 1;
            }
        }
        if count == 0 {
            0
        } else {
            (sum / count) as u32
        }
    }
}

impl Debayer for BayerDebayer {
    fn debayer(&self, src: &Bitmap, pattern: BayerPattern, dst: &mut Bitmap) -> AcqResult<()> {
        if src.format().is_color() {
            return Err(AcqError::format("debayer input must be single-channel"));
        }
        if dst.width() != src.width()
            || dst.height() != src.height()
            || src.format().to_color() != Some(dst.format())
        {
            return Err(AcqError::format(format!(
                "debayer output {}x{} {:?} does not match input {}x{} {:?}",
                dst.width(),
                dst.height(),
                dst.format(),
                src.width(),
                src.height(),
                src.format()
            )));
        }
        for y in 0..src.height() {
            for x in 0..src.width() {
                for channel in 0..3 {
                    let raw = self.interpolate(src, pattern, x, y, channel);
                    let scaled = (f64::from(raw) * f64::from(self.wb_scales[channel])).round();
                    let value = scaled.clamp(0.0, f64::from(self.max_value)) as u32;
                    dst.set_sample(x, y, channel, value);
                }
            }
        }
        Ok(())
    }
}

/// What the TIFF writer needs to produce RGB output.
#[derive(Clone)]
pub struct ColorContext {
    pub pattern: BayerPattern,
    pub debayer: Arc<dyn Debayer>,
}

impl std::fmt::Debug for ColorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColorContext")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

impl ColorContext {
    /// Context for a colour acquisition, `None` for mono sensors.
    ///
    /// Colour output needs 8- or 16-bit samples.
    pub fn for_acquisition(cfg: &AcqCfg, color: &ColorSettings) -> AcqResult<Option<Self>> {
        let Some(pattern) = BayerPattern::from_color_mask(cfg.color_mask) else {
            return Ok(None);
        };
        if cfg.bitmap_format.to_color().is_none() || cfg.bitmap_format.is_color() {
            return Err(AcqError::config(format!(
                "colour output requires 8- or 16-bit mosaic frames, got {:?}",
                cfg.bitmap_format
            )));
        }
        Ok(Some(Self {
            pattern,
            debayer: Arc::new(BayerDebayer::from_settings(color, cfg.bit_depth)),
        }))
    }
}
