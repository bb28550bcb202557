//! Full-frame bitmaps assembled from multi-ROI frame payloads.

use daq_core::frame::{BitmapFormat, Frame};
use daq_core::region::Region;
use daq_core::{AcqError, AcqResult};

/// Row-major image with little-endian samples, interleaved for colour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    format: BitmapFormat,
    data: Vec<u8>,
}

impl Bitmap {
    #[must_use]
    pub fn new(width: u32, height: u32, format: BitmapFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            data: vec![0; len],
        }
    }

    /// Bitmap covering `region` in binned output pixels.
    #[must_use]
    pub fn for_region(region: &Region, format: BitmapFormat) -> Self {
        Self::new(region.width(), region.height(), format)
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn format(&self) -> BitmapFormat {
        self.format
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    fn sample_offset(&self, x: u32, y: u32, channel: usize) -> usize {
        let spp = self.format.samples_per_pixel();
        ((y as usize * self.width as usize + x as usize) * spp + channel)
            * self.format.bytes_per_sample()
    }

    /// Sample `channel` of pixel `(x, y)`. Coordinates must be in range.
    #[must_use]
    pub fn sample(&self, x: u32, y: u32, channel: usize) -> u32 {
        let at = self.sample_offset(x, y, channel);
        let d = &self.data;
        match self.format.bytes_per_sample() {
            1 => u32::from(d[at]),
            2 => u32::from(u16::from_le_bytes([d[at], d[at + 1]])),
            _ => u32::from_le_bytes([d[at], d[at + 1], d[at + 2], d[at + 3]]),
        }
    }

    /// Store `value`, truncated to the sample width.
    pub fn set_sample(&mut self, x: u32, y: u32, channel: usize, value: u32) {
        let at = self.sample_offset(x, y, channel);
        let bps = self.format.bytes_per_sample();
        self.data[at..at + bps].copy_from_slice(&value.to_le_bytes()[..bps]);
    }

    /// Set every sample to `value`, truncated to the sample width.
    pub fn fill(&mut self, value: u32) {
        let bps = self.format.bytes_per_sample();
        if value == 0 {
            self.data.fill(0);
            return;
        }
        let bytes = value.to_le_bytes();
        for chunk in self.data.chunks_exact_mut(bps) {
            chunk.copy_from_slice(&bytes[..bps]);
        }
    }

    /// Copy a packed `width` × `height` block into the bitmap at `(x, y)`.
    pub fn blit(&mut self, src: &[u8], width: u32, height: u32, x: u32, y: u32) -> AcqResult<()> {
        if x + width > self.width || y + height > self.height {
            return Err(AcqError::format(format!(
                "{width}x{height} block at ({x},{y}) exceeds {}x{} bitmap",
                self.width, self.height
            )));
        }
        let bpp = self.format.bytes_per_pixel();
        let src_row = width as usize * bpp;
        if src.len() < src_row * height as usize {
            return Err(AcqError::format(format!(
                "{width}x{height} block needs {} bytes, got {}",
                src_row * height as usize,
                src.len()
            )));
        }
        let dst_row = self.row_bytes();
        for (row, line) in src.chunks_exact(src_row).take(height as usize).enumerate() {
            let at = (y as usize + row) * dst_row + x as usize * bpp;
            self.data[at..at + src_row].copy_from_slice(line);
        }
        Ok(())
    }

    /// 16-bit samples as native integers.
    #[must_use]
    pub fn samples_u16(&self) -> Vec<u16> {
        self.data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    /// 32-bit samples as native integers.
    #[must_use]
    pub fn samples_u32(&self) -> Vec<u32> {
        self.data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// Place every ROI of `frame` into `out`, which must cover the frame's
/// implied region. Pixels outside all ROIs get `fill`.
///
/// Frames with metadata are laid out from the decoded ROI headers. Without
/// metadata the payload holds the configured regions back to back.
pub fn assemble(frame: &Frame, fill: u32, out: &mut Bitmap) -> AcqResult<()> {
    let cfg = frame.cfg();
    let implied = cfg.implied_region;
    if out.width != implied.width() || out.height != implied.height() {
        return Err(AcqError::format(format!(
            "bitmap {}x{} does not match implied region {implied}",
            out.width, out.height
        )));
    }
    out.fill(fill);

    let placements: Vec<(Region, usize, usize)> = match frame.metadata()? {
        Some(md) => md
            .data_rois()
            .map(|roi| (roi.header.region, roi.data_offset, roi.data_len))
            .collect(),
        None => {
            let bpp = cfg.bitmap_format.bytes_per_pixel();
            let mut offset = 0;
            cfg.regions
                .iter()
                .map(|r| {
                    let len = r.pixel_count() * bpp;
                    let placed = (*r, offset, len);
                    offset += len;
                    placed
                })
                .collect()
        }
    };

    frame
        .with_data(|data| -> AcqResult<()> {
            for (region, offset, len) in placements {
                let (x, y) = region.offset_in(&implied).ok_or_else(|| {
                    AcqError::format(format!("ROI {region} lies outside {implied}"))
                })?;
                let bytes = data.get(offset..offset + len).ok_or_else(|| {
                    AcqError::format(format!(
                        "ROI {region} data {offset}+{len} exceeds frame of {} bytes",
                        data.len()
                    ))
                })?;
                out.blit(bytes, region.width(), region.height(), x, y)?;
            }
            Ok(())
        })
        .ok_or_else(|| AcqError::state(format!("frame {} has no data", frame.frame_nr())))?
}
