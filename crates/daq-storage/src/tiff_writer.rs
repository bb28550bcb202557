//! TIFF and BigTIFF stack writer.
//!
//! Every frame becomes one TIFF directory (page). Frames are first assembled
//! into a full-frame bitmap covering the implied region, pixels outside all
//! ROIs taking the fill value. With a [`ColorContext`] the mosaic bitmap is
//! demosaiced to RGB before encoding.
//!
//! Per-frame timing goes into the page's `ImageDescription` tag.

use crate::bitmap::{assemble, Bitmap};
use crate::color::ColorContext;
use crate::file_save::FileSave;
use daq_core::frame::{AcqCfg, BitmapFormat, Frame};
use daq_core::{AcqError, AcqResult};
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::{TiffEncoder, TiffKind, TiffKindBig, TiffKindStandard, TiffValue};
use tiff::tags::Tag;
use tiff::TiffError;
use tracing::{debug, trace, warn};

/// Directory and tag bytes budgeted per page when sizing stacks.
pub const TIFF_PAGE_OVERHEAD: usize = 1024;
/// File header bytes (BigTIFF's is the larger one).
pub const TIFF_FILE_OVERHEAD: usize = 16;

fn tiff_error(e: TiffError) -> AcqError {
    match e {
        TiffError::IoError(e) => AcqError::Io(e),
        other => AcqError::format(format!("TIFF encoding failed: {other}")),
    }
}

/// Output format of a frame after assembly and optional demosaicing.
#[must_use]
pub fn page_format(cfg: &AcqCfg, color: Option<&ColorContext>) -> BitmapFormat {
    match (color, cfg.bitmap_format.to_color()) {
        (Some(_), Some(rgb)) => rgb,
        _ => cfg.bitmap_format,
    }
}

/// Encoded bytes of one page, without directory overhead.
#[must_use]
pub fn page_bytes(cfg: &AcqCfg, color: Option<&ColorContext>) -> usize {
    cfg.implied_region.pixel_count() * page_format(cfg, color).bytes_per_pixel()
}

/// File handle shared between the encoder and the writer, so the file can
/// be synced after the encoder is gone.
struct SharedFile(Arc<File>);

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

impl Seek for SharedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        (&*self.0).seek(pos)
    }
}

enum Encoder {
    Standard(TiffEncoder<SharedFile, TiffKindStandard>),
    Big(TiffEncoder<SharedFile, TiffKindBig>),
}

fn write_image<W, K, C>(
    encoder: &mut TiffEncoder<W, K>,
    bitmap: &Bitmap,
    description: &str,
    data: &[C::Inner],
) -> AcqResult<()>
where
    W: Write + Seek,
    K: TiffKind,
    C: ColorType,
    [C::Inner]: TiffValue,
{
    let mut image = encoder
        .new_image::<C>(bitmap.width(), bitmap.height())
        .map_err(tiff_error)?;
    image
        .encoder()
        .write_tag(Tag::ImageDescription, description)
        .map_err(tiff_error)?;
    image.write_data(data).map_err(tiff_error)
}

fn write_page<W: Write + Seek, K: TiffKind>(
    encoder: &mut TiffEncoder<W, K>,
    bitmap: &Bitmap,
    description: &str,
) -> AcqResult<()> {
    match bitmap.format() {
        BitmapFormat::Mono8 => {
            write_image::<_, _, colortype::Gray8>(encoder, bitmap, description, bitmap.data())
        }
        BitmapFormat::Mono16 => write_image::<_, _, colortype::Gray16>(
            encoder,
            bitmap,
            description,
            &bitmap.samples_u16(),
        ),
        BitmapFormat::Mono32 => write_image::<_, _, colortype::Gray32>(
            encoder,
            bitmap,
            description,
            &bitmap.samples_u32(),
        ),
        BitmapFormat::Rgb24 => {
            write_image::<_, _, colortype::RGB8>(encoder, bitmap, description, bitmap.data())
        }
        BitmapFormat::Rgb48 => write_image::<_, _, colortype::RGB16>(
            encoder,
            bitmap,
            description,
            &bitmap.samples_u16(),
        ),
    }
}

pub struct TiffFileSave {
    path: PathBuf,
    cfg: Arc<AcqCfg>,
    big_tiff: bool,
    fill_value: u32,
    color: Option<ColorContext>,
    file: Option<Arc<File>>,
    encoder: Option<Encoder>,
    frames_written: u32,
    mono: Bitmap,
    rgb: Option<Bitmap>,
}

impl TiffFileSave {
    /// Writer for frames of `cfg`. Colour output needs 8- or 16-bit frames.
    pub fn new(
        path: impl Into<PathBuf>,
        cfg: Arc<AcqCfg>,
        big_tiff: bool,
        color: Option<ColorContext>,
    ) -> AcqResult<Self> {
        let rgb = match &color {
            Some(_) => {
                let format = cfg
                    .bitmap_format
                    .to_color()
                    .filter(|_| !cfg.bitmap_format.is_color())
                    .ok_or_else(|| {
                        AcqError::config(format!(
                            "colour TIFF needs 8- or 16-bit mosaic frames, got {:?}",
                            cfg.bitmap_format
                        ))
                    })?;
                Some(Bitmap::for_region(&cfg.implied_region, format))
            }
            None => None,
        };
        Ok(Self {
            path: path.into(),
            mono: Bitmap::for_region(&cfg.implied_region, cfg.bitmap_format),
            cfg,
            big_tiff,
            fill_value: 0,
            color,
            file: None,
            encoder: None,
            frames_written: 0,
            rgb,
        })
    }

    /// Value of pixels not covered by any ROI.
    #[must_use]
    pub fn with_fill_value(mut self, fill_value: u32) -> Self {
        self.fill_value = fill_value;
        self
    }

    fn description(frame: &Frame) -> String {
        let info = frame.info();
        format!(
            "frameNr={}\nreadoutTime={}\nexpTime={}\nbofTime={}\neofTime={}",
            info.frame_nr,
            info.readout_time,
            info.exposure_time,
            info.timestamp_bof,
            info.timestamp_eof
        )
    }
}

impl FileSave for TiffFileSave {
    fn open(&mut self) -> AcqResult<()> {
        if self.encoder.is_some() {
            return Ok(());
        }
        let file = Arc::new(File::create(&self.path)?);
        let writer = SharedFile(Arc::clone(&file));
        let encoder = if self.big_tiff {
            Encoder::Big(TiffEncoder::new_big(writer).map_err(tiff_error)?)
        } else {
            Encoder::Standard(TiffEncoder::new(writer).map_err(tiff_error)?)
        };
        debug!(path = %self.path.display(), big_tiff = self.big_tiff, "Opened TIFF file");
        self.file = Some(file);
        self.encoder = Some(encoder);
        self.frames_written = 0;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.encoder.is_some()
    }

    fn write_frame(&mut self, frame: &Frame) -> AcqResult<()> {
        if self.encoder.is_none() {
            return Err(AcqError::state(format!(
                "TIFF file {} is not open",
                self.path.display()
            )));
        }
        let cfg = frame.cfg();
        if cfg.bitmap_format != self.cfg.bitmap_format
            || cfg.implied_region != self.cfg.implied_region
        {
            return Err(AcqError::format(format!(
                "frame {} is {:?} over {}, {} expects {:?} over {}",
                frame.frame_nr(),
                cfg.bitmap_format,
                cfg.implied_region,
                self.path.display(),
                self.cfg.bitmap_format,
                self.cfg.implied_region
            )));
        }
        assemble(frame, self.fill_value, &mut self.mono)?;
        let page = match (&self.color, self.rgb.as_mut()) {
            (Some(color), Some(rgb)) => {
                color.debayer.debayer(&self.mono, color.pattern, rgb)?;
                &*rgb
            }
            _ => &self.mono,
        };

        let description = Self::description(frame);
        match self.encoder.as_mut() {
            Some(Encoder::Standard(enc)) => write_page(enc, page, &description)?,
            Some(Encoder::Big(enc)) => write_page(enc, page, &description)?,
            None => return Err(AcqError::state("TIFF encoder missing")),
        }
        self.frames_written += 1;
        trace!(frame_nr = frame.frame_nr(), page = self.frames_written, "TIFF page written");
        Ok(())
    }

    fn close(&mut self) -> AcqResult<()> {
        if self.encoder.take().is_none() {
            return Ok(());
        }
        if let Some(file) = self.file.take() {
            file.sync_data()?;
        }
        debug!(path = %self.path.display(), frames = self.frames_written, "Closed TIFF file");
        Ok(())
    }

    fn frames_written(&self) -> u32 {
        self.frames_written
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TiffFileSave {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "Failed to close TIFF file");
        }
    }
}
