//! PRD stack writer.
//!
//! [`PrdFileSave`] appends one record per frame to a PRD file (see
//! [`crate::prd`]). The header is written when the first frame arrives and
//! rewritten on close once the final frame count is known.
//!
//! With a page-aligned allocator every block the writer emits is a multiple
//! of the page size and lives in page-aligned memory, so the file is opened
//! with `O_DIRECT` and bypasses the page cache. File systems that refuse
//! direct I/O get a buffered writer instead.

use crate::file_save::FileSave;
use crate::prd::{
    trajectories_capacity, write_trajectories, PrdHeader, PrdMetaData,
    PRD_EXT_FLAG_HAS_TRAJECTORIES, PRD_METADATA_SIZE,
};
use daq_core::frame::{AcqCfg, Frame};
use daq_core::settings::Settings;
use daq_core::{AcqError, AcqResult};
use daq_pool::{aligned_size, AlignedBuf, AllocatorType, PAGE_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Buffer size of the fallback writer.
const BUFFERED_CAPACITY: usize = 1 << 20;

/// Header alignment for files written from buffers of `allocator`.
#[must_use]
pub fn header_alignment(allocator: AllocatorType) -> u16 {
    if allocator.alignment() >= PAGE_SIZE {
        PAGE_SIZE as u16
    } else {
        0
    }
}

/// Per-file settings of a PRD writer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrdOptions {
    pub exposure_resolution: u16,
    pub alignment: u16,
    /// `(max_trajectories, max_points)` when trajectory snapshots are stored.
    pub trajectories: Option<(u32, u32)>,
    pub wb_scales: [f32; 3],
}

impl PrdOptions {
    #[must_use]
    pub fn from_settings(cfg: &AcqCfg, settings: &Settings) -> Self {
        Self {
            exposure_resolution: settings.exposure_resolution.to_pvcam() as u16,
            alignment: header_alignment(cfg.allocator),
            trajectories: settings.is_tracking().then_some((
                settings.tracking.max_particles,
                u32::from(settings.tracking.trajectory_duration),
            )),
            wb_scales: [
                settings.color.wb_scale_red,
                settings.color.wb_scale_green,
                settings.color.wb_scale_blue,
            ],
        }
    }

    /// Extended metadata bytes reserved per frame.
    #[must_use]
    pub fn ext_capacity(&self) -> usize {
        self.trajectories
            .map_or(0, |(t, p)| trajectories_capacity(t, p))
    }

    #[must_use]
    pub fn header(&self, cfg: &AcqCfg) -> PrdHeader {
        PrdHeader::for_acquisition(
            cfg,
            self.exposure_resolution,
            self.alignment,
            self.ext_capacity(),
        )
    }
}

impl Default for PrdOptions {
    fn default() -> Self {
        Self {
            exposure_resolution: 0,
            alignment: 0,
            trajectories: None,
            wb_scales: [1.0; 3],
        }
    }
}

// =============================================================================
// Output sink
// =============================================================================

enum Sink {
    /// Opened with `O_DIRECT`; every write is page-aligned.
    Direct(File),
    Buffered(BufWriter<File>),
}

impl Sink {
    fn open(path: &Path, direct: bool) -> io::Result<Self> {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        if direct {
            match open_direct(&opts, path) {
                Ok(file) => return Ok(Sink::Direct(file)),
                Err(e) => debug!(path = %path.display(), error = %e, "Direct I/O unavailable, using buffered writes"),
            }
        }
        let file = opts.open(path)?;
        Ok(Sink::Buffered(BufWriter::with_capacity(BUFFERED_CAPACITY, file)))
    }

    fn is_direct(&self) -> bool {
        matches!(self, Sink::Direct(_))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Sink::Direct(f) => f.write_all(buf),
            Sink::Buffered(w) => w.write_all(buf),
        }
    }

    /// Overwrite the start of the file and return to its end.
    fn rewrite_start(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Sink::Direct(f) => {
                f.seek(SeekFrom::Start(0))?;
                f.write_all(buf)?;
                f.seek(SeekFrom::End(0))?;
            }
            Sink::Buffered(w) => {
                w.seek(SeekFrom::Start(0))?;
                w.write_all(buf)?;
                w.seek(SeekFrom::End(0))?;
            }
        }
        Ok(())
    }

    fn finish(self) -> io::Result<()> {
        match self {
            Sink::Direct(f) => f.sync_data(),
            Sink::Buffered(w) => {
                let file = w.into_inner().map_err(io::IntoInnerError::into_error)?;
                file.sync_data()
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn open_direct(opts: &OpenOptions, path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut opts = opts.clone();
    opts.custom_flags(libc::O_DIRECT);
    opts.open(path)
}

#[cfg(not(target_os = "linux"))]
fn open_direct(_opts: &OpenOptions, _path: &Path) -> io::Result<File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "direct I/O is only implemented on Linux",
    ))
}

/// Scratch block reused across frames, grown on demand.
struct Scratch {
    buf: Option<AlignedBuf>,
    align: usize,
}

impl Scratch {
    fn new(align: usize) -> Self {
        Self {
            buf: None,
            align: align.max(8),
        }
    }

    /// Zeroed slice of exactly `len` bytes.
    fn zeroed(&mut self, len: usize) -> AcqResult<&mut [u8]> {
        let too_small = self.buf.as_ref().map_or(true, |b| b.len() < len);
        if too_small {
            self.buf = Some(AlignedBuf::zeroed(len, self.align)?);
        }
        let Some(buf) = self.buf.as_mut() else {
            return Err(AcqError::state("scratch buffer missing"));
        };
        let slice = &mut buf.as_mut_slice()[..len];
        slice.fill(0);
        Ok(slice)
    }
}

// =============================================================================
// Writer
// =============================================================================

pub struct PrdFileSave {
    path: PathBuf,
    cfg: Arc<AcqCfg>,
    options: PrdOptions,
    header: PrdHeader,
    sink: Option<Sink>,
    header_written: bool,
    /// Frame count stored in the header on disk.
    header_frame_count: u32,
    meta: Scratch,
    ext_dyn: Scratch,
    payload: Scratch,
    ext_dyn_bytes: Vec<u8>,
}

impl PrdFileSave {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, cfg: Arc<AcqCfg>, options: PrdOptions) -> Self {
        let header = options.header(&cfg);
        let align = header.alignment();
        Self {
            path: path.into(),
            cfg,
            options,
            header,
            sink: None,
            header_written: false,
            header_frame_count: 0,
            meta: Scratch::new(align),
            ext_dyn: Scratch::new(align),
            payload: Scratch::new(align),
            ext_dyn_bytes: Vec::new(),
        }
    }

    #[must_use]
    pub fn header(&self) -> &PrdHeader {
        &self.header
    }

    /// Whether the open file bypasses the page cache.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.sink.as_ref().is_some_and(Sink::is_direct)
    }

    fn wants_direct(&self) -> bool {
        let align = self.header.alignment();
        align >= PAGE_SIZE && self.cfg.allocator.alignment() >= align
    }

    fn sink(&mut self) -> AcqResult<&mut Sink> {
        self.sink.as_mut().ok_or_else(|| {
            AcqError::state(format!("PRD file {} is not open", self.path.display()))
        })
    }

    fn write_header(&mut self) -> AcqResult<()> {
        let len = self.header.header_block_size();
        self.header.write(self.meta.zeroed(len)?);
        let Self {
            sink,
            meta,
            header,
            header_written,
            header_frame_count,
            ..
        } = self;
        let (Some(sink), Some(buf)) = (sink.as_mut(), meta.buf.as_ref()) else {
            return Err(AcqError::state("PRD file is not open"));
        };
        let block = &buf.as_slice()[..len];
        if *header_written {
            sink.rewrite_start(block)?;
        } else {
            sink.write_all(block)?;
            *header_written = true;
        }
        *header_frame_count = header.frame_count;
        Ok(())
    }

    /// Metadata block for `frame`, written into the `meta` scratch.
    fn build_metadata(&mut self, frame: &Frame) -> AcqResult<usize> {
        let md = frame.metadata()?;
        self.ext_dyn_bytes.clear();
        if let Some(md) = md.as_ref() {
            md.ext.encode(&mut self.ext_dyn_bytes);
        }

        let roi_count = md
            .as_ref()
            .map_or(self.cfg.roi_count, |md| md.rois.len() as u16);
        let mut prd_md = PrdMetaData::from_info(&frame.info(), roi_count);
        [
            prd_md.color_wb_scale_red,
            prd_md.color_wb_scale_green,
            prd_md.color_wb_scale_blue,
        ] = self.options.wb_scales;
        prd_md.ext_dyn_metadata_size = self.ext_dyn_bytes.len() as u32;

        let block_size = self.header.metadata_block_size();
        let traj_capacity = self.options.trajectories;
        let block = self.meta.zeroed(block_size)?;
        if let (Some((max_t, max_p)), Some(set)) = (traj_capacity, frame.trajectories()) {
            let used = write_trajectories(&set, max_t, max_p, &mut block[PRD_METADATA_SIZE..])?;
            prd_md.ext_flags |= PRD_EXT_FLAG_HAS_TRAJECTORIES;
            prd_md.ext_metadata_size = used as u32;
        }
        prd_md.write(block);
        Ok(block_size)
    }
}

impl FileSave for PrdFileSave {
    fn open(&mut self) -> AcqResult<()> {
        if self.sink.is_some() {
            return Ok(());
        }
        let sink = Sink::open(&self.path, self.wants_direct())?;
        debug!(
            path = %self.path.display(),
            direct = sink.is_direct(),
            alignment = self.header.alignment,
            "Opened PRD file"
        );
        self.sink = Some(sink);
        self.header.frame_count = 0;
        self.header_written = false;
        self.header_frame_count = 0;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    fn write_frame(&mut self, frame: &Frame) -> AcqResult<()> {
        self.sink()?;
        if frame.cfg().frame_bytes != self.header.frame_size as usize {
            return Err(AcqError::format(format!(
                "frame of {} bytes does not match PRD frame size {}",
                frame.cfg().frame_bytes,
                self.header.frame_size
            )));
        }
        if !self.header_written {
            self.write_header()?;
        }

        let meta_len = self.build_metadata(frame)?;
        let ext_dyn_len = aligned_size(self.ext_dyn_bytes.len(), self.header.alignment());
        let payload_len = self.header.payload_block_size();
        let frame_size = self.header.frame_size as usize;

        if ext_dyn_len > 0 {
            let block = self.ext_dyn.zeroed(ext_dyn_len)?;
            block[..self.ext_dyn_bytes.len()].copy_from_slice(&self.ext_dyn_bytes);
        }

        let Self {
            sink,
            meta,
            ext_dyn,
            payload,
            ..
        } = self;
        let Some(sink) = sink.as_mut() else {
            return Err(AcqError::state("PRD file is not open"));
        };
        let Some(meta_buf) = meta.buf.as_ref() else {
            return Err(AcqError::state("metadata block missing"));
        };
        sink.write_all(&meta_buf.as_slice()[..meta_len])?;
        if ext_dyn_len > 0 {
            if let Some(buf) = ext_dyn.buf.as_ref() {
                sink.write_all(&buf.as_slice()[..ext_dyn_len])?;
            }
        }

        // Deep frames already sit in an aligned block of the right size.
        let written = frame.with_aligned_data(|data| {
            if data.len() == payload_len {
                Some(sink.write_all(data))
            } else {
                None
            }
        });
        match written.flatten() {
            Some(result) => result?,
            None => {
                let block = payload.zeroed(payload_len)?;
                frame
                    .with_data(|data| block[..frame_size].copy_from_slice(&data[..frame_size]))
                    .ok_or_else(|| {
                        AcqError::state(format!("frame {} has no data", frame.frame_nr()))
                    })?;
                sink.write_all(block)?;
            }
        }

        self.header.frame_count += 1;
        trace!(frame_nr = frame.frame_nr(), count = self.header.frame_count, "PRD record written");
        Ok(())
    }

    fn close(&mut self) -> AcqResult<()> {
        if self.sink.is_none() {
            return Ok(());
        }
        let patched = if !self.header_written || self.header_frame_count != self.header.frame_count
        {
            self.write_header()
        } else {
            Ok(())
        };
        let finished = self.sink.take().map_or(Ok(()), Sink::finish);
        patched?;
        finished?;
        debug!(path = %self.path.display(), frames = self.header.frame_count, "Closed PRD file");
        Ok(())
    }

    fn frames_written(&self) -> u32 {
        self.header.frame_count
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PrdFileSave {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "Failed to close PRD file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prd::{PRD_HEADER_SIZE, PRD_SIGNATURE};
    use daq_core::frame::{BitmapFormat, FrameInfo};
    use daq_core::region::Region;

    fn cfg(allocator: AllocatorType) -> Arc<AcqCfg> {
        Arc::new(
            AcqCfg::single_region(Region::from_rect(0, 0, 64, 32), BitmapFormat::Mono16, 16)
                .with_allocator(allocator),
        )
    }

    fn frame(cfg: &Arc<AcqCfg>, nr: u32) -> Frame {
        let f = Frame::new(Arc::clone(cfg), true).unwrap();
        f.fill_data(|d| d.fill(nr as u8)).unwrap();
        f.set_info(FrameInfo::new(nr));
        f
    }

    #[test]
    fn alignment_follows_allocator() {
        assert_eq!(header_alignment(AllocatorType::Default), 0);
        assert_eq!(header_alignment(AllocatorType::Align32), 0);
        assert_eq!(header_alignment(AllocatorType::Align4k), 4096);
    }

    #[test]
    fn natural_layout_is_packed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.prd");
        let cfg = cfg(AllocatorType::Default);
        let mut w = PrdFileSave::new(&path, Arc::clone(&cfg), PrdOptions::default());
        w.open().unwrap();
        assert!(!w.is_direct());
        for nr in 1..=3 {
            w.write_frame(&frame(&cfg, nr)).unwrap();
        }
        w.close().unwrap();
        w.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), PRD_HEADER_SIZE + 3 * (PRD_METADATA_SIZE + 4096));
        assert_eq!(u32::from_le_bytes(bytes[..4].try_into().unwrap()), PRD_SIGNATURE);
        assert_eq!(u32::from_le_bytes(bytes[28..32].try_into().unwrap()), 3);
        let second_payload = PRD_HEADER_SIZE + PRD_METADATA_SIZE + 4096 + PRD_METADATA_SIZE;
        assert_eq!(bytes[second_payload], 2);
    }

    #[test]
    fn empty_file_still_gets_a_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.prd");
        let mut w = PrdFileSave::new(&path, cfg(AllocatorType::Default), PrdOptions::default());
        w.open().unwrap();
        w.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), PRD_HEADER_SIZE as u64);
    }

    #[test]
    fn page_aligned_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aligned.prd");
        let cfg = cfg(AllocatorType::Align4k);
        let options = PrdOptions {
            alignment: header_alignment(cfg.allocator),
            ..Default::default()
        };
        let mut w = PrdFileSave::new(&path, Arc::clone(&cfg), options);
        w.open().unwrap();
        w.write_frame(&frame(&cfg, 1)).unwrap();
        w.write_frame(&frame(&cfg, 2)).unwrap();
        assert_eq!(w.frames_written(), 2);
        w.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096 * 5);
    }

    #[test]
    fn writing_requires_open() {
        let cfg = cfg(AllocatorType::Default);
        let mut w = PrdFileSave::new("unused.prd", Arc::clone(&cfg), PrdOptions::default());
        assert!(matches!(
            w.write_frame(&frame(&cfg, 1)),
            Err(AcqError::State(_))
        ));
    }
}
