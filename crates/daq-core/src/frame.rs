//! Frames: one exposure's pixel bytes plus decoded metadata.
//!
//! A [`Frame`] is either *shallow* or *deep*:
//!
//! - **Shallow** frames point at a slot of the camera's circular receive
//!   buffer through a [`SlotRef`]. They never own pixel memory. The camera
//!   builds one shallow frame per slot and keeps them for the life of the
//!   acquisition.
//! - **Deep** frames own an aligned buffer of `frame_bytes`. They start as a
//!   shallow alias (see [`Frame::copy_from`]) and take a private copy on
//!   [`Frame::copy_data`], after which the camera may overwrite the slot.
//!
//! Frames are shared across pipeline threads, so every mutable part lives
//! behind a `parking_lot::RwLock`. The [`AcqCfg`] is fixed at construction.
//!
//! Decoded metadata is built lazily on first access and cached until the
//! frame is reassigned.

use crate::error::{AcqError, AcqResult};
use crate::metadata::FrameMetadata;
use crate::region::Region;
use crate::trajectory::Trajectories;
use daq_pool::{AlignedBuf, AllocatorType, PAGE_SIZE};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

// =============================================================================
// Acquisition configuration
// =============================================================================

/// Pixel layout of an assembled bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BitmapFormat {
    Mono8,
    #[default]
    Mono16,
    Mono32,
    Rgb24,
    Rgb48,
}

impl BitmapFormat {
    #[must_use]
    pub const fn samples_per_pixel(self) -> usize {
        match self {
            BitmapFormat::Mono8 | BitmapFormat::Mono16 | BitmapFormat::Mono32 => 1,
            BitmapFormat::Rgb24 | BitmapFormat::Rgb48 => 3,
        }
    }

    #[must_use]
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            BitmapFormat::Mono8 | BitmapFormat::Rgb24 => 1,
            BitmapFormat::Mono16 | BitmapFormat::Rgb48 => 2,
            BitmapFormat::Mono32 => 4,
        }
    }

    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        self.samples_per_pixel() * self.bytes_per_sample()
    }

    #[must_use]
    pub const fn is_color(self) -> bool {
        self.samples_per_pixel() == 3
    }

    /// Colour counterpart with the same sample width.
    #[must_use]
    pub const fn to_color(self) -> Option<BitmapFormat> {
        match self {
            BitmapFormat::Mono8 => Some(BitmapFormat::Rgb24),
            BitmapFormat::Mono16 => Some(BitmapFormat::Rgb48),
            BitmapFormat::Rgb24 | BitmapFormat::Rgb48 => Some(self),
            BitmapFormat::Mono32 => None,
        }
    }

    /// Raw image-format code written to the PRD header.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            BitmapFormat::Mono16 => 0,
            BitmapFormat::Mono8 => 2,
            BitmapFormat::Mono32 => 4,
            BitmapFormat::Rgb24 => 6,
            BitmapFormat::Rgb48 => 7,
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<BitmapFormat> {
        match code {
            0 => Some(BitmapFormat::Mono16),
            2 => Some(BitmapFormat::Mono8),
            4 => Some(BitmapFormat::Mono32),
            6 => Some(BitmapFormat::Rgb24),
            7 => Some(BitmapFormat::Rgb48),
            _ => None,
        }
    }
}

/// Everything needed to interpret a frame buffer. Shared by all frames of
/// one acquisition and never mutated after setup.
#[derive(Debug, Clone, PartialEq)]
pub struct AcqCfg {
    /// Size of one frame buffer as delivered by the camera, metadata included.
    pub frame_bytes: usize,
    pub roi_count: u16,
    pub bitmap_format: BitmapFormat,
    /// Bounding box of all output regions.
    pub implied_region: Region,
    pub regions: Vec<Region>,
    /// Buffers carry embedded frame metadata.
    pub has_metadata: bool,
    pub allocator: AllocatorType,
    pub bit_depth: u16,
    /// Bayer mask of a colour sensor, 0 for mono.
    pub color_mask: u8,
    /// The camera may deliver frames shorter than `frame_bytes`
    /// (centroid modes).
    pub frame_size_varies: bool,
}

impl AcqCfg {
    /// Single-region configuration without metadata.
    #[must_use]
    pub fn single_region(region: Region, bitmap_format: BitmapFormat, bit_depth: u16) -> Self {
        Self {
            frame_bytes: region.pixel_count() * bitmap_format.bytes_per_pixel(),
            roi_count: 1,
            bitmap_format,
            implied_region: region,
            regions: vec![region],
            has_metadata: false,
            allocator: AllocatorType::Default,
            bit_depth,
            color_mask: 0,
            frame_size_varies: false,
        }
    }

    #[must_use]
    pub fn with_allocator(mut self, allocator: AllocatorType) -> Self {
        self.allocator = allocator;
        self
    }
}

/// Per-frame identity and timing reported by the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    /// 1-based; 0 marks an invalid capture.
    pub frame_nr: u32,
    pub exposure_time: u32,
    /// Readout time in units of 10 ns.
    pub readout_time: u32,
    /// Beginning-of-frame timestamp in units of 100 ns.
    pub timestamp_bof: u64,
    /// End-of-frame timestamp in units of 100 ns.
    pub timestamp_eof: u64,
}

impl FrameInfo {
    #[must_use]
    pub fn new(frame_nr: u32) -> Self {
        Self {
            frame_nr,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.frame_nr > 0
    }
}

// =============================================================================
// Slot references
// =============================================================================

/// Storage that shallow frames alias, usually a camera's circular buffer.
pub trait SlotSource: Send + Sync {
    /// Run `f` over slot `index` if it still holds frame `frame_nr`.
    /// Returns `false` if the slot was reused or does not exist.
    fn with_slot(&self, index: usize, frame_nr: u32, f: &mut dyn FnMut(&[u8])) -> bool;
}

/// Back-reference by index into a [`SlotSource`].
#[derive(Clone)]
pub struct SlotRef {
    pub source: Weak<dyn SlotSource>,
    pub index: usize,
}

impl std::fmt::Debug for SlotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRef")
            .field("index", &self.index)
            .field("live", &(self.source.strong_count() > 0))
            .finish()
    }
}

// =============================================================================
// Frame
// =============================================================================

#[derive(Debug, Default)]
struct FrameInner {
    info: FrameInfo,
    slot: Option<SlotRef>,
    buffer: Option<AlignedBuf>,
    /// `buffer` holds the pixels for `info`.
    data_owned: bool,
    metadata: Option<Arc<FrameMetadata>>,
    trajectories: Option<Arc<Trajectories>>,
}

/// One exposure. See the module docs for shallow vs deep ownership.
#[derive(Debug)]
pub struct Frame {
    cfg: Arc<AcqCfg>,
    deep_copy: bool,
    inner: RwLock<FrameInner>,
}

impl Frame {
    /// Create an empty frame. Deep frames allocate their payload buffer here
    /// using the configured allocator.
    pub fn new(cfg: Arc<AcqCfg>, deep_copy: bool) -> AcqResult<Self> {
        let frame = Self {
            cfg,
            deep_copy,
            inner: RwLock::new(FrameInner::default()),
        };
        if deep_copy {
            frame.allocate_data()?;
        }
        Ok(frame)
    }

    /// Shallow frame aliasing slot `index` of `source`.
    pub fn new_shallow(cfg: Arc<AcqCfg>, source: Weak<dyn SlotSource>, index: usize) -> Self {
        Self {
            cfg,
            deep_copy: false,
            inner: RwLock::new(FrameInner {
                slot: Some(SlotRef { source, index }),
                ..Default::default()
            }),
        }
    }

    #[must_use]
    pub fn cfg(&self) -> &Arc<AcqCfg> {
        &self.cfg
    }

    #[must_use]
    pub fn is_deep_copy(&self) -> bool {
        self.deep_copy
    }

    #[must_use]
    pub fn info(&self) -> FrameInfo {
        self.inner.read().info
    }

    #[must_use]
    pub fn frame_nr(&self) -> u32 {
        self.inner.read().info.frame_nr
    }

    /// Replace the info record and drop cached metadata. An owned payload
    /// is kept.
    pub fn set_info(&self, info: FrameInfo) {
        let mut inner = self.inner.write();
        inner.info = info;
        inner.metadata = None;
    }

    /// Slot this frame currently aliases, if any.
    #[must_use]
    pub fn slot_index(&self) -> Option<usize> {
        self.inner.read().slot.as_ref().map(|s| s.index)
    }

    /// Allocate the private payload buffer (idempotent).
    pub fn allocate_data(&self) -> AcqResult<()> {
        let mut inner = self.inner.write();
        if inner.buffer.is_none() {
            let size = self.cfg.allocator.aligned_size(self.cfg.frame_bytes.max(1));
            inner.buffer = Some(self.cfg.allocator.allocate(size)?);
        }
        Ok(())
    }

    /// Touch every page of the payload buffer so the first deep copy does not
    /// pay for page faults.
    pub fn prefetch(&self) {
        let mut inner = self.inner.write();
        if let Some(buf) = inner.buffer.as_mut() {
            for page in buf.as_mut_slice().chunks_mut(PAGE_SIZE) {
                page[0] = 0;
            }
        }
    }

    /// Make this frame a shallow alias of `other`: take its info and slot
    /// reference, drop any cached metadata and trajectories.
    ///
    /// Fails if the two frames were built for different configurations.
    pub fn copy_from(&self, other: &Frame) -> AcqResult<()> {
        if !Arc::ptr_eq(&self.cfg, &other.cfg) && *self.cfg != *other.cfg {
            return Err(AcqError::state(
                "cannot copy a frame built for a different acquisition config",
            ));
        }
        let (info, slot) = {
            let src = other.inner.read();
            (src.info, src.slot.clone())
        };
        let mut inner = self.inner.write();
        inner.info = info;
        inner.slot = slot;
        inner.data_owned = false;
        inner.metadata = None;
        inner.trajectories = None;
        Ok(())
    }

    /// Take a private copy of the aliased slot. No-op for shallow frames.
    pub fn copy_data(&self) -> AcqResult<()> {
        if !self.deep_copy {
            return Ok(());
        }
        let mut inner = self.inner.write();
        let inner = &mut *inner;
        if inner.data_owned {
            return Ok(());
        }
        let Some(slot) = inner.slot.clone() else {
            return Err(AcqError::state("frame has no source slot to copy from"));
        };
        let Some(source) = slot.source.upgrade() else {
            return Err(AcqError::state("camera buffer released before deep copy"));
        };
        let Some(buffer) = inner.buffer.as_mut() else {
            return Err(AcqError::state("deep frame has no payload buffer"));
        };
        let frame_bytes = self.cfg.frame_bytes;
        let mut copied = 0usize;
        let found = source.with_slot(slot.index, inner.info.frame_nr, &mut |src| {
            let n = src.len().min(frame_bytes);
            buffer.as_mut_slice()[..n].copy_from_slice(&src[..n]);
            copied = n;
        });
        if !found {
            return Err(AcqError::state(format!(
                "slot {} no longer holds frame {}",
                slot.index, inner.info.frame_nr
            )));
        }
        inner.data_owned = copied > 0;
        Ok(())
    }

    /// Write pixels directly into a deep frame's buffer, bypassing any slot.
    pub fn fill_data(&self, f: impl FnOnce(&mut [u8])) -> AcqResult<()> {
        if !self.deep_copy {
            return Err(AcqError::state("shallow frames do not own pixel data"));
        }
        let mut inner = self.inner.write();
        let frame_bytes = self.cfg.frame_bytes;
        let Some(buffer) = inner.buffer.as_mut() else {
            return Err(AcqError::state("deep frame has no payload buffer"));
        };
        f(&mut buffer.as_mut_slice()[..frame_bytes]);
        inner.data_owned = true;
        inner.metadata = None;
        Ok(())
    }

    /// Run `f` over the frame's `frame_bytes` of payload, wherever it lives.
    /// Returns `None` if there is no data (empty shell or reused slot).
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let inner = self.inner.read();
        if inner.data_owned {
            let buf = inner.buffer.as_ref()?;
            return Some(f(&buf.as_slice()[..self.cfg.frame_bytes]));
        }
        let slot = inner.slot.as_ref()?;
        let source = slot.source.upgrade()?;
        let mut f = Some(f);
        let mut out = None;
        source.with_slot(slot.index, inner.info.frame_nr, &mut |bytes| {
            if let Some(f) = f.take() {
                out = Some(f(bytes));
            }
        });
        out
    }

    /// Like [`Frame::with_data`] but hands out the whole aligned buffer
    /// (length rounded up to the allocator alignment, padding zeroed).
    /// Only available for deep frames holding their own copy.
    pub fn with_aligned_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let inner = self.inner.read();
        if !inner.data_owned {
            return None;
        }
        inner.buffer.as_ref().map(|b| f(b.as_slice()))
    }

    /// Decoded camera metadata, decoding on first access.
    ///
    /// `Ok(None)` when the configuration carries no metadata.
    pub fn metadata(&self) -> AcqResult<Option<Arc<FrameMetadata>>> {
        if !self.cfg.has_metadata {
            return Ok(None);
        }
        if let Some(md) = self.inner.read().metadata.clone() {
            return Ok(Some(md));
        }
        let decoded = self
            .with_data(FrameMetadata::decode)
            .ok_or_else(|| AcqError::format("frame has no data to decode metadata from"))??;
        let md = Arc::new(decoded);
        self.inner.write().metadata = Some(Arc::clone(&md));
        Ok(Some(md))
    }

    #[must_use]
    pub fn trajectories(&self) -> Option<Arc<Trajectories>> {
        self.inner.read().trajectories.clone()
    }

    pub fn set_trajectories(&self, trajectories: Option<Arc<Trajectories>>) {
        self.inner.write().trajectories = trajectories;
    }

    /// Clear per-frame state for reuse. Keeps the payload allocation.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.info = FrameInfo::default();
        inner.slot = None;
        inner.data_owned = false;
        inner.metadata = None;
        inner.trajectories = None;
    }
}
