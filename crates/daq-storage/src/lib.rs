//! `daq-storage`
//!
//! Persistence for acquired frames.
//!
//! - [`prd`]: the PRD record-stream format (header, per-frame metadata,
//!   trajectory snapshots)
//! - [`PrdFileSave`] / [`PrdReader`]: writing and reading PRD stacks, with
//!   direct I/O for page-aligned buffers
//! - [`TiffFileSave`]: TIFF and BigTIFF stacks, one page per frame, with
//!   optional Bayer demosaicing through [`ColorContext`]
//! - [`StorageFactory`]: builds the writer for each output file of a run

pub mod bitmap;
pub mod color;
pub mod factory;
pub mod file_save;
pub mod prd;
pub mod prd_reader;
pub mod prd_writer;
pub mod tiff_writer;

pub use bitmap::{assemble, Bitmap};
pub use color::{BayerDebayer, BayerPattern, ColorContext, Debayer};
pub use factory::{DefaultStorageFactory, StorageFactory};
pub use file_save::{max_frames_per_file, FileSave};
pub use prd::{PrdHeader, PrdMetaData};
pub use prd_reader::{PrdReader, PrdRecord};
pub use prd_writer::{header_alignment, PrdFileSave, PrdOptions};
pub use tiff_writer::TiffFileSave;
