//! Writer interface shared by the PRD and TIFF backends.

use daq_core::frame::Frame;
use daq_core::{AcqError, AcqResult};
use std::path::Path;

/// One output file receiving frames in acquisition order.
pub trait FileSave: Send {
    /// Create the file. Fails if it cannot be created.
    fn open(&mut self) -> AcqResult<()>;

    fn is_open(&self) -> bool;

    /// Append one frame. The frame must be built for the configuration the
    /// writer was created with.
    fn write_frame(&mut self, frame: &Frame) -> AcqResult<()>;

    /// Finish the file. Idempotent.
    fn close(&mut self) -> AcqResult<()>;

    fn frames_written(&self) -> u32;

    fn path(&self) -> &Path;
}

/// Frames that fit one file of at most `max_stack_size` bytes, given the
/// bytes spent once per file and per frame.
///
/// `max_stack_size == 0` means one frame per file. Otherwise at least two
/// frames must fit.
pub fn max_frames_per_file(
    max_stack_size: u64,
    file_overhead: usize,
    frame_size: usize,
) -> AcqResult<usize> {
    if max_stack_size == 0 {
        return Ok(1);
    }
    let frames = (max_stack_size.saturating_sub(file_overhead as u64)) / frame_size.max(1) as u64;
    if frames < 2 {
        return Err(AcqError::config(format!(
            "stack size {max_stack_size} B holds {frames} frame(s) of {frame_size} B, at least 2 required"
        )));
    }
    Ok(usize::try_from(frames).unwrap_or(usize::MAX))
}
