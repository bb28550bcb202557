//! Sequential reader for PRD files of any format version.

use crate::prd::{
    metadata_size_for_version, read_trajectories, PrdHeader, PrdMetaData, PRD_HEADER_SIZE,
};
use daq_core::trajectory::Trajectories;
use daq_core::{AcqError, AcqResult};
use daq_pool::aligned_size;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// One frame record.
#[derive(Debug, Clone, PartialEq)]
pub struct PrdRecord {
    pub meta: PrdMetaData,
    pub trajectories: Option<Trajectories>,
    /// Extended metadata not part of the fixed capacity, empty if absent.
    pub ext_dyn: Vec<u8>,
    /// `frame_size` bytes of raw frame data.
    pub payload: Vec<u8>,
}

pub struct PrdReader<R> {
    inner: R,
    header: PrdHeader,
    next_index: u32,
    failed: bool,
}

impl PrdReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> AcqResult<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> PrdReader<R> {
    /// Parse the header and position the reader at the first record.
    pub fn new(mut inner: R) -> AcqResult<Self> {
        let mut buf = [0u8; PRD_HEADER_SIZE];
        inner.read_exact(&mut buf).map_err(|e| {
            AcqError::format(format!("cannot read PRD header: {e}"))
        })?;
        let header = PrdHeader::read(&buf)?;
        inner.seek(SeekFrom::Start(header.header_block_size() as u64))?;
        Ok(Self {
            inner,
            header,
            next_index: 0,
            failed: false,
        })
    }

    #[must_use]
    pub fn header(&self) -> &PrdHeader {
        &self.header
    }

    fn read_block(&mut self, len: usize, what: &str) -> AcqResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).map_err(|e| {
            AcqError::format(format!(
                "record {}: truncated {what} ({len} bytes): {e}",
                self.next_index
            ))
        })?;
        Ok(buf)
    }

    fn read_record(&mut self) -> AcqResult<PrdRecord> {
        let align = self.header.alignment();
        let md_size = self.header.size_of_prd_metadata_struct as usize;
        let block = self.read_block(self.header.metadata_block_size(), "metadata")?;
        let meta = PrdMetaData::read(&block[..md_size], self.header.version)?;

        let base = metadata_size_for_version(self.header.version).unwrap_or(md_size);
        let trajectories = if meta.has_trajectories() {
            let end = (base + meta.ext_metadata_size as usize).min(md_size);
            Some(read_trajectories(&block[base..end])?)
        } else {
            None
        };

        let ext_dyn_len = meta.ext_dyn_metadata_size as usize;
        let ext_dyn = if ext_dyn_len > 0 {
            let mut block = self.read_block(aligned_size(ext_dyn_len, align), "dynamic metadata")?;
            block.truncate(ext_dyn_len);
            block
        } else {
            Vec::new()
        };

        let frame_size = self.header.frame_size as usize;
        let mut payload = self.read_block(self.header.payload_block_size(), "payload")?;
        payload.truncate(frame_size);

        self.next_index += 1;
        Ok(PrdRecord {
            meta,
            trajectories,
            ext_dyn,
            payload,
        })
    }
}

impl<R: Read + Seek> Iterator for PrdReader<R> {
    type Item = AcqResult<PrdRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next_index >= self.header.frame_count {
            return None;
        }
        let record = self.read_record();
        self.failed = record.is_err();
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.header.frame_count.saturating_sub(self.next_index) as usize;
        (0, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prd::{PRD_METADATA_SIZE, PRD_VERSION_0_5};
    use daq_core::frame::{AcqCfg, BitmapFormat, FrameInfo};
    use daq_core::region::Region;
    use std::io::Cursor;

    fn v5_file(frames: u32) -> Vec<u8> {
        let cfg = AcqCfg::single_region(Region::from_rect(0, 0, 4, 2), BitmapFormat::Mono8, 8);
        let mut header = PrdHeader::for_acquisition(&cfg, 0, 0, 0);
        header.version = PRD_VERSION_0_5;
        header.size_of_prd_metadata_struct = 44;
        header.frame_count = frames;
        let mut out = vec![0u8; PRD_HEADER_SIZE];
        header.write(&mut out);
        for nr in 1..=frames {
            let mut md = [0u8; PRD_METADATA_SIZE];
            PrdMetaData::from_info(&FrameInfo::new(nr), 1).write(&mut md);
            out.extend_from_slice(&md[..44]);
            out.extend_from_slice(&[nr as u8; 8]);
        }
        out
    }

    #[test]
    fn reads_old_version_records() {
        let reader = PrdReader::new(Cursor::new(v5_file(3))).unwrap();
        assert_eq!(reader.header().frame_count, 3);
        let records: Vec<_> = reader.collect::<AcqResult<_>>().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].meta.frame_number, 3);
        assert_eq!(records[2].payload, vec![3u8; 8]);
        assert!(records[0].trajectories.is_none());
    }

    #[test]
    fn truncated_file_yields_one_error() {
        let mut bytes = v5_file(2);
        bytes.truncate(bytes.len() - 4);
        let results: Vec<_> = PrdReader::new(Cursor::new(bytes)).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(AcqError::Format(_))));
    }

    #[test]
    fn rejects_non_prd_input() {
        let err = PrdReader::new(Cursor::new(vec![0u8; 64])).err().unwrap();
        assert!(matches!(err, AcqError::Format(_)));
    }
}
