//! Camera-embedded frame metadata.
//!
//! When metadata is enabled, each frame buffer delivered by the camera starts
//! with a packed frame header followed by one header per ROI, each ROI header
//! followed by its extended metadata and pixel data:
//!
//! ```text
//! FrameHeader (48) | frame ext md | { RoiHeader (32) | roi ext md | roi data } x roiCount
//! ```
//!
//! All integers are little-endian. Extended metadata is a sequence of
//! self-describing items `tag:u8 type:u8 size:u16 value[size]`.
//!
//! [`FrameMetadata::decode`] parses a buffer; [`MetadataBuilder`] produces
//! one (used by the fake camera and by tests).

use crate::error::{AcqError, AcqResult};
use crate::region::Region;
use std::collections::BTreeMap;

pub const MD_FRAME_SIGNATURE: u32 = 0x0051_4D50;
pub const MD_FRAME_VERSION: u8 = 3;
pub const MD_FRAME_HEADER_SIZE: usize = 48;
pub const MD_ROI_HEADER_SIZE: usize = 32;
pub const MD_EXT_ITEM_HEADER_SIZE: usize = 4;

pub const MD_ROI_FLAG_INVALID: u8 = 0x01;
pub const MD_ROI_FLAG_HEADER_ONLY: u8 = 0x02;

pub const EXT_TAG_PARTICLE_ID: u8 = 6;
pub const EXT_TAG_PARTICLE_M0: u8 = 7;
pub const EXT_TAG_PARTICLE_M2: u8 = 8;

pub const EXT_TYPE_UNS8: u8 = 1;
pub const EXT_TYPE_UNS32: u8 = 2;
pub const EXT_TYPE_UNS16: u8 = 3;

// =============================================================================
// Byte cursor
// =============================================================================

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    fn take(&mut self, n: usize) -> AcqResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        let Some(end) = end else {
            return Err(AcqError::format(format!(
                "{} truncated: need {} bytes at offset {}, have {}",
                self.what,
                n,
                self.pos,
                self.buf.len()
            )));
        };
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> AcqResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> AcqResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> AcqResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn region(&mut self) -> AcqResult<Region> {
        Ok(Region {
            s1: self.u16()?,
            s2: self.u16()?,
            sbin: self.u16()?,
            p1: self.u16()?,
            p2: self.u16()?,
            pbin: self.u16()?,
        })
    }
}

fn put_region(out: &mut Vec<u8>, r: &Region) {
    for v in [r.s1, r.s2, r.sbin, r.p1, r.p2, r.pbin] {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

// =============================================================================
// Extended metadata
// =============================================================================

/// One tagged extended-metadata item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtItem {
    pub tag: u8,
    pub value_type: u8,
    pub value: Vec<u8>,
}

impl ExtItem {
    #[must_use]
    pub fn uns32(tag: u8, value: u32) -> Self {
        Self {
            tag,
            value_type: EXT_TYPE_UNS32,
            value: value.to_le_bytes().to_vec(),
        }
    }

    /// Read the value as a 4-byte unsigned integer, rejecting any other type
    /// or size.
    pub fn strict_u32(&self) -> AcqResult<u32> {
        if self.value_type != EXT_TYPE_UNS32 || self.value.len() != 4 {
            return Err(AcqError::format(format!(
                "extended metadata tag {} has type {} size {}, expected uns32 size 4",
                self.tag,
                self.value_type,
                self.value.len()
            )));
        }
        Ok(u32::from_le_bytes([
            self.value[0],
            self.value[1],
            self.value[2],
            self.value[3],
        ]))
    }

    fn encoded_len(&self) -> usize {
        MD_EXT_ITEM_HEADER_SIZE + self.value.len()
    }
}

/// Collection of extended-metadata items for a frame or ROI.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtMetadata {
    pub items: Vec<ExtItem>,
}

impl ExtMetadata {
    pub fn decode(bytes: &[u8]) -> AcqResult<Self> {
        let mut cur = Cursor::new(bytes, "extended metadata");
        let mut items = Vec::new();
        while cur.pos < bytes.len() {
            let tag = cur.u8()?;
            let value_type = cur.u8()?;
            let size = cur.u16()? as usize;
            let value = cur.take(size)?.to_vec();
            items.push(ExtItem {
                tag,
                value_type,
                value,
            });
        }
        Ok(Self { items })
    }

    pub fn push(&mut self, item: ExtItem) {
        self.items.push(item);
    }

    #[must_use]
    pub fn get(&self, tag: u8) -> Option<&ExtItem> {
        self.items.iter().find(|i| i.tag == tag)
    }

    /// `Ok(None)` if the tag is absent, an error if present but not a 4-byte
    /// unsigned value.
    pub fn get_u32(&self, tag: u8) -> AcqResult<Option<u32>> {
        self.get(tag).map(ExtItem::strict_u32).transpose()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.items.iter().map(ExtItem::encoded_len).sum()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        for item in &self.items {
            out.push(item.tag);
            out.push(item.value_type);
            out.extend_from_slice(&(item.value.len() as u16).to_le_bytes());
            out.extend_from_slice(&item.value);
        }
    }
}

// =============================================================================
// Headers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MdFrameHeader {
    pub version: u8,
    pub frame_nr: u32,
    pub roi_count: u16,
    pub timestamp_bof: u32,
    pub timestamp_eof: u32,
    pub timestamp_res_ns: u32,
    pub exposure_time: u32,
    pub exposure_time_res_ns: u32,
    pub roi_timestamp_res_ns: u32,
    pub bit_depth: u8,
    pub color_mask: u8,
    pub flags: u8,
    pub extended_md_size: u16,
    pub image_format: u8,
    pub image_compression: u8,
}

impl MdFrameHeader {
    fn read(cur: &mut Cursor<'_>) -> AcqResult<Self> {
        let signature = cur.u32()?;
        if signature != MD_FRAME_SIGNATURE {
            return Err(AcqError::format(format!(
                "bad frame metadata signature {signature:#010x}"
            )));
        }
        let h = Self {
            version: cur.u8()?,
            frame_nr: cur.u32()?,
            roi_count: cur.u16()?,
            timestamp_bof: cur.u32()?,
            timestamp_eof: cur.u32()?,
            timestamp_res_ns: cur.u32()?,
            exposure_time: cur.u32()?,
            exposure_time_res_ns: cur.u32()?,
            roi_timestamp_res_ns: cur.u32()?,
            bit_depth: cur.u8()?,
            color_mask: cur.u8()?,
            flags: cur.u8()?,
            extended_md_size: cur.u16()?,
            image_format: cur.u8()?,
            image_compression: cur.u8()?,
        };
        cur.take(6)?;
        Ok(h)
    }

    fn write(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&MD_FRAME_SIGNATURE.to_le_bytes());
        out.push(self.version);
        out.extend_from_slice(&self.frame_nr.to_le_bytes());
        out.extend_from_slice(&self.roi_count.to_le_bytes());
        out.extend_from_slice(&self.timestamp_bof.to_le_bytes());
        out.extend_from_slice(&self.timestamp_eof.to_le_bytes());
        out.extend_from_slice(&self.timestamp_res_ns.to_le_bytes());
        out.extend_from_slice(&self.exposure_time.to_le_bytes());
        out.extend_from_slice(&self.exposure_time_res_ns.to_le_bytes());
        out.extend_from_slice(&self.roi_timestamp_res_ns.to_le_bytes());
        out.push(self.bit_depth);
        out.push(self.color_mask);
        out.push(self.flags);
        out.extend_from_slice(&self.extended_md_size.to_le_bytes());
        out.push(self.image_format);
        out.push(self.image_compression);
        out.resize(start + MD_FRAME_HEADER_SIZE, 0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdRoiHeader {
    pub roi_nr: u16,
    pub timestamp_bor: u32,
    pub timestamp_eor: u32,
    pub region: Region,
    pub flags: u8,
    pub extended_md_size: u16,
    pub roi_data_size: u32,
}

impl MdRoiHeader {
    fn read(cur: &mut Cursor<'_>) -> AcqResult<Self> {
        let h = Self {
            roi_nr: cur.u16()?,
            timestamp_bor: cur.u32()?,
            timestamp_eor: cur.u32()?,
            region: cur.region()?,
            flags: cur.u8()?,
            extended_md_size: cur.u16()?,
            roi_data_size: cur.u32()?,
        };
        cur.take(3)?;
        Ok(h)
    }

    fn write(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&self.roi_nr.to_le_bytes());
        out.extend_from_slice(&self.timestamp_bor.to_le_bytes());
        out.extend_from_slice(&self.timestamp_eor.to_le_bytes());
        put_region(out, &self.region);
        out.push(self.flags);
        out.extend_from_slice(&self.extended_md_size.to_le_bytes());
        out.extend_from_slice(&self.roi_data_size.to_le_bytes());
        out.resize(start + MD_ROI_HEADER_SIZE, 0);
    }
}

/// A decoded ROI: header, extended metadata, and where its pixels live in
/// the frame buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdRoi {
    pub header: MdRoiHeader,
    pub ext: ExtMetadata,
    pub data_offset: usize,
    pub data_len: usize,
}

impl MdRoi {
    #[must_use]
    pub fn is_header_only(&self) -> bool {
        self.header.flags & MD_ROI_FLAG_HEADER_ONLY != 0
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.header.flags & MD_ROI_FLAG_INVALID != 0
    }
}

/// Fully decoded frame metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub header: MdFrameHeader,
    pub ext: ExtMetadata,
    pub rois: Vec<MdRoi>,
}

impl FrameMetadata {
    pub fn decode(bytes: &[u8]) -> AcqResult<Self> {
        let mut cur = Cursor::new(bytes, "frame metadata");
        let header = MdFrameHeader::read(&mut cur)?;
        let ext = ExtMetadata::decode(cur.take(header.extended_md_size as usize)?)?;

        let mut rois = Vec::with_capacity(header.roi_count as usize);
        for _ in 0..header.roi_count {
            let roi_header = MdRoiHeader::read(&mut cur)?;
            let roi_ext = ExtMetadata::decode(cur.take(roi_header.extended_md_size as usize)?)?;
            let data_offset = cur.pos;
            let data_len = roi_header.roi_data_size as usize;
            cur.take(data_len)?;
            rois.push(MdRoi {
                header: roi_header,
                ext: roi_ext,
                data_offset,
                data_len,
            });
        }
        Ok(Self { header, ext, rois })
    }

    #[must_use]
    pub fn roi(&self, roi_nr: u16) -> Option<&MdRoi> {
        self.rois.iter().find(|r| r.header.roi_nr == roi_nr)
    }

    /// Extended metadata indexed by ROI number.
    #[must_use]
    pub fn ext_index(&self) -> BTreeMap<u16, &ExtMetadata> {
        self.rois
            .iter()
            .map(|r| (r.header.roi_nr, &r.ext))
            .collect()
    }

    /// ROIs that carry pixel data (neither header-only nor invalid).
    pub fn data_rois(&self) -> impl Iterator<Item = &MdRoi> {
        self.rois
            .iter()
            .filter(|r| !r.is_header_only() && !r.is_invalid())
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Builds a metadata-framed buffer.
#[derive(Debug, Clone, Default)]
pub struct MetadataBuilder {
    pub header: MdFrameHeader,
    pub ext: ExtMetadata,
    rois: Vec<(MdRoiHeader, ExtMetadata)>,
}

impl MetadataBuilder {
    #[must_use]
    pub fn new(header: MdFrameHeader) -> Self {
        Self {
            header,
            ext: ExtMetadata::default(),
            rois: Vec::new(),
        }
    }

    /// Append a ROI. Its data size is derived from the region and
    /// `bytes_per_pixel` unless `flags` marks it header-only.
    pub fn push_roi(
        &mut self,
        roi_nr: u16,
        region: Region,
        flags: u8,
        ext: ExtMetadata,
        bytes_per_pixel: usize,
    ) -> &mut Self {
        let roi_data_size = if flags & MD_ROI_FLAG_HEADER_ONLY != 0 {
            0
        } else {
            (region.pixel_count() * bytes_per_pixel) as u32
        };
        self.rois.push((
            MdRoiHeader {
                roi_nr,
                timestamp_bor: self.header.timestamp_bof,
                timestamp_eor: self.header.timestamp_eof,
                region,
                flags,
                extended_md_size: ext.encoded_len() as u16,
                roi_data_size,
            },
            ext,
        ));
        self
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        MD_FRAME_HEADER_SIZE
            + self.ext.encoded_len()
            + self
                .rois
                .iter()
                .map(|(h, e)| MD_ROI_HEADER_SIZE + e.encoded_len() + h.roi_data_size as usize)
                .sum::<usize>()
    }

    /// Serialise into `out`. `fill` is called for every ROI with data to
    /// produce its pixels.
    pub fn encode(&self, out: &mut Vec<u8>, mut fill: impl FnMut(usize, &mut [u8])) {
        let mut header = self.header;
        header.version = MD_FRAME_VERSION;
        header.roi_count = self.rois.len() as u16;
        header.extended_md_size = self.ext.encoded_len() as u16;
        header.write(out);
        self.ext.encode(out);
        for (i, (roi, ext)) in self.rois.iter().enumerate() {
            roi.write(out);
            ext.encode(out);
            let start = out.len();
            out.resize(start + roi.roi_data_size as usize, 0);
            fill(i, &mut out[start..]);
        }
    }
}

/// Worst-case buffer size for `roi_count` ROIs of `roi_data_bytes` each,
/// each carrying `roi_ext_bytes` of extended metadata.
#[must_use]
pub fn max_frame_bytes(roi_count: usize, roi_data_bytes: usize, roi_ext_bytes: usize) -> usize {
    MD_FRAME_HEADER_SIZE + roi_count * (MD_ROI_HEADER_SIZE + roi_ext_bytes + roi_data_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn particle_ext(id: Option<u32>, m0: u32, m2: u32) -> ExtMetadata {
        let mut ext = ExtMetadata::default();
        if let Some(id) = id {
            ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_ID, id));
        }
        ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_M0, m0));
        ext.push(ExtItem::uns32(EXT_TAG_PARTICLE_M2, m2));
        ext
    }

    #[test]
    fn decode_reads_rois_and_ext_items() {
        let mut b = MetadataBuilder::new(MdFrameHeader {
            frame_nr: 12,
            timestamp_bof: 100,
            timestamp_eof: 200,
            bit_depth: 16,
            ..Default::default()
        });
        b.push_roi(1, Region::from_rect(0, 0, 4, 4), 0, particle_ext(Some(5), 900, 1 << 19), 2);
        b.push_roi(2, Region::from_rect(8, 8, 2, 2), 0, particle_ext(None, 10, 20), 2);

        let mut buf = Vec::new();
        b.encode(&mut buf, |i, px| px.fill(i as u8 + 1));
        assert_eq!(buf.len(), b.encoded_len());

        let md = FrameMetadata::decode(&buf).unwrap();
        assert_eq!(md.header.frame_nr, 12);
        assert_eq!(md.header.roi_count, 2);
        assert_eq!(md.rois[0].data_len, 32);
        assert!(buf[md.rois[1].data_offset..][..8].iter().all(|&v| v == 2));

        let index = md.ext_index();
        assert_eq!(index[&1].get_u32(EXT_TAG_PARTICLE_ID).unwrap(), Some(5));
        assert_eq!(index[&2].get_u32(EXT_TAG_PARTICLE_ID).unwrap(), None);
        assert_eq!(index[&2].get_u32(EXT_TAG_PARTICLE_M2).unwrap(), Some(20));
    }

    #[test]
    fn header_only_rois_carry_no_data() {
        let mut b = MetadataBuilder::new(MdFrameHeader::default());
        b.push_roi(1, Region::from_rect(0, 0, 16, 16), MD_ROI_FLAG_HEADER_ONLY, ExtMetadata::default(), 2);
        let mut buf = Vec::new();
        b.encode(&mut buf, |_, _| {});
        let md = FrameMetadata::decode(&buf).unwrap();
        assert!(md.rois[0].is_header_only());
        assert_eq!(md.data_rois().count(), 0);
        assert_eq!(buf.len(), MD_FRAME_HEADER_SIZE + MD_ROI_HEADER_SIZE);
    }

    #[test]
    fn mistyped_item_is_rejected() {
        let mut ext = ExtMetadata::default();
        ext.push(ExtItem {
            tag: EXT_TAG_PARTICLE_M0,
            value_type: EXT_TYPE_UNS16,
            value: vec![1, 0],
        });
        assert!(matches!(ext.get_u32(EXT_TAG_PARTICLE_M0), Err(AcqError::Format(_))));
    }

    #[test]
    fn truncated_and_bad_signature() {
        assert!(FrameMetadata::decode(&[0u8; 10]).is_err());
        let mut buf = Vec::new();
        MetadataBuilder::new(MdFrameHeader::default()).encode(&mut buf, |_, _| {});
        buf[0] ^= 0xFF;
        let err = FrameMetadata::decode(&buf).unwrap_err();
        assert!(err.to_string().contains("signature"));
    }

    #[test]
    fn max_frame_bytes_matches_builder() {
        let region = Region::from_rect(0, 0, 8, 8);
        let ext = particle_ext(Some(1), 1, 1);
        let mut b = MetadataBuilder::new(MdFrameHeader::default());
        for nr in 1..=3 {
            b.push_roi(nr, region, 0, ext.clone(), 2);
        }
        assert_eq!(b.encoded_len(), max_frame_bytes(3, 128, ext.encoded_len()));
    }
}
