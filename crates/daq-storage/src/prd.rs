//! PRD file format.
//!
//! A PRD file is a header followed by one record per frame:
//!
//! ```text
//! PrdHeader (aligned) || N × { PrdMetaData + ext (aligned) || ext-dyn (aligned) || payload (aligned) }
//! ```
//!
//! All integers are little-endian. Blocks are padded to the header's
//! `alignment` (0 means no padding). The per-frame metadata structure grew
//! over format versions 0.1 to 0.8; readers accept all of them, writers emit
//! 0.8.
//!
//! Extended metadata follows the base structure inside the metadata block.
//! Its capacity is fixed for a file and included in
//! `size_of_prd_metadata_struct`; the first extended block, when
//! [`PRD_EXT_FLAG_HAS_TRAJECTORIES`] is set, is the trajectory snapshot.

use daq_core::frame::{AcqCfg, FrameInfo};
use daq_core::region::Region;
use daq_core::trajectory::{Trajectories, Trajectory, TrajectoryPoint};
use daq_core::{AcqError, AcqResult};
use daq_pool::aligned_size;

/// `"PRD\0"` read as a little-endian `u32`.
pub const PRD_SIGNATURE: u32 = 0x0044_5250;

pub const PRD_VERSION_0_1: u16 = 0x01;
pub const PRD_VERSION_0_2: u16 = 0x02;
pub const PRD_VERSION_0_3: u16 = 0x03;
pub const PRD_VERSION_0_4: u16 = 0x04;
pub const PRD_VERSION_0_5: u16 = 0x05;
pub const PRD_VERSION_0_6: u16 = 0x06;
/// Adds header `frame_size` and [`PRD_FLAG_FRAME_SIZE_VARY`].
pub const PRD_VERSION_0_7: u16 = 0x07;
/// Adds header `alignment`.
pub const PRD_VERSION_0_8: u16 = 0x08;
pub const PRD_VERSION: u16 = PRD_VERSION_0_8;

pub const PRD_HEADER_SIZE: usize = 48;
pub const PRD_METADATA_SIZE: usize = 64;

/// Header flag: frames may be shorter than `frame_size`.
pub const PRD_FLAG_FRAME_SIZE_VARY: u32 = 0x01;
/// Metadata flag: a trajectory block follows the base structure.
pub const PRD_EXT_FLAG_HAS_TRAJECTORIES: u32 = 0x01;

pub const PRD_TRAJECTORIES_HEADER_SIZE: usize = 12;
pub const PRD_TRAJECTORY_HEADER_SIZE: usize = 16;
pub const PRD_TRAJECTORY_POINT_SIZE: usize = 8;

/// Size of the base metadata structure written by `version`.
#[must_use]
pub fn metadata_size_for_version(version: u16) -> Option<usize> {
    match version {
        PRD_VERSION_0_1 => Some(12),
        PRD_VERSION_0_2 => Some(20),
        PRD_VERSION_0_3 => Some(24),
        PRD_VERSION_0_4 => Some(32),
        PRD_VERSION_0_5 => Some(44),
        PRD_VERSION_0_6..=PRD_VERSION_0_8 => Some(PRD_METADATA_SIZE),
        _ => None,
    }
}

/// Bytes reserved per frame for a trajectory snapshot.
#[must_use]
pub fn trajectories_capacity(max_trajectories: u32, max_points: u32) -> usize {
    PRD_TRAJECTORIES_HEADER_SIZE
        + max_trajectories as usize
            * (PRD_TRAJECTORY_HEADER_SIZE + max_points as usize * PRD_TRAJECTORY_POINT_SIZE)
}

// =============================================================================
// Little-endian field helpers
// =============================================================================

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn get_f32(buf: &[u8], at: usize) -> f32 {
    f32::from_bits(get_u32(buf, at))
}

// =============================================================================
// Header
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrdHeader {
    pub version: u16,
    pub bit_depth: u16,
    pub flags: u32,
    pub region: Region,
    /// Exposure resolution index of the camera (`EXP_RES`).
    pub exposure_resolution: u16,
    /// 0, or a power of two at least one page.
    pub alignment: u16,
    pub frame_count: u32,
    /// Base metadata structure plus the fixed extended capacity.
    pub size_of_prd_metadata_struct: u32,
    pub frame_size: u32,
    pub color_mask: u8,
    pub image_format: u8,
}

impl PrdHeader {
    /// Header for frames described by `cfg`, with `ext_capacity` bytes of
    /// extended metadata reserved per frame.
    #[must_use]
    pub fn for_acquisition(
        cfg: &AcqCfg,
        exposure_resolution: u16,
        alignment: u16,
        ext_capacity: usize,
    ) -> Self {
        Self {
            version: PRD_VERSION,
            bit_depth: cfg.bit_depth,
            flags: if cfg.frame_size_varies {
                PRD_FLAG_FRAME_SIZE_VARY
            } else {
                0
            },
            region: cfg.implied_region,
            exposure_resolution,
            alignment,
            frame_count: 0,
            size_of_prd_metadata_struct: (PRD_METADATA_SIZE + ext_capacity) as u32,
            frame_size: cfg.frame_bytes as u32,
            color_mask: cfg.color_mask,
            image_format: cfg.bitmap_format.code(),
        }
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        usize::from(self.alignment)
    }

    #[must_use]
    pub fn header_block_size(&self) -> usize {
        aligned_size(PRD_HEADER_SIZE, self.alignment())
    }

    #[must_use]
    pub fn metadata_block_size(&self) -> usize {
        aligned_size(self.size_of_prd_metadata_struct as usize, self.alignment())
    }

    #[must_use]
    pub fn payload_block_size(&self) -> usize {
        aligned_size(self.frame_size as usize, self.alignment())
    }

    /// Size of one record without an extended-dynamic block.
    #[must_use]
    pub fn record_size(&self) -> usize {
        self.metadata_block_size() + self.payload_block_size()
    }

    #[must_use]
    pub fn frame_size_varies(&self) -> bool {
        self.flags & PRD_FLAG_FRAME_SIZE_VARY != 0
    }

    /// Serialise into the first [`PRD_HEADER_SIZE`] bytes of `buf`.
    pub fn write(&self, buf: &mut [u8]) {
        buf[..PRD_HEADER_SIZE].fill(0);
        put_u32(buf, 0, PRD_SIGNATURE);
        put_u16(buf, 4, self.version);
        put_u16(buf, 6, self.bit_depth);
        put_u32(buf, 8, self.flags);
        let r = &self.region;
        for (i, v) in [r.s1, r.s2, r.sbin, r.p1, r.p2, r.pbin].into_iter().enumerate() {
            put_u16(buf, 12 + 2 * i, v);
        }
        put_u16(buf, 24, self.exposure_resolution);
        put_u16(buf, 26, self.alignment);
        put_u32(buf, 28, self.frame_count);
        put_u32(buf, 32, self.size_of_prd_metadata_struct);
        put_u32(buf, 36, self.frame_size);
        buf[40] = self.color_mask;
        buf[41] = self.image_format;
    }

    /// Parse and validate a header. Fields newer than the file's version
    /// get the values older writers implied.
    pub fn read(buf: &[u8]) -> AcqResult<Self> {
        if buf.len() < PRD_HEADER_SIZE {
            return Err(AcqError::format(format!(
                "PRD header needs {PRD_HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let signature = get_u32(buf, 0);
        if signature != PRD_SIGNATURE {
            return Err(AcqError::format(format!(
                "not a PRD file (signature {signature:#010x})"
            )));
        }
        let version = get_u16(buf, 4);
        let base = metadata_size_for_version(version)
            .ok_or_else(|| AcqError::format(format!("unsupported PRD version {version:#06x}")))?;
        let region = Region::new(
            get_u16(buf, 12),
            get_u16(buf, 14),
            get_u16(buf, 16),
            get_u16(buf, 18),
            get_u16(buf, 20),
            get_u16(buf, 22),
        );
        let bit_depth = get_u16(buf, 6);
        let size_of_md = match get_u32(buf, 32) {
            0 => base as u32,
            n => n,
        };
        let frame_size = if version >= PRD_VERSION_0_7 {
            get_u32(buf, 36)
        } else {
            let bytes = if bit_depth > 8 { 2 } else { 1 };
            (region.pixel_count() * bytes) as u32
        };
        let header = Self {
            version,
            bit_depth,
            flags: if version >= PRD_VERSION_0_7 { get_u32(buf, 8) } else { 0 },
            region,
            exposure_resolution: get_u16(buf, 24),
            alignment: if version >= PRD_VERSION_0_8 { get_u16(buf, 26) } else { 0 },
            frame_count: get_u32(buf, 28),
            size_of_prd_metadata_struct: size_of_md,
            frame_size,
            color_mask: buf[40],
            image_format: buf[41],
        };
        if header.alignment != 0 && !header.alignment.is_power_of_two() {
            return Err(AcqError::format(format!(
                "PRD alignment {} is not a power of two",
                header.alignment
            )));
        }
        if (header.size_of_prd_metadata_struct as usize) < base {
            return Err(AcqError::format(format!(
                "PRD metadata size {} smaller than version {version} base {base}",
                header.size_of_prd_metadata_struct
            )));
        }
        Ok(header)
    }
}

// =============================================================================
// Per-frame metadata
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PrdMetaData {
    pub frame_number: u32,
    /// Units of 10 ns.
    pub readout_time: u32,
    pub exposure_time: u32,
    pub bof_time: u32,
    pub eof_time: u32,
    pub roi_count: u16,
    pub bof_time_high: u32,
    pub eof_time_high: u32,
    pub ext_flags: u32,
    pub ext_metadata_size: u32,
    pub ext_dyn_metadata_size: u32,
    pub color_wb_scale_red: f32,
    pub color_wb_scale_green: f32,
    pub color_wb_scale_blue: f32,
}

impl PrdMetaData {
    #[must_use]
    pub fn from_info(info: &FrameInfo, roi_count: u16) -> Self {
        Self {
            frame_number: info.frame_nr,
            readout_time: info.readout_time,
            exposure_time: info.exposure_time,
            bof_time: info.timestamp_bof as u32,
            eof_time: info.timestamp_eof as u32,
            roi_count,
            bof_time_high: (info.timestamp_bof >> 32) as u32,
            eof_time_high: (info.timestamp_eof >> 32) as u32,
            color_wb_scale_red: 1.0,
            color_wb_scale_green: 1.0,
            color_wb_scale_blue: 1.0,
            ..Default::default()
        }
    }

    /// Begin-of-frame timestamp in 100 ns units.
    #[must_use]
    pub fn timestamp_bof(&self) -> u64 {
        (u64::from(self.bof_time_high) << 32) | u64::from(self.bof_time)
    }

    /// End-of-frame timestamp in 100 ns units.
    #[must_use]
    pub fn timestamp_eof(&self) -> u64 {
        (u64::from(self.eof_time_high) << 32) | u64::from(self.eof_time)
    }

    #[must_use]
    pub fn has_trajectories(&self) -> bool {
        self.ext_flags & PRD_EXT_FLAG_HAS_TRAJECTORIES != 0
    }

    /// Serialise the version 0.8 structure into the first
    /// [`PRD_METADATA_SIZE`] bytes of `buf`.
    pub fn write(&self, buf: &mut [u8]) {
        buf[..PRD_METADATA_SIZE].fill(0);
        put_u32(buf, 0, self.frame_number);
        put_u32(buf, 4, self.readout_time);
        put_u32(buf, 8, self.exposure_time);
        put_u32(buf, 12, self.bof_time);
        put_u32(buf, 16, self.eof_time);
        put_u16(buf, 20, self.roi_count);
        put_u32(buf, 24, self.bof_time_high);
        put_u32(buf, 28, self.eof_time_high);
        put_u32(buf, 32, self.ext_flags);
        put_u32(buf, 36, self.ext_metadata_size);
        put_u32(buf, 40, self.ext_dyn_metadata_size);
        put_u32(buf, 44, self.color_wb_scale_red.to_bits());
        put_u32(buf, 48, self.color_wb_scale_green.to_bits());
        put_u32(buf, 52, self.color_wb_scale_blue.to_bits());
    }

    /// Parse the structure written by `version`; missing fields default.
    pub fn read(buf: &[u8], version: u16) -> AcqResult<Self> {
        let size = metadata_size_for_version(version)
            .ok_or_else(|| AcqError::format(format!("unsupported PRD version {version:#06x}")))?;
        if buf.len() < size {
            return Err(AcqError::format(format!(
                "PRD metadata needs {size} bytes, got {}",
                buf.len()
            )));
        }
        let mut md = Self {
            frame_number: get_u32(buf, 0),
            readout_time: get_u32(buf, 4),
            exposure_time: get_u32(buf, 8),
            color_wb_scale_red: 1.0,
            color_wb_scale_green: 1.0,
            color_wb_scale_blue: 1.0,
            ..Default::default()
        };
        if size >= 20 {
            md.bof_time = get_u32(buf, 12);
            md.eof_time = get_u32(buf, 16);
        }
        if size >= 24 {
            md.roi_count = get_u16(buf, 20);
        }
        if size >= 32 {
            md.bof_time_high = get_u32(buf, 24);
            md.eof_time_high = get_u32(buf, 28);
        }
        if size >= 44 {
            md.ext_flags = get_u32(buf, 32);
            md.ext_metadata_size = get_u32(buf, 36);
            md.ext_dyn_metadata_size = get_u32(buf, 40);
        }
        if size >= 56 {
            md.color_wb_scale_red = get_f32(buf, 44);
            md.color_wb_scale_green = get_f32(buf, 48);
            md.color_wb_scale_blue = get_f32(buf, 52);
        }
        Ok(md)
    }
}

// =============================================================================
// Trajectories block
// =============================================================================

/// Serialise `set` into `buf` using the file's capacities. `buf` must hold
/// [`trajectories_capacity`] bytes. Trajectories beyond `max_trajectories`
/// and the oldest points beyond `max_points` are left out. Returns the
/// number of bytes used.
pub fn write_trajectories(
    set: &Trajectories,
    max_trajectories: u32,
    max_points: u32,
    buf: &mut [u8],
) -> AcqResult<usize> {
    let size = trajectories_capacity(max_trajectories, max_points);
    if buf.len() < size {
        return Err(AcqError::format(format!(
            "trajectory block needs {size} bytes, buffer has {}",
            buf.len()
        )));
    }
    let buf = &mut buf[..size];
    buf.fill(0);
    let count = set.trajectories.len().min(max_trajectories as usize);
    put_u32(buf, 0, max_trajectories);
    put_u32(buf, 4, max_points);
    put_u32(buf, 8, count as u32);

    let max_points = max_points as usize;
    let stride = PRD_TRAJECTORY_HEADER_SIZE + max_points * PRD_TRAJECTORY_POINT_SIZE;
    for (i, t) in set.trajectories.iter().take(count).enumerate() {
        let at = PRD_TRAJECTORIES_HEADER_SIZE + i * stride;
        let skip = t.points.len().saturating_sub(max_points);
        let points = &t.points[skip..];
        put_u16(buf, at, t.roi_nr);
        put_u32(buf, at + 4, t.particle_id);
        put_u32(buf, at + 8, t.lifetime);
        put_u32(buf, at + 12, points.len() as u32);
        for (j, p) in points.iter().enumerate() {
            let pat = at + PRD_TRAJECTORY_HEADER_SIZE + j * PRD_TRAJECTORY_POINT_SIZE;
            put_u32(buf, pat, p.frame_nr);
            put_u16(buf, pat + 4, p.x);
            put_u16(buf, pat + 6, p.y);
        }
    }
    Ok(size)
}

pub fn read_trajectories(buf: &[u8]) -> AcqResult<Trajectories> {
    if buf.len() < PRD_TRAJECTORIES_HEADER_SIZE {
        return Err(AcqError::format("truncated trajectories header"));
    }
    let max_trajectories = get_u32(buf, 0);
    let max_points = get_u32(buf, 4);
    let count = get_u32(buf, 8);
    if count > max_trajectories || buf.len() < trajectories_capacity(max_trajectories, max_points)
    {
        return Err(AcqError::format(format!(
            "trajectory block of {} bytes cannot hold {count} of {max_trajectories} × {max_points}",
            buf.len()
        )));
    }
    let stride = PRD_TRAJECTORY_HEADER_SIZE + max_points as usize * PRD_TRAJECTORY_POINT_SIZE;
    let mut set = Trajectories::new(max_trajectories, max_points);
    for i in 0..count as usize {
        let at = PRD_TRAJECTORIES_HEADER_SIZE + i * stride;
        let point_count = get_u32(buf, at + 12).min(max_points) as usize;
        let points = (0..point_count)
            .map(|j| {
                let pat = at + PRD_TRAJECTORY_HEADER_SIZE + j * PRD_TRAJECTORY_POINT_SIZE;
                TrajectoryPoint {
                    frame_nr: get_u32(buf, pat),
                    x: get_u16(buf, pat + 4),
                    y: get_u16(buf, pat + 6),
                }
            })
            .collect();
        set.trajectories.push(Trajectory {
            roi_nr: get_u16(buf, at),
            particle_id: get_u32(buf, at + 4),
            lifetime: get_u32(buf, at + 8),
            points,
        });
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::frame::BitmapFormat;

    fn cfg() -> AcqCfg {
        AcqCfg::single_region(Region::from_rect(0, 0, 512, 1024), BitmapFormat::Mono16, 16)
    }

    #[test]
    fn header_block_sizes_follow_alignment() {
        let natural = PrdHeader::for_acquisition(&cfg(), 0, 0, 0);
        assert_eq!(natural.header_block_size(), PRD_HEADER_SIZE);
        assert_eq!(natural.record_size(), PRD_METADATA_SIZE + 1_048_576);

        let paged = PrdHeader::for_acquisition(&cfg(), 0, 4096, 100);
        assert_eq!(paged.header_block_size(), 4096);
        assert_eq!(paged.metadata_block_size(), 4096);
        assert_eq!(paged.record_size(), 4096 + 1_048_576);
    }

    #[test]
    fn header_parses_back() {
        let mut h = PrdHeader::for_acquisition(&cfg(), 1, 4096, 0);
        h.frame_count = 9;
        let mut buf = [0u8; PRD_HEADER_SIZE];
        h.write(&mut buf);
        assert_eq!(&buf[..4], b"PRD\0");
        assert_eq!(PrdHeader::read(&buf).unwrap(), h);
    }

    #[test]
    fn old_header_versions_get_implied_fields() {
        let mut h = PrdHeader::for_acquisition(&cfg(), 0, 4096, 0);
        h.version = PRD_VERSION_0_3;
        h.size_of_prd_metadata_struct = 0;
        let mut buf = [0u8; PRD_HEADER_SIZE];
        h.write(&mut buf);
        let back = PrdHeader::read(&buf).unwrap();
        assert_eq!(back.alignment, 0);
        assert_eq!(back.size_of_prd_metadata_struct, 24);
        assert_eq!(back.frame_size, 512 * 1024 * 2);
    }

    #[test]
    fn rejects_bad_signature_and_version() {
        let mut buf = [0u8; PRD_HEADER_SIZE];
        assert!(matches!(PrdHeader::read(&buf), Err(AcqError::Format(_))));
        PrdHeader::for_acquisition(&cfg(), 0, 0, 0).write(&mut buf);
        buf[4] = 0x09;
        assert!(PrdHeader::read(&buf).is_err());
    }

    #[test]
    fn metadata_versions_read_their_prefix() {
        let info = FrameInfo {
            frame_nr: 5,
            exposure_time: 10,
            readout_time: 300,
            timestamp_bof: 0x1_0000_0010,
            timestamp_eof: 0x1_0000_0020,
        };
        let mut md = PrdMetaData::from_info(&info, 3);
        md.color_wb_scale_red = 1.5;
        let mut buf = [0u8; PRD_METADATA_SIZE];
        md.write(&mut buf);

        assert_eq!(PrdMetaData::read(&buf, PRD_VERSION).unwrap(), md);
        let v2 = PrdMetaData::read(&buf[..20], PRD_VERSION_0_2).unwrap();
        assert_eq!(v2.eof_time, 0x20);
        assert_eq!(v2.timestamp_eof(), 0x20);
        assert_eq!(v2.roi_count, 0);
        let v4 = PrdMetaData::read(&buf, PRD_VERSION_0_4).unwrap();
        assert_eq!(v4.timestamp_bof(), 0x1_0000_0010);
        assert!((v4.color_wb_scale_red - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn trajectories_keep_newest_points() {
        let mut set = Trajectories::new(2, 2);
        set.trajectories.push(Trajectory {
            roi_nr: 1,
            particle_id: 4,
            lifetime: 3,
            points: (1..=3)
                .map(|f| TrajectoryPoint {
                    frame_nr: f,
                    x: f as u16,
                    y: 0,
                })
                .collect(),
        });
        let mut buf = vec![0u8; trajectories_capacity(2, 2)];
        assert_eq!(write_trajectories(&set, 2, 2, &mut buf).unwrap(), 12 + 2 * (16 + 16));
        let back = read_trajectories(&buf).unwrap();
        let t = back.get(4).unwrap();
        assert_eq!(
            t.points.iter().map(|p| p.frame_nr).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert_eq!(back.max_trajectories, 2);
    }
}
