//! Sensor regions.
//!
//! A region is an inclusive rectangle `(s1..=s2, p1..=p2)` in sensor pixels
//! with serial and parallel binning factors, matching the camera driver's
//! `rgn_type`.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub s1: u16,
    pub s2: u16,
    pub sbin: u16,
    pub p1: u16,
    pub p2: u16,
    pub pbin: u16,
}

impl Region {
    pub const fn new(s1: u16, s2: u16, sbin: u16, p1: u16, p2: u16, pbin: u16) -> Self {
        Self {
            s1,
            s2,
            sbin,
            p1,
            p2,
            pbin,
        }
    }

    /// Unbinned region from a top-left corner and size.
    pub fn from_rect(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self::new(
            x,
            x + width.saturating_sub(1),
            1,
            y,
            y + height.saturating_sub(1),
            1,
        )
    }

    /// True if the coordinates are ordered and binning is non-zero.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.s1 <= self.s2 && self.p1 <= self.p2 && self.sbin > 0 && self.pbin > 0
    }

    /// Binned width in output pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        if self.sbin == 0 || self.s2 < self.s1 {
            return 0;
        }
        (u32::from(self.s2) - u32::from(self.s1) + 1) / u32::from(self.sbin)
    }

    /// Binned height in output pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        if self.pbin == 0 || self.p2 < self.p1 {
            return 0;
        }
        (u32::from(self.p2) - u32::from(self.p1) + 1) / u32::from(self.pbin)
    }

    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.width() as usize * self.height() as usize
    }

    /// Centre of the region in sensor coordinates (rounded down).
    #[must_use]
    pub fn center(&self) -> (u16, u16) {
        (
            ((u32::from(self.s1) + u32::from(self.s2)) / 2) as u16,
            ((u32::from(self.p1) + u32::from(self.p2)) / 2) as u16,
        )
    }

    #[must_use]
    pub fn same_binning(&self, other: &Region) -> bool {
        self.sbin == other.sbin && self.pbin == other.pbin
    }

    /// Position of this region inside `outer`, in binned output pixels.
    #[must_use]
    pub fn offset_in(&self, outer: &Region) -> Option<(u32, u32)> {
        if self.s1 < outer.s1 || self.p1 < outer.p1 || !self.same_binning(outer) {
            return None;
        }
        Some((
            u32::from(self.s1 - outer.s1) / u32::from(self.sbin.max(1)),
            u32::from(self.p1 - outer.p1) / u32::from(self.pbin.max(1)),
        ))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{},{},{},{},{}]",
            self.s1, self.s2, self.sbin, self.p1, self.p2, self.pbin
        )
    }
}

/// Minimal rectangle enclosing all `regions`.
///
/// Returns `None` for an empty slice, an invalid region, or regions with
/// differing binning (such a set has no common output grid).
#[must_use]
pub fn implied_region(regions: &[Region]) -> Option<Region> {
    let first = regions.first()?;
    let mut out = *first;
    for r in regions {
        if !r.is_valid() || !r.same_binning(first) {
            return None;
        }
        out.s1 = out.s1.min(r.s1);
        out.s2 = out.s2.max(r.s2);
        out.p1 = out.p1.min(r.p1);
        out.p2 = out.p2.max(r.p2);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binned_dimensions() {
        let r = Region::new(0, 127, 2, 0, 63, 1);
        assert_eq!(r.width(), 64);
        assert_eq!(r.height(), 64);
        assert_eq!(r.pixel_count(), 4096);
    }

    #[test]
    fn implied_region_encloses_all() {
        let a = Region::from_rect(10, 10, 20, 20);
        let b = Region::from_rect(100, 5, 10, 10);
        let imp = implied_region(&[a, b]).unwrap();
        assert_eq!(imp, Region::new(10, 109, 1, 5, 29, 1));
        assert_eq!(b.offset_in(&imp), Some((90, 0)));
    }

    #[test]
    fn implied_region_rejects_mixed_binning() {
        let a = Region::new(0, 9, 1, 0, 9, 1);
        let b = Region::new(0, 9, 2, 0, 9, 2);
        assert!(implied_region(&[a, b]).is_none());
        assert!(implied_region(&[]).is_none());
    }

    #[test]
    fn center_of_odd_sized_box() {
        assert_eq!(Region::new(7, 13, 1, 20, 26, 1).center(), (10, 23));
    }
}
