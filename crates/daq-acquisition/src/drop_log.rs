//! Record of dropped frame numbers.
//!
//! Written from the camera callback, so recording is O(1) and never
//! allocates: gaps are kept as `(first, last)` ranges in storage reserved up
//! front, and the summary figures are running aggregates. Once the range
//! storage is full, further ranges only update the aggregates.

use std::fmt;

/// Dropped numbers listed in the summary.
pub const SUMMARY_FIRST_DROPS: usize = 10;

/// Ranges kept for inspection before the log only counts.
pub const MAX_DROP_RANGES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropLog {
    ranges: Vec<(u32, u32)>,
    total: u64,
    largest_run: u64,
    lowest: u32,
    highest: u32,
    /// Lowest dropped numbers seen, ascending, `first_len` valid entries.
    first: [u32; SUMMARY_FIRST_DROPS],
    first_len: usize,
    /// Ranges not stored because the range storage was full.
    truncated: u64,
}

impl Default for DropLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DropLog {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ranges(Vec::with_capacity(MAX_DROP_RANGES))
    }

    fn with_ranges(ranges: Vec<(u32, u32)>) -> Self {
        Self {
            ranges,
            total: 0,
            largest_run: 0,
            lowest: u32::MAX,
            highest: 0,
            first: [0; SUMMARY_FIRST_DROPS],
            first_len: 0,
            truncated: 0,
        }
    }

    pub fn record(&mut self, frame_nr: u32) {
        self.record_range(frame_nr, frame_nr);
    }

    /// Record every number in `first..=last`.
    pub fn record_range(&mut self, first: u32, last: u32) {
        if first > last {
            return;
        }
        self.total += u64::from(last - first) + 1;
        self.lowest = self.lowest.min(first);
        self.highest = self.highest.max(last);

        let run = match self.ranges.last_mut() {
            Some(tail) if tail.1.checked_add(1) == Some(first) => {
                tail.1 = last;
                u64::from(tail.1 - tail.0) + 1
            }
            _ => {
                if self.ranges.len() < MAX_DROP_RANGES {
                    self.ranges.push((first, last));
                } else {
                    self.truncated += 1;
                }
                u64::from(last - first) + 1
            }
        };
        self.largest_run = self.largest_run.max(run);

        for nr in first..=last.min(first.saturating_add(SUMMARY_FIRST_DROPS as u32 - 1)) {
            if !self.keep_lowest(nr) {
                break;
            }
        }
    }

    /// Insert `nr` into the lowest-numbers table. False once `nr` is too high
    /// to matter.
    fn keep_lowest(&mut self, nr: u32) -> bool {
        let len = self.first_len;
        let pos = self.first[..len].partition_point(|&n| n < nr);
        if pos < len && self.first[pos] == nr {
            return true;
        }
        if pos == SUMMARY_FIRST_DROPS {
            return false;
        }
        let end = len.min(SUMMARY_FIRST_DROPS - 1);
        self.first.copy_within(pos..end, pos + 1);
        self.first[pos] = nr;
        self.first_len = (len + 1).min(SUMMARY_FIRST_DROPS);
        true
    }

    /// Number of dropped frames recorded.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Stored gaps in recording order. Adjacent gaps recorded back to back
    /// are merged.
    #[must_use]
    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    #[must_use]
    pub fn truncated(&self) -> u64 {
        self.truncated
    }

    /// Forget everything, keeping the reserved storage.
    pub fn clear(&mut self) {
        let mut ranges = std::mem::take(&mut self.ranges);
        ranges.clear();
        *self = Self::with_ranges(ranges);
    }

    /// Summary figures. Cost does not depend on the log size.
    #[must_use]
    pub fn stats(&self) -> DropStats {
        let average_spacing = if self.total > 1 {
            f64::from(self.highest - self.lowest) / (self.total - 1) as f64
        } else {
            0.0
        };
        DropStats {
            total: self.total,
            largest_run: self.largest_run,
            average_spacing,
            first: self.first[..self.first_len].to_vec(),
        }
    }
}

/// Aggregated view of a [`DropLog`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DropStats {
    pub total: u64,
    /// Longest stretch of consecutive frame numbers recorded together.
    pub largest_run: u64,
    /// Mean distance between neighbouring dropped numbers.
    pub average_spacing: f64,
    /// Lowest dropped numbers, ascending.
    pub first: Vec<u32>,
}

impl fmt::Display for DropStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total == 0 {
            return f.write_str("none");
        }
        write!(
            f,
            "{} total, largest run {}, average spacing {:.1}, first {:?}",
            self.total, self.largest_run, self.average_spacing, self.first
        )
    }
}
