// Sorted set of disjoint half-open byte ranges

use std::ops::Range;

/// Covered byte ranges of one track.
///
/// Ranges are kept sorted, non-empty, disjoint and non-adjacent: inserting
/// a range that touches or overlaps existing ones merges them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<Range<u64>>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `[start, end)` pairs in any order; empty pairs are dropped
    pub fn from_pairs(pairs: &[(u64, u64)]) -> Self {
        let mut set = Self::new();
        for &(start, end) in pairs {
            set.insert(start..end);
        }
        set
    }

    pub fn to_pairs(&self) -> Vec<(u64, u64)> {
        self.ranges.iter().map(|r| (r.start, r.end)).collect()
    }

    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of covered bytes
    pub fn covered_len(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    /// Add `range`, returning how many bytes were not covered before
    pub fn insert(&mut self, range: Range<u64>) -> u64 {
        if range.start >= range.end {
            return 0;
        }
        let added = self.gaps(range.clone()).iter().map(|g| g.end - g.start).sum();
        if added == 0 {
            return 0;
        }

        // First range whose end reaches the new start (touching counts)
        let first = self.ranges.partition_point(|r| r.end < range.start);
        // One past the last range whose start is within reach of the new end
        let last = self.ranges.partition_point(|r| r.start <= range.end);

        let mut merged = range;
        if first < last {
            merged.start = merged.start.min(self.ranges[first].start);
            merged.end = merged.end.max(self.ranges[last - 1].end);
        }
        self.ranges.splice(first..last, std::iter::once(merged));
        added
    }

    /// Whether every byte of `range` is covered
    pub fn contains(&self, range: Range<u64>) -> bool {
        if range.start >= range.end {
            return true;
        }
        let idx = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges
            .get(idx)
            .map_or(false, |r| r.start <= range.start && range.end <= r.end)
    }

    /// Sub-ranges of `range` that are not covered, in order
    pub fn gaps(&self, range: Range<u64>) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        if range.start >= range.end {
            return gaps;
        }

        let mut cursor = range.start;
        let idx = self.ranges.partition_point(|r| r.end <= range.start);
        for r in &self.ranges[idx..] {
            if r.start >= range.end {
                break;
            }
            if r.start > cursor {
                gaps.push(cursor..r.start);
            }
            cursor = cursor.max(r.end);
            if cursor >= range.end {
                break;
            }
        }
        if cursor < range.end {
            gaps.push(cursor..range.end);
        }
        gaps
    }

    /// End of the covered run containing `offset`, or `offset` itself when
    /// that byte is not covered
    pub fn contiguous_end_from(&self, offset: u64) -> u64 {
        let idx = self.ranges.partition_point(|r| r.end <= offset);
        match self.ranges.get(idx) {
            Some(r) if r.start <= offset => r.end,
            _ => offset,
        }
    }

    /// Drop everything at or beyond `len`
    pub fn truncate(&mut self, len: u64) {
        self.ranges.retain(|r| r.start < len);
        if let Some(last) = self.ranges.last_mut() {
            last.end = last.end.min(len);
        }
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_adjacent_ranges_merge() {
        let mut set = RangeSet::new();
        assert_eq!(set.insert(0..1000), 1000);
        assert_eq!(set.insert(1000..2000), 1000);
        assert_eq!(set.ranges(), &[0..2000]);

        // Rewriting a covered sub-range is a no-op
        assert_eq!(set.insert(500..1500), 0);
        assert_eq!(set.ranges(), &[0..2000]);
    }

    #[test]
    fn test_overlap_bridges_gap() {
        let mut set = RangeSet::from_pairs(&[(0, 10), (20, 30), (40, 50)]);
        assert_eq!(set.insert(5..45), 20);
        assert_eq!(set.ranges(), &[0..50]);
    }

    #[test]
    fn test_gaps_and_contains() {
        let set = RangeSet::from_pairs(&[(10, 20), (30, 40)]);
        assert_eq!(set.gaps(0..50), vec![0..10, 20..30, 40..50]);
        assert_eq!(set.gaps(12..18), Vec::<Range<u64>>::new());
        assert_eq!(set.gaps(15..35), vec![20..30]);
        assert!(set.contains(10..20));
        assert!(!set.contains(15..31));
        assert!(set.contains(5..5));
    }

    #[test]
    fn test_contiguous_end() {
        let set = RangeSet::from_pairs(&[(0, 100), (200, 300)]);
        assert_eq!(set.contiguous_end_from(0), 100);
        assert_eq!(set.contiguous_end_from(99), 100);
        assert_eq!(set.contiguous_end_from(100), 100);
        assert_eq!(set.contiguous_end_from(150), 150);
        assert_eq!(set.contiguous_end_from(250), 300);
    }

    #[test]
    fn test_truncate() {
        let mut set = RangeSet::from_pairs(&[(0, 100), (200, 300)]);
        set.truncate(250);
        assert_eq!(set.ranges(), &[0..100, 200..250]);
        set.truncate(150);
        assert_eq!(set.ranges(), &[0..100]);
    }

    proptest! {
        #[test]
        fn test_any_arrival_order_covers_union(
            chunks in prop::collection::vec((0u64..2000, 1u64..300), 1..40)
        ) {
            let mut set = RangeSet::new();
            let mut expected = vec![false; 2300];
            let mut total_added = 0;

            for (start, len) in &chunks {
                let before = set.clone();
                total_added += set.insert(*start..start + len);
                for b in *start..start + len {
                    expected[b as usize] = true;
                }
                // Idempotence
                let mut again = set.clone();
                prop_assert_eq!(again.insert(*start..start + len), 0);
                prop_assert_eq!(&again, &set);
                prop_assert!(set.covered_len() >= before.covered_len());
            }

            // Sorted, disjoint and non-adjacent
            for pair in set.ranges().windows(2) {
                prop_assert!(pair[0].end < pair[1].start);
            }
            for r in set.ranges() {
                prop_assert!(r.start < r.end);
            }

            // Exactly the union
            for (b, covered) in expected.iter().enumerate() {
                prop_assert_eq!(set.contains(b as u64..b as u64 + 1), *covered);
            }
            let union_len = expected.iter().filter(|c| **c).count() as u64;
            prop_assert_eq!(set.covered_len(), union_len);
            prop_assert_eq!(total_added, union_len);
        }
    }
}
