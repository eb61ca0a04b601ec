// Coalescing byte-range set
//
// Tracks which parts of a dynamic buffer were written this frame. Ranges are
// kept sorted, disjoint and maximally merged, so a buffer written in one
// contiguous sweep always reports exactly one range.

/// Half-open byte range `[offset, offset + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u32,
    pub size: u32,
}

impl ByteRange {
    pub fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `[offset, offset + size)`, merging with every overlapping or
    /// touching neighbour. Empty ranges are ignored.
    pub fn insert(&mut self, offset: u32, size: u32) {
        if size == 0 {
            return;
        }

        let mut start = offset as u64;
        let mut end = start + size as u64;

        // First range whose end reaches our start (touching counts)
        let first = self.ranges.partition_point(|r| r.end() < start);
        // One past the last range whose start is within our end
        let last = self.ranges.partition_point(|r| (r.offset as u64) <= end);

        if first < last {
            start = start.min(self.ranges[first].offset as u64);
            end = end.max(self.ranges[last - 1].end());
        }

        let merged = ByteRange::new(start as u32, (end - start) as u32);
        self.ranges.splice(first..last, std::iter::once(merged));
    }

    /// Drop everything and start over with a single range.
    pub fn reset_to(&mut self, offset: u32, size: u32) {
        self.ranges.clear();
        self.insert(offset, size);
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    pub fn total_bytes(&self) -> u64 {
        self.ranges.iter().map(|r| r.size as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(set: &RangeSet) -> Vec<(u32, u32)> {
        set.iter().map(|r| (r.offset, r.size)).collect()
    }

    #[test]
    fn disjoint_ranges_stay_sorted() {
        let mut set = RangeSet::new();
        set.insert(100, 10);
        set.insert(0, 10);
        set.insert(50, 10);
        assert_eq!(collect(&set), vec![(0, 10), (50, 10), (100, 10)]);
    }

    #[test]
    fn adjacent_ranges_merge_on_both_sides() {
        let mut set = RangeSet::new();
        set.insert(0, 16);
        set.insert(32, 16);
        set.insert(16, 16);
        assert_eq!(collect(&set), vec![(0, 48)]);
    }

    #[test]
    fn overlapping_insert_swallows_several_ranges() {
        let mut set = RangeSet::new();
        set.insert(10, 5);
        set.insert(20, 5);
        set.insert(30, 5);
        set.insert(12, 20);
        assert_eq!(collect(&set), vec![(10, 25)]);
    }

    #[test]
    fn contained_insert_is_a_no_op() {
        let mut set = RangeSet::new();
        set.insert(0, 100);
        set.insert(10, 10);
        assert_eq!(collect(&set), vec![(0, 100)]);
        assert_eq!(set.total_bytes(), 100);
    }

    #[test]
    fn empty_insert_is_ignored() {
        let mut set = RangeSet::new();
        set.insert(5, 0);
        assert!(set.is_empty());
    }

    #[test]
    fn reset_replaces_contents() {
        let mut set = RangeSet::new();
        set.insert(0, 4);
        set.insert(64, 4);
        set.reset_to(0, 256);
        assert_eq!(collect(&set), vec![(0, 256)]);
        assert_eq!(set.len(), 1);
    }
}
