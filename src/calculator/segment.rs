//! a mod maintains the x dimension of the repair plan
//! Everything is laid out over the abstract bandwidth-unit space `[0, capacity)`.

use std::ops::{Bound, Range, RangeBounds};

use ranges::{GenericRange, Ranges};

/// a half-open slice `[start, end)` of the download range of task `task`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Segment {
    pub task: usize,
    pub start: u64,
    pub end: u64,
}

impl Segment {
    pub fn new(task: usize, start: u64, end: u64) -> Self {
        Self { task, start, end }
    }

    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    pub fn shift(&mut self, offset: u64) {
        self.start += offset;
        self.end += offset;
    }

    /// whether any of the held segments of the same task overlaps this one
    pub fn overlaps(&self, held: &[Segment]) -> bool {
        held.iter()
            .any(|s| s.task == self.task && s.start < self.end && s.end > self.start)
    }

    /// Claim the longest prefix of this segment which is not held already, bounded by `limit`.
    /// The claimed part is cut off the front of `self`.
    /// An empty segment is returned if the first byte is held already.
    pub fn claim_prefix(&mut self, held: &[Segment], limit: u64) -> Segment {
        let occupied = held
            .iter()
            .filter(|s| s.task == self.task)
            .map(Segment::range);
        let Some(free) = free_ranges(self.range(), occupied).into_iter().next() else {
            return Segment::new(self.task, self.start, self.start);
        };
        if free.start != self.start {
            return Segment::new(self.task, self.start, self.start);
        }
        let end = free.end.min(self.start.saturating_add(limit));
        let claimed = Segment::new(self.task, self.start, end);
        self.start = end;
        claimed
    }

    /// the held part of this segment with the smallest start
    /// It is empty and located at `self.end` if nothing is held.
    pub fn first_overlap(&self, held: &[Segment]) -> Segment {
        let mut first = Segment::new(self.task, self.end, self.end);
        for s in held.iter().filter(|s| s.task == self.task) {
            if s.end <= self.start || s.start >= self.end {
                continue;
            }
            let start = s.start.max(self.start);
            if start < first.start {
                first = Segment::new(self.task, start, s.end.min(self.end));
            }
        }
        first
    }
}

/// remove the `cut` slice from the held segments, splitting them where needed
pub(crate) fn carve(held: &mut Vec<Segment>, cut: &Segment) {
    if cut.is_empty() {
        return;
    }
    let mut kept = Vec::with_capacity(held.len() + 1);
    for s in held.drain(..) {
        if s.task != cut.task || s.end <= cut.start || s.start >= cut.end {
            kept.push(s);
            continue;
        }
        kept.extend(
            free_ranges(s.range(), [cut.range()])
                .into_iter()
                .map(|r| Segment::new(s.task, r.start, r.end)),
        );
    }
    *held = kept;
}

/// Merge the segments of each task, so adjacent pieces become one.
/// The result is sorted by (task, start).
pub(crate) fn coalesce(held: &[Segment]) -> Vec<Segment> {
    let mut tasks: Vec<usize> = held.iter().map(|s| s.task).collect();
    tasks.sort_unstable();
    tasks.dedup();
    let mut merged = Vec::with_capacity(held.len());
    for task in tasks {
        let pieces: Vec<_> = held
            .iter()
            .filter(|s| s.task == task && !s.is_empty())
            .map(Segment::range)
            .collect();
        let (Some(start), Some(end)) = (
            pieces.iter().map(|r| r.start).min(),
            pieces.iter().map(|r| r.end).max(),
        ) else {
            continue;
        };
        // the covered part of the hull is whatever the gaps leave over
        let gaps = free_ranges(start..end, pieces);
        merged.extend(
            free_ranges(start..end, gaps)
                .into_iter()
                .map(|r| Segment::new(task, r.start, r.end)),
        );
    }
    merged
}

/// get the parts of `span` not covered by any of the occupied ranges
pub(crate) fn free_ranges<I>(span: Range<u64>, occupied: I) -> Vec<Range<u64>>
where
    I: IntoIterator<Item = Range<u64>>,
{
    if span.end <= span.start {
        return vec![];
    }
    let occupied = Ranges::from_iter(
        occupied
            .into_iter()
            .filter(|r| r.end > r.start)
            .map(GenericRange::from),
    );
    let full_range = Ranges::from(GenericRange::from(span));
    let available_ranges = full_range - occupied;
    let mut ranges: Vec<_> = available_ranges
        .as_slice()
        .iter()
        .map(convert_generic_range_to_std_range)
        .collect();
    ranges.sort_by_key(|v| v.start);
    ranges
}

/// It is safe to convert the generic range to the std range, because the normal range in Rust is [start, end)
fn convert_generic_range_to_std_range(range: &GenericRange<u64>) -> Range<u64> {
    let start = unwrap_range_start_bound(range.start_bound());
    let end = unwrap_range_end_bound(range.end_bound());
    *start..*end
}

/// It is safe to unwrap the end bound of the range, because the end bound in the Rust normal range is always Excluded
fn unwrap_range_end_bound<T>(bound: Bound<T>) -> T {
    match bound {
        Bound::Excluded(v) => v,
        _ => unreachable!(),
    }
}

/// It is safe to unwrap the start bound of the range, because the start bound in the Rust normal range is always Included
fn unwrap_range_start_bound<T>(bound: Bound<T>) -> T {
    match bound {
        Bound::Included(v) => v,
        _ => unreachable!(),
    }
}
