use crate::task::Segment;

/// Splits `[0, total)` into at most `segments` contiguous ranges of near-equal
/// length, the last one absorbing the division remainder.
///
/// Falls back to a single segment covering the whole resource when the size is
/// unknown or the server cannot serve ranges. A zero-byte resource yields one
/// empty segment that is already complete.
pub fn plan(total: Option<u64>, accepts_ranges: bool, segments: usize) -> Vec<Segment> {
    let total = match total {
        None => return vec![Segment::new(0, 0, None)],
        Some(total) => total,
    };

    if total == 0 || !accepts_ranges {
        return vec![Segment::new(0, 0, Some(total))];
    }

    let count = (segments.max(1) as u64).min(total);
    let part_size = total / count;

    (0..count)
        .map(|i| {
            let start = i * part_size;
            let len = if i == count - 1 {
                total - start
            } else {
                part_size
            };
            Segment::new(i as usize, start, Some(len))
        })
        .collect()
}
