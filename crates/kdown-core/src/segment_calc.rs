//! Pure segment-planning functions (spec §4.2, C2).
//!
//! Directly descended from the donor's `segmenter::range::plan_segments`
//! (equal-as-possible split, remainder to leading segments), generalized to
//! the model's `Segment { index, start, end, downloaded_bytes }` (inclusive
//! `end`, rather than the donor's half-open range) and extended with
//! `resegment`, which `plan_segments` has no counterpart for because the
//! donor never changes segment count mid-download.

use crate::model::Segment;

/// One segment covering the whole file (spec §4.2).
pub fn single_segment(total: u64) -> Vec<Segment> {
    if total == 0 {
        return Vec::new();
    }
    vec![Segment {
        index: 0,
        start: 0,
        end: total - 1,
        downloaded_bytes: 0,
    }]
}

/// Splits `[0, total)` into `n` contiguous segments, sizes as equal as
/// possible with the remainder distributed to the leading segments (spec
/// §4.2). `n` must be `>= 1` and `<= total`; panics otherwise since this is
/// an internal invariant the caller (source::http) is responsible for
/// upholding before calling in.
pub fn calculate_segments(total: u64, n: usize) -> Vec<Segment> {
    assert!(n >= 1, "calculate_segments: n must be >= 1");
    assert!(
        n as u64 <= total,
        "calculate_segments: n must be <= total ({n} > {total})"
    );
    if total == 0 {
        return Vec::new();
    }

    let n64 = n as u64;
    let base = total / n64;
    let remainder = total % n64;

    let mut out = Vec::with_capacity(n);
    let mut offset = 0u64;
    for i in 0..n64 {
        let len = base + if i < remainder { 1 } else { 0 };
        out.push(Segment {
            index: i as usize,
            start: offset,
            end: offset + len - 1,
            downloaded_bytes: 0,
        });
        offset += len;
    }
    out
}

/// A contiguous run of incomplete bytes, carrying forward no progress (a
/// fresh merge always starts at 0 downloaded within the run).
struct IncompleteRun {
    start: u64,
    end: u64,
}

/// Merges all incomplete byte ranges into their contiguous runs and
/// re-splits them into a total of `n` incomplete segments, preserving every
/// fully-complete segment as-is, then renumbers indices (spec §4.2).
///
/// Invariants upheld: full coverage preserved; `sum(downloaded_bytes)`
/// unchanged; incomplete count == `min(n, total_incomplete_bytes)`.
pub fn resegment(existing: &[Segment], n: usize) -> Vec<Segment> {
    assert!(n >= 1, "resegment: n must be >= 1");

    let mut complete: Vec<Segment> = Vec::new();
    let mut runs: Vec<IncompleteRun> = Vec::new();

    for seg in existing {
        if seg.is_complete() {
            complete.push(*seg);
            continue;
        }
        // The incomplete portion of this segment starts at its current
        // offset (already-downloaded bytes are not re-fetched) and still
        // covers through `seg.end`. The already-downloaded prefix, if any,
        // is preserved as its own complete segment so no progress is lost.
        let run_start = seg.current_offset();
        let run_end = seg.end;
        if run_start > seg.start {
            complete.push(Segment {
                index: 0,
                start: seg.start,
                end: run_start - 1,
                downloaded_bytes: run_start - seg.start,
            });
        }
        if let Some(last) = runs.last_mut() {
            if last.end + 1 == run_start {
                last.end = run_end;
                continue;
            }
        }
        runs.push(IncompleteRun {
            start: run_start,
            end: run_end,
        });
    }

    let total_incomplete_bytes: u64 = runs.iter().map(|r| r.end - r.start + 1).sum();
    // min(n, incomplete bytes): never more segments than representable
    // with >=1 byte each (spec §4.2 invariant).
    let target_incomplete = (n as u64).min(total_incomplete_bytes);

    let mut new_incomplete: Vec<Segment> = Vec::new();
    if total_incomplete_bytes > 0 {
        // Distribute `target_incomplete` segments across runs proportionally
        // to each run's share of the total incomplete bytes, guaranteeing at
        // least one segment per non-empty run and never exceeding what is
        // representable with >=1-byte segments.
        let run_count = runs.len() as u64;
        let mut remaining_segments = target_incomplete;
        for (i, run) in runs.iter().enumerate() {
            let run_bytes = run.end - run.start + 1;
            let is_last_run = i as u64 + 1 == run_count;
            let share = if is_last_run {
                remaining_segments
            } else {
                let proportional = ((run_bytes as u128 * target_incomplete as u128)
                    / total_incomplete_bytes as u128) as u64;
                proportional.clamp(1, run_bytes).min(remaining_segments.max(1))
            };
            let share = share.max(1).min(run_bytes).min(remaining_segments.max(1));
            remaining_segments = remaining_segments.saturating_sub(share);

            let base = run_bytes / share;
            let rem = run_bytes % share;
            let mut offset = run.start;
            for j in 0..share {
                let len = base + if j < rem { 1 } else { 0 };
                new_incomplete.push(Segment {
                    index: 0, // renumbered below
                    start: offset,
                    end: offset + len - 1,
                    downloaded_bytes: 0,
                });
                offset += len;
            }
        }
    }

    // Merge, sort by start offset so indices stay in file order, and
    // renumber densely.
    let mut all: Vec<Segment> = complete;
    all.extend(new_incomplete);
    all.sort_by_key(|s| s.start);
    for (i, seg) in all.iter_mut().enumerate() {
        seg.index = i;
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calculate_segments_even_split() {
        let segs = calculate_segments(1000, 4);
        assert_eq!(segs.len(), 4);
        assert_eq!((segs[0].start, segs[0].end), (0, 249));
        assert_eq!((segs[1].start, segs[1].end), (250, 499));
        assert_eq!((segs[2].start, segs[2].end), (500, 749));
        assert_eq!((segs[3].start, segs[3].end), (750, 999));
        let total: u64 = segs.iter().map(|s| s.total_bytes()).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn calculate_segments_remainder_to_leading() {
        let segs = calculate_segments(10, 4);
        assert_eq!(segs.len(), 4);
        assert_eq!(segs[0].total_bytes(), 3);
        assert_eq!(segs[1].total_bytes(), 3);
        assert_eq!(segs[2].total_bytes(), 2);
        assert_eq!(segs[3].total_bytes(), 2);
    }

    #[test]
    fn calculate_segments_coverage_invariant_holds_broadly() {
        for total in [1u64, 7, 100, 1000, 65536] {
            for n in 1..=((total as usize).min(8)) {
                let segs = calculate_segments(total, n);
                assert_eq!(segs.len(), n);
                assert_eq!(segs[0].start, 0);
                let sum: u64 = segs.iter().map(|s| s.total_bytes()).sum();
                assert_eq!(sum, total);
                for w in segs.windows(2) {
                    assert_eq!(w[0].end + 1, w[1].start, "no gaps/overlaps");
                }
                for (i, s) in segs.iter().enumerate() {
                    assert_eq!(s.index, i);
                }
            }
        }
    }

    #[test]
    fn single_segment_covers_whole_file() {
        let segs = single_segment(500);
        assert_eq!(segs.len(), 1);
        assert_eq!((segs[0].start, segs[0].end), (0, 499));
    }

    #[test]
    fn single_segment_zero_total_is_empty() {
        assert!(single_segment(0).is_empty());
    }

    #[test]
    fn resegment_preserves_complete_segments_and_progress() {
        let existing = vec![
            Segment { index: 0, start: 0, end: 249, downloaded_bytes: 250 },
            Segment { index: 1, start: 250, end: 499, downloaded_bytes: 100 },
            Segment { index: 2, start: 500, end: 749, downloaded_bytes: 0 },
            Segment { index: 3, start: 750, end: 999, downloaded_bytes: 0 },
        ];
        let before_sum: u64 = existing.iter().map(|s| s.downloaded_bytes).sum();

        let result = resegment(&existing, 2);
        let after_sum: u64 = result.iter().map(|s| s.downloaded_bytes).sum();
        assert_eq!(before_sum, after_sum);

        // The fully-complete segment [0,249] must survive unchanged.
        assert!(result
            .iter()
            .any(|s| s.start == 0 && s.end == 249 && s.downloaded_bytes == 250));

        let incomplete_count = result.iter().filter(|s| !s.is_complete()).count();
        assert_eq!(incomplete_count, 2);

        // Dense, unique indices.
        let mut indices: Vec<usize> = result.iter().map(|s| s.index).collect();
        indices.sort();
        assert_eq!(indices, (0..result.len()).collect::<Vec<_>>());

        // Full coverage, no gaps/overlaps.
        let mut sorted = result.clone();
        sorted.sort_by_key(|s| s.start);
        assert_eq!(sorted[0].start, 0);
        assert_eq!(sorted.last().unwrap().end, 999);
        for w in sorted.windows(2) {
            assert_eq!(w[0].end + 1, w[1].start);
        }
    }

    #[test]
    fn resegment_incomplete_count_never_exceeds_incomplete_bytes() {
        let existing = vec![Segment {
            index: 0,
            start: 0,
            end: 2,
            downloaded_bytes: 0,
        }]; // 3 incomplete bytes
        let result = resegment(&existing, 10);
        let incomplete_count = result.iter().filter(|s| !s.is_complete()).count();
        assert_eq!(incomplete_count, 3, "min(n, incomplete_bytes) == 3");
    }

    #[test]
    fn resegment_all_complete_is_noop_on_progress() {
        let existing = vec![
            Segment { index: 0, start: 0, end: 99, downloaded_bytes: 100 },
            Segment { index: 1, start: 100, end: 199, downloaded_bytes: 100 },
        ];
        let result = resegment(&existing, 4);
        // Nothing incomplete to resegment; both complete segments preserved.
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|s| s.is_complete()));
    }

    #[test]
    fn resegment_merges_adjacent_incomplete_runs() {
        let existing = vec![
            Segment { index: 0, start: 0, end: 99, downloaded_bytes: 50 },
            Segment { index: 1, start: 100, end: 199, downloaded_bytes: 0 },
        ];
        // current_offset of seg0 = 50, so the incomplete run is [50,199] (150 bytes).
        let result = resegment(&existing, 3);
        let incomplete_count = result.iter().filter(|s| !s.is_complete()).count();
        assert_eq!(incomplete_count, 3);
        let before_sum: u64 = existing.iter().map(|s| s.downloaded_bytes).sum();
        let after_sum: u64 = result.iter().map(|s| s.downloaded_bytes).sum();
        assert_eq!(before_sum, after_sum);
    }
}
