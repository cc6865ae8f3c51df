use crate::model::*;

// ── Interval utilities ───────────────────────────────────────────

/// Half-open overlap test; touching intervals do not overlap.
pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.overlaps(b)
}

/// Remainders of `container` after removing `consumed` (which must lie inside it).
/// Returns 0–2 spans in order: leading remainder, trailing remainder.
pub fn subtract(container: &Span, consumed: &Span) -> Vec<Span> {
    debug_assert!(container.contains_span(consumed));
    let mut rest = Vec::with_capacity(2);
    if consumed.start > container.start {
        rest.push(Span::new(container.start, consumed.start));
    }
    if consumed.end < container.end {
        rest.push(Span::new(consumed.end, container.end));
    }
    rest
}

/// Bounding span of a set of mutually touching spans: `[min(starts), max(ends))`.
pub fn merge(spans: &[Span]) -> Option<Span> {
    let start = spans.iter().map(|s| s.start).min()?;
    let end = spans.iter().map(|s| s.end).max()?;
    Some(Span::new(start, end))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Subtract sorted, disjoint `to_remove` from sorted `base`.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
