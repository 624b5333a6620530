use crate::model::*;

// ── Free-window computation ──────────────────────────────────────

/// Sub-spans of `query` where fewer than `limit` holders overlap at every
/// instant. Pending and confirmed claims both count; expired holds keep
/// counting until the reaper releases them.
///
/// Admission counts every holder overlapping the whole request, so a
/// request spanning several free sub-spans can still be refused.
pub fn free_spans(resource: &ResourceState, query: &Span) -> Vec<Span> {
    let limit = resource.capacity.limit();
    if limit == 0 {
        return Vec::new();
    }

    let mut held: Vec<Span> = resource.overlapping(query).map(|i| i.span).collect();
    if held.is_empty() {
        return vec![*query];
    }
    held.sort_by_key(|s| s.start);

    let saturated = compute_saturated_spans(&held, limit);
    subtract_intervals(&[*query], &saturated)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}

/// Sweep line over holder spans: the time ranges where `capacity` or more
/// holders coincide. Output is sorted and disjoint.
pub fn compute_saturated_spans(held: &[Span], capacity: u32) -> Vec<Span> {
    if held.is_empty() || capacity == 0 {
        return Vec::new();
    }
    if capacity == 1 {
        return merge_overlapping(held);
    }

    let mut edges: Vec<(Ms, i32)> = Vec::with_capacity(held.len() * 2);
    for s in held {
        edges.push((s.start, 1));
        edges.push((s.end, -1));
    }
    // Releases first at equal instants: [a, b) and [b, c) never stack.
    edges.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result: Vec<Span> = Vec::new();
    let mut count: i64 = 0;
    let mut saturated_start: Option<Ms> = None;

    for (time, delta) in edges {
        count += i64::from(delta);

        if count >= i64::from(capacity) {
            if saturated_start.is_none() {
                saturated_start = Some(time);
            }
        } else if let Some(start) = saturated_start.take()
            && time > start
        {
            result.push(Span::new(start, time));
        }
    }

    merge_overlapping(&result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn hall(capacity: Capacity, held: &[(Ms, Ms)]) -> ResourceState {
        let mut rs = ResourceState::new(Ulid::new(), None, Some("Hall".into()), capacity);
        for &(start, end) in held {
            rs.insert_interval(Interval {
                id: Ulid::new(),
                span: Span::new(start, end),
            });
        }
        rs
    }

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let result = subtract_intervals(&base, &[Span::new(200, 300)]);
        assert_eq!(result, base);
    }

    #[test]
    fn subtract_full_overlap() {
        let result = subtract_intervals(&[Span::new(100, 200)], &[Span::new(50, 250)]);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_edges_and_middle() {
        assert_eq!(
            subtract_intervals(&[Span::new(100, 200)], &[Span::new(50, 150)]),
            vec![Span::new(150, 200)]
        );
        assert_eq!(
            subtract_intervals(&[Span::new(100, 200)], &[Span::new(150, 250)]),
            vec![Span::new(100, 150)]
        );
        assert_eq!(
            subtract_intervals(&[Span::new(100, 300)], &[Span::new(150, 200)]),
            vec![Span::new(100, 150), Span::new(200, 300)]
        );
    }

    #[test]
    fn merge_overlapping_joins_adjacent() {
        let spans = vec![Span::new(100, 300), Span::new(200, 400), Span::new(400, 500), Span::new(700, 800)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 500), Span::new(700, 800)]
        );
    }

    #[test]
    fn saturated_two_of_two() {
        let held = vec![Span::new(0, 100), Span::new(50, 150)];
        assert_eq!(compute_saturated_spans(&held, 2), vec![Span::new(50, 100)]);
    }

    #[test]
    fn saturated_touching_spans_do_not_stack() {
        let held = vec![Span::new(0, 100), Span::new(100, 200)];
        assert!(compute_saturated_spans(&held, 2).is_empty());
    }

    #[test]
    fn saturated_three_way() {
        let held = vec![Span::new(0, 100), Span::new(25, 75), Span::new(50, 150)];
        assert_eq!(compute_saturated_spans(&held, 3), vec![Span::new(50, 75)]);
        assert!(compute_saturated_spans(&[], 5).is_empty());
    }

    #[test]
    fn free_spans_exclusive_room() {
        let rs = hall(Capacity::Exclusive, &[(10 * H, 11 * H), (13 * H, 14 * H)]);
        let free = free_spans(&rs, &Span::new(9 * H, 17 * H));
        assert_eq!(
            free,
            vec![
                Span::new(9 * H, 10 * H),
                Span::new(11 * H, 13 * H),
                Span::new(14 * H, 17 * H),
            ]
        );
    }

    #[test]
    fn free_spans_concurrent_only_blocks_saturated_ranges() {
        let rs = hall(Capacity::Concurrent(2), &[(9 * H, 12 * H), (10 * H, 11 * H)]);
        let free = free_spans(&rs, &Span::new(9 * H, 12 * H));
        assert_eq!(free, vec![Span::new(9 * H, 10 * H), Span::new(11 * H, 12 * H)]);
    }

    #[test]
    fn free_spans_untouched_window() {
        let rs = hall(Capacity::Exclusive, &[(0, H)]);
        let window = Span::new(2 * H, 3 * H);
        assert_eq!(free_spans(&rs, &window), vec![window]);
    }
}
