use chrono::NaiveDate;

use crate::model::*;

use super::conflict::occupies_slot;
use super::store::RoomState;

// ── Free-slot computation ─────────────────────────────────────────

/// Open hours for `date`: the room's windows for that weekday.
///
/// Open windows form the base; closed windows (`is_available = false`) are
/// subtracted from it. A room with no open window on that weekday is treated
/// as open all day, since windows are advisory.
pub fn open_hours(rs: &RoomState, date: NaiveDate) -> Vec<Span> {
    let dow = day_of_week(date);
    let mut open: Vec<Span> = Vec::new();
    let mut closed: Vec<Span> = Vec::new();
    for w in rs.windows_on(dow) {
        if w.is_available {
            open.push(w.span);
        } else {
            closed.push(w.span);
        }
    }

    if open.is_empty() {
        open.push(Span::whole_day());
    }
    open.sort_by_key(|s| s.start);
    let open = merge_overlapping(&open);

    if closed.is_empty() {
        return open;
    }
    closed.sort_by_key(|s| s.start);
    subtract_intervals(&open, &merge_overlapping(&closed))
}

/// Free intervals on `date`: open hours minus every slot-holding booking.
pub fn free_slots(rs: &RoomState, date: NaiveDate, payment_gated: bool) -> Vec<Span> {
    let free = open_hours(rs, date);

    // Day lists are sorted by start, so the taken spans are too.
    let taken: Vec<Span> = rs
        .day(date)
        .iter()
        .filter(|b| occupies_slot(b, payment_gated))
        .map(|b| b.span)
        .collect();
    if taken.is_empty() {
        return free;
    }
    subtract_intervals(&free, &merge_overlapping(&taken))
}

/// Is `span` entirely inside the open hours for `date`?
pub fn within_open_hours(rs: &RoomState, date: NaiveDate, span: &Span) -> bool {
    open_hours(rs, date).iter().any(|w| w.contains_span(span))
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

/// `base` minus `to_remove`. Both inputs sorted and disjoint.
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
