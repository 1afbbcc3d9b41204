use ulid::Ulid;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// First active booking on this van that collides with `stay`, ignoring
/// `exclude` (the booking being moved, so it never conflicts with itself).
pub fn first_conflict(van: &VanState, stay: &Stay, exclude: Option<Ulid>) -> Option<Ulid> {
    van.overlapping(stay)
        .filter(|b| b.status.is_active())
        .find(|b| Some(b.id) != exclude)
        .map(|b| b.id)
}

/// True when no Pending or Confirmed booking other than `exclude` shares a
/// night with `stay`. Callers validate `stay.end > stay.start` beforehand.
pub fn is_available(van: &VanState, stay: &Stay, exclude: Option<Ulid>) -> bool {
    first_conflict(van, stay, exclude).is_none()
}

/// Maximal free windows inside `query`, for calendar views.
pub fn free_windows(van: &VanState, query: &Stay) -> Vec<Stay> {
    let mut occupied: Vec<Stay> = van
        .overlapping(query)
        .filter(|b| b.status.is_active())
        .map(|b| b.stay)
        .collect();
    occupied.sort_by_key(|s| s.start);
    let occupied = merge_overlapping(&occupied);
    subtract_stays(&[*query], &occupied)
}

/// Merge sorted overlapping/adjacent stays into disjoint ones.
pub fn merge_overlapping(sorted: &[Stay]) -> Vec<Stay> {
    let mut merged: Vec<Stay> = Vec::new();
    for &stay in sorted {
        if let Some(last) = merged.last_mut()
            && stay.start <= last.end {
                last.end = last.end.max(stay.end);
                continue;
            }
        merged.push(stay);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted and disjoint.
pub fn subtract_stays(base: &[Stay], to_remove: &[Stay]) -> Vec<Stay> {
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
                result.push(Stay::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Stay::new(current_start, current_end));
        }
    }

    result
}
