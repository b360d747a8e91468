use chrono::TimeZone;

use crate::calendar::add_days;
use crate::cluster::JobTable;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidTime("timestamp out of range"));
    }
    if start >= end {
        return Err(EngineError::InvalidTime("start not before end"));
    }
    if end - start > MAX_WINDOW_MS {
        return Err(EngineError::InvalidTime("window too wide"));
    }
    Ok(())
}

/// Spatial clash between two reservations. Node bitmaps must intersect;
/// when both sides are core-partial, disjoint core claims on the shared
/// nodes are not a clash.
fn bitmaps_clash(a: &Reservation, b: &Reservation) -> bool {
    if !a.node_bitmap.overlaps(&b.node_bitmap) {
        return false;
    }
    if let (Some(ca), Some(cb)) = (&a.core_bitmap, &b.core_bitmap) {
        return ca.overlaps(cb);
    }
    true
}

/// Recurrence-aware reservation-vs-reservation test: each side's window is
/// expanded by up to 7 forward day-shifts (0 when not recurring) and every
/// shift pair is tested for plain interval intersection. Day-shifting goes
/// through the calendar so DST transitions don't skew the windows.
pub fn resv_conflict<Tz: TimeZone>(tz: &Tz, new: &Reservation, other: &Reservation) -> bool {
    if new.flags.intersects(ResvFlags::OVERLAP.union(ResvFlags::MAINT)) {
        return false;
    }
    if other.node_bitmap.is_clear() {
        return false;
    }
    if !bitmaps_clash(new, other) {
        return false;
    }

    let new_shifts = shift_count(new);
    let other_shifts = shift_count(other);
    for i in 0..=new_shifts {
        let (ns, ne) = shift_window(tz, new.start_time, new.end_time, i);
        for j in 0..=other_shifts {
            let (os, oe) = shift_window(tz, other.start_time, other.end_time, j);
            if windows_intersect(ns, ne, os, oe) {
                return true;
            }
        }
    }
    false
}

fn shift_count(r: &Reservation) -> i32 {
    if r.recurrence().is_recurring() {
        crate::limits::RECURRENCE_LOOKAHEAD_DAYS
    } else {
        0
    }
}

fn shift_window<Tz: TimeZone>(tz: &Tz, start: Ms, end: Ms, days: i32) -> (Ms, Ms) {
    if days == 0 {
        (start, end)
    } else {
        (add_days(tz, start, days), add_days(tz, end, days))
    }
}

/// Reservation-vs-running-job scan: a job whose end time reaches past the
/// reservation start and whose nodes intersect the requested set blocks the
/// reservation, unless the ignore-running-jobs flag is set.
pub fn job_conflict(new: &Reservation, jobs: &JobTable) -> Option<u32> {
    if new.flags.contains(ResvFlags::IGNORE_JOBS) {
        return None;
    }
    jobs.running()
        .find(|j| j.end_time > new.start_time && j.node_bitmap.overlaps(&new.node_bitmap))
        .map(|j| j.job_id)
}

/// Full legality check for a proposed reservation against every *other*
/// reservation and the running jobs. Runs at create and at update.
pub fn check_no_conflict<'a, Tz: TimeZone>(
    tz: &Tz,
    new: &Reservation,
    others: impl Iterator<Item = &'a Reservation>,
    jobs: &JobTable,
) -> Result<(), EngineError> {
    for other in others {
        if other.name == new.name {
            continue;
        }
        if resv_conflict(tz, new, other) {
            return Err(EngineError::Conflict(other.name.clone()));
        }
    }
    if let Some(job_id) = job_conflict(new, jobs) {
        return Err(EngineError::JobConflict(job_id));
    }
    Ok(())
}
