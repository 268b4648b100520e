use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, Txn};

pub fn validate_booking_window(window: &Window) -> Result<(), EngineError> {
    let w = Window::booking(window.start, window.end)?;
    if w.start < MIN_VALID_TIMESTAMP_MS || w.end > MAX_VALID_TIMESTAMP_MS {
        return Err(RangeError::OutOfRange.into());
    }
    if w.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(RangeError::TooLong.into());
    }
    Ok(())
}

/// Active allocations on `rs` overlapping `window`, ignoring `exclude`
/// (the booking being moved, when re-checking an update).
pub fn conflicting(rs: &ResourceState, window: &Window, exclude: Option<Ulid>) -> Vec<ConflictingBooking> {
    rs.overlapping(window)
        .filter(|a| Some(a.booking_id) != exclude)
        .map(ConflictingBooking::from)
        .collect()
}

/// Decide whether `window` can be committed on `rs`. Maintenance blocks
/// every window and is checked before any allocation is looked at.
pub fn resolve(rs: &ResourceState, window: &Window, exclude: Option<Ulid>) -> Result<(), ResourceConflict> {
    if rs.in_maintenance() {
        return Err(ResourceConflict {
            resource_id: rs.id,
            kind: rs.kind,
            maintenance: true,
            bookings: Vec::new(),
        });
    }
    let bookings = conflicting(rs, window, exclude);
    if bookings.is_empty() {
        Ok(())
    } else {
        Err(ResourceConflict {
            resource_id: rs.id,
            kind: rs.kind,
            maintenance: false,
            bookings,
        })
    }
}

/// True when no active allocation other than `exclude` is running at or
/// after `now`, i.e. the resource can go back to `Available`.
pub fn releasable(rs: &ResourceState, exclude: Ulid, now: Ms) -> bool {
    let rest_of_time = Window {
        start: now,
        end: Ms::MAX,
    };
    conflicting(rs, &rest_of_time, Some(exclude)).is_empty()
}

/// Resolve `window` on every listed resource held by `txn`, reporting all
/// conflicts at once.
pub(super) fn resolve_all(
    txn: &Txn,
    resource_ids: &[Ulid],
    window: &Window,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let mut conflicts = Vec::new();
    for rid in resource_ids {
        let rs = txn.resource(rid).ok_or(EngineError::NotFound(*rid))?;
        if let Err(c) = resolve(rs, window, exclude) {
            metrics::counter!(
                crate::observability::BOOKING_CONFLICTS_TOTAL,
                "kind" => rs.kind.as_str(),
                "maintenance" => if c.maintenance { "true" } else { "false" }
            )
            .increment(1);
            conflicts.push(c);
        }
    }
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Conflict(conflicts))
    }
}

pub(super) fn check_capacity(txn: &Txn, resource_ids: &[Ulid]) -> Result<(), EngineError> {
    for rid in resource_ids {
        if let Some(rs) = txn.resource(rid)
            && rs.allocations.len() >= MAX_ALLOCATIONS_PER_RESOURCE
        {
            return Err(EngineError::LimitExceeded("too many active bookings on resource"));
        }
    }
    Ok(())
}
