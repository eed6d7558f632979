use chrono::NaiveDate;

use crate::model::*;

use super::store::RoomState;
use super::EngineError;

/// Does this booking hold its slot?
///
/// In payment-gated mode a row only counts once it carries a payment session.
pub fn occupies_slot(booking: &Booking, payment_gated: bool) -> bool {
    booking.status.is_live() && (!payment_gated || booking.payment_session_id.is_some())
}

/// Live bookings on `date` overlapping `span`, optionally ignoring one booking.
pub fn find_conflicts(
    rs: &RoomState,
    date: NaiveDate,
    span: &Span,
    exclude: Option<BookingId>,
    payment_gated: bool,
) -> Vec<ConflictInfo> {
    rs.overlapping(date, span)
        .filter(|b| Some(b.id) != exclude)
        .filter(|b| occupies_slot(b, payment_gated))
        .filter(|b| span.overlaps(&b.span))
        .map(ConflictInfo::from)
        .collect()
}

pub fn has_conflict(
    rs: &RoomState,
    date: NaiveDate,
    span: &Span,
    exclude: Option<BookingId>,
    payment_gated: bool,
) -> bool {
    rs.overlapping(date, span)
        .any(|b| Some(b.id) != exclude && occupies_slot(b, payment_gated) && span.overlaps(&b.span))
}

pub(crate) fn check_no_conflict(
    rs: &RoomState,
    date: NaiveDate,
    span: &Span,
    exclude: Option<BookingId>,
    payment_gated: bool,
) -> Result<(), EngineError> {
    let conflicts = find_conflicts(rs, date, span, exclude, payment_gated);
    if conflicts.is_empty() {
        return Ok(());
    }
    metrics::counter!(crate::observability::SLOT_CONFLICTS_TOTAL).increment(1);
    Err(EngineError::SlotConflict {
        room_id: rs.room.id,
        date,
        span: *span,
        conflicts,
    })
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::invalid("end_time must be after start_time"));
    }
    if span.end > DAY_SECS {
        return Err(EngineError::invalid("end_time past end of day"));
    }
    Ok(())
}
