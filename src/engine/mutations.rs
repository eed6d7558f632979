use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tokio::sync::oneshot;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, occupies_slot, validate_span};
use super::lifecycle::{initial_status, next_status, Action};
use super::reference::{random_reference, reserve_unique};
use super::store::RoomState;
use super::{Engine, EngineError, WalCommand};

/// Payment details attached to a booking created from a completed checkout.
pub(super) struct PaidSession {
    pub session_id: String,
    pub paid_at: DateTime<Utc>,
}

/// A booking that has passed validation and the conflict check, ready to be
/// written under the room lock.
pub(super) struct BookingDraft {
    pub visitor_id: VisitorId,
    pub request: NewBooking,
    pub reference: String,
    pub status: BookingStatus,
    /// Frozen here; later rate changes never touch it.
    pub total_cost: rust_decimal::Decimal,
    pub paid: Option<PaidSession>,
}

impl Engine {
    // ── Booking creation ─────────────────────────────────────

    /// Create a booking for the calling visitor. Only available when payment
    /// is not required; otherwise bookings come from completed checkouts.
    pub async fn create_booking(
        &self,
        principal: &Principal,
        req: NewBooking,
    ) -> Result<Booking, EngineError> {
        if self.options.payment_required {
            return Err(EngineError::invalid(
                "payment is required: start a checkout instead",
            ));
        }
        let visitor = self.require_active_visitor(principal)?;

        let _commit = self.begin_write().await?;
        let mut guard = self.lock_room(req.room_id).await?;
        let now = self.clock.now();
        validate_new_booking(&guard, &req, now, false)?;
        check_no_conflict(&guard, req.booking_date, &req.span, None, false)?;

        let draft = BookingDraft {
            visitor_id: visitor.id,
            reference: reserve_unique(&self.store, req.booking_date.year(), random_reference),
            status: initial_status(&guard.room),
            total_cost: booking_cost(&req.span, guard.room.hourly_rate),
            paid: None,
            request: req,
        };
        self.commit_new_booking(&mut guard, draft, now).await
    }

    /// Persist and apply a new booking row. The caller holds the room lock and
    /// has reserved the draft's reference, which is released if the write fails.
    pub(super) async fn commit_new_booking(
        &self,
        rs: &mut RoomState,
        draft: BookingDraft,
        now: DateTime<Utc>,
    ) -> Result<Booking, EngineError> {
        let BookingDraft {
            visitor_id,
            request: req,
            reference,
            status,
            total_cost,
            paid,
        } = draft;
        let (payment_session_id, payment_date) = match paid {
            Some(p) => (Some(p.session_id), Some(p.paid_at)),
            None => (None, None),
        };
        let booking = Booking {
            id: self.store.next_booking_id(),
            room_id: rs.room.id,
            visitor_id,
            booking_reference: reference,
            booking_date: req.booking_date,
            span: req.span,
            purpose: req.purpose.trim().to_string(),
            description: req.description,
            expected_attendees: req.expected_attendees,
            status,
            total_cost,
            admin_notes: None,
            cancellation_reason: None,
            approved_by: None,
            approved_at: None,
            payment_session_id,
            payment_date,
            created_at: now,
            updated_at: now,
        };

        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        if let Err(e) = self.persist_and_apply(rs, &event).await {
            self.store.release_reference(&booking.booking_reference);
            return Err(e);
        }

        metrics::counter!(crate::observability::BOOKING_TRANSITIONS_TOTAL, "to" => status.as_str())
            .increment(1);
        tracing::info!(
            booking_id = booking.id,
            reference = %booking.booking_reference,
            room_id = booking.room_id,
            date = %booking.booking_date,
            span = %booking.span,
            status = %status,
            "booking created"
        );
        Ok(booking)
    }

    // ── Transitions ──────────────────────────────────────────

    pub async fn approve_booking(
        &self,
        principal: &Principal,
        id: BookingId,
        admin_notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        let admin_id = require_admin(principal)?;
        check_optional_text(admin_notes.as_deref(), MAX_TEXT_LEN, "admin notes too long")?;
        let now = self.clock.now();
        self.transition(id, Action::Approve, |_| Ok(()), |status, room_id, date| Event::BookingTransitioned {
            id,
            room_id,
            date,
            status,
            approved_by: Some(admin_id),
            approved_at: Some(now),
            cancellation_reason: None,
            admin_notes,
            at: now,
        })
        .await
    }

    pub async fn reject_booking(
        &self,
        principal: &Principal,
        id: BookingId,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        let admin_id = require_admin(principal)?;
        check_optional_text(reason.as_deref(), MAX_REASON_LEN, "reason too long")?;
        let now = self.clock.now();
        self.transition(id, Action::Reject, |_| Ok(()), |status, room_id, date| Event::BookingTransitioned {
            id,
            room_id,
            date,
            status,
            approved_by: Some(admin_id),
            approved_at: Some(now),
            cancellation_reason: reason,
            admin_notes: None,
            at: now,
        })
        .await
    }

    /// Cancel one of the caller's own bookings before it starts.
    pub async fn cancel_booking(
        &self,
        principal: &Principal,
        id: BookingId,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        let visitor_id = principal
            .visitor_id()
            .ok_or(EngineError::Forbidden("only the booking's visitor can cancel it"))?;
        check_optional_text(reason.as_deref(), MAX_REASON_LEN, "reason too long")?;
        let now = self.clock.now();
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "Cancelled by visitor".to_string());

        self.transition(
            id,
            Action::Cancel,
            |b| {
                if b.visitor_id != visitor_id {
                    return Err(EngineError::Forbidden("booking belongs to another visitor"));
                }
                if b.starts_at() <= now {
                    return Err(EngineError::invalid("cannot cancel a booking that has already started"));
                }
                Ok(())
            },
            |status, room_id, date| Event::BookingTransitioned {
                id,
                room_id,
                date,
                status,
                approved_by: None,
                approved_at: None,
                cancellation_reason: Some(reason),
                admin_notes: None,
                at: now,
            },
        )
        .await
    }

    /// Shared path for status-only transitions: lock the booking's room, check
    /// `authorize`, consult the transition table against the effective status,
    /// then persist the event built by `make_event` for the target status and
    /// the booking's current room and date.
    async fn transition(
        &self,
        id: BookingId,
        action: Action,
        authorize: impl FnOnce(&Booking) -> Result<(), EngineError>,
        make_event: impl FnOnce(BookingStatus, RoomId, NaiveDate) -> Event,
    ) -> Result<Booking, EngineError> {
        let _commit = self.begin_write().await?;
        let (mut guard, date) = self.resolve_booking_write(id).await?;
        let now = self.clock.now();
        let booking = guard
            .booking(id, date)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        authorize(booking)?;

        let current = effective_status(booking, now);
        let next = next_status(current, action, self.options.cancellation_policy).ok_or(
            EngineError::InvalidTransition {
                id,
                from: current,
                action: action.as_str(),
            },
        )?;

        let room_id = guard.room.id;
        let event = make_event(next, room_id, date);
        self.persist_and_apply(&mut guard, &event).await?;

        let updated = guard
            .booking(id, date)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        metrics::counter!(crate::observability::BOOKING_TRANSITIONS_TOTAL, "to" => next.as_str())
            .increment(1);
        tracing::info!(
            booking_id = id,
            reference = %updated.booking_reference,
            room_id,
            from = %current,
            to = %next,
            "booking {}",
            action.as_str()
        );
        Ok(updated)
    }

    // ── Visitor edits ────────────────────────────────────────

    /// Change a booking's slot or details. A slot change re-checks conflicts
    /// on the target room (ignoring this booking) and recomputes the cost.
    pub async fn update_booking(
        &self,
        principal: &Principal,
        id: BookingId,
        changes: BookingChanges,
    ) -> Result<Booking, EngineError> {
        let visitor_id = principal
            .visitor_id()
            .ok_or(EngineError::Forbidden("only the booking's visitor can update it"))?;
        if let Some(span) = &changes.span {
            validate_span(span)?;
        }
        if let Some(p) = &changes.purpose {
            check_purpose(p)?;
        }
        check_optional_text(changes.description.as_deref(), MAX_TEXT_LEN, "description too long")?;

        let _commit = self.begin_write().await?;
        for _ in 0..3 {
            let (from_room, from_date) = self
                .store
                .booking_location(id)
                .ok_or_else(|| EngineError::not_found("booking", id))?;
            let to_room = changes.room_id.unwrap_or(from_room);

            if to_room == from_room {
                let mut guard = self.lock_room(from_room).await?;
                if self.store.booking_location(id) != Some((from_room, from_date)) {
                    continue;
                }
                return self
                    .reschedule(&mut guard, None, id, from_date, visitor_id, &changes)
                    .await;
            }

            // Lock both rooms in ascending id order.
            let (mut lo, mut hi) = if from_room < to_room {
                let a = self.lock_room(from_room).await?;
                let b = self.lock_room(to_room).await?;
                (a, b)
            } else {
                let a = self.lock_room(to_room).await?;
                let b = self.lock_room(from_room).await?;
                (a, b)
            };
            if self.store.booking_location(id) != Some((from_room, from_date)) {
                continue;
            }
            let (from_guard, to_guard) = if from_room < to_room {
                (&mut *lo, &mut *hi)
            } else {
                (&mut *hi, &mut *lo)
            };
            return self
                .reschedule(from_guard, Some(to_guard), id, from_date, visitor_id, &changes)
                .await;
        }
        Err(EngineError::Transient(format!("booking {id} moved while locking")))
    }

    async fn reschedule(
        &self,
        from: &mut RoomState,
        mut to: Option<&mut RoomState>,
        id: BookingId,
        from_date: NaiveDate,
        visitor_id: VisitorId,
        changes: &BookingChanges,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        let current = from
            .booking(id, from_date)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        if current.visitor_id != visitor_id {
            return Err(EngineError::Forbidden("booking belongs to another visitor"));
        }
        let status = effective_status(&current, now);
        next_status(status, Action::Reschedule, self.options.cancellation_policy).ok_or(
            EngineError::InvalidTransition {
                id,
                from: status,
                action: Action::Reschedule.as_str(),
            },
        )?;
        if current.starts_at() <= now {
            return Err(EngineError::invalid("cannot update a booking that has already started"));
        }

        let target: &RoomState = match to.as_deref() {
            Some(t) => t,
            None => &*from,
        };
        let mut updated = current.clone();
        updated.room_id = target.room.id;
        updated.booking_date = changes.booking_date.unwrap_or(current.booking_date);
        updated.span = changes.span.unwrap_or(current.span);
        if let Some(p) = &changes.purpose {
            updated.purpose = p.trim().to_string();
        }
        if changes.description.is_some() {
            updated.description = changes.description.clone();
        }
        if let Some(n) = changes.expected_attendees {
            updated.expected_attendees = n;
        }
        updated.updated_at = now;

        if updated.expected_attendees == 0 {
            return Err(EngineError::invalid("expected_attendees must be at least 1"));
        }
        if updated.expected_attendees > target.room.capacity {
            return Err(EngineError::invalid(format!(
                "expected_attendees {} exceeds room capacity {}",
                updated.expected_attendees, target.room.capacity
            )));
        }

        if changes.moves_slot(&current) {
            if !target.room.is_available {
                return Err(EngineError::invalid("room is not available for booking"));
            }
            check_booking_date(updated.booking_date, now)?;
            check_no_conflict(
                target,
                updated.booking_date,
                &updated.span,
                Some(id),
                self.options.payment_required,
            )?;
            updated.total_cost = booking_cost(&updated.span, target.room.hourly_rate);
        }

        let event = Event::BookingRescheduled {
            booking: updated.clone(),
            from_room: current.room_id,
            from_date,
        };
        self.wal_append(&event).await?;
        match to.as_deref_mut() {
            Some(t) => self.store.apply_move(from, t, &updated, from_date),
            None => self.store.apply_to_room(from, &event),
        }

        tracing::info!(
            booking_id = id,
            reference = %updated.booking_reference,
            from_room = current.room_id,
            to_room = updated.room_id,
            date = %updated.booking_date,
            span = %updated.span,
            "booking updated"
        );
        Ok(updated)
    }

    // ── Sweeps and maintenance ───────────────────────────────

    /// Persist `Completed` for every live booking that has ended. Reads
    /// already see these as completed; this makes the log agree.
    pub async fn complete_elapsed(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let mut completed = 0;
        for (room_id, _) in self.store.room_handles() {
            let _commit = self.begin_write().await?;
            let mut guard = match self.lock_room(room_id).await {
                Ok(g) => g,
                Err(EngineError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            let elapsed: Vec<(BookingId, NaiveDate)> = guard
                .bookings()
                .filter(|b| {
                    matches!(b.status, BookingStatus::PendingApproval | BookingStatus::Approved)
                        && b.ends_at() <= now
                })
                .map(|b| (b.id, b.booking_date))
                .collect();

            for (id, date) in elapsed {
                let event = Event::BookingTransitioned {
                    id,
                    room_id,
                    date,
                    status: BookingStatus::Completed,
                    approved_by: None,
                    approved_at: None,
                    cancellation_reason: None,
                    admin_notes: None,
                    at: now,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                metrics::counter!(crate::observability::BOOKING_TRANSITIONS_TOTAL, "to" => "completed")
                    .increment(1);
                completed += 1;
            }
        }
        if completed > 0 {
            tracing::info!(completed, "marked elapsed bookings completed");
        }
        Ok(completed)
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    /// Writers are paused for the duration via the commit gate.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _pause = self.commit_gate.write().await;
        let mut events = Vec::new();

        for admin in self.store.admins() {
            events.push(Event::AdminRegistered { admin });
        }
        for visitor in self.store.visitors() {
            events.push(Event::VisitorRegistered { visitor });
        }
        for (_, rs) in self.store.room_handles() {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
            for window in &guard.windows {
                events.push(Event::WindowAdded {
                    window: window.clone(),
                });
            }
            for booking in guard.bookings() {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Transient("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Transient("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    // ── Authorization helpers ────────────────────────────────

    pub(super) fn require_active_visitor(&self, principal: &Principal) -> Result<Visitor, EngineError> {
        let id = principal
            .visitor_id()
            .ok_or(EngineError::Forbidden("only visitors can book rooms"))?;
        let visitor = self
            .store
            .visitor(id)
            .ok_or_else(|| EngineError::not_found("visitor", id))?;
        if !visitor.is_active {
            return Err(EngineError::Forbidden("visitor account is deactivated"));
        }
        Ok(visitor)
    }
}

pub(super) fn require_admin(principal: &Principal) -> Result<AdminId, EngineError> {
    match principal {
        Principal::Admin { id, .. } => Ok(*id),
        _ => Err(EngineError::Forbidden("admin access required")),
    }
}

pub(super) fn check_optional_text(
    text: Option<&str>,
    max: usize,
    msg: &'static str,
) -> Result<(), EngineError> {
    match text {
        Some(t) if t.len() > max => Err(EngineError::LimitExceeded(msg)),
        _ => Ok(()),
    }
}

fn check_purpose(purpose: &str) -> Result<(), EngineError> {
    let trimmed = purpose.trim();
    if trimmed.is_empty() {
        return Err(EngineError::invalid("purpose is required"));
    }
    if trimmed.len() > MAX_PURPOSE_LEN {
        return Err(EngineError::LimitExceeded("purpose too long"));
    }
    Ok(())
}

fn check_booking_date(date: NaiveDate, now: DateTime<Utc>) -> Result<(), EngineError> {
    let today = now.date_naive();
    if date < today {
        return Err(EngineError::invalid("booking_date cannot be in the past"));
    }
    if (date - today).num_days() > MAX_BOOKING_HORIZON_DAYS {
        return Err(EngineError::LimitExceeded("booking_date too far ahead"));
    }
    Ok(())
}

/// Everything a new booking must satisfy apart from the conflict check.
pub(super) fn validate_new_booking(
    rs: &RoomState,
    req: &NewBooking,
    now: DateTime<Utc>,
    payment_gated: bool,
) -> Result<(), EngineError> {
    validate_span(&req.span)?;
    check_purpose(&req.purpose)?;
    check_optional_text(req.description.as_deref(), MAX_TEXT_LEN, "description too long")?;
    check_booking_date(req.booking_date, now)?;
    if req.booking_date == now.date_naive() && instant_at(req.booking_date, req.span.end) <= now {
        return Err(EngineError::invalid("requested slot has already ended"));
    }
    if !rs.room.is_available {
        return Err(EngineError::invalid("room is not available for booking"));
    }
    if req.expected_attendees == 0 {
        return Err(EngineError::invalid("expected_attendees must be at least 1"));
    }
    if req.expected_attendees > rs.room.capacity {
        return Err(EngineError::invalid(format!(
            "expected_attendees {} exceeds room capacity {}",
            req.expected_attendees, rs.room.capacity
        )));
    }
    // Cancelled and rejected rows stay on the day but no longer hold a slot.
    let holding = rs
        .day(req.booking_date)
        .iter()
        .filter(|b| occupies_slot(b, payment_gated))
        .count();
    if holding >= MAX_BOOKINGS_PER_ROOM_DAY {
        return Err(EngineError::LimitExceeded("too many bookings for this room and date"));
    }
    Ok(())
}
