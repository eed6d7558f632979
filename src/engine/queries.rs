use chrono::{DateTime, NaiveDate, Utc};

use crate::filter::{BookingFilter, BookingPredicate, RoomFilter};
use crate::model::*;

use super::availability::{free_slots, within_open_hours};
use super::conflict::{self, validate_span};
use super::mutations::require_admin;
use super::{Engine, EngineError};

/// A booking as readers see it: status replaced by the effective status.
fn present(mut booking: Booking, now: DateTime<Utc>) -> Booking {
    booking.status = effective_status(&booking, now);
    booking
}

impl Engine {
    // ── Bookings ─────────────────────────────────────────────

    /// Admins see every booking; visitors only their own. Another visitor's
    /// booking reads as not found.
    pub async fn get_booking(&self, principal: &Principal, id: BookingId) -> Result<Booking, EngineError> {
        let (room_id, date) = self
            .store
            .booking_location(id)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let guard = self.read_room(room_id).await?;
        let booking = guard
            .booking(id, date)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        drop(guard);
        self.scope_booking(principal, booking)
    }

    pub async fn get_booking_by_reference(
        &self,
        principal: &Principal,
        reference: &str,
    ) -> Result<Booking, EngineError> {
        let id = self
            .store
            .booking_for_reference(&reference.trim().to_ascii_uppercase())
            .ok_or_else(|| EngineError::not_found("booking", reference))?;
        self.get_booking(principal, id).await
    }

    fn scope_booking(&self, principal: &Principal, booking: Booking) -> Result<Booking, EngineError> {
        match principal {
            Principal::Admin { .. } => {}
            Principal::Visitor(vid) if *vid == booking.visitor_id => {}
            Principal::Visitor(_) => return Err(EngineError::not_found("booking", booking.id)),
            Principal::Anonymous => return Err(EngineError::Forbidden("sign in to view bookings")),
        }
        Ok(present(booking, self.clock.now()))
    }

    /// Bookings matching `filter`, newest first. Visitors are pinned to
    /// their own bookings whatever the filter says.
    pub async fn list_bookings(
        &self,
        principal: &Principal,
        filter: BookingFilter,
    ) -> Result<Vec<Booking>, EngineError> {
        let filter = match principal {
            Principal::Admin { .. } => filter,
            Principal::Visitor(id) => filter.with(BookingPredicate::Visitor(*id)),
            Principal::Anonymous => return Err(EngineError::Forbidden("sign in to view bookings")),
        };
        let now = self.clock.now();

        let rooms: Vec<RoomId> = match filter.room_id() {
            Some(id) if self.store.room(id).is_some() => vec![id],
            Some(_) => Vec::new(),
            None => self.store.room_handles().into_iter().map(|(id, _)| id).collect(),
        };

        let mut matched = Vec::new();
        for room_id in rooms {
            let guard = match self.read_room(room_id).await {
                Ok(g) => g,
                Err(EngineError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            matched.extend(
                guard
                    .bookings()
                    .filter(|b| filter.matches(b, now))
                    .cloned(),
            );
        }

        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .map(|b| present(b, now))
            .collect())
    }

    // ── Rooms ────────────────────────────────────────────────

    pub async fn get_room(&self, id: RoomId) -> Result<Room, EngineError> {
        Ok(self.read_room(id).await?.room.clone())
    }

    /// Rooms matching `filter`, ordered by room number. A `FreeAt` predicate
    /// is evaluated against each room's live bookings.
    pub async fn list_rooms(&self, filter: &RoomFilter) -> Result<Vec<Room>, EngineError> {
        let free_at = filter.free_at();
        if let Some((_, span)) = &free_at {
            validate_span(span)?;
        }
        let gated = self.options.payment_required;

        let mut rooms = Vec::new();
        for (_, rs) in self.store.room_handles() {
            let guard = rs.read().await;
            if !filter.matches(&guard.room) {
                continue;
            }
            if let Some((date, span)) = &free_at
                && conflict::has_conflict(&guard, *date, span, None, gated)
            {
                continue;
            }
            rooms.push(guard.room.clone());
        }

        rooms.sort_by(|a, b| a.room_number.cmp(&b.room_number));
        Ok(rooms
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .collect())
    }

    pub async fn room_availability(&self, room_id: RoomId) -> Result<Vec<AvailabilityWindow>, EngineError> {
        Ok(self.read_room(room_id).await?.windows.clone())
    }

    // ── Conflict resolver ────────────────────────────────────

    pub async fn has_conflict(
        &self,
        room_id: RoomId,
        date: NaiveDate,
        span: Span,
        exclude: Option<BookingId>,
    ) -> Result<bool, EngineError> {
        validate_span(&span)?;
        let guard = self.read_room(room_id).await?;
        Ok(conflict::has_conflict(
            &guard,
            date,
            &span,
            exclude,
            self.options.payment_required,
        ))
    }

    pub async fn find_conflicts(
        &self,
        room_id: RoomId,
        date: NaiveDate,
        span: Span,
        exclude: Option<BookingId>,
    ) -> Result<Vec<ConflictInfo>, EngineError> {
        validate_span(&span)?;
        let guard = self.read_room(room_id).await?;
        Ok(conflict::find_conflicts(
            &guard,
            date,
            &span,
            exclude,
            self.options.payment_required,
        ))
    }

    /// Would this slot be bookable right now? Open hours are reported but
    /// do not affect `is_available`.
    pub async fn check_slot(&self, room_id: RoomId, date: NaiveDate, span: Span) -> Result<SlotCheck, EngineError> {
        validate_span(&span)?;
        let guard = self.read_room(room_id).await?;
        let conflicts =
            conflict::find_conflicts(&guard, date, &span, None, self.options.payment_required);
        Ok(SlotCheck {
            room_id,
            date,
            span,
            is_available: guard.room.is_available && conflicts.is_empty(),
            within_open_hours: within_open_hours(&guard, date, &span),
            conflicts,
        })
    }

    pub async fn free_slots(&self, room_id: RoomId, date: NaiveDate) -> Result<Vec<Span>, EngineError> {
        let guard = self.read_room(room_id).await?;
        Ok(free_slots(&guard, date, self.options.payment_required))
    }

    // ── People ───────────────────────────────────────────────

    pub fn list_visitors(&self, principal: &Principal) -> Result<Vec<VisitorView>, EngineError> {
        require_admin(principal)?;
        Ok(self.store.visitors().iter().map(VisitorView::from).collect())
    }

    /// Admins may read any visitor, visitors only themselves.
    pub fn get_visitor(&self, principal: &Principal, id: VisitorId) -> Result<VisitorView, EngineError> {
        if !principal.is_admin() && principal.visitor_id() != Some(id) {
            return Err(EngineError::Forbidden("visitors may only view their own profile"));
        }
        self.store
            .visitor(id)
            .map(|v| VisitorView::from(&v))
            .ok_or_else(|| EngineError::not_found("visitor", id))
    }

    pub fn list_admins(&self, principal: &Principal) -> Result<Vec<AdminView>, EngineError> {
        require_admin(principal)?;
        Ok(self.store.admins().iter().map(AdminView::from).collect())
    }

    /// Principal for a registered visitor. Deactivated visitors still resolve
    /// so they can read their history; booking refuses them.
    pub fn visitor_principal(&self, id: VisitorId) -> Option<Principal> {
        self.store.visitor(id).map(|v| Principal::Visitor(v.id))
    }

    /// Principal for an active admin, carrying the stored role.
    pub fn admin_principal(&self, id: AdminId) -> Option<Principal> {
        self.store
            .admin(id)
            .filter(|a| a.is_active)
            .map(|a| Principal::Admin { id: a.id, role: a.role })
    }

    // ── Dashboard ────────────────────────────────────────────

    pub async fn stats(&self, principal: &Principal) -> Result<Stats, EngineError> {
        require_admin(principal)?;
        let now = self.clock.now();
        let today = now.date_naive();

        let visitors = self.store.visitors();
        let mut stats = Stats {
            total_visitors: visitors.len(),
            active_visitors: visitors.iter().filter(|v| v.is_active).count(),
            ..Stats::default()
        };

        for (_, rs) in self.store.room_handles() {
            let guard = rs.read().await;
            stats.total_rooms += 1;
            if guard.room.is_available {
                stats.available_rooms += 1;
            }
            for b in guard.bookings() {
                stats.total_bookings += 1;
                match effective_status(b, now) {
                    BookingStatus::PendingApproval => stats.pending_bookings += 1,
                    BookingStatus::Approved => stats.approved_bookings += 1,
                    BookingStatus::Rejected => stats.rejected_bookings += 1,
                    BookingStatus::Cancelled => stats.cancelled_bookings += 1,
                    BookingStatus::Completed => stats.completed_bookings += 1,
                }
                if b.booking_date == today {
                    stats.todays_bookings += 1;
                }
            }
        }
        Ok(stats)
    }
}
