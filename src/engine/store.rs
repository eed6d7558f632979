use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;

use crate::model::*;

use super::EngineError;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Everything guarded by one room's lock: the room row, its weekly windows
/// and every booking ever made against it.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub windows: Vec<AvailabilityWindow>,
    /// Bookings per date, each list sorted by `span.start`. Includes non-live rows.
    pub days: BTreeMap<NaiveDate, Vec<Booking>>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            windows: Vec::new(),
            days: BTreeMap::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let day = self.days.entry(booking.booking_date).or_default();
        let pos = day
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        day.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: BookingId, date: NaiveDate) -> Option<Booking> {
        let day = self.days.get_mut(&date)?;
        let pos = day.iter().position(|b| b.id == id)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        Some(removed)
    }

    pub fn booking(&self, id: BookingId, date: NaiveDate) -> Option<&Booking> {
        self.days.get(&date)?.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: BookingId, date: NaiveDate) -> Option<&mut Booking> {
        self.days.get_mut(&date)?.iter_mut().find(|b| b.id == id)
    }

    pub fn day(&self, date: NaiveDate) -> &[Booking] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Bookings on `date` whose span overlaps `query`, whatever their status.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, date: NaiveDate, query: &Span) -> impl Iterator<Item = &Booking> {
        let day = self.day(date);
        let right_bound = day.partition_point(|b| b.span.start < query.end);
        day[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn bookings(&self) -> impl Iterator<Item = &Booking> {
        self.days.values().flatten()
    }

    pub fn has_bookings(&self) -> bool {
        !self.days.is_empty()
    }

    pub fn windows_on(&self, day_of_week: u8) -> impl Iterator<Item = &AvailabilityWindow> {
        self.windows
            .iter()
            .filter(move |w| w.day_of_week == day_of_week)
    }
}

struct Sequences {
    room: AtomicU64,
    booking: AtomicU64,
    visitor: AtomicU64,
    admin: AtomicU64,
    window: AtomicU64,
}

impl Sequences {
    fn new() -> Self {
        Self {
            room: AtomicU64::new(1),
            booking: AtomicU64::new(1),
            visitor: AtomicU64::new(1),
            admin: AtomicU64::new(1),
            window: AtomicU64::new(1),
        }
    }
}

fn observe(seq: &AtomicU64, id: u64) {
    seq.fetch_max(id + 1, Ordering::Relaxed);
}

/// One repository per entity kind, plus the secondary indexes that enforce
/// uniqueness. Room-scoped state lives behind the per-room lock.
pub struct InMemoryStore {
    rooms: DashMap<RoomId, SharedRoomState>,
    room_numbers: DashMap<String, RoomId>,
    window_rooms: DashMap<WindowId, RoomId>,
    visitors: DashMap<VisitorId, Visitor>,
    visitor_emails: DashMap<String, VisitorId>,
    student_ids: DashMap<String, VisitorId>,
    admins: DashMap<AdminId, Admin>,
    admin_usernames: DashMap<String, AdminId>,
    admin_emails: DashMap<String, AdminId>,
    /// booking id → (room, date) locating the row inside its room state.
    booking_locations: DashMap<BookingId, (RoomId, NaiveDate)>,
    /// `None` marks a reference reserved for a booking not yet written.
    references: DashMap<String, Option<BookingId>>,
    /// Payment session id → booking created from it.
    sessions: DashMap<String, BookingId>,
    seq: Sequences,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            room_numbers: DashMap::new(),
            window_rooms: DashMap::new(),
            visitors: DashMap::new(),
            visitor_emails: DashMap::new(),
            student_ids: DashMap::new(),
            admins: DashMap::new(),
            admin_usernames: DashMap::new(),
            admin_emails: DashMap::new(),
            booking_locations: DashMap::new(),
            references: DashMap::new(),
            sessions: DashMap::new(),
            seq: Sequences::new(),
        }
    }

    // ── Id allocation ────────────────────────────────────────

    pub fn next_room_id(&self) -> RoomId {
        self.seq.room.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_booking_id(&self) -> BookingId {
        self.seq.booking.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_visitor_id(&self) -> VisitorId {
        self.seq.visitor.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_admin_id(&self) -> AdminId {
        self.seq.admin.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_window_id(&self) -> WindowId {
        self.seq.window.fetch_add(1, Ordering::Relaxed)
    }

    // ── Rooms ────────────────────────────────────────────────

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room(&self, id: RoomId) -> Option<SharedRoomState> {
        self.rooms.get(&id).map(|e| e.value().clone())
    }

    /// Snapshot of room handles, sorted by id. Safe to hold across awaits.
    pub fn room_handles(&self) -> Vec<(RoomId, SharedRoomState)> {
        let mut handles: Vec<_> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        handles
    }

    pub fn room_for_window(&self, id: WindowId) -> Option<RoomId> {
        self.window_rooms.get(&id).map(|e| *e.value())
    }

    // ── People ───────────────────────────────────────────────

    pub fn visitor(&self, id: VisitorId) -> Option<Visitor> {
        self.visitors.get(&id).map(|e| e.value().clone())
    }

    pub fn visitors(&self) -> Vec<Visitor> {
        let mut all: Vec<_> = self.visitors.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|v| v.id);
        all
    }

    pub fn admin(&self, id: AdminId) -> Option<Admin> {
        self.admins.get(&id).map(|e| e.value().clone())
    }

    pub fn admins(&self) -> Vec<Admin> {
        let mut all: Vec<_> = self.admins.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|a| a.id);
        all
    }

    // ── Bookings ─────────────────────────────────────────────

    pub fn booking_location(&self, id: BookingId) -> Option<(RoomId, NaiveDate)> {
        self.booking_locations.get(&id).map(|e| *e.value())
    }

    pub fn booking_for_reference(&self, reference: &str) -> Option<BookingId> {
        self.references.get(reference).and_then(|e| *e.value())
    }

    pub fn booking_for_session(&self, session_id: &str) -> Option<BookingId> {
        self.sessions.get(session_id).map(|e| *e.value())
    }

    pub fn booking_count(&self) -> usize {
        self.booking_locations.len()
    }

    // ── Unique-key claims ────────────────────────────────────
    //
    // Claims are taken before the WAL append and released if it fails, so two
    // concurrent writers can never both pass a uniqueness check.

    pub fn claim_room_number(&self, number: &str, id: RoomId) -> Result<(), EngineError> {
        claim(&self.room_numbers, number.to_string(), id, "room_number")
    }

    pub fn release_room_number(&self, number: &str) {
        self.room_numbers.remove(number);
    }

    pub fn claim_visitor_keys(&self, email: &str, student_id: Option<&str>, id: VisitorId) -> Result<(), EngineError> {
        claim(&self.visitor_emails, email_key(email), id, "email")?;
        if let Some(sid) = student_id
            && let Err(e) = claim(&self.student_ids, sid.to_string(), id, "student_id")
        {
            self.visitor_emails.remove(&email_key(email));
            return Err(e);
        }
        Ok(())
    }

    pub fn release_visitor_keys(&self, email: &str, student_id: Option<&str>) {
        self.visitor_emails.remove(&email_key(email));
        if let Some(sid) = student_id {
            self.student_ids.remove(sid);
        }
    }

    pub fn claim_admin_keys(&self, username: &str, email: &str, id: AdminId) -> Result<(), EngineError> {
        claim(&self.admin_usernames, username.to_lowercase(), id, "username")?;
        if let Err(e) = claim(&self.admin_emails, email_key(email), id, "email") {
            self.admin_usernames.remove(&username.to_lowercase());
            return Err(e);
        }
        Ok(())
    }

    pub fn release_admin_keys(&self, username: &str, email: &str) {
        self.admin_usernames.remove(&username.to_lowercase());
        self.admin_emails.remove(&email_key(email));
    }

    /// Reserve a booking reference. Returns false if it is already taken.
    pub fn reserve_reference(&self, reference: &str) -> bool {
        match self.references.entry(reference.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(None);
                true
            }
        }
    }

    /// Drop a reservation that never became a booking.
    pub fn release_reference(&self, reference: &str) {
        self.references.remove_if(reference, |_, v| v.is_none());
    }

    pub fn has_reference(&self, reference: &str) -> bool {
        self.references.contains_key(reference)
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event that is not scoped to an existing room's state.
    pub fn apply_global(&self, event: &Event) {
        match event {
            Event::AdminRegistered { admin } => {
                observe(&self.seq.admin, admin.id);
                self.admin_usernames.insert(admin.username.to_lowercase(), admin.id);
                self.admin_emails.insert(email_key(&admin.email), admin.id);
                self.admins.insert(admin.id, admin.clone());
            }
            Event::VisitorRegistered { visitor } | Event::VisitorUpdated { visitor } => {
                observe(&self.seq.visitor, visitor.id);
                self.visitor_emails.insert(email_key(&visitor.email), visitor.id);
                if let Some(sid) = &visitor.student_id {
                    self.student_ids.insert(sid.clone(), visitor.id);
                }
                self.visitors.insert(visitor.id, visitor.clone());
            }
            Event::RoomCreated { room } => {
                observe(&self.seq.room, room.id);
                self.room_numbers.insert(room.room_number.clone(), room.id);
                self.rooms
                    .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
            }
            Event::RoomDeleted { id } => {
                if let Some(rs) = self.room(*id)
                    && let Ok(guard) = rs.try_read()
                {
                    self.remove_room(&guard);
                }
            }
            _ => {}
        }
    }

    /// Drop a room and its index entries. Caller holds the room's lock.
    pub fn remove_room(&self, rs: &RoomState) {
        let id = rs.room.id;
        self.rooms.remove(&id);
        self.room_numbers
            .remove_if(&rs.room.room_number, |_, v| *v == id);
        for w in &rs.windows {
            self.window_rooms.remove(&w.id);
        }
    }

    /// Apply a room-scoped event. Caller holds the room's write lock.
    pub fn apply_to_room(&self, rs: &mut RoomState, event: &Event) {
        match event {
            Event::RoomUpdated { room } => {
                if rs.room.room_number != room.room_number {
                    self.room_numbers
                        .remove_if(&rs.room.room_number, |_, v| *v == room.id);
                    self.room_numbers.insert(room.room_number.clone(), room.id);
                }
                rs.room = room.clone();
            }
            Event::WindowAdded { window } => {
                observe(&self.seq.window, window.id);
                self.window_rooms.insert(window.id, window.room_id);
                rs.windows.push(window.clone());
                rs.windows
                    .sort_by_key(|w| (w.day_of_week, w.span.start, w.id));
            }
            Event::WindowRemoved { id, .. } => {
                rs.windows.retain(|w| w.id != *id);
                self.window_rooms.remove(id);
            }
            Event::BookingCreated { booking } => {
                self.index_booking(booking);
                rs.insert_booking(booking.clone());
            }
            Event::BookingTransitioned {
                id,
                date,
                status,
                approved_by,
                approved_at,
                cancellation_reason,
                admin_notes,
                at,
                ..
            } => {
                if let Some(b) = rs.booking_mut(*id, *date) {
                    b.status = *status;
                    if approved_by.is_some() {
                        b.approved_by = *approved_by;
                    }
                    if approved_at.is_some() {
                        b.approved_at = *approved_at;
                    }
                    if cancellation_reason.is_some() {
                        b.cancellation_reason = cancellation_reason.clone();
                    }
                    if admin_notes.is_some() {
                        b.admin_notes = admin_notes.clone();
                    }
                    b.updated_at = *at;
                }
            }
            Event::BookingRescheduled { booking, from_date, .. } => {
                rs.remove_booking(booking.id, *from_date);
                self.index_booking(booking);
                rs.insert_booking(booking.clone());
            }
            _ => {}
        }
    }

    /// Move a booking between two different rooms. Caller holds both write locks.
    pub fn apply_move(&self, from: &mut RoomState, to: &mut RoomState, booking: &Booking, from_date: NaiveDate) {
        from.remove_booking(booking.id, from_date);
        self.index_booking(booking);
        to.insert_booking(booking.clone());
    }

    fn index_booking(&self, booking: &Booking) {
        observe(&self.seq.booking, booking.id);
        self.booking_locations
            .insert(booking.id, (booking.room_id, booking.booking_date));
        self.references
            .insert(booking.booking_reference.clone(), Some(booking.id));
        if let Some(session) = &booking.payment_session_id {
            self.sessions.insert(session.clone(), booking.id);
        }
    }
}

fn claim<K>(map: &DashMap<K, u64>, key: K, id: u64, field: &'static str) -> Result<(), EngineError>
where
    K: std::hash::Hash + Eq + Clone + ToString,
{
    match map.entry(key) {
        Entry::Occupied(e) if *e.get() != id => Err(EngineError::Duplicate {
            field,
            value: e.key().to_string(),
        }),
        Entry::Occupied(_) => Ok(()),
        Entry::Vacant(v) => {
            v.insert(id);
            Ok(())
        }
    }
}

/// Room touched by a room-scoped event, if any.
pub(super) fn event_room_id(event: &Event) -> Option<RoomId> {
    match event {
        Event::RoomUpdated { room } => Some(room.id),
        Event::WindowAdded { window } => Some(window.room_id),
        Event::WindowRemoved { room_id, .. } => Some(*room_id),
        Event::BookingCreated { booking } | Event::BookingRescheduled { booking, .. } => {
            Some(booking.room_id)
        }
        Event::BookingTransitioned { room_id, .. } => Some(*room_id),
        Event::AdminRegistered { .. }
        | Event::VisitorRegistered { .. }
        | Event::VisitorUpdated { .. }
        | Event::RoomCreated { .. }
        | Event::RoomDeleted { .. } => None,
    }
}
