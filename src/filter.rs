//! Typed query specifications. The SQL frontend builds these from WHERE
//! clauses and the engine evaluates them against its in-memory store.

use chrono::{DateTime, NaiveDate, Utc};

use crate::limits::{DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
use crate::model::*;

#[derive(Debug, Clone, PartialEq)]
pub enum BookingPredicate {
    Id(BookingId),
    Room(RoomId),
    Visitor(VisitorId),
    /// Compared against the effective status, so elapsed bookings match `Completed`.
    Status(BookingStatus),
    Date(NaiveDate),
    DateFrom(NaiveDate),
    DateTo(NaiveDate),
    Reference(String),
}

impl BookingPredicate {
    fn matches(&self, b: &Booking, now: DateTime<Utc>) -> bool {
        match self {
            BookingPredicate::Id(id) => b.id == *id,
            BookingPredicate::Room(id) => b.room_id == *id,
            BookingPredicate::Visitor(id) => b.visitor_id == *id,
            BookingPredicate::Status(s) => effective_status(b, now) == *s,
            BookingPredicate::Date(d) => b.booking_date == *d,
            BookingPredicate::DateFrom(d) => b.booking_date >= *d,
            BookingPredicate::DateTo(d) => b.booking_date <= *d,
            BookingPredicate::Reference(r) => b.booking_reference.eq_ignore_ascii_case(r),
        }
    }
}

/// Conjunction of booking predicates plus paging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingFilter {
    pub predicates: Vec<BookingPredicate>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl BookingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, predicate: BookingPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn matches(&self, booking: &Booking, now: DateTime<Utc>) -> bool {
        self.predicates.iter().all(|p| p.matches(booking, now))
    }

    /// Rooms the filter is pinned to, if any. Lets the store skip other rooms.
    pub fn room_id(&self) -> Option<RoomId> {
        self.predicates.iter().find_map(|p| match p {
            BookingPredicate::Room(id) => Some(*id),
            _ => None,
        })
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomPredicate {
    Type(RoomType),
    CapacityAtLeast(u32),
    CapacityAtMost(u32),
    AvailableOnly,
    /// Case-insensitive match on number, name or description.
    Search(String),
    Building(String),
    /// Room has no live booking overlapping this slot.
    FreeAt { date: NaiveDate, span: Span },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomFilter {
    pub predicates: Vec<RoomPredicate>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl RoomFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, predicate: RoomPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Static predicates only. `FreeAt` needs booking state and is checked by the engine.
    pub fn matches(&self, room: &Room) -> bool {
        self.predicates.iter().all(|p| match p {
            RoomPredicate::Type(t) => room.room_type == *t,
            RoomPredicate::CapacityAtLeast(n) => room.capacity >= *n,
            RoomPredicate::CapacityAtMost(n) => room.capacity <= *n,
            RoomPredicate::AvailableOnly => room.is_available,
            RoomPredicate::Search(needle) => {
                let needle = needle.to_lowercase();
                room.room_number.to_lowercase().contains(&needle)
                    || room.room_name.to_lowercase().contains(&needle)
                    || room
                        .description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
            }
            RoomPredicate::Building(b) => room
                .building
                .as_deref()
                .is_some_and(|rb| rb.eq_ignore_ascii_case(b)),
            RoomPredicate::FreeAt { .. } => true,
        })
    }

    pub fn free_at(&self) -> Option<(NaiveDate, Span)> {
        self.predicates.iter().find_map(|p| match p {
            RoomPredicate::FreeAt { date, span } => Some((*date, *span)),
            _ => None,
        })
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn room(capacity: u32, room_type: RoomType, name: &str) -> Room {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Room {
            id: 1,
            room_number: "B204".into(),
            room_name: name.into(),
            description: Some("Projector and whiteboard".into()),
            capacity,
            location: None,
            building: Some("Library".into()),
            floor: None,
            room_type,
            amenities: vec![],
            hourly_rate: Decimal::new(1000, 2),
            is_available: true,
            requires_approval: false,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn room_filter_conjunction() {
        let r = room(12, RoomType::MeetingRoom, "Huddle Space");
        let f = RoomFilter::new()
            .with(RoomPredicate::Type(RoomType::MeetingRoom))
            .with(RoomPredicate::CapacityAtLeast(10))
            .with(RoomPredicate::CapacityAtMost(12))
            .with(RoomPredicate::Search("projector".into()));
        assert!(f.matches(&r));

        let too_small = RoomFilter::new().with(RoomPredicate::CapacityAtLeast(20));
        assert!(!too_small.matches(&r));

        let other_building = RoomFilter::new().with(RoomPredicate::Building("Gym".into()));
        assert!(!other_building.matches(&r));
    }

    #[test]
    fn booking_status_predicate_uses_effective_status() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let b = Booking {
            id: 7,
            room_id: 3,
            visitor_id: 9,
            booking_reference: "BK-2026-ZZZZ0000".into(),
            booking_date: NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
            span: Span::new(9 * 3600, 10 * 3600),
            purpose: "Exam prep".into(),
            description: None,
            expected_attendees: 1,
            status: BookingStatus::Approved,
            total_cost: Decimal::ZERO,
            admin_notes: None,
            cancellation_reason: None,
            approved_by: Some(1),
            approved_at: Some(at),
            payment_session_id: None,
            payment_date: None,
            created_at: at,
            updated_at: at,
        };
        let later = Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).unwrap();
        let completed = BookingFilter::new().with(BookingPredicate::Status(BookingStatus::Completed));
        assert!(completed.matches(&b, later));
        assert!(!completed.matches(&b, at));

        let scoped = BookingFilter::new()
            .with(BookingPredicate::Room(3))
            .with(BookingPredicate::Reference("bk-2026-zzzz0000".into()));
        assert!(scoped.matches(&b, at));
        assert_eq!(scoped.room_id(), Some(3));
    }

    #[test]
    fn list_limit_is_capped() {
        assert_eq!(BookingFilter::new().effective_limit(), DEFAULT_LIST_LIMIT);
        assert_eq!(BookingFilter::new().limit(1_000_000).effective_limit(), MAX_LIST_LIMIT);
    }
}
