use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Seconds since midnight. `DAY_SECS` is a valid end bound (24:00).
pub type Secs = u32;

pub const DAY_SECS: Secs = 86_400;

pub type RoomId = u64;
pub type BookingId = u64;
pub type VisitorId = u64;
pub type AdminId = u64;
pub type WindowId = u64;

/// Half-open time-of-day interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Secs,
    pub end: Secs,
}

impl Span {
    pub fn new(start: Secs, end: Secs) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input: non-empty and within one day.
    pub fn try_new(start: Secs, end: Secs) -> Option<Self> {
        (start < end && end <= DAY_SECS).then_some(Self { start, end })
    }

    pub fn whole_day() -> Self {
        Self { start: 0, end: DAY_SECS }
    }

    pub fn duration_secs(&self) -> Secs {
        self.end - self.start
    }

    /// `[s, e)` and `[b.start, b.end)` overlap iff `s < b.end && e > b.start`.
    /// Touching spans do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_time_of_day(self.start),
            format_time_of_day(self.end)
        )
    }
}

/// Accepts `HH:MM` or `HH:MM:SS`; `24:00` denotes end of day.
pub fn parse_time_of_day(s: &str) -> Option<Secs> {
    let s = s.trim();
    if s == "24:00" || s == "24:00:00" {
        return Some(DAY_SECS);
    }
    let t = NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()?;
    Some(t.num_seconds_from_midnight())
}

pub fn format_time_of_day(secs: Secs) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Wall-clock instant of a time-of-day on a date. All booking times are UTC.
pub fn instant_at(date: NaiveDate, secs: Secs) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN) + chrono::Duration::seconds(i64::from(secs));
    Utc.from_utc_datetime(&naive)
}

/// Sunday = 0 .. Saturday = 6.
pub fn day_of_week(date: NaiveDate) -> u8 {
    use chrono::Datelike;
    date.weekday().num_days_from_sunday() as u8
}

/// `duration_hours × hourly_rate`, rounded half-up to cents.
pub fn booking_cost(span: &Span, hourly_rate: Decimal) -> Decimal {
    (Decimal::from(span.duration_secs()) * hourly_rate / Decimal::from(3600))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant { kind: $kind, value: s.to_string() }),
                }
            }
        }
    };
}

// ── Rooms ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomType {
    Classroom,
    MeetingRoom,
    Lab,
    Auditorium,
    ConferenceRoom,
}

string_enum!(RoomType, "room type", {
    Classroom => "classroom",
    MeetingRoom => "meeting_room",
    Lab => "lab",
    Auditorium => "auditorium",
    ConferenceRoom => "conference_room",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub room_number: String,
    pub room_name: String,
    pub description: Option<String>,
    pub capacity: u32,
    pub location: Option<String>,
    pub building: Option<String>,
    pub floor: Option<i32>,
    pub room_type: RoomType,
    pub amenities: Vec<String>,
    pub hourly_rate: Decimal,
    pub is_available: bool,
    pub requires_approval: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRoom {
    pub room_number: String,
    pub room_name: String,
    pub description: Option<String>,
    pub capacity: u32,
    pub location: Option<String>,
    pub building: Option<String>,
    pub floor: Option<i32>,
    pub room_type: RoomType,
    pub amenities: Vec<String>,
    pub hourly_rate: Decimal,
    pub is_available: bool,
    pub requires_approval: bool,
}

/// Partial room update. `None` leaves the field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomChanges {
    pub room_number: Option<String>,
    pub room_name: Option<String>,
    pub description: Option<String>,
    pub capacity: Option<u32>,
    pub location: Option<String>,
    pub building: Option<String>,
    pub floor: Option<i32>,
    pub room_type: Option<RoomType>,
    pub amenities: Option<Vec<String>>,
    pub hourly_rate: Option<Decimal>,
    pub is_available: Option<bool>,
    pub requires_approval: Option<bool>,
}

impl RoomChanges {
    /// True if the change touches anything other than rate or availability.
    /// Those are the only edits allowed once bookings reference the room.
    pub fn touches_fixed_fields(&self) -> bool {
        self.room_number.is_some()
            || self.room_name.is_some()
            || self.description.is_some()
            || self.capacity.is_some()
            || self.location.is_some()
            || self.building.is_some()
            || self.floor.is_some()
            || self.room_type.is_some()
            || self.amenities.is_some()
            || self.requires_approval.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.touches_fixed_fields() && self.hourly_rate.is_none() && self.is_available.is_none()
    }
}

pub fn full_location(room: &Room) -> String {
    [room.building.as_deref(), room.location.as_deref()]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Recurring weekly open-hours window. Advisory: bookings are not rejected
/// for falling outside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: WindowId,
    pub room_id: RoomId,
    /// Sunday = 0 .. Saturday = 6.
    pub day_of_week: u8,
    pub span: Span,
    pub is_available: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewWindow {
    pub room_id: RoomId,
    pub day_of_week: u8,
    pub span: Span,
    pub is_available: bool,
}

// ── People ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserType {
    Student,
    Staff,
    Visitor,
}

string_enum!(UserType, "user type", {
    Student => "student",
    Staff => "staff",
    Visitor => "visitor",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visitor {
    pub id: VisitorId,
    pub student_id: Option<String>,
    pub email: String,
    /// Opaque hash produced by the external auth layer.
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub user_type: UserType,
    pub department: Option<String>,
    pub is_active: bool,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Visitor as shown to callers. Has no credential field at all.
#[derive(Debug, Clone, PartialEq)]
pub struct VisitorView {
    pub id: VisitorId,
    pub student_id: Option<String>,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub user_type: UserType,
    pub department: Option<String>,
    pub is_active: bool,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Visitor> for VisitorView {
    fn from(v: &Visitor) -> Self {
        Self {
            id: v.id,
            student_id: v.student_id.clone(),
            email: v.email.clone(),
            first_name: v.first_name.clone(),
            last_name: v.last_name.clone(),
            phone: v.phone.clone(),
            user_type: v.user_type,
            department: v.department.clone(),
            is_active: v.is_active,
            email_verified: v.email_verified,
            created_at: v.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewVisitor {
    pub student_id: Option<String>,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub user_type: UserType,
    pub department: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisitorChanges {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub department: Option<String>,
    pub is_active: Option<bool>,
}

pub fn full_name(visitor: &VisitorView) -> String {
    format!("{} {}", visitor.first_name, visitor.last_name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdminRole {
    SuperAdmin,
    Admin,
}

string_enum!(AdminRole, "admin role", {
    SuperAdmin => "super_admin",
    Admin => "admin",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admin {
    pub id: AdminId,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub role: AdminRole,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdminView {
    pub id: AdminId,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: AdminRole,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Admin> for AdminView {
    fn from(a: &Admin) -> Self {
        Self {
            id: a.id,
            username: a.username.clone(),
            email: a.email.clone(),
            first_name: a.first_name.clone(),
            last_name: a.last_name.clone(),
            role: a.role,
            is_active: a.is_active,
            created_at: a.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAdmin {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub role: AdminRole,
}

/// Authenticated caller, as asserted by the external auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    Anonymous,
    Visitor(VisitorId),
    Admin { id: AdminId, role: AdminRole },
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        matches!(self, Principal::Admin { .. })
    }

    pub fn visitor_id(&self) -> Option<VisitorId> {
        match self {
            Principal::Visitor(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Anonymous => f.write_str("anonymous"),
            Principal::Visitor(id) => write!(f, "visitor:{id}"),
            Principal::Admin { id, role } => write!(f, "{role}:{id}"),
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    PendingApproval,
    Approved,
    Rejected,
    Cancelled,
    Completed,
}

string_enum!(BookingStatus, "booking status", {
    PendingApproval => "pending_approval",
    Approved => "approved",
    Rejected => "rejected",
    Cancelled => "cancelled",
    Completed => "completed",
});

impl BookingStatus {
    pub const ALL: [BookingStatus; 5] = [
        BookingStatus::PendingApproval,
        BookingStatus::Approved,
        BookingStatus::Rejected,
        BookingStatus::Cancelled,
        BookingStatus::Completed,
    ];

    /// Live statuses hold their slot.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            BookingStatus::PendingApproval | BookingStatus::Approved | BookingStatus::Completed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub room_id: RoomId,
    pub visitor_id: VisitorId,
    pub booking_reference: String,
    pub booking_date: NaiveDate,
    pub span: Span,
    pub purpose: String,
    pub description: Option<String>,
    pub expected_attendees: u32,
    pub status: BookingStatus,
    /// Frozen at creation or reschedule.
    pub total_cost: Decimal,
    pub admin_notes: Option<String>,
    pub cancellation_reason: Option<String>,
    pub approved_by: Option<AdminId>,
    pub approved_at: Option<DateTime<Utc>>,
    pub payment_session_id: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn starts_at(&self) -> DateTime<Utc> {
        instant_at(self.booking_date, self.span.start)
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        instant_at(self.booking_date, self.span.end)
    }
}

/// Status as seen at `now`: a live booking whose end has passed reads as completed.
pub fn effective_status(booking: &Booking, now: DateTime<Utc>) -> BookingStatus {
    if booking.status.is_live() && booking.ends_at() <= now {
        BookingStatus::Completed
    } else {
        booking.status
    }
}

pub fn is_paid(booking: &Booking) -> bool {
    booking.status.is_live() && booking.payment_session_id.is_some()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBooking {
    pub room_id: RoomId,
    pub booking_date: NaiveDate,
    pub span: Span,
    pub purpose: String,
    pub description: Option<String>,
    pub expected_attendees: u32,
}

/// Visitor-side edit. Slot fields that are `None` keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingChanges {
    pub room_id: Option<RoomId>,
    pub booking_date: Option<NaiveDate>,
    pub span: Option<Span>,
    pub purpose: Option<String>,
    pub description: Option<String>,
    pub expected_attendees: Option<u32>,
}

impl BookingChanges {
    pub fn moves_slot(&self, current: &Booking) -> bool {
        self.room_id.is_some_and(|r| r != current.room_id)
            || self.booking_date.is_some_and(|d| d != current.booking_date)
            || self.span.is_some_and(|s| s != current.span)
    }
}

/// Diagnostic view of a booking that blocks a requested slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub id: BookingId,
    pub booking_reference: String,
    pub start: Secs,
    pub end: Secs,
    pub status: BookingStatus,
}

impl From<&Booking> for ConflictInfo {
    fn from(b: &Booking) -> Self {
        Self {
            id: b.id,
            booking_reference: b.booking_reference.clone(),
            start: b.span.start,
            end: b.span.end,
            status: b.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotCheck {
    pub room_id: RoomId,
    pub date: NaiveDate,
    pub span: Span,
    pub is_available: bool,
    pub within_open_hours: bool,
    pub conflicts: Vec<ConflictInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub total_rooms: usize,
    pub available_rooms: usize,
    pub total_visitors: usize,
    pub active_visitors: usize,
    pub total_bookings: usize,
    pub pending_bookings: usize,
    pub approved_bookings: usize,
    pub rejected_bookings: usize,
    pub cancelled_bookings: usize,
    pub completed_bookings: usize,
    pub todays_bookings: usize,
}

/// WAL record. Each variant carries everything needed to rebuild state on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    AdminRegistered {
        admin: Admin,
    },
    VisitorRegistered {
        visitor: Visitor,
    },
    VisitorUpdated {
        visitor: Visitor,
    },
    RoomCreated {
        room: Room,
    },
    RoomUpdated {
        room: Room,
    },
    RoomDeleted {
        id: RoomId,
    },
    WindowAdded {
        window: AvailabilityWindow,
    },
    WindowRemoved {
        id: WindowId,
        room_id: RoomId,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingTransitioned {
        id: BookingId,
        room_id: RoomId,
        date: NaiveDate,
        status: BookingStatus,
        approved_by: Option<AdminId>,
        approved_at: Option<DateTime<Utc>>,
        cancellation_reason: Option<String>,
        admin_notes: Option<String>,
        at: DateTime<Utc>,
    },
    BookingRescheduled {
        booking: Booking,
        from_room: RoomId,
        from_date: NaiveDate,
    },
}
