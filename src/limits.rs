// Hard caps on input sizes. Anything past these is rejected as a validation error.

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_WINDOWS_PER_ROOM: usize = 64;
pub const MAX_BOOKINGS_PER_ROOM_DAY: usize = 512;

pub const MAX_ROOM_NUMBER_LEN: usize = 20;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_TEXT_LEN: usize = 2_000;
pub const MAX_PURPOSE_LEN: usize = 255;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_EMAIL_LEN: usize = 255;
pub const MAX_AMENITIES: usize = 32;

pub const MAX_CAPACITY: u32 = 10_000;

/// How far ahead a booking may be placed.
pub const MAX_BOOKING_HORIZON_DAYS: i64 = 366;

pub const MAX_LIST_LIMIT: usize = 1_000;
pub const DEFAULT_LIST_LIMIT: usize = 100;

pub const MAX_WEBHOOK_PAYLOAD_BYTES: usize = 64 * 1024;

/// Webhook signatures older (or newer) than this are refused.
pub const WEBHOOK_TOLERANCE_SECS: i64 = 300;
