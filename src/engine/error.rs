use chrono::NaiveDate;

use crate::model::{BookingStatus, ConflictInfo, RoomId, Span};

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidTransition,
    Forbidden,
    Validation,
    TransientStore,
    PaymentVerification,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("room {room_id} is already booked on {date} for {span}: {count} conflicting booking(s)", count = .conflicts.len())]
    SlotConflict {
        room_id: RoomId,
        date: NaiveDate,
        span: Span,
        conflicts: Vec<ConflictInfo>,
    },

    #[error("{field} already in use: {value}")]
    Duplicate { field: &'static str, value: String },

    #[error("room {0} is referenced by bookings")]
    RoomInUse(RoomId),

    #[error("cannot {action} booking {id} in status {from}")]
    InvalidTransition {
        id: u64,
        from: BookingStatus,
        action: &'static str,
    },

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("store unavailable: {0}")]
    Transient(String),

    #[error("payment verification failed: {0}")]
    PaymentVerification(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::SlotConflict { .. }
            | EngineError::Duplicate { .. }
            | EngineError::RoomInUse(_) => ErrorKind::Conflict,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::Transient(_) => ErrorKind::TransientStore,
            EngineError::PaymentVerification(_) => ErrorKind::PaymentVerification,
        }
    }

    pub(crate) fn not_found(entity: &'static str, key: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
