use std::str::FromStr;

use crate::model::{BookingStatus, Room, UnknownVariant};

/// Which statuses a visitor may cancel from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancellationPolicy {
    /// Only bookings still awaiting approval.
    Strict,
    /// Pending and approved bookings.
    #[default]
    Lenient,
}

impl FromStr for CancellationPolicy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(CancellationPolicy::Strict),
            "lenient" => Ok(CancellationPolicy::Lenient),
            _ => Err(UnknownVariant {
                kind: "cancellation policy",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Approve,
    Reject,
    Cancel,
    Reschedule,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Cancel => "cancel",
            Action::Reschedule => "update",
        }
    }
}

/// Status a new booking enters. Rooms without approval go straight to `Approved`.
pub fn initial_status(room: &Room) -> BookingStatus {
    if room.requires_approval {
        BookingStatus::PendingApproval
    } else {
        BookingStatus::Approved
    }
}

/// The transition table. `None` means the action is not allowed from `current`.
/// `current` must already be the effective status.
pub fn next_status(
    current: BookingStatus,
    action: Action,
    policy: CancellationPolicy,
) -> Option<BookingStatus> {
    use BookingStatus::*;
    match (action, current) {
        (Action::Approve, PendingApproval) => Some(Approved),
        (Action::Reject, PendingApproval) => Some(Rejected),
        (Action::Cancel, PendingApproval) => Some(Cancelled),
        (Action::Cancel, Approved) if policy == CancellationPolicy::Lenient => Some(Cancelled),
        (Action::Reschedule, PendingApproval) => Some(PendingApproval),
        (Action::Reschedule, Approved) => Some(Approved),
        _ => None,
    }
}
