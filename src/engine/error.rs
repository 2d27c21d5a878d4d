//! Error types for seat reservation and booking.

use thiserror::Error;

use crate::model::{BookingId, BookingStatus, HoldToken, SeatNumber, SeatStatus, TripId};
use crate::services::PaymentError;

/// Top-level error returned when replaying a [`Command`](crate::Command).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("hold failed: {0}")]
    Hold(#[from] HoldError),

    #[error("booking failed: {0}")]
    Booking(#[from] BookingError),

    #[error("trip {0} is already published")]
    TripExists(TripId),

    #[error("unknown reference '{0}'")]
    UnknownReference(String),

    #[error("reference '{0}' is already in use")]
    DuplicateReference(String),
}

/// Malformed hold request. Rejected before any seat state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("no seats requested")]
    Empty,
    #[error("{requested} seats requested, at most {max} allowed")]
    TooManySeats { requested: usize, max: usize },
    #[error("seat {0} requested more than once")]
    DuplicateSeat(SeatNumber),
    #[error("seat numbers must be positive")]
    NonPositiveSeat,
    #[error("seat {seat} exceeds trip capacity {capacity}")]
    ExceedsCapacity { seat: SeatNumber, capacity: u32 },
    #[error("unknown trip {0}")]
    UnknownTrip(TripId),
}

/// Some of the requested seats are already held or sold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("trip {trip}: seats {seats:?} are taken")]
pub struct SeatConflict {
    pub trip: TripId,
    /// Conflicting seats, ascending.
    pub seats: Vec<SeatNumber>,
}

/// A seat was not in the state a transition requires.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("seat {seat} is {found:?}, not owned by hold {token}")]
pub struct SeatTransitionError {
    pub seat: SeatNumber,
    pub token: HoldToken,
    pub found: SeatStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HoldError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error(transparent)]
    Conflict(#[from] SeatConflict),
    #[error("hold {0} not found")]
    NotFound(HoldToken),
    #[error("hold {0} expired")]
    Expired(HoldToken),
}

/// The action a booking transition was attempted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingAction {
    Pay,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookingError {
    #[error("hold {0} expired or unknown, restart the reservation")]
    HoldExpired(HoldToken),

    #[error("booking {0} not found")]
    NotFound(BookingId),

    #[error("{action:?}: booking {id} is {from}")]
    InvalidTransition {
        id: BookingId,
        from: BookingStatus,
        action: BookingAction,
    },

    #[error("unknown trip {0}")]
    UnknownTrip(TripId),

    #[error("booking total overflows for trip {0}")]
    TotalOverflow(TripId),

    #[error(transparent)]
    Payment(#[from] PaymentError),
}
