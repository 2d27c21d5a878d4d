//! Core domain types for the seat ledger.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::Amount;

/// Trip identifier, assigned by the scheduling subsystem.
pub type TripId = u32;

/// 1-based seat number within a trip.
pub type SeatNumber = u32;

/// Opaque token identifying a seat hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HoldToken(Uuid);

impl HoldToken {
    pub fn new() -> Self {
        HoldToken(Uuid::new_v4())
    }
}

impl Default for HoldToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HoldToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Booking identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BookingId(Uuid);

impl BookingId {
    pub fn new() -> Self {
        BookingId(Uuid::new_v4())
    }
}

impl Default for BookingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A published trip as seen by the ledger. Read-only from the ledger's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trip {
    pub id: TripId,
    pub capacity: u32,
    pub fare: Amount,
}

/// Externally visible state of a single seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeatStatus {
    Free,
    Held,
    Sold,
}

/// A time-boxed claim on specific seats, pending payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    pub token: HoldToken,
    pub trip: TripId,
    /// Ordered, duplicate-free seat numbers.
    pub seats: BTreeSet<SeatNumber>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Hold {
    /// A hold is expired from its expiry instant onwards, so a zero TTL hold is
    /// reclaimable the moment it is created.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    /// Seats sold, awaiting payment settlement.
    Pending,
    /// Payment settled.
    Confirmed,
    /// Terminal; seats were returned to the trip.
    Cancelled,
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Refunded,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PaymentStatus::Unpaid => "UNPAID",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Refunded => "REFUNDED",
        })
    }
}

/// A durable sale of seats on a trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: BookingId,
    pub trip: TripId,
    /// Hold the seats were sold under; seat-map entries stay owned by it.
    pub token: HoldToken,
    pub payer: String,
    pub seats: BTreeSet<SeatNumber>,
    pub total: Amount,
    pub status: BookingStatus,
    pub payment: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

/// A replayable command, the input of [`Replay::run`](crate::Replay::run).
///
/// `reference` is a caller-chosen label that ties a hold to the booking made from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Publish a trip to the catalog.
    Trip {
        at: u64,
        trip: TripId,
        capacity: u32,
        fare: Amount,
    },
    /// Request a seat hold.
    Hold {
        at: u64,
        trip: TripId,
        seats: Vec<SeatNumber>,
        reference: String,
    },
    /// Turn the referenced hold into a booking.
    Book { at: u64, reference: String },
    /// Settle payment for the referenced booking.
    Pay { at: u64, reference: String },
    /// Cancel the referenced booking.
    Cancel { at: u64, reference: String },
    /// Drop the referenced hold.
    Release { at: u64, reference: String },
}

impl Command {
    /// Seconds since the start of the replay at which the command applies.
    pub fn at(&self) -> u64 {
        match self {
            Command::Trip { at, .. }
            | Command::Hold { at, .. }
            | Command::Book { at, .. }
            | Command::Pay { at, .. }
            | Command::Cancel { at, .. }
            | Command::Release { at, .. } => *at,
        }
    }
}
