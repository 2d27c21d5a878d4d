//! Collaborators the ledger talks to but does not own: the trip catalog,
//! the payment provider and the notification channel.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::Amount;
use crate::model::{BookingId, BookingStatus, SeatNumber, Trip, TripId};

/// Read-only view of published trips.
pub trait TripCatalog: Send + Sync {
    fn trip(&self, id: TripId) -> Option<Trip>;

    fn capacity(&self, id: TripId) -> Option<u32> {
        self.trip(id).map(|t| t.capacity)
    }

    fn fare(&self, id: TripId) -> Option<Amount> {
        self.trip(id).map(|t| t.fare)
    }
}

/// Catalog kept in memory, fed by whoever publishes trips.
#[derive(Debug, Default)]
pub struct InMemoryTrips {
    trips: RwLock<HashMap<TripId, Trip>>,
}

impl InMemoryTrips {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a trip. Returns `false` if the id is already taken; published trips are immutable.
    pub fn publish(&self, trip: Trip) -> bool {
        let mut trips = self.trips.write().unwrap_or_else(|e| e.into_inner());
        if trips.contains_key(&trip.id) {
            return false;
        }
        trips.insert(trip.id, trip);
        true
    }
}

impl TripCatalog for InMemoryTrips {
    fn trip(&self, id: TripId) -> Option<Trip> {
        self.trips
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("payment provider unavailable: {0}")]
    Unavailable(String),
}

/// Remote payment provider. Calls are fallible and may be slow; retries are the
/// provider client's business.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, booking: BookingId, amount: Amount) -> Result<(), PaymentError>;

    async fn refund(&self, booking: BookingId, amount: Amount) -> Result<(), PaymentError>;
}

/// Gateway that approves every request. Stands in for a real provider during replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovingGateway;

#[async_trait]
impl PaymentGateway for ApprovingGateway {
    async fn charge(&self, booking: BookingId, amount: Amount) -> Result<(), PaymentError> {
        info!(booking = %booking, amount = %amount, "charge approved");
        Ok(())
    }

    async fn refund(&self, booking: BookingId, amount: Amount) -> Result<(), PaymentError> {
        info!(booking = %booking, amount = %amount, "refund approved");
        Ok(())
    }
}

/// Booking lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingEvent {
    pub booking: BookingId,
    pub trip: TripId,
    pub seats: Vec<SeatNumber>,
    pub status: BookingStatus,
}

/// Fire-and-forget notification sink. Implementations must not block and must
/// swallow their own failures.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: BookingEvent);
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: BookingEvent) {
        info!(
            booking = %event.booking,
            trip = %event.trip,
            seats = ?event.seats,
            status = %event.status,
            "booking notification"
        );
    }
}

/// Notifier forwarding events into a bounded channel for a delivery worker.
/// A full or closed channel drops the event.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::Sender<BookingEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BookingEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: BookingEvent) {
        let booking = event.booking;
        if let Err(e) = self.sender.try_send(event) {
            warn!(booking = %booking, reason = %e, "notification dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip(id: TripId) -> Trip {
        Trip {
            id,
            capacity: 40,
            fare: Amount::from_units(25),
        }
    }

    fn event(status: BookingStatus) -> BookingEvent {
        BookingEvent {
            booking: BookingId::new(),
            trip: 1,
            seats: vec![1],
            status,
        }
    }

    #[test]
    fn catalog_lookup() {
        let trips = InMemoryTrips::new();
        assert!(trips.publish(trip(1)));

        assert_eq!(trips.capacity(1), Some(40));
        assert_eq!(trips.fare(1), Some(Amount::from_units(25)));
        assert_eq!(trips.capacity(2), None);
    }

    #[test]
    fn published_trip_is_immutable() {
        let trips = InMemoryTrips::new();
        assert!(trips.publish(trip(1)));
        assert!(!trips.publish(Trip {
            capacity: 2,
            ..trip(1)
        }));
        assert_eq!(trips.capacity(1), Some(40));
    }

    #[tokio::test]
    async fn approving_gateway_approves() {
        let gateway = ApprovingGateway;
        let id = BookingId::new();
        assert_eq!(gateway.charge(id, Amount::from_units(1)).await, Ok(()));
        assert_eq!(gateway.refund(id, Amount::from_units(1)).await, Ok(()));
    }

    #[tokio::test]
    async fn channel_notifier_forwards() {
        let (notifier, mut rx) = ChannelNotifier::new(4);
        let sent = event(BookingStatus::Confirmed);
        notifier.notify(sent.clone());
        assert_eq!(rx.recv().await, Some(sent));
    }

    #[test]
    fn channel_notifier_drops_when_full_or_closed() {
        let (notifier, rx) = ChannelNotifier::new(1);
        notifier.notify(event(BookingStatus::Confirmed));
        // full: does not block or panic
        notifier.notify(event(BookingStatus::Cancelled));
        drop(rx);
        notifier.notify(event(BookingStatus::Cancelled));
    }
}
