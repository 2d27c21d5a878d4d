//! Seat reservation engine.
//!
//! The engine ties the per-trip seat maps, the reservation ledger, the booking
//! state machine and the expiry sweeper into one service context. Everything it
//! needs (configuration, clock, trip catalog, payment provider, notifier) is
//! handed in at construction.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::model::{Booking, BookingId, Hold, HoldToken, SeatNumber, TripId};
use crate::services::{Notifier, PaymentGateway, TripCatalog};

mod booking;
pub use booking::{BookingMachine, Cancellation};

mod error;
pub use error::{
    BookingAction, BookingError, EngineError, HoldError, RequestError, SeatConflict,
    SeatTransitionError,
};

mod ledger;
pub use ledger::{ReservationLedger, SweepReport};

mod replay;
pub use replay::Replay;

mod seat_map;
pub use seat_map::{SeatCounts, SeatMap};

mod sweeper;
pub use sweeper::{ExpirySweeper, SweeperHandle};

/// External services the engine calls out to.
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub catalog: Arc<dyn TripCatalog>,
    pub payments: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct Engine {
    config: LedgerConfig,
    ledger: Arc<ReservationLedger>,
    bookings: BookingMachine,
}

/// Public API
impl Engine {
    pub fn new(config: LedgerConfig, services: Collaborators) -> Self {
        let ledger = Arc::new(ReservationLedger::new(
            &config,
            services.clock,
            Arc::clone(&services.catalog),
        ));
        let bookings = BookingMachine::new(
            Arc::clone(&ledger),
            services.catalog,
            services.payments,
            services.notifier,
        );
        Self {
            config,
            ledger,
            bookings,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<ReservationLedger> {
        &self.ledger
    }

    pub fn bookings(&self) -> &BookingMachine {
        &self.bookings
    }

    /// Hold seats for the configured TTL.
    pub fn hold(&self, trip: TripId, seats: &[SeatNumber]) -> Result<Hold, HoldError> {
        self.hold_for(trip, seats, self.config.hold_ttl())
    }

    pub fn hold_for(
        &self,
        trip: TripId,
        seats: &[SeatNumber],
        ttl: Duration,
    ) -> Result<Hold, HoldError> {
        self.ledger.create_hold(trip, seats, ttl)
    }

    pub fn release(&self, token: HoldToken) -> bool {
        self.ledger.cancel_hold(token)
    }

    pub fn book(&self, token: HoldToken, payer: impl Into<String>) -> Result<Booking, BookingError> {
        self.bookings.create_from_hold(token, payer)
    }

    pub async fn pay(&self, id: BookingId) -> Result<Booking, BookingError> {
        self.bookings.mark_paid(id).await
    }

    pub async fn cancel(&self, id: BookingId, reason: &str) -> Result<Cancellation, BookingError> {
        self.bookings.cancel(id, reason).await
    }

    /// Seat counts for a published trip.
    pub fn availability(&self, trip: TripId) -> Result<SeatCounts, RequestError> {
        Ok(self.ledger.seat_map_or_create(trip)?.counts())
    }

    /// Start the expiry sweeper at the configured interval.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        ExpirySweeper::spawn(Arc::clone(&self.ledger), self.config.sweep_interval())
    }
}
