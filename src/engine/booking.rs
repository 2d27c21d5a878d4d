//! Booking state machine.
//!
//! ```text
//! hold ──confirm──▶ PENDING/UNPAID ──pay──▶ CONFIRMED/PAID
//!                        │                       │
//!                        └──cancel──▶ CANCELLED ◀┘──▶ refund ──▶ REFUNDED
//! ```
//!
//! Seats are sold when the booking is created, so the only way back to a free
//! seat is cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::Amount;
use crate::model::{Booking, BookingId, BookingStatus, HoldToken, PaymentStatus, TripId};
use crate::services::{BookingEvent, Notifier, PaymentError, PaymentGateway, TripCatalog};

use super::error::{BookingAction, BookingError};
use super::ledger::ReservationLedger;

type BookingTable = Arc<Mutex<HashMap<BookingId, Booking>>>;

/// Result of a cancellation. `refund` is set when the booking had been paid; it
/// resolves once the payment provider answers and never affects the cancellation.
#[derive(Debug)]
pub struct Cancellation {
    pub booking: Booking,
    pub refund: Option<JoinHandle<Result<(), PaymentError>>>,
}

pub struct BookingMachine {
    ledger: Arc<ReservationLedger>,
    catalog: Arc<dyn TripCatalog>,
    payments: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    bookings: BookingTable,
}

impl BookingMachine {
    pub fn new(
        ledger: Arc<ReservationLedger>,
        catalog: Arc<dyn TripCatalog>,
        payments: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            ledger,
            catalog,
            payments,
            notifier,
            bookings: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consume a hold and record a pending, unpaid booking for its seats.
    ///
    /// An expired or unknown hold yields [`BookingError::HoldExpired`]; the caller
    /// has to start over with a new hold.
    pub fn create_from_hold(
        &self,
        token: HoldToken,
        payer: impl Into<String>,
    ) -> Result<Booking, BookingError> {
        let hold = self.ledger.confirm_hold(token).map_err(|e| {
            info!(token = %token, reason = %e, "booking refused");
            BookingError::HoldExpired(token)
        })?;

        // seats are sold from here on; give them back if the booking cannot be priced
        let total = match self.price(hold.trip, hold.seats.len()) {
            Ok(total) => total,
            Err(e) => {
                self.ledger.release_sold(hold.trip, token, &hold.seats);
                return Err(e);
            }
        };

        let booking = Booking {
            id: BookingId::new(),
            trip: hold.trip,
            token,
            payer: payer.into(),
            seats: hold.seats,
            total,
            status: BookingStatus::Pending,
            payment: PaymentStatus::Unpaid,
            created_at: self.ledger.now(),
        };
        self.table().insert(booking.id, booking.clone());

        info!(
            booking = %booking.id,
            trip = %booking.trip,
            seats = ?booking.seats,
            total = %booking.total,
            "booking created"
        );
        Ok(booking)
    }

    /// Charge the booking total and move `PENDING` to `CONFIRMED`/`PAID`.
    ///
    /// A failed charge leaves the booking pending. If the booking stopped being
    /// pending while the charge was in flight, the charge is refunded and the
    /// call fails with [`BookingError::InvalidTransition`].
    pub async fn mark_paid(&self, id: BookingId) -> Result<Booking, BookingError> {
        let amount = {
            let table = self.table();
            let booking = table.get(&id).ok_or(BookingError::NotFound(id))?;
            match booking.status {
                BookingStatus::Pending => booking.total,
                from @ (BookingStatus::Confirmed | BookingStatus::Cancelled) => {
                    return Err(BookingError::InvalidTransition {
                        id,
                        from,
                        action: BookingAction::Pay,
                    });
                }
            }
        };

        if let Err(e) = self.payments.charge(id, amount).await {
            warn!(booking = %id, amount = %amount, reason = %e, "charge failed");
            return Err(e.into());
        }

        let settled = {
            let mut table = self.table();
            let booking = table.get_mut(&id).ok_or(BookingError::NotFound(id))?;
            match booking.status {
                BookingStatus::Pending => {
                    booking.status = BookingStatus::Confirmed;
                    booking.payment = PaymentStatus::Paid;
                    Ok(booking.clone())
                }
                from @ (BookingStatus::Confirmed | BookingStatus::Cancelled) => Err(from),
            }
        };

        match settled {
            Ok(booking) => {
                info!(booking = %id, amount = %amount, "booking confirmed");
                self.notify(&booking);
                Ok(booking)
            }
            Err(from) => {
                warn!(booking = %id, status = %from, "booking changed during charge, refunding");
                if let Err(e) = self.payments.refund(id, amount).await {
                    error!(booking = %id, amount = %amount, reason = %e, "refund of stray charge failed");
                }
                Err(BookingError::InvalidTransition {
                    id,
                    from,
                    action: BookingAction::Pay,
                })
            }
        }
    }

    /// Cancel a pending or confirmed booking and return its seats.
    ///
    /// Paid bookings get a refund in the background; the booking stays
    /// cancelled whatever the refund outcome.
    pub async fn cancel(&self, id: BookingId, reason: &str) -> Result<Cancellation, BookingError> {
        let booking = {
            let mut table = self.table();
            let booking = table.get_mut(&id).ok_or(BookingError::NotFound(id))?;
            match booking.status {
                BookingStatus::Pending | BookingStatus::Confirmed => {
                    booking.status = BookingStatus::Cancelled;
                    booking.clone()
                }
                BookingStatus::Cancelled => {
                    return Err(BookingError::InvalidTransition {
                        id,
                        from: BookingStatus::Cancelled,
                        action: BookingAction::Cancel,
                    });
                }
            }
        };

        let freed = self
            .ledger
            .release_sold(booking.trip, booking.token, &booking.seats);
        info!(booking = %id, trip = %booking.trip, freed, reason, "booking cancelled");
        self.notify(&booking);

        let refund = match booking.payment {
            PaymentStatus::Paid => Some(self.spawn_refund(id, booking.total)),
            PaymentStatus::Unpaid | PaymentStatus::Refunded => None,
        };
        Ok(Cancellation { booking, refund })
    }

    pub fn get(&self, id: BookingId) -> Option<Booking> {
        self.table().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Booking> {
        self.table().values().cloned().collect()
    }

    fn spawn_refund(&self, id: BookingId, amount: Amount) -> JoinHandle<Result<(), PaymentError>> {
        let payments = Arc::clone(&self.payments);
        let bookings = Arc::clone(&self.bookings);
        tokio::spawn(async move {
            match payments.refund(id, amount).await {
                Ok(()) => {
                    if let Some(booking) = lock(&bookings).get_mut(&id) {
                        booking.payment = PaymentStatus::Refunded;
                    }
                    info!(booking = %id, amount = %amount, "refund settled");
                    Ok(())
                }
                Err(e) => {
                    error!(booking = %id, amount = %amount, reason = %e, "refund failed");
                    Err(e)
                }
            }
        })
    }

    fn price(&self, trip: TripId, seats: usize) -> Result<Amount, BookingError> {
        let fare = self
            .catalog
            .fare(trip)
            .ok_or(BookingError::UnknownTrip(trip))?;
        u32::try_from(seats)
            .ok()
            .and_then(|count| fare.checked_times(count))
            .ok_or(BookingError::TotalOverflow(trip))
    }

    fn notify(&self, booking: &Booking) {
        self.notifier.notify(BookingEvent {
            booking: booking.id,
            trip: booking.trip,
            seats: booking.seats.iter().copied().collect(),
            status: booking.status,
        });
    }

    fn table(&self) -> MutexGuard<'_, HashMap<BookingId, Booking>> {
        lock(&self.bookings)
    }
}

fn lock(bookings: &BookingTable) -> MutexGuard<'_, HashMap<BookingId, Booking>> {
    bookings.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LedgerConfig;
    use crate::model::{SeatStatus, Trip};
    use crate::services::{ChannelNotifier, InMemoryTrips};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::{Notify, mpsc};

    const TTL: Duration = Duration::from_secs(60);

    /// Gateway with scripted answers that records every call.
    #[derive(Default)]
    struct ScriptedGateway {
        decline_charges: bool,
        fail_refunds: bool,
        /// When set, charges wait for this signal before answering.
        charge_gate: Option<Arc<Notify>>,
        calls: Mutex<Vec<(&'static str, BookingId, Amount)>>,
    }

    impl ScriptedGateway {
        fn calls(&self) -> Vec<(&'static str, BookingId, Amount)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        async fn charge(&self, booking: BookingId, amount: Amount) -> Result<(), PaymentError> {
            self.calls.lock().unwrap().push(("charge", booking, amount));
            if let Some(gate) = &self.charge_gate {
                gate.notified().await;
            }
            if self.decline_charges {
                return Err(PaymentError::Declined("card expired".into()));
            }
            Ok(())
        }

        async fn refund(&self, booking: BookingId, amount: Amount) -> Result<(), PaymentError> {
            self.calls.lock().unwrap().push(("refund", booking, amount));
            if self.fail_refunds {
                return Err(PaymentError::Unavailable("timeout".into()));
            }
            Ok(())
        }
    }

    struct Fixture {
        machine: BookingMachine,
        ledger: Arc<ReservationLedger>,
        clock: Arc<ManualClock>,
        gateway: Arc<ScriptedGateway>,
        events: mpsc::Receiver<BookingEvent>,
    }

    const TRIP: TripId = 1;

    fn fixture(gateway: ScriptedGateway) -> Fixture {
        let catalog = Arc::new(InMemoryTrips::new());
        catalog.publish(Trip {
            id: TRIP,
            capacity: 10,
            fare: Amount::from_units(15),
        });
        let clock = Arc::new(ManualClock::default());
        let ledger = Arc::new(ReservationLedger::new(
            &LedgerConfig::default(),
            clock.clone(),
            catalog.clone(),
        ));
        let gateway = Arc::new(gateway);
        let (notifier, events) = ChannelNotifier::new(16);
        let machine = BookingMachine::new(
            Arc::clone(&ledger),
            catalog,
            gateway.clone(),
            Arc::new(notifier),
        );
        Fixture {
            machine,
            ledger,
            clock,
            gateway,
            events,
        }
    }

    fn status(f: &Fixture, seat: u32) -> Option<SeatStatus> {
        f.ledger.seat_map(TRIP).and_then(|m| m.status(seat))
    }

    fn book(f: &Fixture, seats: &[u32]) -> Booking {
        let hold = f.ledger.create_hold(TRIP, seats, TTL).unwrap();
        f.machine.create_from_hold(hold.token, "rider").unwrap()
    }

    // Creation

    #[test]
    fn booking_from_hold_is_pending_and_sells_seats() {
        let f = fixture(ScriptedGateway::default());
        let booking = book(&f, &[2, 3]);

        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.payment, PaymentStatus::Unpaid);
        assert_eq!(booking.total, Amount::from_units(30));
        assert_eq!(booking.payer, "rider");
        assert_eq!(status(&f, 2), Some(SeatStatus::Sold));
        assert_eq!(status(&f, 3), Some(SeatStatus::Sold));
        assert_eq!(f.machine.get(booking.id), Some(booking));
    }

    #[test]
    fn booking_from_expired_hold_fails() {
        let f = fixture(ScriptedGateway::default());
        let hold = f.ledger.create_hold(TRIP, &[1], TTL).unwrap();
        f.clock.advance(TTL);

        assert_eq!(
            f.machine.create_from_hold(hold.token, "rider"),
            Err(BookingError::HoldExpired(hold.token))
        );
        assert_eq!(status(&f, 1), Some(SeatStatus::Free));
        assert!(f.machine.all().is_empty());
    }

    #[test]
    fn booking_from_unknown_or_used_hold_fails() {
        let f = fixture(ScriptedGateway::default());
        let unknown = HoldToken::new();
        assert_eq!(
            f.machine.create_from_hold(unknown, "rider"),
            Err(BookingError::HoldExpired(unknown))
        );

        let hold = f.ledger.create_hold(TRIP, &[1], TTL).unwrap();
        f.machine.create_from_hold(hold.token, "rider").unwrap();
        assert_eq!(
            f.machine.create_from_hold(hold.token, "rider"),
            Err(BookingError::HoldExpired(hold.token))
        );
        assert_eq!(f.machine.all().len(), 1);
    }

    // Payment

    #[tokio::test]
    async fn pay_confirms_booking() {
        let mut f = fixture(ScriptedGateway::default());
        let booking = book(&f, &[1]);

        let paid = f.machine.mark_paid(booking.id).await.unwrap();
        assert_eq!(paid.status, BookingStatus::Confirmed);
        assert_eq!(paid.payment, PaymentStatus::Paid);
        assert_eq!(
            f.gateway.calls(),
            vec![("charge", booking.id, Amount::from_units(15))]
        );

        let event = f.events.recv().await.unwrap();
        assert_eq!(event.booking, booking.id);
        assert_eq!(event.status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn pay_twice_is_invalid() {
        let f = fixture(ScriptedGateway::default());
        let booking = book(&f, &[1]);
        f.machine.mark_paid(booking.id).await.unwrap();

        let err = f.machine.mark_paid(booking.id).await.unwrap_err();
        assert_eq!(
            err,
            BookingError::InvalidTransition {
                id: booking.id,
                from: BookingStatus::Confirmed,
                action: BookingAction::Pay,
            }
        );
        assert_eq!(f.gateway.calls().len(), 1);
    }

    #[tokio::test]
    async fn declined_charge_leaves_booking_pending() {
        let f = fixture(ScriptedGateway {
            decline_charges: true,
            ..ScriptedGateway::default()
        });
        let booking = book(&f, &[1]);

        let err = f.machine.mark_paid(booking.id).await.unwrap_err();
        assert!(matches!(err, BookingError::Payment(PaymentError::Declined(_))));

        let stored = f.machine.get(booking.id).unwrap();
        assert_eq!(stored.status, BookingStatus::Pending);
        assert_eq!(stored.payment, PaymentStatus::Unpaid);
    }

    #[tokio::test]
    async fn pay_unknown_booking() {
        let f = fixture(ScriptedGateway::default());
        let id = BookingId::new();
        assert_eq!(
            f.machine.mark_paid(id).await,
            Err(BookingError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn cancelled_during_charge_refunds_the_charge() {
        let gate = Arc::new(Notify::new());
        let f = Arc::new(fixture(ScriptedGateway {
            charge_gate: Some(gate.clone()),
            ..ScriptedGateway::default()
        }));
        let booking = book(&f, &[1]);

        let paying = {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f.machine.mark_paid(booking.id).await })
        };
        // let the charge start before cancelling
        while f.gateway.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        let cancellation = f.machine.cancel(booking.id, "rider left").await.unwrap();
        assert!(cancellation.refund.is_none());
        gate.notify_one();

        let err = paying.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            BookingError::InvalidTransition {
                id: booking.id,
                from: BookingStatus::Cancelled,
                action: BookingAction::Pay,
            }
        );
        let calls: Vec<_> = f.gateway.calls().into_iter().map(|(kind, ..)| kind).collect();
        assert_eq!(calls, vec!["charge", "refund"]);
        assert_eq!(
            f.machine.get(booking.id).unwrap().status,
            BookingStatus::Cancelled
        );
    }

    // Cancellation

    #[tokio::test]
    async fn cancel_pending_frees_seats_without_refund() {
        let mut f = fixture(ScriptedGateway::default());
        let booking = book(&f, &[4, 5]);

        let cancellation = f.machine.cancel(booking.id, "changed plans").await.unwrap();
        assert_eq!(cancellation.booking.status, BookingStatus::Cancelled);
        assert!(cancellation.refund.is_none());
        assert_eq!(status(&f, 4), Some(SeatStatus::Free));
        assert_eq!(status(&f, 5), Some(SeatStatus::Free));

        let event = f.events.recv().await.unwrap();
        assert_eq!(event.status, BookingStatus::Cancelled);
        assert_eq!(event.seats, vec![4, 5]);
    }

    #[tokio::test]
    async fn cancel_paid_booking_refunds() {
        let f = fixture(ScriptedGateway::default());
        let booking = book(&f, &[1]);
        f.machine.mark_paid(booking.id).await.unwrap();

        let cancellation = f.machine.cancel(booking.id, "refund").await.unwrap();
        assert_eq!(cancellation.booking.payment, PaymentStatus::Paid);
        let refund = cancellation.refund.unwrap();
        assert_eq!(refund.await.unwrap(), Ok(()));

        let stored = f.machine.get(booking.id).unwrap();
        assert_eq!(stored.status, BookingStatus::Cancelled);
        assert_eq!(stored.payment, PaymentStatus::Refunded);
        assert_eq!(status(&f, 1), Some(SeatStatus::Free));
    }

    #[tokio::test]
    async fn failed_refund_keeps_booking_cancelled() {
        let f = fixture(ScriptedGateway {
            fail_refunds: true,
            ..ScriptedGateway::default()
        });
        let booking = book(&f, &[1]);
        f.machine.mark_paid(booking.id).await.unwrap();

        let cancellation = f.machine.cancel(booking.id, "refund").await.unwrap();
        let result = cancellation.refund.unwrap().await.unwrap();
        assert!(matches!(result, Err(PaymentError::Unavailable(_))));

        let stored = f.machine.get(booking.id).unwrap();
        assert_eq!(stored.status, BookingStatus::Cancelled);
        assert_eq!(stored.payment, PaymentStatus::Paid);
        // seats are not resurrected by the failed refund
        assert_eq!(status(&f, 1), Some(SeatStatus::Free));
    }

    #[tokio::test]
    async fn cancel_twice_is_invalid() {
        let f = fixture(ScriptedGateway::default());
        let booking = book(&f, &[1]);
        f.machine.cancel(booking.id, "first").await.unwrap();

        let err = f.machine.cancel(booking.id, "second").await.unwrap_err();
        assert_eq!(
            err,
            BookingError::InvalidTransition {
                id: booking.id,
                from: BookingStatus::Cancelled,
                action: BookingAction::Cancel,
            }
        );
    }

    #[tokio::test]
    async fn pay_after_cancel_is_invalid() {
        let f = fixture(ScriptedGateway::default());
        let booking = book(&f, &[1]);
        f.machine.cancel(booking.id, "gone").await.unwrap();

        let err = f.machine.mark_paid(booking.id).await.unwrap_err();
        assert!(matches!(
            err,
            BookingError::InvalidTransition {
                from: BookingStatus::Cancelled,
                ..
            }
        ));
        assert!(f.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn cancelled_seats_can_be_sold_again() {
        let f = fixture(ScriptedGateway::default());
        let first = book(&f, &[7]);
        f.machine.cancel(first.id, "resell").await.unwrap();

        let second = book(&f, &[7]);
        assert_ne!(first.token, second.token);
        assert_eq!(status(&f, 7), Some(SeatStatus::Sold));

        // the old booking cannot free the new owner's seat
        assert_eq!(
            f.ledger.release_sold(TRIP, first.token, &first.seats),
            0
        );
        assert_eq!(status(&f, 7), Some(SeatStatus::Sold));
    }
}
