//! Deterministic replay of recorded commands against an [`Engine`].
//!
//! Replay runs on a [`ManualClock`] positioned at each command's offset, and
//! sweeps expired holds before every command instead of running the background
//! sweeper. Holds and bookings are addressed by caller-chosen references.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info, warn};

use crate::clock::{self, ManualClock};
use crate::config::LedgerConfig;
use crate::model::{Booking, BookingId, Command, HoldToken, Trip};
use crate::services::{ApprovingGateway, InMemoryTrips, LogNotifier, Notifier, PaymentGateway};

use super::{Collaborators, Engine, EngineError};

pub struct Replay {
    engine: Engine,
    clock: Arc<ManualClock>,
    trips: Arc<InMemoryTrips>,
    start: DateTime<Utc>,
    holds: HashMap<String, HoldToken>,
    bookings: HashMap<String, BookingId>,
}

impl Replay {
    /// Replay against an approving payment gateway and a logging notifier.
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_services(config, Arc::new(ApprovingGateway), Arc::new(LogNotifier))
    }

    pub fn with_services(
        config: LedgerConfig,
        payments: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let trips = Arc::new(InMemoryTrips::new());
        let engine = Engine::new(
            config,
            Collaborators {
                clock: clock.clone(),
                catalog: trips.clone(),
                payments,
                notifier,
            },
        );
        Self {
            engine,
            clock,
            trips,
            start,
            holds: HashMap::new(),
            bookings: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Apply every command of the stream; refused commands are logged and skipped.
    pub async fn run(&mut self, mut stream: impl Stream<Item = Command> + Unpin) {
        while let Some(command) = stream.next().await {
            // a refused command must not stop the replay
            let _ = self.apply(command).await;
        }
    }

    /// Bookings with their references, ordered by reference.
    pub fn bookings(&self) -> Vec<(String, Booking)> {
        let mut rows: Vec<_> = self
            .bookings
            .iter()
            .filter_map(|(reference, id)| {
                self.engine
                    .bookings()
                    .get(*id)
                    .map(|booking| (reference.clone(), booking))
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    pub async fn apply(&mut self, command: Command) -> Result<(), EngineError> {
        self.advance_to(command.at());
        self.engine.ledger().sweep_expired();

        let kind = kind(&command);
        let at = command.at();
        let result = self.dispatch(command).await;
        match &result {
            Ok(()) => info!(at, "{kind} applied"),
            Err(e) => warn!(at, reason = %e, "{kind} skipped"),
        }
        result
    }

    async fn dispatch(&mut self, command: Command) -> Result<(), EngineError> {
        match command {
            Command::Trip {
                trip,
                capacity,
                fare,
                ..
            } => {
                let published = self.trips.publish(Trip {
                    id: trip,
                    capacity,
                    fare,
                });
                if !published {
                    return Err(EngineError::TripExists(trip));
                }
            }
            Command::Hold {
                trip,
                seats,
                reference,
                ..
            } => {
                if self.holds.contains_key(&reference) {
                    return Err(EngineError::DuplicateReference(reference));
                }
                let hold = self.engine.hold(trip, &seats)?;
                self.holds.insert(reference, hold.token);
            }
            Command::Book { reference, .. } => {
                let token = self.hold_token(&reference)?;
                if self.bookings.contains_key(&reference) {
                    return Err(EngineError::DuplicateReference(reference));
                }
                let booking = self.engine.book(token, reference.clone())?;
                self.bookings.insert(reference, booking.id);
            }
            Command::Pay { reference, .. } => {
                let id = self.booking_id(&reference)?;
                self.engine.pay(id).await?;
            }
            Command::Cancel { reference, .. } => {
                let id = self.booking_id(&reference)?;
                let cancellation = self.engine.cancel(id, "replayed cancellation").await?;
                // wait for the refund so the replay output is deterministic
                if let Some(refund) = cancellation.refund {
                    match refund.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(reference = %reference, reason = %e, "refund failed"),
                        Err(e) => error!(reference = %reference, reason = %e, "refund task failed"),
                    }
                }
            }
            Command::Release { reference, .. } => {
                let token = self.hold_token(&reference)?;
                self.engine.release(token);
            }
        }
        Ok(())
    }

    /// Move the clock to `at` seconds after the start. The clock never runs backwards.
    fn advance_to(&self, at: u64) {
        let target = clock::after(self.start, Duration::from_secs(at));
        let now = self.engine.ledger().now();
        if target > now {
            self.clock.set(target);
        } else if target < now {
            warn!(at, "command out of order, keeping current time");
        }
    }

    fn hold_token(&self, reference: &str) -> Result<HoldToken, EngineError> {
        self.holds
            .get(reference)
            .copied()
            .ok_or_else(|| EngineError::UnknownReference(reference.to_string()))
    }

    fn booking_id(&self, reference: &str) -> Result<BookingId, EngineError> {
        self.bookings
            .get(reference)
            .copied()
            .ok_or_else(|| EngineError::UnknownReference(reference.to_string()))
    }
}

fn kind(command: &Command) -> &'static str {
    match command {
        Command::Trip { .. } => "trip",
        Command::Hold { .. } => "hold",
        Command::Book { .. } => "book",
        Command::Pay { .. } => "pay",
        Command::Cancel { .. } => "cancel",
        Command::Release { .. } => "release",
    }
}
