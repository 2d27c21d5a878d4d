//! Reservation ledger: the record of active holds, keyed by token.
//!
//! Seat ownership is decided by the per-trip [`SeatMap`]; the ledger validates
//! requests, records which token owns which seats, and hands seats back when a
//! hold is cancelled or lapses.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info};

use crate::clock::{self, Clock};
use crate::config::LedgerConfig;
use crate::model::{Hold, HoldToken, SeatNumber, TripId};
use crate::services::TripCatalog;

use super::error::{HoldError, RequestError};
use super::seat_map::SeatMap;

#[derive(Debug, Default)]
struct HoldTable {
    active: HashMap<HoldToken, Hold>,
    /// Tokens reclaimed after expiry, with the time they were reclaimed.
    expired: HashMap<HoldToken, DateTime<Utc>>,
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Holds reclaimed by this sweep.
    pub reclaimed: usize,
    /// Seats returned to their trips.
    pub seats_freed: usize,
    /// Expired-token records dropped after their retention.
    pub forgotten: usize,
}

pub struct ReservationLedger {
    max_seats: usize,
    expired_retention: Duration,
    clock: Arc<dyn Clock>,
    catalog: Arc<dyn TripCatalog>,
    maps: RwLock<HashMap<TripId, Arc<SeatMap>>>,
    holds: Mutex<HoldTable>,
}

impl ReservationLedger {
    pub fn new(
        config: &LedgerConfig,
        clock: Arc<dyn Clock>,
        catalog: Arc<dyn TripCatalog>,
    ) -> Self {
        Self {
            max_seats: config.max_seats_per_hold,
            expired_retention: config.expired_retention(),
            clock,
            catalog,
            maps: RwLock::new(HashMap::new()),
            holds: Mutex::new(HoldTable::default()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Claim `seats` on `trip` for `ttl`.
    ///
    /// Of several concurrent requests sharing a seat exactly one succeeds; the
    /// others get a [`HoldError::Conflict`] naming the seats already taken.
    pub fn create_hold(
        &self,
        trip: TripId,
        seats: &[SeatNumber],
        ttl: Duration,
    ) -> Result<Hold, HoldError> {
        let seats = self.validate_shape(seats)?;
        let map = self.seat_map_or_create(trip)?;
        if let Some(&seat) = seats.last().filter(|&&s| s > map.capacity()) {
            return Err(RequestError::ExceedsCapacity {
                seat,
                capacity: map.capacity(),
            }
            .into());
        }

        let token = HoldToken::new();
        if let Err(conflict) = map.try_hold(token, &seats) {
            debug!(trip = %trip, seats = ?conflict.seats, "hold refused");
            return Err(conflict.into());
        }

        let created_at = self.clock.now();
        let hold = Hold {
            token,
            trip,
            seats,
            created_at,
            expires_at: clock::after(created_at, ttl),
        };
        self.table().active.insert(token, hold.clone());

        info!(
            trip = %trip,
            token = %token,
            seats = ?hold.seats,
            expires_at = %hold.expires_at,
            "hold granted"
        );
        Ok(hold)
    }

    pub fn get_hold(&self, token: HoldToken) -> Result<Hold, HoldError> {
        self.table()
            .active
            .get(&token)
            .cloned()
            .ok_or(HoldError::NotFound(token))
    }

    /// Drop a hold and free its seats. Unknown, consumed or expired tokens are a
    /// no-op. Returns whether a hold was dropped.
    pub fn cancel_hold(&self, token: HoldToken) -> bool {
        let Some(hold) = self.table().active.remove(&token) else {
            debug!(token = %token, "cancel of absent hold ignored");
            return false;
        };
        let freed = self.free_seats(&hold);
        info!(trip = %hold.trip, token = %token, freed, "hold cancelled");
        true
    }

    /// Consume a live hold, turning its seats from held to sold.
    ///
    /// The hold record is removed either way: an expired hold has its seats
    /// reclaimed and reports [`HoldError::Expired`].
    pub fn confirm_hold(&self, token: HoldToken) -> Result<Hold, HoldError> {
        let now = self.clock.now();
        let hold = {
            let mut table = self.table();
            let Some(hold) = table.active.remove(&token) else {
                return Err(if table.expired.contains_key(&token) {
                    HoldError::Expired(token)
                } else {
                    HoldError::NotFound(token)
                });
            };
            if hold.is_expired(now) {
                table.expired.insert(token, now);
                drop(table);
                let freed = self.free_seats(&hold);
                info!(trip = %hold.trip, token = %token, freed, "confirm of expired hold");
                return Err(HoldError::Expired(token));
            }
            hold
        };

        match self
            .seat_map(hold.trip)
            .map(|map| map.confirm(token, &hold.seats))
        {
            Some(Ok(())) => {
                info!(trip = %hold.trip, token = %token, seats = ?hold.seats, "hold confirmed");
                Ok(hold)
            }
            Some(Err(e)) => {
                error!(trip = %hold.trip, token = %token, reason = %e, "seat map out of step with ledger");
                self.free_seats(&hold);
                Err(HoldError::NotFound(token))
            }
            None => {
                error!(trip = %hold.trip, token = %token, "hold references a trip without seat map");
                Err(HoldError::NotFound(token))
            }
        }
    }

    /// Reclaim every hold expired at the current time and forget expired tokens
    /// older than the retention period.
    pub fn sweep_expired(&self) -> SweepReport {
        let now = self.clock.now();
        let retention_cutoff = TimeDelta::from_std(self.expired_retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let (lapsed, forgotten) = {
            let mut table = self.table();
            let tokens: Vec<HoldToken> = table
                .active
                .values()
                .filter(|hold| hold.is_expired(now))
                .map(|hold| hold.token)
                .collect();
            let lapsed: Vec<Hold> = tokens
                .iter()
                .filter_map(|token| table.active.remove(token))
                .collect();
            for hold in &lapsed {
                table.expired.insert(hold.token, now);
            }
            let before = table.expired.len();
            table.expired.retain(|_, at| *at > retention_cutoff);
            (lapsed, before - table.expired.len())
        };

        let mut report = SweepReport {
            reclaimed: lapsed.len(),
            forgotten,
            ..SweepReport::default()
        };
        for hold in &lapsed {
            let freed = self.free_seats(hold);
            report.seats_freed += freed;
            info!(trip = %hold.trip, token = %hold.token, freed, "hold expired");
        }
        report
    }

    /// Return sold seats of a cancelled booking to the trip.
    pub(crate) fn release_sold(
        &self,
        trip: TripId,
        token: HoldToken,
        seats: &BTreeSet<SeatNumber>,
    ) -> usize {
        self.seat_map(trip)
            .map_or(0, |map| map.release(token, seats))
    }

    /// Seat map of a trip, if any hold was ever made on it.
    pub fn seat_map(&self, trip: TripId) -> Option<Arc<SeatMap>> {
        self.maps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&trip)
            .cloned()
    }

    /// Seat map of a trip, created from the catalog capacity on first use.
    pub fn seat_map_or_create(&self, trip: TripId) -> Result<Arc<SeatMap>, RequestError> {
        if let Some(map) = self.seat_map(trip) {
            return Ok(map);
        }
        let capacity = self
            .catalog
            .capacity(trip)
            .ok_or(RequestError::UnknownTrip(trip))?;
        let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(
            maps.entry(trip)
                .or_insert_with(|| Arc::new(SeatMap::new(trip, capacity))),
        ))
    }

    pub fn active_holds(&self) -> usize {
        self.table().active.len()
    }

    /// Holds that were live at some point and lapsed, still remembered.
    pub fn remembered_expired(&self) -> usize {
        self.table().expired.len()
    }

    /// Checks that do not need the trip: count, positivity, uniqueness.
    fn validate_shape(&self, seats: &[SeatNumber]) -> Result<BTreeSet<SeatNumber>, RequestError> {
        if seats.is_empty() {
            return Err(RequestError::Empty);
        }
        if seats.len() > self.max_seats {
            return Err(RequestError::TooManySeats {
                requested: seats.len(),
                max: self.max_seats,
            });
        }
        if seats.contains(&0) {
            return Err(RequestError::NonPositiveSeat);
        }
        let mut unique = BTreeSet::new();
        for &seat in seats {
            if !unique.insert(seat) {
                return Err(RequestError::DuplicateSeat(seat));
            }
        }
        Ok(unique)
    }

    fn free_seats(&self, hold: &Hold) -> usize {
        self.release_sold(hold.trip, hold.token, &hold.seats)
    }

    fn table(&self) -> MutexGuard<'_, HoldTable> {
        self.holds.lock().unwrap_or_else(|e| e.into_inner())
    }
}
