//! Per-trip seat state table.
//!
//! Every seat sits behind its own lock. Multi-seat transitions lock the seats they
//! touch in ascending seat order, check, then apply, so two requests only contend
//! when their seat sets overlap and the overlap is decided by whoever locks the
//! lowest shared seat first.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use crate::model::{HoldToken, SeatNumber, SeatStatus, TripId};

use super::error::{SeatConflict, SeatTransitionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeatState {
    Free,
    Held(HoldToken),
    Sold(HoldToken),
}

impl SeatState {
    fn status(self) -> SeatStatus {
        match self {
            SeatState::Free => SeatStatus::Free,
            SeatState::Held(_) => SeatStatus::Held,
            SeatState::Sold(_) => SeatStatus::Sold,
        }
    }
}

/// Number of seats in each state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeatCounts {
    pub free: u32,
    pub held: u32,
    pub sold: u32,
}

impl SeatCounts {
    pub fn total(&self) -> u32 {
        self.free + self.held + self.sold
    }
}

/// Seat states of one trip. Mutated only by the reservation ledger.
#[derive(Debug)]
pub struct SeatMap {
    trip: TripId,
    seats: Box<[Mutex<SeatState>]>,
}

impl SeatMap {
    pub fn new(trip: TripId, capacity: u32) -> Self {
        Self {
            trip,
            seats: (0..capacity).map(|_| Mutex::new(SeatState::Free)).collect(),
        }
    }

    pub fn trip(&self) -> TripId {
        self.trip
    }

    pub fn capacity(&self) -> u32 {
        self.seats.len() as u32
    }

    /// State of one seat, `None` if the seat does not exist.
    pub fn status(&self, seat: SeatNumber) -> Option<SeatStatus> {
        self.slot(seat).map(|slot| lock(slot).status())
    }

    /// Seat states indexed by `seat - 1`. Each entry is read under its own lock;
    /// the vector as a whole is not a single atomic snapshot.
    pub fn snapshot(&self) -> Vec<SeatStatus> {
        self.seats.iter().map(|slot| lock(slot).status()).collect()
    }

    pub fn counts(&self) -> SeatCounts {
        self.snapshot()
            .into_iter()
            .fold(SeatCounts::default(), |mut counts, status| {
                match status {
                    SeatStatus::Free => counts.free += 1,
                    SeatStatus::Held => counts.held += 1,
                    SeatStatus::Sold => counts.sold += 1,
                }
                counts
            })
    }

    /// Flip all `seats` from free to held by `token`, or none of them.
    ///
    /// Fails listing every requested seat that is not free. Seats outside the map
    /// count as conflicts.
    pub(crate) fn try_hold(
        &self,
        token: HoldToken,
        seats: &BTreeSet<SeatNumber>,
    ) -> Result<(), SeatConflict> {
        let (mut guards, missing) = self.lock_all(seats);

        let mut taken: Vec<SeatNumber> = guards
            .iter()
            .filter(|(_, state)| **state != SeatState::Free)
            .map(|(seat, _)| *seat)
            .collect();
        if !taken.is_empty() || !missing.is_empty() {
            taken.extend(missing);
            taken.sort_unstable();
            return Err(SeatConflict {
                trip: self.trip,
                seats: taken,
            });
        }

        for (_, state) in guards.iter_mut() {
            **state = SeatState::Held(token);
        }
        Ok(())
    }

    /// Turn seats held by `token` into sold seats. All-or-nothing.
    pub(crate) fn confirm(
        &self,
        token: HoldToken,
        seats: &BTreeSet<SeatNumber>,
    ) -> Result<(), SeatTransitionError> {
        let (mut guards, missing) = self.lock_all(seats);

        if let Some(&seat) = missing.first() {
            return Err(SeatTransitionError {
                seat,
                token,
                found: SeatStatus::Free,
            });
        }
        if let Some((seat, state)) = guards
            .iter()
            .find(|(_, state)| **state != SeatState::Held(token))
        {
            return Err(SeatTransitionError {
                seat: *seat,
                token,
                found: state.status(),
            });
        }

        for (_, state) in guards.iter_mut() {
            **state = SeatState::Sold(token);
        }
        Ok(())
    }

    /// Free every seat in `seats` that is held or sold by `token`. Seats owned by
    /// anyone else are left alone. Returns the number of seats freed.
    pub(crate) fn release(&self, token: HoldToken, seats: &BTreeSet<SeatNumber>) -> usize {
        let (mut guards, _) = self.lock_all(seats);
        let mut freed = 0;
        for (_, state) in guards.iter_mut() {
            if matches!(**state, SeatState::Held(t) | SeatState::Sold(t) if t == token) {
                **state = SeatState::Free;
                freed += 1;
            }
        }
        freed
    }

    fn slot(&self, seat: SeatNumber) -> Option<&Mutex<SeatState>> {
        let index = usize::try_from(seat.checked_sub(1)?).ok()?;
        self.seats.get(index)
    }

    /// Lock existing seats in ascending order. Returns the guards and the seats
    /// that do not exist on this trip.
    fn lock_all(
        &self,
        seats: &BTreeSet<SeatNumber>,
    ) -> (Vec<(SeatNumber, MutexGuard<'_, SeatState>)>, Vec<SeatNumber>) {
        let mut guards = Vec::with_capacity(seats.len());
        let mut missing = Vec::new();
        // BTreeSet iterates in ascending order, which fixes the lock order
        for &seat in seats {
            match self.slot(seat) {
                Some(slot) => guards.push((seat, lock(slot))),
                None => missing.push(seat),
            }
        }
        (guards, missing)
    }
}

// Critical sections never leave a seat half-updated, so a poisoned lock still
// guards a valid state.
fn lock(slot: &Mutex<SeatState>) -> MutexGuard<'_, SeatState> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}
