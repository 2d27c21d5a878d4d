pub mod amount;
pub mod clock;
pub mod config;
pub mod csv;
pub mod engine;
pub mod model;
pub mod services;

pub use amount::Amount;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LedgerConfig;
pub use engine::{Collaborators, Engine, Replay};
pub use model::{
    Booking, BookingId, BookingStatus, Command, Hold, HoldToken, PaymentStatus, SeatNumber,
    SeatStatus, Trip, TripId,
};
