use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::amount::AmountParseError;
use crate::{Amount, Booking, BookingStatus, Command, PaymentStatus, SeatNumber, TripId};

/// Errors that can occur when parsing csv rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open csv file: {0}")]
    Open(csv::Error),

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized command type '{kind}'")]
    UnrecognizedType { line: usize, kind: String },

    #[error("line {line}: {kind} missing {field}")]
    MissingField {
        line: usize,
        kind: String,
        field: &'static str,
    },

    #[error("line {line}: invalid seat list '{seats}'")]
    InvalidSeats { line: usize, seats: String },

    #[error("line {line}: invalid fare: {source}")]
    InvalidFare {
        line: usize,
        source: AmountParseError,
    },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    at: u64,
    trip: Option<TripId>,
    capacity: Option<u32>,
    fare: Option<String>,
    seats: Option<String>,
    #[serde(rename = "ref")]
    reference: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    #[serde(rename = "ref")]
    reference: String,
    trip: TripId,
    seats: String,
    total: String,
    status: BookingStatus,
    payment: PaymentStatus,
}

/// Read commands from a csv file with header `type,at,trip,capacity,fare,seats,ref`
pub fn read_commands(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, CsvError>>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(CsvError::Open)?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_row(line, row)
        }))
}

fn parse_row(line: usize, row: InputRow) -> Result<Command, CsvError> {
    let kind = row.r#type.to_ascii_lowercase();
    let missing = |field: &'static str| CsvError::MissingField {
        line,
        kind: kind.clone(),
        field,
    };
    let at = row.at;

    match kind.as_str() {
        "trip" => {
            let trip = row.trip.ok_or_else(|| missing("trip"))?;
            let capacity = row.capacity.ok_or_else(|| missing("capacity"))?;
            let fare = row
                .fare
                .ok_or_else(|| missing("fare"))?
                .parse::<Amount>()
                .map_err(|source| CsvError::InvalidFare { line, source })?;
            Ok(Command::Trip {
                at,
                trip,
                capacity,
                fare,
            })
        }
        "hold" => {
            let trip = row.trip.ok_or_else(|| missing("trip"))?;
            let raw = row.seats.ok_or_else(|| missing("seats"))?;
            let seats = parse_seats(&raw).ok_or(CsvError::InvalidSeats { line, seats: raw })?;
            let reference = row.reference.ok_or_else(|| missing("ref"))?;
            Ok(Command::Hold {
                at,
                trip,
                seats,
                reference,
            })
        }
        "book" | "pay" | "cancel" | "release" => {
            let reference = row.reference.ok_or_else(|| missing("ref"))?;
            Ok(match kind.as_str() {
                "book" => Command::Book { at, reference },
                "pay" => Command::Pay { at, reference },
                "cancel" => Command::Cancel { at, reference },
                _ => Command::Release { at, reference },
            })
        }
        _ => Err(CsvError::UnrecognizedType {
            line,
            kind: row.r#type,
        }),
    }
}

/// Space separated seat numbers, e.g. `"1 2 3"`. Validation beyond parsing is
/// left to the ledger.
fn parse_seats(raw: &str) -> Option<Vec<SeatNumber>> {
    raw.split_whitespace()
        .map(|seat| seat.parse::<SeatNumber>().ok())
        .collect()
}

/// Write bookings in csv format, one row per `(reference, booking)`
pub fn write_bookings(
    writer: impl io::Write,
    bookings: impl IntoIterator<Item = (String, Booking)>,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);

    for (reference, booking) in bookings {
        let seats: Vec<String> = booking.seats.iter().map(|s| s.to_string()).collect();
        writer.serialize(OutputRow {
            reference,
            trip: booking.trip,
            seats: seats.join(" "),
            total: booking.total.to_string(),
            status: booking.status,
            payment: booking.payment,
        })?;
    }

    writer.flush()?;
    Ok(())
}
