//! In-memory records for the static GTFS tables and the derived types
//! handed to callers of the arrival engine.

use serde::Serialize;

/// A route from `routes.txt`. Identity is `route_id`; lookups by rider-facing
/// short name are case-insensitive.
#[derive(Debug, Clone, Serialize)]
pub struct Route {
    pub route_id: String,
    pub short_name: String,
    pub long_name: String,
    /// Hex color without `#`, e.g. `"2E8540"`.
    pub color: String,
    pub text_color: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: String,
    pub service_id: String,
    pub shape_id: Option<String>,
}

/// A row from `stop_times.txt`.
///
/// `stop_sequence` is kept as the raw string from the feed: some publishers
/// emit values that are not clean integers, and those rows must still load
/// and sort (last) rather than be rejected.
#[derive(Debug, Clone, Serialize)]
pub struct StopTime {
    pub trip_id: String,
    /// Scheduled arrival as zero-padded `HH:MM:SS`; hours may exceed 24 for
    /// post-midnight service.
    pub arrival_time: String,
    pub stop_id: String,
    pub stop_sequence: String,
}

impl StopTime {
    /// Numeric stop sequence, with non-numeric values sorting after every
    /// real position.
    pub fn sequence(&self) -> i64 {
        self.stop_sequence.trim().parse().unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_code: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

/// One vertex of a route shape polyline.
#[derive(Debug, Clone, Serialize)]
pub struct ShapePoint {
    pub shape_id: String,
    pub lat: f64,
    pub lon: f64,
    pub sequence: u32,
}

/// Qualitative arrival classification shown next to an ETA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArrivalStatus {
    #[serde(rename = "early")]
    Early,
    #[serde(rename = "on time")]
    OnTime,
    #[serde(rename = "late")]
    Late,
    #[serde(rename = "nearby")]
    Nearby,
}

impl ArrivalStatus {
    /// Buckets a delay (minutes, positive = late) into a status.
    pub fn from_delay_minutes(delay_min: i64) -> Self {
        if delay_min < -2 {
            ArrivalStatus::Early
        } else if delay_min <= 2 {
            ArrivalStatus::OnTime
        } else {
            ArrivalStatus::Late
        }
    }
}

/// A resolved arrival for one stop, ready for display. Derived per call,
/// never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrivalDisplay {
    pub minutes_away: i64,
    /// `None` for purely scheduled entries.
    pub status: Option<ArrivalStatus>,
    pub realtime: bool,
    /// Agency-local clock time, e.g. `"3:45 PM"`.
    pub time_formatted: Option<String>,
    pub was_interpolated: bool,
}

/// A live vehicle attributed to a route, from the VehiclePositions feed.
#[derive(Debug, Clone, Serialize)]
pub struct BusPosition {
    pub vehicle_id: String,
    pub route_id: String,
    pub trip_id: String,
    pub lat: f64,
    pub lon: f64,
    pub bearing: Option<f32>,
    pub label: Option<String>,
    pub occupancy_status: Option<String>,
}
