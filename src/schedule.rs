//! Static Schedule Store: loads the GTFS CSV tables into memory and answers
//! every schedule-side query the arrival engine needs.
//!
//! Columns are resolved by header name everywhere (csv + serde), never by
//! position. Malformed rows are skipped with a warning; a missing file fails
//! only the load call for that table.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Read;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::download::GtfsDir;
use crate::model::{Route, ShapePoint, Stop, StopTime, Trip};
use crate::service::{CalendarEntry, CalendarException, ServiceCalendar};
use crate::timefmt;

const DEFAULT_TIMEZONE: Tz = chrono_tz::America::New_York;

#[derive(Debug, Deserialize)]
struct RouteRow {
    route_id: String,
    route_short_name: String,
    #[serde(default)]
    route_long_name: String,
    #[serde(default)]
    route_color: String,
    #[serde(default)]
    route_text_color: String,
}

#[derive(Debug, Deserialize)]
struct TripRow {
    trip_id: String,
    route_id: String,
    #[serde(default)]
    service_id: String,
    #[serde(default)]
    shape_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StopTimeRow {
    trip_id: String,
    arrival_time: String,
    stop_id: String,
    stop_sequence: String,
}

#[derive(Debug, Deserialize)]
struct StopRow {
    stop_id: String,
    #[serde(default)]
    stop_code: String,
    stop_name: String,
    stop_lat: f64,
    stop_lon: f64,
}

#[derive(Debug, Deserialize)]
struct ShapeRow {
    shape_id: String,
    shape_pt_lat: f64,
    shape_pt_lon: f64,
    shape_pt_sequence: u32,
}

#[derive(Debug, Deserialize)]
struct CalendarRow {
    service_id: String,
    monday: u8,
    tuesday: u8,
    wednesday: u8,
    thursday: u8,
    friday: u8,
    saturday: u8,
    sunday: u8,
    start_date: String,
    end_date: String,
}

#[derive(Debug, Deserialize)]
struct CalendarDateRow {
    service_id: String,
    date: String,
    exception_type: i32,
}

/// Deserializes every well-formed row of a table, logging and skipping the
/// rest. Partial loads are deliberate: one bad row never fails a table.
fn read_rows<T: DeserializeOwned, R: Read>(table: &str, reader: R) -> Vec<T> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut rows = Vec::new();
    for (i, rec) in rdr.deserialize::<T>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => warn!(table, line = i + 2, error = %e, "Skipping malformed row"),
        }
    }
    rows
}

fn parse_gtfs_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y%m%d").ok()
}

/// The in-memory static schedule. Populated once (per-table loads are
/// idempotent) and read concurrently afterward.
#[derive(Debug, Default)]
pub struct ScheduleStore {
    routes: Vec<Route>,
    trips: Vec<Trip>,
    stop_times: Vec<StopTime>,
    stops: Vec<Stop>,
    shapes: Vec<ShapePoint>,
    service: ServiceCalendar,
    trip_to_route: HashMap<String, String>,
    timezone: Option<Tz>,
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bootstrap load: all required tables plus whatever optional tables are
    /// present. A missing required file fails the whole call; missing
    /// optional files only log.
    pub fn load_dir(dir: &GtfsDir) -> Result<Self> {
        let mut store = Self::new();
        store.load_all(dir)?;
        Ok(store)
    }

    pub fn load_all(&mut self, dir: &GtfsDir) -> Result<()> {
        self.load_routes(dir.open("routes.txt").context("loading routes")?);
        self.load_trips(dir.open("trips.txt").context("loading trips")?);
        self.load_stop_times(dir.open("stop_times.txt").context("loading stop_times")?);
        self.load_stops(dir.open("stops.txt").context("loading stops")?);
        self.load_calendar(dir.open("calendar.txt").context("loading calendar")?);

        match dir.open("shapes.txt") {
            Ok(reader) => self.load_shapes(reader),
            Err(e) => warn!(error = %e, "No shapes table, route paths unavailable"),
        }
        match dir.open("calendar_dates.txt") {
            Ok(reader) => self.load_calendar_dates(reader),
            Err(e) => warn!(error = %e, "No calendar_dates table, no service exceptions"),
        }
        match dir.open("agency.txt") {
            Ok(reader) => self.load_agency(reader),
            Err(e) => warn!(error = %e, "No agency table, using default timezone"),
        }
        Ok(())
    }

    pub fn load_routes<R: Read>(&mut self, reader: R) {
        if !self.routes.is_empty() {
            debug!("Routes table already populated, skipping reload");
            return;
        }
        self.routes = read_rows::<RouteRow, _>("routes", reader)
            .into_iter()
            .map(|r| Route {
                route_id: r.route_id,
                short_name: r.route_short_name,
                long_name: r.route_long_name,
                color: if r.route_color.is_empty() {
                    "000000".to_string()
                } else {
                    r.route_color
                },
                text_color: if r.route_text_color.is_empty() {
                    "FFFFFF".to_string()
                } else {
                    r.route_text_color
                },
            })
            .collect();
        debug!(count = self.routes.len(), "Loaded routes");
    }

    pub fn load_trips<R: Read>(&mut self, reader: R) {
        if !self.trips.is_empty() {
            debug!("Trips table already populated, skipping reload");
            return;
        }
        self.trips = read_rows::<TripRow, _>("trips", reader)
            .into_iter()
            .filter(|t| {
                if t.trip_id.is_empty() {
                    warn!("Skipping trip row with blank trip_id");
                    false
                } else {
                    true
                }
            })
            .map(|t| Trip {
                trip_id: t.trip_id,
                route_id: t.route_id,
                service_id: t.service_id,
                shape_id: t.shape_id.filter(|s| !s.is_empty()),
            })
            .collect();
        self.trip_to_route = self
            .trips
            .iter()
            .map(|t| (t.trip_id.clone(), t.route_id.clone()))
            .collect();
        debug!(count = self.trips.len(), "Loaded trips");
    }

    pub fn load_stop_times<R: Read>(&mut self, reader: R) {
        if !self.stop_times.is_empty() {
            debug!("Stop-times table already populated, skipping reload");
            return;
        }
        self.stop_times = read_rows::<StopTimeRow, _>("stop_times", reader)
            .into_iter()
            .map(|st| StopTime {
                trip_id: st.trip_id,
                arrival_time: st.arrival_time,
                stop_id: st.stop_id,
                stop_sequence: st.stop_sequence,
            })
            .collect();
        debug!(count = self.stop_times.len(), "Loaded stop times");
    }

    pub fn load_stops<R: Read>(&mut self, reader: R) {
        if !self.stops.is_empty() {
            debug!("Stops table already populated, skipping reload");
            return;
        }
        self.stops = read_rows::<StopRow, _>("stops", reader)
            .into_iter()
            .map(|s| Stop {
                stop_id: s.stop_id,
                stop_code: s.stop_code,
                name: s.stop_name,
                lat: s.stop_lat,
                lon: s.stop_lon,
            })
            .collect();
        debug!(count = self.stops.len(), "Loaded stops");
    }

    pub fn load_shapes<R: Read>(&mut self, reader: R) {
        if !self.shapes.is_empty() {
            debug!("Shapes table already populated, skipping reload");
            return;
        }
        self.shapes = read_rows::<ShapeRow, _>("shapes", reader)
            .into_iter()
            .filter(|s| !s.shape_id.is_empty())
            .map(|s| ShapePoint {
                shape_id: s.shape_id,
                lat: s.shape_pt_lat,
                lon: s.shape_pt_lon,
                sequence: s.shape_pt_sequence,
            })
            .collect();
        debug!(count = self.shapes.len(), "Loaded shape points");
    }

    pub fn load_calendar<R: Read>(&mut self, reader: R) {
        if !self.service.entries.is_empty() {
            debug!("Calendar table already populated, skipping reload");
            return;
        }
        self.service.entries = read_rows::<CalendarRow, _>("calendar", reader)
            .into_iter()
            .filter_map(|c| {
                let (Some(start), Some(end)) =
                    (parse_gtfs_date(&c.start_date), parse_gtfs_date(&c.end_date))
                else {
                    warn!(service_id = %c.service_id, "Skipping calendar row with bad date range");
                    return None;
                };
                Some(CalendarEntry {
                    service_id: c.service_id,
                    days: [
                        c.monday == 1,
                        c.tuesday == 1,
                        c.wednesday == 1,
                        c.thursday == 1,
                        c.friday == 1,
                        c.saturday == 1,
                        c.sunday == 1,
                    ],
                    start_date: start,
                    end_date: end,
                })
            })
            .collect();
        debug!(count = self.service.entries.len(), "Loaded calendar");
    }

    pub fn load_calendar_dates<R: Read>(&mut self, reader: R) {
        if !self.service.exceptions.is_empty() {
            debug!("Calendar-dates table already populated, skipping reload");
            return;
        }
        self.service.exceptions = read_rows::<CalendarDateRow, _>("calendar_dates", reader)
            .into_iter()
            .filter_map(|c| {
                let Some(date) = parse_gtfs_date(&c.date) else {
                    warn!(service_id = %c.service_id, "Skipping calendar exception with bad date");
                    return None;
                };
                Some(CalendarException {
                    service_id: c.service_id,
                    date,
                    exception_type: c.exception_type,
                })
            })
            .collect();
        debug!(
            count = self.service.exceptions.len(),
            "Loaded calendar exceptions"
        );
    }

    /// Reads the agency timezone from `agency.txt` (first agency row). An
    /// unrecognized or missing value keeps the default.
    pub fn load_agency<R: Read>(&mut self, reader: R) {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let idx = match rdr
            .headers()
            .ok()
            .and_then(|h| h.iter().position(|c| c == "agency_timezone"))
        {
            Some(idx) => idx,
            None => {
                warn!("agency.txt has no agency_timezone column, using default");
                return;
            }
        };
        if let Some(Ok(record)) = rdr.records().next() {
            match record.get(idx).unwrap_or("").parse::<Tz>() {
                Ok(tz) => {
                    debug!(timezone = %tz, "Agency timezone loaded");
                    self.timezone = Some(tz);
                }
                Err(_) => warn!(raw = record.get(idx), "Unparsable agency timezone"),
            }
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone.unwrap_or(DEFAULT_TIMEZONE)
    }

    /// All routes, ordered by short name (case-sensitive lexical order).
    pub fn all_routes(&self) -> Vec<Route> {
        let mut routes = self.routes.clone();
        routes.sort_by(|a, b| a.short_name.cmp(&b.short_name));
        routes
    }

    pub fn stop(&self, stop_id: &str) -> Option<Stop> {
        self.stops.iter().find(|s| s.stop_id == stop_id).cloned()
    }

    fn route_by_short_name(&self, short_name: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.short_name.eq_ignore_ascii_case(short_name))
    }

    /// Every distinct stop reachable by any trip of the named route.
    /// Unordered; empty when the route is unknown.
    pub fn stops_for_route(&self, short_name: &str) -> Vec<Stop> {
        let Some(route) = self.route_by_short_name(short_name) else {
            return Vec::new();
        };
        let trip_ids: HashSet<&str> = self
            .trips
            .iter()
            .filter(|t| t.route_id == route.route_id)
            .map(|t| t.trip_id.as_str())
            .collect();
        if trip_ids.is_empty() {
            return Vec::new();
        }
        let stop_ids: HashSet<&str> = self
            .stop_times
            .iter()
            .filter(|st| trip_ids.contains(st.trip_id.as_str()))
            .map(|st| st.stop_id.as_str())
            .collect();
        self.stops
            .iter()
            .filter(|s| stop_ids.contains(s.stop_id.as_str()))
            .cloned()
            .collect()
    }

    /// One ordered `(lat, lon)` polyline per distinct shape used by the
    /// route's trips. Empty list when the route has no shapes.
    pub fn shape_point_lists_for_route(&self, short_name: &str) -> Vec<Vec<(f64, f64)>> {
        let Some(route) = self.route_by_short_name(short_name) else {
            return Vec::new();
        };
        let mut shape_ids: Vec<&str> = Vec::new();
        let mut seen = HashSet::new();
        for trip in &self.trips {
            if trip.route_id != route.route_id {
                continue;
            }
            if let Some(shape_id) = trip.shape_id.as_deref() {
                if seen.insert(shape_id) {
                    shape_ids.push(shape_id);
                }
            }
        }
        if shape_ids.is_empty() {
            warn!(route = short_name, "No shapes for route");
            return Vec::new();
        }
        shape_ids
            .into_iter()
            .map(|shape_id| {
                let mut points: Vec<&ShapePoint> = self
                    .shapes
                    .iter()
                    .filter(|p| p.shape_id == shape_id)
                    .collect();
                points.sort_by_key(|p| p.sequence);
                points.into_iter().map(|p| (p.lat, p.lon)).collect()
            })
            .collect()
    }

    /// Distinct scheduled arrival strings at a stop for trips whose service
    /// runs today, sorted lexically (chronological because the raw format is
    /// zero-padded `HH:MM:SS`).
    pub fn static_timetable_for_stop(&self, stop_id: &str, now: DateTime<Utc>) -> Vec<String> {
        let valid = self.valid_service_ids(now);
        let today_trips: HashSet<&str> = self
            .trips
            .iter()
            .filter(|t| valid.contains(&t.service_id))
            .map(|t| t.trip_id.as_str())
            .collect();

        let times: BTreeSet<String> = self
            .stop_times
            .iter()
            .filter(|st| st.stop_id == stop_id && today_trips.contains(st.trip_id.as_str()))
            .map(|st| st.arrival_time.clone())
            .collect();
        times.into_iter().collect()
    }

    /// A trip's stop times ordered by numeric stop sequence; malformed
    /// sequences sort last.
    pub fn stop_times_for_trip(&self, trip_id: &str) -> Vec<StopTime> {
        let mut times: Vec<StopTime> = self
            .stop_times
            .iter()
            .filter(|st| st.trip_id == trip_id)
            .cloned()
            .collect();
        times.sort_by_key(|st| st.sequence());
        times
    }

    /// The next future occurrence of a trip's scheduled time at a stop, or
    /// `None` when the time has passed today or the pair is unknown.
    pub fn scheduled_time_for_stop(
        &self,
        trip_id: &str,
        stop_id: &str,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let st = self
            .stop_times
            .iter()
            .find(|st| st.trip_id == trip_id && st.stop_id == stop_id)?;
        timefmt::next_future_occurrence(&st.arrival_time, now, self.timezone())
    }

    /// Trips that visit the stop and whose service id is valid today.
    pub fn valid_trip_ids_for_stop(&self, stop_id: &str, now: DateTime<Utc>) -> HashSet<String> {
        let valid = self.valid_service_ids(now);
        let service_by_trip: HashMap<&str, &str> = self
            .trips
            .iter()
            .map(|t| (t.trip_id.as_str(), t.service_id.as_str()))
            .collect();
        self.stop_times
            .iter()
            .filter(|st| st.stop_id == stop_id)
            .filter(|st| {
                service_by_trip
                    .get(st.trip_id.as_str())
                    .is_some_and(|svc| valid.contains(*svc))
            })
            .map(|st| st.trip_id.clone())
            .collect()
    }

    pub fn valid_service_ids(&self, now: DateTime<Utc>) -> HashSet<String> {
        self.service.valid_service_ids(now, self.timezone())
    }

    /// Reverse lookup from a realtime trip id to its route, built once at
    /// trips load.
    pub fn trip_to_route(&self) -> &HashMap<String, String> {
        &self.trip_to_route
    }
}
