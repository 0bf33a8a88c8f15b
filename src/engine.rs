//! Arrival Resolution Engine.
//!
//! Merges realtime trip updates, sequence-interpolated arrivals, and the
//! static timetable into a short ranked arrival list per stop, plus the live
//! vehicle queries built on the VehiclePositions feed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, warn};

use crate::download::{Downloader, GtfsDir};
use crate::fetch::HttpClient;
use crate::geo;
use crate::gtfs_rt::FeedMessage;
use crate::model::{ArrivalDisplay, ArrivalStatus, BusPosition, Route, Stop};
use crate::realtime::RealtimeFeeds;
use crate::schedule::ScheduleStore;
use crate::timefmt;

pub const DEFAULT_NEARBY_RADIUS_METERS: f64 = 200.0;

const TRIP_UPDATES_MAX_AGE: Duration = Duration::from_secs(15);
const STOP_CACHE_TTL: Duration = Duration::from_secs(30);
/// A static time this close to a realtime one is the same physical arrival.
const DUPLICATE_WINDOW_SECS: i64 = 120;
const MAX_ARRIVALS: usize = 3;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prefix joined with the vehicle label to synthesize a trip id when the
    /// feed leaves it blank (an agency-specific feed quirk). `None` disables
    /// the fallback.
    pub vehicle_label_trip_prefix: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vehicle_label_trip_prefix: Some("Tri".to_string()),
        }
    }
}

/// One engine instance owns every cache, so tests construct isolated engines
/// with fake clients and a controlled `now`.
pub struct ArrivalEngine<C> {
    schedule: RwLock<ScheduleStore>,
    feeds: RealtimeFeeds<C>,
    config: EngineConfig,
    bundle: Option<(Downloader, GtfsDir)>,
    stop_cache: Mutex<HashMap<String, (Instant, Vec<ArrivalDisplay>)>>,
    dropped_vehicles: AtomicU64,
}

impl<C: HttpClient> ArrivalEngine<C> {
    pub fn new(schedule: ScheduleStore, feeds: RealtimeFeeds<C>, config: EngineConfig) -> Self {
        Self {
            schedule: RwLock::new(schedule),
            feeds,
            config,
            bundle: None,
            stop_cache: Mutex::new(HashMap::new()),
            dropped_vehicles: AtomicU64::new(0),
        }
    }

    /// Attaches the remote static bundle so [`Self::force_refresh`] can
    /// re-download and rebuild the schedule.
    pub fn with_bundle(mut self, downloader: Downloader, dir: GtfsDir) -> Self {
        self.bundle = Some((downloader, dir));
        self
    }

    pub fn all_routes(&self) -> Vec<Route> {
        self.schedule.read().unwrap().all_routes()
    }

    pub fn stop(&self, stop_id: &str) -> Option<Stop> {
        self.schedule.read().unwrap().stop(stop_id)
    }

    pub fn stops_for_route(&self, short_name: &str) -> Vec<Stop> {
        self.schedule.read().unwrap().stops_for_route(short_name)
    }

    pub fn shape_points_for_route(&self, short_name: &str) -> Vec<Vec<(f64, f64)>> {
        self.schedule
            .read()
            .unwrap()
            .shape_point_lists_for_route(short_name)
    }

    pub fn static_timetable_for_stop(&self, stop_id: &str, now: DateTime<Utc>) -> Vec<String> {
        self.schedule
            .read()
            .unwrap()
            .static_timetable_for_stop(stop_id, now)
    }

    /// Vehicles dropped from live position resolution because no route could
    /// be attributed to them.
    pub fn dropped_vehicle_count(&self) -> u64 {
        self.dropped_vehicles.load(Ordering::Relaxed)
    }

    /// Re-downloads the static bundle and swaps in a freshly built schedule.
    pub async fn force_refresh(&self) -> Result<()> {
        let Some((downloader, dir)) = &self.bundle else {
            bail!("no static bundle configured");
        };
        downloader
            .download_all(self.feeds.client())
            .await
            .context("static bundle refresh failed")?;
        let store = ScheduleStore::load_dir(dir)?;
        *self.schedule.write().unwrap() = store;
        self.stop_cache.lock().unwrap().clear();
        debug!("Schedule rebuilt from refreshed bundle");
        Ok(())
    }

    /// Resolves the next arrivals at a stop: at most three entries, closest
    /// first. Realtime failures degrade to static-only results; the resolved
    /// list is cached per stop for a short window.
    pub async fn upcoming_arrivals(&self, stop: &Stop, now: DateTime<Utc>) -> Vec<ArrivalDisplay> {
        if let Some((at, cached)) = self.stop_cache.lock().unwrap().get(&stop.stop_id) {
            if at.elapsed() < STOP_CACHE_TTL {
                debug!(stop_id = %stop.stop_id, "Serving cached arrivals");
                return cached.clone();
            }
        }

        let mut arrivals: Vec<ArrivalDisplay> = Vec::new();
        let mut seen: Vec<DateTime<Utc>> = Vec::new();

        let feed = match self.feeds.trip_updates(TRIP_UPDATES_MAX_AGE).await {
            Ok(feed) => Some(feed),
            Err(e) => {
                warn!(
                    stop_id = %stop.stop_id,
                    error = %e,
                    "Realtime unavailable, using static timetable only"
                );
                None
            }
        };

        let tz = {
            let sched = self.schedule.read().unwrap();
            sched.timezone()
        };

        if let Some(feed) = &feed {
            let resolved = {
                let sched = self.schedule.read().unwrap();
                let valid_trips = sched.valid_trip_ids_for_stop(&stop.stop_id, now);
                match direct_realtime_match(feed, &valid_trips, &stop.stop_id, now) {
                    Some((epoch, status)) => Some((epoch, status, false)),
                    None => interpolate_arrival(feed, &sched, &valid_trips, stop, now)
                        .map(|(epoch, status)| (epoch, status, true)),
                }
            };
            if let Some((epoch, status, interpolated)) = resolved {
                arrivals.push(display(epoch, Some(status), true, interpolated, now, tz));
                seen.push(epoch);
            }
        }

        let timetable = {
            let sched = self.schedule.read().unwrap();
            sched.static_timetable_for_stop(&stop.stop_id, now)
        };
        for raw in timetable {
            if arrivals.len() >= MAX_ARRIVALS {
                break;
            }
            let Some(epoch) = timefmt::next_future_occurrence(&raw, now, tz) else {
                continue;
            };
            if seen
                .iter()
                .any(|s| (epoch - *s).num_seconds().abs() < DUPLICATE_WINDOW_SECS)
            {
                debug!(
                    stop_id = %stop.stop_id,
                    time = %raw,
                    "Scheduled time shadowed by realtime arrival"
                );
                continue;
            }
            arrivals.push(display(epoch, None, false, false, now, tz));
        }

        arrivals.sort_by_key(|a| a.minutes_away);
        self.stop_cache
            .lock()
            .unwrap()
            .insert(stop.stop_id.clone(), (Instant::now(), arrivals.clone()));
        arrivals
    }

    /// True when any vehicle in the current VehiclePositions feed is within
    /// `radius_meters` of the point. Feed errors read as "no".
    pub async fn is_bus_near_stop(&self, lat: f64, lon: f64, radius_meters: f64) -> bool {
        let feed = match self.feeds.vehicle_positions().await {
            Ok(feed) => feed,
            Err(e) => {
                warn!(error = %e, "VehiclePositions unavailable");
                return false;
            }
        };
        feed.entity.iter().any(|entity| {
            entity
                .vehicle
                .as_ref()
                .and_then(|v| v.position.as_ref())
                .is_some_and(|pos| {
                    geo::distance_meters(lat, lon, pos.latitude as f64, pos.longitude as f64)
                        <= radius_meters
                })
        })
    }

    /// Current vehicle positions attributed to routes. Vehicles without a
    /// resolvable trip id, or whose trip id maps to no route, are dropped
    /// (logged and counted, never an error).
    pub async fn live_bus_positions(&self) -> Vec<BusPosition> {
        let feed = match self.feeds.vehicle_positions().await {
            Ok(feed) => feed,
            Err(e) => {
                error!(error = %e, "VehiclePositions fetch failed");
                return Vec::new();
            }
        };

        let sched = self.schedule.read().unwrap();
        let trip_to_route = sched.trip_to_route();
        let mut buses = Vec::new();

        for entity in &feed.entity {
            let Some(vehicle) = &entity.vehicle else {
                continue;
            };
            let vehicle_id = vehicle
                .vehicle
                .as_ref()
                .and_then(|d| d.id.clone())
                .unwrap_or_else(|| entity.id.clone());
            let label = vehicle.vehicle.as_ref().and_then(|d| d.label.clone());

            let trip_id = vehicle
                .trip
                .as_ref()
                .map(|t| t.trip_id())
                .unwrap_or_default();
            let resolved = if !trip_id.is_empty() {
                Some(trip_id.to_string())
            } else {
                match (&self.config.vehicle_label_trip_prefix, label.as_deref()) {
                    (Some(prefix), Some(label)) if !label.is_empty() => {
                        Some(format!("{prefix}{label}"))
                    }
                    _ => None,
                }
            };

            let Some(resolved) = resolved else {
                warn!(vehicle_id = %vehicle_id, "Vehicle has neither trip id nor label fallback");
                self.dropped_vehicles.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let Some(route_id) = trip_to_route.get(&resolved) else {
                warn!(
                    vehicle_id = %vehicle_id,
                    trip_id = %resolved,
                    "No route mapping for vehicle trip, possibly expired GTFS"
                );
                self.dropped_vehicles.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let Some(pos) = &vehicle.position else {
                warn!(vehicle_id = %vehicle_id, "Vehicle update carries no position");
                self.dropped_vehicles.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            buses.push(BusPosition {
                vehicle_id,
                route_id: route_id.clone(),
                trip_id: resolved,
                lat: pos.latitude as f64,
                lon: pos.longitude as f64,
                bearing: pos.bearing,
                label,
                occupancy_status: vehicle
                    .occupancy_status
                    .map(|_| vehicle.occupancy_status().as_str_name().to_lowercase()),
            });
        }

        debug!(
            count = buses.len(),
            dropped = self.dropped_vehicle_count(),
            "Resolved live bus positions"
        );
        buses
    }
}

fn display(
    epoch: DateTime<Utc>,
    status: Option<ArrivalStatus>,
    realtime: bool,
    was_interpolated: bool,
    now: DateTime<Utc>,
    tz: Tz,
) -> ArrivalDisplay {
    ArrivalDisplay {
        minutes_away: (epoch - now).num_minutes(),
        status,
        realtime,
        time_formatted: Some(timefmt::format_clock(epoch, tz)),
        was_interpolated,
    }
}

/// Step 1: the soonest future arrival reported directly for this stop by a
/// valid trip.
fn direct_realtime_match(
    feed: &FeedMessage,
    valid_trips: &HashSet<String>,
    stop_id: &str,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, ArrivalStatus)> {
    let mut best: Option<(DateTime<Utc>, ArrivalStatus)> = None;
    for entity in &feed.entity {
        let Some(update) = &entity.trip_update else {
            continue;
        };
        if !valid_trips.contains(update.trip.trip_id()) {
            continue;
        }
        for stu in &update.stop_time_update {
            if stu.stop_id() != stop_id {
                continue;
            }
            let Some(arrival) = &stu.arrival else {
                continue;
            };
            let Some(epoch) = arrival.time.and_then(|t| DateTime::from_timestamp(t, 0)) else {
                continue;
            };
            if epoch <= now {
                continue;
            }
            if best.is_none_or(|(b, _)| epoch < b) {
                let delay_min = i64::from(arrival.delay.unwrap_or(0)) / 60;
                debug!(
                    trip_id = update.trip.trip_id(),
                    stop_id, delay_min, "Direct realtime match"
                );
                best = Some((epoch, ArrivalStatus::from_delay_minutes(delay_min)));
            }
        }
    }
    best
}

/// Step 2: when no update names this stop, linearly interpolate between the
/// nearest reported stop sequences below and above it. The first valid trip
/// wins; results from different trips are never averaged.
fn interpolate_arrival(
    feed: &FeedMessage,
    sched: &ScheduleStore,
    valid_trips: &HashSet<String>,
    stop: &Stop,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, ArrivalStatus)> {
    for entity in &feed.entity {
        let Some(update) = &entity.trip_update else {
            continue;
        };
        let trip_id = update.trip.trip_id();
        if !valid_trips.contains(trip_id) {
            continue;
        }

        let stop_times = sched.stop_times_for_trip(trip_id);
        let by_stop: HashMap<&str, i64> = stop_times
            .iter()
            .filter_map(|st| {
                st.stop_sequence
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .map(|seq| (st.stop_id.as_str(), seq))
            })
            .collect();
        let Some(&target_seq) = by_stop.get(stop.stop_id.as_str()) else {
            continue;
        };

        // Reported arrivals keyed by the static stop sequence.
        let mut reported: BTreeMap<i64, i64> = BTreeMap::new();
        for stu in &update.stop_time_update {
            let Some(time) = stu.arrival.as_ref().and_then(|a| a.time) else {
                continue;
            };
            let Some(&seq) = by_stop.get(stu.stop_id()) else {
                continue;
            };
            reported.insert(seq, time);
        }

        let Some((&lo_seq, &lo_time)) = reported.range(..target_seq).next_back() else {
            continue;
        };
        let Some((&hi_seq, &hi_time)) = reported.range(target_seq + 1..).next() else {
            continue;
        };

        let ratio = (target_seq - lo_seq) as f64 / (hi_seq - lo_seq) as f64;
        let interp_secs = lo_time + ((hi_time - lo_time) as f64 * ratio).round() as i64;
        let Some(epoch) = DateTime::from_timestamp(interp_secs, 0) else {
            continue;
        };

        let Some(scheduled) = sched.scheduled_time_for_stop(trip_id, &stop.stop_id, now) else {
            continue;
        };
        let delay_min = (epoch - scheduled).num_minutes();
        debug!(
            trip_id,
            lo_seq, hi_seq, target_seq, delay_min, "Interpolated arrival between reported stops"
        );
        return Some((epoch, ArrivalStatus::from_delay_minutes(delay_min)));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{
        FeedEntity, FeedHeader, Position, TripDescriptor, TripUpdate, VehicleDescriptor,
        VehiclePosition, trip_update,
    };
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;
    use prost::Message;
    use std::sync::atomic::AtomicUsize;

    const TU_URL: &str = "http://example.invalid/tripupdates";
    const VP_URL: &str = "http://example.invalid/vehiclepositions";

    const ROUTES: &str = "\
route_id,route_short_name,route_long_name,route_color,route_text_color
R1,12,Crosstown,2E8540,FFFFFF
";

    const TRIPS: &str = "\
trip_id,route_id,service_id,shape_id
T1,R1,WK,
T2,R1,WK,
";

    // T1 stops S1 -> S2 -> S3 in the early afternoon; T2 serves S1 later.
    const STOP_TIMES: &str = "\
trip_id,arrival_time,departure_time,stop_id,stop_sequence
T1,14:00:00,14:00:00,S1,1
T1,14:05:00,14:05:00,S2,2
T1,14:10:00,14:10:00,S3,3
T2,16:00:00,16:00:00,S1,1
T2,16:05:00,16:05:00,S2,2
";

    const STOPS: &str = "\
stop_id,stop_code,stop_name,stop_lat,stop_lon
S1,1001,Ouellette at Wyandotte,42.3170,-83.0370
S2,1002,Ouellette at Park,42.3150,-83.0360
S3,1003,Ouellette at Elliott,42.3130,-83.0350
";

    const CALENDAR: &str = "\
service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date
WK,1,1,1,1,1,0,0,20240101,20251231
";

    fn store() -> ScheduleStore {
        let mut s = ScheduleStore::new();
        s.load_routes(ROUTES.as_bytes());
        s.load_trips(TRIPS.as_bytes());
        s.load_stop_times(STOP_TIMES.as_bytes());
        s.load_stops(STOPS.as_bytes());
        s.load_calendar(CALENDAR.as_bytes());
        s
    }

    // 2024-06-10 is a Monday; noon is before every scheduled time above.
    fn noon() -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(2024, 6, 10, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn local_epoch(hour: u32, minute: u32) -> i64 {
        New_York
            .with_ymd_and_hms(2024, 6, 10, hour, minute, 0)
            .unwrap()
            .timestamp()
    }

    fn header() -> FeedHeader {
        FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            incrementality: None,
            timestamp: None,
            feed_version: None,
        }
    }

    fn trip_update_feed(updates: Vec<(&str, Vec<(&str, i64, i32)>)>) -> Vec<u8> {
        let entity = updates
            .into_iter()
            .enumerate()
            .map(|(i, (trip_id, stus))| FeedEntity {
                id: i.to_string(),
                trip_update: Some(TripUpdate {
                    trip: TripDescriptor {
                        trip_id: Some(trip_id.to_string()),
                        ..Default::default()
                    },
                    stop_time_update: stus
                        .into_iter()
                        .map(|(stop_id, time, delay)| trip_update::StopTimeUpdate {
                            stop_id: Some(stop_id.to_string()),
                            arrival: Some(trip_update::StopTimeEvent {
                                time: Some(time),
                                delay: Some(delay),
                                uncertainty: None,
                            }),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();
        FeedMessage {
            header: header(),
            entity,
        }
        .encode_to_vec()
    }

    fn vehicle_feed(vehicles: Vec<(&str, &str, &str, f64, f64)>) -> Vec<u8> {
        let entity = vehicles
            .into_iter()
            .map(|(id, trip_id, label, lat, lon)| FeedEntity {
                id: id.to_string(),
                vehicle: Some(VehiclePosition {
                    trip: Some(TripDescriptor {
                        trip_id: if trip_id.is_empty() {
                            None
                        } else {
                            Some(trip_id.to_string())
                        },
                        ..Default::default()
                    }),
                    vehicle: Some(VehicleDescriptor {
                        id: Some(id.to_string()),
                        label: if label.is_empty() {
                            None
                        } else {
                            Some(label.to_string())
                        },
                        license_plate: None,
                    }),
                    position: Some(Position {
                        latitude: lat as f32,
                        longitude: lon as f32,
                        bearing: Some(90.0),
                        odometer: None,
                        speed: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();
        FeedMessage {
            header: header(),
            entity,
        }
        .encode_to_vec()
    }

    struct FakeClient {
        responses: HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    impl FakeClient {
        fn new(trip_updates: Option<Vec<u8>>, vehicle_positions: Option<Vec<u8>>) -> Self {
            let mut responses = HashMap::new();
            if let Some(bytes) = trip_updates {
                responses.insert(TU_URL.to_string(), bytes);
            }
            if let Some(bytes) = vehicle_positions {
                responses.insert(VP_URL.to_string(), bytes);
            }
            Self {
                responses,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HttpClient for FakeClient {
        async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.get(url) {
                Some(bytes) => Ok(bytes.clone()),
                None => bail!("unreachable feed {url}"),
            }
        }
    }

    fn engine(client: FakeClient) -> ArrivalEngine<FakeClient> {
        ArrivalEngine::new(
            store(),
            RealtimeFeeds::new(client, TU_URL, VP_URL),
            EngineConfig::default(),
        )
    }

    fn stop(engine: &ArrivalEngine<FakeClient>, id: &str) -> Stop {
        engine.stop(id).unwrap()
    }

    #[tokio::test]
    async fn test_direct_realtime_match_wins() {
        // T1 reports S2 ten minutes out, five minutes late.
        let arrival = noon().timestamp() + 600;
        let client = FakeClient::new(
            Some(trip_update_feed(vec![("T1", vec![("S2", arrival, 300)])])),
            None,
        );
        let e = engine(client);

        let arrivals = e.upcoming_arrivals(&stop(&e, "S2"), noon()).await;
        assert!(!arrivals.is_empty());
        let first = &arrivals[0];
        assert_eq!(first.minutes_away, 10);
        assert_eq!(first.status, Some(ArrivalStatus::Late));
        assert!(first.realtime);
        assert!(!first.was_interpolated);
        // Exactly one realtime entry; the rest is static fill.
        assert_eq!(arrivals.iter().filter(|a| a.realtime).count(), 1);
    }

    #[tokio::test]
    async fn test_interpolation_when_stop_not_reported() {
        // T1 reports S1 (seq 1) and S3 (seq 3) but not S2 (seq 2). The
        // bracketing arrivals are 10 minutes apart, so S2 interpolates to
        // the midpoint, which matches its 14:05 schedule exactly.
        let t_s1 = local_epoch(14, 0);
        let t_s3 = t_s1 + 600;
        let client = FakeClient::new(
            Some(trip_update_feed(vec![(
                "T1",
                vec![("S1", t_s1, 0), ("S3", t_s3, 0)],
            )])),
            None,
        );
        let e = engine(client);

        let arrivals = e.upcoming_arrivals(&stop(&e, "S2"), noon()).await;
        let rt: Vec<_> = arrivals.iter().filter(|a| a.realtime).collect();
        assert_eq!(rt.len(), 1);
        assert!(rt[0].was_interpolated);
        assert_eq!(rt[0].status, Some(ArrivalStatus::OnTime));
        assert_eq!(rt[0].minutes_away, 125);
    }

    #[tokio::test]
    async fn test_interpolated_delay_classifies_late() {
        // Bracketing updates run 5 minutes behind the 14:00/14:10 schedule.
        let t_s1 = local_epoch(14, 5);
        let t_s3 = t_s1 + 600;
        let client = FakeClient::new(
            Some(trip_update_feed(vec![(
                "T1",
                vec![("S1", t_s1, 300), ("S3", t_s3, 300)],
            )])),
            None,
        );
        let e = engine(client);

        let arrivals = e.upcoming_arrivals(&stop(&e, "S2"), noon()).await;
        let rt = arrivals.iter().find(|a| a.was_interpolated).unwrap();
        assert_eq!(rt.status, Some(ArrivalStatus::Late));
    }

    #[tokio::test]
    async fn test_static_time_near_realtime_is_deduplicated() {
        // Realtime arrival 30 s after the scheduled 14:05: the schedule
        // entry is the same physical bus and must not double-list.
        let arrival = local_epoch(14, 5) + 30;
        let client = FakeClient::new(
            Some(trip_update_feed(vec![("T1", vec![("S2", arrival, 30)])])),
            None,
        );
        let e = engine(client);

        let arrivals = e.upcoming_arrivals(&stop(&e, "S2"), noon()).await;
        let statics: Vec<_> = arrivals.iter().filter(|a| !a.realtime).collect();
        // S2 sees T1 at 14:05 (shadowed) and T2 at 16:05 (kept).
        assert_eq!(statics.len(), 1);
        assert_eq!(statics[0].time_formatted.as_deref(), Some("4:05 PM"));
    }

    #[tokio::test]
    async fn test_feed_failure_degrades_to_static_only() {
        let e = engine(FakeClient::new(None, None));
        let arrivals = e.upcoming_arrivals(&stop(&e, "S1"), noon()).await;
        assert!(!arrivals.is_empty());
        assert!(arrivals.iter().all(|a| !a.realtime && a.status.is_none()));
        // Non-decreasing minutes away.
        for pair in arrivals.windows(2) {
            assert!(pair[0].minutes_away <= pair[1].minutes_away);
        }
    }

    #[tokio::test]
    async fn test_never_more_than_three_arrivals() {
        let extra = "\
trip_id,arrival_time,departure_time,stop_id,stop_sequence
T1,14:00:00,14:00:00,S1,1
T1,14:30:00,14:30:00,S1,2
T1,15:00:00,15:00:00,S1,3
T1,15:30:00,15:30:00,S1,4
T1,16:00:00,16:00:00,S1,5
";
        let mut s = ScheduleStore::new();
        s.load_routes(ROUTES.as_bytes());
        s.load_trips(TRIPS.as_bytes());
        s.load_stop_times(extra.as_bytes());
        s.load_stops(STOPS.as_bytes());
        s.load_calendar(CALENDAR.as_bytes());
        let e = ArrivalEngine::new(
            s,
            RealtimeFeeds::new(FakeClient::new(None, None), TU_URL, VP_URL),
            EngineConfig::default(),
        );

        let arrivals = e.upcoming_arrivals(&stop(&e, "S1"), noon()).await;
        assert_eq!(arrivals.len(), 3);
        assert_eq!(arrivals[0].minutes_away, 120);
    }

    #[tokio::test]
    async fn test_per_stop_cache_avoids_refetch() {
        let arrival = noon().timestamp() + 600;
        let client = FakeClient::new(
            Some(trip_update_feed(vec![("T1", vec![("S2", arrival, 0)])])),
            None,
        );
        let e = engine(client);

        let s2 = stop(&e, "S2");
        let first = e.upcoming_arrivals(&s2, noon()).await;
        let second = e.upcoming_arrivals(&s2, noon()).await;
        assert_eq!(first, second);
        assert_eq!(e.feeds.client().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_past_realtime_arrival_is_ignored() {
        let arrival = noon().timestamp() - 60;
        let client = FakeClient::new(
            Some(trip_update_feed(vec![("T1", vec![("S2", arrival, 0)])])),
            None,
        );
        let e = engine(client);

        let arrivals = e.upcoming_arrivals(&stop(&e, "S2"), noon()).await;
        // The stale update neither matches directly nor brackets anything.
        assert!(arrivals.iter().all(|a| !a.realtime));
    }

    #[tokio::test]
    async fn test_is_bus_near_stop_radius() {
        let feed = vehicle_feed(vec![("v1", "T1", "101", 42.3170, -83.0370)]);
        let e = engine(FakeClient::new(None, Some(feed)));

        assert!(e.is_bus_near_stop(42.3170, -83.0370, 200.0).await);
        // ~2.5 km away.
        assert!(!e.is_bus_near_stop(42.3400, -83.0370, 200.0).await);
    }

    #[tokio::test]
    async fn test_is_bus_near_stop_false_on_feed_error() {
        let e = engine(FakeClient::new(None, None));
        assert!(!e.is_bus_near_stop(42.3170, -83.0370, 200.0).await);
    }

    #[tokio::test]
    async fn test_live_positions_resolve_and_drop() {
        let feed = vehicle_feed(vec![
            // Normal vehicle on T1.
            ("v1", "T1", "101", 42.31, -83.03),
            // Blank trip id, label "2" resolves via the "T" prefix to T2.
            ("v2", "", "2", 42.32, -83.04),
            // Unknown trip, dropped.
            ("v3", "ZZZ", "103", 42.33, -83.05),
            // Nothing to resolve with, dropped.
            ("v4", "", "", 42.34, -83.06),
        ]);
        let e = ArrivalEngine::new(
            store(),
            RealtimeFeeds::new(FakeClient::new(None, Some(feed)), TU_URL, VP_URL),
            EngineConfig {
                vehicle_label_trip_prefix: Some("T".to_string()),
            },
        );

        let buses = e.live_bus_positions().await;
        assert_eq!(buses.len(), 2);
        assert_eq!(buses[0].trip_id, "T1");
        assert_eq!(buses[0].route_id, "R1");
        assert_eq!(buses[1].trip_id, "T2");
        assert_eq!(e.dropped_vehicle_count(), 2);
    }

    #[tokio::test]
    async fn test_live_positions_prefix_disabled() {
        let feed = vehicle_feed(vec![("v2", "", "2", 42.32, -83.04)]);
        let e = ArrivalEngine::new(
            store(),
            RealtimeFeeds::new(FakeClient::new(None, Some(feed)), TU_URL, VP_URL),
            EngineConfig {
                vehicle_label_trip_prefix: None,
            },
        );
        assert!(e.live_bus_positions().await.is_empty());
        assert_eq!(e.dropped_vehicle_count(), 1);
    }
}
