//! CLI entry point for the transit arrivals engine.
//!
//! Provides subcommands for browsing the static schedule, resolving upcoming
//! arrivals at a stop, querying live vehicle positions, and refreshing the
//! downloaded GTFS bundle.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use transit_arrivals::{
    download::{Downloader, GtfsDir},
    engine::{ArrivalEngine, DEFAULT_NEARBY_RADIUS_METERS, EngineConfig},
    fetch::BasicClient,
    model::{ArrivalDisplay, ArrivalStatus},
    realtime::RealtimeFeeds,
    schedule::ScheduleStore,
};

#[derive(Parser)]
#[command(name = "transit_arrivals")]
#[command(about = "Next-bus arrivals from GTFS static and realtime feeds", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all routes in the static schedule
    Routes,
    /// List the stops served by a route
    Stops {
        /// Route short name (e.g. "3")
        #[arg(value_name = "ROUTE")]
        route: String,
    },
    /// Print the shape polylines of a route as lat,lon pairs
    Shapes {
        /// Route short name
        #[arg(value_name = "ROUTE")]
        route: String,
    },
    /// Print the full scheduled timetable at a stop for today
    Timetable {
        /// Stop id
        #[arg(value_name = "STOP_ID")]
        stop_id: String,
    },
    /// Resolve the next arrivals at a stop (realtime, interpolated, static)
    Arrivals {
        /// Stop id
        #[arg(value_name = "STOP_ID")]
        stop_id: String,
    },
    /// Check whether any bus is currently near a point
    Near {
        #[arg(long)]
        lat: f64,

        #[arg(long)]
        lon: f64,

        /// Search radius in meters
        #[arg(short, long, default_value_t = DEFAULT_NEARBY_RADIUS_METERS)]
        radius: f64,
    },
    /// Print current vehicle positions attributed to routes
    Live,
    /// Download the static GTFS bundle if it is stale
    Refresh {
        /// Re-download even if the bundle is fresh
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/transit_arrivals.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("transit_arrivals.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Routes => {
            let store = load_schedule(&settings).await?;
            for route in store.all_routes() {
                println!(
                    "{}\t{}\t#{}",
                    route.short_name, route.long_name, route.color
                );
            }
        }
        Commands::Stops { route } => {
            let store = load_schedule(&settings).await?;
            let stops = store.stops_for_route(&route);
            if stops.is_empty() {
                warn!(route, "No stops found for route");
            }
            for stop in stops {
                println!(
                    "{}\t{}\t{:.6},{:.6}",
                    stop.stop_id, stop.name, stop.lat, stop.lon
                );
            }
        }
        Commands::Shapes { route } => {
            let store = load_schedule(&settings).await?;
            for (i, points) in store.shape_point_lists_for_route(&route).iter().enumerate() {
                println!("# shape {i}");
                for (lat, lon) in points {
                    println!("{lat:.6},{lon:.6}");
                }
            }
        }
        Commands::Timetable { stop_id } => {
            let store = load_schedule(&settings).await?;
            for time in store.static_timetable_for_stop(&stop_id, Utc::now()) {
                println!("{time}");
            }
        }
        Commands::Arrivals { stop_id } => {
            let engine = build_engine(&settings).await?;
            let stop = engine
                .stop(&stop_id)
                .with_context(|| format!("unknown stop {stop_id}"))?;
            info!(stop_id = %stop.stop_id, stop_name = %stop.name, "Resolving arrivals");
            let mut arrivals = engine.upcoming_arrivals(&stop, Utc::now()).await;
            if arrivals.is_empty()
                && engine
                    .is_bus_near_stop(stop.lat, stop.lon, DEFAULT_NEARBY_RADIUS_METERS)
                    .await
            {
                // Nothing resolvable, but a vehicle is physically close by.
                arrivals.push(ArrivalDisplay {
                    minutes_away: 0,
                    status: Some(ArrivalStatus::Nearby),
                    realtime: true,
                    time_formatted: None,
                    was_interpolated: false,
                });
            }
            println!("{}", serde_json::to_string_pretty(&arrivals)?);
        }
        Commands::Near { lat, lon, radius } => {
            let engine = build_engine(&settings).await?;
            let near = engine.is_bus_near_stop(lat, lon, radius).await;
            println!("{near}");
        }
        Commands::Live => {
            let engine = build_engine(&settings).await?;
            let buses = engine.live_bus_positions().await;
            info!(
                count = buses.len(),
                dropped = engine.dropped_vehicle_count(),
                "Live positions resolved"
            );
            println!("{}", serde_json::to_string_pretty(&buses)?);
        }
        Commands::Refresh { force } => {
            let downloader = Downloader::new(&settings.static_base_url, &settings.data_dir);
            if !force && !downloader.should_refresh() {
                let days = downloader.days_since_last_download().unwrap_or(0);
                info!(days_old = days, "Bundle is fresh, skipping download");
                return Ok(());
            }
            downloader.download_all(&BasicClient::new()).await?;
        }
    }

    Ok(())
}

/// Runtime configuration, read from the environment (a `.env` file works).
struct Settings {
    data_dir: PathBuf,
    /// Read-only fallback copy of the GTFS files, used when a file has
    /// never been downloaded.
    bundled_dir: Option<PathBuf>,
    static_base_url: String,
    trip_updates_url: String,
    vehicle_positions_url: String,
    vehicle_label_trip_prefix: Option<String>,
}

impl Settings {
    fn from_env() -> Self {
        Self {
            data_dir: std::env::var("GTFS_DATA_DIR")
                .unwrap_or_else(|_| "gtfs_data".to_string())
                .into(),
            bundled_dir: std::env::var("GTFS_BUNDLED_DIR").ok().map(PathBuf::from),
            static_base_url: std::env::var("GTFS_STATIC_BASE_URL").unwrap_or_else(|_| {
                "https://opendata.citywindsor.ca/Uploads/google_transit/".to_string()
            }),
            trip_updates_url: std::env::var("TRIP_UPDATES_URL").unwrap_or_else(|_| {
                "https://opendata.citywindsor.ca/gtfs-rt/tripupdates.pb".to_string()
            }),
            vehicle_positions_url: std::env::var("VEHICLE_POSITIONS_URL").unwrap_or_else(|_| {
                "https://opendata.citywindsor.ca/gtfs-rt/vehiclepositions.pb".to_string()
            }),
            vehicle_label_trip_prefix: match std::env::var("VEHICLE_LABEL_TRIP_PREFIX") {
                Ok(prefix) if prefix.is_empty() => None,
                Ok(prefix) => Some(prefix),
                Err(_) => Some("Tri".to_string()),
            },
        }
    }
}

/// Runtime settings are read once; commands that only browse the static
/// schedule never construct realtime plumbing.
async fn load_schedule(settings: &Settings) -> Result<ScheduleStore> {
    let downloader = Downloader::new(&settings.static_base_url, &settings.data_dir);
    // A failed download is not fatal here: existing or bundled data keeps
    // serving, and only a schedule that cannot be loaded at all is an error.
    downloader.refresh_if_stale(&BasicClient::new()).await;
    let dir = GtfsDir::new(&settings.data_dir, settings.bundled_dir.clone());
    ScheduleStore::load_dir(&dir)
}

async fn build_engine(settings: &Settings) -> Result<ArrivalEngine<BasicClient>> {
    let store = load_schedule(settings).await?;
    let feeds = RealtimeFeeds::new(
        BasicClient::new(),
        settings.trip_updates_url.clone(),
        settings.vehicle_positions_url.clone(),
    );
    let config = EngineConfig {
        vehicle_label_trip_prefix: settings.vehicle_label_trip_prefix.clone(),
    };
    let engine = ArrivalEngine::new(store, feeds, config).with_bundle(
        Downloader::new(&settings.static_base_url, &settings.data_dir),
        GtfsDir::new(&settings.data_dir, settings.bundled_dir.clone()),
    );
    Ok(engine)
}
