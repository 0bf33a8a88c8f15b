//! Static GTFS bundle management: opportunistic download of the published
//! CSV files into a local data directory, with a bundled fallback copy for
//! first runs and offline starts.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::fetch::HttpClient;

/// The files fetched from the remote bundle, matching the publisher's names.
pub const GTFS_FILES: &[&str] = &[
    "calendar.txt",
    "calendar_dates.txt",
    "routes.txt",
    "shapes.txt",
    "stop_times.txt",
    "stops.txt",
    "trips.txt",
];

/// Stamp file recording the last successful download round (epoch millis).
const STAMP_FILE: &str = ".last_download";

const REFRESH_AFTER_MILLIS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Resolves GTFS file reads: a freshly downloaded copy in the data directory
/// wins, otherwise the bundled fallback, otherwise a not-found error.
#[derive(Debug, Clone)]
pub struct GtfsDir {
    data_dir: PathBuf,
    bundled_dir: Option<PathBuf>,
}

impl GtfsDir {
    pub fn new(data_dir: impl Into<PathBuf>, bundled_dir: Option<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            bundled_dir,
        }
    }

    pub fn open(&self, name: &str) -> Result<fs::File> {
        let local = self.data_dir.join(name);
        if local.exists() {
            debug!(path = %local.display(), "Using downloaded GTFS file");
            return fs::File::open(&local).with_context(|| format!("opening {}", local.display()));
        }
        if let Some(bundled) = &self.bundled_dir {
            let fallback = bundled.join(name);
            if fallback.exists() {
                debug!(path = %fallback.display(), "Using bundled GTFS file");
                return fs::File::open(&fallback)
                    .with_context(|| format!("opening {}", fallback.display()));
            }
        }
        Err(anyhow::Error::new(std::io::Error::new(
            ErrorKind::NotFound,
            format!("{name}: no downloaded or bundled copy"),
        )))
    }
}

/// Downloads the static bundle from a base URL serving the GTFS file names.
pub struct Downloader {
    base_url: String,
    data_dir: PathBuf,
}

impl Downloader {
    pub fn new(base_url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            data_dir: data_dir.into(),
        }
    }

    /// True when no download has ever completed or the last one is at least
    /// seven days old.
    pub fn should_refresh(&self) -> bool {
        match last_download_millis(&self.data_dir) {
            Some(last) => Utc::now().timestamp_millis() - last >= REFRESH_AFTER_MILLIS,
            None => true,
        }
    }

    /// Whole days since the last successful download, or `None` if never.
    pub fn days_since_last_download(&self) -> Option<i64> {
        let last = last_download_millis(&self.data_dir)?;
        Some((Utc::now().timestamp_millis() - last) / (24 * 60 * 60 * 1000))
    }

    /// Downloads the bundle when it is missing or stale. A failed round is
    /// logged and swallowed: whatever data is already on disk keeps serving,
    /// and only the subsequent schedule load decides whether anything usable
    /// exists.
    pub async fn refresh_if_stale<C: HttpClient>(&self, client: &C) {
        if !self.should_refresh() {
            return;
        }
        info!("Static bundle missing or stale, downloading");
        if let Err(e) = self.download_all(client).await {
            warn!(error = %e, "Static bundle download failed, using existing data");
        }
    }

    /// Fetches every bundle file into the data directory. The round fails on
    /// the first file that cannot be fetched; any files already written stay
    /// in place and the stamp is only updated after a complete round.
    pub async fn download_all<C: HttpClient>(&self, client: &C) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating {}", self.data_dir.display()))?;

        for name in GTFS_FILES {
            let url = format!("{}{}", self.base_url, name);
            let bytes = client
                .fetch_bytes(&url)
                .await
                .with_context(|| format!("downloading {name}"))?;
            let path = self.data_dir.join(name);
            fs::write(&path, &bytes).with_context(|| format!("writing {}", path.display()))?;
            debug!(file = name, bytes = bytes.len(), "Downloaded GTFS file");
        }

        let stamp = self.data_dir.join(STAMP_FILE);
        fs::write(&stamp, Utc::now().timestamp_millis().to_string())
            .with_context(|| format!("writing {}", stamp.display()))?;
        info!(dir = %self.data_dir.display(), "GTFS bundle downloaded");
        Ok(())
    }
}

fn last_download_millis(data_dir: &Path) -> Option<i64> {
    let raw = fs::read_to_string(data_dir.join(STAMP_FILE)).ok()?;
    match raw.trim().parse() {
        Ok(millis) => Some(millis),
        Err(_) => {
            warn!("Unreadable download stamp, treating bundle as stale");
            None
        }
    }
}
