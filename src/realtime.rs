//! Realtime feed cache.
//!
//! TripUpdates are memoized for a short window so a burst of arrival
//! resolutions does not hammer the upstream endpoint. A failed refresh
//! returns the error but keeps the previous parse around: a stale feed a few
//! seconds old beats flapping to static-only results whenever the upstream
//! hiccups. VehiclePositions feed the live map and are always fetched fresh.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

use crate::fetch::HttpClient;
use crate::gtfs_rt::FeedMessage;
use crate::parser::parse_feed;

pub struct RealtimeFeeds<C> {
    client: C,
    trip_updates_url: String,
    vehicle_positions_url: String,
    cache: Mutex<Option<(Instant, Arc<FeedMessage>)>>,
}

impl<C: HttpClient> RealtimeFeeds<C> {
    pub fn new(
        client: C,
        trip_updates_url: impl Into<String>,
        vehicle_positions_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            trip_updates_url: trip_updates_url.into(),
            vehicle_positions_url: vehicle_positions_url.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// The TripUpdates feed, served from cache when the last parse is
    /// younger than `max_age`. On fetch or parse failure the cached value is
    /// left untouched and the error is returned.
    pub async fn trip_updates(&self, max_age: Duration) -> Result<Arc<FeedMessage>> {
        if let Some((at, feed)) = self.cache.lock().unwrap().as_ref() {
            if at.elapsed() < max_age {
                debug!("Serving cached TripUpdates feed");
                return Ok(feed.clone());
            }
        }

        let bytes = self
            .client
            .fetch_bytes(&self.trip_updates_url)
            .await
            .context("TripUpdates fetch failed")?;
        let feed = Arc::new(parse_feed(&bytes).context("TripUpdates parse failed")?);

        debug!(entities = feed.entity.len(), "Refreshed TripUpdates feed");
        *self.cache.lock().unwrap() = Some((Instant::now(), feed.clone()));
        Ok(feed)
    }

    /// The VehiclePositions feed, always fetched fresh.
    pub async fn vehicle_positions(&self) -> Result<FeedMessage> {
        let bytes = self
            .client
            .fetch_bytes(&self.vehicle_positions_url)
            .await
            .context("VehiclePositions fetch failed")?;
        parse_feed(&bytes).context("VehiclePositions parse failed")
    }
}
