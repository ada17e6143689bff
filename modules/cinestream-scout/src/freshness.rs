use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info};

use cinestream_common::{CityKey, Location, LocationStatus};

use crate::clock::Clock;
use crate::orchestrator::{Orchestrator, ScrapeOutcome};
use crate::traits::LocationStore;

/// What a showtime request should tell its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Freshness {
    /// Data is recent enough to serve as is.
    Fresh,
    /// A scrape is running; the caller should come back later.
    Processing,
    /// A scrape just finished on behalf of this request.
    JustScraped,
}

/// Request-facing surface: freshness checks plus on-demand scrapes.
pub struct ScrapeService {
    locations: Arc<dyn LocationStore>,
    orchestrator: Arc<Orchestrator>,
    clock: Arc<dyn Clock>,
}

impl ScrapeService {
    pub fn new(
        locations: Arc<dyn LocationStore>,
        orchestrator: Arc<Orchestrator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            locations,
            orchestrator,
            clock,
        }
    }

    pub async fn status(&self, city: &CityKey) -> Result<LocationStatus> {
        let location = self.locations.location(city).await?;
        let settings = self.orchestrator.settings();
        Ok(evaluate_status(
            location.as_ref(),
            self.clock.now(),
            settings.lock_timeout,
            settings.freshness,
        ))
    }

    /// Scrape inline when the city is stale.
    pub async fn ensure_fresh(&self, city: &CityKey) -> Result<Freshness> {
        match self.status(city).await? {
            LocationStatus::Fresh => Ok(Freshness::Fresh),
            LocationStatus::Processing => Ok(Freshness::Processing),
            LocationStatus::Stale => match self.orchestrator.run(city).await? {
                ScrapeOutcome::AlreadyInProgress => Ok(Freshness::Processing),
                ScrapeOutcome::UpToDate => Ok(Freshness::Fresh),
                ScrapeOutcome::Completed(_) => Ok(Freshness::JustScraped),
            },
        }
    }

    /// Start a scrape in the background when the city is stale and return
    /// `Processing` right away. Callers answer 202 and poll.
    pub async fn ensure_fresh_detached(&self, city: &CityKey) -> Result<Freshness> {
        match self.status(city).await? {
            LocationStatus::Fresh => return Ok(Freshness::Fresh),
            LocationStatus::Processing => return Ok(Freshness::Processing),
            LocationStatus::Stale => {}
        }

        let orchestrator = self.orchestrator.clone();
        let city = city.clone();
        tokio::spawn(async move {
            match orchestrator.run(&city).await {
                Ok(outcome) => info!(city = %city, outcome = ?outcome, "Background scrape finished"),
                Err(e) => error!(city = %city, error = %e, "Background scrape failed"),
            }
        });
        Ok(Freshness::Processing)
    }
}

/// `processing` iff a live lock exists; `fresh` iff marked fresh within the
/// freshness window; otherwise `stale`, including unknown cities.
pub fn evaluate_status(
    location: Option<&Location>,
    now: DateTime<Utc>,
    lock_timeout: Duration,
    freshness: Duration,
) -> LocationStatus {
    let Some(location) = location else {
        return LocationStatus::Stale;
    };
    if location.has_live_lock(now, lock_timeout) {
        return LocationStatus::Processing;
    }
    let recent = location
        .last_updated
        .is_some_and(|updated| now - updated < freshness);
    if location.status == LocationStatus::Fresh && recent {
        LocationStatus::Fresh
    } else {
        LocationStatus::Stale
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;

    use super::*;

    fn location(status: LocationStatus, last_updated: Option<DateTime<Utc>>, lock: Option<DateTime<Utc>>) -> Location {
        Location {
            city_key: CityKey::parse("Kyiv, Ukraine").unwrap(),
            names: BTreeMap::new(),
            geo: None,
            status,
            last_updated,
            lock_acquired_at: lock,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn unknown_city_is_stale() {
        let now = Utc::now();
        assert_eq!(
            evaluate_status(None, now, Duration::seconds(300), Duration::hours(24)),
            LocationStatus::Stale
        );
    }

    #[test]
    fn freshness_window_is_exclusive() {
        let now = Utc.with_ymd_and_hms(2025, 12, 19, 12, 0, 0).unwrap();
        let window = Duration::hours(24);
        let timeout = Duration::seconds(300);

        let recent = location(LocationStatus::Fresh, Some(now - Duration::hours(23)), None);
        assert_eq!(evaluate_status(Some(&recent), now, timeout, window), LocationStatus::Fresh);

        let old = location(LocationStatus::Fresh, Some(now - Duration::hours(24)), None);
        assert_eq!(evaluate_status(Some(&old), now, timeout, window), LocationStatus::Stale);
    }

    #[test]
    fn expired_lock_reads_as_stale() {
        let now = Utc.with_ymd_and_hms(2025, 12, 19, 12, 0, 0).unwrap();
        let timeout = Duration::seconds(300);
        let live = location(LocationStatus::Processing, None, Some(now - Duration::seconds(10)));
        assert_eq!(
            evaluate_status(Some(&live), now, timeout, Duration::hours(24)),
            LocationStatus::Processing
        );
        let expired = location(LocationStatus::Processing, Some(now), Some(now - Duration::seconds(301)));
        assert_eq!(
            evaluate_status(Some(&expired), now, timeout, Duration::hours(24)),
            LocationStatus::Stale
        );
    }
}
