use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use tracing::info;

use cinestream_common::{CityKey, Movie};

use crate::traits::MovieStore;

/// Half-open date interval `[from, to)` still to be scraped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapePlan {
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// Existing coverage already reaches close to the horizon, so results
    /// that run past `to` are worth following.
    pub extension: bool,
}

impl ScrapePlan {
    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    pub fn len_days(&self) -> i64 {
        (self.to - self.from).num_days().max(0)
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let from = self.from;
        (0..self.len_days()).map(move |offset| from + Duration::days(offset))
    }
}

/// Turns stored coverage into the minimal interval that completes the horizon.
pub struct RangePlanner {
    movies: Arc<dyn MovieStore>,
    horizon_days: i64,
    extension_margin_days: i64,
}

impl RangePlanner {
    pub fn new(movies: Arc<dyn MovieStore>, horizon_days: i64, extension_margin_days: i64) -> Self {
        Self {
            movies,
            horizon_days,
            extension_margin_days,
        }
    }

    pub async fn plan(&self, city: &CityKey, today: NaiveDate) -> Result<ScrapePlan> {
        let movies = self.movies.movies_for_city(city).await?;
        let latest = movies.iter().filter_map(Movie::latest_showtime_day).max();
        let plan = plan_range(latest, today, self.horizon_days, self.extension_margin_days);
        info!(
            city = %city,
            latest_covered = ?latest,
            from = %plan.from,
            to = %plan.to,
            days = plan.len_days(),
            extension = plan.extension,
            "Scrape range planned"
        );
        Ok(plan)
    }
}

/// Pure range computation.
///
/// With no coverage the latest covered day is taken as yesterday, so the
/// full horizon `[today, today + horizon_days)` is planned. Coverage that
/// already reaches the day before the horizon yields an empty plan.
pub fn plan_range(
    latest: Option<NaiveDate>,
    today: NaiveDate,
    horizon_days: i64,
    extension_margin_days: i64,
) -> ScrapePlan {
    let horizon = today + Duration::days(horizon_days);
    let latest_covered = latest.unwrap_or(today - Duration::days(1));

    if latest_covered >= horizon - Duration::days(1) {
        return ScrapePlan {
            from: horizon,
            to: horizon,
            extension: false,
        };
    }

    let from = (latest_covered + Duration::days(1)).max(today);
    let extension = latest.is_some_and(|d| (horizon - d).num_days() <= extension_margin_days);

    ScrapePlan {
        from,
        to: horizon,
        extension,
    }
}
