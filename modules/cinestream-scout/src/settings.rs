use chrono::Duration;
use typed_builder::TypedBuilder;

use cinestream_common::{
    Config, EXTENSION_MARGIN_DAYS, EXTENSION_MAX_DAYS, FRESHNESS_HOURS, LOCK_TIMEOUT_SECS,
    SCRAPE_HORIZON_DAYS,
};

/// Engine knobs. Defaults match production; `From<&Config>` applies env overrides.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ScrapeSettings {
    /// A held lock older than this may be reclaimed.
    #[builder(default = Duration::seconds(LOCK_TIMEOUT_SECS))]
    pub lock_timeout: Duration,
    /// A location updated within this window counts as fresh.
    #[builder(default = Duration::hours(FRESHNESS_HOURS))]
    pub freshness: Duration,
    #[builder(default = SCRAPE_HORIZON_DAYS)]
    pub horizon_days: i64,
    #[builder(default = EXTENSION_MARGIN_DAYS)]
    pub extension_margin_days: i64,
    /// Days appended per movie when results run past the planned horizon.
    #[builder(default = EXTENSION_MAX_DAYS)]
    pub extension_max_days: usize,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<&Config> for ScrapeSettings {
    fn from(config: &Config) -> Self {
        Self::builder()
            .lock_timeout(Duration::seconds(config.lock_timeout_secs))
            .freshness(Duration::hours(config.freshness_hours))
            .horizon_days(config.horizon_days)
            .extension_margin_days(config.extension_margin_days)
            .build()
    }
}
