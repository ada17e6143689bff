/// A lock older than this is treated as abandoned and may be reclaimed.
pub const LOCK_TIMEOUT_SECS: i64 = 300;

/// How long a completed scrape keeps a city `fresh`.
pub const FRESHNESS_HOURS: i64 = 24;

/// Days of showtimes the engine tries to keep on hand, counted from today.
pub const SCRAPE_HORIZON_DAYS: i64 = 14;

/// Coverage within this many days of the horizon marks a plan as an extension.
pub const EXTENSION_MARGIN_DAYS: i64 = 5;

/// Cap on the extra days one movie may add in its single extension pass.
pub const EXTENSION_MAX_DAYS: usize = 7;

/// Empty movie discoveries in a row before a plan gives up on day steps.
pub const MAX_EMPTY_MOVIE_DISCOVERIES: u32 = 2;

/// Movie documents expire this long after `created_at`.
pub const MOVIE_TTL_DAYS: i64 = 90;

/// Showtimes starting sooner than this after extraction are discarded.
pub const MIN_SHOWTIME_LEAD_MINUTES: i64 = 60;

/// Timeout for a single extraction round-trip.
pub const STEP_TIMEOUT_SECS: u64 = 120;

/// Number of refresh agents that split the city list between them.
pub const TOTAL_REFRESH_AGENTS: u32 = 20;
