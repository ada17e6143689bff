use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::CineStreamError;

// ---------------------------------------------------------------------------
// City key
// ---------------------------------------------------------------------------

/// Stable, normalized identifier for a city: `City`, `City, Country` or
/// `City, Region, Country`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CityKey(String);

static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

impl CityKey {
    pub fn parse(raw: &str) -> Result<Self, CineStreamError> {
        let parts: Vec<String> = raw
            .split(',')
            .map(|part| RE_WHITESPACE.replace_all(part.trim(), " ").into_owned())
            .filter(|part| !part.is_empty())
            .collect();

        if parts.is_empty() || parts.len() > 3 {
            return Err(CineStreamError::InvalidCityKey(raw.to_string()));
        }

        Ok(Self(parts.join(", ")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> Vec<&str> {
        self.0.split(", ").collect()
    }

    pub fn city(&self) -> &str {
        self.parts()[0]
    }

    /// Middle component, present only for three-part keys.
    pub fn region(&self) -> Option<&str> {
        let parts = self.parts();
        (parts.len() == 3).then(|| parts[1])
    }

    pub fn country(&self) -> Option<&str> {
        let parts = self.parts();
        (parts.len() > 1).then(|| parts[parts.len() - 1])
    }
}

impl fmt::Display for CityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for CityKey {
    type Err = CineStreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Lowercased, whitespace-collapsed form used for identity comparisons of
/// titles, theater names, addresses and halls.
pub fn normalize_key(value: &str) -> String {
    RE_WHITESPACE
        .replace_all(value.trim(), " ")
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationStatus {
    Fresh,
    Processing,
    Stale,
}

impl LocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationStatus::Fresh => "fresh",
            LocationStatus::Processing => "processing",
            LocationStatus::Stale => "stale",
        }
    }
}

impl fmt::Display for LocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// One per city. Also carries the city's scrape lock: a `processing` status
/// together with `lock_acquired_at` is a held lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub city_key: CityKey,
    /// Display names keyed by language code.
    #[serde(default)]
    pub names: BTreeMap<String, String>,
    #[serde(default)]
    pub geo: Option<GeoPoint>,
    pub status: LocationStatus,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Location {
    /// True when the lock is held and younger than the staleness window.
    pub fn has_live_lock(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.status == LocationStatus::Processing
            && self
                .lock_acquired_at
                .is_some_and(|acquired_at| now - acquired_at <= timeout)
    }

    /// True while the lock stamped at `held_since` is the one stored.
    pub fn is_held_since(&self, held_since: DateTime<Utc>) -> bool {
        self.status == LocationStatus::Processing && self.lock_acquired_at == Some(held_since)
    }
}

// ---------------------------------------------------------------------------
// Movie-centric documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Showtime {
    pub start_time: DateTime<FixedOffset>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub hall: Option<String>,
}

impl Showtime {
    /// Two showings are the same when they start at the same instant in the same hall.
    pub fn same_showing(&self, other: &Showtime) -> bool {
        self.start_time == other.start_time
            && normalize_key(self.hall.as_deref().unwrap_or(""))
                == normalize_key(other.hall.as_deref().unwrap_or(""))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theater {
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub showtimes: Vec<Showtime>,
}

impl Theater {
    pub fn matches(&self, name: &str, address: &str) -> bool {
        normalize_key(&self.name) == normalize_key(name)
            && normalize_key(&self.address) == normalize_key(address)
    }
}

/// One document per (city, movie).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub city_key: CityKey,
    /// Normalized canonical title; unique together with `city_key`.
    pub title_key: String,
    /// Titles keyed by language code ("en", "local", ...).
    pub titles: BTreeMap<String, String>,
    #[serde(default)]
    pub poster_url: Option<String>,
    #[serde(default)]
    pub poster_path: Option<String>,
    #[serde(default)]
    pub theaters: Vec<Theater>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Movie {
    pub fn new(city_key: CityKey, titles: BTreeMap<String, String>, now: DateTime<Utc>) -> Self {
        let title_key = canonical_title(&titles).map(normalize_key).unwrap_or_default();
        Self {
            city_key,
            title_key,
            titles,
            poster_url: None,
            poster_path: None,
            theaters: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn display_title(&self) -> &str {
        canonical_title(&self.titles).unwrap_or(&self.title_key)
    }

    /// Latest local calendar day with a stored showtime.
    pub fn latest_showtime_day(&self) -> Option<NaiveDate> {
        self.theaters
            .iter()
            .flat_map(|t| t.showtimes.iter())
            .map(|s| s.start_time.date_naive())
            .max()
    }

    pub fn showtime_count(&self) -> usize {
        self.theaters.iter().map(|t| t.showtimes.len()).sum()
    }
}

/// New showings for one theater of a movie, addressed by the theater's
/// stored name and address. Written as an append so concurrent writers never
/// drop each other's showtimes.
#[derive(Debug, Clone, PartialEq)]
pub struct TheaterAppend {
    pub name: String,
    pub address: String,
    /// Filled only when the stored theater has none.
    pub website: Option<String>,
    pub showtimes: Vec<Showtime>,
}

impl TheaterAppend {
    /// Apply to an in-memory movie the way the store applies it to a document.
    pub fn apply_to(&self, movie: &mut Movie) {
        let theater = match movie
            .theaters
            .iter()
            .position(|t| t.name == self.name && t.address == self.address)
        {
            Some(idx) => &mut movie.theaters[idx],
            None => {
                movie.theaters.push(Theater {
                    name: self.name.clone(),
                    address: self.address.clone(),
                    website: None,
                    showtimes: Vec::new(),
                });
                let last = movie.theaters.len() - 1;
                &mut movie.theaters[last]
            }
        };
        if theater.website.is_none() {
            theater.website = self.website.clone();
        }
        theater.showtimes.extend(self.showtimes.iter().cloned());
        theater.showtimes.sort_by_key(|s| s.start_time);
    }
}

/// English title if present, else the first non-empty title in key order.
pub fn canonical_title(titles: &BTreeMap<String, String>) -> Option<&str> {
    titles
        .get("en")
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .or_else(|| {
            titles
                .values()
                .map(|t| t.trim())
                .find(|t| !t.is_empty())
        })
}

// ---------------------------------------------------------------------------
// Extraction candidates (step payloads)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TheaterCandidate {
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub website: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MovieCandidate {
    /// Titles keyed by language code.
    pub titles: BTreeMap<String, String>,
    #[serde(default)]
    pub poster_url: Option<String>,
}

impl MovieCandidate {
    pub fn title(&self) -> Option<&str> {
        canonical_title(&self.titles)
    }

    pub fn title_key(&self) -> Option<String> {
        self.title().map(normalize_key)
    }
}

/// Showtimes one theater reported for one movie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TheaterShowtimes {
    pub theater: TheaterCandidate,
    pub showtimes: Vec<Showtime>,
}
