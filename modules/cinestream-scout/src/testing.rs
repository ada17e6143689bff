// Test doubles for the scrape engine.
//
// - MemoryStore (LocationStore + MovieStore): Mutex-guarded in-memory state;
//   the lock compare-and-set runs entirely under the mutex.
// - ScriptedExtractor (ExtractionClient): canned payloads per step kind,
//   records every step it is asked to run.
// - FixedClock (Clock): settable time.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};

use cinestream_common::{
    CityKey, Location, LocationStatus, Movie, MovieCandidate, Showtime, TheaterAppend,
    TheaterCandidate, TheaterShowtimes,
};

use crate::clock::Clock;
use crate::decomposer::{ExtractionStep, StepKind};
use crate::extraction::{ExtractionClient, ExtractionError, StepPayload};
use crate::traits::{LocationStore, MovieStore};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    locations: BTreeMap<CityKey, Location>,
    movies: BTreeMap<(CityKey, String), Movie>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_movie_writes: AtomicBool,
    fail_location_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_movie(self, movie: Movie) -> Self {
        self.insert_movie(movie);
        self
    }

    pub fn with_location(self, location: Location) -> Self {
        self.state
            .lock()
            .unwrap()
            .locations
            .insert(location.city_key.clone(), location);
        self
    }

    pub fn insert_movie(&self, movie: Movie) {
        self.state
            .lock()
            .unwrap()
            .movies
            .insert((movie.city_key.clone(), movie.title_key.clone()), movie);
    }

    /// Make every subsequent movie write fail.
    pub fn fail_movie_writes(&self, fail: bool) {
        self.fail_movie_writes.store(fail, Ordering::SeqCst);
    }

    fn check_movie_writes(&self) -> Result<()> {
        if self.fail_movie_writes.load(Ordering::SeqCst) {
            bail!("MemoryStore: movie writes disabled");
        }
        Ok(())
    }

    /// Make every subsequent lock renewal and release fail.
    pub fn fail_location_writes(&self, fail: bool) {
        self.fail_location_writes.store(fail, Ordering::SeqCst);
    }

    pub fn movies(&self, city: &CityKey) -> Vec<Movie> {
        self.state
            .lock()
            .unwrap()
            .movies
            .values()
            .filter(|m| &m.city_key == city)
            .cloned()
            .collect()
    }

    pub fn movie(&self, city: &CityKey, title_key: &str) -> Option<Movie> {
        self.state
            .lock()
            .unwrap()
            .movies
            .get(&(city.clone(), title_key.to_string()))
            .cloned()
    }

    pub fn location_snapshot(&self, city: &CityKey) -> Option<Location> {
        self.state.lock().unwrap().locations.get(city).cloned()
    }
}

#[async_trait]
impl LocationStore for MemoryStore {
    async fn try_acquire_lock(
        &self,
        city: &CityKey,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if let Some(location) = state.locations.get_mut(city) {
            let free = location.status != LocationStatus::Processing
                || location
                    .lock_acquired_at
                    .map_or(true, |acquired| acquired < now - timeout);
            if free {
                location.status = LocationStatus::Processing;
                location.lock_acquired_at = Some(now);
            }
            return Ok(free);
        }

        let mut names = BTreeMap::new();
        names.insert("en".to_string(), city.city().to_string());
        state.locations.insert(
            city.clone(),
            Location {
                city_key: city.clone(),
                names,
                geo: None,
                status: LocationStatus::Processing,
                last_updated: None,
                lock_acquired_at: Some(now),
                created_at: now,
            },
        );
        Ok(true)
    }

    async fn renew_lock(
        &self,
        city: &CityKey,
        held_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if self.fail_location_writes.load(Ordering::SeqCst) {
            bail!("MemoryStore: location writes disabled");
        }
        let mut state = self.state.lock().unwrap();
        match state.locations.get_mut(city) {
            Some(location) if location.is_held_since(held_since) => {
                location.lock_acquired_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(
        &self,
        city: &CityKey,
        held_since: DateTime<Utc>,
        status: LocationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if self.fail_location_writes.load(Ordering::SeqCst) {
            bail!("MemoryStore: location writes disabled");
        }
        let mut state = self.state.lock().unwrap();
        match state.locations.get_mut(city) {
            Some(location) if location.is_held_since(held_since) => {
                location.status = status;
                location.lock_acquired_at = None;
                if status == LocationStatus::Fresh {
                    location.last_updated = Some(now);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn location(&self, city: &CityKey) -> Result<Option<Location>> {
        Ok(self.location_snapshot(city))
    }

    async fn list_locations(&self) -> Result<Vec<Location>> {
        Ok(self.state.lock().unwrap().locations.values().cloned().collect())
    }
}

#[async_trait]
impl MovieStore for MemoryStore {
    async fn movies_for_city(&self, city: &CityKey) -> Result<Vec<Movie>> {
        Ok(self.movies(city))
    }

    async fn find_movie(&self, city: &CityKey, title_key: &str) -> Result<Option<Movie>> {
        Ok(self.movie(city, title_key))
    }

    async fn insert_movie(&self, movie: &Movie) -> Result<bool> {
        self.check_movie_writes()?;
        let mut state = self.state.lock().unwrap();
        let key = (movie.city_key.clone(), movie.title_key.clone());
        if state.movies.contains_key(&key) {
            return Ok(false);
        }
        state.movies.insert(key, movie.clone());
        Ok(true)
    }

    async fn update_movie_metadata(&self, movie: &Movie) -> Result<()> {
        self.check_movie_writes()?;
        let mut state = self.state.lock().unwrap();
        if let Some(stored) = state
            .movies
            .get_mut(&(movie.city_key.clone(), movie.title_key.clone()))
        {
            stored.titles = movie.titles.clone();
            stored.poster_url = movie.poster_url.clone();
            stored.poster_path = movie.poster_path.clone();
            stored.updated_at = movie.updated_at;
        }
        Ok(())
    }

    async fn append_showtimes(
        &self,
        city: &CityKey,
        title_key: &str,
        append: &TheaterAppend,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_movie_writes()?;
        let mut state = self.state.lock().unwrap();
        let Some(stored) = state.movies.get_mut(&(city.clone(), title_key.to_string())) else {
            return Ok(false);
        };
        append.apply_to(stored);
        stored.updated_at = now;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// ScriptedExtractor
// ---------------------------------------------------------------------------

/// Canned extraction results. Unscripted steps return an empty payload.
/// Builder pattern: `.on_theaters()`, `.on_movies()`, `.on_showtimes()`,
/// `.failing_day()`, `.wrong_shape_for()`.
#[derive(Default)]
pub struct ScriptedExtractor {
    theaters: Vec<TheaterCandidate>,
    movie_rounds: Mutex<VecDeque<Vec<MovieCandidate>>>,
    showtimes: HashMap<(String, NaiveDate), Vec<TheaterShowtimes>>,
    failing_days: HashSet<(String, NaiveDate)>,
    failing_kinds: HashSet<StepKind>,
    wrong_shape: HashSet<StepKind>,
    calls: Mutex<Vec<ExtractionStep>>,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_theaters(mut self, theaters: Vec<TheaterCandidate>) -> Self {
        self.theaters = theaters;
        self
    }

    /// Each call queues one movie discovery answer; the last one repeats.
    pub fn on_movies(self, movies: Vec<MovieCandidate>) -> Self {
        self.movie_rounds.lock().unwrap().push_back(movies);
        self
    }

    pub fn on_showtimes(mut self, title: &str, day: NaiveDate, reports: Vec<TheaterShowtimes>) -> Self {
        self.showtimes
            .entry((cinestream_common::normalize_key(title), day))
            .or_default()
            .extend(reports);
        self
    }

    pub fn failing_day(mut self, title: &str, day: NaiveDate) -> Self {
        self.failing_days
            .insert((cinestream_common::normalize_key(title), day));
        self
    }

    pub fn failing(mut self, kind: StepKind) -> Self {
        self.failing_kinds.insert(kind);
        self
    }

    pub fn wrong_shape_for(mut self, kind: StepKind) -> Self {
        self.wrong_shape.insert(kind);
        self
    }

    pub fn calls(&self) -> Vec<ExtractionStep> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, kind: StepKind) -> usize {
        self.calls.lock().unwrap().iter().filter(|s| s.kind() == kind).count()
    }

    fn next_movies(&self) -> Vec<MovieCandidate> {
        let mut rounds = self.movie_rounds.lock().unwrap();
        if rounds.len() > 1 {
            rounds.pop_front().unwrap_or_default()
        } else {
            rounds.front().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl ExtractionClient for ScriptedExtractor {
    async fn execute(&self, step: &ExtractionStep) -> Result<StepPayload, ExtractionError> {
        self.calls.lock().unwrap().push(step.clone());
        let kind = step.kind();

        if self.failing_kinds.contains(&kind) {
            return Err(ExtractionError::Upstream(format!("scripted failure for {kind}")));
        }
        if self.wrong_shape.contains(&kind) {
            return Ok(match kind {
                StepKind::TheaterDiscovery => StepPayload::Movies(Vec::new()),
                _ => StepPayload::Theaters(self.theaters.clone()),
            });
        }

        match kind {
            StepKind::TheaterDiscovery => Ok(StepPayload::Theaters(self.theaters.clone())),
            StepKind::MovieDiscovery => Ok(StepPayload::Movies(self.next_movies())),
            StepKind::MovieDayExtraction => {
                let (Some(movie), Some(day)) = (step.movie(), step.day()) else {
                    return Err(ExtractionError::Malformed("movie day step without movie".into()));
                };
                let key = (movie.title_key().unwrap_or_default(), day);
                if self.failing_days.contains(&key) {
                    return Err(ExtractionError::Timeout(std::time::Duration::from_secs(120)));
                }
                Ok(StepPayload::Showtimes(
                    self.showtimes.get(&key).cloned().unwrap_or_default(),
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FixedClock
// ---------------------------------------------------------------------------

pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn city(raw: &str) -> CityKey {
    CityKey::parse(raw).unwrap()
}

pub fn theater(name: &str, address: &str) -> TheaterCandidate {
    TheaterCandidate {
        name: name.to_string(),
        address: address.to_string(),
        website: None,
    }
}

pub fn movie_candidate(en: &str, local: Option<&str>) -> MovieCandidate {
    let mut titles = BTreeMap::new();
    titles.insert("en".to_string(), en.to_string());
    if let Some(local) = local {
        titles.insert("local".to_string(), local.to_string());
    }
    MovieCandidate {
        titles,
        poster_url: None,
    }
}

/// Showtime at `hour:minute` local time on `day` in a `utc_offset_hours` zone.
pub fn showtime_at(day: NaiveDate, hour: u32, minute: u32, utc_offset_hours: i32, hall: Option<&str>) -> Showtime {
    let offset = FixedOffset::east_opt(utc_offset_hours * 3600).unwrap();
    Showtime {
        start_time: offset
            .from_local_datetime(&day.and_hms_opt(hour, minute, 0).unwrap())
            .unwrap(),
        format: Some("2D".to_string()),
        language: None,
        hall: hall.map(String::from),
    }
}

pub fn report(theater: TheaterCandidate, showtimes: Vec<Showtime>) -> TheaterShowtimes {
    TheaterShowtimes { theater, showtimes }
}

/// Stored movie with one theater and one showtime per given day.
pub fn stored_movie(
    city: &CityKey,
    en: &str,
    theater_name: &str,
    days: &[NaiveDate],
    now: DateTime<Utc>,
) -> Movie {
    let candidate = movie_candidate(en, None);
    let mut movie = Movie::new(city.clone(), candidate.titles, now);
    movie.theaters.push(cinestream_common::Theater {
        name: theater_name.to_string(),
        address: String::new(),
        website: None,
        showtimes: days.iter().map(|d| showtime_at(*d, 19, 0, 2, None)).collect(),
    });
    movie
}
