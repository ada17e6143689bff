//! Breaks one scrape into small, independently retryable extraction steps.
//!
//! Order: one theater discovery, then movie discovery (retried while empty,
//! at most `MAX_EMPTY_MOVIE_DISCOVERIES` times), then one step per
//! (movie, day) in the plan. For `k` days and `m` movies that is
//! `2 + k * m` steps when nothing runs past the horizon.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use chrono::NaiveDate;
use tracing::{debug, info};

use cinestream_common::{
    normalize_key, CityKey, MovieCandidate, TheaterCandidate, EXTENSION_MAX_DAYS,
    MAX_EMPTY_MOVIE_DISCOVERIES,
};

use crate::extraction::StepPayload;
use crate::planner::ScrapePlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    TheaterDiscovery,
    MovieDiscovery,
    MovieDayExtraction,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepKind::TheaterDiscovery => "theater_discovery",
            StepKind::MovieDiscovery => "movie_discovery",
            StepKind::MovieDayExtraction => "movie_day",
        };
        f.write_str(name)
    }
}

/// What a step asks the extractor for, with the context it needs.
#[derive(Debug, Clone, PartialEq)]
pub enum StepTask {
    TheaterDiscovery,
    MovieDiscovery {
        theaters: Vec<TheaterCandidate>,
        attempt: u32,
    },
    MovieDay {
        movie: MovieCandidate,
        day: NaiveDate,
        theaters: Vec<TheaterCandidate>,
        /// First day past the planned range.
        horizon: NaiveDate,
        extension: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionStep {
    /// Position in execution order, starting at 0.
    pub index: usize,
    pub city: CityKey,
    pub task: StepTask,
}

impl ExtractionStep {
    pub fn kind(&self) -> StepKind {
        match self.task {
            StepTask::TheaterDiscovery => StepKind::TheaterDiscovery,
            StepTask::MovieDiscovery { .. } => StepKind::MovieDiscovery,
            StepTask::MovieDay { .. } => StepKind::MovieDayExtraction,
        }
    }

    pub fn day(&self) -> Option<NaiveDate> {
        match &self.task {
            StepTask::MovieDay { day, .. } => Some(*day),
            _ => None,
        }
    }

    pub fn movie(&self) -> Option<&MovieCandidate> {
        match &self.task {
            StepTask::MovieDay { movie, .. } => Some(movie),
            _ => None,
        }
    }
}

/// Step queue driven by what earlier steps returned.
///
/// Call `next_step`, execute it, then feed the result back through
/// `observe` before asking for the next one.
pub struct Decomposer {
    city: CityKey,
    plan: ScrapePlan,
    extension_max_days: usize,
    queue: VecDeque<StepTask>,
    issued: usize,
    theaters: Vec<TheaterCandidate>,
    movies: Vec<MovieCandidate>,
    empty_movie_discoveries: u32,
    scheduled: HashSet<(String, NaiveDate)>,
    extended: HashSet<String>,
}

impl Decomposer {
    pub fn new(city: CityKey, plan: ScrapePlan) -> Self {
        let mut queue = VecDeque::new();
        if !plan.is_empty() {
            queue.push_back(StepTask::TheaterDiscovery);
        }
        Self {
            city,
            plan,
            extension_max_days: EXTENSION_MAX_DAYS,
            queue,
            issued: 0,
            theaters: Vec::new(),
            movies: Vec::new(),
            empty_movie_discoveries: 0,
            scheduled: HashSet::new(),
            extended: HashSet::new(),
        }
    }

    pub fn with_extension_max_days(mut self, days: usize) -> Self {
        self.extension_max_days = days;
        self
    }

    pub fn next_step(&mut self) -> Option<ExtractionStep> {
        let task = self.queue.pop_front()?;
        let step = ExtractionStep {
            index: self.issued,
            city: self.city.clone(),
            task,
        };
        self.issued += 1;
        Some(step)
    }

    /// Steps handed out so far.
    pub fn issued(&self) -> usize {
        self.issued
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn theaters(&self) -> &[TheaterCandidate] {
        &self.theaters
    }

    pub fn movies(&self) -> &[MovieCandidate] {
        &self.movies
    }

    /// Feed a step's (possibly empty) result back in and queue follow-ups.
    pub fn observe(&mut self, step: &ExtractionStep, payload: &StepPayload) {
        match (&step.task, payload) {
            (StepTask::TheaterDiscovery, StepPayload::Theaters(found)) => {
                self.absorb_theaters(found);
                self.queue_movie_discovery(1);
            }
            (StepTask::TheaterDiscovery, _) => self.queue_movie_discovery(1),
            (StepTask::MovieDiscovery { attempt, .. }, StepPayload::Movies(found)) => {
                self.absorb_movies(found, *attempt);
            }
            (StepTask::MovieDiscovery { attempt, .. }, _) => self.absorb_movies(&[], *attempt),
            (StepTask::MovieDay { movie, .. }, StepPayload::Showtimes(reports)) => {
                let beyond: Vec<NaiveDate> = reports
                    .iter()
                    .flat_map(|r| r.showtimes.iter())
                    .map(|s| s.start_time.date_naive())
                    .filter(|d| *d >= self.plan.to)
                    .collect();
                self.queue_extension(movie, beyond);
            }
            (StepTask::MovieDay { .. }, _) => {}
        }
    }

    fn absorb_theaters(&mut self, found: &[TheaterCandidate]) {
        for theater in found {
            if theater.name.trim().is_empty() {
                continue;
            }
            let duplicate = self.theaters.iter().any(|t| {
                normalize_key(&t.name) == normalize_key(&theater.name)
                    && normalize_key(&t.address) == normalize_key(&theater.address)
            });
            if !duplicate {
                self.theaters.push(theater.clone());
            }
        }
        info!(city = %self.city, theaters = self.theaters.len(), "Theaters discovered");
    }

    fn queue_movie_discovery(&mut self, attempt: u32) {
        self.queue.push_back(StepTask::MovieDiscovery {
            theaters: self.theaters.clone(),
            attempt,
        });
    }

    fn absorb_movies(&mut self, found: &[MovieCandidate], attempt: u32) {
        let mut seen: HashSet<String> = self.movies.iter().filter_map(|m| m.title_key()).collect();
        let before = self.movies.len();
        for movie in found {
            if let Some(key) = movie.title_key() {
                if seen.insert(key) {
                    self.movies.push(movie.clone());
                }
            }
        }
        let new_movies: Vec<MovieCandidate> = self.movies[before..].to_vec();

        if new_movies.is_empty() {
            self.empty_movie_discoveries += 1;
            if self.empty_movie_discoveries < MAX_EMPTY_MOVIE_DISCOVERIES {
                info!(city = %self.city, attempt, "Movie discovery came back empty, retrying");
                self.queue_movie_discovery(attempt + 1);
            } else {
                info!(city = %self.city, attempt, "Movie discovery exhausted, no movies to scrape");
            }
            return;
        }

        info!(city = %self.city, movies = new_movies.len(), days = self.plan.len_days(), "Movies discovered");
        let days: Vec<NaiveDate> = self.plan.days().collect();
        for movie in &new_movies {
            for day in &days {
                self.queue_movie_day(movie, *day);
            }
        }
    }

    fn queue_movie_day(&mut self, movie: &MovieCandidate, day: NaiveDate) -> bool {
        let Some(key) = movie.title_key() else {
            return false;
        };
        if !self.scheduled.insert((key, day)) {
            return false;
        }
        self.queue.push_back(StepTask::MovieDay {
            movie: movie.clone(),
            day,
            theaters: self.theaters.clone(),
            horizon: self.plan.to,
            extension: self.plan.extension,
        });
        true
    }

    /// One extension pass per movie, capped at `extension_max_days` days.
    fn queue_extension(&mut self, movie: &MovieCandidate, mut beyond: Vec<NaiveDate>) {
        let Some(key) = movie.title_key() else {
            return;
        };
        if beyond.is_empty() || self.extended.contains(&key) {
            return;
        }
        beyond.sort();
        beyond.dedup();

        let mut queued = 0;
        for day in beyond.into_iter().take(self.extension_max_days) {
            if self.queue_movie_day(movie, day) {
                queued += 1;
            }
        }
        self.extended.insert(key);
        if queued > 0 {
            debug!(city = %self.city, title = movie.title().unwrap_or_default(), queued, "Extending past horizon");
        }
    }
}
