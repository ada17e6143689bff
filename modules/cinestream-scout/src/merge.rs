//! Idempotent merge of step results into movie-centric documents.
//!
//! Theater identity is normalized (name, address); showtime identity is
//! (start instant, normalized hall). Everything else on a showtime is
//! informational and never creates a second entry.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cinestream_common::{CityKey, Movie, MovieCandidate, Theater, TheaterAppend, TheaterShowtimes};

use crate::decomposer::{ExtractionStep, StepTask};
use crate::extraction::StepPayload;
use crate::posters::PosterCache;
use crate::traits::MovieStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub movies_created: u32,
    pub movies_updated: u32,
    pub theaters_added: u32,
    pub showtimes_added: u32,
    pub showtimes_duplicate: u32,
}

impl MergeStats {
    pub fn absorb(&mut self, other: MergeStats) {
        self.movies_created += other.movies_created;
        self.movies_updated += other.movies_updated;
        self.theaters_added += other.theaters_added;
        self.showtimes_added += other.showtimes_added;
        self.showtimes_duplicate += other.showtimes_duplicate;
    }
}

/// Sole writer of Movie documents.
pub struct MergeEngine {
    movies: Arc<dyn MovieStore>,
    posters: Option<PosterCache>,
}

impl MergeEngine {
    pub fn new(movies: Arc<dyn MovieStore>) -> Self {
        Self {
            movies,
            posters: None,
        }
    }

    pub fn with_posters(mut self, posters: PosterCache) -> Self {
        self.posters = Some(posters);
        self
    }

    /// Merge one step's payload. Theater discovery only feeds the
    /// decomposer, so it writes nothing.
    pub async fn merge(
        &self,
        city: &CityKey,
        step: &ExtractionStep,
        payload: &StepPayload,
        now: DateTime<Utc>,
    ) -> Result<MergeStats> {
        match (payload, &step.task) {
            (StepPayload::Theaters(_), _) => Ok(MergeStats::default()),
            (StepPayload::Movies(candidates), _) => self.merge_movies(city, candidates, now).await,
            (StepPayload::Showtimes(reports), StepTask::MovieDay { movie, .. }) => {
                self.merge_showtimes(city, movie, reports, now).await
            }
            (StepPayload::Showtimes(_), _) => {
                warn!(city = %city, step = step.index, "Showtimes payload outside a movie-day step, ignoring");
                Ok(MergeStats::default())
            }
        }
    }

    async fn merge_movies(
        &self,
        city: &CityKey,
        candidates: &[MovieCandidate],
        now: DateTime<Utc>,
    ) -> Result<MergeStats> {
        let mut stats = MergeStats::default();
        for candidate in candidates {
            let Some(title_key) = candidate.title_key() else {
                continue;
            };
            let Some(mut movie) = self.movies.find_movie(city, &title_key).await? else {
                let mut movie = new_movie(city, candidate, now);
                self.attach_poster(&mut movie).await;
                if self.movies.insert_movie(&movie).await? {
                    stats.movies_created += 1;
                }
                continue;
            };

            let mut changed = apply_discovery(&mut movie, candidate);
            changed |= self.attach_poster(&mut movie).await;
            if !changed {
                continue;
            }
            movie.updated_at = now;
            self.movies.update_movie_metadata(&movie).await?;
            stats.movies_updated += 1;
        }
        Ok(stats)
    }

    async fn merge_showtimes(
        &self,
        city: &CityKey,
        candidate: &MovieCandidate,
        reports: &[TheaterShowtimes],
        now: DateTime<Utc>,
    ) -> Result<MergeStats> {
        if reports.is_empty() {
            return Ok(MergeStats::default());
        }
        let Some(title_key) = candidate.title_key() else {
            return Ok(MergeStats::default());
        };

        let (movie, created) = match self.movies.find_movie(city, &title_key).await? {
            Some(existing) => (existing, false),
            None => {
                info!(city = %city, title = candidate.title().unwrap_or_default(), "Creating movie missing from discovery");
                let mut movie = new_movie(city, candidate, now);
                self.attach_poster(&mut movie).await;
                if self.movies.insert_movie(&movie).await? {
                    (movie, true)
                } else {
                    let existing = self.movies.find_movie(city, &title_key).await?;
                    (existing.with_context(|| format!("Movie {title_key:?} vanished during merge"))?, false)
                }
            }
        };

        let (appends, mut stats) = showtime_appends(&movie, reports);
        for append in &appends {
            if !self
                .movies
                .append_showtimes(city, &movie.title_key, append, now)
                .await?
            {
                warn!(city = %city, title = movie.display_title(), "Movie disappeared before showtimes were appended");
                break;
            }
        }
        if created {
            stats.movies_created += 1;
        } else if !appends.is_empty() {
            stats.movies_updated += 1;
        }

        debug!(
            city = %city,
            title = movie.display_title(),
            added = stats.showtimes_added,
            duplicates = stats.showtimes_duplicate,
            "Showtimes merged"
        );
        Ok(stats)
    }

    /// Fill `poster_path` from the cache. Failures are logged and leave the
    /// movie untouched.
    async fn attach_poster(&self, movie: &mut Movie) -> bool {
        let Some(posters) = &self.posters else {
            return false;
        };
        if movie.poster_path.is_some() {
            return false;
        }
        let Some(url) = movie.poster_url.clone() else {
            return false;
        };
        match posters.fetch(&url, Some(movie.display_title())).await {
            Ok(Some(path)) => {
                movie.poster_path = Some(path);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(title = movie.display_title(), error = %e, "Poster download failed");
                false
            }
        }
    }
}

fn new_movie(city: &CityKey, candidate: &MovieCandidate, now: DateTime<Utc>) -> Movie {
    let mut movie = Movie::new(city.clone(), candidate.titles.clone(), now);
    movie.poster_url = candidate.poster_url.clone();
    movie
}

/// Fill titles and poster URL the stored movie lacks. Never overwrites.
pub fn apply_discovery(movie: &mut Movie, candidate: &MovieCandidate) -> bool {
    let mut changed = false;
    for (lang, title) in &candidate.titles {
        if title.trim().is_empty() {
            continue;
        }
        let slot = movie.titles.entry(lang.clone()).or_default();
        if slot.trim().is_empty() {
            *slot = title.clone();
            changed = true;
        }
    }
    if movie.poster_url.is_none() && candidate.poster_url.is_some() {
        movie.poster_url = candidate.poster_url.clone();
        changed = true;
    }
    changed
}

/// Work out which reported showtimes the stored movie lacks, grouped per
/// theater. Theaters are matched on normalized name and address and
/// addressed by their stored spelling; a new theater comes from its first
/// report.
pub fn showtime_appends(movie: &Movie, reports: &[TheaterShowtimes]) -> (Vec<TheaterAppend>, MergeStats) {
    let mut stats = MergeStats::default();
    let mut known = movie.theaters.clone();
    let mut appends: Vec<TheaterAppend> = Vec::new();

    for report in reports {
        let candidate = &report.theater;
        if candidate.name.trim().is_empty() || report.showtimes.is_empty() {
            continue;
        }

        let idx = match known
            .iter()
            .position(|t| t.matches(&candidate.name, &candidate.address))
        {
            Some(idx) => idx,
            None => {
                known.push(Theater {
                    name: candidate.name.clone(),
                    address: candidate.address.clone(),
                    website: None,
                    showtimes: Vec::new(),
                });
                stats.theaters_added += 1;
                known.len() - 1
            }
        };
        let theater = &mut known[idx];

        let slot = match appends
            .iter()
            .position(|a| a.name == theater.name && a.address == theater.address)
        {
            Some(slot) => slot,
            None => {
                appends.push(TheaterAppend {
                    name: theater.name.clone(),
                    address: theater.address.clone(),
                    website: None,
                    showtimes: Vec::new(),
                });
                appends.len() - 1
            }
        };
        let append = &mut appends[slot];

        if theater.website.is_none() && candidate.website.is_some() {
            theater.website = candidate.website.clone();
            append.website = candidate.website.clone();
        }
        for showtime in &report.showtimes {
            if theater.showtimes.iter().any(|s| s.same_showing(showtime)) {
                stats.showtimes_duplicate += 1;
            } else {
                theater.showtimes.push(showtime.clone());
                append.showtimes.push(showtime.clone());
                stats.showtimes_added += 1;
            }
        }
    }

    appends.retain(|a| !a.showtimes.is_empty() || a.website.is_some());
    (appends, stats)
}

/// In-memory counterpart of the store appends.
pub fn apply_showtimes(movie: &mut Movie, reports: &[TheaterShowtimes]) -> MergeStats {
    let (appends, stats) = showtime_appends(movie, reports);
    for append in &appends {
        append.apply_to(movie);
    }
    stats
}
