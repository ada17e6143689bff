use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cinestream_common::{CityKey, LocationStatus};

use crate::clock::Clock;
use crate::decomposer::Decomposer;
use crate::extraction::{ExtractionClient, StepPayload};
use crate::lock::{LockLease, LockManager};
use crate::merge::{MergeEngine, MergeStats};
use crate::planner::RangePlanner;
use crate::posters::PosterCache;
use crate::settings::ScrapeSettings;
use crate::traits::{LocationStore, MovieStore};

/// Lifecycle of one city scrape.
///
/// `Idle → Locking → Planning → Decomposing → (Executing(i) → Merging(i))* →
/// Releasing → Done`. Any error after `Locking` goes through `Releasing`
/// before `Failed`, so an acquired lock is always released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeState {
    Idle,
    Locking,
    Planning,
    Decomposing,
    Executing(usize),
    Merging(usize),
    Releasing,
    Done,
    Failed,
}

impl ScrapeState {
    pub fn can_advance_to(self, next: ScrapeState) -> bool {
        use ScrapeState::*;
        match (self, next) {
            (Idle, Locking) => true,
            // Lock not acquired, or the store failed before anything was held.
            (Locking, Planning | Done | Failed) => true,
            (Planning, Decomposing | Releasing) => true,
            (Decomposing, Executing(0) | Releasing) => true,
            (Executing(i), Merging(j)) => i == j,
            (Executing(_), Releasing) => true,
            (Merging(i), Executing(j)) => j == i + 1,
            (Merging(_), Releasing) => true,
            (Releasing, Done | Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScrapeState::Done | ScrapeState::Failed)
    }
}

impl fmt::Display for ScrapeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrapeState::Executing(i) => write!(f, "executing({i})"),
            ScrapeState::Merging(i) => write!(f, "merging({i})"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// Stats from one city scrape.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScrapeStats {
    pub plan_days: i64,
    pub extension: bool,
    pub steps_executed: u32,
    pub steps_failed: u32,
    pub theaters_discovered: u32,
    pub movies_discovered: u32,
    pub merge: MergeStats,
}

impl fmt::Display for ScrapeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Scrape Complete ===")?;
        writeln!(f, "Days planned:       {}{}", self.plan_days, if self.extension { " (extension)" } else { "" })?;
        writeln!(f, "Steps executed:     {}", self.steps_executed)?;
        writeln!(f, "Steps failed:       {}", self.steps_failed)?;
        writeln!(f, "Theaters found:     {}", self.theaters_discovered)?;
        writeln!(f, "Movies found:       {}", self.movies_discovered)?;
        writeln!(f, "Movies created:     {}", self.merge.movies_created)?;
        writeln!(f, "Theaters added:     {}", self.merge.theaters_added)?;
        writeln!(f, "Showtimes added:    {}", self.merge.showtimes_added)?;
        writeln!(f, "Showtimes deduped:  {}", self.merge.showtimes_duplicate)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeOutcome {
    /// Another worker holds a live lock for the city.
    AlreadyInProgress,
    /// Stored coverage already reaches the horizon.
    UpToDate,
    Completed(ScrapeStats),
}

/// Logs and checks every state change of one run.
struct StateTracker<'a> {
    run_id: Uuid,
    city: &'a CityKey,
    state: ScrapeState,
}

impl<'a> StateTracker<'a> {
    fn new(run_id: Uuid, city: &'a CityKey) -> Self {
        Self {
            run_id,
            city,
            state: ScrapeState::Idle,
        }
    }

    fn advance(&mut self, next: ScrapeState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal scrape transition {} -> {}",
            self.state,
            next
        );
        debug!(run_id = %self.run_id, city = %self.city, from = %self.state, to = %next, "Scrape state");
        self.state = next;
    }
}

/// Drives one city scrape from lock to release.
///
/// Single-threaded per city: steps run one after another and each merge
/// completes before the next step starts.
pub struct Orchestrator {
    locks: LockManager,
    planner: RangePlanner,
    merger: MergeEngine,
    extractor: Arc<dyn ExtractionClient>,
    clock: Arc<dyn Clock>,
    settings: ScrapeSettings,
}

impl Orchestrator {
    pub fn new(
        locations: Arc<dyn LocationStore>,
        movies: Arc<dyn MovieStore>,
        extractor: Arc<dyn ExtractionClient>,
        clock: Arc<dyn Clock>,
        settings: ScrapeSettings,
    ) -> Self {
        Self {
            locks: LockManager::new(locations, settings.lock_timeout),
            planner: RangePlanner::new(
                movies.clone(),
                settings.horizon_days,
                settings.extension_margin_days,
            ),
            merger: MergeEngine::new(movies),
            extractor,
            clock,
            settings,
        }
    }

    pub fn with_posters(mut self, posters: PosterCache) -> Self {
        self.merger = self.merger.with_posters(posters);
        self
    }

    pub fn settings(&self) -> &ScrapeSettings {
        &self.settings
    }

    /// Scrape `city` if no one else is. Errors mean the scrape failed and the
    /// location was released as stale (or the lock could not be attempted).
    pub async fn run(&self, city: &CityKey) -> Result<ScrapeOutcome> {
        let run_id = Uuid::new_v4();
        let mut tracker = StateTracker::new(run_id, city);

        tracker.advance(ScrapeState::Locking);
        let mut lease = match self.locks.acquire(city, self.clock.now()).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracker.advance(ScrapeState::Done);
                return Ok(ScrapeOutcome::AlreadyInProgress);
            }
            Err(e) => {
                tracker.advance(ScrapeState::Failed);
                error!(run_id = %run_id, city = %city, error = %e, "Lock acquisition failed");
                return Err(e).context("Failed to acquire scrape lock");
            }
        };

        info!(run_id = %run_id, city = %city, "Scrape started");
        let result = self.run_locked(city, &mut lease, &mut tracker).await;

        tracker.advance(ScrapeState::Releasing);
        let status = if result.is_ok() {
            LocationStatus::Fresh
        } else {
            LocationStatus::Stale
        };
        let released = self.locks.release(lease, status, self.clock.now()).await;

        match (result, released) {
            (Ok(outcome), Ok(true)) => {
                tracker.advance(ScrapeState::Done);
                match &outcome {
                    ScrapeOutcome::Completed(stats) => info!(
                        run_id = %run_id,
                        city = %city,
                        steps = stats.steps_executed,
                        failed_steps = stats.steps_failed,
                        showtimes_added = stats.merge.showtimes_added,
                        "Scrape finished"
                    ),
                    _ => info!(run_id = %run_id, city = %city, "Scrape finished, nothing to do"),
                }
                Ok(outcome)
            }
            (Ok(_), Ok(false)) => {
                tracker.advance(ScrapeState::Failed);
                error!(run_id = %run_id, city = %city, "Scrape lock lost before release");
                Err(anyhow!("Scrape lock for {city} was lost before release"))
            }
            (Ok(_), Err(e)) => {
                tracker.advance(ScrapeState::Failed);
                error!(run_id = %run_id, city = %city, error = %e, "Failed to release scrape lock");
                Err(e).context("Failed to release scrape lock")
            }
            (Err(e), released) => {
                tracker.advance(ScrapeState::Failed);
                if let Err(release_err) = released {
                    error!(run_id = %run_id, city = %city, error = %release_err, "Failed to release scrape lock");
                }
                error!(run_id = %run_id, city = %city, error = %e, "Scrape failed");
                Err(e)
            }
        }
    }

    async fn run_locked(
        &self,
        city: &CityKey,
        lease: &mut LockLease,
        tracker: &mut StateTracker<'_>,
    ) -> Result<ScrapeOutcome> {
        tracker.advance(ScrapeState::Planning);
        let plan = self
            .planner
            .plan(city, self.clock.now().date_naive())
            .await
            .context("Range planning failed")?;
        if plan.is_empty() {
            return Ok(ScrapeOutcome::UpToDate);
        }

        tracker.advance(ScrapeState::Decomposing);
        let mut decomposer = Decomposer::new(city.clone(), plan)
            .with_extension_max_days(self.settings.extension_max_days);
        let mut stats = ScrapeStats {
            plan_days: plan.len_days(),
            extension: plan.extension,
            ..Default::default()
        };

        while let Some(step) = decomposer.next_step() {
            tracker.advance(ScrapeState::Executing(step.index));
            let kind = step.kind();
            let payload = match self.extractor.execute(&step).await {
                Ok(payload) if payload.kind() == kind => payload,
                Ok(payload) => {
                    warn!(city = %city, step = step.index, expected = %kind, got = %payload.kind(), "Non-conforming step result, treating as empty");
                    stats.steps_failed += 1;
                    StepPayload::empty_for(kind)
                }
                Err(e) => {
                    warn!(city = %city, step = step.index, kind = %kind, error = %e, "Extraction step failed, treating as empty");
                    stats.steps_failed += 1;
                    StepPayload::empty_for(kind)
                }
            };
            stats.steps_executed += 1;

            // Merges only happen under a live lease; a lapsed one may already
            // belong to another worker.
            if !self.locks.renew(lease, self.clock.now()).await? {
                bail!("Scrape lock for {city} lost during step {}", step.index);
            }

            tracker.advance(ScrapeState::Merging(step.index));
            let merged = self
                .merger
                .merge(city, &step, &payload, self.clock.now())
                .await
                .with_context(|| format!("Merge failed at step {}", step.index))?;
            stats.merge.absorb(merged);
            decomposer.observe(&step, &payload);
        }

        stats.theaters_discovered = decomposer.theaters().len() as u32;
        stats.movies_discovered = decomposer.movies().len() as u32;
        Ok(ScrapeOutcome::Completed(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::ScrapeState::*;
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        let path = [
            Idle,
            Locking,
            Planning,
            Decomposing,
            Executing(0),
            Merging(0),
            Executing(1),
            Merging(1),
            Releasing,
            Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn steps_cannot_be_skipped_or_reordered() {
        assert!(!Executing(0).can_advance_to(Merging(1)));
        assert!(!Merging(0).can_advance_to(Executing(2)));
        assert!(!Decomposing.can_advance_to(Executing(1)));
        assert!(!Planning.can_advance_to(Done));
        assert!(!Merging(3).can_advance_to(Done));
    }

    #[test]
    fn failures_pass_through_releasing() {
        assert!(Executing(4).can_advance_to(Releasing));
        assert!(Releasing.can_advance_to(Failed));
        assert!(!Executing(4).can_advance_to(Failed));
        assert!(Failed.is_terminal());
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(Executing(3).to_string(), "executing(3)");
        assert_eq!(Releasing.to_string(), "releasing");
    }
}
