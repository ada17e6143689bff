//! End-to-end scrape runs against the in-memory store and scripted extractor.
//!
//! No network, no database: `cargo test -p cinestream-scout`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};

use cinestream_common::{CityKey, LocationStatus};
use cinestream_scout::testing::{
    city, movie_candidate, report, showtime_at, stored_movie, theater, FixedClock, MemoryStore,
    ScriptedExtractor,
};
use cinestream_scout::{
    Clock, ExtractionClient, ExtractionError, ExtractionStep, LockManager, Orchestrator,
    ScrapeOutcome, ScrapeSettings, StepKind, StepPayload,
};

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn morning_of_dec_19() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 12, 19, 8, 0, 0).unwrap(),
    ))
}

fn orchestrator(
    store: &Arc<MemoryStore>,
    extractor: &Arc<ScriptedExtractor>,
    clock: &Arc<FixedClock>,
) -> Orchestrator {
    Orchestrator::new(
        store.clone(),
        store.clone(),
        extractor.clone(),
        clock.clone(),
        ScrapeSettings::default(),
    )
}

/// Two Kyiv theaters, one movie. Multiplex shows it twice a day, Kyiv Cinema
/// every other day, and the Dec 20 listing repeats a Dec 19 showing.
fn kyiv_extractor(days: &[NaiveDate]) -> ScriptedExtractor {
    let multiplex = theater("Multiplex", "Lavina Mall");
    let kyiv_cinema = theater("Kyiv Cinema", "Velyka Vasylkivska 19");

    let mut extractor = ScriptedExtractor::new()
        .on_theaters(vec![multiplex.clone(), kyiv_cinema.clone()])
        .on_movies(vec![movie_candidate("Avatar 2", Some("Аватар 2"))]);

    for (i, d) in days.iter().enumerate() {
        let mut multiplex_times = vec![
            showtime_at(*d, 18, 0, 2, Some("Hall 5")),
            showtime_at(*d, 21, 0, 2, None),
        ];
        if *d == day(2025, 12, 20) {
            multiplex_times.push(showtime_at(day(2025, 12, 19), 18, 0, 2, Some("hall 5")));
        }
        let mut reports = vec![report(multiplex.clone(), multiplex_times)];
        if i % 2 == 0 {
            reports.push(report(kyiv_cinema.clone(), vec![showtime_at(*d, 19, 30, 2, None)]));
        }
        extractor = extractor.on_showtimes("Avatar 2", *d, reports);
    }
    extractor
}

#[tokio::test]
async fn kyiv_first_scrape_builds_one_movie_without_duplicates() {
    let clock = morning_of_dec_19();
    let store = Arc::new(MemoryStore::new());
    let days: Vec<NaiveDate> = (0..14).map(|i| day(2025, 12, 19) + Duration::days(i)).collect();
    let extractor = Arc::new(kyiv_extractor(&days));
    let kyiv = city("Kyiv, Ukraine");

    let outcome = orchestrator(&store, &extractor, &clock).run(&kyiv).await.unwrap();

    let ScrapeOutcome::Completed(stats) = outcome else {
        panic!("expected a completed scrape, got {outcome:?}");
    };
    assert_eq!(stats.plan_days, 14);
    assert_eq!(stats.steps_executed, 16);
    assert_eq!(stats.steps_failed, 0);
    assert_eq!(stats.theaters_discovered, 2);
    assert_eq!(stats.movies_discovered, 1);
    assert_eq!(stats.merge.movies_created, 1);
    assert_eq!(stats.merge.showtimes_duplicate, 1);

    let calls = extractor.calls();
    assert_eq!(calls.len(), 16);
    assert_eq!(calls[0].kind(), StepKind::TheaterDiscovery);
    assert_eq!(calls[1].kind(), StepKind::MovieDiscovery);
    let planned: Vec<_> = calls.iter().filter_map(|s| s.day()).collect();
    assert_eq!(planned, days);

    let movies = store.movies(&kyiv);
    assert_eq!(movies.len(), 1);
    let avatar = &movies[0];
    assert_eq!(avatar.title_key, "avatar 2");
    assert_eq!(avatar.titles["local"], "Аватар 2");
    assert_eq!(avatar.theaters.len(), 2);

    let multiplex = avatar.theaters.iter().find(|t| t.name == "Multiplex").unwrap();
    assert_eq!(multiplex.showtimes.len(), 28);
    let kyiv_cinema = avatar.theaters.iter().find(|t| t.name == "Kyiv Cinema").unwrap();
    assert_eq!(kyiv_cinema.showtimes.len(), 7);

    for theater in &avatar.theaters {
        for (i, a) in theater.showtimes.iter().enumerate() {
            for b in &theater.showtimes[i + 1..] {
                assert!(!a.same_showing(b), "duplicate showing in {}", theater.name);
            }
        }
    }

    let location = store.location_snapshot(&kyiv).unwrap();
    assert_eq!(location.status, LocationStatus::Fresh);
    assert_eq!(location.lock_acquired_at, None);
    assert_eq!(location.last_updated, Some(clock_now(&clock)));
}

fn clock_now(clock: &FixedClock) -> chrono::DateTime<Utc> {
    use cinestream_scout::Clock;
    clock.now()
}

#[tokio::test]
async fn second_run_scrapes_only_the_uncovered_week() {
    let clock = morning_of_dec_19();
    let kyiv = city("Kyiv, Ukraine");
    let covered: Vec<NaiveDate> = (0..7).map(|i| day(2025, 12, 19) + Duration::days(i)).collect();
    let store = Arc::new(MemoryStore::new().with_movie(stored_movie(
        &kyiv,
        "Avatar 2",
        "Multiplex",
        &covered,
        clock_now(&clock),
    )));
    let extractor = Arc::new(
        ScriptedExtractor::new()
            .on_theaters(vec![theater("Multiplex", "")])
            .on_movies(vec![movie_candidate("Avatar 2", None)]),
    );

    let outcome = orchestrator(&store, &extractor, &clock).run(&kyiv).await.unwrap();

    let ScrapeOutcome::Completed(stats) = outcome else {
        panic!("expected a completed scrape, got {outcome:?}");
    };
    assert_eq!(stats.plan_days, 7);
    assert_eq!(stats.steps_executed, 2 + 7);
    let planned: Vec<_> = extractor.calls().iter().filter_map(|s| s.day()).collect();
    assert_eq!(planned.first(), Some(&day(2025, 12, 26)));
    assert_eq!(planned.last(), Some(&day(2026, 1, 1)));

    // Existing showtimes are left alone.
    let avatar = store.movie(&kyiv, "avatar 2").unwrap();
    assert_eq!(avatar.showtime_count(), 7);
}

#[tokio::test]
async fn full_coverage_releases_fresh_without_extraction() {
    let clock = morning_of_dec_19();
    let kyiv = city("Kyiv, Ukraine");
    let store = Arc::new(MemoryStore::new().with_movie(stored_movie(
        &kyiv,
        "Avatar 2",
        "Multiplex",
        &[day(2026, 1, 1)],
        clock_now(&clock),
    )));
    let extractor = Arc::new(ScriptedExtractor::new());

    let outcome = orchestrator(&store, &extractor, &clock).run(&kyiv).await.unwrap();

    assert_eq!(outcome, ScrapeOutcome::UpToDate);
    assert!(extractor.calls().is_empty());
    assert_eq!(
        store.location_snapshot(&kyiv).unwrap().status,
        LocationStatus::Fresh
    );
}

#[tokio::test]
async fn failed_step_is_treated_as_empty_and_plan_continues() {
    let clock = morning_of_dec_19();
    let store = Arc::new(MemoryStore::new());
    let days: Vec<NaiveDate> = (0..14).map(|i| day(2025, 12, 19) + Duration::days(i)).collect();
    let extractor = Arc::new(kyiv_extractor(&days).failing_day("Avatar 2", day(2025, 12, 22)));
    let kyiv = city("Kyiv, Ukraine");

    let outcome = orchestrator(&store, &extractor, &clock).run(&kyiv).await.unwrap();

    let ScrapeOutcome::Completed(stats) = outcome else {
        panic!("expected a completed scrape, got {outcome:?}");
    };
    assert_eq!(stats.steps_executed, 16);
    assert_eq!(stats.steps_failed, 1);

    let avatar = store.movie(&kyiv, "avatar 2").unwrap();
    let has_dec_22 = avatar
        .theaters
        .iter()
        .flat_map(|t| t.showtimes.iter())
        .any(|s| s.start_time.date_naive() == day(2025, 12, 22));
    assert!(!has_dec_22);
    assert_eq!(
        store.location_snapshot(&kyiv).unwrap().status,
        LocationStatus::Fresh
    );
}

#[tokio::test]
async fn non_conforming_theater_result_counts_as_failed_step() {
    let clock = morning_of_dec_19();
    let store = Arc::new(MemoryStore::new());
    let extractor = Arc::new(
        ScriptedExtractor::new()
            .on_movies(vec![movie_candidate("Dune", None)])
            .wrong_shape_for(StepKind::TheaterDiscovery),
    );
    let kyiv = city("Kyiv, Ukraine");

    let outcome = orchestrator(&store, &extractor, &clock).run(&kyiv).await.unwrap();

    let ScrapeOutcome::Completed(stats) = outcome else {
        panic!("expected a completed scrape, got {outcome:?}");
    };
    assert_eq!(stats.steps_failed, 1);
    assert_eq!(stats.theaters_discovered, 0);
    assert_eq!(stats.steps_executed, 2 + 14);
}

#[tokio::test]
async fn empty_movie_discovery_twice_ends_the_plan() {
    let clock = morning_of_dec_19();
    let store = Arc::new(MemoryStore::new());
    let extractor = Arc::new(ScriptedExtractor::new().on_theaters(vec![theater("Multiplex", "")]));
    let kyiv = city("Kyiv, Ukraine");

    let outcome = orchestrator(&store, &extractor, &clock).run(&kyiv).await.unwrap();

    let ScrapeOutcome::Completed(stats) = outcome else {
        panic!("expected a completed scrape, got {outcome:?}");
    };
    assert_eq!(stats.steps_executed, 3);
    assert_eq!(extractor.call_count(StepKind::MovieDiscovery), 2);
    assert_eq!(extractor.call_count(StepKind::MovieDayExtraction), 0);
    assert!(store.movies(&kyiv).is_empty());
}

#[tokio::test]
async fn store_failure_aborts_plan_and_releases_stale() {
    let clock = morning_of_dec_19();
    let store = Arc::new(MemoryStore::new());
    store.fail_movie_writes(true);
    let days: Vec<NaiveDate> = (0..14).map(|i| day(2025, 12, 19) + Duration::days(i)).collect();
    let extractor = Arc::new(kyiv_extractor(&days));
    let kyiv = city("Kyiv, Ukraine");

    let result = orchestrator(&store, &extractor, &clock).run(&kyiv).await;

    assert!(result.is_err());
    // Movie discovery's merge is the first write; nothing runs after it.
    assert_eq!(extractor.calls().len(), 2);
    let location = store.location_snapshot(&kyiv).unwrap();
    assert_eq!(location.status, LocationStatus::Stale);
    assert_eq!(location.lock_acquired_at, None);
    assert_eq!(location.last_updated, None);
}

#[tokio::test]
async fn failed_release_leaves_lock_to_expire() {
    let clock = morning_of_dec_19();
    let store = Arc::new(MemoryStore::new());
    store.fail_location_writes(true);
    let extractor = Arc::new(ScriptedExtractor::new());
    let kyiv = city("Kyiv, Ukraine");

    let result = orchestrator(&store, &extractor, &clock).run(&kyiv).await;
    assert!(result.is_err());
    assert_eq!(
        store.location_snapshot(&kyiv).unwrap().status,
        LocationStatus::Processing
    );

    store.fail_location_writes(false);
    let locks = LockManager::new(store.clone(), ScrapeSettings::default().lock_timeout);
    assert!(locks.acquire(&kyiv, clock_now(&clock)).await.unwrap().is_none());
    clock.advance(Duration::seconds(301));
    assert!(locks.acquire(&kyiv, clock_now(&clock)).await.unwrap().is_some());
}

#[tokio::test]
async fn live_lock_reports_already_in_progress() {
    let clock = morning_of_dec_19();
    let store = Arc::new(MemoryStore::new());
    let extractor = Arc::new(ScriptedExtractor::new());
    let kyiv = city("Kyiv, Ukraine");

    let locks = LockManager::new(store.clone(), ScrapeSettings::default().lock_timeout);
    assert!(locks.acquire(&kyiv, clock_now(&clock)).await.unwrap().is_some());

    let outcome = orchestrator(&store, &extractor, &clock).run(&kyiv).await.unwrap();

    assert_eq!(outcome, ScrapeOutcome::AlreadyInProgress);
    assert!(extractor.calls().is_empty());
    assert_eq!(
        store.location_snapshot(&kyiv).unwrap().status,
        LocationStatus::Processing
    );
}

#[tokio::test]
async fn rerunning_the_same_day_adds_nothing() {
    let clock = morning_of_dec_19();
    let store = Arc::new(MemoryStore::new());
    let days = vec![day(2025, 12, 19), day(2025, 12, 20)];
    let settings = ScrapeSettings::builder().horizon_days(2).build();
    let extractor = Arc::new(kyiv_extractor(&days));
    let kyiv = city("Kyiv, Ukraine");

    let run = || {
        Orchestrator::new(
            store.clone(),
            store.clone(),
            extractor.clone(),
            clock.clone(),
            settings.clone(),
        )
    };
    run().run(&kyiv).await.unwrap();
    let first = store.movie(&kyiv, "avatar 2").unwrap();

    // Drop the Dec 20 coverage so the planner re-plans it, then merge the same payloads again.
    let mut trimmed = first.clone();
    for theater in &mut trimmed.theaters {
        theater.showtimes.retain(|s| s.start_time.date_naive() < day(2025, 12, 20));
    }
    store.insert_movie(trimmed);
    run().run(&kyiv).await.unwrap();

    let second = store.movie(&kyiv, "avatar 2").unwrap();
    assert_eq!(second.theaters, first.theaters);
}

/// Wraps the scripted extractor: every step takes `step_time` on the clock,
/// and a second worker tries to take the city lock while the step runs.
/// At `stall_at` the step hangs past the lock timeout first.
struct SlowExtractor {
    inner: ScriptedExtractor,
    clock: Arc<FixedClock>,
    rival: LockManager,
    city: CityKey,
    step_time: Duration,
    stall_at: Option<usize>,
    rival_wins: Mutex<Vec<usize>>,
}

#[async_trait]
impl ExtractionClient for SlowExtractor {
    async fn execute(&self, step: &ExtractionStep) -> Result<StepPayload, ExtractionError> {
        self.clock.advance(self.step_time);
        if self.stall_at == Some(step.index) {
            self.clock.advance(Duration::seconds(301));
        }
        if self
            .rival
            .acquire(&self.city, self.clock.now())
            .await
            .map_err(|e| ExtractionError::Upstream(e.to_string()))?
            .is_some()
        {
            self.rival_wins.lock().unwrap().push(step.index);
        }
        self.inner.execute(step).await
    }
}

fn slow_run(
    store: &Arc<MemoryStore>,
    clock: &Arc<FixedClock>,
    step_time: Duration,
    stall_at: Option<usize>,
) -> (Arc<SlowExtractor>, Orchestrator) {
    let days: Vec<NaiveDate> = (0..14).map(|i| day(2025, 12, 19) + Duration::days(i)).collect();
    let extractor = Arc::new(SlowExtractor {
        inner: kyiv_extractor(&days),
        clock: clock.clone(),
        rival: LockManager::new(store.clone(), ScrapeSettings::default().lock_timeout),
        city: city("Kyiv, Ukraine"),
        step_time,
        stall_at,
        rival_wins: Mutex::new(Vec::new()),
    });
    let orchestrator = Orchestrator::new(
        store.clone(),
        store.clone(),
        extractor.clone(),
        clock.clone(),
        ScrapeSettings::default(),
    );
    (extractor, orchestrator)
}

#[tokio::test]
async fn scrape_longer_than_lock_timeout_stays_exclusive() {
    let clock = morning_of_dec_19();
    let store = Arc::new(MemoryStore::new());
    let kyiv = city("Kyiv, Ukraine");
    let (extractor, orchestrator) = slow_run(&store, &clock, Duration::seconds(60), None);

    let outcome = orchestrator.run(&kyiv).await.unwrap();

    let ScrapeOutcome::Completed(stats) = outcome else {
        panic!("expected a completed scrape, got {outcome:?}");
    };
    // 16 steps at a minute each, far past the five minute timeout.
    assert_eq!(stats.steps_executed, 16);
    assert!(extractor.rival_wins.lock().unwrap().is_empty());
    assert_eq!(store.movies(&kyiv)[0].showtime_count(), 35);
    assert_eq!(
        store.location_snapshot(&kyiv).unwrap().status,
        LocationStatus::Fresh
    );
}

#[tokio::test]
async fn lost_lock_stops_writes_and_keeps_new_holder() {
    let clock = morning_of_dec_19();
    let store = Arc::new(MemoryStore::new());
    let kyiv = city("Kyiv, Ukraine");
    let (extractor, orchestrator) = slow_run(&store, &clock, Duration::seconds(10), Some(3));

    let result = orchestrator.run(&kyiv).await;

    assert!(result.is_err());
    assert_eq!(*extractor.rival_wins.lock().unwrap(), vec![3]);
    assert_eq!(extractor.inner.calls().len(), 4);
    // Step 3's showtimes arrived after the lock moved on and were dropped.
    let movies = store.movies(&kyiv);
    assert_eq!(movies.len(), 1);
    assert_eq!(movies[0].showtime_count(), 0);
    let location = store.location_snapshot(&kyiv).unwrap();
    assert_eq!(location.status, LocationStatus::Processing);
    assert_eq!(location.lock_acquired_at, Some(clock.now()));
}
