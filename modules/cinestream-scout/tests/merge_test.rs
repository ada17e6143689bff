//! Merge engine against the in-memory store.

use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};

use cinestream_scout::testing::{city, movie_candidate, report, showtime_at, theater, MemoryStore};
use cinestream_scout::{ExtractionStep, MergeEngine, MergeStats, StepPayload, StepTask};

fn day_step(title: &str, day: NaiveDate) -> ExtractionStep {
    ExtractionStep {
        index: 2,
        city: city("Kyiv, Ukraine"),
        task: StepTask::MovieDay {
            movie: movie_candidate(title, None),
            day,
            theaters: vec![],
            horizon: day,
            extension: false,
        },
    }
}

#[tokio::test]
async fn showtimes_for_undiscovered_movie_create_it() {
    let store = Arc::new(MemoryStore::new());
    let merger = MergeEngine::new(store.clone());
    let kyiv = city("Kyiv, Ukraine");
    let day = NaiveDate::from_ymd_opt(2025, 12, 20).unwrap();
    let now = Utc.with_ymd_and_hms(2025, 12, 19, 8, 0, 0).unwrap();

    let payload = StepPayload::Showtimes(vec![report(
        theater("Multiplex", "Lavina Mall"),
        vec![showtime_at(day, 18, 0, 2, None)],
    )]);
    let stats = merger
        .merge(&kyiv, &day_step("Dune: Part Two", day), &payload, now)
        .await
        .unwrap();

    assert_eq!(stats.movies_created, 1);
    let dune = store.movie(&kyiv, "dune: part two").unwrap();
    assert_eq!(dune.theaters.len(), 1);
    assert_eq!(dune.created_at, now);
}

#[tokio::test]
async fn merging_a_payload_twice_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let merger = MergeEngine::new(store.clone());
    let kyiv = city("Kyiv, Ukraine");
    let day = NaiveDate::from_ymd_opt(2025, 12, 20).unwrap();
    let now = Utc.with_ymd_and_hms(2025, 12, 19, 8, 0, 0).unwrap();
    let step = day_step("Avatar 2", day);

    let payload = StepPayload::Showtimes(vec![
        report(
            theater("Multiplex", "Lavina Mall"),
            vec![showtime_at(day, 18, 0, 2, Some("Hall 5")), showtime_at(day, 21, 0, 2, None)],
        ),
        report(theater("Kyiv Cinema", "Velyka Vasylkivska 19"), vec![showtime_at(day, 19, 30, 2, None)]),
    ]);

    merger.merge(&kyiv, &step, &payload, now).await.unwrap();
    let once = store.movie(&kyiv, "avatar 2").unwrap();

    let again = merger.merge(&kyiv, &step, &payload, now).await.unwrap();
    let twice = store.movie(&kyiv, "avatar 2").unwrap();

    assert_eq!(again.showtimes_added, 0);
    assert_eq!(again.showtimes_duplicate, 3);
    assert_eq!(once.theaters, twice.theaters);
}

#[tokio::test]
async fn movie_discovery_keeps_existing_showtimes() {
    let store = Arc::new(MemoryStore::new());
    let merger = MergeEngine::new(store.clone());
    let kyiv = city("Kyiv, Ukraine");
    let day = NaiveDate::from_ymd_opt(2025, 12, 20).unwrap();
    let now = Utc.with_ymd_and_hms(2025, 12, 19, 8, 0, 0).unwrap();

    let showtimes = StepPayload::Showtimes(vec![report(
        theater("Multiplex", "Lavina Mall"),
        vec![showtime_at(day, 18, 0, 2, None)],
    )]);
    merger
        .merge(&kyiv, &day_step("Avatar 2", day), &showtimes, now)
        .await
        .unwrap();

    let discovery_step = ExtractionStep {
        index: 1,
        city: kyiv.clone(),
        task: StepTask::MovieDiscovery {
            theaters: vec![],
            attempt: 1,
        },
    };
    let mut candidate = movie_candidate("Avatar 2", Some("Аватар 2"));
    candidate.poster_url = Some("https://img.example.com/avatar.jpg".into());
    let stats = merger
        .merge(&kyiv, &discovery_step, &StepPayload::Movies(vec![candidate]), now)
        .await
        .unwrap();

    assert_eq!(stats.movies_created, 0);
    assert_eq!(stats.movies_updated, 1);
    let avatar = store.movie(&kyiv, "avatar 2").unwrap();
    assert_eq!(avatar.showtime_count(), 1);
    assert_eq!(avatar.titles["local"], "Аватар 2");
    assert_eq!(avatar.poster_url.as_deref(), Some("https://img.example.com/avatar.jpg"));
}

#[tokio::test]
async fn theater_discovery_writes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let merger = MergeEngine::new(store.clone());
    let kyiv = city("Kyiv, Ukraine");
    let step = ExtractionStep {
        index: 0,
        city: kyiv.clone(),
        task: StepTask::TheaterDiscovery,
    };

    let stats = merger
        .merge(
            &kyiv,
            &step,
            &StepPayload::Theaters(vec![theater("Multiplex", "Lavina Mall")]),
            Utc::now(),
        )
        .await
        .unwrap();

    assert_eq!(stats, MergeStats::default());
    assert!(store.movies(&kyiv).is_empty());
}
