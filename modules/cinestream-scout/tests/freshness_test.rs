//! Request-facing freshness checks and the daily refresh agent.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};

use cinestream_common::{Location, LocationStatus};
use cinestream_scout::refresh::{assigned_agent, RefreshAgent};
use cinestream_scout::testing::{
    city, movie_candidate, stored_movie, theater, FixedClock, MemoryStore, ScriptedExtractor,
};
use cinestream_scout::{
    Clock, Freshness, LockManager, Orchestrator, ScrapeService, ScrapeSettings, StepKind,
};

struct Harness {
    store: Arc<MemoryStore>,
    extractor: Arc<ScriptedExtractor>,
    clock: Arc<FixedClock>,
    orchestrator: Arc<Orchestrator>,
    service: ScrapeService,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let extractor = Arc::new(
        ScriptedExtractor::new()
            .on_theaters(vec![theater("Multiplex", "Lavina Mall")])
            .on_movies(vec![movie_candidate("Avatar 2", None)]),
    );
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 12, 19, 8, 0, 0).unwrap(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        store.clone(),
        extractor.clone(),
        clock.clone(),
        ScrapeSettings::builder().horizon_days(3).build(),
    ));
    let service = ScrapeService::new(store.clone(), orchestrator.clone(), clock.clone());
    Harness {
        store,
        extractor,
        clock,
        orchestrator,
        service,
    }
}

fn known_location(raw: &str, status: LocationStatus, last_updated: Option<chrono::DateTime<Utc>>) -> Location {
    let key = city(raw);
    Location {
        names: [("en".to_string(), key.city().to_string())].into_iter().collect(),
        city_key: key,
        geo: None,
        status,
        last_updated,
        lock_acquired_at: None,
        created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn unknown_city_is_scraped_then_fresh() {
    let h = harness();
    let kyiv = city("Kyiv, Ukraine");

    assert_eq!(h.service.status(&kyiv).await.unwrap(), LocationStatus::Stale);
    assert_eq!(h.service.ensure_fresh(&kyiv).await.unwrap(), Freshness::JustScraped);
    assert_eq!(h.service.status(&kyiv).await.unwrap(), LocationStatus::Fresh);
    assert_eq!(h.service.ensure_fresh(&kyiv).await.unwrap(), Freshness::Fresh);
    assert_eq!(h.extractor.call_count(StepKind::TheaterDiscovery), 1);

    h.clock.advance(Duration::hours(24));
    assert_eq!(h.service.status(&kyiv).await.unwrap(), LocationStatus::Stale);
}

#[tokio::test]
async fn stale_city_with_full_coverage_reports_fresh() {
    let h = harness();
    let kyiv = city("Kyiv, Ukraine");
    let today = h.clock.now().date_naive();
    let covered: Vec<_> = (0..3).map(|i| today + Duration::days(i)).collect();
    h.store
        .insert_movie(stored_movie(&kyiv, "Avatar 2", "Multiplex", &covered, h.clock.now()));

    assert_eq!(h.service.status(&kyiv).await.unwrap(), LocationStatus::Stale);
    assert_eq!(h.service.ensure_fresh(&kyiv).await.unwrap(), Freshness::Fresh);
    assert!(h.extractor.calls().is_empty());
    assert_eq!(h.service.status(&kyiv).await.unwrap(), LocationStatus::Fresh);
}

#[tokio::test]
async fn running_scrape_reads_as_processing() {
    let h = harness();
    let kyiv = city("Kyiv, Ukraine");
    let locks = LockManager::new(h.store.clone(), h.orchestrator.settings().lock_timeout);
    assert!(locks.acquire(&kyiv, h.clock.now()).await.unwrap().is_some());

    assert_eq!(h.service.status(&kyiv).await.unwrap(), LocationStatus::Processing);
    assert_eq!(h.service.ensure_fresh(&kyiv).await.unwrap(), Freshness::Processing);
    assert!(h.extractor.calls().is_empty());

    // An abandoned lock stops counting once it is past the timeout.
    h.clock.advance(Duration::seconds(301));
    assert_eq!(h.service.status(&kyiv).await.unwrap(), LocationStatus::Stale);
    assert_eq!(h.service.ensure_fresh(&kyiv).await.unwrap(), Freshness::JustScraped);
}

#[tokio::test]
async fn detached_trigger_returns_processing_and_finishes_in_background() {
    let h = harness();
    let kyiv = city("Kyiv, Ukraine");

    assert_eq!(
        h.service.ensure_fresh_detached(&kyiv).await.unwrap(),
        Freshness::Processing
    );

    let mut status = LocationStatus::Stale;
    for _ in 0..200 {
        status = h.service.status(&kyiv).await.unwrap();
        if status == LocationStatus::Fresh {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(status, LocationStatus::Fresh);
    assert_eq!(
        h.service.ensure_fresh_detached(&kyiv).await.unwrap(),
        Freshness::Fresh
    );
}

#[tokio::test]
async fn refresh_agent_scrapes_only_its_stale_cities() {
    let h = harness();
    let now = h.clock.now();
    let cities = ["Kyiv, Ukraine", "Lviv, Ukraine", "Odesa, Ukraine", "Warsaw, Poland"];
    let store = {
        let mut store = MemoryStore::new();
        for (i, raw) in cities.iter().enumerate() {
            let location = if i == 0 {
                known_location(raw, LocationStatus::Fresh, Some(now - Duration::hours(1)))
            } else {
                known_location(raw, LocationStatus::Stale, Some(now - Duration::days(3)))
            };
            store = store.with_location(location);
        }
        Arc::new(store)
    };
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        store.clone(),
        h.extractor.clone(),
        h.clock.clone(),
        ScrapeSettings::builder().horizon_days(2).build(),
    ));

    let stats = RefreshAgent::new(0, 1, store.clone(), orchestrator, h.clock.clone())
        .unwrap()
        .with_pause(StdDuration::ZERO)
        .run()
        .await
        .unwrap();

    assert_eq!(stats.assigned, 4);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.refreshed, 3);
    assert_eq!(stats.failed, 0);
    for raw in &cities[1..] {
        assert_eq!(
            store.location_snapshot(&city(raw)).unwrap().status,
            LocationStatus::Fresh
        );
    }
}

#[tokio::test]
async fn agents_partition_the_city_list() {
    let h = harness();
    let cities = ["Kyiv, Ukraine", "Lviv, Ukraine", "Odesa, Ukraine", "Warsaw, Poland", "Berlin, Germany"];
    let store = {
        let mut store = MemoryStore::new();
        for raw in cities {
            store = store.with_location(known_location(raw, LocationStatus::Stale, None));
        }
        Arc::new(store)
    };
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        store.clone(),
        h.extractor.clone(),
        h.clock.clone(),
        ScrapeSettings::builder().horizon_days(1).build(),
    ));

    let mut assigned = 0;
    for agent_id in 0..3 {
        let stats = RefreshAgent::new(agent_id, 3, store.clone(), orchestrator.clone(), h.clock.clone())
            .unwrap()
            .with_pause(StdDuration::ZERO)
            .run()
            .await
            .unwrap();
        let expected = cities
            .iter()
            .filter(|raw| assigned_agent(&city(raw), 3) == agent_id)
            .count();
        assert_eq!(stats.assigned as usize, expected);
        assigned += stats.assigned;
    }
    assert_eq!(assigned as usize, cities.len());
}

#[test]
fn agent_id_must_be_in_range() {
    let h = harness();
    assert!(RefreshAgent::new(3, 3, h.store.clone(), h.orchestrator.clone(), h.clock.clone()).is_err());
    assert!(RefreshAgent::new(0, 0, h.store.clone(), h.orchestrator.clone(), h.clock.clone()).is_err());
}
