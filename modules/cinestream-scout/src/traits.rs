// Store seams for the scrape engine.
//
// LocationStore: the per-city lock and freshness bookkeeping.
// MovieStore: movie-centric documents read by the planner and written by merge.
//
// MongoStore implements both; testing::MemoryStore stands in for it so engine
// tests need no database.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use cinestream_common::{CityKey, Location, LocationStatus, Movie, TheaterAppend};
use cinestream_store::MongoStore;

// ---------------------------------------------------------------------------
// LocationStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Atomic compare-and-set from free-or-expired to held. Creates the
    /// Location when the city has never been seen.
    async fn try_acquire_lock(
        &self,
        city: &CityKey,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<bool>;

    /// Refresh the lock timestamp while `held_since` is still the stored
    /// one. `Ok(false)` when the lock was reclaimed or released meanwhile.
    async fn renew_lock(
        &self,
        city: &CityKey,
        held_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Clear the lock held since `held_since` and set the terminal status.
    /// `last_updated` moves only on `Fresh`. `Ok(false)` when the lock is no
    /// longer this holder's, in which case nothing is written.
    async fn release_lock(
        &self,
        city: &CityKey,
        held_since: DateTime<Utc>,
        status: LocationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn location(&self, city: &CityKey) -> Result<Option<Location>>;

    async fn list_locations(&self) -> Result<Vec<Location>>;
}

#[async_trait]
impl LocationStore for MongoStore {
    async fn try_acquire_lock(
        &self,
        city: &CityKey,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<bool> {
        Ok(MongoStore::try_acquire_lock(self, city, now, timeout).await?)
    }

    async fn renew_lock(
        &self,
        city: &CityKey,
        held_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(MongoStore::renew_lock(self, city, held_since, now).await?)
    }

    async fn release_lock(
        &self,
        city: &CityKey,
        held_since: DateTime<Utc>,
        status: LocationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(MongoStore::release_lock(self, city, held_since, status, now).await?)
    }

    async fn location(&self, city: &CityKey) -> Result<Option<Location>> {
        Ok(MongoStore::location(self, city).await?)
    }

    async fn list_locations(&self) -> Result<Vec<Location>> {
        Ok(MongoStore::list_locations(self).await?)
    }
}

// ---------------------------------------------------------------------------
// MovieStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MovieStore: Send + Sync {
    async fn movies_for_city(&self, city: &CityKey) -> Result<Vec<Movie>>;

    async fn find_movie(&self, city: &CityKey, title_key: &str) -> Result<Option<Movie>>;

    /// Create the movie unless `(city_key, title_key)` exists. Returns
    /// whether this call created it.
    async fn insert_movie(&self, movie: &Movie) -> Result<bool>;

    /// Write titles and poster fields only; theaters are left alone.
    async fn update_movie_metadata(&self, movie: &Movie) -> Result<()>;

    /// Atomically append showings to one theater. `Ok(false)` when the movie
    /// does not exist.
    async fn append_showtimes(
        &self,
        city: &CityKey,
        title_key: &str,
        append: &TheaterAppend,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}

#[async_trait]
impl MovieStore for MongoStore {
    async fn movies_for_city(&self, city: &CityKey) -> Result<Vec<Movie>> {
        Ok(MongoStore::movies_for_city(self, city).await?)
    }

    async fn find_movie(&self, city: &CityKey, title_key: &str) -> Result<Option<Movie>> {
        Ok(MongoStore::find_movie(self, city, title_key).await?)
    }

    async fn insert_movie(&self, movie: &Movie) -> Result<bool> {
        Ok(MongoStore::insert_movie(self, movie).await?)
    }

    async fn update_movie_metadata(&self, movie: &Movie) -> Result<()> {
        Ok(MongoStore::update_movie_metadata(self, movie).await?)
    }

    async fn append_showtimes(
        &self,
        city: &CityKey,
        title_key: &str,
        append: &TheaterAppend,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(MongoStore::append_showtimes(self, city, title_key, append, now).await?)
    }
}
