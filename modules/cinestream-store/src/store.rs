use bson::DateTime as BsonDateTime;
use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::Collection;
use tracing::{debug, info, warn};

use cinestream_common::{CityKey, Location, LocationStatus, Movie, TheaterAppend};

use crate::documents::{LocationDocument, MovieDocument};
use crate::StoreClient;

pub const LOCATIONS: &str = "locations";
pub const MOVIES: &str = "movies";

const DUPLICATE_KEY: i32 = 11000;

/// Read/write access to the `locations` and `movies` collections.
#[derive(Clone)]
pub struct MongoStore {
    client: StoreClient,
}

impl MongoStore {
    pub fn new(client: StoreClient) -> Self {
        Self { client }
    }

    fn locations(&self) -> Collection<LocationDocument> {
        self.client.db.collection(LOCATIONS)
    }

    fn movies(&self) -> Collection<MovieDocument> {
        self.client.db.collection(MOVIES)
    }

    // =========================================================================
    // Locations and locks
    // =========================================================================

    /// Atomically move the city's lock from free-or-expired to held.
    ///
    /// First a conditional update that only matches a document which is not
    /// processing or whose lock is older than `timeout`. When nothing matched,
    /// an insert-only upsert creates the Location for an unseen city; a
    /// document that already exists (a live lock) is matched and left as is,
    /// so a contended acquire can never add a second Location. Two inserts
    /// racing for an unseen city collide on the unique `city_key` index and
    /// the loser reports `Ok(false)`.
    pub async fn try_acquire_lock(
        &self,
        city: &CityKey,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<bool, mongodb::error::Error> {
        let stale_before = BsonDateTime::from_chrono(now - timeout);
        let now_bson = BsonDateTime::from_chrono(now);

        let takeover = self
            .locations()
            .update_one(
                doc! {
                    "city_key": city.as_str(),
                    "$or": [
                        { "status": { "$ne": LocationStatus::Processing.as_str() } },
                        { "lock_acquired_at": { "$exists": false } },
                        { "lock_acquired_at": { "$lt": stale_before } },
                    ],
                },
                doc! {
                    "$set": {
                        "status": LocationStatus::Processing.as_str(),
                        "lock_acquired_at": now_bson,
                    },
                },
            )
            .await?;
        if takeover.matched_count > 0 {
            debug!(city = %city, "Lock taken over");
            return Ok(true);
        }

        let insert = self
            .locations()
            .update_one(
                doc! { "city_key": city.as_str() },
                doc! {
                    "$setOnInsert": {
                        "status": LocationStatus::Processing.as_str(),
                        "lock_acquired_at": now_bson,
                        "names": { "en": city.city() },
                        "created_at": now_bson,
                    },
                },
            )
            .upsert(true)
            .await;
        match insert {
            Ok(result) => {
                let acquired = result.upserted_id.is_some();
                debug!(city = %city, acquired, "Lock insert for unseen city");
                Ok(acquired)
            }
            Err(e) if is_duplicate_key(&e) => {
                debug!(city = %city, "Lock held by another worker");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Push the lock's timestamp forward, but only while `held_since` is still
    /// the stored one. `Ok(false)` means the lock was reclaimed or released.
    pub async fn renew_lock(
        &self,
        city: &CityKey,
        held_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, mongodb::error::Error> {
        let result = self
            .locations()
            .update_one(
                holder_filter(city, held_since),
                doc! { "$set": { "lock_acquired_at": BsonDateTime::from_chrono(now) } },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    /// Clear the lock held since `held_since` and record how the scrape
    /// ended. `last_updated` only moves on `Fresh` so a failed scrape never
    /// looks recent. `Ok(false)` when the lock is no longer this holder's.
    pub async fn release_lock(
        &self,
        city: &CityKey,
        held_since: DateTime<Utc>,
        status: LocationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, mongodb::error::Error> {
        let mut set = doc! { "status": status.as_str() };
        if status == LocationStatus::Fresh {
            set.insert("last_updated", BsonDateTime::from_chrono(now));
        }
        let result = self
            .locations()
            .update_one(
                holder_filter(city, held_since),
                doc! { "$set": set, "$unset": { "lock_acquired_at": "" } },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    pub async fn location(&self, city: &CityKey) -> Result<Option<Location>, mongodb::error::Error> {
        let doc = self
            .locations()
            .find_one(doc! { "city_key": city.as_str() })
            .await?;
        Ok(doc.and_then(LocationDocument::into_location))
    }

    pub async fn list_locations(&self) -> Result<Vec<Location>, mongodb::error::Error> {
        let docs: Vec<LocationDocument> = self
            .locations()
            .find(doc! {})
            .sort(doc! { "city_key": 1 })
            .await?
            .try_collect()
            .await?;
        Ok(docs
            .into_iter()
            .filter_map(LocationDocument::into_location)
            .collect())
    }

    // =========================================================================
    // Movies
    // =========================================================================

    pub async fn movies_for_city(&self, city: &CityKey) -> Result<Vec<Movie>, mongodb::error::Error> {
        let docs: Vec<MovieDocument> = self
            .movies()
            .find(doc! { "city_key": city.as_str() })
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().filter_map(MovieDocument::into_movie).collect())
    }

    pub async fn find_movie(
        &self,
        city: &CityKey,
        title_key: &str,
    ) -> Result<Option<Movie>, mongodb::error::Error> {
        let doc = self
            .movies()
            .find_one(movie_filter(city, title_key))
            .await?;
        Ok(doc.and_then(MovieDocument::into_movie))
    }

    /// Insert the movie unless `(city_key, title_key)` already exists.
    /// Returns whether this call created it.
    pub async fn insert_movie(&self, movie: &Movie) -> Result<bool, mongodb::error::Error> {
        let document = mongodb::bson::to_document(&MovieDocument::from(movie))?;
        let result = self
            .movies()
            .update_one(
                movie_filter(&movie.city_key, &movie.title_key),
                doc! { "$setOnInsert": document },
            )
            .upsert(true)
            .await;
        match result {
            Ok(result) if result.upserted_id.is_some() => {
                info!(city = %movie.city_key, title = movie.display_title(), "Movie created");
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Overwrite titles and poster fields. Theaters are never touched here.
    pub async fn update_movie_metadata(&self, movie: &Movie) -> Result<(), mongodb::error::Error> {
        let titles = mongodb::bson::to_bson(&movie.titles)?;
        self.movies()
            .update_one(
                movie_filter(&movie.city_key, &movie.title_key),
                doc! {
                    "$set": {
                        "titles": titles,
                        "poster_url": movie.poster_url.as_deref(),
                        "poster_path": movie.poster_path.as_deref(),
                        "updated_at": BsonDateTime::from_chrono(movie.updated_at),
                    },
                },
            )
            .await?;
        Ok(())
    }

    /// Append showings to one theater of a movie, creating the theater
    /// entry when the movie has none with that name and address.
    ///
    /// Each write is a single-document `$push`, so showtimes another writer
    /// appended in between are kept. `Ok(false)` when the movie is missing.
    pub async fn append_showtimes(
        &self,
        city: &CityKey,
        title_key: &str,
        append: &TheaterAppend,
        now: DateTime<Utc>,
    ) -> Result<bool, mongodb::error::Error> {
        let showtimes = mongodb::bson::to_bson(&append.showtimes)?;
        let updated_at = BsonDateTime::from_chrono(now);
        let theater = doc! { "name": append.name.as_str(), "address": append.address.as_str() };

        for _ in 0..2 {
            let mut existing = movie_filter(city, title_key);
            existing.insert("theaters", doc! { "$elemMatch": theater.clone() });
            let mut set = doc! { "updated_at": updated_at };
            if let Some(website) = &append.website {
                set.insert("theaters.$[t].website", website.as_str());
            }
            let result = self
                .movies()
                .update_one(
                    existing,
                    doc! {
                        "$push": { "theaters.$[t].showtimes": { "$each": showtimes.clone() } },
                        "$set": set,
                    },
                )
                .array_filters(vec![doc! { "t.name": append.name.as_str(), "t.address": append.address.as_str() }])
                .await?;
            if result.matched_count > 0 {
                return Ok(true);
            }

            let mut missing = movie_filter(city, title_key);
            missing.insert("theaters", doc! { "$not": { "$elemMatch": theater.clone() } });
            let entry = doc! {
                "name": append.name.as_str(),
                "address": append.address.as_str(),
                "website": append.website.as_deref(),
                "showtimes": showtimes.clone(),
            };
            let result = self
                .movies()
                .update_one(
                    missing,
                    doc! { "$push": { "theaters": entry }, "$set": { "updated_at": updated_at } },
                )
                .await?;
            if result.matched_count > 0 {
                return Ok(true);
            }
            // Neither matched: the theater appeared in between, or the movie is gone.
            if self.movies().find_one(movie_filter(city, title_key)).await?.is_none() {
                return Ok(false);
            }
        }
        warn!(city = %city, title_key, theater = %append.name, "Showtime append kept racing, giving up");
        Ok(false)
    }
}

fn holder_filter(city: &CityKey, held_since: DateTime<Utc>) -> Document {
    doc! {
        "city_key": city.as_str(),
        "status": LocationStatus::Processing.as_str(),
        "lock_acquired_at": BsonDateTime::from_chrono(held_since),
    }
}

fn movie_filter(city: &CityKey, title_key: &str) -> Document {
    doc! { "city_key": city.as_str(), "title_key": title_key }
}

/// True for E11000 duplicate key errors, whether reported as a write error or
/// a command error.
pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}
