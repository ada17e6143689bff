use std::time::Duration;

use mongodb::bson::{doc, Document};
use mongodb::options::IndexOptions;
use mongodb::IndexModel;
use tracing::info;

use cinestream_common::MOVIE_TTL_DAYS;

use crate::store::{LOCATIONS, MOVIES};
use crate::StoreClient;

/// Create indexes. Idempotent: MongoDB ignores an identical existing index.
///
/// The unique `locations.city_key` index is what turns a contended lock
/// upsert into a duplicate key error, so it must exist before any worker
/// scrapes.
pub async fn migrate(client: &StoreClient) -> Result<(), mongodb::error::Error> {
    let db = &client.db;

    info!("Running index migrations...");

    let locations = db.collection::<Document>(LOCATIONS);
    locations
        .create_index(index(doc! { "city_key": 1 }, "city_key_unique", true))
        .await?;
    locations
        .create_index(index(doc! { "status": 1 }, "status_idx", false))
        .await?;
    info!("Location indexes created");

    let movies = db.collection::<Document>(MOVIES);
    movies
        .create_index(index(
            doc! { "city_key": 1, "title_key": 1 },
            "city_title_unique",
            true,
        ))
        .await?;
    movies
        .create_index(index(doc! { "city_key": 1 }, "city_key_idx", false))
        .await?;

    // TTL anchored on created_at: a movie disappears 90 days after first sighting.
    let ttl = IndexModel::builder()
        .keys(doc! { "created_at": 1 })
        .options(
            IndexOptions::builder()
                .name("created_at_ttl".to_string())
                .expire_after(Duration::from_secs(movie_ttl_secs()))
                .build(),
        )
        .build();
    movies.create_index(ttl).await?;
    info!(ttl_days = MOVIE_TTL_DAYS, "Movie indexes created");

    Ok(())
}

fn index(keys: Document, name: &str, unique: bool) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(
            IndexOptions::builder()
                .name(name.to_string())
                .unique(unique)
                .build(),
        )
        .build()
}

pub fn movie_ttl_secs() -> u64 {
    (MOVIE_TTL_DAYS * 24 * 60 * 60) as u64
}
