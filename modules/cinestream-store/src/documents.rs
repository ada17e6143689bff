//! Stored shapes of the two collections.
//!
//! Timestamps are BSON dates so that range filters and the TTL index on
//! `movies.created_at` work server-side. Showtime start times stay RFC 3339
//! strings to keep the theater's local offset.

use std::collections::BTreeMap;

use bson::DateTime as BsonDateTime;
use serde::{Deserialize, Serialize};

use cinestream_common::{CityKey, GeoPoint, Location, LocationStatus, Movie, Theater};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationDocument {
    pub city_key: String,
    #[serde(default)]
    pub names: BTreeMap<String, String>,
    #[serde(default)]
    pub geo: Option<GeoPoint>,
    pub status: LocationStatus,
    #[serde(default)]
    pub last_updated: Option<BsonDateTime>,
    #[serde(default)]
    pub lock_acquired_at: Option<BsonDateTime>,
    #[serde(default)]
    pub created_at: Option<BsonDateTime>,
}

impl LocationDocument {
    /// Documents written before `city_key` validation existed are skipped.
    pub fn into_location(self) -> Option<Location> {
        let city_key = CityKey::parse(&self.city_key).ok()?;
        let created_at = self
            .created_at
            .or(self.last_updated)
            .map(BsonDateTime::to_chrono)
            .unwrap_or_default();
        Some(Location {
            city_key,
            names: self.names,
            geo: self.geo,
            status: self.status,
            last_updated: self.last_updated.map(BsonDateTime::to_chrono),
            lock_acquired_at: self.lock_acquired_at.map(BsonDateTime::to_chrono),
            created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovieDocument {
    pub city_key: String,
    pub title_key: String,
    pub titles: BTreeMap<String, String>,
    #[serde(default)]
    pub poster_url: Option<String>,
    #[serde(default)]
    pub poster_path: Option<String>,
    #[serde(default)]
    pub theaters: Vec<Theater>,
    pub created_at: BsonDateTime,
    pub updated_at: BsonDateTime,
}

impl From<&Movie> for MovieDocument {
    fn from(movie: &Movie) -> Self {
        Self {
            city_key: movie.city_key.as_str().to_string(),
            title_key: movie.title_key.clone(),
            titles: movie.titles.clone(),
            poster_url: movie.poster_url.clone(),
            poster_path: movie.poster_path.clone(),
            theaters: movie.theaters.clone(),
            created_at: BsonDateTime::from_chrono(movie.created_at),
            updated_at: BsonDateTime::from_chrono(movie.updated_at),
        }
    }
}

impl MovieDocument {
    /// Showtimes are appended unordered by the store, so they are sorted here.
    pub fn into_movie(mut self) -> Option<Movie> {
        for theater in &mut self.theaters {
            theater.showtimes.sort_by_key(|s| s.start_time);
        }
        Some(Movie {
            city_key: CityKey::parse(&self.city_key).ok()?,
            title_key: self.title_key,
            titles: self.titles,
            poster_url: self.poster_url,
            poster_path: self.poster_path,
            theaters: self.theaters,
            created_at: self.created_at.to_chrono(),
            updated_at: self.updated_at.to_chrono(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone, Utc};
    use cinestream_common::Showtime;

    #[test]
    fn movie_document_keeps_showtime_offsets() {
        let now = Utc.with_ymd_and_hms(2025, 12, 19, 9, 0, 0).unwrap();
        let kyiv = FixedOffset::east_opt(2 * 3600).unwrap();
        let mut titles = BTreeMap::new();
        titles.insert("en".to_string(), "Avatar 2".to_string());
        let mut movie = Movie::new(CityKey::parse("Kyiv, Ukraine").unwrap(), titles, now);
        movie.theaters.push(Theater {
            name: "Multiplex".into(),
            address: "Lavina Mall".into(),
            website: None,
            showtimes: vec![Showtime {
                start_time: kyiv.with_ymd_and_hms(2025, 12, 20, 18, 0, 0).unwrap(),
                format: Some("IMAX".into()),
                language: None,
                hall: None,
            }],
        });

        let doc = bson::to_document(&MovieDocument::from(&movie)).unwrap();
        assert!(doc.get_datetime("created_at").is_ok());

        let back: MovieDocument = bson::from_document(doc).unwrap();
        let back = back.into_movie().unwrap();
        assert_eq!(back, movie);
        assert_eq!(
            back.theaters[0].showtimes[0].start_time.offset(),
            &kyiv
        );
    }
}
