//! Tool-input shapes Claude fills in, and their conversion to step payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use cinestream_common::{
    MovieCandidate, Showtime, TheaterCandidate, TheaterShowtimes, MIN_SHOWTIME_LEAD_MINUTES,
};

use super::StepPayload;

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct TheaterList {
    /// Every cinema currently operating in the city.
    #[serde(default)]
    pub theaters: Vec<ExtractedTheater>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ExtractedTheater {
    pub name: String,
    /// Street address, as specific as available.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct MovieList {
    #[serde(default)]
    pub movies: Vec<ExtractedMovie>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ExtractedMovie {
    /// English title, if the movie has one.
    #[serde(default)]
    pub title_en: Option<String>,
    /// Title as shown by local cinemas.
    #[serde(default)]
    pub title_local: Option<String>,
    /// Direct link to an official poster image.
    #[serde(default)]
    pub poster_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct ShowtimeList {
    #[serde(default)]
    pub theaters: Vec<ExtractedTheaterShowtimes>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ExtractedTheaterShowtimes {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub showtimes: Vec<ExtractedShowtime>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ExtractedShowtime {
    /// RFC 3339 start time with the theater's UTC offset, e.g. 2025-12-20T18:30:00+02:00.
    pub start_time: String,
    /// Projection format such as 2D, 3D, IMAX.
    #[serde(default)]
    pub format: Option<String>,
    /// Audio language or subtitle note.
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub hall: Option<String>,
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

impl TheaterList {
    pub fn into_payload(self) -> StepPayload {
        StepPayload::Theaters(
            self.theaters
                .into_iter()
                .filter_map(|t| theater_candidate(t.name, t.address, t.website))
                .collect(),
        )
    }
}

impl MovieList {
    pub fn into_payload(self) -> StepPayload {
        StepPayload::Movies(self.movies.into_iter().filter_map(movie_candidate).collect())
    }
}

impl ShowtimeList {
    /// Showtimes that fail to parse or start within the lead window of `now`
    /// are dropped. So are theaters left with nothing.
    pub fn into_payload(self, now: DateTime<Utc>) -> StepPayload {
        let earliest = now + Duration::minutes(MIN_SHOWTIME_LEAD_MINUTES);
        let reports = self
            .theaters
            .into_iter()
            .filter_map(|t| {
                let theater = theater_candidate(t.name, t.address, t.website)?;
                let showtimes: Vec<Showtime> = t
                    .showtimes
                    .into_iter()
                    .filter_map(|s| parse_showtime(s, earliest))
                    .collect();
                (!showtimes.is_empty()).then_some(TheaterShowtimes { theater, showtimes })
            })
            .collect();
        StepPayload::Showtimes(reports)
    }
}

fn theater_candidate(
    name: String,
    address: Option<String>,
    website: Option<String>,
) -> Option<TheaterCandidate> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return None;
    }
    Some(TheaterCandidate {
        name,
        address: address.map(|a| a.trim().to_string()).unwrap_or_default(),
        website: non_blank(website),
    })
}

fn movie_candidate(movie: ExtractedMovie) -> Option<MovieCandidate> {
    let mut titles = BTreeMap::new();
    if let Some(en) = non_blank(movie.title_en) {
        titles.insert("en".to_string(), en);
    }
    if let Some(local) = non_blank(movie.title_local) {
        titles.insert("local".to_string(), local);
    }
    if titles.is_empty() {
        return None;
    }
    Some(MovieCandidate {
        titles,
        poster_url: non_blank(movie.poster_url),
    })
}

fn parse_showtime(raw: ExtractedShowtime, earliest: DateTime<Utc>) -> Option<Showtime> {
    let start_time = match DateTime::parse_from_rfc3339(raw.start_time.trim()) {
        Ok(t) => t,
        Err(e) => {
            debug!(start_time = raw.start_time.as_str(), error = %e, "Dropping unparseable showtime");
            return None;
        }
    };
    if start_time < earliest {
        return None;
    }
    Some(Showtime {
        start_time,
        format: non_blank(raw.format),
        language: non_blank(raw.language),
        hall: non_blank(raw.hall),
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Tool input schema
// ---------------------------------------------------------------------------

/// JSON schema for `T` with every `$ref` inlined, as the tool-use API
/// expects a self-contained `input_schema`.
pub fn tool_input_schema<T: JsonSchema>() -> Value {
    let mut value = serde_json::to_value(schema_for!(T)).unwrap_or_default();
    let definitions = value.get("definitions").cloned();
    if let Some(defs) = definitions {
        inline_refs(&mut value, &defs);
    }
    if let Value::Object(map) = &mut value {
        map.remove("definitions");
        map.remove("$schema");
        map.remove("title");
    }
    value
}

fn inline_refs(value: &mut Value, definitions: &Value) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(path)) = map.get("$ref").cloned() {
                if let Some(def) = path
                    .strip_prefix("#/definitions/")
                    .and_then(|name| definitions.get(name))
                {
                    *value = def.clone();
                    inline_refs(value, definitions);
                    return;
                }
            }
            for (_, v) in map.iter_mut() {
                inline_refs(v, definitions);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                inline_refs(item, definitions);
            }
        }
        _ => {}
    }
}
