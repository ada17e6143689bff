use std::env;
use std::str::FromStr;

use tracing::info;

use crate::constants::*;
use crate::error::CineStreamError;

/// Claude models, cheapest first. Structured extraction works well on Haiku.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("haiku", "claude-3-5-haiku-20241022"),
    ("sonnet", "claude-sonnet-4-20250514"),
];

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // MongoDB
    pub mongo_uri: String,
    pub mongo_database: String,

    // AI provider
    pub anthropic_api_key: String,
    pub claude_model: String,
    /// Messages API root; override for a gateway or proxy.
    pub anthropic_base_url: Option<String>,

    // Scrape engine
    pub lock_timeout_secs: i64,
    pub freshness_hours: i64,
    pub horizon_days: i64,
    pub extension_margin_days: i64,
    pub step_timeout_secs: u64,

    // Posters
    pub poster_dir: String,

    // Daily refresh
    pub total_agents: u32,
}

impl Config {
    /// Load configuration for commands that scrape (needs the Anthropic key).
    pub fn from_env() -> Result<Self, CineStreamError> {
        let mut config = Self::store_from_env()?;
        config.anthropic_api_key = required_env("ANTHROPIC_API_KEY")?;
        Ok(config)
    }

    /// Load a minimal config for read-only commands (status, migrate).
    pub fn store_from_env() -> Result<Self, CineStreamError> {
        let mongo_uri = required_env("MONGO_URI")?;
        let mongo_database = env::var("MONGO_DATABASE")
            .ok()
            .filter(|db| !db.is_empty())
            .unwrap_or_else(|| database_from_uri(&mongo_uri));

        Ok(Self {
            mongo_uri,
            mongo_database,
            anthropic_api_key: String::new(),
            claude_model: resolve_model(&env::var("CLAUDE_MODEL").unwrap_or_default()),
            anthropic_base_url: env::var("ANTHROPIC_BASE_URL")
                .ok()
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            lock_timeout_secs: parsed_env("LOCK_TIMEOUT_SECS", LOCK_TIMEOUT_SECS)?,
            freshness_hours: parsed_env("FRESHNESS_HOURS", FRESHNESS_HOURS)?,
            horizon_days: parsed_env("SCRAPE_HORIZON_DAYS", SCRAPE_HORIZON_DAYS)?,
            extension_margin_days: parsed_env("EXTENSION_MARGIN_DAYS", EXTENSION_MARGIN_DAYS)?,
            step_timeout_secs: parsed_env("STEP_TIMEOUT_SECS", STEP_TIMEOUT_SECS)?,
            poster_dir: env::var("POSTER_DIR")
                .unwrap_or_else(|_| "static/movie_images".to_string()),
            total_agents: parsed_env("TOTAL_AGENTS", TOTAL_REFRESH_AGENTS)?,
        })
    }

    /// Log the effective configuration without secrets.
    pub fn log_redacted(&self) {
        info!(
            mongo_database = self.mongo_database.as_str(),
            claude_model = self.claude_model.as_str(),
            anthropic_key_set = !self.anthropic_api_key.is_empty(),
            lock_timeout_secs = self.lock_timeout_secs,
            freshness_hours = self.freshness_hours,
            horizon_days = self.horizon_days,
            extension_margin_days = self.extension_margin_days,
            step_timeout_secs = self.step_timeout_secs,
            poster_dir = self.poster_dir.as_str(),
            total_agents = self.total_agents,
            "Configuration loaded"
        );
    }
}

/// Map a model alias ("haiku", "sonnet") to its id. Unknown non-empty values
/// are taken as a literal model id; empty falls back to Haiku.
pub fn resolve_model(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return MODEL_ALIASES[0].1.to_string();
    }
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(value))
        .map(|(_, id)| id.to_string())
        .unwrap_or_else(|| value.to_string())
}

/// Database name from the URI path (`mongodb://host/db?opts`), else `movie_db`.
pub fn database_from_uri(uri: &str) -> String {
    uri.split_once("://")
        .map(|(_, rest)| rest)
        .and_then(|rest| rest.split_once('/'))
        .map(|(_, path)| path.split('?').next().unwrap_or_default())
        .filter(|db| !db.is_empty())
        .unwrap_or("movie_db")
        .to_string()
}

fn required_env(key: &str) -> Result<String, CineStreamError> {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CineStreamError::Config(format!("{key} environment variable is required")))
}

fn parsed_env<T: FromStr>(key: &str, default: T) -> Result<T, CineStreamError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| CineStreamError::Config(format!("{key} must be a number, got {raw:?}"))),
        _ => Ok(default),
    }
}
