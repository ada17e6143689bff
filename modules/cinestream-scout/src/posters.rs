use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use cinestream_common::MOVIE_TTL_DAYS;

/// URL prefix under which the poster directory is served.
pub const PUBLIC_PREFIX: &str = "/static/movie_images";

const MIN_IMAGE_BYTES: usize = 100;
const MAX_TITLE_CHARS: usize = 30;
const KNOWN_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif"];

/// Downloads movie posters once into a local directory.
#[derive(Clone)]
pub struct PosterCache {
    dir: PathBuf,
    http: reqwest::Client,
    max_age: Duration,
}

impl PosterCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("Mozilla/5.0 (compatible; cinestream-poster-fetch/1.0)")
            .build()
            .context("Failed to build poster HTTP client")?;
        Ok(Self {
            dir: dir.into(),
            http,
            max_age: Duration::from_secs(MOVIE_TTL_DAYS as u64 * 24 * 60 * 60),
        })
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Download `url` unless already cached. Returns the public path, or
    /// `None` when the URL does not point at a usable image.
    pub async fn fetch(&self, url: &str, title: Option<&str>) -> Result<Option<String>> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            debug!(url, "Skipping non-http poster URL");
            return Ok(None);
        }

        let filename = poster_filename(url, title);
        let path = self.dir.join(&filename);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Some(public_path(&filename)));
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Poster download failed: {url}"))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("image/") {
            warn!(url, content_type = content_type.as_str(), "Poster URL is not an image");
            return Ok(None);
        }

        let bytes = response.bytes().await.context("Failed to read poster body")?;
        if bytes.len() < MIN_IMAGE_BYTES {
            warn!(url, bytes = bytes.len(), "Poster body too small, ignoring");
            return Ok(None);
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!(url, file = filename.as_str(), bytes = bytes.len(), "Poster cached");
        Ok(Some(public_path(&filename)))
    }

    /// Delete cached posters older than the movie retention window.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {}", self.dir.display())),
        };

        let cutoff = SystemTime::now()
            .checked_sub(self.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::now());
            if modified < cutoff {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove poster"),
                }
            }
        }

        info!(removed, dir = %self.dir.display(), "Poster cleanup complete");
        Ok(removed)
    }
}

/// `<title>_<hash>.<ext>`: title sanitized and cut to 30 chars, hash is the
/// first 12 hex chars of sha256(url). Without a usable title only the hash
/// is used.
pub fn poster_filename(url: &str, title: Option<&str>) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    let hash = &digest[..12];
    let ext = extension_of(url);

    let clean: String = title
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect::<String>()
        .trim_end()
        .replace(' ', "_");

    if clean.is_empty() {
        format!("{hash}.{ext}")
    } else {
        format!("{clean}_{hash}.{ext}")
    }
}

fn extension_of(url: &str) -> &'static str {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_default();
    path.rsplit_once('.')
        .and_then(|(_, ext)| KNOWN_EXTENSIONS.iter().find(|known| **known == ext))
        .copied()
        .unwrap_or("jpg")
}

fn public_path(filename: &str) -> String {
    format!("{PUBLIC_PREFIX}/{filename}")
}
