use thiserror::Error;

#[derive(Error, Debug)]
pub enum CineStreamError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid city key {0:?}: expected \"City\", \"City, Country\" or \"City, Region, Country\"")]
    InvalidCityKey(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
