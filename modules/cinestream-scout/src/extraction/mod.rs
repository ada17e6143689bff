// Extraction seam: one call per ExtractionStep, typed result per step kind.
//
// ClaudeExtractor is the production implementation (web search + forced
// tool_use). testing::ScriptedExtractor replays canned payloads.

pub mod claude;
pub mod prompts;
pub mod schema;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use cinestream_common::{MovieCandidate, TheaterCandidate, TheaterShowtimes};

use crate::decomposer::{ExtractionStep, StepKind};

pub use claude::ClaudeExtractor;

/// Result of one extraction step. The variant must match the step's kind.
#[derive(Debug, Clone, PartialEq)]
pub enum StepPayload {
    Theaters(Vec<TheaterCandidate>),
    Movies(Vec<MovieCandidate>),
    Showtimes(Vec<TheaterShowtimes>),
}

impl StepPayload {
    /// Empty result of the right shape, used when a step fails.
    pub fn empty_for(kind: StepKind) -> Self {
        match kind {
            StepKind::TheaterDiscovery => StepPayload::Theaters(Vec::new()),
            StepKind::MovieDiscovery => StepPayload::Movies(Vec::new()),
            StepKind::MovieDayExtraction => StepPayload::Showtimes(Vec::new()),
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            StepPayload::Theaters(_) => StepKind::TheaterDiscovery,
            StepPayload::Movies(_) => StepKind::MovieDiscovery,
            StepPayload::Showtimes(_) => StepKind::MovieDayExtraction,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            StepPayload::Theaters(items) => items.is_empty(),
            StepPayload::Movies(items) => items.is_empty(),
            StepPayload::Showtimes(items) => items.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StepPayload::Theaters(items) => items.len(),
            StepPayload::Movies(items) => items.len(),
            StepPayload::Showtimes(items) => items.iter().map(|r| r.showtimes.len()).sum(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed extraction result: {0}")]
    Malformed(String),

    #[error("extraction upstream error: {0}")]
    Upstream(String),
}

#[async_trait]
pub trait ExtractionClient: Send + Sync {
    /// Run one step. Errors are per-step: the orchestrator treats them as an
    /// empty result and moves on.
    async fn execute(&self, step: &ExtractionStep) -> Result<StepPayload, ExtractionError>;
}
