//! Daily refresh: each agent owns a stable slice of the known cities.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use cinestream_common::{CityKey, LocationStatus};

use crate::clock::Clock;
use crate::freshness::evaluate_status;
use crate::orchestrator::{Orchestrator, ScrapeOutcome};
use crate::posters::PosterCache;
use crate::traits::LocationStore;

const PAUSE_BETWEEN_CITIES: Duration = Duration::from_secs(2);

/// Agent that owns `city` among `total_agents`: sha256 of the key, first
/// eight bytes big-endian, modulo the agent count.
pub fn assigned_agent(city: &CityKey, total_agents: u32) -> u32 {
    let digest = Sha256::digest(city.as_str().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(total_agents.max(1))) as u32
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshStats {
    pub assigned: u32,
    pub refreshed: u32,
    pub skipped: u32,
    pub failed: u32,
    pub posters_removed: usize,
}

impl fmt::Display for RefreshStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Refresh Complete ===")?;
        writeln!(f, "Cities assigned:  {}", self.assigned)?;
        writeln!(f, "Refreshed:        {}", self.refreshed)?;
        writeln!(f, "Skipped:          {}", self.skipped)?;
        writeln!(f, "Failed:           {}", self.failed)?;
        writeln!(f, "Posters removed:  {}", self.posters_removed)?;
        Ok(())
    }
}

pub struct RefreshAgent {
    agent_id: u32,
    total_agents: u32,
    locations: Arc<dyn LocationStore>,
    orchestrator: Arc<Orchestrator>,
    clock: Arc<dyn Clock>,
    posters: Option<PosterCache>,
    pause: Duration,
}

impl RefreshAgent {
    pub fn new(
        agent_id: u32,
        total_agents: u32,
        locations: Arc<dyn LocationStore>,
        orchestrator: Arc<Orchestrator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if total_agents == 0 || agent_id >= total_agents {
            bail!("agent id {agent_id} out of range for {total_agents} agents");
        }
        Ok(Self {
            agent_id,
            total_agents,
            locations,
            orchestrator,
            clock,
            posters: None,
            pause: PAUSE_BETWEEN_CITIES,
        })
    }

    /// Agent 0 also prunes the poster directory.
    pub fn with_posters(mut self, posters: PosterCache) -> Self {
        self.posters = Some(posters);
        self
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub async fn run(&self) -> Result<RefreshStats> {
        let mut stats = RefreshStats::default();
        let settings = self.orchestrator.settings();

        let cities: Vec<_> = self
            .locations
            .list_locations()
            .await?
            .into_iter()
            .filter(|l| assigned_agent(&l.city_key, self.total_agents) == self.agent_id)
            .collect();
        stats.assigned = cities.len() as u32;
        info!(agent = self.agent_id, total = self.total_agents, cities = stats.assigned, "Refresh agent starting");

        let mut first = true;
        for location in &cities {
            let city = &location.city_key;
            match evaluate_status(Some(location), self.clock.now(), settings.lock_timeout, settings.freshness) {
                LocationStatus::Fresh => {
                    stats.skipped += 1;
                    continue;
                }
                LocationStatus::Processing => {
                    info!(city = %city, "Scrape already running, skipping");
                    stats.skipped += 1;
                    continue;
                }
                LocationStatus::Stale => {}
            }

            if !first {
                tokio::time::sleep(self.pause).await;
            }
            first = false;

            match self.orchestrator.run(city).await {
                Ok(ScrapeOutcome::AlreadyInProgress) => stats.skipped += 1,
                Ok(_) => stats.refreshed += 1,
                Err(e) => {
                    error!(city = %city, error = %e, "Refresh failed");
                    stats.failed += 1;
                }
            }
        }

        if self.agent_id == 0 {
            if let Some(posters) = &self.posters {
                match posters.cleanup_expired().await {
                    Ok(removed) => stats.posters_removed = removed,
                    Err(e) => warn!(error = %e, "Poster cleanup failed"),
                }
            }
        }

        info!(
            agent = self.agent_id,
            refreshed = stats.refreshed,
            skipped = stats.skipped,
            failed = stats.failed,
            "Refresh agent finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_is_stable_and_in_range() {
        let kyiv = CityKey::parse("Kyiv, Ukraine").unwrap();
        let first = assigned_agent(&kyiv, 20);
        assert!(first < 20);
        assert_eq!(assigned_agent(&kyiv, 20), first);
        assert_eq!(assigned_agent(&kyiv, 1), 0);
    }

    #[test]
    fn assignment_spreads_cities() {
        let cities = [
            "Kyiv, Ukraine",
            "Lviv, Ukraine",
            "Odesa, Ukraine",
            "Kharkiv, Ukraine",
            "Warsaw, Poland",
            "Berlin, Germany",
            "Paris, France",
            "London, UK",
            "Austin, TX, USA",
            "Saint Paul, MN, USA",
        ];
        let agents: std::collections::HashSet<u32> = cities
            .iter()
            .map(|c| assigned_agent(&CityKey::parse(c).unwrap(), 4))
            .collect();
        assert!(agents.len() > 1);
    }
}
