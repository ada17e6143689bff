use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use cinestream_common::{CityKey, LocationStatus};

use crate::traits::LocationStore;

/// Proof that this worker holds a city's lock: the lock timestamp it last
/// wrote. Renew and release only touch the Location while that timestamp is
/// still the stored one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    city: CityKey,
    held_since: DateTime<Utc>,
}

impl LockLease {
    pub fn city(&self) -> &CityKey {
        &self.city
    }

    pub fn held_since(&self) -> DateTime<Utc> {
        self.held_since
    }
}

/// Per-city mutual exclusion over the Location document.
///
/// At most one holder per city at any instant. A holder that never releases
/// stops blocking others once its lock is older than `timeout`; a holder
/// that keeps working renews before each step so that never happens to it.
pub struct LockManager {
    store: Arc<dyn LocationStore>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn LocationStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `Ok(None)` when another worker holds a live lock. Store failures are
    /// errors, never a silent "not acquired".
    pub async fn acquire(&self, city: &CityKey, now: DateTime<Utc>) -> Result<Option<LockLease>> {
        if !self.store.try_acquire_lock(city, now, self.timeout).await? {
            info!(city = %city, "Scrape lock held elsewhere, skipping");
            return Ok(None);
        }
        info!(city = %city, "Scrape lock acquired");
        Ok(Some(LockLease {
            city: city.clone(),
            held_since: now,
        }))
    }

    /// Extend the lease to `now`. `Ok(false)` means the lock was lost (it
    /// expired and another worker reclaimed it) and the caller must stop
    /// writing.
    pub async fn renew(&self, lease: &mut LockLease, now: DateTime<Utc>) -> Result<bool> {
        let renewed = self
            .store
            .renew_lock(&lease.city, lease.held_since, now)
            .await?;
        if renewed {
            debug!(city = %lease.city, "Scrape lock renewed");
            lease.held_since = now;
        } else {
            warn!(city = %lease.city, held_since = %lease.held_since, "Scrape lock lost");
        }
        Ok(renewed)
    }

    /// Clear the lock on success and failure alike. A lease that was already
    /// lost leaves the current holder's lock alone and returns `Ok(false)`.
    pub async fn release(
        &self,
        lease: LockLease,
        status: LocationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let status = if status == LocationStatus::Processing {
            warn!(city = %lease.city, "Refusing to release into processing, using stale");
            LocationStatus::Stale
        } else {
            status
        };
        let released = self
            .store
            .release_lock(&lease.city, lease.held_since, status, now)
            .await?;
        if released {
            info!(city = %lease.city, status = %status, "Scrape lock released");
        } else {
            warn!(city = %lease.city, "Scrape lock no longer ours, nothing released");
        }
        Ok(released)
    }
}
