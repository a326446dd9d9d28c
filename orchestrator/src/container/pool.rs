//! Warm container pool for transient execution
//!
//! The pool keeps up to `pool.size` created-but-not-started containers ready.
//! Entries are consumed by `acquire` and never returned: a container that ran
//! user code is torn down, and maintenance replenishes the pool separately.
//! Entries older than `pool.max_age` are evicted on every maintenance tick and
//! skipped by `acquire`.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{release_container, ContainerCreator};
use crate::config::SandboxConfig;
use crate::error::SandboxResult;
use crate::metrics;
use crate::models::PoolStats;
use crate::runtime::{ContainerSpec, RuntimeClient};

/// Lifecycle state of a pool entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Idle,
    InUse,
    Expired,
}

/// A pre-created container
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub container_id: String,
    pub created_at: Instant,
    pub state: EntryState,
}

impl PoolEntry {
    fn new(container_id: String, state: EntryState) -> Self {
        Self {
            container_id,
            created_at: Instant::now(),
            state,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Oldest at the front
    idle: VecDeque<PoolEntry>,
    /// Creations started by maintenance but not yet finished
    pending: usize,
    closed: bool,
}

impl PoolState {
    /// Remove and return every entry older than `max_age`
    fn take_expired(&mut self, max_age: std::time::Duration) -> Vec<PoolEntry> {
        let mut expired = Vec::new();
        while let Some(front) = self.idle.front() {
            if front.created_at.elapsed() <= max_age {
                break;
            }
            if let Some(mut entry) = self.idle.pop_front() {
                entry.state = EntryState::Expired;
                expired.push(entry);
            }
        }
        expired
    }
}

/// Bounded set of idle containers with age-based eviction
pub struct ContainerPool {
    config: Arc<SandboxConfig>,
    runtime: Arc<dyn RuntimeClient>,
    creator: Arc<ContainerCreator>,
    state: Mutex<PoolState>,
}

impl ContainerPool {
    pub fn new(
        config: Arc<SandboxConfig>,
        runtime: Arc<dyn RuntimeClient>,
        creator: Arc<ContainerCreator>,
    ) -> Self {
        Self {
            config,
            runtime,
            creator,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Take a container for one transient execution
    ///
    /// Returns a pooled entry when one is fresh enough, otherwise creates a
    /// container on the spot through the shared creation gate.
    pub async fn acquire(&self) -> SandboxResult<PoolEntry> {
        if self.config.pool.enabled {
            let (expired, hit) = {
                let mut state = self.state.lock().await;
                let expired = state.take_expired(self.config.pool.max_age());
                let hit = state.idle.pop_back();
                metrics::record_pool_size(state.idle.len());
                (expired, hit)
            };

            self.evict(expired).await;

            if let Some(mut entry) = hit {
                entry.state = EntryState::InUse;
                metrics::record_pool_hit();
                debug!(container_id = %entry.container_id, "Pool hit");
                return Ok(entry);
            }

            metrics::record_pool_miss();
            debug!("Pool miss, creating container");
        }

        let spec = ContainerSpec::transient(&self.config)?;
        let container_id = self.creator.create(&spec).await?;
        Ok(PoolEntry::new(container_id, EntryState::InUse))
    }

    /// One maintenance pass: evict aged entries, then refill to capacity
    pub async fn maintain(&self) {
        if !self.config.pool.enabled {
            return;
        }

        let capacity = self.config.pool.size;
        let (expired, deficit) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            let expired = state.take_expired(self.config.pool.max_age());
            let deficit = capacity.saturating_sub(state.idle.len() + state.pending);
            state.pending += deficit;
            (expired, deficit)
        };

        self.evict(expired).await;

        if deficit == 0 {
            return;
        }

        let spec = match ContainerSpec::transient(&self.config) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(error = %e, "Cannot build pool container spec");
                self.state.lock().await.pending -= deficit;
                return;
            }
        };

        let mut creations: FuturesUnordered<_> =
            (0..deficit).map(|_| self.creator.create(&spec)).collect();

        while let Some(result) = creations.next().await {
            let leftover = {
                let mut state = self.state.lock().await;
                state.pending -= 1;
                match result {
                    Ok(container_id) if !state.closed && state.idle.len() < capacity => {
                        state.idle.push_back(PoolEntry::new(container_id, EntryState::Idle));
                        metrics::record_pool_size(state.idle.len());
                        None
                    }
                    Ok(container_id) => Some(container_id),
                    Err(e) => {
                        warn!(error = %e, "Pool replenishment failed; retrying next tick");
                        None
                    }
                }
            };

            if let Some(container_id) = leftover {
                if let Err(e) = release_container(self.runtime.as_ref(), &container_id).await {
                    warn!(container_id = %container_id, error = %e, "Failed to release surplus container");
                }
            }
        }
    }

    /// Run `maintain` on every tick until `shutdown` is cancelled
    pub fn spawn_maintenance(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.pool.maintenance_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                size = self.config.pool.size,
                max_age_secs = self.config.pool.max_age,
                "Pool maintenance started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.maintain().await,
                }
            }

            debug!("Pool maintenance stopped");
        })
    }

    /// Stop accepting new entries and remove every idle container
    pub async fn drain(&self) -> usize {
        let entries: Vec<PoolEntry> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.idle.drain(..).collect()
        };

        let count = entries.len();
        self.release_all(entries).await;
        metrics::record_pool_size(0);
        count
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            idle: state.idle.len(),
            pending: state.pending,
            capacity: if self.config.pool.enabled {
                self.config.pool.size
            } else {
                0
            },
        }
    }

    /// Release entries that outlived `max_age`
    async fn evict(&self, expired: Vec<PoolEntry>) {
        if expired.is_empty() {
            return;
        }
        info!(count = expired.len(), "Evicting aged pool containers");
        metrics::record_pool_eviction(expired.len());
        self.release_all(expired).await;
    }

    async fn release_all(&self, entries: Vec<PoolEntry>) {
        let mut releases: FuturesUnordered<_> = entries
            .into_iter()
            .map(|entry| async move {
                let result = release_container(self.runtime.as_ref(), &entry.container_id).await;
                (entry, result)
            })
            .collect();

        while let Some((entry, result)) = releases.next().await {
            if let Err(e) = result {
                warn!(container_id = %entry.container_id, error = %e, "Failed to release pool container");
            }
        }
    }
}
