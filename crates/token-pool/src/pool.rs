//! Token records, round-robin selection and failure accounting
//!
//! All mutable state sits behind a single async mutex so that selection,
//! outcome reporting and generation swaps are linearizable. Force-refresh
//! decisions are made under the lock and fired after it is released; the
//! trigger itself never touches pool state.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::classify::{demands_immediate_refresh, is_upstream_auth_error};
use crate::error::{Error, Result};
use crate::source::{CredentialSource, RefreshTrigger};

/// Failure thresholds governing deactivation and force refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Per-token failures before the token is deactivated
    pub max_failures_per_token: u32,
    /// Pool-wide consecutive generic failures before a force refresh
    pub consecutive_failure_threshold: u32,
    /// Pool-wide consecutive 401/403-class failures before a force refresh
    pub upstream_error_threshold: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_failures_per_token: 3,
            consecutive_failure_threshold: 2,
            upstream_error_threshold: 2,
        }
    }
}

/// Result of asking for a new credential generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The generation was swapped for `tokens` fresh credentials.
    Replaced { tokens: usize },
    /// The source failed or returned nothing; the old generation stays.
    Unchanged { reason: String },
    /// Another refresh was already running.
    Skipped,
}

struct TokenRecord {
    credential: Secret<String>,
    index: usize,
    failure_count: u32,
    active: bool,
    last_used: Option<u64>,
    last_failure: Option<u64>,
}

impl TokenRecord {
    fn fresh(index: usize, credential: Secret<String>) -> Self {
        Self {
            credential,
            index,
            failure_count: 0,
            active: true,
            last_used: None,
            last_failure: None,
        }
    }
}

struct PoolState {
    records: Vec<TokenRecord>,
    cursor: usize,
    consecutive_failures: u32,
    consecutive_upstream_errors: u32,
    last_upstream_error: Option<u64>,
    generation: u64,
    /// Last generation the source handed us, kept for `restore_cached`
    cached: Vec<Secret<String>>,
}

impl PoolState {
    fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.active).count()
    }

    fn install(&mut self, credentials: Vec<Secret<String>>) -> usize {
        self.records = credentials
            .into_iter()
            .enumerate()
            .map(|(index, credential)| TokenRecord::fresh(index, credential))
            .collect();
        self.cursor = 0;
        self.consecutive_failures = 0;
        self.consecutive_upstream_errors = 0;
        self.generation += 1;
        self.records.len()
    }
}

/// Rotating pool of upstream credentials.
pub struct TokenPool {
    state: Mutex<PoolState>,
    thresholds: Thresholds,
    source: Arc<dyn CredentialSource>,
    trigger: OnceLock<Arc<dyn RefreshTrigger>>,
}

impl TokenPool {
    /// Create an empty pool. Call `reload` (or let the refresher do it) to
    /// populate the first generation.
    pub fn new(thresholds: Thresholds, source: Arc<dyn CredentialSource>) -> Self {
        Self {
            state: Mutex::new(PoolState {
                records: Vec::new(),
                cursor: 0,
                consecutive_failures: 0,
                consecutive_upstream_errors: 0,
                last_upstream_error: None,
                generation: 0,
                cached: Vec::new(),
            }),
            thresholds,
            source,
            trigger: OnceLock::new(),
        }
    }

    /// Register the force-refresh hook. Returns false if one was already set.
    pub fn set_refresh_trigger(&self, trigger: Arc<dyn RefreshTrigger>) -> bool {
        self.trigger.set(trigger).is_ok()
    }

    /// Hand out the next active credential in rotation.
    ///
    /// Scans at most one full lap starting at the cursor. The cursor always
    /// ends one past the returned record. Returns `None` when no record is
    /// active; the caller surfaces that as "no credential available".
    pub async fn next_token(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        let n = state.records.len();
        if n == 0 {
            return None;
        }

        for offset in 0..n {
            let idx = (state.cursor + offset) % n;
            if state.records[idx].active {
                state.cursor = (idx + 1) % n;
                let record = &mut state.records[idx];
                record.last_used = Some(now_secs());
                debug!(index = record.index, "token selected");
                return Some(record.credential.expose().clone());
            }
        }

        warn!(total = n, "no active token in pool");
        None
    }

    /// Record a successful request made with `credential`.
    ///
    /// Clears that token's failure count and the pool-wide upstream auth-error
    /// streak, whichever token accumulated it. The generic consecutive-failure
    /// counter is left alone; only a refresh or an explicit reset clears it.
    pub async fn mark_success(&self, credential: &str) {
        let mut state = self.state.lock().await;
        let Some(record) = state
            .records
            .iter_mut()
            .find(|r| r.credential.same_as(credential))
        else {
            debug!("success reported for credential outside current generation");
            return;
        };
        record.failure_count = 0;
        state.consecutive_upstream_errors = 0;
    }

    /// Record a failed request made with `credential`.
    ///
    /// Returns true iff this call deactivated the token. May fire the refresh
    /// trigger (once, after the lock is released) when the failure pattern
    /// indicates the whole generation has gone stale.
    pub async fn mark_failure(&self, credential: &str, error_message: &str) -> bool {
        let (deactivated, fire) = {
            let mut state = self.state.lock().await;
            let pool_size = state.records.len();
            let Some(pos) = state
                .records
                .iter()
                .position(|r| r.credential.same_as(credential))
            else {
                debug!("failure reported for credential outside current generation");
                return false;
            };

            let now = now_secs();
            let mut fire = None;

            if is_upstream_auth_error(error_message) {
                state.consecutive_upstream_errors += 1;
                state.last_upstream_error = Some(now);
                warn!(
                    index = state.records[pos].index,
                    consecutive = state.consecutive_upstream_errors,
                    "upstream authentication failure"
                );
                if demands_immediate_refresh(error_message) {
                    fire = Some("upstream 401");
                    state.consecutive_upstream_errors = 0;
                } else if state.consecutive_upstream_errors >= self.thresholds.upstream_error_threshold
                {
                    fire = Some("consecutive upstream auth errors");
                    state.consecutive_upstream_errors = 0;
                }
            } else {
                state.consecutive_failures += 1;
                if pool_size > 2
                    && state.consecutive_failures >= self.thresholds.consecutive_failure_threshold
                {
                    fire = Some("consecutive token failures");
                }
            }

            let record = &mut state.records[pos];
            record.failure_count += 1;
            record.last_failure = Some(now);

            let deactivated =
                record.active && record.failure_count >= self.thresholds.max_failures_per_token;
            if deactivated {
                record.active = false;
                warn!(
                    index = record.index,
                    failures = record.failure_count,
                    "token deactivated"
                );
            }
            let active = state.active_count();
            publish_active(active);

            (deactivated, fire)
        };

        if let Some(reason) = fire {
            self.fire_refresh(reason);
        }
        deactivated
    }

    /// Swap in a new generation. Every record starts active with zero
    /// failures, the cursor and both consecutive counters reset.
    pub async fn replace(&self, credentials: Vec<String>) -> usize {
        let secrets: Vec<Secret<String>> = credentials.into_iter().map(Secret::new).collect();
        let mut state = self.state.lock().await;
        state.cached = secrets.clone();
        let count = state.install(secrets);
        publish_active(count);
        info!(
            tokens = count,
            generation = state.generation,
            "token pool generation replaced"
        );
        count
    }

    /// Ask the credential source for a new generation.
    ///
    /// The source runs without the pool lock held, so selection keeps working
    /// against the old generation until the swap. Failures leave the pool
    /// untouched and are reported in the outcome rather than raised.
    pub async fn reload(&self) -> RefreshOutcome {
        match self.source.refresh().await {
            Ok(credentials) if credentials.is_empty() => {
                warn!(source = self.source.name(), "credential source returned no tokens");
                RefreshOutcome::Unchanged {
                    reason: "credential source returned no tokens".into(),
                }
            }
            Ok(credentials) => RefreshOutcome::Replaced {
                tokens: self.replace(credentials).await,
            },
            Err(e) => {
                warn!(source = self.source.name(), error = %e, "credential refresh failed");
                RefreshOutcome::Unchanged {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Reinstall the last generation the source produced, with all failure
    /// state cleared. No-op when nothing has been loaded yet.
    pub async fn restore_cached(&self) -> RefreshOutcome {
        let mut state = self.state.lock().await;
        if state.cached.is_empty() {
            return RefreshOutcome::Unchanged {
                reason: "no cached generation".into(),
            };
        }
        let cached = state.cached.clone();
        let count = state.install(cached);
        publish_active(count);
        info!(tokens = count, "token pool restored from cache");
        RefreshOutcome::Replaced { tokens: count }
    }

    /// Reactivate a single token and clear its failure count.
    pub async fn reset_token(&self, index: usize) -> Result<()> {
        let mut state = self.state.lock().await;
        let size = state.records.len();
        let record = state
            .records
            .get_mut(index)
            .ok_or(Error::InvalidIndex { index, size })?;
        record.active = true;
        record.failure_count = 0;
        let active = state.active_count();
        publish_active(active);
        info!(index, "token reset");
        Ok(())
    }

    /// Reactivate every token. Returns the pool size.
    pub async fn reset_all(&self) -> usize {
        let mut state = self.state.lock().await;
        for record in &mut state.records {
            record.active = true;
            record.failure_count = 0;
        }
        let count = state.records.len();
        publish_active(count);
        info!(tokens = count, "all tokens reset");
        count
    }

    /// Clear both pool-wide consecutive counters, returning the previous
    /// `(consecutive_failures, consecutive_upstream_errors)`.
    pub async fn reset_consecutive(&self) -> (u32, u32) {
        let mut state = self.state.lock().await;
        let previous = (state.consecutive_failures, state.consecutive_upstream_errors);
        state.consecutive_failures = 0;
        state.consecutive_upstream_errors = 0;
        info!(
            consecutive_failures = previous.0,
            consecutive_upstream_errors = previous.1,
            "consecutive failure counters reset"
        );
        previous
    }

    pub async fn credential_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    /// Snapshot of the current generation in rotation order.
    pub async fn credentials(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .map(|r| r.credential.expose().clone())
            .collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let total = state.records.len();
        let active = state.active_count();

        let mut failure_distribution = BTreeMap::new();
        for record in &state.records {
            *failure_distribution.entry(record.failure_count).or_insert(0) += 1;
        }

        PoolStats {
            total_tokens: total,
            active_tokens: active,
            inactive_tokens: total - active,
            cursor: state.cursor,
            generation: state.generation,
            max_failures_per_token: self.thresholds.max_failures_per_token,
            failure_distribution,
            consecutive_failures: state.consecutive_failures,
            consecutive_failure_threshold: self.thresholds.consecutive_failure_threshold,
            consecutive_upstream_errors: state.consecutive_upstream_errors,
            upstream_error_threshold: self.thresholds.upstream_error_threshold,
            last_upstream_error: state.last_upstream_error,
            tokens: state
                .records
                .iter()
                .map(|r| TokenSummary {
                    index: r.index,
                    active: r.active,
                    failure_count: r.failure_count,
                    last_used: r.last_used,
                    last_failure: r.last_failure,
                })
                .collect(),
        }
    }

    pub async fn consecutive_status(&self) -> ConsecutiveStatus {
        let state = self.state.lock().await;
        ConsecutiveStatus {
            consecutive_failures: state.consecutive_failures,
            consecutive_failure_threshold: self.thresholds.consecutive_failure_threshold,
            consecutive_upstream_errors: state.consecutive_upstream_errors,
            upstream_error_threshold: self.thresholds.upstream_error_threshold,
            last_upstream_error: state.last_upstream_error,
            total_tokens: state.records.len(),
            consecutive_rule_armed: state.records.len() > 2,
            trigger_registered: self.trigger.get().is_some(),
        }
    }

    fn fire_refresh(&self, reason: &'static str) {
        match self.trigger.get() {
            Some(trigger) => {
                info!(reason, "force refresh requested");
                metrics::counter!("token_pool_force_refresh_total", "reason" => reason).increment(1);
                trigger.trigger(reason);
            }
            None => warn!(reason, "force refresh wanted but no trigger registered"),
        }
    }
}

/// Point-in-time pool snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_tokens: usize,
    pub active_tokens: usize,
    pub inactive_tokens: usize,
    pub cursor: usize,
    pub generation: u64,
    pub max_failures_per_token: u32,
    /// failure_count → number of tokens at that count
    pub failure_distribution: BTreeMap<u32, usize>,
    pub consecutive_failures: u32,
    pub consecutive_failure_threshold: u32,
    pub consecutive_upstream_errors: u32,
    pub upstream_error_threshold: u32,
    pub last_upstream_error: Option<u64>,
    pub tokens: Vec<TokenSummary>,
}

/// Per-token view without the credential itself.
#[derive(Debug, Clone, Serialize)]
pub struct TokenSummary {
    pub index: usize,
    pub active: bool,
    pub failure_count: u32,
    pub last_used: Option<u64>,
    pub last_failure: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsecutiveStatus {
    pub consecutive_failures: u32,
    pub consecutive_failure_threshold: u32,
    pub consecutive_upstream_errors: u32,
    pub upstream_error_threshold: u32,
    pub last_upstream_error: Option<u64>,
    pub total_tokens: usize,
    /// The generic-failure rule only applies to pools larger than two
    pub consecutive_rule_armed: bool,
    pub trigger_registered: bool,
}

fn publish_active(active: usize) {
    metrics::gauge!("token_pool_active_tokens").set(active as f64);
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
