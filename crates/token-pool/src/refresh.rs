//! Pool refresh: scheduled and forced
//!
//! `Refresher` owns the single-flight guard around `TokenPool::reload`. Forced
//! refreshes arrive through `RefreshTrigger::trigger` from the request path and
//! run detached; the periodic task and admin calls use `refresh_now`. Whichever
//! caller wins the guard performs the reload, everyone else is told it was
//! skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::pool::{RefreshOutcome, TokenPool};
use crate::source::RefreshTrigger;

#[derive(Debug, Default)]
struct History {
    refresh_count: u64,
    error_count: u64,
    last_refresh: Option<u64>,
    last_error: Option<String>,
    last_tokens: usize,
}

struct Inner {
    pool: Weak<TokenPool>,
    in_progress: AtomicBool,
    interval: Duration,
    history: Mutex<History>,
}

/// Clears the in-progress flag when the owning refresh finishes or panics.
struct InProgress(Arc<Inner>);

impl Drop for InProgress {
    fn drop(&mut self) {
        self.0.in_progress.store(false, Ordering::Release);
    }
}

impl Inner {
    fn try_begin(self: &Arc<Self>) -> Option<InProgress> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InProgress(self.clone()))
    }

    async fn run(&self, reason: &str) -> RefreshOutcome {
        let Some(pool) = self.pool.upgrade() else {
            debug!(reason, "pool dropped, refresh abandoned");
            return RefreshOutcome::Skipped;
        };

        info!(reason, "refreshing token pool");
        let outcome = pool.reload().await;

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        match &outcome {
            RefreshOutcome::Replaced { tokens } => {
                history.refresh_count += 1;
                history.last_refresh = Some(now_secs());
                history.last_tokens = *tokens;
                metrics::counter!("token_pool_refresh_total", "result" => "replaced").increment(1);
            }
            RefreshOutcome::Unchanged { reason: why } => {
                history.error_count += 1;
                history.last_error = Some(why.clone());
                metrics::counter!("token_pool_refresh_total", "result" => "unchanged").increment(1);
            }
            RefreshOutcome::Skipped => {}
        }
        outcome
    }
}

/// Single-flight refresher bound to one pool. Cheap to clone.
#[derive(Clone)]
pub struct Refresher {
    inner: Arc<Inner>,
}

impl Refresher {
    /// Create a refresher for `pool` and register it as the pool's
    /// force-refresh trigger.
    ///
    /// Holds only a weak reference to the pool, so the pool → trigger →
    /// refresher chain does not keep itself alive.
    pub fn install(pool: &Arc<TokenPool>, interval: Duration) -> Self {
        let refresher = Self {
            inner: Arc::new(Inner {
                pool: Arc::downgrade(pool),
                in_progress: AtomicBool::new(false),
                interval,
                history: Mutex::new(History::default()),
            }),
        };
        if !pool.set_refresh_trigger(Arc::new(refresher.clone())) {
            warn!("token pool already had a refresh trigger; keeping the existing one");
        }
        refresher
    }

    /// Reload the pool now unless a refresh is already running.
    pub async fn refresh_now(&self, reason: &str) -> RefreshOutcome {
        let Some(_guard) = self.inner.try_begin() else {
            debug!(reason, "refresh already in progress, skipping");
            return RefreshOutcome::Skipped;
        };
        self.inner.run(reason).await
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.in_progress.load(Ordering::Acquire)
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn status(&self) -> RefreshStatus {
        let history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        RefreshStatus {
            refreshing: self.is_refreshing(),
            refresh_count: history.refresh_count,
            error_count: history.error_count,
            last_refresh: history.last_refresh,
            last_error: history.last_error.clone(),
            last_tokens: history.last_tokens,
            interval_secs: self.inner.interval.as_secs(),
        }
    }
}

impl RefreshTrigger for Refresher {
    fn trigger(&self, reason: &'static str) {
        let Some(guard) = self.inner.try_begin() else {
            debug!(reason, "force refresh already in progress");
            return;
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match inner.run(reason).await {
                RefreshOutcome::Replaced { tokens } => {
                    info!(reason, tokens, "force refresh completed");
                }
                RefreshOutcome::Unchanged { reason: why } => {
                    warn!(reason, error = %why, "force refresh left pool unchanged");
                }
                RefreshOutcome::Skipped => {}
            }
        });
    }
}

/// Refresher state for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshStatus {
    pub refreshing: bool,
    pub refresh_count: u64,
    pub error_count: u64,
    pub last_refresh: Option<u64>,
    pub last_error: Option<String>,
    pub last_tokens: usize,
    pub interval_secs: u64,
}

/// Spawn the periodic refresh loop.
///
/// The first tick is skipped; startup performs its own initial refresh.
pub fn spawn_refresh_task(refresher: Refresher) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(refresher.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match refresher.refresh_now("scheduled").await {
                RefreshOutcome::Replaced { tokens } => info!(tokens, "scheduled refresh completed"),
                RefreshOutcome::Unchanged { reason } => {
                    warn!(error = %reason, "scheduled refresh left pool unchanged")
                }
                RefreshOutcome::Skipped => debug!("scheduled refresh skipped"),
            }
        }
    })
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::pool::Thresholds;
    use crate::source::{CredentialSource, RefreshFuture};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Returns `gen-N-a`, `gen-N-b` on the Nth call; optionally waits on a gate.
    struct GenerationSource {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail: bool,
    }

    impl GenerationSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: None,
                fail: false,
            })
        }
    }

    impl CredentialSource for GenerationSource {
        fn name(&self) -> &str {
            "generations"
        }

        fn refresh(&self) -> RefreshFuture<'_> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                if self.fail {
                    return Err(Error::RefreshFailed("signin rejected".into()));
                }
                Ok(vec![format!("gen-{n}-a"), format!("gen-{n}-b")])
            })
        }
    }

    fn pool_for(source: Arc<GenerationSource>) -> Arc<TokenPool> {
        Arc::new(TokenPool::new(Thresholds::default(), source))
    }

    async fn wait_for_generation(pool: &TokenPool, generation: u64) {
        for _ in 0..200 {
            if pool.stats().await.generation >= generation {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never reached generation {generation}");
    }

    #[tokio::test]
    async fn refresh_now_replaces_generation() {
        let source = GenerationSource::new();
        let pool = pool_for(source.clone());
        let refresher = Refresher::install(&pool, Duration::from_secs(3600));

        let outcome = refresher.refresh_now("startup").await;
        assert_eq!(outcome, RefreshOutcome::Replaced { tokens: 2 });
        assert_eq!(pool.next_token().await.as_deref(), Some("gen-1-a"));

        let status = refresher.status();
        assert_eq!(status.refresh_count, 1);
        assert_eq!(status.last_tokens, 2);
        assert!(status.last_refresh.is_some());
        assert!(!status.refreshing);
    }

    #[tokio::test]
    async fn failed_refresh_is_recorded() {
        let source = Arc::new(GenerationSource {
            calls: AtomicUsize::new(0),
            gate: None,
            fail: true,
        });
        let pool = pool_for(source);
        let refresher = Refresher::install(&pool, Duration::from_secs(3600));

        assert!(matches!(
            refresher.refresh_now("manual").await,
            RefreshOutcome::Unchanged { .. }
        ));
        let status = refresher.status();
        assert_eq!(status.error_count, 1);
        assert!(status.last_error.unwrap().contains("signin rejected"));
    }

    #[tokio::test]
    async fn concurrent_refresh_is_skipped() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(GenerationSource {
            calls: AtomicUsize::new(0),
            gate: Some(gate.clone()),
            fail: false,
        });
        let pool = pool_for(source.clone());
        let refresher = Refresher::install(&pool, Duration::from_secs(3600));

        let first = {
            let refresher = refresher.clone();
            tokio::spawn(async move { refresher.refresh_now("first").await })
        };
        while !refresher.is_refreshing() {
            tokio::task::yield_now().await;
        }

        assert_eq!(refresher.refresh_now("second").await, RefreshOutcome::Skipped);
        // trigger while running is a no-op too
        refresher.trigger("upstream 401");

        gate.notify_one();
        assert_eq!(
            first.await.unwrap(),
            RefreshOutcome::Replaced { tokens: 2 }
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(!refresher.is_refreshing());
    }

    #[tokio::test]
    async fn upstream_401_triggers_detached_refresh() {
        let source = GenerationSource::new();
        let pool = pool_for(source.clone());
        let _refresher = Refresher::install(&pool, Duration::from_secs(3600));
        pool.replace(vec!["stale".into()]).await;
        let generation = pool.stats().await.generation;

        pool.mark_failure("stale", "upstream error: 401: Not authenticated")
            .await;

        wait_for_generation(&pool, generation + 1).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.next_token().await.as_deref(), Some("gen-1-a"));
    }

    #[tokio::test]
    async fn refresher_does_not_keep_pool_alive() {
        let source = GenerationSource::new();
        let pool = pool_for(source);
        let refresher = Refresher::install(&pool, Duration::from_secs(3600));
        drop(pool);
        assert_eq!(refresher.refresh_now("late").await, RefreshOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_skips_first_tick() {
        let source = GenerationSource::new();
        let pool = pool_for(source.clone());
        let refresher = Refresher::install(&pool, Duration::from_secs(60));
        let handle = spawn_refresh_task(refresher);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        handle.abort();
    }
}
