//! Rotating credential pool for the K2Think upstream
//!
//! Holds the bearer credentials scraped from the upstream login flow and hands
//! them out round-robin. Each request reports its outcome back to the pool so
//! failing credentials are retired and a fresh generation is fetched when the
//! failure pattern says the whole set has gone stale.
//!
//! Credential lifecycle:
//! 1. `Refresher` calls the `CredentialSource` → pool generation replaced, all active
//! 2. `TokenPool::next_token` rotates through active records
//! 3. Generic failures accumulate per token → deactivated at `max_failures_per_token`
//! 4. 401/403-class failures accumulate pool-wide → force refresh fired
//! 5. Force refresh runs detached, guarded so only one login storm is in flight
//! 6. Background task repeats step 1 on a fixed interval

pub mod classify;
pub mod error;
pub mod pool;
pub mod refresh;
pub mod source;

pub use classify::{demands_immediate_refresh, is_upstream_auth_error};
pub use error::{Error, Result};
pub use pool::{
    ConsecutiveStatus, PoolStats, RefreshOutcome, Thresholds, TokenPool, TokenSummary,
};
pub use refresh::{RefreshStatus, Refresher, spawn_refresh_task};
pub use source::{CredentialSource, RefreshFuture, RefreshTrigger};
