//! Durable storage for the lease table.
//!
//! [`LeaseStore`] is the load-all/save-all contract; [`JsonFileStore`] keeps
//! the records in a pretty-printed JSON array. [`Persistence`] wraps a store
//! with one lock shared by loads and saves and a bounded retry loop with
//! jittered delays. A save requested while a load is running is skipped so
//! a half-populated table never overwrites the file being read.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::lease::Lease;

/// Load-all/save-all access to persisted lease records.
pub trait LeaseStore: Send + Sync + 'static {
    /// Human-readable location, used in logs and errors.
    fn describe(&self) -> String;

    fn load_all(&self) -> impl Future<Output = Result<Vec<Lease>>> + Send;

    fn save_all(&self, leases: &[Lease]) -> impl Future<Output = Result<()>> + Send;
}

/// Lease records in a JSON file.
///
/// A missing file loads as an empty table. Saves write a sibling temp file
/// and rename it over the target.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LeaseStore for JsonFileStore {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn load_all(&self) -> Result<Vec<Lease>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let leases: Vec<Lease> = serde_json::from_str(&content)?;
        Ok(leases)
    }

    async fn save_all(&self, leases: &[Lease]) -> Result<()> {
        let content = serde_json::to_string_pretty(leases)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

/// How many times to try a load or save, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    fn jittered_delay(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = (self.max_delay.as_millis() as u64).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

/// A [`LeaseStore`] behind a lock with retries.
pub struct Persistence<S> {
    store: S,
    policy: RetryPolicy,
    lock: Mutex<()>,
    loading: AtomicBool,
}

impl<S: LeaseStore> Persistence<S> {
    pub fn new(store: S) -> Self {
        Self::with_policy(store, RetryPolicy::default())
    }

    pub fn with_policy(store: S, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            lock: Mutex::new(()),
            loading: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Loads every record, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] once the retry budget is spent.
    pub async fn load_all(&self) -> Result<Vec<Lease>> {
        self.loading.store(true, Ordering::SeqCst);
        let result = {
            let _guard = self.lock.lock().await;
            self.retry("load", || self.store.load_all()).await
        };
        self.loading.store(false, Ordering::SeqCst);
        result
    }

    /// Saves `leases`, retrying transient failures.
    ///
    /// Returns `Ok(false)` without touching the store when a load is in
    /// progress.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] once the retry budget is spent.
    pub async fn save_all(&self, leases: &[Lease]) -> Result<bool> {
        if self.is_loading() {
            debug!("Skipping lease save while leases are loading");
            return Ok(false);
        }

        let _guard = self.lock.lock().await;
        self.retry("save", || self.store.save_all(leases)).await?;
        debug!("Saved {} lease(s) to {}", leases.len(), self.store.describe());
        Ok(true)
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut attempt_number = 1;

        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(source) if attempt_number >= attempts => {
                    error!(
                        "Giving up on lease {} at {} after {} attempts: {}",
                        operation,
                        self.store.describe(),
                        attempts,
                        source
                    );
                    return Err(Error::Persistence {
                        operation,
                        target: self.store.describe(),
                        attempts,
                        source: Box::new(source),
                    });
                }
                Err(source) => {
                    warn!(
                        "Lease {} attempt {}/{} failed: {}",
                        operation, attempt_number, attempts, source
                    );
                    tokio::time::sleep(self.policy.jittered_delay()).await;
                    attempt_number += 1;
                }
            }
        }
    }
}
