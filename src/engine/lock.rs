// src/engine/lock.rs

//! Cluster-wide compile lock.
//!
//! Only one director may compile a given `(package, stemcell)` pair at a
//! time. The lock is lease based: a holder renews its lease in the
//! background, so a crashed director's lock expires on its own instead of
//! blocking the pair forever.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{CompileError, Result};
use crate::types::{PackageId, StemcellId};

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// The caller now holds the lock; `token` identifies the lease.
    Acquired { token: String },
    /// Someone else holds an unexpired lease.
    Held { owner: Option<String> },
}

/// Shared lease storage (Redis, database advisory locks, ...).
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn try_acquire(&self, resource: &str, owner: &str, lease: Duration) -> Result<LockAttempt>;

    /// Extend a lease. Returns `false` if the lease was lost.
    async fn renew(&self, resource: &str, token: &str, lease: Duration) -> Result<bool>;

    /// Release a lease. Returns `false` if it had already expired or moved on.
    async fn release(&self, resource: &str, token: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    token: String,
    expires_at: Instant,
}

/// Process-local [`LockBackend`].
///
/// Coordinates every `CompileLock` sharing the same instance; nothing is
/// shared across processes.
#[derive(Debug, Default)]
pub struct InMemoryLockBackend {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `resource`, ignoring expired leases.
    pub fn holder(&self, resource: &str) -> Option<String> {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases
            .get(resource)
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.owner.clone())
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, resource: &str, owner: &str, lease: Duration) -> Result<LockAttempt> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if let Some(existing) = leases.get(resource) {
            if existing.expires_at > now {
                return Ok(LockAttempt::Held {
                    owner: Some(existing.owner.clone()),
                });
            }
        }

        let token = uuid::Uuid::new_v4().to_string();
        leases.insert(
            resource.to_string(),
            Lease {
                owner: owner.to_string(),
                token: token.clone(),
                expires_at: now + lease,
            },
        );
        Ok(LockAttempt::Acquired { token })
    }

    async fn renew(&self, resource: &str, token: &str, lease: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match leases.get_mut(resource) {
            Some(existing) if existing.token == token && existing.expires_at > now => {
                existing.expires_at = now + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, resource: &str, token: &str) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        match leases.get(resource) {
            Some(existing) if existing.token == token => {
                leases.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Blocking, scoped compile lock on top of a [`LockBackend`].
pub struct CompileLock {
    backend: Arc<dyn LockBackend>,
    owner: String,
    timeout: Duration,
    lease: Duration,
    retry_interval: Duration,
}

impl CompileLock {
    pub fn new(backend: Arc<dyn LockBackend>, owner: impl Into<String>, timeout: Duration, lease: Duration) -> Self {
        Self {
            backend,
            owner: owner.into(),
            timeout,
            lease,
            retry_interval: Duration::from_millis(500),
        }
    }

    /// How long to sleep between acquisition attempts.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn resource_name(package_id: PackageId, stemcell_id: StemcellId) -> String {
        format!("lock:compile:{package_id}:{stemcell_id}")
    }

    /// Run `f` while holding the lock for `(package_id, stemcell_id)`.
    ///
    /// Waits up to the configured timeout for the lock. The lock is released
    /// whether `f` succeeds or fails. If the scope is dropped before `f`
    /// finishes, renewal stops and the lease expires on its own.
    ///
    /// `f` receives a [`LeaseStatus`]; check it before persisting anything
    /// that must only happen under the lock.
    pub async fn with_compile_lock<F, Fut, T>(
        &self,
        package_id: PackageId,
        stemcell_id: StemcellId,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(LeaseStatus) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let held = self
            .acquire(&Self::resource_name(package_id, stemcell_id))
            .await?;
        let result = f(held.status.clone()).await;
        held.release().await;
        result
    }

    async fn acquire(&self, resource: &str) -> Result<HeldLock> {
        let started = Instant::now();

        loop {
            match self.backend.try_acquire(resource, &self.owner, self.lease).await? {
                LockAttempt::Acquired { token } => {
                    debug!(resource = %resource, owner = %self.owner, "acquired compile lock");
                    let status = LeaseStatus::new(resource);
                    let renewer = self.spawn_renewer(resource, &token, status.clone());
                    return Ok(HeldLock {
                        backend: Arc::clone(&self.backend),
                        resource: resource.to_string(),
                        token,
                        renewer,
                        status,
                    });
                }
                LockAttempt::Held { owner } => {
                    let waited = started.elapsed();
                    if waited >= self.timeout {
                        return Err(CompileError::LockTimeout {
                            resource: resource.to_string(),
                            waited,
                        });
                    }
                    info!(
                        resource = %resource,
                        holder = ?owner,
                        "compile lock held elsewhere; waiting"
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }

    fn spawn_renewer(&self, resource: &str, token: &str, status: LeaseStatus) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let resource = resource.to_string();
        let token = token.to_string();
        let lease = self.lease;
        let period = lease / 2;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                match backend.renew(&resource, &token, lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(resource = %resource, "compile lock lease lost");
                        status.lost.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        warn!(resource = %resource, error = %e, "failed to renew compile lock");
                    }
                }
            }
        })
    }
}

/// Whether the lease behind a running `with_compile_lock` scope is still ours.
#[derive(Debug, Clone)]
pub struct LeaseStatus {
    resource: String,
    lost: Arc<AtomicBool>,
}

impl LeaseStatus {
    fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Fails with [`CompileError::Lock`] once a renewal found the lease gone.
    pub fn ensure_held(&self) -> Result<()> {
        if self.is_lost() {
            return Err(CompileError::Lock(format!(
                "lease on {} was lost while compiling",
                self.resource
            )));
        }
        Ok(())
    }
}

struct HeldLock {
    backend: Arc<dyn LockBackend>,
    resource: String,
    token: String,
    renewer: JoinHandle<()>,
    status: LeaseStatus,
}

impl HeldLock {
    async fn release(self) {
        self.renewer.abort();
        match self.backend.release(&self.resource, &self.token).await {
            Ok(true) => debug!(resource = %self.resource, "released compile lock"),
            Ok(false) => warn!(resource = %self.resource, "compile lock already expired at release"),
            Err(e) => warn!(resource = %self.resource, error = %e, "failed to release compile lock"),
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        // A dropped scope must not keep the lease alive.
        self.renewer.abort();
    }
}
