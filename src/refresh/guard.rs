//! Keyed in-flight lease table.
//!
//! At most one refresh runs per `(subject, window, category)`. A second caller
//! either waits for the holder's outcome or is rejected, depending on
//! [`GuardMode`]. Leases are released when dropped, and a lease older than the
//! configured TTL is treated as abandoned and may be taken over.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{GuardConfig, GuardMode};
use crate::error::RefreshError;
use crate::graph::WindowRef;
use crate::refresh::outcome::CategoryOutcome;
use crate::registry::SourceCategory;

/// Mutual-exclusion key for a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefreshKey {
    /// Subject natural key.
    pub subject: String,
    /// Window natural key.
    pub window: String,
    /// Category being refreshed.
    pub category: SourceCategory,
}

impl RefreshKey {
    /// Key for `category` of `window`.
    #[must_use]
    pub fn new(window: &WindowRef, category: &SourceCategory) -> Self {
        Self {
            subject: window.subject.key.clone(),
            window: window.key.clone(),
            category: category.clone(),
        }
    }
}

impl fmt::Display for RefreshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.window, self.category)
    }
}

struct Slot {
    lease_id: u64,
    acquired_at: Instant,
    done: watch::Receiver<Option<CategoryOutcome>>,
}

type Slots = Arc<Mutex<HashMap<RefreshKey, Slot>>>;

fn lock(slots: &Mutex<HashMap<RefreshKey, Slot>>) -> MutexGuard<'_, HashMap<RefreshKey, Slot>> {
    // The table holds no invariants a panicking holder could break midway.
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of [`RefreshGuard::acquire`].
pub enum Admission {
    /// The caller holds the lease and must run the refresh.
    Lead(Lease),
    /// Another caller ran the refresh; this is its outcome.
    Joined(CategoryOutcome),
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lead(lease) => f.debug_tuple("Lead").field(&lease.key).finish(),
            Self::Joined(outcome) => f.debug_tuple("Joined").field(&outcome.state).finish(),
        }
    }
}

/// Exclusive right to refresh one key. Released on drop.
pub struct Lease {
    key: RefreshKey,
    lease_id: u64,
    slots: Slots,
    done: watch::Sender<Option<CategoryOutcome>>,
}

impl Lease {
    /// The key this lease holds.
    #[must_use]
    pub const fn key(&self) -> &RefreshKey {
        &self.key
    }

    /// Publishes the outcome to waiters and releases the lease.
    ///
    /// A cancelled outcome is still published; waiters that were not
    /// cancelled themselves re-acquire and run the refresh.
    pub fn complete(self, outcome: &CategoryOutcome) {
        self.done.send_replace(Some(outcome.clone()));
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        // A holder whose lease expired and was taken over must not evict the new holder.
        if slots
            .get(&self.key)
            .is_some_and(|slot| slot.lease_id == self.lease_id)
        {
            slots.remove(&self.key);
        }
    }
}

/// The lease table. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RefreshGuard {
    slots: Slots,
    next_id: Arc<AtomicU64>,
    mode: GuardMode,
    ttl: Duration,
}

impl RefreshGuard {
    /// An empty table with `config`'s mode and lease TTL.
    #[must_use]
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            mode: config.mode,
            ttl: Duration::from_secs(config.lease_ttl_secs),
        }
    }

    /// Behavior toward a second caller.
    #[must_use]
    pub const fn mode(&self) -> GuardMode {
        self.mode
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Whether `key` currently has a holder.
    #[must_use]
    pub fn is_held(&self, key: &RefreshKey) -> bool {
        lock(&self.slots).contains_key(key)
    }

    /// Takes the lease for `key`, or waits for/rejects against the holder.
    ///
    /// If the holder drops its lease without completing, waiters race to take
    /// the lease themselves.
    ///
    /// # Errors
    ///
    /// - `RefreshError::InProgress` in `Reject` mode when the key is held
    /// - `RefreshError::Cancelled` if `cancel` fires while waiting
    pub async fn acquire(
        &self,
        key: RefreshKey,
        cancel: &CancellationToken,
    ) -> Result<Admission, RefreshError> {
        loop {
            let mut done = {
                let mut slots = lock(&self.slots);
                let current = slots
                    .get(&key)
                    .map(|slot| (slot.acquired_at.elapsed() < self.ttl, slot.done.clone()));
                match current {
                    Some((true, done)) => {
                        if self.mode == GuardMode::Reject {
                            tracing::debug!(%key, "refresh already in flight, rejecting");
                            return Err(RefreshError::InProgress {
                                key: key.to_string(),
                            });
                        }
                        done
                    }
                    expired => {
                        if expired.is_some() {
                            tracing::warn!(%key, "taking over expired refresh lease");
                        }
                        let lease_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = watch::channel(None);
                        slots.insert(
                            key.clone(),
                            Slot {
                                lease_id,
                                acquired_at: Instant::now(),
                                done: rx,
                            },
                        );
                        return Ok(Admission::Lead(Lease {
                            key,
                            lease_id,
                            slots: Arc::clone(&self.slots),
                            done: tx,
                        }));
                    }
                }
            };

            tracing::debug!(%key, "waiting for in-flight refresh");
            loop {
                if let Some(outcome) = done.borrow_and_update().clone() {
                    return Ok(Admission::Joined(outcome));
                }
                tokio::select! {
                    () = cancel.cancelled() => return Err(RefreshError::Cancelled),
                    changed = done.changed() => {
                        if changed.is_err() {
                            if let Some(outcome) = done.borrow().clone() {
                                return Ok(Admission::Joined(outcome));
                            }
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl fmt::Debug for RefreshGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshGuard")
            .field("mode", &self.mode)
            .field("ttl", &self.ttl)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
