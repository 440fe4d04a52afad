//! Exclusive lock manager for remote objects.
//!
//! Tracks which connection, if any, holds the lock on each object hosted
//! by this process. Consulted before dispatch for lockable services and
//! updated on explicit lock/release and on disconnect notifications.
//!
//! Lock state is strictly process-local: restarting a host process resets
//! every lock it held.
//!
//! # Authorization
//!
//! `release` is connection-authorized: only the owning `ConnId` may
//! release a lock. Operators get `force_release` for stuck locks.
//!
//! # Concurrency
//!
//! One mutex guards the whole record table. Disconnect notifications and
//! explicit lock/release calls may arrive concurrently from any number of
//! connection handler tasks; every operation is a short, await-free
//! critical section.

use bench_core::ConnId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Ownership record for one locked object.
///
/// Invariant: at most one record per object name at any time, enforced by
/// the table being a map keyed on the object name.
#[derive(Debug, Clone)]
pub struct LockRecord {
    /// Connection holding the lock
    pub owner: ConnId,
    /// Free-form operator label, for diagnostics only
    pub user: String,
    /// When the lock was taken
    pub since: DateTime<Utc>,
}

/// Errors for expected lock conditions, as narrow kinds.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    /// A guarded call or explicit operation hit a lock held elsewhere
    #[error("object {object} is locked by {holder}")]
    Conflict {
        object: String,
        /// Holder's user label (falls back to the connection id)
        holder: String,
    },

    /// Release attempted on an unlocked object
    #[error("object {object} is not locked")]
    NotLocked { object: String },

    /// Release attempted by a connection that does not hold the lock
    #[error("object {object} is not locked by the requesting connection")]
    NotHolder { object: String },
}

/// Per-host-process lock table.
#[derive(Debug, Default)]
pub struct LockManager {
    records: Mutex<HashMap<String, LockRecord>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(&self, f: impl FnOnce(&mut HashMap<String, LockRecord>) -> T) -> T {
        match self.records.lock() {
            Ok(mut guard) => f(&mut guard),
            // A poisoned mutex means a panic elsewhere; the table itself
            // is still consistent, so recover it.
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Acquires the lock on `object` for `conn`.
    ///
    /// Returns `true` when the object is locked after the call. Locking
    /// an already-locked object is an idempotent no-op that does NOT
    /// transfer ownership, whoever holds it.
    pub fn lock(&self, object: &str, conn: ConnId, user: &str) -> bool {
        self.with_records(|records| {
            if let Some(existing) = records.get(object) {
                debug!(
                    object = %object,
                    holder = %existing.owner,
                    requester = %conn,
                    "Lock request on already-locked object (no-op)"
                );
                return true;
            }
            records.insert(
                object.to_string(),
                LockRecord {
                    owner: conn,
                    user: user.to_string(),
                    since: Utc::now(),
                },
            );
            info!(object = %object, conn = %conn, user = %user, "Object locked");
            true
        })
    }

    /// Releases the lock on `object`, requiring `conn` to be the holder.
    pub fn release(&self, object: &str, conn: ConnId) -> Result<(), LockError> {
        self.with_records(|records| {
            let record = records.get(object).ok_or_else(|| LockError::NotLocked {
                object: object.to_string(),
            })?;
            if record.owner != conn {
                warn!(
                    object = %object,
                    holder = %record.owner,
                    requester = %conn,
                    "Release refused: requester does not hold the lock"
                );
                return Err(LockError::NotHolder {
                    object: object.to_string(),
                });
            }
            records.remove(object);
            info!(object = %object, conn = %conn, "Object released");
            Ok(())
        })
    }

    /// Operator force-unlock. Returns `true` when a record was removed.
    pub fn force_release(&self, object: &str) -> bool {
        self.with_records(|records| {
            let removed = records.remove(object);
            if let Some(record) = &removed {
                warn!(
                    object = %object,
                    holder = %record.owner,
                    user = %record.user,
                    "Object force-released by operator"
                );
            }
            removed.is_some()
        })
    }

    /// Whether `object` is currently locked.
    pub fn is_locked(&self, object: &str) -> bool {
        self.with_records(|records| records.contains_key(object))
    }

    /// Current holder of `object`, when locked.
    pub fn holder(&self, object: &str) -> Option<LockRecord> {
        self.with_records(|records| records.get(object).cloned())
    }

    /// Dispatch-time guard: checks whether `conn` may call into `object`.
    ///
    /// Succeeds when the object is unlocked or locked by `conn` itself;
    /// the conflict error carries the holder's label so the rejection is
    /// attributable. Runs before the instance dispatcher so rejected
    /// calls never construct handler instances.
    pub fn authorize(&self, object: &str, conn: ConnId) -> Result<(), LockError> {
        self.with_records(|records| match records.get(object) {
            Some(record) if record.owner != conn => Err(LockError::Conflict {
                object: object.to_string(),
                holder: if record.user.is_empty() {
                    record.owner.to_string()
                } else {
                    record.user.clone()
                },
            }),
            _ => Ok(()),
        })
    }

    /// Disconnect notification: drops every lock owned by `conn`.
    pub fn on_disconnect(&self, conn: ConnId) {
        self.with_records(|records| {
            let before = records.len();
            records.retain(|object, record| {
                let keep = record.owner != conn;
                if !keep {
                    info!(object = %object, conn = %conn, "Lock released on disconnect");
                }
                keep
            });
            let dropped = before - records.len();
            if dropped > 0 {
                debug!(conn = %conn, dropped = dropped, "Disconnect lock sweep complete");
            }
        })
    }

    /// Number of currently locked objects.
    pub fn locked_count(&self) -> usize {
        self.with_records(|records| records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(n: u64) -> ConnId {
        ConnId::from_raw(n)
    }

    #[test]
    fn test_lock_and_release() {
        let locks = LockManager::new();
        assert!(!locks.is_locked("laser-1"));

        assert!(locks.lock("laser-1", conn(1), "alice"));
        assert!(locks.is_locked("laser-1"));

        locks.release("laser-1", conn(1)).unwrap();
        assert!(!locks.is_locked("laser-1"));
    }

    #[test]
    fn test_lock_is_idempotent_for_same_connection() {
        let locks = LockManager::new();
        assert!(locks.lock("laser-1", conn(1), "alice"));
        assert!(locks.lock("laser-1", conn(1), "alice"));
        assert!(locks.is_locked("laser-1"));
        assert_eq!(locks.holder("laser-1").map(|r| r.owner), Some(conn(1)));
    }

    #[test]
    fn test_lock_does_not_transfer_ownership() {
        let locks = LockManager::new();
        assert!(locks.lock("laser-1", conn(1), "alice"));
        // Second connection "locks" too, but ownership stays with conn 1.
        assert!(locks.lock("laser-1", conn(2), "bob"));

        let record = locks.holder("laser-1").unwrap();
        assert_eq!(record.owner, conn(1));
        assert_eq!(record.user, "alice");
    }

    #[test]
    fn test_mutual_exclusion_single_record() {
        let locks = LockManager::new();
        locks.lock("laser-1", conn(1), "alice");
        locks.lock("laser-1", conn(2), "bob");
        // Only one record exists, owned by the first locker.
        assert_eq!(locks.locked_count(), 1);
        assert!(locks.authorize("laser-1", conn(1)).is_ok());
        assert!(locks.authorize("laser-1", conn(2)).is_err());
    }

    #[test]
    fn test_release_requires_holder() {
        let locks = LockManager::new();
        locks.lock("laser-1", conn(1), "alice");

        let err = locks.release("laser-1", conn(2)).unwrap_err();
        assert!(matches!(err, LockError::NotHolder { .. }));
        assert!(locks.is_locked("laser-1"));
    }

    #[test]
    fn test_release_unlocked_is_not_locked() {
        let locks = LockManager::new();
        let err = locks.release("laser-1", conn(1)).unwrap_err();
        assert!(matches!(err, LockError::NotLocked { .. }));
    }

    #[test]
    fn test_authorize_unlocked_and_holder() {
        let locks = LockManager::new();
        assert!(locks.authorize("laser-1", conn(1)).is_ok());

        locks.lock("laser-1", conn(1), "alice");
        assert!(locks.authorize("laser-1", conn(1)).is_ok());

        let err = locks.authorize("laser-1", conn(2)).unwrap_err();
        match err {
            LockError::Conflict { holder, .. } => assert_eq!(holder, "alice"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_conflict_falls_back_to_conn_label() {
        let locks = LockManager::new();
        locks.lock("laser-1", conn(7), "");
        let err = locks.authorize("laser-1", conn(8)).unwrap_err();
        match err {
            LockError::Conflict { holder, .. } => assert_eq!(holder, "conn-7"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_disconnect_releases_all_owned_locks() {
        let locks = LockManager::new();
        locks.lock("laser-1", conn(1), "alice");
        locks.lock("stage-1", conn(1), "alice");
        locks.lock("camera-1", conn(2), "bob");

        locks.on_disconnect(conn(1));

        assert!(!locks.is_locked("laser-1"));
        assert!(!locks.is_locked("stage-1"));
        assert!(locks.is_locked("camera-1"));
    }

    #[test]
    fn test_force_release() {
        let locks = LockManager::new();
        locks.lock("laser-1", conn(1), "alice");

        assert!(locks.force_release("laser-1"));
        assert!(!locks.is_locked("laser-1"));
        // Idempotent: nothing left to remove.
        assert!(!locks.force_release("laser-1"));
    }

    #[test]
    fn test_concurrent_lockers_one_winner() {
        use std::sync::Arc;
        let locks = Arc::new(LockManager::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let locks = Arc::clone(&locks);
                std::thread::spawn(move || {
                    locks.lock("laser-1", ConnId::from_raw(i), &format!("user-{i}"))
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }

        // Exactly one holder; everyone saw "locked after call".
        assert_eq!(locks.locked_count(), 1);
        let owner = locks.holder("laser-1").unwrap().owner;
        for i in 0..8 {
            let authorized = locks.authorize("laser-1", ConnId::from_raw(i)).is_ok();
            assert_eq!(authorized, ConnId::from_raw(i) == owner);
        }
    }
}
