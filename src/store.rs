//! Persistent state store
//!
//! One record per installation holding the user state, the policy flag and
//! the referral grants already applied. All mutation goes through
//! [`StateStore::update`], which holds the store lock for the whole
//! read-modify-write and only acknowledges once the backend write succeeded.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::{ReferralGrant, UserState};

/// The persisted record for one installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub user_state: UserState,
    pub policy_enabled: bool,
    #[serde(default)]
    pub referral_grants: Vec<ReferralGrant>,
}

impl PersistedRecord {
    pub fn bootstrap(policy_enabled: bool) -> Self {
        Self {
            user_state: UserState::bootstrap(),
            policy_enabled,
            referral_grants: Vec::new(),
        }
    }

    pub fn has_grant(&self, code: &str) -> bool {
        self.referral_grants.iter().any(|g| g.source_code == code)
    }
}

/// Store errors. Every variant is a persistence failure from the caller's view.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt state record: {0}")]
    Corrupt(String),

    #[error("State lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Durable key/value backend for installation records.
pub trait StateBackend: Send {
    fn load(&self, installation_id: &str) -> Result<Option<PersistedRecord>, StoreError>;
    fn save(&mut self, installation_id: &str, record: &PersistedRecord) -> Result<(), StoreError>;
    fn delete(&mut self, installation_id: &str) -> Result<(), StoreError>;
}

/// SQLite-backed record storage.
pub struct SqliteBackend {
    db: Connection,
}

impl SqliteBackend {
    /// Open or create the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("creating {}: {}", parent.display(), e)))?;
        }
        let db = Connection::open(path)?;
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        let backend = Self::with_connection(db)?;
        info!(path = %path.display(), "State database opened");
        Ok(backend)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(db: Connection) -> Result<Self, StoreError> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS installations (
                installation_id TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );",
        )?;
        Ok(Self { db })
    }
}

impl StateBackend for SqliteBackend {
    fn load(&self, installation_id: &str) -> Result<Option<PersistedRecord>, StoreError> {
        let mut stmt = self
            .db
            .prepare_cached("SELECT record FROM installations WHERE installation_id = ?1")?;

        match stmt.query_row([installation_id], |row| row.get::<_, String>(0)) {
            Ok(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, installation_id: &str, record: &PersistedRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.db.execute(
            "INSERT INTO installations (installation_id, record, updated_at)
             VALUES (?1, ?2, strftime('%s', 'now'))
             ON CONFLICT(installation_id) DO UPDATE SET record = ?2, updated_at = strftime('%s', 'now')",
            rusqlite::params![installation_id, json],
        )?;
        debug!(installation_id, bytes = json.len(), "Saved state record");
        Ok(())
    }

    fn delete(&mut self, installation_id: &str) -> Result<(), StoreError> {
        self.db.execute(
            "DELETE FROM installations WHERE installation_id = ?1",
            [installation_id],
        )?;
        Ok(())
    }
}

struct StoreInner {
    backend: Box<dyn StateBackend>,
    record: PersistedRecord,
}

/// Single-writer owner of the installation record.
pub struct StateStore {
    installation_id: String,
    policy_default: bool,
    inner: Mutex<StoreInner>,
}

impl StateStore {
    /// Load the record for `installation_id`, bootstrapping and persisting a
    /// fresh one on first run.
    pub fn open(
        installation_id: impl Into<String>,
        mut backend: Box<dyn StateBackend>,
        policy_default: bool,
    ) -> Result<Self, StoreError> {
        let installation_id = installation_id.into();

        let record = match backend.load(&installation_id)? {
            Some(record) => {
                info!(
                    installation_id = %installation_id,
                    user_id = %record.user_state.user_id,
                    tier = %record.user_state.tier,
                    "Loaded user state"
                );
                record
            }
            None => {
                let record = PersistedRecord::bootstrap(policy_default);
                backend.save(&installation_id, &record)?;
                info!(
                    installation_id = %installation_id,
                    user_id = %record.user_state.user_id,
                    referral_code = %record.user_state.referral_code,
                    "Created user state for new installation"
                );
                record
            }
        };

        Ok(Self {
            installation_id,
            policy_default,
            inner: Mutex::new(StoreInner { backend, record }),
        })
    }

    pub fn installation_id(&self) -> &str {
        &self.installation_id
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn snapshot(&self) -> Result<PersistedRecord, StoreError> {
        Ok(self.lock()?.record.clone())
    }

    pub fn user_state(&self) -> Result<UserState, StoreError> {
        Ok(self.lock()?.record.user_state.clone())
    }

    pub fn policy_enabled(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.record.policy_enabled)
    }

    /// Apply `mutate` to a copy of the record and persist it.
    ///
    /// Nothing is written when the mutation leaves the record unchanged. On a
    /// failed write the in-memory record is left as it was.
    pub fn update<T, F>(&self, mutate: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut PersistedRecord) -> T,
    {
        let mut inner = self.lock()?;
        let mut next = inner.record.clone();
        let out = mutate(&mut next);

        if next != inner.record {
            if let Err(e) = inner.backend.save(&self.installation_id, &next) {
                warn!(error = %e, "State write failed, keeping previous record");
                return Err(e);
            }
            inner.record = next;
        }

        Ok(out)
    }

    /// Wipe the record and start over with a new identity.
    pub fn reset(&self) -> Result<UserState, StoreError> {
        let mut inner = self.lock()?;
        let fresh = PersistedRecord::bootstrap(self.policy_default);
        inner.backend.delete(&self.installation_id)?;
        inner.backend.save(&self.installation_id, &fresh)?;
        inner.record = fresh;
        info!(
            installation_id = %self.installation_id,
            user_id = %inner.record.user_state.user_id,
            "User state reset"
        );
        Ok(inner.record.user_state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Backend that counts writes and can be told to fail them.
    struct FlakyBackend {
        inner: SqliteBackend,
        saves: Arc<AtomicUsize>,
        fail: Arc<std::sync::atomic::AtomicBool>,
    }

    impl StateBackend for FlakyBackend {
        fn load(&self, id: &str) -> Result<Option<PersistedRecord>, StoreError> {
            self.inner.load(id)
        }
        fn save(&mut self, id: &str, record: &PersistedRecord) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(id, record)
        }
        fn delete(&mut self, id: &str) -> Result<(), StoreError> {
            self.inner.delete(id)
        }
    }

    fn flaky() -> (StateStore, Arc<AtomicUsize>, Arc<std::sync::atomic::AtomicBool>) {
        let saves = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let backend = FlakyBackend {
            inner: SqliteBackend::in_memory().unwrap(),
            saves: saves.clone(),
            fail: fail.clone(),
        };
        let store = StateStore::open("test", Box::new(backend), true).unwrap();
        (store, saves, fail)
    }

    #[test]
    fn test_bootstrap_persists_once() {
        let (store, saves, _) = flaky();
        assert_eq!(saves.load(Ordering::SeqCst), 1);

        let state = store.user_state().unwrap();
        assert!(state.user_id.starts_with("user_"));
        assert_eq!(state.referral_code.len(), 8);
        assert_eq!(state.tier, Tier::Free);
        assert!(store.policy_enabled().unwrap());
    }

    #[test]
    fn test_unchanged_update_does_not_write() {
        let (store, saves, _) = flaky();
        let before = saves.load(Ordering::SeqCst);

        store.update(|r| r.user_state.tier = Tier::Free).unwrap();
        assert_eq!(saves.load(Ordering::SeqCst), before);

        store.update(|r| r.user_state.blocked_sites_count += 1).unwrap();
        assert_eq!(saves.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_failed_write_keeps_previous_record() {
        let (store, _, fail) = flaky();
        fail.store(true, Ordering::SeqCst);

        let result = store.update(|r| r.user_state.tier = Tier::Elite);
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert_eq!(store.user_state().unwrap().tier, Tier::Free);
    }

    #[test]
    fn test_reset_regenerates_identity() {
        let (store, _, _) = flaky();
        let before = store.user_state().unwrap();
        store.update(|r| r.user_state.blocked_sites_count = 9).unwrap();

        let after = store.reset().unwrap();
        assert_ne!(after.user_id, before.user_id);
        assert_eq!(after.blocked_sites_count, 0);
    }

    #[test]
    fn test_record_tolerates_missing_grants() {
        let json = serde_json::json!({
            "user_state": UserState::bootstrap(),
            "policy_enabled": false
        });
        let record: PersistedRecord = serde_json::from_value(json).unwrap();
        assert!(record.referral_grants.is_empty());
        assert!(!record.policy_enabled);
    }
}
