//! User records and their persistence seam.
//!
//! Records are created lazily the first time a sender is seen and are never
//! deleted by the core. All mutation funnels through [`UserStore`], which
//! serializes writes per user (striped async locks) so a `/style select`
//! is visible to the very next message from that user.

pub mod file;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Persisted per-user state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub qq_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default)]
    pub is_privileged: bool,
    /// Selected command set per category (the user's "styles").
    #[serde(default)]
    pub selected_styles: HashMap<String, String>,
}

impl UserRecord {
    /// A fresh record for a first-seen user.
    pub fn new(qq_id: i64, nickname: &str) -> Self {
        Self {
            qq_id,
            nickname: (!nickname.is_empty()).then(|| nickname.to_string()),
            is_privileged: false,
            selected_styles: HashMap::new(),
        }
    }

    /// A transient record used when the repository is unreachable.
    /// Reads degrade open; nothing derived from this is persisted.
    pub fn transient(qq_id: i64) -> Self {
        Self {
            qq_id,
            ..Default::default()
        }
    }
}

/// Repository errors.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage backend for user records.
///
/// The core imposes no schema beyond "rows keyed by qq id"; backends decide
/// the layout.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn load_user(&self, qq_id: i64) -> Result<Option<UserRecord>, RepoError>;
    async fn save_user(&self, user: &UserRecord) -> Result<(), RepoError>;
}

const LOCK_STRIPES: usize = 64;

/// Per-user serialization layer over a [`Repository`].
///
/// Write operations take the user's stripe lock, mutate, persist, release —
/// giving read-after-write for subsequent decisions about the same user.
pub struct UserStore {
    repo: Arc<dyn Repository>,
    stripes: Vec<Mutex<()>>,
}

impl UserStore {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, qq_id: i64) -> &Mutex<()> {
        &self.stripes[(qq_id.unsigned_abs() as usize) % LOCK_STRIPES]
    }

    /// Load the user's record, creating and persisting one on first sight.
    pub async fn get_or_create(&self, qq_id: i64, nickname: &str) -> Result<UserRecord, RepoError> {
        let _guard = self.stripe(qq_id).lock().await;
        match self.repo.load_user(qq_id).await? {
            Some(user) => Ok(user),
            None => {
                let user = UserRecord::new(qq_id, nickname);
                self.repo.save_user(&user).await?;
                Ok(user)
            }
        }
    }

    /// Read-only lookup that never creates a record (dry-run resolution).
    pub async fn peek(&self, qq_id: i64) -> Result<Option<UserRecord>, RepoError> {
        self.repo.load_user(qq_id).await
    }

    /// Mutate the user's record under its lock and persist the result.
    /// The record is created first when absent.
    pub async fn update<F>(&self, qq_id: i64, mutate: F) -> Result<UserRecord, RepoError>
    where
        F: FnOnce(&mut UserRecord),
    {
        let _guard = self.stripe(qq_id).lock().await;
        let mut user = self
            .repo
            .load_user(qq_id)
            .await?
            .unwrap_or_else(|| UserRecord::new(qq_id, ""));
        mutate(&mut user);
        self.repo.save_user(&user).await?;
        Ok(user)
    }
}

/// In-memory repository. Used by tests and as the fallback backend when no
/// state directory is writable.
#[derive(Default)]
pub struct MemoryRepository {
    users: parking_lot::RwLock<HashMap<i64, UserRecord>>,
    unavailable: std::sync::atomic::AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (tests of the degrade-open path).
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable
            .store(down, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<(), RepoError> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RepoError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn load_user(&self, qq_id: i64) -> Result<Option<UserRecord>, RepoError> {
        self.check_up()?;
        Ok(self.users.read().get(&qq_id).cloned())
    }

    async fn save_user(&self, user: &UserRecord) -> Result<(), RepoError> {
        self.check_up()?;
        self.users.write().insert(user.qq_id, user.clone());
        Ok(())
    }
}
