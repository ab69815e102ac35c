//! JSON-file user repository.
//!
//! All records live in one `users.json` under the state directory, loaded
//! into memory at open and rewritten atomically (temp file + rename) on
//! every save. The dispatcher's write rate is a human typing `/style
//! select`, so whole-file rewrites are fine.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use super::{RepoError, Repository, UserRecord};

/// File-backed [`Repository`] implementation.
pub struct FileRepository {
    path: PathBuf,
    cache: RwLock<HashMap<i64, UserRecord>>,
}

impl FileRepository {
    /// Open (or initialize) the store at `state_dir/users.json`.
    ///
    /// A corrupt file is moved aside rather than silently overwritten.
    pub fn open(state_dir: &Path) -> Result<Self, RepoError> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join("users.json");

        let cache = if path.exists() {
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<HashMap<String, UserRecord>>(&content) {
                Ok(by_key) => by_key
                    .into_values()
                    .map(|user| (user.qq_id, user))
                    .collect(),
                Err(e) => {
                    let backup = path.with_extension("json.corrupt");
                    warn!(
                        target: "dispatch",
                        "users.json is corrupt ({e}), moving aside to {}",
                        backup.display()
                    );
                    fs::rename(&path, &backup)?;
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    fn persist(&self) -> Result<(), RepoError> {
        let content = {
            let cache = self.cache.read();
            // Keyed by qq id as a string for stable JSON object keys.
            let by_key: HashMap<String, &UserRecord> =
                cache.values().map(|u| (u.qq_id.to_string(), u)).collect();
            serde_json::to_string_pretty(&by_key)?
        };

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, content)?;
        // Atomic rename
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl Repository for FileRepository {
    async fn load_user(&self, qq_id: i64) -> Result<Option<UserRecord>, RepoError> {
        Ok(self.cache.read().get(&qq_id).cloned())
    }

    async fn save_user(&self, user: &UserRecord) -> Result<(), RepoError> {
        self.cache.write().insert(user.qq_id, user.clone());
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::open(dir.path()).unwrap();

        let mut user = UserRecord::new(10086, "alice");
        user.selected_styles.insert("pjsk".into(), "set-a".into());
        repo.save_user(&user).await.unwrap();

        // Reopen from disk.
        let reopened = FileRepository::open(dir.path()).unwrap();
        let loaded = reopened.load_user(10086).await.unwrap().unwrap();
        assert_eq!(loaded, user);
        assert!(reopened.load_user(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("users.json"), "{ not json").unwrap();

        let repo = FileRepository::open(dir.path()).unwrap();
        assert!(repo.load_user(1).await.unwrap().is_none());
        assert!(dir.path().join("users.json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_works_through_user_store() {
        let dir = tempfile::tempdir().unwrap();
        let repo: Arc<dyn Repository> = Arc::new(FileRepository::open(dir.path()).unwrap());
        let store = crate::users::UserStore::new(repo);

        store.update(5, |u| u.is_privileged = true).await.unwrap();
        let user = store.get_or_create(5, "").await.unwrap();
        assert!(user.is_privileged);
    }
}
