//! File-backed external token store
//!
//! One JSON file per (identity, resource), named by a SHA-256 digest of the
//! key. Writes go to a temporary file that is renamed over the target, so a
//! reader never sees a partial token and concurrent upserts leave exactly
//! one complete file. Files are created with owner-only permissions.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{ExternalToken, ExternalTokenStore};
use crate::{Error, Result};

/// External token store persisting to a directory
pub struct FileExternalTokenStore {
    base_dir: PathBuf,
}

impl FileExternalTokenStore {
    /// Create a store in `base_dir`, creating the directory if needed.
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to create token storage dir {}: {e}",
                base_dir.display()
            ))
        })?;
        info!(dir = %base_dir.display(), "Using file-backed external token store");
        Ok(Self { base_dir })
    }

    /// Storage directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn token_path(&self, identity_id: &str, resource: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(identity_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(resource.as_bytes());
        let key = hex::encode(hasher.finalize());
        self.base_dir.join(format!("{key}.json"))
    }
}

#[async_trait::async_trait]
impl ExternalTokenStore for FileExternalTokenStore {
    async fn upsert(&self, token: ExternalToken) -> Result<()> {
        let path = self.token_path(&token.identity_id, &token.resource);
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        let content = serde_json::to_vec_pretty(&token)?;

        let written = async {
            write_owner_only(&tmp, &content).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(identity = %token.identity_id, resource = %token.resource, "Saved external token");
        Ok(())
    }

    async fn get(&self, identity_id: &str, resource: &str) -> Result<Option<ExternalToken>> {
        let path = self.token_path(identity_id, resource);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<ExternalToken>(&content) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable external token");
                Ok(None)
            }
        }
    }

    async fn delete(&self, identity_id: &str, resource: &str) -> Result<bool> {
        let path = self.token_path(identity_id, resource);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Create `path` (which must not exist) readable by the owner only and write
/// `content` to it.
async fn write_owner_only(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(content).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn token(access: &str) -> ExternalToken {
        ExternalToken {
            identity_id: "user-1".to_string(),
            resource: "https://github.com".to_string(),
            access_token: access.to_string(),
            refresh_token: Some("refresh".to_string()),
            scope: "repo".to_string(),
            token_type: "bearer".to_string(),
            expiry: Some(Utc::now()),
            username: Some("octocat".to_string()),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_get_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileExternalTokenStore::new(dir.path()).await.unwrap();

        store.upsert(token("first")).await.unwrap();
        store.upsert(token("second")).await.unwrap();

        let found = store.get("user-1", "https://github.com").await.unwrap().unwrap();
        assert_eq!(found, token_with_time(&found, "second"));

        assert!(store.delete("user-1", "https://github.com").await.unwrap());
        assert!(store.get("user-1", "https://github.com").await.unwrap().is_none());
        assert!(!store.delete("user-1", "https://github.com").await.unwrap());
    }

    fn token_with_time(found: &ExternalToken, access: &str) -> ExternalToken {
        ExternalToken {
            expiry: found.expiry,
            updated_at: found.updated_at,
            ..token(access)
        }
    }

    #[tokio::test]
    async fn upsert_leaves_a_single_file_with_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileExternalTokenStore::new(dir.path()).await.unwrap();

        store.upsert(token("a")).await.unwrap();
        store.upsert(token("b")).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let path = entries[0].as_ref().unwrap().path();
            let mode = std::fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn failed_upsert_leaves_no_temporary_file() {
        // GIVEN: a directory squatting on the token's file name
        let dir = tempfile::tempdir().unwrap();
        let store = FileExternalTokenStore::new(dir.path()).await.unwrap();
        let path = store.token_path("user-1", "https://github.com");
        std::fs::create_dir(&path).unwrap();

        // WHEN: the rename over it fails
        assert!(store.upsert(token("a")).await.is_err());

        // THEN: only the squatting directory remains
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(names, vec![path]);
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileExternalTokenStore::new(dir.path()).await.unwrap();
        let path = store.token_path("user-1", "https://github.com");
        std::fs::write(&path, "{not json").unwrap();

        assert!(store.get("user-1", "https://github.com").await.unwrap().is_none());
    }
}
