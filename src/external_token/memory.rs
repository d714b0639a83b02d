//! In-memory external token store

use dashmap::DashMap;

use super::{ExternalToken, ExternalTokenStore};
use crate::Result;

/// External token store backed by a `DashMap` keyed by (identity, resource)
#[derive(Default)]
pub struct InMemoryExternalTokenStore {
    tokens: DashMap<(String, String), ExternalToken>,
}

impl InMemoryExternalTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of linked tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether nothing is linked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait::async_trait]
impl ExternalTokenStore for InMemoryExternalTokenStore {
    async fn upsert(&self, token: ExternalToken) -> Result<()> {
        let key = (token.identity_id.clone(), token.resource.clone());
        self.tokens.insert(key, token);
        Ok(())
    }

    async fn get(&self, identity_id: &str, resource: &str) -> Result<Option<ExternalToken>> {
        let key = (identity_id.to_string(), resource.to_string());
        Ok(self.tokens.get(&key).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, identity_id: &str, resource: &str) -> Result<bool> {
        let key = (identity_id.to_string(), resource.to_string());
        Ok(self.tokens.remove(&key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;

    fn token(identity: &str, access: &str) -> ExternalToken {
        ExternalToken {
            identity_id: identity.to_string(),
            resource: "https://github.com".to_string(),
            access_token: access.to_string(),
            refresh_token: None,
            scope: "repo".to_string(),
            token_type: "bearer".to_string(),
            expiry: None,
            username: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_existing_entry() {
        let store = InMemoryExternalTokenStore::new();
        store.upsert(token("user-1", "first")).await.unwrap();
        store.upsert(token("user-1", "second")).await.unwrap();

        let found = store.get("user-1", "https://github.com").await.unwrap().unwrap();
        assert_eq!(found.access_token, "second");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn entries_are_scoped_per_identity() {
        let store = InMemoryExternalTokenStore::new();
        store.upsert(token("user-1", "a")).await.unwrap();

        assert!(store.get("user-2", "https://github.com").await.unwrap().is_none());
        assert!(!store.delete("user-2", "https://github.com").await.unwrap());
        assert!(store.delete("user-1", "https://github.com").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn concurrent_upserts_leave_one_entry() {
        // GIVEN: two links of the same resource racing
        let store = Arc::new(InMemoryExternalTokenStore::new());
        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.upsert(token("user-1", "a")).await })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.upsert(token("user-1", "b")).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // THEN: exactly one entry, holding one of the two values
        assert_eq!(store.len(), 1);
        let found = store.get("user-1", "https://github.com").await.unwrap().unwrap();
        assert!(found.access_token == "a" || found.access_token == "b");
    }
}
