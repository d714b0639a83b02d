//! Link state store: short-lived, single-use CSRF tokens for the account
//! linking flow.
//!
//! A state token is issued when a link flow starts and consumed exactly once
//! by the callback. Consumption is a single atomic remove, so of any number
//! of concurrent callbacks presenting the same token only one receives the
//! record.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use rand::RngExt;
use tracing::debug;

use crate::{Error, Result};

/// Pending link flow bound to a state token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    /// The opaque state token
    pub token: String,
    /// Identity that started the flow
    pub identity_id: String,
    /// Canonical resource being linked
    pub resource: String,
    /// Further resources to link after this one
    pub pending: Vec<String>,
    /// Where the user agent goes after the flow
    pub redirect_url: String,
    /// Issue time
    pub created_at: DateTime<Utc>,
    /// Lifetime
    pub ttl: Duration,
}

impl LinkState {
    /// Whether the state is past its TTL at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.created_at
            .checked_add_signed(ttl)
            .is_some_and(|expires_at| now >= expires_at)
    }
}

/// Storage backend for link states.
///
/// `take` must remove and return atomically: two concurrent calls with the
/// same token must not both receive the record.
#[async_trait::async_trait]
pub trait StateBackend: Send + Sync + 'static {
    /// Store a new state. Fails with `Conflict` if the token already exists.
    async fn insert(&self, state: LinkState) -> Result<()>;

    /// Remove and return the state for `token`.
    async fn take(&self, token: &str) -> Result<Option<LinkState>>;

    /// Remove all states expired at `now`.
    async fn reap_expired(&self, now: DateTime<Utc>) -> usize;
}

/// In-memory backend keyed by state token
#[derive(Default)]
pub struct InMemoryStateBackend {
    states: DashMap<String, LinkState>,
}

impl InMemoryStateBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored states, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no state is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait::async_trait]
impl StateBackend for InMemoryStateBackend {
    async fn insert(&self, state: LinkState) -> Result<()> {
        match self.states.entry(state.token.clone()) {
            Entry::Occupied(_) => Err(Error::Conflict("link state already exists".to_string())),
            Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(())
            }
        }
    }

    async fn take(&self, token: &str) -> Result<Option<LinkState>> {
        Ok(self.states.remove(token).map(|(_, state)| state))
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.states.len();
        self.states.retain(|_, state| !state.is_expired(now));
        before.saturating_sub(self.states.len())
    }
}

/// Issues and consumes link states
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    ttl: Duration,
}

impl StateStore {
    /// Create a store over `backend` issuing states valid for `ttl`.
    #[must_use]
    pub fn new(backend: Arc<dyn StateBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// In-memory store.
    #[must_use]
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(InMemoryStateBackend::new()), ttl)
    }

    /// Generate a 256-bit random state token.
    #[must_use]
    pub fn generate_token() -> String {
        let random_bytes: [u8; 32] = rand::rng().random();
        URL_SAFE_NO_PAD.encode(random_bytes)
    }

    /// Record a pending link and return its state token.
    pub async fn issue(
        &self,
        identity_id: &str,
        resource: &str,
        pending: Vec<String>,
        redirect_url: &str,
    ) -> Result<String> {
        let token = Self::generate_token();
        self.backend
            .insert(LinkState {
                token: token.clone(),
                identity_id: identity_id.to_string(),
                resource: resource.to_string(),
                pending,
                redirect_url: redirect_url.to_string(),
                created_at: Utc::now(),
                ttl: self.ttl,
            })
            .await?;

        debug!(identity = %identity_id, resource = %resource, "Issued link state");
        Ok(token)
    }

    /// Atomically remove and return the state for `token`.
    ///
    /// Unknown or already consumed tokens fail with [`Error::InvalidState`];
    /// a token past its TTL is removed and fails with [`Error::StateExpired`].
    pub async fn consume_once(&self, token: &str) -> Result<LinkState> {
        let state = self
            .backend
            .take(token)
            .await?
            .ok_or(Error::InvalidState)?;

        if state.is_expired(Utc::now()) {
            debug!(identity = %state.identity_id, "Link state expired");
            return Err(Error::StateExpired);
        }
        Ok(state)
    }

    /// Drop expired states. Returns how many were removed.
    pub async fn reap_expired(&self) -> usize {
        self.backend.reap_expired(Utc::now()).await
    }
}
