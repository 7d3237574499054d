// Per-account provider session cache.
//
// One authenticated session per (provider, username). Acquisition for a key is
// serialized through that key's slot lock, so concurrent tasks for the same
// account share a single login. Staleness is only noticed reactively: a cached
// session that reports logged-out is replaced on the next acquire.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{Account, ProviderKind, Reservation, TrainCandidate};
use crate::provider::{ProviderError, ProviderRegistry, ProviderSession, SearchQuery};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub kind: ProviderKind,
    pub username: String,
}

impl SessionKey {
    pub fn for_account(account: &Account) -> Self {
        Self {
            kind: account.kind,
            username: account.username.clone(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub hit_count: usize,
    pub login_count: usize,
    pub login_failure_count: usize,
    pub eviction_count: usize,
}

// Each provider call locks the handle, so one session never serves two calls at once.
pub struct Session {
    key: SessionKey,
    handle: Mutex<Box<dyn ProviderSession>>,
    created_at: DateTime<Utc>,
}

impl Session {
    fn new(key: SessionKey, handle: Box<dyn ProviderSession>) -> Self {
        Self {
            key,
            handle: Mutex::new(handle),
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn is_logged_in(&self) -> bool {
        self.handle.lock().await.is_logged_in()
    }

    pub async fn search(&self, query: &SearchQuery) -> std::result::Result<Vec<TrainCandidate>, ProviderError> {
        self.handle.lock().await.search(query).await
    }

    pub async fn reserve(&self, train: &TrainCandidate) -> std::result::Result<Reservation, ProviderError> {
        self.handle.lock().await.reserve(train).await
    }
}

type Slot = Arc<Mutex<Option<Arc<Session>>>>;

pub struct SessionCache {
    providers: ProviderRegistry,
    slots: DashMap<SessionKey, Slot>,
    stats: RwLock<SessionStats>,
}

impl SessionCache {
    pub fn new(providers: ProviderRegistry) -> Self {
        Self {
            providers,
            slots: DashMap::new(),
            stats: RwLock::new(SessionStats::default()),
        }
    }

    /// Logged-in session for the account. Nothing is cached when login fails.
    pub async fn acquire(&self, account: &Account) -> Result<Arc<Session>> {
        let key = SessionKey::for_account(account);
        let slot = self.slot(&key);
        let mut cached = slot.lock().await;

        if let Some(session) = cached.as_ref() {
            if session.is_logged_in().await {
                self.stats.write().hit_count += 1;
                debug!(provider = %key.kind, username = %key.username, "Reusing provider session");
                return Ok(Arc::clone(session));
            }

            info!(provider = %key.kind, username = %key.username, "Cached session logged out, replacing");
            self.stats.write().eviction_count += 1;
            *cached = None;
        }

        let mut handle = self.providers.connect(account)?;
        self.stats.write().login_count += 1;
        info!(provider = %key.kind, username = %key.username, "Logging in to provider");

        match handle.authenticate().await {
            Ok(()) if handle.is_logged_in() => {
                let session = Arc::new(Session::new(key, handle));
                *cached = Some(Arc::clone(&session));
                Ok(session)
            }
            Ok(()) => {
                self.stats.write().login_failure_count += 1;
                Err(Error::Authentication(format!(
                    "{} login for {} did not establish a session",
                    key.kind, key.username
                )))
            }
            Err(e) => {
                self.stats.write().login_failure_count += 1;
                warn!(provider = %key.kind, username = %key.username, error = %e, "Provider login failed");
                Err(e.into())
            }
        }
    }

    /// Drops `session` from the cache if it is still the one cached for its key.
    pub async fn invalidate(&self, session: &Arc<Session>) -> bool {
        let Some(slot) = self.slots.get(session.key()).map(|s| Arc::clone(s.value())) else {
            return false;
        };

        let mut cached = slot.lock().await;
        match cached.as_ref() {
            Some(current) if Arc::ptr_eq(current, session) => {
                *cached = None;
                self.stats.write().eviction_count += 1;
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.read().clone()
    }

    fn slot(&self, key: &SessionKey) -> Slot {
        Arc::clone(self.slots.entry(key.clone()).or_default().value())
    }
}
