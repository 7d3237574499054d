// Provider gateway: the capability set every booking site exposes.
// The session cache and the executor only ever see these traits.

pub mod parser;
#[cfg(any(test, feature = "testing"))]
pub mod scripted;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::Error;
use crate::models::{Account, ProviderKind, Reservation, Route, TrainCandidate};

pub use parser::{SummaryLineParser, TrainParser};
#[cfg(any(test, feature = "testing"))]
pub use scripted::ScriptedProvider;

// Latest departure considered by a search (end of day)
pub const SEARCH_TIME_TO: &str = "235959";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("login rejected: {0}")]
    Authentication(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    // The provider refused the reservation (seat taken between check and reserve, ...)
    #[error("reservation rejected: {0}")]
    Rejected(String),

    #[error("unexpected provider response: {0}")]
    Protocol(String),
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Authentication(msg) => Error::Authentication(msg),
            ProviderError::Unavailable(msg) | ProviderError::Rejected(msg) => {
                Error::ProviderUnavailable(msg)
            }
            ProviderError::Protocol(msg) => Error::Unexpected(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub dep_station: String,
    pub arr_station: String,
    pub date: String,
    pub time_from: String,
    pub time_to: String,
}

impl From<&Route> for SearchQuery {
    fn from(route: &Route) -> Self {
        Self {
            dep_station: route.dep_station.clone(),
            arr_station: route.arr_station.clone(),
            date: route.date.clone(),
            time_from: route.time_from.clone(),
            time_to: SEARCH_TIME_TO.to_string(),
        }
    }
}

// One authenticated (or not yet authenticated) conversation with a provider.
// Implementations are not required to be usable concurrently, so every call
// takes `&mut self` and the session cache hands out exclusive access.
#[async_trait]
pub trait ProviderSession: Send {
    fn is_logged_in(&self) -> bool;

    async fn authenticate(&mut self) -> Result<(), ProviderError>;

    async fn search(&mut self, query: &SearchQuery) -> Result<Vec<TrainCandidate>, ProviderError>;

    async fn reserve(&mut self, train: &TrainCandidate) -> Result<Reservation, ProviderError>;
}

// Builds fresh, unauthenticated sessions for one provider.
pub trait ProviderConnector: Send + Sync + 'static {
    fn connect(&self, username: &str, secret: &str) -> Box<dyn ProviderSession>;
}

/// Maps each provider kind to the connector that talks to it.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    connectors: HashMap<ProviderKind, Arc<dyn ProviderConnector>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ProviderKind, connector: Arc<dyn ProviderConnector>) {
        self.connectors.insert(kind, connector);
    }

    pub fn with(mut self, kind: ProviderKind, connector: Arc<dyn ProviderConnector>) -> Self {
        self.register(kind, connector);
        self
    }

    pub fn connect(&self, account: &Account) -> Result<Box<dyn ProviderSession>, Error> {
        let connector = self.connectors.get(&account.kind).ok_or_else(|| {
            Error::config(format!("no provider registered for {}", account.kind))
        })?;
        Ok(connector.connect(&account.username, &account.secret))
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.connectors.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
