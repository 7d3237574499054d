// Reservation worker: keeps retrying one selected train reservation per task
// against session-based booking providers until it is booked, fails for good,
// or is cancelled.

pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod models;
pub mod notifier;
pub mod provider;
pub mod scheduler;
pub mod session;
pub mod store;

// Re-export key types for convenience
pub use app::Worker;
pub use config::Config;
pub use error::{Error, Result};
pub use executor::{AttemptOutcome, Executor};
pub use models::{Account, ProviderKind, Task, TaskLog, TaskStatus, TrainCandidate, TrainSelection};
pub use provider::{ProviderConnector, ProviderError, ProviderRegistry, ProviderSession};
pub use scheduler::Scheduler;
pub use session::{SessionCache, SessionStats};
pub use store::{MemoryStore, SqliteStore, TaskStore};
