// Process wiring: the store, the scheduler loop and the HTTP control API are
// started together and stopped together.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::config::Config;
use crate::executor::Executor;
use crate::notifier;
use crate::provider::ProviderRegistry;
use crate::scheduler::Scheduler;
use crate::session::SessionCache;
use crate::store::{connect_with_retry, MemoryStore, TaskStore};

pub struct Worker {
    local_addr: SocketAddr,
    store: Arc<dyn TaskStore>,
    sessions: Arc<SessionCache>,
    shutdown: CancellationToken,
    scheduler: JoinHandle<()>,
    server: JoinHandle<std::io::Result<()>>,
}

impl Worker {
    pub async fn start(config: Config, registry: ProviderRegistry) -> anyhow::Result<Self> {
        let store = open_store(&config).await?;
        if registry.kinds().is_empty() {
            warn!("No providers registered, every task will fail at login");
        }

        let sessions = Arc::new(SessionCache::new(registry));
        let notifier = notifier::from_endpoint(config.ntfy_url.as_deref());
        if !notifier.is_enabled() {
            info!("NTFY_URL not set, push notifications disabled");
        }

        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            Arc::clone(&sessions),
            notifier,
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            executor,
            config.scheduler_tick,
        ));
        if config.recover_running_on_start {
            scheduler.recover().await;
        }

        let listener = TcpListener::bind(config.bind_addr())
            .await
            .with_context(|| format!("Failed to bind control API on {}", config.bind_addr()))?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();

        let scheduler_task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        let app = api::router(AppState {
            store: Arc::clone(&store),
            sessions: Arc::clone(&sessions),
        });
        let server_task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            })
        };

        info!(addr = %local_addr, "Reservation worker started");
        Ok(Self {
            local_addr,
            store,
            sessions,
            shutdown,
            scheduler: scheduler_task,
            server: server_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    pub fn sessions(&self) -> Arc<SessionCache> {
        Arc::clone(&self.sessions)
    }

    /// Stops the API and the scheduler, then waits for in-flight attempts and
    /// their notifications.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("Shutting down reservation worker");
        self.shutdown.cancel();

        self.scheduler.await.context("Scheduler task panicked")?;
        self.server
            .await
            .context("HTTP server task panicked")?
            .context("HTTP server failed")?;

        info!("Reservation worker stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> anyhow::Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")
        })
        .await
    }

    /// Serves until `signal` resolves, then shuts down. A failed signal still
    /// shuts down before the error is returned.
    pub async fn run_until<F>(self, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let received = signal.await;
        info!("Shutdown requested");
        self.shutdown().await?;
        received
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn TaskStore>> {
    if config.uses_memory_store() {
        warn!("Using in-memory store, tasks will not survive a restart");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = connect_with_retry(
        &config.database_url,
        config.db_connect_max_tries,
        config.db_connect_retry,
    )
    .await
    .with_context(|| format!("Failed to open database {}", config.database_url))?;
    Ok(Arc::new(store))
}
