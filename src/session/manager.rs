//! Session lifecycle manager
//!
//! Creates sessions, resolves session ids (including the implicit default
//! session) and runs the background sweep that evicts idle or dead shells.
//! The default session lives in its own registry of capacity one so it gets
//! the same eviction rules as named sessions.

use futures_util::future::join_all;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::driver::ShellSpec;
use super::registry::{RegistryError, SessionRegistry};
use super::shell::{SessionError, ShellSession};
use crate::config::{Config, ConfigResult};
use crate::pty::WorkerPool;

/// Id of the implicit session used when a call names none
pub const DEFAULT_SESSION_ID: &str = "default";

/// Errors that can occur during manager operations
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Session not found or expired: {0}")]
    NotFound(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Result type for manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Lifecycle limits
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
    pub max_sessions: usize,
    pub worker_threads: usize,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            cleanup_interval: config.cleanup_interval(),
            max_sessions: config.session.max_sessions,
            worker_threads: config.worker_threads(),
        }
    }
}

/// Sessions removed by one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle longer than the timeout
    pub expired: Vec<String>,
    /// Shell process had died
    pub dead: Vec<String>,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired.len() + self.dead.len()
    }
}

#[derive(Debug)]
struct Sweeper {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns every shell session and their shared worker pool
#[derive(Debug)]
pub struct SessionManager {
    spec: ShellSpec,
    settings: ManagerSettings,
    pool: WorkerPool,
    registry: SessionRegistry,
    default: SessionRegistry,
    /// Serializes creation of the default session
    default_init: Mutex<()>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SessionManager {
    /// Create a manager; no shell is spawned until first use
    pub fn new(spec: ShellSpec, settings: ManagerSettings) -> Self {
        let pool = WorkerPool::new(settings.worker_threads);
        Self {
            spec,
            registry: SessionRegistry::new(settings.max_sessions),
            default: SessionRegistry::new(1),
            settings,
            pool,
            default_init: Mutex::new(()),
            sweeper: Mutex::new(None),
        }
    }

    /// Create a manager from loaded configuration
    pub fn from_config(config: &Config) -> ConfigResult<Self> {
        Ok(Self::new(
            ShellSpec::from_config(config)?,
            ManagerSettings::from_config(config),
        ))
    }

    /// Spawn a new named session and return its id
    pub async fn create_session(&self) -> ManagerResult<String> {
        if !self.registry.has_capacity().await {
            return Err(RegistryError::CapacityExceeded {
                max: self.registry.max_sessions(),
            }
            .into());
        }

        let id = Uuid::new_v4().to_string();
        let session = Arc::new(ShellSession::new(&id, self.spec.clone(), self.pool.clone()));
        session.start().await?;

        if let Err(e) = self.registry.create(Arc::clone(&session)).await {
            // Lost a race for the last slot
            if let Err(term) = session.terminate().await {
                warn!(session_id = %id, error = %term, "Failed to clean up rejected session");
            }
            return Err(e.into());
        }

        info!(session_id = %id, "Created session");
        Ok(id)
    }

    /// Find the session a call addresses
    ///
    /// `None` and the default id resolve to the default session, which is
    /// created on demand. Unknown or dead ids are `NotFound`.
    pub async fn resolve(&self, session_id: Option<&str>) -> ManagerResult<Arc<ShellSession>> {
        match session_id {
            None | Some(DEFAULT_SESSION_ID) => self.default_session().await,
            Some(id) => self
                .registry
                .get(id)
                .await
                .ok_or_else(|| ManagerError::NotFound(id.to_string())),
        }
    }

    /// The default session, spawning a fresh shell if none is alive
    pub async fn default_session(&self) -> ManagerResult<Arc<ShellSession>> {
        if let Some(session) = self.default.get(DEFAULT_SESSION_ID).await {
            return Ok(session);
        }

        let _init = self.default_init.lock().await;
        if let Some(session) = self.default.get(DEFAULT_SESSION_ID).await {
            return Ok(session);
        }

        let session = Arc::new(ShellSession::new(
            DEFAULT_SESSION_ID,
            self.spec.clone(),
            self.pool.clone(),
        ));
        session.start().await?;
        self.default.create(Arc::clone(&session)).await?;
        info!(session_id = DEFAULT_SESSION_ID, "Started default session");
        Ok(session)
    }

    /// Whether the default session's shell is running
    pub async fn default_alive(&self) -> bool {
        self.default
            .peek(DEFAULT_SESSION_ID)
            .await
            .is_some_and(|session| session.is_alive())
    }

    /// Terminate and forget a named session; returns whether it existed
    pub async fn delete_session(&self, id: &str) -> bool {
        let deleted = match id {
            DEFAULT_SESSION_ID => self.default.delete(id).await,
            _ => self.registry.delete(id).await,
        };
        if deleted {
            info!(session_id = %id, "Deleted session");
        }
        deleted
    }

    /// Ids of named sessions, sorted
    pub async fn list_sessions(&self) -> Vec<String> {
        let mut ids = self.registry.list_ids().await;
        ids.sort();
        ids
    }

    /// Number of named sessions
    pub async fn session_count(&self) -> usize {
        self.registry.count().await
    }

    /// Start the periodic sweep; a no-op while one is already running
    pub async fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            debug!("Session sweep already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(sweep_loop(
            Arc::downgrade(self),
            self.settings.cleanup_interval,
            shutdown_rx,
        ));
        *sweeper = Some(Sweeper {
            shutdown_tx,
            handle,
        });
        info!(
            interval_secs = self.settings.cleanup_interval.as_secs(),
            idle_timeout_secs = self.settings.idle_timeout.as_secs(),
            workers = self.pool.size(),
            "Session sweep started"
        );
    }

    /// Stop the periodic sweep and wait until it has finished
    pub async fn stop(&self) {
        let Some(sweeper) = self.sweeper.lock().await.take() else {
            return;
        };

        let _ = sweeper.shutdown_tx.send(());
        if let Err(e) = sweeper.handle.await {
            warn!(error = %e, "Session sweep task failed");
        }
        debug!("Session sweep stopped");
    }

    /// Whether the periodic sweep is running
    #[cfg(test)]
    pub async fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Evict idle and dead sessions once
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for registry in [&self.registry, &self.default] {
            self.sweep_registry(registry, &mut report).await;
        }

        if report.total() > 0 {
            info!(
                expired = report.expired.len(),
                dead = report.dead.len(),
                "Evicted sessions"
            );
        }
        report
    }

    async fn sweep_registry(&self, registry: &SessionRegistry, report: &mut SweepReport) {
        let mut evicted = Vec::new();
        for session in registry.snapshot().await {
            let dead = session.is_dead();
            let idle = session.idle_time();
            // A running command is activity, however long it takes
            if !dead && (session.is_busy() || idle <= self.settings.idle_timeout) {
                continue;
            }
            if !registry.evict(&session).await {
                continue;
            }

            if dead {
                debug!(session_id = %session.id(), "Evicting dead session");
                report.dead.push(session.id().to_string());
            } else {
                debug!(session_id = %session.id(), idle_secs = idle.as_secs(), "Evicting idle session");
                report.expired.push(session.id().to_string());
            }
            evicted.push(session);
        }

        terminate_all(&evicted, "Failed to terminate evicted session").await;
    }

    /// Stop the sweep, then terminate and remove every session
    pub async fn shutdown(&self) {
        info!("Shutting down all sessions");
        self.stop().await;

        let mut sessions = self.registry.drain().await;
        sessions.extend(self.default.drain().await);
        terminate_all(&sessions, "Error terminating session during shutdown").await;

        // Every shell is stopped; refuse any late job
        self.pool.close();
    }
}

/// Terminate sessions concurrently, logging failures
async fn terminate_all(sessions: &[Arc<ShellSession>], context: &str) {
    let results = join_all(sessions.iter().map(|session| session.terminate())).await;
    for (session, result) in sessions.iter().zip(results) {
        if let Err(e) = result {
            warn!(session_id = %session.id(), error = %e, "{context}");
        }
    }
}

async fn sweep_loop(
    manager: Weak<SessionManager>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.sweep_once().await;
            }
        }
    }
}
