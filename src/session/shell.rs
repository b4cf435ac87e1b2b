//! Persistent shell session
//!
//! Owns one shell process and exposes execute/get-cwd/reset/terminate over
//! it. Calls on one session are serialized through an execution gate; the
//! blocking terminal work itself runs on the shared [`WorkerPool`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::driver::{RunOutcome, ShellDriver, ShellSpec};
use super::result::{CommandResult, CommandStatus, NO_EXIT_CODE, TRUNCATION_NOTICE};
use crate::pty::{Captured, PoolError, WorkerPool};

/// Errors that can occur during session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to spawn shell: {0}")]
    SpawnFailed(String),

    #[error("Session has not been started")]
    NotStarted,

    #[error("Session is not running")]
    NotRunning,

    #[error("Session already running")]
    AlreadyRunning,

    #[error("Invalid working directory: {0}")]
    InvalidPath(String),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellPhase {
    Uninitialized,
    Running,
    Terminating,
    Terminated,
}

#[derive(Debug)]
struct ShellStatus {
    phase: ShellPhase,
    /// Set by the terminal reader once the shell's stream closes
    exited: Option<Arc<AtomicBool>>,
}

type DriverSlot = Arc<Mutex<Option<ShellDriver>>>;

fn lock_slot(slot: &Mutex<Option<ShellDriver>>) -> MutexGuard<'_, Option<ShellDriver>> {
    slot.lock().unwrap_or_else(|e| {
        warn!("shell driver lock was poisoned, recovering");
        e.into_inner()
    })
}

/// A long-lived shell bound to a session id
#[derive(Debug)]
pub struct ShellSession {
    id: String,
    spec: ShellSpec,
    pool: WorkerPool,
    /// Serializes start/execute/reset/terminate
    gate: tokio::sync::Mutex<()>,
    /// Locked only from pool jobs, so an abandoned call still finishes cleanly
    driver: DriverSlot,
    status: RwLock<ShellStatus>,
    last_activity: Mutex<Instant>,
}

impl ShellSession {
    /// Create a session that has not spawned its shell yet
    pub fn new(id: impl Into<String>, spec: ShellSpec, pool: WorkerPool) -> Self {
        Self {
            id: id.into(),
            spec,
            pool,
            gate: tokio::sync::Mutex::new(()),
            driver: Arc::new(Mutex::new(None)),
            status: RwLock::new(ShellStatus {
                phase: ShellPhase::Uninitialized,
                exited: None,
            }),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Get the session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Directory the shell starts in
    pub fn working_dir(&self) -> &Path {
        &self.spec.working_dir
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> ShellPhase {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .phase
    }

    /// Whether the shell process is running; never blocks on an in-flight command
    pub fn is_alive(&self) -> bool {
        let status = self.status.read().unwrap_or_else(PoisonError::into_inner);
        status.phase == ShellPhase::Running
            && status
                .exited
                .as_ref()
                .is_some_and(|exited| !exited.load(Ordering::SeqCst))
    }

    /// Whether the shell has gone away and needs a reset to be usable
    ///
    /// A session that is starting or being reset is neither alive nor dead.
    pub fn is_dead(&self) -> bool {
        let status = self.status.read().unwrap_or_else(PoisonError::into_inner);
        match status.phase {
            ShellPhase::Terminated => true,
            ShellPhase::Running => status
                .exited
                .as_ref()
                .map_or(true, |exited| exited.load(Ordering::SeqCst)),
            ShellPhase::Uninitialized | ShellPhase::Terminating => false,
        }
    }

    /// Whether a call currently holds the execution gate
    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Time since the last operation started or finished
    pub fn idle_time(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Spawn the shell
    pub async fn start(&self) -> SessionResult<()> {
        let _gate = self.gate.lock().await;
        if self.is_alive() {
            return Err(SessionError::AlreadyRunning);
        }
        self.launch().await
    }

    /// Run one command and report its outcome as data
    ///
    /// Only misuse (never started, already terminated) is an error; timeouts,
    /// non-zero exits and shell death all come back as a [`CommandResult`].
    pub async fn execute(&self, command: &str, timeout: Duration) -> SessionResult<CommandResult> {
        let _gate = self.gate.lock().await;
        match self.phase() {
            ShellPhase::Uninitialized => return Err(SessionError::NotStarted),
            ShellPhase::Terminating | ShellPhase::Terminated => {
                return Err(SessionError::NotRunning)
            }
            ShellPhase::Running => {}
        }

        self.touch();
        let started = Instant::now();
        let slot = Arc::clone(&self.driver);
        let line = command.to_string();
        let outcome = self
            .pool
            .run(move || lock_slot(&slot).as_mut().map(|driver| driver.run(&line, timeout)))
            .await;

        self.touch();
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Some(RunOutcome::Completed { output, exit_code })) => {
                CommandResult::new(command, exit_code, render(output), "", elapsed)
            }
            Ok(Some(RunOutcome::TimedOut { partial })) => {
                debug!(session_id = %self.id, command, "Command timed out");
                CommandResult::new(
                    command,
                    NO_EXIT_CODE,
                    render(partial),
                    format!("Command timed out after {:?}", timeout),
                    elapsed,
                )
            }
            Ok(Some(RunOutcome::Terminated {
                partial,
                exit_status,
            })) => {
                warn!(session_id = %self.id, ?exit_status, "Shell process terminated during command");
                self.set_phase(ShellPhase::Terminated);
                let stderr = match exit_status {
                    Some(code) => format!("Shell process terminated (exit status {code})"),
                    None => "Shell process terminated".to_string(),
                };
                // A shell that exits cleanly mid-command still failed the command
                let exit_code = exit_status.filter(|&code| code != 0).unwrap_or(NO_EXIT_CODE);
                let mut result =
                    CommandResult::new(command, exit_code, render(partial), stderr, elapsed);
                result.status = CommandStatus::Error;
                result
            }
            Ok(Some(RunOutcome::NotSent { reason })) => {
                debug!(session_id = %self.id, command, %reason, "Command not sent");
                CommandResult::failure(command, reason, elapsed)
            }
            Ok(None) => {
                self.set_phase(ShellPhase::Terminated);
                CommandResult::failure(command, "Shell process terminated", elapsed)
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Command execution failed");
                CommandResult::failure(command, format!("Execution failed: {e}"), elapsed)
            }
        };

        debug!(
            session_id = %self.id,
            exit_code = result.exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            "Command finished"
        );
        Ok(result)
    }

    /// Current working directory of the shell
    ///
    /// Falls back to the starting directory when the probe fails.
    pub async fn get_cwd(&self) -> String {
        let fallback = self.working_dir().display().to_string();
        match self.execute("pwd", self.spec.cwd_timeout).await {
            Ok(result) if result.is_success() => result
                .stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .last()
                .map(str::to_string)
                .unwrap_or(fallback),
            Ok(result) => {
                debug!(session_id = %self.id, stderr = %result.stderr, "pwd probe failed");
                fallback
            }
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "pwd probe unavailable");
                fallback
            }
        }
    }

    /// Replace the shell with a fresh one using the same configuration
    pub async fn reset(&self) -> SessionResult<()> {
        let _gate = self.gate.lock().await;
        info!(session_id = %self.id, "Resetting shell session");
        self.shutdown_driver().await?;
        self.launch().await
    }

    /// Stop the shell, killing it if it does not exit in time
    ///
    /// Safe to call repeatedly; the session is not alive afterwards.
    pub async fn terminate(&self) -> SessionResult<()> {
        let _gate = self.gate.lock().await;
        if self.phase() == ShellPhase::Terminated {
            return Ok(());
        }
        let outcome = self.shutdown_driver().await;
        self.set_phase(ShellPhase::Terminated);
        outcome
    }

    /// Spawn a shell into the empty driver slot; caller holds the gate
    async fn launch(&self) -> SessionResult<()> {
        let dir = self.working_dir();
        if !dir.exists() {
            return Err(SessionError::InvalidPath(format!(
                "Working directory does not exist: {}",
                dir.display()
            )));
        }
        if !dir.is_dir() {
            return Err(SessionError::InvalidPath(format!(
                "Working directory is not a directory: {}",
                dir.display()
            )));
        }

        let spec = self.spec.clone();
        let slot = Arc::clone(&self.driver);
        let launched = self
            .pool
            .run(move || {
                let mut slot = lock_slot(&slot);
                if let Some(mut stale) = slot.take() {
                    stale.shutdown(spec.terminate_timeout);
                }
                let driver = ShellDriver::launch(&spec)?;
                let exited = driver.exit_flag();
                let pid = driver.pid();
                *slot = Some(driver);
                Ok::<_, crate::pty::PtyError>((exited, pid))
            })
            .await?;

        let (exited, pid) = match launched {
            Ok(launched) => launched,
            Err(e) => {
                self.set_phase(ShellPhase::Terminated);
                return Err(SessionError::SpawnFailed(e.to_string()));
            }
        };

        {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            status.phase = ShellPhase::Running;
            status.exited = Some(exited);
        }
        self.touch();
        info!(session_id = %self.id, ?pid, shell = %self.spec.program, "Shell session started");
        Ok(())
    }

    /// Shut down and drop the current driver; caller holds the gate
    async fn shutdown_driver(&self) -> SessionResult<()> {
        if self.phase() == ShellPhase::Uninitialized {
            return Ok(());
        }
        self.set_phase(ShellPhase::Terminating);

        let slot = Arc::clone(&self.driver);
        let grace = self.spec.terminate_timeout;
        let exit_status = self
            .pool
            .run(move || {
                let driver = lock_slot(&slot).take();
                driver.and_then(|mut driver| driver.shutdown(grace))
            })
            .await?;

        debug!(session_id = %self.id, ?exit_status, "Shell process stopped");
        Ok(())
    }

    fn set_phase(&self, phase: ShellPhase) {
        self.status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .phase = phase;
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Pretend the session has been idle for `by`
    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        let mut last = self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *last = Instant::now().checked_sub(by).unwrap_or(*last);
    }
}

/// Captured text as returned to callers
fn render(captured: Captured) -> String {
    let mut text = captured.text.trim_end_matches('\n').to_string();
    if captured.truncated {
        text.push_str(TRUNCATION_NOTICE);
    }
    text
}
