//! PTY process management
//!
//! Handles spawning processes attached to a pseudo-terminal, including:
//! - Configurable terminal size and environment
//! - A reader thread that forwards terminal output over a bounded channel
//! - Deadline-bounded reads for prompt framing
//! - Exit detection, reaping, and forced cleanup on drop

use super::framer::{ByteSource, ReadEvent};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors that can occur during PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to write to PTY: {0}")]
    WriteFailed(String),

    #[error("Line of {0} bytes exceeds the terminal line limit of 4095 bytes")]
    LineTooLong(usize),

    #[error("Process already exited")]
    ProcessExited,

    #[error("PTY system error: {0}")]
    SystemError(String),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Terminal size configuration
#[derive(Debug, Clone, Copy)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 200, rows: 50 }
    }
}

impl TerminalSize {
    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Longest line a canonical-mode terminal accepts, excluding the newline
///
/// The line discipline silently drops input past this length.
pub const MAX_LINE_BYTES: usize = 4095;

/// Capacity of the output channel, in chunks
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Poll interval while waiting for a child to be reaped
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A process running under a pseudo-terminal
///
/// All operations are blocking; callers on an async runtime should drive
/// this from a blocking worker.
pub struct PtyProcess {
    id: Uuid,
    pid: Option<u32>,
    /// Kept alive so the terminal stays open for the child
    _master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    output_rx: flume::Receiver<Vec<u8>>,
    exited: Arc<AtomicBool>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl PtyProcess {
    /// Spawn a new process with a PTY
    ///
    /// # Arguments
    /// * `program` - The program to run
    /// * `args` - Program arguments
    /// * `working_dir` - Working directory for the process
    /// * `env` - Extra environment variables
    /// * `size` - Initial terminal size
    pub fn spawn(
        program: &str,
        args: &[String],
        working_dir: &Path,
        env: &[(String, String)],
        size: TerminalSize,
    ) -> PtyResult<Self> {
        let id = Uuid::new_v4();

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.to_pty_size())
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(working_dir);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("{program}: {e}")))?;

        // The child holds its own copy of the slave side
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;

        let (output_tx, output_rx) = flume::bounded(OUTPUT_CHANNEL_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));
        let exited_flag = Arc::clone(&exited);

        std::thread::Builder::new()
            .name(format!("pty-reader-{id}"))
            .spawn(move || Self::reader_loop(reader, output_tx, exited_flag, id))
            .map_err(|e| PtyError::SystemError(e.to_string()))?;

        let pid = child.process_id();
        debug!(%id, ?pid, program, "Spawned PTY process");

        Ok(Self {
            id,
            pid,
            _master: pair.master,
            writer,
            child,
            output_rx,
            exited,
        })
    }

    /// Reader loop that runs in a dedicated thread until the terminal closes
    fn reader_loop(
        mut reader: Box<dyn Read + Send>,
        output_tx: flume::Sender<Vec<u8>>,
        exited: Arc<AtomicBool>,
        id: Uuid,
    ) {
        let mut buffer = [0u8; 4096];

        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO is the normal signal that the child side closed
                    debug!(%id, error = %e, "PTY reader stopped");
                    break;
                }
            }
        }

        exited.store(true, Ordering::SeqCst);
    }

    /// Get the OS process ID, if known
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the terminal output stream has closed
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Shared flag set once the terminal output stream closes
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exited)
    }

    /// Write raw bytes to the PTY
    pub fn write(&mut self, data: &[u8]) -> PtyResult<()> {
        if self.has_exited() {
            return Err(PtyError::ProcessExited);
        }

        self.writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    /// Write a line terminated by a newline
    pub fn write_line(&mut self, line: &str) -> PtyResult<()> {
        if line.len() > MAX_LINE_BYTES {
            return Err(PtyError::LineTooLong(line.len()));
        }
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write(&data)
    }

    /// Drain and return all output already buffered in the channel
    pub fn drain_pending(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        while let Ok(chunk) = self.output_rx.try_recv() {
            buf.extend_from_slice(&chunk);
        }
        buf
    }

    /// Exit code of the child if it has already exited
    pub fn exit_status(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(exit_code_of(&status)),
            Ok(None) => None,
            Err(e) => {
                warn!(id = %self.id, error = %e, "Failed to poll child status");
                None
            }
        }
    }

    /// Wait up to `timeout` for the child to exit and return its exit code
    pub fn reap(&mut self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.exit_status() {
                return Some(code);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(REAP_POLL_INTERVAL);
        }
    }

    /// Forcibly kill the child
    pub fn kill(&mut self) -> PtyResult<()> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        self.child
            .kill()
            .map_err(|e| PtyError::SystemError(e.to_string()))
    }
}

impl ByteSource for PtyProcess {
    fn recv_until(&mut self, deadline: Instant) -> ReadEvent {
        match self.output_rx.recv_deadline(deadline) {
            Ok(chunk) => ReadEvent::Data(chunk),
            Err(flume::RecvTimeoutError::Timeout) => ReadEvent::TimedOut,
            Err(flume::RecvTimeoutError::Disconnected) => ReadEvent::Closed,
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.exit_status().is_none() {
            if let Err(e) = self.child.kill() {
                debug!(id = %self.id, error = %e, "Kill on drop failed");
            }
            let _ = self.child.try_wait();
        }
    }
}

fn exit_code_of(status: &portable_pty::ExitStatus) -> i32 {
    i32::try_from(status.exit_code()).unwrap_or(i32::MAX)
}
