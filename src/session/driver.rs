//! Blocking shell driver
//!
//! Composes a [`PtyProcess`] with a [`Framer`] to turn an interactive shell
//! into a request/response executor. Every method blocks the calling thread
//! and is meant to run on the worker pool.

use crate::config::{Config, ConfigError, ConfigResult};
use crate::pty::{
    Captured, Frame, Framer, PromptMarker, PtyError, PtyProcess, PtyResult, TerminalSize,
    MAX_LINE_BYTES,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long to wait for the exit status of a shell whose stream closed
const REAP_AFTER_CLOSE: Duration = Duration::from_secs(1);

/// Reported when an earlier timed-out command still holds the shell
pub const PREVIOUS_COMMAND_RUNNING: &str = "Previous command still running; command not executed";

/// Everything needed to launch one shell
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub marker: PromptMarker,
    /// Cap on captured bytes per command
    pub max_output: usize,
    pub startup_timeout: Duration,
    pub status_timeout: Duration,
    pub terminate_timeout: Duration,
    pub cwd_timeout: Duration,
}

impl ShellSpec {
    /// Launch settings with default limits and timeouts
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>, marker: PromptMarker) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            marker,
            max_output: 1024 * 1024,
            startup_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(5),
            terminate_timeout: Duration::from_secs(5),
            cwd_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }

    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Build launch settings from loaded configuration
    pub fn from_config(config: &Config) -> ConfigResult<Self> {
        let marker = PromptMarker::new(&config.shell.prompt_marker)
            .map_err(|e| ConfigError::InvalidPromptMarker(e.to_string()))?;
        let shell = &config.shell;

        let mut spec = Self::new(
            shell.default_shell.clone(),
            config.security.working_directory.clone(),
            marker,
        )
        .with_args(shell.shell_args.clone())
        .with_max_output(config.security.max_output_size)
        .with_terminate_timeout(Duration::from_secs(shell.terminate_timeout_secs));
        spec.startup_timeout = Duration::from_secs(shell.startup_timeout_secs);
        spec.status_timeout = Duration::from_secs(shell.exit_code_timeout_secs);
        spec.cwd_timeout = Duration::from_secs(shell.cwd_timeout_secs);
        Ok(spec)
    }
}

/// Outcome of running one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The prompt came back and the exit status was read
    Completed { output: Captured, exit_code: i32 },
    /// The prompt did not come back in time; the command may still be running
    TimedOut { partial: Captured },
    /// The shell went away before the prompt came back
    Terminated {
        partial: Captured,
        exit_status: Option<i32>,
    },
    /// The command was never written to the shell
    NotSent { reason: String },
}

/// A live shell plus the framing state for its terminal
#[derive(Debug)]
pub struct ShellDriver {
    process: PtyProcess,
    framer: Framer,
    status_timeout: Duration,
    /// Prompts still owed by commands that timed out
    owed_prompts: usize,
}

impl ShellDriver {
    /// Spawn the shell, install the prompt marker and discard the banner
    pub fn launch(spec: &ShellSpec) -> PtyResult<Self> {
        let env = vec![
            ("TERM".to_string(), "dumb".to_string()),
            ("PAGER".to_string(), "cat".to_string()),
        ];
        let mut process = PtyProcess::spawn(
            &spec.program,
            &spec.args,
            &spec.working_dir,
            &env,
            TerminalSize::default(),
        )?;
        let mut framer = Framer::new(spec.marker.clone(), spec.max_output);

        process.write_line(&spec.marker.init_command())?;

        match framer.expect(&mut process, spec.startup_timeout) {
            Frame::Matched(banner) => {
                debug!(
                    pid = ?process.pid(),
                    marker = spec.marker.as_str(),
                    banner_bytes = banner.text.len(),
                    "Shell ready"
                );
            }
            Frame::TimedOut(_) => {
                return Err(PtyError::SpawnFailed(format!(
                    "{} did not present a prompt within {:?}",
                    spec.program, spec.startup_timeout
                )));
            }
            Frame::StreamClosed(output) => {
                return Err(PtyError::SpawnFailed(format!(
                    "{} exited during startup: {}",
                    spec.program,
                    output.text.trim()
                )));
            }
        }

        Ok(Self {
            process,
            framer,
            status_timeout: spec.status_timeout,
            owed_prompts: 0,
        })
    }

    /// OS process id of the shell
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Flag that flips once the terminal stream closes
    pub fn exit_flag(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        self.process.exit_flag()
    }

    #[cfg(test)]
    pub fn is_alive(&self) -> bool {
        !self.process.has_exited()
    }

    /// Run one command line and read its exit status
    pub fn run(&mut self, command: &str, timeout: Duration) -> RunOutcome {
        if command.len() > MAX_LINE_BYTES {
            return RunOutcome::NotSent {
                reason: format!(
                    "Command is {} bytes; the terminal accepts at most {MAX_LINE_BYTES} bytes per line",
                    command.len()
                ),
            };
        }
        let deadline = Instant::now() + timeout;

        if let Some(outcome) = self.settle(deadline) {
            return outcome;
        }
        self.discard_stale();

        if let Err(e) = self.process.write_line(command) {
            debug!(error = %e, "Write to shell failed");
            return self.terminated(Captured::default());
        }

        match self.framer.expect(&mut self.process, remaining(deadline)) {
            Frame::Matched(output) => match self.probe_exit_code() {
                Some(exit_code) => RunOutcome::Completed { output, exit_code },
                None => self.terminated(output),
            },
            Frame::TimedOut(partial) => {
                self.owed_prompts += 1;
                RunOutcome::TimedOut { partial }
            }
            Frame::StreamClosed(partial) => self.terminated(partial),
        }
    }

    /// Ask the shell to exit, then kill it if it lingers
    pub fn shutdown(&mut self, grace: Duration) -> Option<i32> {
        if !self.process.has_exited() {
            if let Err(e) = self.process.write_line("exit") {
                debug!(error = %e, "Could not send exit to shell");
            }
        }

        if let Some(code) = self.process.reap(grace) {
            return Some(code);
        }

        warn!(pid = ?self.process.pid(), "Shell did not exit in time, killing");
        if let Err(e) = self.process.kill() {
            warn!(error = %e, "Failed to kill shell");
        }
        self.process.reap(REAP_AFTER_CLOSE)
    }

    /// Wait for prompts owed by earlier timed-out commands
    ///
    /// Output read here belongs to those commands and is dropped.
    fn settle(&mut self, deadline: Instant) -> Option<RunOutcome> {
        while self.owed_prompts > 0 {
            match self.framer.expect(&mut self.process, remaining(deadline)) {
                Frame::Matched(late) => {
                    self.owed_prompts -= 1;
                    debug!(bytes = late.text.len(), "Discarded output of an earlier command");
                }
                Frame::TimedOut(partial) => {
                    debug!(
                        owed = self.owed_prompts,
                        bytes = partial.text.len(),
                        "Earlier command still running, not sending"
                    );
                    return Some(RunOutcome::NotSent {
                        reason: PREVIOUS_COMMAND_RUNNING.to_string(),
                    });
                }
                Frame::StreamClosed(partial) => return Some(self.terminated(partial)),
            }
        }
        None
    }

    fn discard_stale(&mut self) {
        let stale = self.process.drain_pending().len() + self.framer.discard();
        if stale > 0 {
            debug!(bytes = stale, state = ?self.framer.state(), "Discarded stale shell output");
        }
    }

    /// `None` means the shell died while answering
    fn probe_exit_code(&mut self) -> Option<i32> {
        if let Err(e) = self.process.write_line("echo $?") {
            debug!(error = %e, "Exit status probe could not be written");
            return None;
        }

        match self.framer.expect(&mut self.process, self.status_timeout) {
            Frame::Matched(reply) => Some(parse_exit_code(&reply.text)),
            Frame::TimedOut(_) => {
                self.owed_prompts += 1;
                warn!("Exit status probe timed out, assuming success");
                Some(0)
            }
            Frame::StreamClosed(_) => None,
        }
    }

    fn terminated(&mut self, partial: Captured) -> RunOutcome {
        let exit_status = self.process.reap(REAP_AFTER_CLOSE);
        RunOutcome::Terminated {
            partial,
            exit_status,
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Read the exit status from the probe's reply
///
/// Unparseable replies count as success and are logged.
fn parse_exit_code(reply: &str) -> i32 {
    let token = reply
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("");

    match token.parse::<i32>() {
        Ok(code) => code,
        Err(_) => {
            warn!(reply = %token, "Unparseable exit status, assuming success");
            0
        }
    }
}
