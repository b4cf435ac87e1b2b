//! Command validation
//!
//! Checks a command line against an executable allowlist and a set of
//! blocked regex patterns before it reaches a shell. Every decision can be
//! written to the `audit` log target.

use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SecuritySettings;

/// Reasons a command is refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecurityError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Command '{executable}' is not in the allowlist. Allowed: {allowed}")]
    NotAllowed { executable: String, allowed: String },

    #[error("Command matches blocked pattern: {0}")]
    BlockedPattern(String),

    #[error("Invalid blocked pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Result type for validation
pub type SecurityResult<T> = Result<T, SecurityError>;

/// Allowlist and blocklist gate applied before execution
#[derive(Debug, Clone)]
pub struct SecurityValidator {
    enabled: bool,
    allowed_executables: Vec<String>,
    blocked_patterns: Vec<Regex>,
    audit_log: bool,
}

impl SecurityValidator {
    /// Compile the gate from settings
    pub fn new(settings: &SecuritySettings) -> SecurityResult<Self> {
        let blocked_patterns = settings
            .blocked_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| SecurityError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<SecurityResult<Vec<_>>>()?;

        Ok(Self {
            enabled: settings.enabled,
            allowed_executables: settings.allowed_executables.clone(),
            blocked_patterns,
            audit_log: settings.audit_log,
        })
    }

    /// A gate that lets everything through
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            allowed_executables: Vec::new(),
            blocked_patterns: Vec::new(),
            audit_log: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Accept or reject a command line
    pub fn validate(&self, command: &str) -> SecurityResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let command = command.trim();
        let Some(executable) = command.split_whitespace().next() else {
            return Err(SecurityError::EmptyCommand);
        };

        if !self.allowed_executables.is_empty()
            && !self.allowed_executables.iter().any(|a| a == executable)
        {
            if self.audit_log {
                warn!(target: "audit", command, executable, "Blocked command (not in allowlist)");
            }
            return Err(SecurityError::NotAllowed {
                executable: executable.to_string(),
                allowed: self.allowed_executables.join(", "),
            });
        }

        if let Some(pattern) = self.blocked_patterns.iter().find(|p| p.is_match(command)) {
            if self.audit_log {
                warn!(target: "audit", command, pattern = pattern.as_str(), "Blocked command (matches pattern)");
            }
            return Err(SecurityError::BlockedPattern(pattern.as_str().to_string()));
        }

        if self.audit_log {
            info!(target: "audit", command, "Command validated");
        }
        Ok(())
    }
}
