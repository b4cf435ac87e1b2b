//! Structured command results

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Appended to stdout when captured output was cut at the size limit
pub const TRUNCATION_NOTICE: &str = "\n[output truncated]";

/// Exit code reported when no real exit status exists
pub const NO_EXIT_CODE: i32 = -1;

/// Outcome class of a command
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Success,
    Error,
}

/// Decision recorded by the command gate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityInfo {
    pub validated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SecurityInfo {
    /// Command passed validation
    pub fn passed() -> Self {
        Self {
            validated: true,
            reason: None,
        }
    }

    /// Command was rejected
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            validated: false,
            reason: Some(reason.into()),
        }
    }
}

/// Result of one `execute` call
///
/// stdout carries the combined terminal output; a terminal does not keep
/// the two streams apart, so stderr only ever holds messages about the
/// execution itself (timeouts, process death, rejections).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub command: String,
    /// Wall-clock seconds
    pub execution_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_info: Option<SecurityInfo>,
}

impl CommandResult {
    /// Build a result whose status follows the exit code
    pub fn new(
        command: impl Into<String>,
        exit_code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        let status = if exit_code == 0 {
            CommandStatus::Success
        } else {
            CommandStatus::Error
        };
        Self {
            status,
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            command: command.into(),
            execution_time: elapsed.as_secs_f64(),
            security_info: None,
        }
    }

    /// A command that never reached the shell
    pub fn failure(command: impl Into<String>, message: impl Into<String>, elapsed: Duration) -> Self {
        Self::new(command, NO_EXIT_CODE, String::new(), message, elapsed)
    }

    /// A command refused by the gate
    pub fn rejected(command: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::failure(
            command,
            format!("Security validation failed: {reason}"),
            Duration::ZERO,
        )
        .with_security_info(SecurityInfo::rejected(reason))
    }

    /// Attach a gate decision
    pub fn with_security_info(mut self, info: SecurityInfo) -> Self {
        self.security_info = Some(info);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_exit_code() {
        let ok = CommandResult::new("true", 0, "", "", Duration::from_millis(5));
        assert!(ok.is_success());

        let failed = CommandResult::new("false", 1, "", "", Duration::from_millis(5));
        assert_eq!(failed.status, CommandStatus::Error);
    }

    #[test]
    fn test_rejected_result() {
        let result = CommandResult::rejected("rm -rf /", "Command matches blocked pattern: rm");
        assert_eq!(result.exit_code, NO_EXIT_CODE);
        assert_eq!(result.status, CommandStatus::Error);
        assert!(result.stderr.starts_with("Security validation failed:"));
        assert_eq!(
            result.security_info,
            Some(SecurityInfo::rejected("Command matches blocked pattern: rm"))
        );
    }

    #[test]
    fn test_serialization_shape() {
        let result = CommandResult::new("echo hi", 0, "hi", "", Duration::from_millis(250));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["stdout"], "hi");
        assert_eq!(json["execution_time"], 0.25);
        assert!(json.get("security_info").is_none());

        let json = serde_json::to_value(result.with_security_info(SecurityInfo::passed())).unwrap();
        assert_eq!(json["security_info"]["validated"], true);
        assert!(json["security_info"].get("reason").is_none());
    }
}
