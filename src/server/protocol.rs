//! Protocol message definitions
//!
//! Defines the tool-call messages exchanged between clients and the shell server.
//! All messages are JSON-encoded and include version information for compatibility.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::files::ContentEncoding;
use crate::session::CommandResult;

/// Current protocol version
/// Increment when making breaking changes to message format
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum supported protocol version
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Maximum command length, bounded by what the terminal accepts as one line
pub const MAX_COMMAND_LENGTH: usize = crate::pty::MAX_LINE_BYTES;

/// Maximum path length
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum session id length
pub const MAX_SESSION_ID_LENGTH: usize = 128;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Protocol version {0} not supported (min: 1, current: 1)")]
    UnsupportedVersion(u32),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message Envelope
// ============================================================================

/// Protocol envelope wrapping all client messages
/// Includes version for compatibility checking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Protocol version used by the client
    #[serde(default = "default_version")]
    pub version: u32,
    /// Request id echoed back on the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// The actual message payload
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Protocol envelope wrapping all server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    /// Protocol version used by the server
    pub version: u32,
    /// Id of the request this answers, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// The actual message payload
    #[serde(flatten)]
    pub message: ServerMessage,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl ClientEnvelope {
    /// Create a new client envelope with the current protocol version
    #[cfg(test)]
    pub fn new(message: ClientMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: None,
            message,
        }
    }

    /// Attach a request id
    #[cfg(test)]
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Parse and validate a client envelope from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let envelope: Self = serde_json::from_str(json)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Validate the envelope and its contents
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }

        self.message.validate()
    }

    /// Serialize the envelope to JSON
    #[cfg(test)]
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerEnvelope {
    /// Create a new server envelope with the current protocol version
    pub fn new(message: ServerMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: None,
            message,
        }
    }

    /// Answer the request with the given id
    pub fn reply(id: Option<u64>, message: ServerMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id,
            message,
        }
    }

    /// Serialize the envelope to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a server envelope from JSON
    #[cfg(test)]
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// Tool calls sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Connection keepalive ping
    Ping {
        /// Sequence number for tracking round-trip time
        seq: u64,
    },

    /// Present the shared token
    Authenticate { token: String },

    /// Spawn a new named session
    CreateSession,

    /// Terminate a named session
    DeleteSession { session_id: String },

    /// List named sessions
    ListSessions,

    /// Run one command line in a session (default session when omitted)
    ExecuteCommand {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        command: String,
        /// Timeout in seconds; clamped to the server maximum
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },

    /// Report the session's current directory
    GetWorkingDirectory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Replace the session's shell with a fresh one
    ResetSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Write a file relative to the session's current directory
    UploadFile {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        path: String,
        content: String,
        #[serde(default)]
        encoding: ContentEncoding,
    },

    /// Read a file relative to the session's current directory
    DownloadFile {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        path: String,
        #[serde(default)]
        encoding: ContentEncoding,
    },

    /// Liveness probe
    Health,
}

fn validate_session_id(session_id: Option<&str>) -> ProtocolResult<()> {
    let Some(id) = session_id else {
        return Ok(());
    };
    if id.is_empty() {
        return Err(ProtocolError::ValidationError(
            "session_id cannot be empty when specified".to_string(),
        ));
    }
    if id.len() > MAX_SESSION_ID_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "session_id exceeds maximum length of {} characters",
            MAX_SESSION_ID_LENGTH
        )));
    }
    Ok(())
}

fn validate_path(path: &str) -> ProtocolResult<()> {
    if path.is_empty() {
        return Err(ProtocolError::ValidationError(
            "path cannot be empty".to_string(),
        ));
    }
    if path.len() > MAX_PATH_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "path exceeds maximum length of {} characters",
            MAX_PATH_LENGTH
        )));
    }
    Ok(())
}

impl ClientMessage {
    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::Ping { .. }
            | ClientMessage::CreateSession
            | ClientMessage::ListSessions
            | ClientMessage::Health => Ok(()),

            ClientMessage::Authenticate { token } => {
                if token.is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "token cannot be empty".to_string(),
                    ));
                }
                Ok(())
            }

            ClientMessage::DeleteSession { session_id } => validate_session_id(Some(session_id)),

            ClientMessage::ExecuteCommand {
                session_id,
                command,
                timeout,
            } => {
                validate_session_id(session_id.as_deref())?;

                if command.trim().is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "command cannot be empty".to_string(),
                    ));
                }
                if command.len() > MAX_COMMAND_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "command exceeds maximum length of {} bytes",
                        MAX_COMMAND_LENGTH
                    )));
                }
                // A second line would be read by the shell as its own command
                if command.contains(['\n', '\r']) {
                    return Err(ProtocolError::ValidationError(
                        "command must be a single line".to_string(),
                    ));
                }
                if *timeout == Some(0) {
                    return Err(ProtocolError::ValidationError(
                        "timeout must be at least 1 second".to_string(),
                    ));
                }
                Ok(())
            }

            ClientMessage::GetWorkingDirectory { session_id }
            | ClientMessage::ResetSession { session_id } => {
                validate_session_id(session_id.as_deref())
            }

            ClientMessage::UploadFile {
                session_id, path, ..
            }
            | ClientMessage::DownloadFile {
                session_id, path, ..
            } => {
                validate_session_id(session_id.as_deref())?;
                validate_path(path)
            }
        }
    }

    /// Create a Ping message
    #[cfg(test)]
    pub fn ping(seq: u64) -> Self {
        ClientMessage::Ping { seq }
    }

    /// Create an ExecuteCommand message for the default session
    #[cfg(test)]
    pub fn execute(command: impl Into<String>) -> Self {
        ClientMessage::ExecuteCommand {
            session_id: None,
            command: command.into(),
            timeout: None,
        }
    }

    /// Create an ExecuteCommand message for a named session
    #[cfg(test)]
    pub fn execute_in(session_id: impl Into<String>, command: impl Into<String>) -> Self {
        ClientMessage::ExecuteCommand {
            session_id: Some(session_id.into()),
            command: command.into(),
            timeout: None,
        }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Welcome message sent on connection
    Welcome {
        /// Server build version
        server_version: String,
        /// Whether calls must authenticate first
        auth_required: bool,
    },

    /// Response to Ping
    Pong {
        /// Echo back the sequence number
        seq: u64,
    },

    /// Token accepted
    Authenticated,

    /// Named session spawned
    SessionCreated { session_id: String },

    /// Outcome of a delete request
    SessionDeleted { session_id: String, deleted: bool },

    /// Named sessions
    SessionList { session_ids: Vec<String> },

    /// Outcome of a command
    CommandResult(CommandResult),

    /// Current directory of a session
    WorkingDirectory { cwd: String },

    /// Session shell replaced
    SessionReset { status: String, message: String },

    /// File written
    FileUploaded {
        status: String,
        path: String,
        size: u64,
    },

    /// File read
    FileDownloaded {
        content: String,
        size: u64,
        encoding: ContentEncoding,
    },

    /// Liveness report
    Health {
        status: String,
        server_version: String,
        shell_alive: bool,
        security_enabled: bool,
        active_sessions: usize,
    },

    /// Error response
    Error {
        /// Error message
        message: String,
        /// Error code for programmatic handling
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        /// Related session if applicable
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format
    InvalidMessage,
    /// Session unknown or evicted
    SessionNotFound,
    /// Failed to spawn a shell
    SpawnFailed,
    /// Session limit reached
    CapacityExceeded,
    /// Authentication required
    AuthRequired,
    /// Authentication failed
    AuthFailed,
    /// Internal server error
    InternalError,
    /// Unsupported protocol version
    UnsupportedVersion,
    /// File does not exist
    FileNotFound,
    /// Content could not be decoded or encoded
    InvalidEncoding,
    /// File exceeds the transfer limit
    FileTooLarge,
    /// Filesystem failure
    IoError,
}

impl ServerMessage {
    /// Create a Welcome message
    pub fn welcome(auth_required: bool) -> Self {
        ServerMessage::Welcome {
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            auth_required,
        }
    }

    /// Create a Pong message
    pub fn pong(seq: u64) -> Self {
        ServerMessage::Pong { seq }
    }

    /// Create an Error message with code
    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
            session_id: None,
        }
    }

    /// Create an Error message for a specific session
    pub fn session_error(
        session_id: impl Into<String>,
        message: impl Into<String>,
        code: ErrorCode,
    ) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
            session_id: Some(session_id.into()),
        }
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::SerializationError(_) => ErrorCode::InvalidMessage,
            ProtocolError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            ProtocolError::ValidationError(_) => ErrorCode::InvalidMessage,
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // -------------------------------------------------------------------------
    // Client Message Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_ping_serialization() {
        let msg = ClientMessage::ping(42);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ping\""));
        assert!(json.contains("\"seq\":42"));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_parse_minimal_execute_command() {
        let json = r#"{"type": "execute_command", "command": "ls -la"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg, ClientMessage::execute("ls -la"));
    }

    #[test]
    fn test_parse_full_execute_command() {
        let json = r#"{"type": "execute_command", "session_id": "abc", "command": "pwd", "timeout": 10}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::ExecuteCommand {
                session_id,
                command,
                timeout,
            } => {
                assert_eq!(session_id.as_deref(), Some("abc"));
                assert_eq!(command, "pwd");
                assert_eq!(timeout, Some(10));
            }
            _ => panic!("Expected ExecuteCommand"),
        }
    }

    #[test]
    fn test_parse_upload_defaults_to_base64() {
        let json = r#"{"type": "upload_file", "path": "a.txt", "content": "aGk="}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::UploadFile { encoding, .. } => {
                assert_eq!(encoding, ContentEncoding::Base64)
            }
            _ => panic!("Expected UploadFile"),
        }
    }

    #[test]
    fn test_unit_messages() {
        for (json, expected) in [
            (r#"{"type": "create_session"}"#, ClientMessage::CreateSession),
            (r#"{"type": "list_sessions"}"#, ClientMessage::ListSessions),
            (r#"{"type": "health"}"#, ClientMessage::Health),
        ] {
            let msg: ClientMessage = serde_json::from_str(json).unwrap();
            assert_eq!(msg, expected);
        }
    }

    // -------------------------------------------------------------------------
    // Server Message Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_welcome_serialization() {
        let msg = ServerMessage::welcome(true);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"welcome\""));
        assert!(json.contains("\"auth_required\":true"));

        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_command_result_is_flattened() {
        let result = CommandResult::new("echo hi", 0, "hi", "", Duration::from_millis(10));
        let envelope = ServerEnvelope::reply(Some(7), ServerMessage::CommandResult(result));
        let json: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "command_result");
        assert_eq!(json["id"], 7);
        assert_eq!(json["status"], "success");
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["stdout"], "hi");
        assert_eq!(json["command"], "echo hi");
    }

    #[test]
    fn test_error_serialization() {
        let msg = ServerMessage::session_error("abc", "Session not found or expired: abc", ErrorCode::SessionNotFound);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"session_not_found\""));
        assert!(json.contains("\"session_id\":\"abc\""));

        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_health_serialization() {
        let msg = ServerMessage::Health {
            status: "healthy".to_string(),
            server_version: "0.1.0".to_string(),
            shell_alive: true,
            security_enabled: false,
            active_sessions: 2,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "health");
        assert_eq!(json["shell_alive"], true);
        assert_eq!(json["active_sessions"], 2);
    }

    // -------------------------------------------------------------------------
    // Envelope Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_client_envelope_serialization() {
        let envelope = ClientEnvelope::new(ClientMessage::ping(1)).with_id(9);
        let json = envelope.to_json().unwrap();
        assert!(json.contains(&format!("\"version\":{}", PROTOCOL_VERSION)));
        assert!(json.contains("\"type\":\"ping\""));

        let parsed = ClientEnvelope::from_json(&json).unwrap();
        assert_eq!(parsed.version, PROTOCOL_VERSION);
        assert_eq!(parsed.id, Some(9));
    }

    #[test]
    fn test_server_envelope_without_id() {
        let envelope = ServerEnvelope::new(ServerMessage::pong(1));
        let json = envelope.to_json().unwrap();
        assert!(!json.contains("\"id\""));

        let parsed = ServerEnvelope::from_json(&json).unwrap();
        assert_eq!(parsed.message, ServerMessage::pong(1));
    }

    #[test]
    fn test_envelope_version_validation() {
        let json = r#"{"version": 0, "type": "ping", "seq": 1}"#;
        let result = ClientEnvelope::from_json(json);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not supported"));
    }

    // -------------------------------------------------------------------------
    // Validation Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_multiline_command_rejected() {
        let result = ClientMessage::execute("echo a\necho b").validate();
        assert!(result.unwrap_err().to_string().contains("single line"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let result = ClientMessage::execute("   ").validate();
        assert!(result.unwrap_err().to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let msg = ClientMessage::ExecuteCommand {
            session_id: None,
            command: "ls".to_string(),
            timeout: Some(0),
        };
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_command_max_length() {
        assert_eq!(MAX_COMMAND_LENGTH, 4095);
        let longest = format!("echo {}", "x".repeat(MAX_COMMAND_LENGTH - 5));
        assert!(ClientMessage::execute(longest).validate().is_ok());

        let large = format!("echo {}", "x".repeat(5000));
        let result = ClientMessage::execute(large).validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("exceeds maximum length"));
    }

    #[test]
    fn test_empty_session_id_rejected() {
        let result = ClientMessage::execute_in("", "ls").validate();
        assert!(result.is_err());
        let msg = ClientMessage::DeleteSession {
            session_id: String::new(),
        };
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_empty_path_rejected() {
        let msg = ClientMessage::DownloadFile {
            session_id: None,
            path: String::new(),
            encoding: ContentEncoding::Utf8,
        };
        assert!(msg.validate().unwrap_err().to_string().contains("path"));
    }

    #[test]
    fn test_valid_messages_pass_validation() {
        assert!(ClientMessage::ping(1).validate().is_ok());
        assert!(ClientMessage::execute("ls -la").validate().is_ok());
        assert!(ClientMessage::execute_in("abc", "pwd").validate().is_ok());
        assert!(ClientMessage::CreateSession.validate().is_ok());
        assert!(ClientMessage::Health.validate().is_ok());
    }

    // -------------------------------------------------------------------------
    // Error Conversion Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_protocol_error_to_server_message() {
        let err = ProtocolError::ValidationError("test error".to_string());
        let msg: ServerMessage = err.into();

        match msg {
            ServerMessage::Error { message, code, .. } => {
                assert!(message.contains("test error"));
                assert_eq!(code, Some(ErrorCode::InvalidMessage));
            }
            _ => panic!("Expected Error message"),
        }
    }
}
