//! Tool call handler
//!
//! Routes validated client messages to the session manager, the security
//! gate and the file transfer helpers, and turns every outcome into a
//! server message. Nothing here fails: errors become `error` responses.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::config::Config;
use crate::files::{self, ContentEncoding, TransferError};
use crate::security::SecurityValidator;
use crate::session::{
    CommandResult, ManagerError, RegistryError, SecurityInfo, SessionError, SessionManager,
    ShellSession,
};

/// Per-call resource limits
#[derive(Debug, Clone)]
pub struct ToolLimits {
    /// Upper bound and default for command timeouts
    pub max_execution_time: Duration,
    /// Largest file accepted or returned by a transfer
    pub max_file_size: u64,
}

impl ToolLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_execution_time: config.max_execution_time(),
            max_file_size: config.security.max_file_size,
        }
    }

    /// Requested timeout in seconds, defaulted and capped by the limit
    pub fn clamp_timeout(&self, requested: Option<u64>) -> Duration {
        match requested {
            Some(secs) => Duration::from_secs(secs).min(self.max_execution_time),
            None => self.max_execution_time,
        }
    }
}

/// Dispatches tool calls for every connection
#[derive(Debug)]
pub struct ToolHandler {
    manager: Arc<SessionManager>,
    validator: SecurityValidator,
    limits: ToolLimits,
    token: Option<String>,
}

impl ToolHandler {
    pub fn new(
        manager: Arc<SessionManager>,
        validator: SecurityValidator,
        limits: ToolLimits,
    ) -> Self {
        Self {
            manager,
            validator,
            limits,
            token: None,
        }
    }

    /// Build the handler and its session manager from configuration
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let manager = Arc::new(SessionManager::from_config(config)?);
        let validator = SecurityValidator::new(&config.security)?;
        Ok(Self::new(manager, validator, ToolLimits::from_config(config))
            .with_token(config.server.token.clone()))
    }

    /// Require this token before any tool call
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn auth_required(&self) -> bool {
        self.token.is_some()
    }

    /// Whether `token` matches the configured one
    pub fn check_token(&self, token: &str) -> bool {
        match &self.token {
            Some(expected) => expected.as_bytes().ct_eq(token.as_bytes()).into(),
            None => true,
        }
    }

    /// Handle one tool call
    pub async fn handle(&self, message: ClientMessage) -> ServerMessage {
        match message {
            ClientMessage::Ping { seq } => ServerMessage::pong(seq),

            ClientMessage::Authenticate { token } => {
                if self.check_token(&token) {
                    ServerMessage::Authenticated
                } else {
                    warn!("Authentication failed: invalid token");
                    ServerMessage::error_with_code("Invalid token", ErrorCode::AuthFailed)
                }
            }

            ClientMessage::CreateSession => match self.manager.create_session().await {
                Ok(session_id) => ServerMessage::SessionCreated { session_id },
                Err(e) => manager_error(None, e),
            },

            ClientMessage::DeleteSession { session_id } => {
                let deleted = self.manager.delete_session(&session_id).await;
                ServerMessage::SessionDeleted {
                    session_id,
                    deleted,
                }
            }

            ClientMessage::ListSessions => ServerMessage::SessionList {
                session_ids: self.manager.list_sessions().await,
            },

            ClientMessage::ExecuteCommand {
                session_id,
                command,
                timeout,
            } => {
                self.execute_command(session_id.as_deref(), &command, timeout)
                    .await
            }

            ClientMessage::GetWorkingDirectory { session_id } => {
                match self.manager.resolve(session_id.as_deref()).await {
                    Ok(session) => ServerMessage::WorkingDirectory {
                        cwd: session.get_cwd().await,
                    },
                    Err(e) => manager_error(session_id.as_deref(), e),
                }
            }

            ClientMessage::ResetSession { session_id } => {
                self.reset_session(session_id.as_deref()).await
            }

            ClientMessage::UploadFile {
                session_id,
                path,
                content,
                encoding,
            } => {
                self.upload_file(session_id.as_deref(), &path, &content, encoding)
                    .await
            }

            ClientMessage::DownloadFile {
                session_id,
                path,
                encoding,
            } => {
                self.download_file(session_id.as_deref(), &path, encoding)
                    .await
            }

            ClientMessage::Health => self.health().await,
        }
    }

    /// Validate and run a command
    ///
    /// Rejections, timeouts and failed commands all come back as a
    /// `command_result`; only an unusable session is an `error`.
    pub async fn execute_command(
        &self,
        session_id: Option<&str>,
        command: &str,
        timeout: Option<u64>,
    ) -> ServerMessage {
        if let Err(e) = self.validator.validate(command) {
            debug!(command, reason = %e, "Command rejected");
            return ServerMessage::CommandResult(CommandResult::rejected(command, e.to_string()));
        }

        let session = match self.manager.resolve(session_id).await {
            Ok(session) => session,
            Err(e) => return manager_error(session_id, e),
        };

        let timeout = self.limits.clamp_timeout(timeout);
        match session.execute(command, timeout).await {
            Ok(result) if self.validator.is_enabled() => {
                ServerMessage::CommandResult(result.with_security_info(SecurityInfo::passed()))
            }
            Ok(result) => ServerMessage::CommandResult(result),
            Err(e) => manager_error(Some(session.id()), e.into()),
        }
    }

    async fn reset_session(&self, session_id: Option<&str>) -> ServerMessage {
        let session = match self.manager.resolve(session_id).await {
            Ok(session) => session,
            Err(e) => return manager_error(session_id, e),
        };

        match session.reset().await {
            Ok(()) => ServerMessage::SessionReset {
                status: "reset".to_string(),
                message: "Shell session has been reset".to_string(),
            },
            Err(e) => manager_error(Some(session.id()), e.into()),
        }
    }

    async fn upload_file(
        &self,
        session_id: Option<&str>,
        path: &str,
        content: &str,
        encoding: ContentEncoding,
    ) -> ServerMessage {
        let session = match self.manager.resolve(session_id).await {
            Ok(session) => session,
            Err(e) => return manager_error(session_id, e),
        };

        let cwd = session.get_cwd().await;
        match files::upload(Path::new(&cwd), path, content, encoding, self.limits.max_file_size)
            .await
        {
            Ok(uploaded) => {
                info!(session_id = %session.id(), path = %uploaded.path.display(), size = uploaded.size, "File uploaded");
                ServerMessage::FileUploaded {
                    status: "uploaded".to_string(),
                    path: uploaded.path.display().to_string(),
                    size: uploaded.size,
                }
            }
            Err(e) => transfer_error(&session, e),
        }
    }

    async fn download_file(
        &self,
        session_id: Option<&str>,
        path: &str,
        encoding: ContentEncoding,
    ) -> ServerMessage {
        let session = match self.manager.resolve(session_id).await {
            Ok(session) => session,
            Err(e) => return manager_error(session_id, e),
        };

        let cwd = session.get_cwd().await;
        match files::download(Path::new(&cwd), path, encoding, self.limits.max_file_size).await {
            Ok(downloaded) => ServerMessage::FileDownloaded {
                content: downloaded.content,
                size: downloaded.size,
                encoding: downloaded.encoding,
            },
            Err(e) => transfer_error(&session, e),
        }
    }

    /// Liveness report; never spawns a shell
    pub async fn health(&self) -> ServerMessage {
        ServerMessage::Health {
            status: "healthy".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            shell_alive: self.manager.default_alive().await,
            security_enabled: self.validator.is_enabled(),
            active_sessions: self.manager.session_count().await,
        }
    }

    /// Stop the sweep and terminate every session
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

fn manager_error(session_id: Option<&str>, err: ManagerError) -> ServerMessage {
    let code = match &err {
        ManagerError::NotFound(_) => ErrorCode::SessionNotFound,
        ManagerError::Registry(RegistryError::CapacityExceeded { .. }) => {
            ErrorCode::CapacityExceeded
        }
        ManagerError::Registry(RegistryError::DuplicateId(_)) => ErrorCode::InternalError,
        ManagerError::Session(SessionError::SpawnFailed(_) | SessionError::InvalidPath(_)) => {
            ErrorCode::SpawnFailed
        }
        // Deleted or evicted between lookup and use
        ManagerError::Session(SessionError::NotStarted | SessionError::NotRunning) => {
            ErrorCode::SessionNotFound
        }
        ManagerError::Session(SessionError::AlreadyRunning | SessionError::Pool(_)) => {
            ErrorCode::InternalError
        }
    };

    match session_id {
        Some(id) => ServerMessage::session_error(id, err.to_string(), code),
        None => ServerMessage::error_with_code(err.to_string(), code),
    }
}

fn transfer_error(session: &ShellSession, err: TransferError) -> ServerMessage {
    let code = match &err {
        TransferError::NotFound(_) => ErrorCode::FileNotFound,
        TransferError::InvalidEncoding { .. } => ErrorCode::InvalidEncoding,
        TransferError::TooLarge { .. } => ErrorCode::FileTooLarge,
        TransferError::Io { .. } => ErrorCode::IoError,
    };
    debug!(session_id = %session.id(), error = %err, "File transfer failed");
    ServerMessage::session_error(session.id(), err.to_string(), code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecuritySettings;
    use crate::pty::PromptMarker;
    use crate::session::{CommandStatus, ManagerSettings, ShellSpec};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use tempfile::TempDir;

    fn limits() -> ToolLimits {
        ToolLimits {
            max_execution_time: Duration::from_secs(10),
            max_file_size: 1024,
        }
    }

    fn handler(dir: &TempDir, validator: SecurityValidator) -> ToolHandler {
        let spec = ShellSpec::new("/bin/sh", dir.path(), PromptMarker::new("__TEST__>").unwrap())
            .with_terminate_timeout(Duration::from_secs(2));
        let settings = ManagerSettings {
            idle_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
            max_sessions: 2,
            worker_threads: 3,
        };
        let manager = Arc::new(SessionManager::new(spec, settings));
        ToolHandler::new(manager, validator, limits())
    }

    fn gate(allowed: &[&str]) -> SecurityValidator {
        SecurityValidator::new(&SecuritySettings {
            enabled: true,
            allowed_executables: allowed.iter().map(|s| s.to_string()).collect(),
            ..SecuritySettings::default()
        })
        .unwrap()
    }

    fn expect_result(msg: ServerMessage) -> CommandResult {
        match msg {
            ServerMessage::CommandResult(result) => result,
            other => panic!("Expected CommandResult, got {:?}", other),
        }
    }

    fn expect_error_code(msg: ServerMessage) -> ErrorCode {
        match msg {
            ServerMessage::Error {
                code: Some(code), ..
            } => code,
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_clamp_timeout() {
        let limits = limits();
        assert_eq!(limits.clamp_timeout(None), Duration::from_secs(10));
        assert_eq!(limits.clamp_timeout(Some(3)), Duration::from_secs(3));
        assert_eq!(limits.clamp_timeout(Some(600)), Duration::from_secs(10));
    }

    #[test]
    fn test_token_check() {
        let dir = tempfile::tempdir().unwrap();
        let open = handler(&dir, SecurityValidator::disabled());
        assert!(!open.auth_required());
        assert!(open.check_token("anything"));

        let locked = handler(&dir, SecurityValidator::disabled()).with_token(Some("s3cret".into()));
        assert!(locked.auth_required());
        assert!(locked.check_token("s3cret"));
        assert!(!locked.check_token("s3cre"));
        assert!(!locked.check_token("wrong!"));
        assert!(!locked.check_token("s3cret-and-more"));
        assert!(!locked.check_token(""));

        let empty = handler(&dir, SecurityValidator::disabled()).with_token(Some(String::new()));
        assert!(!empty.auth_required());
    }

    #[tokio::test]
    async fn test_execute_in_default_session() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(&dir, SecurityValidator::disabled());

        let result = expect_result(handler.handle(ClientMessage::execute("echo hello")).await);
        assert_eq!(result.status, CommandStatus::Success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello");
        assert!(result.security_info.is_none());

        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_command_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(&dir, gate(&["echo"]));

        let result = expect_result(handler.handle(ClientMessage::execute("touch marker")).await);
        assert_eq!(result.status, CommandStatus::Error);
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.starts_with("Security validation failed:"));
        let info = result.security_info.unwrap();
        assert!(!info.validated);
        assert!(!dir.path().join("marker").exists());
        // Rejection does not spawn the default shell
        assert!(!handler.manager().default_alive().await);

        let result = expect_result(handler.handle(ClientMessage::execute("echo ok")).await);
        assert_eq!(result.stdout, "ok");
        assert!(result.security_info.unwrap().validated);

        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(&dir, SecurityValidator::disabled());

        let msg = handler.handle(ClientMessage::execute_in("missing", "ls")).await;
        match msg {
            ServerMessage::Error {
                code, session_id, ..
            } => {
                assert_eq!(code, Some(ErrorCode::SessionNotFound));
                assert_eq!(session_id.as_deref(), Some("missing"));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle_calls() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(&dir, SecurityValidator::disabled());

        let id = match handler.handle(ClientMessage::CreateSession).await {
            ServerMessage::SessionCreated { session_id } => session_id,
            other => panic!("Expected SessionCreated, got {:?}", other),
        };
        handler.handle(ClientMessage::CreateSession).await;
        let code = expect_error_code(handler.handle(ClientMessage::CreateSession).await);
        assert_eq!(code, ErrorCode::CapacityExceeded);

        match handler.handle(ClientMessage::ListSessions).await {
            ServerMessage::SessionList { session_ids } => {
                assert_eq!(session_ids.len(), 2);
                assert!(session_ids.contains(&id));
            }
            other => panic!("Expected SessionList, got {:?}", other),
        }

        let result = expect_result(handler.handle(ClientMessage::execute_in(id.clone(), "echo named")).await);
        assert_eq!(result.stdout, "named");

        let msg = handler
            .handle(ClientMessage::DeleteSession {
                session_id: id.clone(),
            })
            .await;
        assert_eq!(
            msg,
            ServerMessage::SessionDeleted {
                session_id: id.clone(),
                deleted: true
            }
        );
        let msg = handler
            .handle(ClientMessage::DeleteSession {
                session_id: id.clone(),
            })
            .await;
        assert_eq!(
            msg,
            ServerMessage::SessionDeleted {
                session_id: id,
                deleted: false
            }
        );

        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_cwd_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let handler = handler(&dir, SecurityValidator::disabled());

        handler.handle(ClientMessage::execute("cd sub")).await;
        let msg = handler
            .handle(ClientMessage::GetWorkingDirectory { session_id: None })
            .await;
        match msg {
            ServerMessage::WorkingDirectory { cwd } => {
                assert_eq!(
                    std::fs::canonicalize(cwd).unwrap(),
                    std::fs::canonicalize(&sub).unwrap()
                );
            }
            other => panic!("Expected WorkingDirectory, got {:?}", other),
        }

        let msg = handler
            .handle(ClientMessage::ResetSession { session_id: None })
            .await;
        assert!(matches!(msg, ServerMessage::SessionReset { ref status, .. } if status == "reset"));

        let result = expect_result(handler.handle(ClientMessage::execute("pwd")).await);
        assert_eq!(
            std::fs::canonicalize(result.stdout).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );

        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_file_transfer_follows_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let handler = handler(&dir, SecurityValidator::disabled());
        handler.handle(ClientMessage::execute("cd sub")).await;

        let msg = handler
            .handle(ClientMessage::UploadFile {
                session_id: None,
                path: "notes.txt".to_string(),
                content: STANDARD.encode("remember"),
                encoding: ContentEncoding::Base64,
            })
            .await;
        assert!(matches!(msg, ServerMessage::FileUploaded { size: 8, .. }));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("sub/notes.txt")).unwrap(),
            "remember"
        );

        let msg = handler
            .handle(ClientMessage::DownloadFile {
                session_id: None,
                path: "notes.txt".to_string(),
                encoding: ContentEncoding::Utf8,
            })
            .await;
        assert_eq!(
            msg,
            ServerMessage::FileDownloaded {
                content: "remember".to_string(),
                size: 8,
                encoding: ContentEncoding::Utf8,
            }
        );

        let code = expect_error_code(
            handler
                .handle(ClientMessage::DownloadFile {
                    session_id: None,
                    path: "absent.txt".to_string(),
                    encoding: ContentEncoding::Base64,
                })
                .await,
        );
        assert_eq!(code, ErrorCode::FileNotFound);

        let code = expect_error_code(
            handler
                .handle(ClientMessage::UploadFile {
                    session_id: None,
                    path: "big.txt".to_string(),
                    content: "x".repeat(2048),
                    encoding: ContentEncoding::Utf8,
                })
                .await,
        );
        assert_eq!(code, ErrorCode::FileTooLarge);

        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_does_not_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(&dir, gate(&[]));

        match handler.handle(ClientMessage::Health).await {
            ServerMessage::Health {
                status,
                shell_alive,
                security_enabled,
                active_sessions,
                ..
            } => {
                assert_eq!(status, "healthy");
                assert!(!shell_alive);
                assert!(security_enabled);
                assert_eq!(active_sessions, 0);
            }
            other => panic!("Expected Health, got {:?}", other),
        }

        handler.handle(ClientMessage::execute("true")).await;
        match handler.health().await {
            ServerMessage::Health { shell_alive, .. } => assert!(shell_alive),
            other => panic!("Expected Health, got {:?}", other),
        }

        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_authenticate_message() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(&dir, SecurityValidator::disabled()).with_token(Some("tok".into()));

        let msg = handler
            .handle(ClientMessage::Authenticate {
                token: "tok".to_string(),
            })
            .await;
        assert_eq!(msg, ServerMessage::Authenticated);

        let code = expect_error_code(
            handler
                .handle(ClientMessage::Authenticate {
                    token: "nope".to_string(),
                })
                .await,
        );
        assert_eq!(code, ErrorCode::AuthFailed);
    }
}
