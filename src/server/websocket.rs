//! WebSocket server implementation
//!
//! Listens for tool clients, tracks per-connection authentication and hands
//! every call to the shared [`ToolHandler`]. On shutdown the accept loop
//! stops, open connections are closed and every shell is terminated.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::handler::ToolHandler;
use super::protocol::{ClientEnvelope, ClientMessage, ErrorCode, ServerEnvelope, ServerMessage};
use crate::config::Config;

/// Listener address for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.server.bind.clone(), config.server.port)
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server for shell tool clients
pub struct WebSocketServer {
    config: ServerConfig,
    handler: Arc<ToolHandler>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, handler: ToolHandler) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler: Arc::new(handler),
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// Starts the idle sweep and warms up the default session first. When a
    /// shutdown signal arrives, connections are closed and all sessions are
    /// terminated before this returns.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!("WebSocket server listening on ws://{}", listener.local_addr()?);

        let manager = self.handler.manager();
        manager.start().await;
        if let Err(e) = manager.default_session().await {
            warn!(error = %e, "Failed to start default session; it will be retried on first use");
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, handler, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let active = manager.session_count().await;
        if active > 0 {
            info!("Terminating {} active sessions...", active);
        }
        self.handler.shutdown().await;

        Ok(())
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<ToolHandler>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let welcome = ServerEnvelope::new(ServerMessage::welcome(handler.auth_required()));
    ws_sender.send(Message::Text(welcome.to_json()?)).await?;
    debug!("Sent welcome message to {}", peer_addr);

    let mut authenticated = !handler.auth_required();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received message from {} ({} bytes)", peer_addr, text.len());

                        let response = handle_text(&text, &handler, &mut authenticated).await;
                        ws_sender.send(Message::Text(response.to_json()?)).await?;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    info!("Connection from {} closed", peer_addr);
    Ok(())
}

/// Parse, authorize and dispatch one text frame
async fn handle_text(text: &str, handler: &ToolHandler, authenticated: &mut bool) -> ServerEnvelope {
    let envelope = match ClientEnvelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Rejected message: {}", e);
            return ServerEnvelope::reply(request_id(text), e.into());
        }
    };

    let id = envelope.id;
    let message = envelope.message;

    let exempt = matches!(
        message,
        ClientMessage::Ping { .. } | ClientMessage::Authenticate { .. }
    );
    if !*authenticated && !exempt {
        return ServerEnvelope::reply(
            id,
            ServerMessage::error_with_code("Authentication required", ErrorCode::AuthRequired),
        );
    }

    let response = handler.handle(message).await;
    if response == ServerMessage::Authenticated {
        *authenticated = true;
    }
    ServerEnvelope::reply(id, response)
}

/// Best-effort request id from a message that failed to parse
fn request_id(text: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("id")?
        .as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PromptMarker;
    use crate::security::SecurityValidator;
    use crate::server::handler::ToolLimits;
    use crate::session::{ManagerSettings, SessionManager, ShellSpec};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_tungstenite::connect_async;

    fn tool_handler(dir: &TempDir, token: Option<&str>) -> ToolHandler {
        let spec = ShellSpec::new("/bin/sh", dir.path(), PromptMarker::new("__TEST__>").unwrap())
            .with_terminate_timeout(Duration::from_secs(2));
        let settings = ManagerSettings {
            idle_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
            max_sessions: 2,
            worker_threads: 3,
        };
        let limits = ToolLimits {
            max_execution_time: Duration::from_secs(10),
            max_file_size: 1024,
        };
        ToolHandler::new(
            Arc::new(SessionManager::new(spec, settings)),
            SecurityValidator::disabled(),
            limits,
        )
        .with_token(token.map(str::to_string))
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1", 9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");

        let config = ServerConfig::from_config(&Config::default());
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_request_id_from_invalid_message() {
        assert_eq!(request_id(r#"{"id": 5, "type": "bogus"}"#), Some(5));
        assert_eq!(request_id("not json"), None);
    }

    #[tokio::test]
    async fn test_handle_ping_message() {
        let dir = tempfile::tempdir().unwrap();
        let handler = tool_handler(&dir, None);
        let mut authenticated = true;

        let response = handle_text(r#"{"id": 3, "type": "ping", "seq": 42}"#, &handler, &mut authenticated).await;
        assert_eq!(response.id, Some(3));
        assert_eq!(response.message, ServerMessage::pong(42));
    }

    #[tokio::test]
    async fn test_invalid_message_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let handler = tool_handler(&dir, None);
        let mut authenticated = true;

        let response = handle_text(
            r#"{"id": 4, "type": "execute_command", "command": "echo a\necho b"}"#,
            &handler,
            &mut authenticated,
        )
        .await;
        assert_eq!(response.id, Some(4));
        match response.message {
            ServerMessage::Error { code, .. } => assert_eq!(code, Some(ErrorCode::InvalidMessage)),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_gate() {
        let dir = tempfile::tempdir().unwrap();
        let handler = tool_handler(&dir, Some("tok"));
        let mut authenticated = !handler.auth_required();

        let response = handle_text(r#"{"type": "list_sessions"}"#, &handler, &mut authenticated).await;
        match response.message {
            ServerMessage::Error { code, .. } => assert_eq!(code, Some(ErrorCode::AuthRequired)),
            other => panic!("Expected Error, got {:?}", other),
        }

        let response = handle_text(r#"{"type": "ping", "seq": 1}"#, &handler, &mut authenticated).await;
        assert_eq!(response.message, ServerMessage::pong(1));

        let response = handle_text(r#"{"type": "authenticate", "token": "bad"}"#, &handler, &mut authenticated).await;
        assert!(!authenticated);
        match response.message {
            ServerMessage::Error { code, .. } => assert_eq!(code, Some(ErrorCode::AuthFailed)),
            other => panic!("Expected Error, got {:?}", other),
        }

        handle_text(r#"{"type": "authenticate", "token": "tok"}"#, &handler, &mut authenticated).await;
        assert!(authenticated);

        let response = handle_text(r#"{"type": "list_sessions"}"#, &handler, &mut authenticated).await;
        assert_eq!(
            response.message,
            ServerMessage::SessionList {
                session_ids: Vec::new()
            }
        );
    }

    #[tokio::test]
    async fn test_serve_round_trip_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(WebSocketServer::new(
            ServerConfig::new("127.0.0.1", 0),
            tool_handler(&dir, None),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        let welcome = match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => ServerEnvelope::from_json(&text).unwrap(),
            other => panic!("Expected text frame, got {:?}", other),
        };
        assert_eq!(welcome.message, ServerMessage::welcome(false));

        let request = ClientEnvelope::new(ClientMessage::execute("echo over-the-wire")).with_id(1);
        ws.send(Message::Text(request.to_json().unwrap())).await.unwrap();
        let reply = match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => ServerEnvelope::from_json(&text).unwrap(),
            other => panic!("Expected text frame, got {:?}", other),
        };
        assert_eq!(reply.id, Some(1));
        match reply.message {
            ServerMessage::CommandResult(result) => assert_eq!(result.stdout, "over-the-wire"),
            other => panic!("Expected CommandResult, got {:?}", other),
        }

        let default = server.handler.manager().default_session().await.unwrap();
        server.shutdown();
        serving.await.unwrap().unwrap();
        assert!(!default.is_alive());
        assert!(!server.handler.manager().is_sweeping().await);
    }
}
