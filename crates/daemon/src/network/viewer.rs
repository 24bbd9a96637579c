//! WebSocket viewer surface.
//!
//! Every WebSocket connection is one viewer. The request path picks the
//! session: `/` or `/sessions/new` spawns a fresh shell, `/sessions/<id>`
//! joins a running one. Shell output goes out as binary frames in the
//! order it was read; inbound frames are decoded once into a
//! [`ViewerMessage`] and dispatched.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::control::{session_ended_notice, CLEAR_AND_HOME};
use protocol::ViewerMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::{render, CommandOutcome, CommandRunner};
use crate::config::Config;
use crate::session::{ManagedSession, Session, SessionId, SessionManager, SessionRequest};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// How long to wait for the shell's exit status once its output ends.
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(1);

/// Viewer surface settings.
#[derive(Debug, Clone)]
pub struct ViewerServerConfig {
    /// Terminate a session when its last viewer leaves.
    pub close_when_unattached: bool,
    /// Time limit for one-shot commands.
    pub command_timeout: Duration,
}

impl Default for ViewerServerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ViewerServerConfig {
    fn from(config: &Config) -> Self {
        Self {
            close_when_unattached: config.session.close_when_unattached,
            command_timeout: config.command.timeout(),
        }
    }
}

/// Where a connection's request path leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Spawn a new session.
    NewSession,
    /// Join an existing session.
    Attach(SessionId),
}

impl Route {
    /// Parses a request path. Returns `None` for paths that lead nowhere.
    pub fn parse(path: &str) -> Option<Self> {
        let trimmed = path.trim_end_matches('/');
        match trimmed {
            "" | "/sessions/new" => Some(Route::NewSession),
            _ => {
                let id = trimmed.strip_prefix("/sessions/")?;
                if id.is_empty() || id.contains('/') {
                    None
                } else {
                    Some(Route::Attach(id.to_string()))
                }
            }
        }
    }
}

/// Why a viewer's relay loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViewerEnd {
    /// The session's output ended.
    SessionEnded,
    /// The viewer closed the connection.
    Disconnected,
    /// The viewer stopped draining output and was dropped from the session.
    Lagged,
    /// The daemon is stopping.
    Shutdown,
}

impl ViewerEnd {
    fn left_session_running(self) -> bool {
        matches!(self, ViewerEnd::Disconnected | ViewerEnd::Lagged)
    }
}

/// WebSocket server for viewers.
pub struct ViewerServer {
    listener: TcpListener,
    manager: Arc<SessionManager>,
    config: Arc<ViewerServerConfig>,
}

impl ViewerServer {
    /// Binds the server.
    pub async fn bind(
        addr: SocketAddr,
        manager: Arc<SessionManager>,
        config: ViewerServerConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Viewer server listening");
        Ok(Self {
            listener,
            manager,
            config: Arc::new(config),
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts viewers until `shutdown` fires.
    ///
    /// Open connections are told to close when `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&self.manager),
                            Arc::clone(&self.config),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept viewer connection");
                    }
                },
            }
        }
        tracing::debug!("Viewer server stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<SessionManager>,
    config: Arc<ViewerServerConfig>,
    shutdown: CancellationToken,
) {
    let mut path = String::from("/");
    let record_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, record_path).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut sink, stream) = ws.split();

    let viewer_id = Uuid::new_v4().to_string();
    let opened = match Route::parse(&path) {
        Some(Route::NewSession) => {
            manager
                .create_attached(SessionRequest::default(), viewer_id.clone())
                .await
        }
        Some(Route::Attach(session_id)) => manager.attach(&session_id, viewer_id.clone()).await,
        None => {
            reject(&mut sink, format!("error: no such endpoint: {}", path)).await;
            return;
        }
    };

    let (managed, mut output) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            tracing::info!(peer = %peer, path = %path, error = %e, "Viewer rejected");
            reject(&mut sink, format!("error: {}", e)).await;
            return;
        }
    };
    let session_id = managed.session().id().clone();

    tracing::info!(
        peer = %peer,
        session_id = %session_id,
        viewer_id = %viewer_id,
        "Viewer connected"
    );

    let runner = Arc::new(Mutex::new(CommandRunner::new(
        managed.session().cwd(),
        config.command_timeout,
    )));
    let (reply_tx, mut reply_rx) = mpsc::channel::<WsMessage>(8);

    // Input is applied on its own task: a write that waits on a full
    // terminal must not hold up delivery of the shell's output.
    let mut inbound = tokio::spawn(relay_input(
        stream,
        Arc::clone(&managed),
        runner,
        reply_tx,
        viewer_id.clone(),
    ));

    let end = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break ViewerEnd::Shutdown,
            chunk = output.recv() => match chunk {
                Some(chunk) => {
                    if sink.send(WsMessage::Binary(chunk.to_vec())).await.is_err() {
                        break ViewerEnd::Disconnected;
                    }
                }
                // The broadcaster also drops viewers that fall behind.
                None if managed.broadcaster().is_closed() => break ViewerEnd::SessionEnded,
                None => break ViewerEnd::Lagged,
            },
            Some(reply) = reply_rx.recv() => {
                if sink.send(reply).await.is_err() {
                    break ViewerEnd::Disconnected;
                }
            }
            _ = &mut inbound => break ViewerEnd::Disconnected,
        }
    };
    inbound.abort();

    match end {
        ViewerEnd::SessionEnded => {
            let exit_code = final_exit_code(managed.session()).await;
            let _ = sink.send(WsMessage::Text(session_ended_notice(exit_code))).await;
            let _ = sink.send(WsMessage::Close(None)).await;
        }
        ViewerEnd::Lagged => {
            let frame = CloseFrame {
                code: CloseCode::Again,
                reason: "viewer fell behind the session output".into(),
            };
            let _ = sink.send(WsMessage::Close(Some(frame))).await;
        }
        ViewerEnd::Shutdown => {
            let frame = CloseFrame {
                code: CloseCode::Away,
                reason: "daemon shutting down".into(),
            };
            let _ = sink.send(WsMessage::Close(Some(frame))).await;
        }
        ViewerEnd::Disconnected => {}
    }

    let remaining = manager.detach(&session_id, &viewer_id).await.unwrap_or(0);
    tracing::info!(
        session_id = %session_id,
        viewer_id = %viewer_id,
        reason = ?end,
        remaining,
        "Viewer disconnected"
    );

    if end.left_session_running() && remaining == 0 && config.close_when_unattached {
        if let Ok(status) = manager.kill(&session_id).await {
            tracing::info!(session_id = %session_id, status = ?status, "Closed unattached session");
        }
    }
}

/// Reads the viewer's frames and applies them until the connection ends.
async fn relay_input(
    mut stream: WsStream,
    managed: Arc<ManagedSession>,
    runner: Arc<Mutex<CommandRunner>>,
    replies: mpsc::Sender<WsMessage>,
    viewer_id: String,
) {
    while let Some(incoming) = stream.next().await {
        let message = match incoming {
            Ok(WsMessage::Text(text)) => ViewerMessage::decode_text(&text),
            Ok(WsMessage::Binary(bytes)) => ViewerMessage::decode_binary(&bytes),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(viewer_id = %viewer_id, error = %e, "Viewer connection error");
                break;
            }
        };
        dispatch(message, &managed, &runner, &replies).await;
    }
}

/// Applies one inbound viewer message to the session.
async fn dispatch(
    message: ViewerMessage,
    managed: &ManagedSession,
    runner: &Arc<Mutex<CommandRunner>>,
    replies: &mpsc::Sender<WsMessage>,
) {
    let session = managed.session();
    match message {
        ViewerMessage::Resize(size) => {
            if let Err(e) = session.resize(size).await {
                tracing::warn!(session_id = %session.id(), size = %size, error = %e, "Resize failed");
            }
        }
        ViewerMessage::RawInput(bytes) => {
            // Input racing a dying shell is dropped.
            if let Err(e) = session.write(&bytes).await {
                tracing::debug!(session_id = %session.id(), error = %e, "Dropped viewer input");
            }
        }
        ViewerMessage::Command(line) => {
            let runner = Arc::clone(runner);
            let replies = replies.clone();
            tokio::spawn(async move {
                let result = runner.lock().await.run(&line).await;
                let reply = match &result {
                    Ok(CommandOutcome::ClearScreen) => WsMessage::Binary(CLEAR_AND_HOME.to_vec()),
                    _ => WsMessage::Text(render(&result)),
                };
                let _ = replies.send(reply).await;
            });
        }
    }
}

/// Waits briefly for the shell to be reaped once its output has ended.
async fn final_exit_code(session: &Session) -> Option<i32> {
    let deadline = tokio::time::Instant::now() + EXIT_STATUS_WAIT;
    loop {
        match session.try_wait().await {
            Ok(Some(status)) => return status.exit_code(),
            Ok(None) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            _ => return None,
        }
    }
}

async fn reject(sink: &mut WsSink, message: String) {
    let _ = sink.send(WsMessage::Text(message)).await;
    let _ = sink.send(WsMessage::Close(None)).await;
}
