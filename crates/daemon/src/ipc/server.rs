//! IPC server for handling CLI connections via Unix Domain Sockets.
//!
//! The server listens on a Unix socket, reads newline-delimited JSON
//! requests and answers each with exactly one response produced by an
//! [`IpcHandler`].

use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::messages::{IpcRequest, IpcResponse};

/// Answers IPC requests.
pub trait IpcHandler: Send + Sync + 'static {
    /// Produces the response to one request.
    fn handle(&self, request: IpcRequest) -> impl Future<Output = IpcResponse> + Send;
}

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Parent directories are created with mode 0700. A leftover socket
    /// file from a dead daemon is replaced; a socket that still accepts
    /// connections belongs to a live daemon and binding fails with
    /// [`io::ErrorKind::AddrInUse`].
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("another daemon is listening on {}", path.display()),
                ));
            }
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        tracing::debug!(path = %path.display(), "IPC socket bound");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Returns the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Accepts connections until `shutdown` fires, serving each on its own
    /// task. The socket file is removed on return.
    pub async fn serve<H: IpcHandler>(self, handler: Arc<H>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(conn) => {
                        let handler = Arc::clone(&handler);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                _ = conn.serve(handler.as_ref()) => {}
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept IPC connection");
                    }
                },
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove IPC socket");
            }
        }
        tracing::debug!("IPC server stopped");
    }
}

/// A connection to an IPC client.
///
/// This struct wraps a Unix stream and provides methods for reading
/// requests and sending responses using JSON newline-delimited protocol.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }

    /// Answers requests until the client disconnects.
    ///
    /// A malformed request gets an `Error` response and the connection
    /// stays open.
    pub async fn serve<H: IpcHandler>(mut self, handler: &H) {
        loop {
            let response = match self.read_request().await {
                Ok(Some(request)) => {
                    tracing::debug!(request = ?request, "IPC request");
                    handler.handle(request).await
                }
                Ok(None) => break,
                Err(IpcError::Json(e)) => IpcResponse::Error {
                    message: format!("invalid request: {}", e),
                },
                Err(e) => {
                    tracing::debug!(error = %e, "IPC connection failed");
                    break;
                }
            };

            if let Err(e) = self.send_response(&response).await {
                tracing::debug!(error = %e, "Failed to send IPC response");
                break;
            }
        }
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The daemon answered with an error response.
    #[error("{0}")]
    Daemon(String),

    /// The daemon answered with a response that does not fit the request.
    #[error("unexpected response from daemon: {0}")]
    UnexpectedResponse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct EchoHandler;

    impl IpcHandler for EchoHandler {
        async fn handle(&self, request: IpcRequest) -> IpcResponse {
            match request {
                IpcRequest::Ping => IpcResponse::Pong,
                other => IpcResponse::Error {
                    message: format!("unsupported: {:?}", other),
                },
            }
        }
    }

    async fn roundtrip(stream: &mut UnixStream, line: &str) -> String {
        let (read_half, mut write_half) = stream.split();
        write_half.write_all(line.as_bytes()).await.unwrap();
        write_half.flush().await.unwrap();

        let mut reader = BufReader::new(read_half);
        let mut response = String::new();
        reader.read_line(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_server_bind_creates_private_parent_dirs() {
        let temp_dir = tempdir().unwrap();
        let parent = temp_dir.path().join("nested").join("dir");
        let socket_path = parent.join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
        assert_eq!(server.path(), socket_path.as_path());

        let mode = std::fs::metadata(&parent).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_server_bind_replaces_stale_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let first = IpcServer::bind(&socket_path).await.unwrap();
        drop(first);

        // The file is still there but nobody is listening.
        assert!(socket_path.exists());
        let _second = IpcServer::bind(&socket_path).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_bind_refuses_live_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let _live = IpcServer::bind(&socket_path).await.unwrap();
        let result = IpcServer::bind(&socket_path).await;
        assert_eq!(result.err().map(|e| e.kind()), Some(io::ErrorKind::AddrInUse));
    }

    #[tokio::test]
    async fn test_connection_read_returns_none_on_disconnect() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let socket_path_clone = socket_path.clone();
        tokio::spawn(async move {
            let _stream = UnixStream::connect(&socket_path_clone).await.unwrap();
        });

        let mut conn = server.accept().await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        assert!(conn.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_serve_answers_and_survives_bad_request() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(Arc::new(EchoHandler), shutdown.clone()));

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();

        let bad = roundtrip(&mut stream, "not json\n").await;
        let bad: IpcResponse = serde_json::from_str(bad.trim()).unwrap();
        assert!(matches!(bad, IpcResponse::Error { .. }));

        let ok = roundtrip(&mut stream, "\"Ping\"\n").await;
        let ok: IpcResponse = serde_json::from_str(ok.trim()).unwrap();
        assert_eq!(ok, IpcResponse::Pong);

        shutdown.cancel();
        task.await.unwrap();
        assert!(!socket_path.exists());
    }
}
