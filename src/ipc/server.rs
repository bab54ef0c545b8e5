//! IPC Server
//!
//! Unix domain socket server for client-daemon communication.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::handler::RequestHandler;
use super::protocol::{
    decode_message, encode_message, ErrorCode, Request, Response, MAX_MESSAGE_SIZE,
};

/// `$XDG_RUNTIME_DIR/rekal/rekal.sock`, or `/tmp/rekal.sock` without a runtime dir
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("rekal").join("rekal.sock");
    }
    PathBuf::from("/tmp/rekal.sock")
}

/// IPC server listening on a Unix domain socket
pub struct IpcServer {
    socket_path: PathBuf,
    handler: Arc<RequestHandler>,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf, handler: Arc<RequestHandler>) -> Self {
        Self {
            socket_path,
            handler,
        }
    }

    /// Bind the socket. Binding failures are fatal for the daemon.
    pub fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory {}", parent.display())
            })?;
        }

        // A stale socket from a previous run blocks bind.
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).context("Failed to bind to Unix socket")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!("IPC server listening on: {}", self.socket_path.display());
        Ok(listener)
    }

    /// Serve connections until `cancel_token` fires, then remove the socket.
    pub async fn serve(&self, listener: UnixListener, cancel_token: CancellationToken) {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            debug!("New client connection");
                            let handler = self.handler.clone();
                            let token = cancel_token.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler, token).await {
                                    warn!("Connection error: {e:#}");
                                }
                            });
                        }
                        Err(e) => error!("Accept error: {e}"),
                    }
                }
                _ = cancel_token.cancelled() => {
                    info!("IPC server shutting down");
                    break;
                }
            }
        }

        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// Read requests until the client disconnects; one response per request.
async fn handle_connection(
    mut stream: UnixStream,
    handler: Arc<RequestHandler>,
    cancel_token: CancellationToken,
) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        let read = tokio::select! {
            read = stream.read_exact(&mut len_buf) => read,
            _ = cancel_token.cancelled() => return Ok(()),
        };
        match read {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let msg_len = u32::from_le_bytes(len_buf) as usize;
        if msg_len > MAX_MESSAGE_SIZE {
            error!("Message too large: {msg_len} bytes");
            let response = Response::error(
                ErrorCode::InvalidRequest,
                format!("Message too large: {msg_len} bytes"),
            );
            send_response(&mut stream, &response).await?;
            // The oversized payload cannot be skipped reliably.
            return Ok(());
        }

        let mut payload = vec![0u8; msg_len];
        stream.read_exact(&mut payload).await?;

        let request: Request = match decode_message(&payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to decode request: {e}");
                let response = Response::error(
                    ErrorCode::InvalidRequest,
                    format!("Failed to decode request: {e}"),
                );
                send_response(&mut stream, &response).await?;
                continue;
            }
        };

        let response = handler.handle(request).await;
        send_response(&mut stream, &response).await?;
    }
}

async fn send_response(stream: &mut UnixStream, response: &Response) -> Result<()> {
    let encoded = match encode_message(response) {
        Ok(encoded) => encoded,
        Err(e) => encode_message(&Response::internal_error(format!(
            "Failed to encode response: {e}"
        )))?,
    };
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}
