//! WebSocket listener using tokio-tungstenite.
//!
//! The handshake negotiates compression: a client that offers the
//! `no-compression` subprotocol gets plain text frames, every other client
//! gets raw-deflated binary batches.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};
use ttycast_core::{CastError, CastResult};

/// Subprotocol a client offers to opt out of compressed batches.
pub const NO_COMPRESSION: &str = "no-compression";

/// Largest client frame accepted.
const MAX_WS_MESSAGE_SIZE: usize = 1_048_576;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Batches to this client are deflated.
    pub compression: bool,
}

/// Whether a `Sec-WebSocket-Protocol` header value offers `no-compression`.
pub fn offers_no_compression(header: &str) -> bool {
    header
        .split(',')
        .any(|p| p.trim().eq_ignore_ascii_case(NO_COMPRESSION))
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields accepted connections.
pub async fn start_listener(bind_addr: SocketAddr) -> CastResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| CastError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match accept(stream, addr).await {
                            Ok(conn) => {
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

async fn accept(stream: TcpStream, remote_addr: SocketAddr) -> CastResult<WebSocketConnection> {
    let plain = Arc::new(AtomicBool::new(false));
    let negotiated = plain.clone();
    let callback = move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let offered = request
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .is_some_and(offers_no_compression);
        if offered {
            negotiated.store(true, Ordering::Relaxed);
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(NO_COMPRESSION),
            );
        }
        Ok(response)
    };

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_WS_MESSAGE_SIZE);
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config))
        .await
        .map_err(|e| CastError::Transport(format!("WS handshake failed: {e}")))?;

    let compression = !plain.load(Ordering::Relaxed);
    debug!(remote = %remote_addr, compression, "WebSocket connection accepted");
    Ok(WebSocketConnection {
        ws_stream,
        remote_addr,
        compression,
    })
}
