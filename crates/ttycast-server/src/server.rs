//! Core server: accepts WebSocket connections and wires them to the broker.
//!
//! Owns the broker task, the lobby flush ticker and the directory watcher.
//! Each accepted socket gets its own task that shuttles frames between the
//! wire and the broker's event queue.

use crate::auth::{CredentialStore, ProfileStore};
use crate::broker::{Broker, BrokerEvent, BrokerHandle};
use crate::client::OutboundFrame;
use crate::config::ServerConfig;
use crate::session::EventSink;
use crate::transport::websocket::{self, WebSocketConnection};
use crate::watcher::{DirectoryWatcher, SocketEvent};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use ttycast_core::{CastError, CastResult};

/// The ttycast server instance.
pub struct CastServer {
    config: Arc<ServerConfig>,
    broker: Broker,
}

impl CastServer {
    pub fn new(
        config: ServerConfig,
        credentials: Arc<dyn CredentialStore>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        let config = Arc::new(config);
        let broker = Broker::new(config.clone(), credentials, profiles);
        Self { config, broker }
    }

    /// Handle for posting events (and the shutdown request) to the broker.
    pub fn handle(&self) -> BrokerHandle {
        self.broker.handle()
    }

    /// Accept connections until the listener goes away.
    pub async fn run(self) -> CastResult<()> {
        let Self { config, broker } = self;
        let handle = broker.handle();

        let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
            .parse()
            .map_err(|e| CastError::Other(format!("invalid address: {e}")))?;
        let mut ws_rx = websocket::start_listener(addr).await?;

        tokio::spawn(broker.run());

        let ticker = handle.clone();
        let rate = config.lobby_update_rate;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(rate);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                ticker.send(BrokerEvent::LobbyFlush);
            }
        });

        let _watcher = if config.watch_socket_dirs {
            Some(watch_socket_dirs(&config, &handle)?)
        } else {
            None
        };

        info!(
            addr = %addr,
            games = config.games.len(),
            watch_socket_dirs = config.watch_socket_dirs,
            "ttycast-server ready"
        );

        while let Some(ws_conn) = ws_rx.recv().await {
            let handle = handle.clone();
            tokio::spawn(serve_connection(ws_conn, handle));
        }
        info!("listener closed");
        Ok(())
    }
}

/// Start watching every game's socket dir and report the sockets already there.
fn watch_socket_dirs(config: &ServerConfig, handle: &BrokerHandle) -> CastResult<DirectoryWatcher> {
    let events = handle.clone();
    let sink: EventSink<SocketEvent> = Arc::new(move |e| events.send(BrokerEvent::Socket(e)));
    let watcher = DirectoryWatcher::start(&config.socket_dirs(), sink)?;
    for path in watcher.existing_sockets() {
        handle.send(BrokerEvent::Socket(SocketEvent::Created(path)));
    }
    Ok(watcher)
}

/// Pump one client socket until either side closes it.
async fn serve_connection(conn: WebSocketConnection, handle: BrokerHandle) {
    let conn_id = handle.next_conn_id();
    let WebSocketConnection {
        ws_stream,
        remote_addr,
        compression,
    } = conn;
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    handle.send(BrokerEvent::Connected {
        conn: conn_id,
        remote: remote_addr,
        compression,
        outbound: outbound_tx,
    });

    let (mut sink, mut stream) = ws_stream.split();
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let msg = match frame {
                    Some(OutboundFrame::Text(text)) => Message::Text(text.into()),
                    Some(OutboundFrame::Binary(data)) => Message::Binary(data.into()),
                    Some(OutboundFrame::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = sink.send(msg).await {
                    handle.send(BrokerEvent::SendFailed {
                        conn: conn_id,
                        error: e.to_string(),
                    });
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle.send(BrokerEvent::ClientText {
                    conn: conn_id,
                    text: text.to_string(),
                }),
                Some(Ok(Message::Close(_))) | None => {
                    debug!(conn_id, "peer closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(conn_id, error = %e, "WebSocket read failed");
                    break;
                }
            },
        }
    }
    handle.send(BrokerEvent::Disconnected { conn: conn_id });
}
