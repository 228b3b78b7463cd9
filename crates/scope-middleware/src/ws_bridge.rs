//! WebSocket bridge between the [`MessageBus`] and the instrument network.
//!
//! [`WsBridge`] runs on a tokio runtime next to the synchronous acquisition
//! core and does three jobs:
//!
//! 1. **Serves** frame data: a bound WebSocket endpoint where every client
//!    receives each [`FrameBatch`] as one binary message. Clients share the
//!    batch allocation; nothing is copied per client.
//! 2. **Ingests** commands: connects to the command hub as a client and
//!    republishes every text message on the command lane.
//! 3. **Forwards** status: connects to the status hub as a client and sends
//!    every status-lane message as text.
//!
//! The client halves reconnect after a fixed delay when the hub goes away.
//! The bridge does not look inside the messages it moves.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use scope_types::{DeviceError, FrameBatch};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bus::MessageBus;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A batch viewed as raw bytes, kept alive by its `Arc`.
struct SharedBatch(Arc<FrameBatch>);

impl AsRef<[u8]> for SharedBatch {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Binary payload backed by the batch's own buffer.
fn batch_payload(batch: Arc<FrameBatch>) -> Bytes {
    Bytes::from_owner(SharedBatch(batch))
}

/// Socket address to bind for a `host:port` endpoint; `*` means every
/// interface.
pub fn bind_address(endpoint: &str) -> String {
    let endpoint = endpoint.strip_prefix("ws://").unwrap_or(endpoint);
    match endpoint.strip_prefix("*:") {
        Some(port) => format!("0.0.0.0:{port}"),
        None => endpoint.to_string(),
    }
}

/// WebSocket URL for a `host:port` endpoint.
pub fn client_url(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("ws://{endpoint}")
    }
}

#[derive(Clone)]
pub struct WsBridge {
    bus: MessageBus,
    reconnect_delay: Duration,
}

impl WsBridge {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    // -----------------------------------------------------------------------
    // Data server
    // -----------------------------------------------------------------------

    /// Bind the data endpoint.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Channel`] if the listener cannot be bound.
    pub async fn bind_data(endpoint: &str) -> Result<TcpListener, DeviceError> {
        let addr = bind_address(endpoint);
        TcpListener::bind(&addr)
            .await
            .map_err(|e| DeviceError::Channel(format!("data bind error on {addr}: {e}")))
    }

    /// Accept data clients forever. Each connected client receives every
    /// batch published after it connected.
    pub async fn serve_data(self, listener: TcpListener) -> Result<(), DeviceError> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "data endpoint listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = bridge.handle_data_client(stream, peer).await {
                            error!(peer = %peer, error = %e, "data client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "data accept error");
                }
            }
        }
    }

    async fn handle_data_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), DeviceError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| DeviceError::Channel(format!("ws handshake from {peer}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut rx = self.bus.subscribe_data();
        debug!(%peer, "data client connected");

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(batch) => {
                            if ws_tx.send(Message::Binary(batch_payload(batch))).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(peer = %peer, dropped_batches = n, "data client lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        _ => {}
                    }
                }
            }
        }
        debug!(%peer, "data client disconnected");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Command ingest
    // -----------------------------------------------------------------------

    /// Stay connected to the command hub at `url`, publishing every text
    /// message on the command lane. Runs until the task is dropped.
    pub async fn ingest_commands(self, url: String) {
        loop {
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    info!(%url, "connected to command hub");
                    self.pump_commands(ws).await;
                    warn!(%url, "command hub connection lost");
                }
                Err(e) => warn!(%url, error = %e, "command hub unreachable"),
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn pump_commands(&self, mut ws: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        while let Some(msg) = ws.next().await {
            let line = match msg {
                Ok(Message::Text(text)) => text.as_str().to_string(),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => text.to_string(),
                    Err(_) => {
                        warn!("dropping non-UTF-8 command");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "command hub read error");
                    break;
                }
            };
            if let Err(e) = self.bus.publish_command(line) {
                debug!(error = %e, "command not delivered");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Status forwarding
    // -----------------------------------------------------------------------

    /// Stay connected to the status hub at `url`, forwarding every status
    /// message. Returns once the bus shuts down.
    pub async fn forward_status(self, url: String) {
        let mut rx = self.bus.subscribe_status();
        loop {
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    info!(%url, "connected to status hub");
                    if !Self::pump_status(ws, &mut rx).await {
                        return;
                    }
                    warn!(%url, "status hub connection lost");
                }
                Err(e) => warn!(%url, error = %e, "status hub unreachable"),
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// Returns `false` when the status lane is closed.
    async fn pump_status(
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        rx: &mut broadcast::Receiver<String>,
    ) -> bool {
        let (mut ws_tx, mut ws_rx) = ws.split();
        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(message) => {
                            if ws_tx.send(Message::Text(message.into())).await.is_err() {
                                return true;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(dropped_messages = n, "status forwarder lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return false,
                    }
                }
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Lane;

    const WAIT: Duration = Duration::from_secs(2);

    async fn wait_for_subscriber(bus: &MessageBus, lane: Lane) {
        for _ in 0..200 {
            if bus.subscriber_count(lane) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn endpoint_forms() {
        assert_eq!(bind_address("*:5003"), "0.0.0.0:5003");
        assert_eq!(bind_address("127.0.0.1:5003"), "127.0.0.1:5003");
        assert_eq!(bind_address("ws://*:7000"), "0.0.0.0:7000");
        assert_eq!(client_url("localhost:5001"), "ws://localhost:5001");
        assert_eq!(client_url("wss://hub:443"), "wss://hub:443");
    }

    #[tokio::test]
    async fn data_batches_reach_connected_clients() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MessageBus::default();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(WsBridge::new(bus.clone()).serve_data(listener));

        let (mut client, _) = connect_async(format!("ws://{addr}")).await?;
        wait_for_subscriber(&bus, Lane::Data).await;
        bus.publish_data(FrameBatch::new(2, 2, vec![1, 2, 3, 4])?)?;

        let msg = tokio::time::timeout(WAIT, client.next()).await?.ok_or("stream ended")??;
        assert_eq!(msg, Message::Binary(vec![1u8, 2, 3, 4].into()));
        Ok(())
    }

    #[tokio::test]
    async fn commands_are_ingested_after_reconnect() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MessageBus::default();
        let mut sub = bus.subscribe_commands("ZylaCamera");
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = client_url(&listener.local_addr()?.to_string());
        tokio::spawn(
            WsBridge::new(bus.clone())
                .with_reconnect_delay(Duration::from_millis(10))
                .ingest_commands(url),
        );

        // First connection drops straight away.
        let (stream, _) = listener.accept().await?;
        drop(accept_async(stream).await?);

        let (stream, _) = listener.accept().await?;
        let mut hub = accept_async(stream).await?;
        hub.send(Message::text("Other start".to_string())).await?;
        hub.send(Message::text("ZylaCamera start".to_string())).await?;

        let mut line = None;
        for _ in 0..200 {
            if let Some(l) = sub.try_recv()? {
                line = Some(l);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(line.as_deref(), Some("ZylaCamera start"));
        Ok(())
    }

    #[tokio::test]
    async fn status_is_forwarded_as_text() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MessageBus::default();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = client_url(&listener.local_addr()?.to_string());
        tokio::spawn(WsBridge::new(bus.clone()).forward_status(url));

        let (stream, _) = listener.accept().await?;
        let mut hub = accept_async(stream).await?;
        wait_for_subscriber(&bus, Lane::Status).await;

        let record = r#"hub {"ZylaCamera":{"stack_size":1,"running_status":false,"device_status":true}}"#;
        bus.publish_status(record.to_string())?;

        let msg = tokio::time::timeout(WAIT, hub.next()).await?.ok_or("stream ended")??;
        assert_eq!(msg, Message::text(record.to_string()));
        Ok(())
    }

    #[test]
    fn batch_payload_shares_the_batch_buffer() -> Result<(), Box<dyn std::error::Error>> {
        let batch = Arc::new(FrameBatch::new(2, 2, vec![1, 2, 3, 4])?);
        let first = batch_payload(Arc::clone(&batch));
        let second = batch_payload(Arc::clone(&batch));
        assert_eq!(&first[..], &[1, 2, 3, 4]);
        assert_eq!(first.as_ptr(), batch.as_bytes().as_ptr());
        assert_eq!(second.as_ptr(), batch.as_bytes().as_ptr());
        drop((first, second));
        assert_eq!(Arc::strong_count(&batch), 1);
        Ok(())
    }
}
