//! Real-time channel to the messaging server.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{AckPayload, ClientRequest, OutboundFrame, ServerEvent};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

const EVENT_BUFFER: usize = 1024;

#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Sends `request` and waits for the server's ack.
    ///
    /// `Ok(None)` means no ack arrived in time; the outcome will show up as a
    /// regular inbound event instead.
    async fn emit(&self, request: ClientRequest) -> Result<Option<AckPayload>>;

    /// Inbound events in arrival order. Acks are routed to `emit` and never appear here.
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<AckPayload>>>>;

pub struct WebSocketChannel {
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    pending_acks: PendingAcks,
    next_ack_id: AtomicU64,
    events: broadcast::Sender<ServerEvent>,
    ack_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketChannel {
    pub async fn connect(server_url: &str, token: &str, ack_timeout: Duration) -> Result<Self> {
        let ws_url = websocket_url(server_url, token)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {server_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        info!(server_url, "transport: connected");

        let connected = Arc::new(AtomicBool::new(true));
        let pending_acks: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let writer_connected = Arc::clone(&connected);
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(WsMessage::Text(text)).await {
                    warn!(%err, "transport: write failed");
                    writer_connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let reader_connected = Arc::clone(&connected);
        let reader_acks = Arc::clone(&pending_acks);
        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(ServerEvent::Ack(ack)) => {
                            match reader_acks.lock().await.remove(&ack.ack_id) {
                                Some(waiter) => {
                                    let _ = waiter.send(ack);
                                }
                                None => debug!(ack_id = ack.ack_id, "transport: late ack dropped"),
                            }
                        }
                        Ok(event) => {
                            let _ = reader_events.send(event);
                        }
                        Err(err) => warn!(%err, "transport: dropping malformed event"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "transport: read failed");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            // Waiters see a closed oneshot and fail their emit.
            reader_acks.lock().await.clear();
            info!("transport: disconnected");
        });

        Ok(Self {
            outbound,
            connected,
            pending_acks,
            next_ack_id: AtomicU64::new(1),
            events,
            ack_timeout,
            tasks: vec![writer, reader],
        })
    }
}

#[async_trait]
impl RealtimeChannel for WebSocketChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn emit(&self, request: ClientRequest) -> Result<Option<AckPayload>> {
        if !self.is_connected() {
            bail!("websocket is not connected");
        }
        let ack_id = self.next_ack_id.fetch_add(1, Ordering::SeqCst);
        let text = serde_json::to_string(&OutboundFrame {
            ack_id,
            request: &request,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().await.insert(ack_id, tx);
        if self.outbound.send(text).is_err() {
            self.pending_acks.lock().await.remove(&ack_id);
            bail!("websocket writer has stopped");
        }
        debug!(ack_id, request = request.name(), "transport: emitted");

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(ack)) => Ok(Some(ack)),
            Ok(Err(_)) => Err(anyhow!("connection closed before {} was acknowledged", request.name())),
            Err(_) => {
                self.pending_acks.lock().await.remove(&ack_id);
                debug!(ack_id, request = request.name(), "transport: ack timed out");
                Ok(None)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn websocket_url(server_url: &str, token: &str) -> Result<Url> {
    let ws_base = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    let mut url = Url::parse(&format!("{}/ws", ws_base.trim_end_matches('/')))
        .with_context(|| format!("invalid server_url: {server_url}"))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
