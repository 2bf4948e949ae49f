//! Push channel fan-out: one bounded outbound queue per dashboard connection,
//! drained by a writer task with a write timeout.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use callboard_core::push_wire::{
    decode_command, encode_push, ClientCommand, ErrorPayload, PushEnvelope, PushMsg,
    StatsSnapshot, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_MAX_PUSH_BYTES, PUSH_PROTOCOL_VERSION,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_message_bytes: usize,
    pub max_push_bytes: usize,
    pub debug: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 256,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_push_bytes: DEFAULT_MAX_PUSH_BYTES,
            debug: false,
        }
    }
}

/// Frames queued for one subscriber's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(Arc<str>),
    Ping,
    Close(&'static str),
}

pub type OutboundSender = mpsc::Sender<Outbound>;

/// What the hub needs from the engine behind it.
#[async_trait]
pub trait SubscriberHandler: Send + Sync {
    /// Registers `sender` and queues its initial snapshot. Must be atomic
    /// with respect to state changes so no update is missed or reordered.
    async fn subscribe(&self, sender: OutboundSender) -> String;

    async fn handle_command(&self, conn_id: &str, command: ClientCommand);
}

pub struct BroadcastHub {
    config: HubConfig,
    conn_counter: AtomicU64,
    seq: AtomicU64,
    subscribers: RwLock<HashMap<String, OutboundSender>>,
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub fn make_envelope(&self, msg: PushMsg) -> PushEnvelope {
        PushEnvelope {
            version: PUSH_PROTOCOL_VERSION,
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now().to_rfc3339(),
            msg,
        }
    }

    fn encode(&self, msg: PushMsg) -> Option<Arc<str>> {
        let kind = msg.kind();
        let envelope = self.make_envelope(msg);
        match encode_push(&envelope, self.config.max_push_bytes) {
            Ok(text) => Some(Arc::from(text)),
            Err(err) => {
                warn!(event = "push_encode_error", kind = kind, error = %err);
                None
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Queues `snapshot` on the new sender, then adds it to the fan-out set.
    pub async fn register(&self, sender: OutboundSender, snapshot: StatsSnapshot) -> String {
        let conn_id = self.next_conn_id();
        if let Some(text) = self.encode(PushMsg::Stats(snapshot)) {
            if sender.try_send(Outbound::Text(text)).is_err() {
                warn!(event = "snapshot_error", conn_id = %conn_id);
            }
        }
        self.subscribers
            .write()
            .await
            .insert(conn_id.clone(), sender);
        info!(event = "subscriber_registered", conn_id = %conn_id);
        conn_id
    }

    pub async fn unregister(&self, conn_id: &str, reason: &str) {
        if self.subscribers.write().await.remove(conn_id).is_some() {
            info!(event = "subscriber_removed", conn_id = conn_id, reason = reason);
        }
    }

    /// Sends to every subscriber. A full or closed queue drops only that
    /// subscriber. Returns how many accepted the message.
    pub async fn broadcast(&self, msg: PushMsg) -> usize {
        let kind = msg.kind();
        let Some(text) = self.encode(msg) else {
            return 0;
        };
        let targets = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(id, sender)| (id.clone(), sender.clone()))
            .collect::<Vec<_>>();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (conn_id, sender) in targets {
            match sender.try_send(Outbound::Text(text.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "send_error", conn_id = %conn_id, kind = kind, reason = "queue_full");
                    failed.push((conn_id, "queue_full"));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    failed.push((conn_id, "closed"));
                }
            }
        }
        for (conn_id, reason) in failed {
            self.unregister(&conn_id, reason).await;
        }
        if self.config.debug {
            debug!(event = "broadcast", kind = kind, delivered = delivered);
        }
        delivered
    }

    /// Replies to a single subscriber.
    pub async fn send_to(&self, conn_id: &str, msg: PushMsg) -> bool {
        let sender = self.subscribers.read().await.get(conn_id).cloned();
        let Some(sender) = sender else {
            return false;
        };
        let Some(text) = self.encode(msg) else {
            return false;
        };
        if sender.try_send(Outbound::Text(text)).is_err() {
            warn!(event = "send_error", conn_id = conn_id);
            self.unregister(conn_id, "send_error").await;
            return false;
        }
        true
    }

    pub async fn send_error(
        &self,
        conn_id: &str,
        code: &str,
        message: &str,
        command: Option<&str>,
    ) -> bool {
        self.send_to(
            conn_id,
            PushMsg::Error(ErrorPayload {
                code: code.to_string(),
                message: message.to_string(),
                command: command.map(str::to_string),
            }),
        )
        .await
    }

    /// Asks every writer to close its socket and forgets all subscribers.
    pub async fn close_all(&self, reason: &'static str) {
        let drained = self.subscribers.write().await.drain().collect::<Vec<_>>();
        for (conn_id, sender) in drained {
            let _ = sender.try_send(Outbound::Close(reason));
            info!(event = "subscriber_removed", conn_id = %conn_id, reason = reason);
        }
    }

    fn start_ping(&self, conn_id: String, sender: OutboundSender) -> Option<tokio::task::JoinHandle<()>> {
        if self.config.ping_interval.is_zero() {
            return None;
        }
        let interval = self.config.ping_interval;
        Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                if sender.send(Outbound::Ping).await.is_err() {
                    debug!(event = "ping_stopped", conn_id = %conn_id);
                    return;
                }
            }
        }))
    }

    pub async fn handle_socket<H>(
        self: Arc<Self>,
        socket: WebSocket,
        remote: SocketAddr,
        handler: Arc<H>,
    ) where
        H: SubscriberHandler + ?Sized,
    {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(self.config.queue_capacity.max(1));
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                let (msg, closing) = match out {
                    Outbound::Text(text) => (Message::Text(text.to_string()), false),
                    Outbound::Ping => (Message::Ping(Vec::new()), false),
                    Outbound::Close(reason) => (
                        Message::Close(Some(CloseFrame {
                            code: 1001,
                            reason: reason.into(),
                        })),
                        true,
                    ),
                };
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) if !closing => {}
                    _ => return,
                }
            }
        });

        let conn_id = handler.subscribe(tx.clone()).await;
        info!(event = "client_connected", conn_id = %conn_id, remote = %remote);
        let ping_task = self.start_ping(conn_id.clone(), tx.clone());

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %conn_id, error = %err);
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if self.config.debug {
                debug!(event = "message_received", conn_id = %conn_id, raw = %String::from_utf8_lossy(&data));
            }
            match decode_command(&data, self.config.max_message_bytes) {
                Ok(command) => handler.handle_command(&conn_id, command).await,
                Err(err) => {
                    warn!(event = "message_invalid", conn_id = %conn_id, error = %err);
                    self.send_error(&conn_id, "invalid_command", &err.to_string(), None)
                        .await;
                }
            }
        }

        self.unregister(&conn_id, "disconnect").await;
        if let Some(ping) = ping_task {
            ping.abort();
        }
        drop(tx);
        let _ = write_task.await;
        info!(event = "client_disconnected", conn_id = %conn_id, remote = %remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callboard_core::push_wire::StatePayload;
    use callboard_core::{QueueStats, SessionState};

    fn hub() -> BroadcastHub {
        BroadcastHub::new(HubConfig::default())
    }

    fn decode(out: Outbound) -> PushEnvelope {
        match out {
            Outbound::Text(text) => serde_json::from_str(&text).expect("envelope"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_queues_snapshot_first() {
        let hub = hub();
        let (tx, mut rx) = mpsc::channel(4);
        let snapshot = StatsSnapshot {
            queues: vec![QueueStats::new("Q1")],
            ..StatsSnapshot::default()
        };
        let conn_id = hub.register(tx, snapshot.clone()).await;
        assert_eq!(conn_id, "conn-1");
        let envelope = decode(rx.recv().await.expect("snapshot"));
        assert_eq!(envelope.msg, PushMsg::Stats(snapshot));
        assert_eq!(hub.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn broadcast_skips_failed_subscribers() {
        let hub = hub();
        let (full_tx, _full_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = mpsc::channel(4);
        let (ok_tx, mut ok_rx) = mpsc::channel(4);
        // Snapshot fills the single slot of `full_tx`.
        hub.register(full_tx, StatsSnapshot::default()).await;
        hub.register(closed_tx, StatsSnapshot::default()).await;
        hub.register(ok_tx, StatsSnapshot::default()).await;
        drop(closed_rx);
        let _ = ok_rx.recv().await;

        let delivered = hub
            .broadcast(PushMsg::State(StatePayload::from(SessionState::Connected)))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(hub.subscriber_count().await, 1);
        let envelope = decode(ok_rx.recv().await.expect("state"));
        assert_eq!(envelope.msg.kind(), "state");
        assert_eq!(envelope.version, PUSH_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn sequence_numbers_increase() {
        let hub = hub();
        let first = hub.make_envelope(PushMsg::Stats(StatsSnapshot::default()));
        let second = hub.make_envelope(PushMsg::Stats(StatsSnapshot::default()));
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn errors_go_only_to_the_offender() {
        let hub = hub();
        let (a_tx, mut a_rx) = mpsc::channel(4);
        let (b_tx, mut b_rx) = mpsc::channel(4);
        let a = hub.register(a_tx, StatsSnapshot::default()).await;
        hub.register(b_tx, StatsSnapshot::default()).await;
        let _ = a_rx.recv().await;
        let _ = b_rx.recv().await;

        assert!(
            hub.send_error(&a, "invalid_command", "bad json", None)
                .await
        );
        let envelope = decode(a_rx.recv().await.expect("error"));
        match envelope.msg {
            PushMsg::Error(payload) => assert_eq!(payload.code, "invalid_command"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(b_rx.try_recv().is_err());
        assert!(!hub.send_to("conn-99", PushMsg::Stats(StatsSnapshot::default())).await);
    }

    #[tokio::test]
    async fn close_all_sends_close_and_forgets() {
        let hub = hub();
        let (tx, mut rx) = mpsc::channel(4);
        hub.register(tx, StatsSnapshot::default()).await;
        let _ = rx.recv().await;
        hub.close_all("shutdown").await;
        assert_eq!(rx.recv().await, Some(Outbound::Close("shutdown")));
        assert_eq!(hub.subscriber_count().await, 0);
    }
}
