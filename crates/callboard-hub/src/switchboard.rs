//! The engine facade. Owns the session, the store, and the push hub, and runs
//! the single pump task that applies switch events in arrival order.

use crate::hub::{BroadcastHub, HubConfig, OutboundSender, SubscriberHandler};
use crate::normalizer::normalize;
use crate::probe::{ConnectivityProbe, DiagnosticReport, ProbeConfig};
use crate::session::{ProtocolSession, SessionConfig, SessionError, SessionSignal};
use crate::store::{AggregateStateStore, StoreConfig};
use crate::transport::{AmiTransport, ManagerTransport};
use async_trait::async_trait;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use callboard_core::manager_frame::{next_action_id, ManagerMessage};
use callboard_core::push_wire::{ClientCommand, EventPayload, PushMsg, StatsSnapshot};
use callboard_core::{
    AgentStats, CallEvent, CallRecord, ConnectionReport, ConnectionSettings, QueueStats,
    SessionState,
};
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex as AsyncMutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

const SERVER_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("agent {0} has no known device interface")]
    MissingInterface(String),
    #[error("not connected to the switch")]
    NotConnected,
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::UnknownAgent(_) => "unknown_agent",
            CommandError::UnknownQueue(_) => "unknown_queue",
            CommandError::MissingInterface(_) => "missing_interface",
            CommandError::NotConnected => "not_connected",
            CommandError::Session(_) => "session_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwitchboardConfig {
    pub probe: ProbeConfig,
    pub session: SessionConfig,
    pub store: StoreConfig,
    pub hub: HubConfig,
    pub signal_capacity: usize,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            probe: ProbeConfig::default(),
            session: SessionConfig::default(),
            store: StoreConfig::default(),
            hub: HubConfig::default(),
            signal_capacity: 1024,
        }
    }
}

struct PushServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Switchboard {
    session: ProtocolSession,
    store: RwLock<AggregateStateStore>,
    hub: Arc<BroadcastHub>,
    server: AsyncMutex<Option<PushServer>>,
    pump: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Switchboard {
    /// Builds the engine on the TCP manager transport. Must be called inside
    /// a tokio runtime.
    pub fn start(config: SwitchboardConfig) -> Arc<Self> {
        Self::with_transport(config, Arc::new(AmiTransport::new()))
    }

    pub fn with_transport(
        config: SwitchboardConfig,
        transport: Arc<dyn ManagerTransport>,
    ) -> Arc<Self> {
        let (signals_tx, signals_rx) = mpsc::channel(config.signal_capacity.max(1));
        let session = ProtocolSession::new(
            transport,
            ConnectivityProbe::new(config.probe),
            config.session,
            signals_tx,
        );
        let board = Arc::new(Self {
            session,
            store: RwLock::new(AggregateStateStore::new(config.store)),
            hub: Arc::new(BroadcastHub::new(config.hub)),
            server: AsyncMutex::new(None),
            pump: AsyncMutex::new(None),
        });
        let pump = tokio::spawn(run_pump(Arc::downgrade(&board), signals_rx));
        if let Ok(mut slot) = board.pump.try_lock() {
            *slot = Some(pump);
        }
        board
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn session(&self) -> &ProtocolSession {
        &self.session
    }

    pub async fn connect(&self, settings: ConnectionSettings) -> ConnectionReport {
        self.session.connect(settings).await
    }

    pub async fn test_connection(
        &self,
        settings: &ConnectionSettings,
        timeout: Option<Duration>,
    ) -> ConnectionReport {
        let timeout = timeout.unwrap_or(self.session.config().test_timeout);
        self.session.test_connection(settings, timeout).await
    }

    pub async fn test_tcp(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> ConnectionReport {
        let probe = self.session.probe();
        let timeout = timeout.unwrap_or(probe.config().tcp_timeout);
        probe.test_tcp(host, port, timeout).await
    }

    pub async fn test_ports(&self, host: &str, ports: &[u16]) -> Vec<u16> {
        self.session.probe().test_ports(host, ports).await
    }

    pub async fn run_diagnostics(&self, host: &str, port: u16) -> DiagnosticReport {
        self.session.probe().run_diagnostics(host, port).await
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub async fn reconnect(&self) -> ConnectionReport {
        self.session.reconnect().await
    }

    /// Stops the session and the push channel. Safe to call repeatedly.
    pub async fn close(&self) {
        self.session.close().await;
        self.hub.close_all("shutdown").await;
        let server = self.server.lock().await.take();
        if let Some(server) = server {
            stop_server(server).await;
        }
    }

    pub async fn queue_stats(&self) -> HashMap<String, QueueStats> {
        self.store.read().await.queue_stats()
    }

    pub async fn agent_stats(&self) -> HashMap<String, AgentStats> {
        self.store.read().await.agent_stats()
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        self.store.read().await.snapshot()
    }

    pub async fn history(&self, limit: usize) -> Vec<CallRecord> {
        self.store.read().await.history(limit)
    }

    pub async fn register_queue(&self, id: &str, name: Option<&str>, strategy: Option<&str>) {
        let mut store = self.store.write().await;
        store.register_queue(id, name, strategy);
        self.hub.broadcast(PushMsg::Stats(store.snapshot())).await;
    }

    pub async fn remove_queue(&self, id: &str) -> Result<(), CommandError> {
        let mut store = self.store.write().await;
        if !store.remove_queue(id) {
            return Err(CommandError::UnknownQueue(id.to_string()));
        }
        self.hub.broadcast(PushMsg::Stats(store.snapshot())).await;
        Ok(())
    }

    /// Asks the switch to pause the agent in all its queues. Local state only
    /// changes when the switch confirms with a member-pause event.
    pub async fn pause_agent(&self, agent_id: &str, reason: Option<&str>) -> Result<(), CommandError> {
        let mut action = self.queue_pause_action(agent_id, true).await?;
        if let Some(reason) = reason.filter(|r| !r.trim().is_empty()) {
            action.set_header("Reason", reason);
        }
        self.session.send_action(action).await?;
        info!(event = "agent_pause_requested", agent_id = agent_id);
        Ok(())
    }

    pub async fn unpause_agent(&self, agent_id: &str) -> Result<(), CommandError> {
        let action = self.queue_pause_action(agent_id, false).await?;
        self.session.send_action(action).await?;
        info!(event = "agent_unpause_requested", agent_id = agent_id);
        Ok(())
    }

    async fn queue_pause_action(
        &self,
        agent_id: &str,
        paused: bool,
    ) -> Result<ManagerMessage, CommandError> {
        let interface = {
            let store = self.store.read().await;
            let agent = store
                .agent(agent_id)
                .ok_or_else(|| CommandError::UnknownAgent(agent_id.to_string()))?;
            agent
                .interface
                .clone()
                .ok_or_else(|| CommandError::MissingInterface(agent_id.to_string()))?
        };
        if !self.is_connected() {
            return Err(CommandError::NotConnected);
        }
        Ok(ManagerMessage::action("QueuePause")
            .with_header("ActionID", next_action_id())
            .with_header("Interface", interface)
            .with_header("Paused", if paused { "true" } else { "false" }))
    }

    /// Applies one normalized event and pushes the change. The store lock is
    /// held across the broadcast so subscribers see updates in apply order.
    pub async fn apply_event(&self, event: CallEvent) {
        let mut store = self.store.write().await;
        let update = store.apply(&event);
        let call = if update.kind.is_member_scoped() {
            None
        } else {
            update.call
        };
        self.hub
            .broadcast(PushMsg::Event(EventPayload {
                event_type: update.kind,
                call,
                agent: update.agent,
            }))
            .await;
        self.hub.broadcast(PushMsg::Stats(store.snapshot())).await;
    }

    async fn process_signal(&self, signal: SessionSignal) {
        match signal {
            SessionSignal::Event(raw) => match normalize(&raw, now_ms()) {
                Some(event) => self.apply_event(event).await,
                None => debug!(
                    event = "switch_event_ignored",
                    name = raw.event_name().unwrap_or_default()
                ),
            },
            SessionSignal::State(state) => {
                // A fresh login replays queue status next; mark current calls
                // so the replay can retire the ones that ended unseen.
                let mut store = self.store.write().await;
                if state == SessionState::Connected {
                    store.begin_resync();
                }
                self.hub.broadcast(PushMsg::State(state.into())).await;
            }
        }
    }

    /// Serves the push channel at `path` on `listener`, replacing any channel
    /// attached before. Returns the bound address.
    pub async fn attach_broadcast_channel(
        self: &Arc<Self>,
        listener: TcpListener,
        path: &str,
    ) -> io::Result<SocketAddr> {
        let local_addr = listener.local_addr()?;
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        let previous = self.server.lock().await.take();
        if let Some(previous) = previous {
            self.hub.close_all("channel_replaced").await;
            stop_server(previous).await;
        }

        let app = Router::new()
            .route(&path, get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self.clone());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let shutdown = async move {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            if let Err(err) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown)
            .await
            {
                error!(event = "push_server_error", error = %err);
            }
        });
        info!(event = "push_channel_attached", addr = %local_addr, path = %path);
        *self.server.lock().await = Some(PushServer {
            local_addr,
            shutdown: shutdown_tx,
            task,
        });
        Ok(local_addr)
    }

    pub async fn push_channel_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|server| server.local_addr)
    }

    async fn reply(&self, conn_id: &str, command: &ClientCommand, result: Result<PushMsg, CommandError>) {
        match result {
            Ok(msg) => {
                self.hub.send_to(conn_id, msg).await;
            }
            Err(err) => {
                warn!(
                    event = "command_failed",
                    conn_id = conn_id,
                    command = command.name(),
                    error = %err
                );
                self.hub
                    .send_error(conn_id, err.code(), &err.to_string(), Some(command.name()))
                    .await;
            }
        }
    }
}

#[async_trait]
impl SubscriberHandler for Switchboard {
    async fn subscribe(&self, sender: OutboundSender) -> String {
        let store = self.store.read().await;
        let conn_id = self.hub.register(sender, store.snapshot()).await;
        let state = self.session.state();
        self.hub
            .send_to(&conn_id, PushMsg::State(state.into()))
            .await;
        drop(store);
        conn_id
    }

    async fn handle_command(&self, conn_id: &str, command: ClientCommand) {
        let result = match &command {
            ClientCommand::GetStats => Ok(PushMsg::Stats(self.snapshot().await)),
            ClientCommand::GetAgentDetails { agent_id } => self
                .store
                .read()
                .await
                .agent_details(agent_id)
                .map(PushMsg::AgentDetails)
                .ok_or_else(|| CommandError::UnknownAgent(agent_id.clone())),
            ClientCommand::GetQueueDetails { queue_id } => self
                .store
                .read()
                .await
                .queue_details(queue_id)
                .map(PushMsg::QueueDetails)
                .ok_or_else(|| CommandError::UnknownQueue(queue_id.clone())),
            ClientCommand::PauseAgent { agent_id, reason } => {
                match self.pause_agent(agent_id, reason.as_deref()).await {
                    Ok(()) => return,
                    Err(err) => Err(err),
                }
            }
            ClientCommand::UnpauseAgent { agent_id } => match self.unpause_agent(agent_id).await {
                Ok(()) => return,
                Err(err) => Err(err),
            },
        };
        self.reply(conn_id, &command, result).await;
    }
}

async fn run_pump(board: Weak<Switchboard>, mut signals: mpsc::Receiver<SessionSignal>) {
    while let Some(signal) = signals.recv().await {
        let Some(board) = board.upgrade() else {
            break;
        };
        board.process_signal(signal).await;
    }
    debug!(event = "pump_stopped");
}

async fn stop_server(server: PushServer) {
    let _ = server.shutdown.send(true);
    let mut task = server.task;
    if tokio::time::timeout(SERVER_STOP_GRACE, &mut task).await.is_err() {
        warn!(event = "push_server_abort", addr = %server.local_addr);
        task.abort();
    }
    info!(event = "push_channel_detached", addr = %server.local_addr);
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(board): State<Arc<Switchboard>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let hub = board.hub.clone();
        hub.handle_socket(socket, addr, board).await;
    })
}

async fn health_handler() -> impl IntoResponse {
    "ok"
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Drop for Switchboard {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.try_lock() {
            if let Some(task) = pump.take() {
                task.abort();
            }
        }
    }
}
