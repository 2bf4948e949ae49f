//! Authenticated session with the switch: verification before commit, the
//! live reader task, keepalive pings, and autonomous reconnection.

use crate::probe::ConnectivityProbe;
use crate::transport::{ManagerLink, ManagerTransport};
use callboard_core::manager_frame::{next_action_id, ManagerMessage};
use callboard_core::{ConnectionReport, ConnectionSettings, FailureKind, SessionState};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch, Mutex as AsyncMutex,
    },
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{message}")]
    Transport { kind: FailureKind, message: String },
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("not connected to the switch")]
    NotConnected,
    #[error("no connection settings recorded; connect first")]
    NoSettings,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
    #[error("action queue full")]
    QueueFull,
}

impl SessionError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SessionError::Transport { kind, .. } => *kind,
            SessionError::Authentication(_) => FailureKind::Authentication,
            SessionError::Timeout(_) => FailureKind::TimedOut,
            SessionError::NotConnected
            | SessionError::NoSettings
            | SessionError::Protocol(_)
            | SessionError::Closed
            | SessionError::QueueFull => FailureKind::Other,
        }
    }

    pub fn into_report(self) -> ConnectionReport {
        ConnectionReport::failed(self.failure_kind(), self.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub test_timeout: Duration,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Longest a single write to the switch may take before the link is
    /// treated as lost.
    pub write_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub action_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            test_timeout: DEFAULT_TEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            action_queue: 64,
        }
    }
}

/// What the session hands to its consumer, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    Event(ManagerMessage),
    State(SessionState),
}

/// Publishes state transitions on a watch channel and forwards each change
/// to the signal stream.
struct StateNotifier {
    state: watch::Sender<SessionState>,
    signals: mpsc::Sender<SessionSignal>,
}

impl StateNotifier {
    async fn set(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        info!(event = "session_state", from = %previous, to = %next);
        let _ = self.signals.send(SessionSignal::State(next)).await;
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }
}

struct LiveConnection {
    actions: mpsc::Sender<ManagerMessage>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ProtocolSession {
    transport: Arc<dyn ManagerTransport>,
    probe: ConnectivityProbe,
    config: SessionConfig,
    notifier: Arc<StateNotifier>,
    settings: AsyncMutex<Option<ConnectionSettings>>,
    live: AsyncMutex<Option<LiveConnection>>,
}

impl ProtocolSession {
    pub fn new(
        transport: Arc<dyn ManagerTransport>,
        probe: ConnectivityProbe,
        config: SessionConfig,
        signals: mpsc::Sender<SessionSignal>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            transport,
            probe,
            config,
            notifier: Arc::new(StateNotifier { state, signals }),
            settings: AsyncMutex::new(None),
            live: AsyncMutex::new(None),
        }
    }

    pub fn probe(&self) -> &ConnectivityProbe {
        &self.probe
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.notifier.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.notifier.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub async fn settings(&self) -> Option<ConnectionSettings> {
        self.settings.lock().await.clone()
    }

    /// Verifies reachability and credentials on a throwaway connection that
    /// is always released before returning.
    pub async fn test_connection(
        &self,
        settings: &ConnectionSettings,
        timeout: Duration,
    ) -> ConnectionReport {
        let started = Instant::now();
        let tcp = self
            .probe
            .test_tcp(&settings.host, settings.port, timeout)
            .await;
        if !tcp.success {
            return tcp;
        }

        let deadline = started + timeout;
        let opened = tokio::time::timeout_at(
            deadline,
            self.transport.open(&settings.host, settings.port, timeout),
        )
        .await;
        let mut link = match opened {
            Ok(Ok(link)) => link,
            Ok(Err(err)) => return err.into_report(),
            Err(_) => return SessionError::Timeout(timeout).into_report(),
        };

        let outcome = tokio::time::timeout_at(
            deadline,
            link.login(&settings.username, &settings.password, false),
        )
        .await;
        link.close().await;

        match outcome {
            Ok(Ok(())) => {
                info!(event = "session_test_ok", endpoint = %settings.endpoint());
                ConnectionReport::ok(format!(
                    "Authenticated with {} as {}",
                    settings.endpoint(),
                    settings.username
                ))
            }
            Ok(Err(err)) => {
                warn!(event = "session_test_failed", endpoint = %settings.endpoint(), error = %err);
                err.into_report()
            }
            Err(_) => {
                warn!(event = "session_test_timeout", endpoint = %settings.endpoint());
                SessionError::Timeout(timeout).into_report()
            }
        }
    }

    /// Tests first; only a verified endpoint replaces the live connection.
    pub async fn connect(&self, settings: ConnectionSettings) -> ConnectionReport {
        info!(
            event = "session_connect",
            endpoint = %settings.endpoint(),
            username = %settings.username
        );
        let test = self
            .test_connection(&settings, self.config.test_timeout)
            .await;
        if !test.success {
            return test;
        }

        self.teardown_live().await;
        self.notifier.set(SessionState::Connecting).await;

        let link = match open_authenticated(
            self.transport.as_ref(),
            &settings,
            self.config.connect_timeout,
        )
        .await
        {
            Ok(link) => link,
            Err(err) => {
                warn!(event = "session_connect_failed", endpoint = %settings.endpoint(), error = %err);
                self.notifier.set(SessionState::Disconnected).await;
                return err.into_report();
            }
        };

        let (actions_tx, actions_rx) = mpsc::channel(self.config.action_queue.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.notifier.set(SessionState::Connected).await;
        let task = tokio::spawn(run_live(
            link,
            LiveContext {
                settings: settings.clone(),
                transport: self.transport.clone(),
                config: self.config.clone(),
                notifier: self.notifier.clone(),
            },
            actions_rx,
            shutdown_rx,
        ));
        *self.live.lock().await = Some(LiveConnection {
            actions: actions_tx,
            shutdown: shutdown_tx,
            task,
        });
        let message = format!("Connected to {}", settings.endpoint());
        *self.settings.lock().await = Some(settings);
        ConnectionReport::ok(message)
    }

    pub async fn reconnect(&self) -> ConnectionReport {
        match self.settings().await {
            Some(settings) => self.connect(settings).await,
            None => SessionError::NoSettings.into_report(),
        }
    }

    pub async fn close(&self) {
        self.teardown_live().await;
        self.notifier.set(SessionState::Disconnected).await;
    }

    /// Queues an action on the live connection. Never waits for queue space.
    pub async fn send_action(&self, action: ManagerMessage) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let actions = self
            .live
            .lock()
            .await
            .as_ref()
            .map(|live| live.actions.clone())
            .ok_or(SessionError::NotConnected)?;
        actions.try_send(action).map_err(|err| match err {
            TrySendError::Full(_) => SessionError::QueueFull,
            TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    async fn teardown_live(&self) {
        let previous = self.live.lock().await.take();
        let Some(live) = previous else {
            return;
        };
        let _ = live.shutdown.send(true);
        drop(live.actions);
        let mut task = live.task;
        match tokio::time::timeout(TEARDOWN_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(event = "session_teardown_error", error = %err),
            Err(_) => {
                warn!(event = "session_teardown_abort");
                task.abort();
            }
        }
    }
}

async fn open_authenticated(
    transport: &dyn ManagerTransport,
    settings: &ConnectionSettings,
    timeout: Duration,
) -> Result<Box<dyn ManagerLink>, SessionError> {
    let mut link = transport
        .open(&settings.host, settings.port, timeout)
        .await?;
    match tokio::time::timeout(
        timeout,
        link.login(&settings.username, &settings.password, true),
    )
    .await
    {
        Ok(Ok(())) => Ok(link),
        Ok(Err(err)) => {
            link.close().await;
            Err(err)
        }
        Err(_) => {
            link.close().await;
            Err(SessionError::Timeout(timeout))
        }
    }
}

fn queue_status_action() -> ManagerMessage {
    ManagerMessage::action("QueueStatus").with_header("ActionID", next_action_id())
}

fn ping_action() -> ManagerMessage {
    ManagerMessage::action("Ping").with_header("ActionID", next_action_id())
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

struct LiveContext {
    settings: ConnectionSettings,
    transport: Arc<dyn ManagerTransport>,
    config: SessionConfig,
    notifier: Arc<StateNotifier>,
}

enum LinkExit {
    Shutdown,
    Lost(String),
}

/// Returns true once shutdown was requested or its sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    match shutdown.changed().await {
        Ok(()) => *shutdown.borrow(),
        Err(_) => true,
    }
}

async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    while !shutdown_requested(shutdown).await {}
}

/// One bounded write. A stalled or failed write loses the link; shutdown
/// abandons it.
async fn send_within(
    link: &mut dyn ManagerLink,
    message: &ManagerMessage,
    limit: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), LinkExit> {
    tokio::select! {
        _ = shutdown_signalled(shutdown) => Err(LinkExit::Shutdown),
        sent = tokio::time::timeout(limit, link.send(message)) => match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(LinkExit::Lost(err.to_string())),
            Err(_) => Err(LinkExit::Lost(format!(
                "write stalled for {} ms",
                limit.as_millis()
            ))),
        },
    }
}

async fn run_live(
    mut link: Box<dyn ManagerLink>,
    ctx: LiveContext,
    mut actions: mpsc::Receiver<ManagerMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let endpoint = ctx.settings.endpoint();
    let write_timeout = ctx.config.write_timeout;
    loop {
        let synced =
            send_within(link.as_mut(), &queue_status_action(), write_timeout, &mut shutdown).await;
        let exit = match synced {
            Ok(()) => pump_link(link.as_mut(), &ctx, &mut actions, &mut shutdown).await,
            Err(LinkExit::Lost(reason)) => {
                warn!(event = "session_sync_failed", endpoint = %endpoint, error = %reason);
                LinkExit::Lost(reason)
            }
            Err(exit) => exit,
        };
        if tokio::time::timeout(write_timeout, link.close()).await.is_err() {
            warn!(event = "session_close_stalled", endpoint = %endpoint);
        }
        match exit {
            LinkExit::Shutdown => break,
            LinkExit::Lost(reason) => {
                warn!(event = "session_link_lost", endpoint = %endpoint, reason = %reason);
            }
        }

        ctx.notifier.set(SessionState::Reconnecting).await;
        match reestablish(&ctx, &mut shutdown).await {
            Some(next) => {
                link = next;
                ctx.notifier.set(SessionState::Connected).await;
            }
            None => break,
        }
    }
    ctx.notifier.set(SessionState::Disconnected).await;
    debug!(event = "session_live_stopped", endpoint = %endpoint);
}

async fn pump_link(
    link: &mut dyn ManagerLink,
    ctx: &LiveContext,
    actions: &mut mpsc::Receiver<ManagerMessage>,
    shutdown: &mut watch::Receiver<bool>,
) -> LinkExit {
    let period = ctx.config.keepalive_interval;
    let write_timeout = ctx.config.write_timeout;
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            stop = shutdown_requested(shutdown) => {
                if stop {
                    return LinkExit::Shutdown;
                }
            }
            inbound = link.next_message() => match inbound {
                Ok(Some(message)) => {
                    if message.event_name().is_some() {
                        tokio::select! {
                            _ = shutdown_signalled(shutdown) => return LinkExit::Shutdown,
                            sent = ctx.notifier.signals.send(SessionSignal::Event(message)) => {
                                if sent.is_err() {
                                    return LinkExit::Shutdown;
                                }
                            }
                        }
                    } else if message
                        .response()
                        .is_some_and(|response| response.eq_ignore_ascii_case("error"))
                    {
                        warn!(
                            event = "session_action_error",
                            action_id = message.action_id().unwrap_or_default(),
                            message = message.header("Message").unwrap_or_default()
                        );
                    }
                }
                Ok(None) => return LinkExit::Lost("closed by the switch".to_string()),
                Err(err) => return LinkExit::Lost(err.to_string()),
            },
            Some(action) = actions.recv() => {
                if let Err(exit) = send_within(link, &action, write_timeout, shutdown).await {
                    return exit;
                }
            }
            _ = keepalive.tick() => {
                if let Err(exit) = send_within(link, &ping_action(), write_timeout, shutdown).await {
                    return exit;
                }
            }
        }
    }
}

async fn reestablish(
    ctx: &LiveContext,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Box<dyn ManagerLink>> {
    let mut backoff = ctx.config.backoff_initial;
    loop {
        tokio::select! {
            stop = shutdown_requested(shutdown) => {
                if stop {
                    return None;
                }
            }
            attempt = open_authenticated(ctx.transport.as_ref(), &ctx.settings, ctx.config.connect_timeout) => {
                match attempt {
                    Ok(link) => {
                        info!(event = "session_reconnected", endpoint = %ctx.settings.endpoint());
                        return Some(link);
                    }
                    Err(err) => {
                        warn!(
                            event = "session_reconnect_failed",
                            endpoint = %ctx.settings.endpoint(),
                            error = %err,
                            retry_ms = backoff.as_millis() as u64
                        );
                    }
                }
            }
        }
        tokio::select! {
            stop = shutdown_requested(shutdown) => {
                if stop {
                    return None;
                }
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = next_backoff(backoff, ctx.config.backoff_max);
    }
}
