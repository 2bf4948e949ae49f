use callboard_core::manager_frame::{ManagerFrameDecoder, ManagerMessage};
use callboard_core::{AgentStatus, ConnectionSettings, FailureKind, SessionState};
use callboard_hub::{CommandError, SessionConfig, Switchboard, SwitchboardConfig};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, Mutex},
};

const SECRET: &str = "s3cret";

/// In-process stand-in for the switch's manager interface. Accepts any
/// number of connections, checks the login secret, records every action and
/// streams pushed events to logins that asked for them.
struct ScriptedSwitch {
    addr: SocketAddr,
    actions: Mutex<mpsc::UnboundedReceiver<ManagerMessage>>,
    events: broadcast::Sender<ManagerMessage>,
    kick: broadcast::Sender<()>,
}

impl ScriptedSwitch {
    async fn launch() -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let (kick, _) = broadcast::channel(4);
        let switch = Arc::new(Self {
            addr,
            actions: Mutex::new(actions_rx),
            events: events.clone(),
            kick: kick.clone(),
        });
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_conn(
                    stream,
                    actions_tx.clone(),
                    events.subscribe(),
                    kick.subscribe(),
                ));
            }
        });
        switch
    }

    fn settings(&self, secret: &str) -> ConnectionSettings {
        ConnectionSettings::new("127.0.0.1", self.addr.port(), "monitor", secret)
    }

    fn emit(&self, event: ManagerMessage) {
        let _ = self.events.send(event);
    }

    /// Drops every open connection.
    fn kick_all(&self) {
        let _ = self.kick.send(());
    }

    async fn expect_action(&self, name: &str) -> ManagerMessage {
        let mut actions = self.actions.lock().await;
        loop {
            let action = tokio::time::timeout(Duration::from_secs(3), actions.recv())
                .await
                .expect("action timeout")
                .expect("switch stopped");
            if action.header("Action") == Some(name) {
                return action;
            }
        }
    }
}

async fn serve_conn(
    stream: TcpStream,
    actions: mpsc::UnboundedSender<ManagerMessage>,
    mut events: broadcast::Receiver<ManagerMessage>,
    mut kick: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = stream.into_split();
    if writer
        .write_all(b"Asterisk Call Manager/5.0.1\r\n")
        .await
        .is_err()
    {
        return;
    }
    let mut decoder = ManagerFrameDecoder::default();
    let mut buf = vec![0u8; 4096];
    let mut streaming = false;
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let read = match read {
                    Ok(0) | Err(_) => return,
                    Ok(read) => read,
                };
                for action in decoder.push_chunk(&buf[..read]).frames {
                    let mut reply = ManagerMessage::new()
                        .with_header("ActionID", action.action_id().unwrap_or_default());
                    if action.header("Action") == Some("Login") {
                        if action.header("Secret") == Some(SECRET) {
                            reply.set_header("Response", "Success");
                            reply.set_header("Message", "Authentication accepted");
                            streaming = action.header("Events") != Some("off");
                        } else {
                            reply.set_header("Response", "Error");
                            reply.set_header("Message", "Authentication failed");
                        }
                    } else {
                        reply.set_header("Response", "Success");
                    }
                    let _ = actions.send(action);
                    if writer.write_all(&reply.encode()).await.is_err() {
                        return;
                    }
                }
            }
            event = events.recv() => match event {
                Ok(event) if streaming => {
                    if writer.write_all(&event.encode()).await.is_err() {
                        return;
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = kick.recv() => return,
        }
    }
}

fn fast_config() -> SwitchboardConfig {
    SwitchboardConfig {
        session: SessionConfig {
            test_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            backoff_initial: Duration::from_millis(50),
            backoff_max: Duration::from_millis(200),
            ..SessionConfig::default()
        },
        ..SwitchboardConfig::default()
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn member_added(queue: &str, interface: &str) -> ManagerMessage {
    ManagerMessage::event("QueueMemberAdded")
        .with_header("Queue", queue)
        .with_header("Interface", interface)
        .with_header("MemberName", "Front Desk")
        .with_header("Status", "1")
        .with_header("Paused", "0")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_reports_success_and_bad_credentials() {
    let switch = ScriptedSwitch::launch().await;
    let board = Switchboard::start(fast_config());

    let report = board.test_connection(&switch.settings(SECRET), None).await;
    assert!(report.success, "{}", report.message);
    let login = switch.expect_action("Login").await;
    assert_eq!(login.header("Events"), Some("off"));

    let report = board.test_connection(&switch.settings("wrong"), None).await;
    assert!(!report.success);
    assert_eq!(report.failure, Some(FailureKind::Authentication));
    assert!(report.message.contains("Authentication failed"));

    assert!(!board.is_connected());
    assert_eq!(board.state(), SessionState::Disconnected);
    board.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_syncs_and_streams_events_into_the_store() {
    let switch = ScriptedSwitch::launch().await;
    let board = Switchboard::start(fast_config());

    let report = board.connect(switch.settings(SECRET)).await;
    assert!(report.success, "{}", report.message);
    assert!(board.is_connected());
    switch.expect_action("QueueStatus").await;

    switch.emit(
        ManagerMessage::event("QueueCallerJoin")
            .with_header("Queue", "support")
            .with_header("Uniqueid", "1700000000.1")
            .with_header("CallerIDNum", "5551234")
            .with_header("Position", "1"),
    );
    let probe = board.clone();
    wait_until(move || {
        let board = probe.clone();
        async move {
            board
                .queue_stats()
                .await
                .get("support")
                .is_some_and(|queue| queue.offered == 1)
        }
    })
    .await;
    let snapshot = board.snapshot().await;
    assert_eq!(snapshot.queued_calls.len(), 1);
    assert_eq!(snapshot.queued_calls[0].caller_number.as_deref(), Some("5551234"));

    board.close().await;
    assert_eq!(board.state(), SessionState::Disconnected);
    board.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_goes_to_the_switch_and_lands_on_confirmation() {
    let switch = ScriptedSwitch::launch().await;
    let board = Switchboard::start(fast_config());
    assert!(board.connect(switch.settings(SECRET)).await.success);
    switch.expect_action("QueueStatus").await;

    switch.emit(member_added("support", "SIP/1001"));
    let probe = board.clone();
    wait_until(move || {
        let board = probe.clone();
        async move { board.agent_stats().await.contains_key("1001") }
    })
    .await;

    board
        .pause_agent("1001", Some("lunch"))
        .await
        .expect("pause request");
    let action = switch.expect_action("QueuePause").await;
    assert_eq!(action.header("Interface"), Some("SIP/1001"));
    assert_eq!(action.header("Paused"), Some("true"));
    assert_eq!(action.header("Reason"), Some("lunch"));
    assert_eq!(
        board.agent_stats().await["1001"].status,
        AgentStatus::Available
    );

    switch.emit(
        ManagerMessage::event("QueueMemberPause")
            .with_header("Queue", "support")
            .with_header("Interface", "SIP/1001")
            .with_header("Paused", "1")
            .with_header("PausedReason", "lunch"),
    );
    let probe = board.clone();
    wait_until(move || {
        let board = probe.clone();
        async move { board.agent_stats().await["1001"].status == AgentStatus::Paused }
    })
    .await;

    let err = board
        .pause_agent("ghost", None)
        .await
        .expect_err("unknown agent");
    assert!(matches!(err, CommandError::UnknownAgent(_)));

    board.unpause_agent("1001").await.expect("unpause request");
    let action = switch.expect_action("QueuePause").await;
    assert_eq!(action.header("Paused"), Some("false"));

    board.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_connect_keeps_the_existing_session() {
    let switch = ScriptedSwitch::launch().await;
    let board = Switchboard::start(fast_config());
    assert!(board.connect(switch.settings(SECRET)).await.success);

    let report = board.connect(switch.settings("wrong")).await;
    assert!(!report.success);
    assert_eq!(report.failure, Some(FailureKind::Authentication));
    assert!(board.is_connected());
    let recorded = board.session().settings().await.expect("settings");
    assert_eq!(recorded.password, SECRET);

    board.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_needs_recorded_settings() {
    let switch = ScriptedSwitch::launch().await;
    let board = Switchboard::start(fast_config());

    let report = board.reconnect().await;
    assert!(!report.success);
    assert!(report.message.contains("no connection settings"));

    assert!(board.connect(switch.settings(SECRET)).await.success);
    board.close().await;
    assert!(!board.is_connected());

    let report = board.reconnect().await;
    assert!(report.success, "{}", report.message);
    assert!(board.is_connected());
    board.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_link_is_reestablished_in_the_background() {
    let switch = ScriptedSwitch::launch().await;
    let board = Switchboard::start(fast_config());
    assert!(board.connect(switch.settings(SECRET)).await.success);
    switch.expect_action("QueueStatus").await;

    switch.kick_all();
    // Every fresh login is followed by a resync.
    let login = switch.expect_action("Login").await;
    assert_eq!(login.header("Events"), Some("on"));
    switch.expect_action("QueueStatus").await;
    let probe = board.clone();
    wait_until(move || {
        let board = probe.clone();
        async move { board.is_connected() }
    })
    .await;

    switch.emit(member_added("sales", "PJSIP/2002"));
    let probe = board.clone();
    wait_until(move || {
        let board = probe.clone();
        async move { board.agent_stats().await.contains_key("2002") }
    })
    .await;

    board.close().await;
    assert_eq!(board.state(), SessionState::Disconnected);
}
