use async_trait::async_trait;
use callboard_core::manager_frame::ManagerMessage;
use callboard_core::{ConnectionSettings, FailureKind, SessionState};
use callboard_hub::{
    ManagerLink, ManagerTransport, SessionConfig, SessionError, Switchboard, SwitchboardConfig,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::net::TcpListener;

#[derive(Clone, Copy)]
enum LoginScript {
    Accept,
    Reject,
    Hang,
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Transport that never touches the network and counts link lifecycles.
struct CountingTransport {
    script: LoginScript,
    counters: Arc<Counters>,
}

struct CountingLink {
    script: LoginScript,
    counters: Arc<Counters>,
    closed: bool,
}

#[async_trait]
impl ManagerTransport for CountingTransport {
    async fn open(
        &self,
        _host: &str,
        _port: u16,
        _timeout: Duration,
    ) -> Result<Box<dyn ManagerLink>, SessionError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingLink {
            script: self.script,
            counters: self.counters.clone(),
            closed: false,
        }))
    }
}

#[async_trait]
impl ManagerLink for CountingLink {
    async fn login(&mut self, _username: &str, _secret: &str, _events: bool) -> Result<(), SessionError> {
        match self.script {
            LoginScript::Accept => Ok(()),
            LoginScript::Reject => Err(SessionError::Authentication("bad secret".to_string())),
            LoginScript::Hang => std::future::pending().await,
        }
    }

    async fn send(&mut self, _message: &ManagerMessage) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<ManagerMessage>, SessionError> {
        std::future::pending().await
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// The TCP probe runs before any link is opened, so the port must accept.
async fn reachable_settings() -> (TcpListener, ConnectionSettings) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    (
        listener,
        ConnectionSettings::new("127.0.0.1", port, "monitor", "secret"),
    )
}

fn board_with(script: LoginScript) -> (Arc<Switchboard>, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let transport = Arc::new(CountingTransport {
        script,
        counters: counters.clone(),
    });
    let config = SwitchboardConfig {
        session: SessionConfig {
            test_timeout: Duration::from_millis(300),
            connect_timeout: Duration::from_millis(300),
            ..SessionConfig::default()
        },
        ..SwitchboardConfig::default()
    };
    (Switchboard::with_transport(config, transport), counters)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_releases_the_link_exactly_once() {
    let (_listener, settings) = reachable_settings().await;
    let cases = [
        (LoginScript::Accept, None),
        (LoginScript::Reject, Some(FailureKind::Authentication)),
        (LoginScript::Hang, Some(FailureKind::TimedOut)),
    ];
    for (script, failure) in cases {
        let (board, counters) = board_with(script);
        let report = board
            .test_connection(&settings, Some(Duration::from_millis(300)))
            .await;
        assert_eq!(report.success, failure.is_none(), "{}", report.message);
        assert_eq!(report.failure, failure);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(!board.is_connected());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_endpoint_never_opens_a_link() {
    let (listener, settings) = reachable_settings().await;
    drop(listener);
    let (board, counters) = board_with(LoginScript::Accept);

    let report = board
        .test_connection(&settings, Some(Duration::from_millis(500)))
        .await;
    assert!(!report.success);
    assert_eq!(report.failure, Some(FailureKind::ConnectionRefused));
    assert_eq!(counters.opens.load(Ordering::SeqCst), 0);

    let report = board.connect(settings).await;
    assert!(!report.success);
    assert!(board.session().settings().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_and_close_release_both_links() {
    let (_listener, settings) = reachable_settings().await;
    let (board, counters) = board_with(LoginScript::Accept);

    let report = board.connect(settings.clone()).await;
    assert!(report.success, "{}", report.message);
    assert!(board.is_connected());
    // One throwaway test link, one live link still open.
    assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

    board.close().await;
    assert!(!board.is_connected());
    assert_eq!(counters.closes.load(Ordering::SeqCst), 2);

    board.close().await;
    assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hanging_login_on_connect_reports_timeout() {
    let (_listener, settings) = reachable_settings().await;
    let (board, counters) = board_with(LoginScript::Hang);

    let report = board.connect(settings).await;
    assert!(!report.success);
    assert_eq!(report.failure, Some(FailureKind::TimedOut));
    assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    assert!(!board.is_connected());
}

/// Logs in fine, then never completes a write.
struct StallingTransport {
    counters: Arc<Counters>,
}

struct StallingLink {
    counters: Arc<Counters>,
    closed: bool,
}

#[async_trait]
impl ManagerTransport for StallingTransport {
    async fn open(
        &self,
        _host: &str,
        _port: u16,
        _timeout: Duration,
    ) -> Result<Box<dyn ManagerLink>, SessionError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StallingLink {
            counters: self.counters.clone(),
            closed: false,
        }))
    }
}

#[async_trait]
impl ManagerLink for StallingLink {
    async fn login(&mut self, _username: &str, _secret: &str, _events: bool) -> Result<(), SessionError> {
        Ok(())
    }

    async fn send(&mut self, _message: &ManagerMessage) -> Result<(), SessionError> {
        std::future::pending().await
    }

    async fn next_message(&mut self) -> Result<Option<ManagerMessage>, SessionError> {
        std::future::pending().await
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn stalling_board(session: SessionConfig) -> (Arc<Switchboard>, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let transport = Arc::new(StallingTransport {
        counters: counters.clone(),
    });
    let config = SwitchboardConfig {
        session: SessionConfig {
            test_timeout: Duration::from_millis(300),
            connect_timeout: Duration::from_millis(300),
            ..session
        },
        ..SwitchboardConfig::default()
    };
    (Switchboard::with_transport(config, transport), counters)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_returns_while_a_write_is_stalled() {
    let (_listener, settings) = reachable_settings().await;
    let (board, counters) = stalling_board(SessionConfig {
        write_timeout: Duration::from_secs(60),
        ..SessionConfig::default()
    });

    let report = board.connect(settings).await;
    assert!(report.success, "{}", report.message);
    // Let the live task block inside its first write.
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(3), board.close())
        .await
        .expect("close must not wait on the stalled write");
    assert!(!board.is_connected());
    assert_eq!(board.state(), SessionState::Disconnected);
    assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn actions_are_refused_once_the_queue_is_full() {
    let (_listener, settings) = reachable_settings().await;
    let (board, _counters) = stalling_board(SessionConfig {
        write_timeout: Duration::from_secs(60),
        action_queue: 1,
        ..SessionConfig::default()
    });
    assert!(board.connect(settings).await.success);

    let session = board.session();
    tokio::time::timeout(Duration::from_secs(1), async {
        session
            .send_action(ManagerMessage::action("Ping"))
            .await
            .expect("first action fits");
        let err = session
            .send_action(ManagerMessage::action("Ping"))
            .await
            .expect_err("queue holds one action");
        assert!(matches!(err, SessionError::QueueFull));
    })
    .await
    .expect("send_action must not wait for queue space");

    tokio::time::timeout(Duration::from_secs(3), board.close())
        .await
        .expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_write_drops_the_link_and_reconnects() {
    let (_listener, settings) = reachable_settings().await;
    let (board, counters) = stalling_board(SessionConfig {
        write_timeout: Duration::from_millis(150),
        backoff_initial: Duration::from_millis(50),
        backoff_max: Duration::from_millis(100),
        ..SessionConfig::default()
    });
    assert!(board.connect(settings).await.success);

    // Test link, first live link, then at least one replacement.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while counters.opens.load(Ordering::SeqCst) < 3 {
        assert!(tokio::time::Instant::now() < deadline, "link never replaced");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(counters.closes.load(Ordering::SeqCst) >= 2);

    tokio::time::timeout(Duration::from_secs(3), board.close())
        .await
        .expect("close");
    assert_eq!(board.state(), SessionState::Disconnected);
}
