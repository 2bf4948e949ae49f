//! The seam between the session and the switch's manager interface.
//!
//! `AmiTransport` speaks the line protocol over TCP. Tests swap in scripted
//! transports to drive the session without a switch.

use crate::probe::connect_within;
use crate::session::SessionError;
use async_trait::async_trait;
use callboard_core::manager_frame::{next_action_id, ManagerFrameDecoder, ManagerMessage};
use callboard_core::FailureKind;
use std::{collections::VecDeque, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;
const LOGOFF_TIMEOUT: Duration = Duration::from_millis(500);

#[async_trait]
pub trait ManagerTransport: Send + Sync {
    async fn open(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn ManagerLink>, SessionError>;
}

/// One open connection to the manager interface.
#[async_trait]
pub trait ManagerLink: Send {
    /// Authenticates the link. `events` selects whether the switch should
    /// stream events on it afterwards.
    async fn login(&mut self, username: &str, secret: &str, events: bool)
        -> Result<(), SessionError>;

    async fn send(&mut self, message: &ManagerMessage) -> Result<(), SessionError>;

    /// Next inbound block, or `None` once the switch closed the link. Must be
    /// cancel-safe: it is polled inside `select!`.
    async fn next_message(&mut self) -> Result<Option<ManagerMessage>, SessionError>;

    /// Releases the connection. Safe to call more than once.
    async fn close(&mut self);
}

#[derive(Debug, Clone, Default)]
pub struct AmiTransport;

impl AmiTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ManagerTransport for AmiTransport {
    async fn open(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn ManagerLink>, SessionError> {
        let stream = connect_within(host, port, timeout)
            .await
            .map_err(|failure| SessionError::Transport {
                kind: failure.kind,
                message: failure.message(host, port),
            })?;
        let mut link = AmiLink::new(stream);
        match tokio::time::timeout(timeout, link.read_greeting()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                link.close().await;
                return Err(err);
            }
            Err(_) => {
                link.close().await;
                return Err(SessionError::Timeout(timeout));
            }
        }
        debug!(event = "ami_open", host = host, port = port, greeting = %link.greeting);
        Ok(Box::new(link))
    }
}

pub struct AmiLink {
    stream: TcpStream,
    decoder: ManagerFrameDecoder,
    inbound: VecDeque<ManagerMessage>,
    greeting: String,
    logged_in: bool,
    closed: bool,
}

impl AmiLink {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            decoder: ManagerFrameDecoder::default(),
            inbound: VecDeque::new(),
            greeting: String::new(),
            logged_in: false,
            closed: false,
        }
    }

    /// The switch opens with a single identification line before any block.
    async fn read_greeting(&mut self) -> Result<(), SessionError> {
        let mut buffered = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            if let Some(idx) = buffered.iter().position(|byte| *byte == b'\n') {
                let rest = buffered.split_off(idx + 1);
                self.greeting = String::from_utf8_lossy(&buffered).trim().to_string();
                self.accept_bytes(&rest);
                return Ok(());
            }
            if buffered.len() > 4096 {
                return Err(SessionError::Protocol(
                    "greeting line exceeds 4096 bytes".to_string(),
                ));
            }
            let read = self.stream.read(&mut chunk).await.map_err(io_error)?;
            if read == 0 {
                return Err(SessionError::Transport {
                    kind: FailureKind::Other,
                    message: "connection closed before the manager greeting".to_string(),
                });
            }
            buffered.extend_from_slice(&chunk[..read]);
        }
    }

    fn accept_bytes(&mut self, bytes: &[u8]) {
        let report = self.decoder.push_chunk(bytes);
        for err in report.errors {
            warn!(event = "ami_frame_error", error = %err);
        }
        self.inbound.extend(report.frames);
    }
}

#[async_trait]
impl ManagerLink for AmiLink {
    async fn login(
        &mut self,
        username: &str,
        secret: &str,
        events: bool,
    ) -> Result<(), SessionError> {
        let action_id = next_action_id();
        let login = ManagerMessage::action("Login")
            .with_header("ActionID", action_id.clone())
            .with_header("Username", username)
            .with_header("Secret", secret)
            .with_header("Events", if events { "on" } else { "off" });
        self.send(&login).await?;

        loop {
            let Some(message) = self.next_message().await? else {
                return Err(SessionError::Transport {
                    kind: FailureKind::Other,
                    message: "connection closed during login".to_string(),
                });
            };
            if message.action_id() != Some(action_id.as_str()) {
                continue;
            }
            match message.response() {
                Some(response) if response.eq_ignore_ascii_case("success") => {
                    self.logged_in = true;
                    return Ok(());
                }
                Some(response) if response.eq_ignore_ascii_case("error") => {
                    let reason = message
                        .header("Message")
                        .unwrap_or("Authentication failed")
                        .to_string();
                    return Err(SessionError::Authentication(reason));
                }
                other => {
                    return Err(SessionError::Protocol(format!(
                        "unexpected login response: {}",
                        other.unwrap_or("<none>")
                    )));
                }
            }
        }
    }

    async fn send(&mut self, message: &ManagerMessage) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.stream
            .write_all(&message.encode())
            .await
            .map_err(io_error)?;
        self.stream.flush().await.map_err(io_error)
    }

    async fn next_message(&mut self) -> Result<Option<ManagerMessage>, SessionError> {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            if let Some(message) = self.inbound.pop_front() {
                return Ok(Some(message));
            }
            if self.closed {
                return Ok(None);
            }
            let read = self.stream.read(&mut chunk).await.map_err(io_error)?;
            if read == 0 {
                return Ok(None);
            }
            self.accept_bytes(&chunk[..read]);
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.logged_in {
            let logoff =
                ManagerMessage::action("Logoff").with_header("ActionID", next_action_id());
            let _ = tokio::time::timeout(LOGOFF_TIMEOUT, self.stream.write_all(&logoff.encode()))
                .await;
        }
        self.closed = true;
        let _ = self.stream.shutdown().await;
    }
}

fn io_error(err: std::io::Error) -> SessionError {
    SessionError::Transport {
        kind: crate::probe::classify_io_error(&err),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    /// Accepts one connection, greets, and answers the login by secret.
    async fn scripted_switch(expected_secret: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read, mut write) = stream.into_split();
            write
                .write_all(b"Asterisk Call Manager/5.0.1\r\n")
                .await
                .expect("greet");
            let mut lines = BufReader::new(read).lines();
            let mut action_id = String::new();
            let mut secret = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    break;
                }
                if let Some(value) = line.strip_prefix("ActionID: ") {
                    action_id = value.to_string();
                }
                if let Some(value) = line.strip_prefix("Secret: ") {
                    secret = value.to_string();
                }
            }
            let reply = if secret == expected_secret {
                format!(
                    "Response: Success\r\nActionID: {action_id}\r\nMessage: Authentication accepted\r\n\r\nEvent: FullyBooted\r\n\r\n"
                )
            } else {
                format!(
                    "Response: Error\r\nActionID: {action_id}\r\nMessage: Authentication failed\r\n\r\n"
                )
            };
            let _ = write.write_all(reply.as_bytes()).await;
            // Hold the connection until the client hangs up.
            let mut rest = lines.into_inner();
            let mut sink = Vec::new();
            let _ = rest.read_to_end(&mut sink).await;
        });
        port
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn login_success_then_events_flow() {
        let port = scripted_switch("s3cret").await;
        let mut link = AmiTransport::new()
            .open("127.0.0.1", port, Duration::from_secs(2))
            .await
            .expect("open");
        link.login("admin", "s3cret", true).await.expect("login");
        let event = link.next_message().await.expect("read").expect("event");
        assert_eq!(event.event_name(), Some("FullyBooted"));
        link.close().await;
        link.close().await;
        assert!(matches!(
            link.send(&ManagerMessage::action("Ping")).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_login_is_an_authentication_error() {
        let port = scripted_switch("s3cret").await;
        let mut link = AmiTransport::new()
            .open("127.0.0.1", port, Duration::from_secs(2))
            .await
            .expect("open");
        let err = link
            .login("admin", "wrong", false)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SessionError::Authentication(_)), "{err:?}");
        assert_eq!(err.failure_kind(), FailureKind::Authentication);
        link.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refused_open_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let err = match AmiTransport::new()
            .open("127.0.0.1", port, Duration::from_secs(2))
            .await
        {
            Ok(_) => panic!("nothing listens on {port}"),
            Err(err) => err,
        };
        assert_eq!(err.failure_kind(), FailureKind::ConnectionRefused);
    }
}
