use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod manager_frame;
pub mod push_wire;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    fn push_frame(&mut self, frame: T) {
        self.frames.push(frame);
    }

    fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }
}

/// Kinds of normalized occurrences the aggregation engine reacts to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum CallEventKind {
    ChannelCreated,
    Hangup,
    Bridge,
    Unbridge,
    QueueJoin,
    QueueLeave,
    QueueAbandon,
    AgentConnect,
    AgentComplete,
    AgentRingNoAnswer,
    MemberAdded,
    MemberRemoved,
    MemberStatus,
    MemberPause,
    QueueParams,
    QueueMember,
    QueueEntry,
    QueueStatusComplete,
}

impl CallEventKind {
    pub const ALL: [CallEventKind; 18] = [
        CallEventKind::ChannelCreated,
        CallEventKind::Hangup,
        CallEventKind::Bridge,
        CallEventKind::Unbridge,
        CallEventKind::QueueJoin,
        CallEventKind::QueueLeave,
        CallEventKind::QueueAbandon,
        CallEventKind::AgentConnect,
        CallEventKind::AgentComplete,
        CallEventKind::AgentRingNoAnswer,
        CallEventKind::MemberAdded,
        CallEventKind::MemberRemoved,
        CallEventKind::MemberStatus,
        CallEventKind::MemberPause,
        CallEventKind::QueueParams,
        CallEventKind::QueueMember,
        CallEventKind::QueueEntry,
        CallEventKind::QueueStatusComplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallEventKind::ChannelCreated => "channel-created",
            CallEventKind::Hangup => "hangup",
            CallEventKind::Bridge => "bridge",
            CallEventKind::Unbridge => "unbridge",
            CallEventKind::QueueJoin => "queue-join",
            CallEventKind::QueueLeave => "queue-leave",
            CallEventKind::QueueAbandon => "queue-abandon",
            CallEventKind::AgentConnect => "agent-connect",
            CallEventKind::AgentComplete => "agent-complete",
            CallEventKind::AgentRingNoAnswer => "agent-ring-no-answer",
            CallEventKind::MemberAdded => "member-added",
            CallEventKind::MemberRemoved => "member-removed",
            CallEventKind::MemberStatus => "member-status",
            CallEventKind::MemberPause => "member-pause",
            CallEventKind::QueueParams => "queue-params",
            CallEventKind::QueueMember => "queue-member",
            CallEventKind::QueueEntry => "queue-entry",
            CallEventKind::QueueStatusComplete => "queue-status-complete",
        }
    }

    /// Member-scoped events carry an agent rather than a call in push messages.
    pub fn is_member_scoped(&self) -> bool {
        matches!(
            self,
            CallEventKind::MemberAdded
                | CallEventKind::MemberRemoved
                | CallEventKind::MemberStatus
                | CallEventKind::MemberPause
                | CallEventKind::QueueMember
                | CallEventKind::AgentRingNoAnswer
        )
    }
}

impl fmt::Display for CallEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallEventKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('_', "-");
        CallEventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Unknown event kind: {input}"))
    }
}

/// One normalized occurrence in the life of a call or queue member.
///
/// Built once from a raw manager record and never mutated afterwards. Numeric
/// durations are whole seconds; `timestamp_ms` is the receive time in
/// milliseconds since the Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallEvent {
    pub kind: CallEventKind,
    pub unique_id: String,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default)]
    pub position: u32,
    #[serde(default)]
    pub hold_time: u64,
    #[serde(default)]
    pub ring_time: u64,
    #[serde(default)]
    pub talk_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

impl CallEvent {
    pub fn new(kind: CallEventKind, unique_id: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            kind,
            unique_id: unique_id.into(),
            timestamp_ms,
            caller_number: None,
            caller_name: None,
            channel: None,
            dest_channel: None,
            queue: None,
            member_id: None,
            member_name: None,
            interface: None,
            position: 0,
            hold_time: 0,
            ring_time: 0,
            talk_time: 0,
            status_code: None,
            paused: None,
            reason: None,
            strategy: None,
        }
    }
}

/// Fixed agent status vocabulary that switch device codes are folded into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum AgentStatus {
    Available,
    InUse,
    Paused,
    Unavailable,
    Ringing,
    #[default]
    Unknown,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Available => "Available",
            AgentStatus::InUse => "InUse",
            AgentStatus::Paused => "Paused",
            AgentStatus::Unavailable => "Unavailable",
            AgentStatus::Ringing => "Ringing",
            AgentStatus::Unknown => "Unknown",
        }
    }

    /// Maps a switch device-state code onto the fixed vocabulary.
    pub fn from_device_code(code: u32) -> Self {
        match code {
            1 => AgentStatus::Available,
            2 | 3 | 8 => AgentStatus::InUse,
            4 | 5 => AgentStatus::Unavailable,
            6 | 7 => AgentStatus::Ringing,
            _ => AgentStatus::Unknown,
        }
    }

    /// Logged in and able to take or currently handling calls.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AgentStatus::Available | AgentStatus::InUse | AgentStatus::Ringing
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "available" => Ok(AgentStatus::Available),
            "inuse" | "in-use" | "in_use" | "in use" => Ok(AgentStatus::InUse),
            "paused" => Ok(AgentStatus::Paused),
            "unavailable" => Ok(AgentStatus::Unavailable),
            "ringing" => Ok(AgentStatus::Ringing),
            "unknown" => Ok(AgentStatus::Unknown),
            other => Err(format!("Unknown agent status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub strategy: String,
    pub offered: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub service_level: f64,
    pub avg_wait_time: f64,
    pub max_wait_time: u64,
    pub avg_talk_time: f64,
    pub max_talk_time: u64,
    pub agent_count: u32,
    pub active_agents: u32,
    #[serde(default)]
    pub answered: u64,
    #[serde(default)]
    pub answered_within_sla: u64,
    #[serde(default)]
    pub wait_samples: u64,
    #[serde(default)]
    pub talk_samples: u64,
}

impl QueueStats {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            strategy: String::new(),
            offered: 0,
            completed: 0,
            abandoned: 0,
            service_level: 0.0,
            avg_wait_time: 0.0,
            max_wait_time: 0,
            avg_talk_time: 0.0,
            max_talk_time: 0,
            agent_count: 0,
            active_agents: 0,
            answered: 0,
            answered_within_sla: 0,
            wait_samples: 0,
            talk_samples: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub status: AgentStatus,
    /// Last status reported by the device, restored when a pause ends.
    #[serde(default)]
    pub device_status: AgentStatus,
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_since_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_call_ms: Option<i64>,
    pub calls_taken: u64,
    pub calls_abandoned: u64,
    pub avg_talk_time: f64,
    pub total_talk_time: u64,
    pub total_pause_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_ms: Option<i64>,
    #[serde(default)]
    pub queues: BTreeSet<String>,
}

impl AgentStats {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            interface: None,
            status: AgentStatus::Unknown,
            device_status: AgentStatus::Unknown,
            paused: false,
            pause_reason: None,
            paused_since_ms: None,
            last_call_ms: None,
            calls_taken: 0,
            calls_abandoned: 0,
            avg_talk_time: 0.0,
            total_talk_time: 0,
            total_pause_time: 0,
            login_ms: None,
            queues: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CallOutcome {
    #[default]
    Waiting,
    Active,
    Completed,
    Abandoned,
    LeftQueue,
    HungUp,
    /// No longer reported by the switch after a resync; its end was missed.
    Lost,
}

impl CallOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallOutcome::Waiting | CallOutcome::Active)
    }
}

/// A call with its live linkage: waiting in a queue, active with an agent, or
/// finished and kept in history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub unique_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridged_channel: Option<String>,
    #[serde(default)]
    pub position: u32,
    pub joined_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<i64>,
    #[serde(default)]
    pub hold_time: u64,
    #[serde(default)]
    pub talk_time: u64,
    #[serde(default)]
    pub outcome: CallOutcome,
    /// Counted as offered by this engine and not yet counted as completed or
    /// abandoned.
    #[serde(default, skip_serializing)]
    pub tracked: bool,
}

impl CallRecord {
    pub fn from_event(event: &CallEvent) -> Self {
        Self {
            unique_id: event.unique_id.clone(),
            caller_number: event.caller_number.clone(),
            caller_name: event.caller_name.clone(),
            channel: event.channel.clone(),
            queue: event.queue.clone(),
            agent_id: None,
            agent_name: None,
            bridged_channel: None,
            position: event.position,
            joined_at_ms: event.timestamp_ms,
            answered_at_ms: None,
            ended_at_ms: None,
            hold_time: event.hold_time,
            talk_time: event.talk_time,
            outcome: CallOutcome::Waiting,
            tracked: false,
        }
    }
}

/// Credentials for the switch's manager interface.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ConnectionSettings {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    ConnectionRefused,
    TimedOut,
    HostNotFound,
    Authentication,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ConnectionRefused => "connection-refused",
            FailureKind::TimedOut => "timed-out",
            FailureKind::HostNotFound => "host-not-found",
            FailureKind::Authentication => "authentication",
            FailureKind::Other => "other",
        }
    }

    /// Failures where a port/DNS sweep tells the operator something useful.
    pub fn wants_diagnostics(&self) -> bool {
        matches!(self, FailureKind::ConnectionRefused | FailureKind::TimedOut)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured outcome of connect/test operations. Failures are reported here
/// rather than raised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_info: Option<String>,
}

impl ConnectionReport {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            failure: None,
            diagnostic_info: None,
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            failure: Some(kind),
            diagnostic_info: None,
        }
    }

    pub fn with_diagnostics(mut self, info: impl Into<String>) -> Self {
        self.diagnostic_info = Some(info.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Reconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
