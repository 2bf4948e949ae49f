use crate::{AgentStats, CallEventKind, CallRecord, FrameError, QueueStats, SessionState};
use serde::{Deserialize, Serialize};

pub const PUSH_PROTOCOL_VERSION: u16 = 1;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_PUSH_BYTES: usize = 4 * 1024 * 1024;

/// Server to client message on the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushEnvelope {
    pub version: u16,
    pub seq: u64,
    pub timestamp: String,
    #[serde(flatten)]
    pub msg: PushMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum PushMsg {
    State(StatePayload),
    Stats(StatsSnapshot),
    Event(EventPayload),
    Error(ErrorPayload),
    AgentDetails(AgentDetailsPayload),
    QueueDetails(QueueDetailsPayload),
}

impl PushMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            PushMsg::State(_) => "state",
            PushMsg::Stats(_) => "stats",
            PushMsg::Event(_) => "event",
            PushMsg::Error(_) => "error",
            PushMsg::AgentDetails(_) => "agentDetails",
            PushMsg::QueueDetails(_) => "queueDetails",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatePayload {
    pub connected: bool,
    pub reconnecting: bool,
    pub state: SessionState,
}

impl From<SessionState> for StatePayload {
    fn from(state: SessionState) -> Self {
        Self {
            connected: state == SessionState::Connected,
            reconnecting: state == SessionState::Reconnecting,
            state,
        }
    }
}

/// Full aggregate state. Collections are sorted so two snapshots of the same
/// state serialize identically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub agents: Vec<AgentStats>,
    pub queues: Vec<QueueStats>,
    pub active_calls: Vec<CallRecord>,
    pub queued_calls: Vec<CallRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub event_type: CallEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<CallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentDetailsPayload {
    pub agent: AgentStats,
    #[serde(default)]
    pub active_calls: Vec<CallRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueDetailsPayload {
    pub queue: QueueStats,
    #[serde(default)]
    pub waiting: Vec<CallRecord>,
    #[serde(default)]
    pub agents: Vec<AgentStats>,
}

/// Client to server command, tagged by its `command` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ClientCommand {
    GetStats,
    GetAgentDetails {
        #[serde(rename = "agentId")]
        agent_id: String,
    },
    GetQueueDetails {
        #[serde(rename = "queueId")]
        queue_id: String,
    },
    PauseAgent {
        #[serde(rename = "agentId")]
        agent_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    UnpauseAgent {
        #[serde(rename = "agentId")]
        agent_id: String,
    },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::GetStats => "getStats",
            ClientCommand::GetAgentDetails { .. } => "getAgentDetails",
            ClientCommand::GetQueueDetails { .. } => "getQueueDetails",
            ClientCommand::PauseAgent { .. } => "pauseAgent",
            ClientCommand::UnpauseAgent { .. } => "unpauseAgent",
        }
    }
}

pub fn encode_push(envelope: &PushEnvelope, max_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(envelope).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_command(bytes: &[u8], max_bytes: usize) -> Result<ClientCommand, FrameError> {
    if bytes.len() > max_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_bytes,
        });
    }
    serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))
}
