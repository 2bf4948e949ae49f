//! Turns raw manager event blocks into `CallEvent`s.
//!
//! Pure and table driven: the event name picks a kind, then a shared
//! extractor reads whichever header aliases that record uses. Records the
//! engine does not track map to `None`. Missing or unparsable numbers read as
//! zero, so a bad field never drops the event.

use callboard_core::manager_frame::ManagerMessage;
use callboard_core::{CallEvent, CallEventKind};

/// Kind for a manager event name. Older switch releases use the legacy
/// names (`Join`, `Link`, ...), newer ones the `QueueCaller*`/`Bridge*` forms.
pub fn kind_for(event_name: &str) -> Option<CallEventKind> {
    let kind = match event_name.trim().to_ascii_lowercase().as_str() {
        "newchannel" => CallEventKind::ChannelCreated,
        "hangup" => CallEventKind::Hangup,
        "bridgeenter" | "bridge" | "link" => CallEventKind::Bridge,
        "bridgeleave" | "unlink" => CallEventKind::Unbridge,
        "queuecallerjoin" | "join" => CallEventKind::QueueJoin,
        "queuecallerleave" | "leave" => CallEventKind::QueueLeave,
        "queuecallerabandon" => CallEventKind::QueueAbandon,
        "agentconnect" => CallEventKind::AgentConnect,
        "agentcomplete" => CallEventKind::AgentComplete,
        "agentringnoanswer" => CallEventKind::AgentRingNoAnswer,
        "queuememberadded" => CallEventKind::MemberAdded,
        "queuememberremoved" => CallEventKind::MemberRemoved,
        "queuememberstatus" => CallEventKind::MemberStatus,
        "queuememberpause" | "queuememberpaused" => CallEventKind::MemberPause,
        "queueparams" => CallEventKind::QueueParams,
        "queuemember" => CallEventKind::QueueMember,
        "queueentry" => CallEventKind::QueueEntry,
        "queuestatuscomplete" => CallEventKind::QueueStatusComplete,
        _ => return None,
    };
    Some(kind)
}

pub fn normalize(raw: &ManagerMessage, received_at_ms: i64) -> Option<CallEvent> {
    let kind = kind_for(raw.event_name()?)?;
    let unique_id = first_header(raw, &["Uniqueid", "Uniqueid1", "UniqueID"]).unwrap_or_default();

    let mut event = CallEvent::new(kind, unique_id, received_at_ms);
    event.channel = first_header(raw, &["Channel", "Channel1"]);
    event.dest_channel = first_header(raw, &["DestChannel", "Channel2"]);
    event.caller_number = first_header(raw, &["CallerIDNum", "CallerID"]);
    event.caller_name = first_header(raw, &["CallerIDName"]);
    event.queue = first_header(raw, &["Queue"]);
    event.member_name = first_header(raw, &["MemberName", "Name"]);
    event.interface = first_header(raw, &["Interface", "Location", "StateInterface"]);
    event.member_id = event
        .interface
        .as_deref()
        .and_then(member_id_from_interface)
        .or_else(|| event.member_name.clone())
        .or_else(|| event.interface.clone());
    if event.member_id.is_none() && kind == CallEventKind::AgentConnect {
        event.member_id = event.dest_channel.as_deref().and_then(member_id_from_interface);
    }
    event.position = parse_u32(raw.header("Position"));
    event.hold_time = parse_u64(first_header_ref(raw, &["HoldTime", "Wait"]));
    event.ring_time = parse_u64(raw.header("RingTime"));
    event.talk_time = parse_u64(raw.header("TalkTime"));
    event.status_code = raw.header("Status").and_then(|value| value.trim().parse().ok());
    event.paused = raw.header("Paused").map(parse_flag);
    event.reason = first_header(raw, &["PausedReason", "Reason", "Cause-txt"]);
    event.strategy = first_header(raw, &["Strategy"]);
    Some(event)
}

/// Agent id from a device interface: the device part after the technology
/// prefix, without any `@context` or trailing `/suffix`.
/// `SIP/1001` and `Local/1001@from-queue/n` both give `1001`.
pub fn member_id_from_interface(interface: &str) -> Option<String> {
    let trimmed = interface.trim();
    if trimmed.is_empty() {
        return None;
    }
    let device = match trimmed.split_once('/') {
        Some((_, rest)) => rest,
        None => trimmed,
    };
    let device = device.split(['@', '/']).next().unwrap_or(device);
    // Channel names carry a `-<sequence>` suffix (`SIP/1001-0000002a`).
    let device = match device.rsplit_once('-') {
        Some((head, tail)) if !head.is_empty() && is_channel_sequence(tail) => head,
        _ => device,
    };
    let device = device.trim();
    if device.is_empty() {
        None
    } else {
        Some(device.to_string())
    }
}

fn is_channel_sequence(tail: &str) -> bool {
    tail.len() >= 6 && tail.chars().all(|ch| ch.is_ascii_hexdigit())
}

fn first_header_ref<'a>(raw: &'a ManagerMessage, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| raw.header(name))
        .map(str::trim)
        .find(|value| !value.is_empty())
}

fn first_header(raw: &ManagerMessage, names: &[&str]) -> Option<String> {
    first_header_ref(raw, names)
        .filter(|value| !value.eq_ignore_ascii_case("<unknown>"))
        .map(str::to_string)
}

fn parse_u64(value: Option<&str>) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

fn parse_u32(value: Option<&str>) -> u32 {
    value
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(0)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
