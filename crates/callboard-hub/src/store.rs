//! Authoritative call-center state: queues, agents, waiting and active calls,
//! and a bounded history of finished calls.
//!
//! All mutation goes through `apply`, which dispatches on the event kind.
//! Counters only move for calls this store saw join a queue, so a restart in
//! the middle of a call never double counts.
//!
//! After a re-login the switch replays its queue status. `begin_resync` marks
//! every waiting and active call; entries in the replay clear the mark, and
//! whatever is still marked at `QueueStatusComplete` is retired as `Lost`.

use callboard_core::push_wire::{AgentDetailsPayload, QueueDetailsPayload, StatsSnapshot};
use callboard_core::{
    AgentStats, AgentStatus, CallEvent, CallEventKind, CallOutcome, CallRecord, QueueStats,
};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;
pub const DEFAULT_SLA_SECONDS: u64 = 20;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub history_capacity: usize,
    pub sla_threshold_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            sla_threshold_secs: DEFAULT_SLA_SECONDS,
        }
    }
}

/// What one event changed, for the push layer.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreUpdate {
    pub kind: CallEventKind,
    pub call: Option<CallRecord>,
    pub agent: Option<AgentStats>,
}

#[derive(Debug, Default)]
struct Touched {
    call: Option<CallRecord>,
    agent: Option<AgentStats>,
}

impl Touched {
    fn call(record: CallRecord) -> Self {
        Self {
            call: Some(record),
            agent: None,
        }
    }

    fn agent(agent: Option<AgentStats>) -> Self {
        Self { call: None, agent }
    }
}

type EventHandler = fn(&mut AggregateStateStore, &CallEvent) -> Touched;

fn handler_for(kind: CallEventKind) -> EventHandler {
    match kind {
        CallEventKind::ChannelCreated => AggregateStateStore::on_channel_created,
        CallEventKind::Hangup => AggregateStateStore::on_hangup,
        CallEventKind::Bridge => AggregateStateStore::on_bridge,
        CallEventKind::Unbridge => AggregateStateStore::on_unbridge,
        CallEventKind::QueueJoin => AggregateStateStore::on_queue_join,
        CallEventKind::QueueLeave => AggregateStateStore::on_queue_leave,
        CallEventKind::QueueAbandon => AggregateStateStore::on_queue_abandon,
        CallEventKind::AgentConnect => AggregateStateStore::on_agent_connect,
        CallEventKind::AgentComplete => AggregateStateStore::on_agent_complete,
        CallEventKind::AgentRingNoAnswer => AggregateStateStore::on_agent_ring_no_answer,
        CallEventKind::MemberAdded => AggregateStateStore::on_member_added,
        CallEventKind::MemberRemoved => AggregateStateStore::on_member_removed,
        CallEventKind::MemberStatus => AggregateStateStore::on_member_status,
        CallEventKind::MemberPause => AggregateStateStore::on_member_pause,
        CallEventKind::QueueParams => AggregateStateStore::on_queue_params,
        CallEventKind::QueueMember => AggregateStateStore::on_queue_member,
        CallEventKind::QueueEntry => AggregateStateStore::on_queue_entry,
        CallEventKind::QueueStatusComplete => AggregateStateStore::on_queue_status_complete,
    }
}

/// Calls not yet confirmed by the status replay in progress.
#[derive(Debug, Default)]
struct Resync {
    queued: HashSet<String>,
    active: HashSet<String>,
}

#[derive(Debug)]
pub struct AggregateStateStore {
    config: StoreConfig,
    queues: HashMap<String, QueueStats>,
    agents: HashMap<String, AgentStats>,
    active_calls: HashMap<String, CallRecord>,
    queued_calls: HashMap<String, VecDeque<CallRecord>>,
    history: VecDeque<CallRecord>,
    resync: Option<Resync>,
}

impl Default for AggregateStateStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl AggregateStateStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            queues: HashMap::new(),
            agents: HashMap::new(),
            active_calls: HashMap::new(),
            queued_calls: HashMap::new(),
            history: VecDeque::new(),
            resync: None,
        }
    }

    pub fn apply(&mut self, event: &CallEvent) -> StoreUpdate {
        let touched = handler_for(event.kind)(self, event);
        debug!(
            event = "store_applied",
            kind = %event.kind,
            unique_id = %event.unique_id,
            queue = event.queue.as_deref().unwrap_or_default(),
            member = event.member_id.as_deref().unwrap_or_default()
        );
        StoreUpdate {
            kind: event.kind,
            call: touched.call,
            agent: touched.agent,
        }
    }

    /// Marks every current call as unconfirmed until the next
    /// `QueueStatusComplete`. A second call restarts the marking.
    pub fn begin_resync(&mut self) {
        let queued = self
            .queued_calls
            .values()
            .flat_map(|calls| calls.iter().map(|call| call.unique_id.clone()))
            .collect();
        let active = self.active_calls.keys().cloned().collect();
        self.resync = Some(Resync { queued, active });
    }

    pub fn resync_pending(&self) -> bool {
        self.resync.is_some()
    }

    pub fn register_queue(&mut self, id: &str, name: Option<&str>, strategy: Option<&str>) {
        let queue = self.ensure_queue(id);
        if let Some(name) = name.filter(|name| !name.trim().is_empty()) {
            queue.name = name.to_string();
        }
        if let Some(strategy) = strategy {
            queue.strategy = strategy.to_string();
        }
    }

    /// Drops the queue, its waiting calls, and every agent's membership in it.
    pub fn remove_queue(&mut self, id: &str) -> bool {
        let existed = self.queues.remove(id).is_some();
        self.queued_calls.remove(id);
        for agent in self.agents.values_mut() {
            agent.queues.remove(id);
        }
        existed
    }

    pub fn queue_stats(&self) -> HashMap<String, QueueStats> {
        self.queues.clone()
    }

    pub fn agent_stats(&self) -> HashMap<String, AgentStats> {
        self.agents.clone()
    }

    pub fn queue(&self, id: &str) -> Option<&QueueStats> {
        self.queues.get(id)
    }

    pub fn agent(&self, id: &str) -> Option<&AgentStats> {
        self.agents.get(id)
    }

    pub fn active_call(&self, unique_id: &str) -> Option<&CallRecord> {
        self.active_calls.get(unique_id)
    }

    pub fn waiting_calls(&self, queue_id: &str) -> Vec<CallRecord> {
        self.queued_calls
            .get(queue_id)
            .map(|calls| calls.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_call_count(&self) -> usize {
        self.active_calls.len()
    }

    pub fn queued_call_count(&self) -> usize {
        self.queued_calls.values().map(VecDeque::len).sum()
    }

    /// The `limit` most recent finished calls, oldest first.
    pub fn history(&self, limit: usize) -> Vec<CallRecord> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut agents = self.agents.values().cloned().collect::<Vec<_>>();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        let mut queues = self.queues.values().cloned().collect::<Vec<_>>();
        queues.sort_by(|a, b| a.id.cmp(&b.id));
        let mut active_calls = self.active_calls.values().cloned().collect::<Vec<_>>();
        active_calls.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        let mut queue_ids = self.queued_calls.keys().collect::<Vec<_>>();
        queue_ids.sort();
        let queued_calls = queue_ids
            .into_iter()
            .filter_map(|id| self.queued_calls.get(id))
            .flat_map(|calls| calls.iter().cloned())
            .collect();
        StatsSnapshot {
            agents,
            queues,
            active_calls,
            queued_calls,
        }
    }

    pub fn agent_details(&self, agent_id: &str) -> Option<AgentDetailsPayload> {
        let agent = self.agents.get(agent_id)?.clone();
        let mut active_calls = self
            .active_calls
            .values()
            .filter(|call| call.agent_id.as_deref() == Some(agent_id))
            .cloned()
            .collect::<Vec<_>>();
        active_calls.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        Some(AgentDetailsPayload {
            agent,
            active_calls,
        })
    }

    pub fn queue_details(&self, queue_id: &str) -> Option<QueueDetailsPayload> {
        let queue = self.queues.get(queue_id)?.clone();
        let mut agents = self
            .agents
            .values()
            .filter(|agent| agent.queues.contains(queue_id))
            .cloned()
            .collect::<Vec<_>>();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Some(QueueDetailsPayload {
            queue,
            waiting: self.waiting_calls(queue_id),
            agents,
        })
    }

    fn on_channel_created(&mut self, event: &CallEvent) -> Touched {
        Touched::call(CallRecord::from_event(event))
    }

    /// Active calls are only stamped here; agent-complete removes them.
    fn on_hangup(&mut self, event: &CallEvent) -> Touched {
        if let Some(call) = self.active_calls.get_mut(&event.unique_id) {
            call.ended_at_ms = Some(event.timestamp_ms);
            return Touched::call(call.clone());
        }
        if let Some(call) = self.find_waiting(&event.unique_id) {
            return Touched::call(call.clone());
        }
        let mut record = CallRecord::from_event(event);
        record.outcome = CallOutcome::HungUp;
        record.ended_at_ms = Some(event.timestamp_ms);
        Touched::call(record)
    }

    fn on_bridge(&mut self, event: &CallEvent) -> Touched {
        match self.active_calls.get_mut(&event.unique_id) {
            Some(call) => {
                call.bridged_channel = event.dest_channel.clone().or_else(|| event.channel.clone());
                Touched::call(call.clone())
            }
            None => Touched::call(CallRecord::from_event(event)),
        }
    }

    fn on_unbridge(&mut self, event: &CallEvent) -> Touched {
        match self.active_calls.get_mut(&event.unique_id) {
            Some(call) => {
                call.bridged_channel = None;
                Touched::call(call.clone())
            }
            None => Touched::call(CallRecord::from_event(event)),
        }
    }

    fn on_queue_join(&mut self, event: &CallEvent) -> Touched {
        let Some(queue_id) = event.queue.clone() else {
            return Touched::call(CallRecord::from_event(event));
        };
        if let Some(existing) = self.find_call(&event.unique_id) {
            return Touched::call(existing);
        }

        self.ensure_queue(&queue_id).offered += 1;
        let waiting = self.queued_calls.entry(queue_id).or_default();
        let mut record = CallRecord::from_event(event);
        record.outcome = CallOutcome::Waiting;
        record.tracked = true;
        if record.position == 0 {
            record.position = waiting.len() as u32 + 1;
        }
        waiting.push_back(record.clone());
        Touched::call(record)
    }

    /// The answered path: the caller left the queue for an agent.
    fn on_queue_leave(&mut self, event: &CallEvent) -> Touched {
        let Some(mut record) = self.take_waiting(event.queue.as_deref(), &event.unique_id) else {
            let current = self
                .active_calls
                .get(&event.unique_id)
                .cloned()
                .unwrap_or_else(|| CallRecord::from_event(event));
            return Touched::call(current);
        };

        if record.tracked {
            if let Some(queue) = record.queue.as_deref().and_then(|id| self.queues.get_mut(id)) {
                queue.completed += 1;
            }
            record.tracked = false;
        }
        record.outcome = CallOutcome::LeftQueue;
        record.ended_at_ms = Some(event.timestamp_ms);
        if record.hold_time == 0 {
            record.hold_time = elapsed_secs(record.joined_at_ms, event.timestamp_ms);
        }
        self.push_history(record.clone());
        Touched::call(record)
    }

    fn on_queue_abandon(&mut self, event: &CallEvent) -> Touched {
        let Some(mut record) = self.take_waiting(event.queue.as_deref(), &event.unique_id) else {
            return Touched::call(CallRecord::from_event(event));
        };

        record.hold_time = if event.hold_time > 0 {
            event.hold_time
        } else {
            elapsed_secs(record.joined_at_ms, event.timestamp_ms)
        };
        if record.tracked {
            let hold_time = record.hold_time;
            if let Some(queue) = record.queue.as_deref().and_then(|id| self.queues.get_mut(id)) {
                queue.abandoned += 1;
                fold_wait(queue, hold_time);
            }
            record.tracked = false;
        }
        record.outcome = CallOutcome::Abandoned;
        record.ended_at_ms = Some(event.timestamp_ms);
        self.push_history(record.clone());
        Touched::call(record)
    }

    fn on_agent_connect(&mut self, event: &CallEvent) -> Touched {
        if let Some(existing) = self.active_calls.get(&event.unique_id) {
            return Touched::call(existing.clone());
        }

        let queue_id = event.queue.as_deref();
        let taken = if event.unique_id.is_empty() {
            queue_id.and_then(|id| self.pop_waiting_head(id))
        } else {
            self.take_waiting(queue_id, &event.unique_id)
        };
        let mut record = taken.unwrap_or_else(|| {
            let mut synthetic = CallRecord::from_event(event);
            synthetic.joined_at_ms = event
                .timestamp_ms
                .saturating_sub((event.hold_time as i64).saturating_mul(1000));
            synthetic
        });
        if record.queue.is_none() {
            record.queue = event.queue.clone();
        }
        record.hold_time = if event.hold_time > 0 {
            event.hold_time
        } else {
            elapsed_secs(record.joined_at_ms, event.timestamp_ms)
        };
        record.answered_at_ms = Some(event.timestamp_ms);
        record.agent_id = event.member_id.clone();
        record.agent_name = event.member_name.clone().or_else(|| event.member_id.clone());
        record.bridged_channel = event.dest_channel.clone();
        record.outcome = CallOutcome::Active;

        if let Some(queue_id) = record.queue.clone() {
            let sla = self.config.sla_threshold_secs;
            let queue = self.ensure_queue(&queue_id);
            queue.answered += 1;
            if record.hold_time <= sla {
                queue.answered_within_sla += 1;
            }
            queue.service_level = queue.answered_within_sla as f64 / queue.answered as f64 * 100.0;
            fold_wait(queue, record.hold_time);
        }

        let agent = event.member_id.as_deref().map(|agent_id| {
            let agent = self.ensure_agent(agent_id, event);
            agent.status = AgentStatus::InUse;
            agent.calls_taken += 1;
            agent.last_call_ms = Some(event.timestamp_ms);
            agent.clone()
        });
        if let Some(agent) = &agent {
            self.refresh_agent_queues(agent);
        }

        let key = if record.unique_id.is_empty() {
            event.unique_id.clone()
        } else {
            record.unique_id.clone()
        };
        self.active_calls.insert(key, record.clone());
        Touched {
            call: Some(record),
            agent,
        }
    }

    fn on_agent_complete(&mut self, event: &CallEvent) -> Touched {
        let Some(mut record) = self.active_calls.remove(&event.unique_id) else {
            return Touched::call(CallRecord::from_event(event));
        };

        let talk_time = event.talk_time;
        record.talk_time = talk_time;
        record.ended_at_ms = Some(event.timestamp_ms);
        record.outcome = CallOutcome::Completed;

        if let Some(queue) = record
            .queue
            .clone()
            .as_deref()
            .and_then(|id| self.queues.get_mut(id))
        {
            if record.tracked {
                queue.completed += 1;
            }
            queue.talk_samples += 1;
            queue.avg_talk_time +=
                (talk_time as f64 - queue.avg_talk_time) / queue.talk_samples as f64;
            queue.max_talk_time = queue.max_talk_time.max(talk_time);
        }
        record.tracked = false;

        let agent_id = record.agent_id.clone().or_else(|| event.member_id.clone());
        let agent = agent_id.as_deref().map(|agent_id| {
            let agent = self.ensure_agent(agent_id, event);
            agent.total_talk_time += talk_time;
            agent.avg_talk_time = agent.total_talk_time as f64 / agent.calls_taken.max(1) as f64;
            agent.status = if agent.paused {
                AgentStatus::Paused
            } else {
                AgentStatus::Available
            };
            agent.last_call_ms = Some(event.timestamp_ms);
            agent.clone()
        });
        if let Some(agent) = &agent {
            self.refresh_agent_queues(agent);
        }

        self.push_history(record.clone());
        Touched {
            call: Some(record),
            agent,
        }
    }

    fn on_agent_ring_no_answer(&mut self, event: &CallEvent) -> Touched {
        let Some(agent_id) = event.member_id.as_deref() else {
            return Touched::default();
        };
        let agent = self.ensure_agent(agent_id, event);
        agent.calls_abandoned += 1;
        Touched::agent(Some(agent.clone()))
    }

    fn on_member_added(&mut self, event: &CallEvent) -> Touched {
        let (Some(agent_id), Some(queue_id)) = (event.member_id.as_deref(), event.queue.as_deref())
        else {
            return Touched::default();
        };
        self.ensure_queue(queue_id);
        let agent = self.ensure_agent(agent_id, event);
        if agent.login_ms.is_none() {
            agent.login_ms = Some(event.timestamp_ms);
        }
        apply_member_state(agent, event);
        let inserted = agent.queues.insert(queue_id.to_string());
        if inserted {
            if let Some(queue) = self.queues.get_mut(queue_id) {
                queue.agent_count += 1;
            }
        }
        self.recount_active_agents(queue_id);
        Touched::agent(self.agents.get(agent_id).cloned())
    }

    fn on_member_removed(&mut self, event: &CallEvent) -> Touched {
        let (Some(agent_id), Some(queue_id)) = (event.member_id.as_deref(), event.queue.as_deref())
        else {
            return Touched::default();
        };
        let removed = self
            .agents
            .get_mut(agent_id)
            .map(|agent| agent.queues.remove(queue_id))
            .unwrap_or(false);
        if removed {
            if let Some(queue) = self.queues.get_mut(queue_id) {
                queue.agent_count = queue.agent_count.saturating_sub(1);
            }
        }
        self.recount_active_agents(queue_id);
        Touched::agent(self.agents.get(agent_id).cloned())
    }

    fn on_member_status(&mut self, event: &CallEvent) -> Touched {
        let Some(agent_id) = event.member_id.as_deref() else {
            return Touched::default();
        };
        let agent = self.ensure_agent(agent_id, event);
        apply_member_state(agent, event);
        let agent = agent.clone();
        self.refresh_agent_queues(&agent);
        if let Some(queue_id) = event.queue.as_deref() {
            self.recount_active_agents(queue_id);
        }
        Touched::agent(Some(agent))
    }

    fn on_member_pause(&mut self, event: &CallEvent) -> Touched {
        let Some(agent_id) = event.member_id.as_deref() else {
            return Touched::default();
        };
        let agent = self.ensure_agent(agent_id, event);
        let paused = event.paused.unwrap_or(true);
        set_paused(agent, paused, event.reason.clone(), event.timestamp_ms);
        let agent = agent.clone();
        self.refresh_agent_queues(&agent);
        if let Some(queue_id) = event.queue.as_deref() {
            self.recount_active_agents(queue_id);
        }
        Touched::agent(Some(agent))
    }

    fn on_queue_params(&mut self, event: &CallEvent) -> Touched {
        if let Some(queue_id) = event.queue.as_deref() {
            let queue = self.ensure_queue(queue_id);
            if let Some(strategy) = &event.strategy {
                queue.strategy = strategy.clone();
            }
        }
        Touched::default()
    }

    /// A member listing from a status sync: membership plus current state.
    fn on_queue_member(&mut self, event: &CallEvent) -> Touched {
        self.on_member_added(event)
    }

    /// A caller listed by the status replay. Unknown callers are adopted
    /// untracked, so they never move the queue counters.
    fn on_queue_entry(&mut self, event: &CallEvent) -> Touched {
        if let Some(resync) = self.resync.as_mut() {
            resync.queued.remove(&event.unique_id);
            resync.active.remove(&event.unique_id);
        }
        let Some(queue_id) = event.queue.clone() else {
            return Touched::call(CallRecord::from_event(event));
        };
        if event.unique_id.is_empty() {
            return Touched::call(CallRecord::from_event(event));
        }
        if let Some(existing) = self.find_call(&event.unique_id) {
            return Touched::call(existing);
        }

        self.ensure_queue(&queue_id);
        let mut record = CallRecord::from_event(event);
        record.outcome = CallOutcome::Waiting;
        record.joined_at_ms = event
            .timestamp_ms
            .saturating_sub((event.hold_time as i64).saturating_mul(1000));
        let waiting = self.queued_calls.entry(queue_id).or_default();
        record.position = waiting.len() as u32 + 1;
        waiting.push_back(record.clone());
        Touched::call(record)
    }

    fn on_queue_status_complete(&mut self, event: &CallEvent) -> Touched {
        let Some(resync) = self.resync.take() else {
            return Touched::default();
        };
        let mut lost_queued = resync.queued.into_iter().collect::<Vec<_>>();
        lost_queued.sort();
        for unique_id in &lost_queued {
            if let Some(record) = self.take_waiting(None, unique_id) {
                self.retire_lost(record, event.timestamp_ms);
            }
        }

        let mut lost_active = resync
            .active
            .into_iter()
            .filter(|unique_id| self.active_call_is_stale(unique_id))
            .collect::<Vec<_>>();
        lost_active.sort();
        for unique_id in &lost_active {
            let Some(record) = self.active_calls.remove(unique_id) else {
                continue;
            };
            if let Some(agent_id) = record.agent_id.clone() {
                self.settle_agent(&agent_id);
            }
            self.retire_lost(record, event.timestamp_ms);
        }

        info!(
            event = "store_resync_complete",
            lost_queued = lost_queued.len(),
            lost_active = lost_active.len()
        );
        Touched::default()
    }

    /// Stale when its agent is known and the device no longer reports a call.
    fn active_call_is_stale(&self, unique_id: &str) -> bool {
        self.active_calls
            .get(unique_id)
            .and_then(|call| call.agent_id.as_deref())
            .and_then(|agent_id| self.agents.get(agent_id))
            .is_some_and(|agent| {
                !matches!(
                    agent.device_status,
                    AgentStatus::InUse | AgentStatus::Unknown
                )
            })
    }

    fn settle_agent(&mut self, agent_id: &str) {
        let still_busy = self
            .active_calls
            .values()
            .any(|call| call.agent_id.as_deref() == Some(agent_id));
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return;
        };
        if !still_busy {
            agent.status = settled_status(agent);
        }
        let agent = agent.clone();
        self.refresh_agent_queues(&agent);
    }

    fn retire_lost(&mut self, mut record: CallRecord, at_ms: i64) {
        record.outcome = CallOutcome::Lost;
        record.ended_at_ms = Some(at_ms);
        record.tracked = false;
        debug!(
            event = "store_call_lost",
            unique_id = %record.unique_id,
            queue = record.queue.as_deref().unwrap_or_default()
        );
        self.push_history(record);
    }

    fn ensure_queue(&mut self, id: &str) -> &mut QueueStats {
        self.queues
            .entry(id.to_string())
            .or_insert_with(|| QueueStats::new(id))
    }

    fn ensure_agent(&mut self, id: &str, event: &CallEvent) -> &mut AgentStats {
        let agent = self
            .agents
            .entry(id.to_string())
            .or_insert_with(|| AgentStats::new(id));
        if let Some(name) = event.member_name.as_deref().filter(|n| !n.is_empty()) {
            agent.name = name.to_string();
        }
        if let Some(interface) = event.interface.as_deref().filter(|i| !i.is_empty()) {
            agent.interface = Some(interface.to_string());
        }
        agent
    }

    fn find_waiting(&self, unique_id: &str) -> Option<&CallRecord> {
        self.queued_calls
            .values()
            .flat_map(|calls| calls.iter())
            .find(|call| call.unique_id == unique_id)
    }

    fn find_call(&self, unique_id: &str) -> Option<CallRecord> {
        self.active_calls
            .get(unique_id)
            .or_else(|| self.find_waiting(unique_id))
            .cloned()
    }

    /// Removes the call from the named queue, or from any queue when the
    /// name is missing or does not hold it.
    fn take_waiting(&mut self, queue_id: Option<&str>, unique_id: &str) -> Option<CallRecord> {
        if unique_id.is_empty() {
            return None;
        }
        if let Some(queue_id) = queue_id {
            if let Some(record) = self.remove_from_queue(queue_id, unique_id) {
                return Some(record);
            }
        }
        let holder = self
            .queued_calls
            .iter()
            .find(|(_, calls)| calls.iter().any(|call| call.unique_id == unique_id))
            .map(|(id, _)| id.clone())?;
        self.remove_from_queue(&holder, unique_id)
    }

    fn remove_from_queue(&mut self, queue_id: &str, unique_id: &str) -> Option<CallRecord> {
        let calls = self.queued_calls.get_mut(queue_id)?;
        let idx = calls.iter().position(|call| call.unique_id == unique_id)?;
        let record = calls.remove(idx);
        renumber(calls);
        record
    }

    fn pop_waiting_head(&mut self, queue_id: &str) -> Option<CallRecord> {
        let calls = self.queued_calls.get_mut(queue_id)?;
        let record = calls.pop_front();
        renumber(calls);
        record
    }

    fn refresh_agent_queues(&mut self, agent: &AgentStats) {
        for queue_id in &agent.queues {
            self.recount_active_agents(queue_id);
        }
    }

    fn recount_active_agents(&mut self, queue_id: &str) {
        let active = self
            .agents
            .values()
            .filter(|agent| agent.queues.contains(queue_id) && agent.status.is_active())
            .count() as u32;
        if let Some(queue) = self.queues.get_mut(queue_id) {
            queue.active_agents = active;
        }
    }

    fn push_history(&mut self, record: CallRecord) {
        if self.config.history_capacity == 0 {
            return;
        }
        self.history.push_back(record);
        while self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }
    }
}

fn renumber(calls: &mut VecDeque<CallRecord>) {
    for (idx, call) in calls.iter_mut().enumerate() {
        call.position = idx as u32 + 1;
    }
}

fn fold_wait(queue: &mut QueueStats, wait: u64) {
    queue.wait_samples += 1;
    queue.avg_wait_time += (wait as f64 - queue.avg_wait_time) / queue.wait_samples as f64;
    queue.max_wait_time = queue.max_wait_time.max(wait);
}

fn elapsed_secs(from_ms: i64, to_ms: i64) -> u64 {
    (to_ms.saturating_sub(from_ms).max(0) / 1000) as u64
}

/// Device code sets the underlying status; a paused flag wins over it.
fn apply_member_state(agent: &mut AgentStats, event: &CallEvent) {
    if let Some(code) = event.status_code {
        agent.device_status = AgentStatus::from_device_code(code);
    }
    match event.paused {
        Some(paused) => set_paused(agent, paused, event.reason.clone(), event.timestamp_ms),
        None => agent.status = status_for(agent),
    }
}

fn set_paused(agent: &mut AgentStats, paused: bool, reason: Option<String>, at_ms: i64) {
    if paused && !agent.paused {
        agent.paused_since_ms = Some(at_ms);
    }
    if !paused && agent.paused {
        if let Some(since) = agent.paused_since_ms.take() {
            agent.total_pause_time += elapsed_secs(since, at_ms);
        }
    }
    agent.paused = paused;
    agent.pause_reason = if paused {
        reason.or_else(|| agent.pause_reason.take())
    } else {
        None
    };
    agent.status = status_for(agent);
}

fn status_for(agent: &AgentStats) -> AgentStatus {
    if !agent.paused
        && agent.status == AgentStatus::InUse
        && agent.device_status != AgentStatus::Available
    {
        AgentStatus::InUse
    } else {
        settled_status(agent)
    }
}

/// Status with no call held by this store.
fn settled_status(agent: &AgentStats) -> AgentStatus {
    if agent.paused {
        AgentStatus::Paused
    } else if agent.device_status == AgentStatus::Unknown {
        AgentStatus::Available
    } else {
        agent.device_status
    }
}
