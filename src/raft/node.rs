use super::log::LogEvent;
use super::message::{
    ApiCall, AppendEntriesResult, AppendEntriesRpc, Envelope, InstallSnapshotResult,
    InstallSnapshotRpc, Message, RequestVoteResult, RequestVoteRpc,
};
use super::scheduler::{ElectionTimer, ReplicationTicker, Scheduler};
use super::task::{CatchUp, CatchUpGroup, CatchUpOutcome, Change, ChangeHolder, ChangeResult};
use super::{Command, Endpoint, Group, Index, Log, NodeStore, Transport};
use crate::errinput;
use crate::error::{Error, Result};

use crossbeam::channel::{self, Receiver};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A node ID.
pub type NodeId = u8;

/// A leader term.
pub type Term = u64;

/// Whether the node takes part in elections. A standby node replicates the
/// log but never campaigns, e.g. a fresh node waiting to be added to the
/// group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Active,
    Standby,
}

/// Node options.
#[derive(Clone, Debug)]
pub struct Options {
    /// The range of randomized election timeouts.
    pub election_timeout: std::ops::Range<std::time::Duration>,
    /// The period of the leader's replication tick, which doubles as the
    /// heartbeat interval.
    pub replication_interval: std::time::Duration,
    /// How long an in-flight replication RPC blocks another send to the same
    /// peer before it is presumed lost.
    pub min_replication_interval: std::time::Duration,
    /// Maximum number of entries per append.
    pub max_replication_entries: u64,
    /// Maximum number of entries per append while catching up a new node.
    pub max_replication_entries_for_new_node: u64,
    /// Bytes per snapshot chunk.
    pub snapshot_chunk_size: u64,
    /// How long a membership change waits for the previous one to finish.
    pub previous_change_timeout: std::time::Duration,
    /// How many catch-up rounds a new node gets to reach the log tail.
    pub catch_up_rounds: u64,
    /// How long a catch-up may go without progress before it times out.
    pub catch_up_round_timeout: std::time::Duration,
    /// How long the add-node caller waits for the catch-up overall.
    pub catch_up_timeout: std::time::Duration,
    /// Whether the node takes part in elections.
    pub mode: Mode,
}

impl Default for Options {
    fn default() -> Self {
        use std::time::Duration;
        Self {
            election_timeout: Duration::from_millis(3000)..Duration::from_millis(4000),
            replication_interval: Duration::from_millis(1000),
            min_replication_interval: Duration::from_millis(900),
            max_replication_entries: 100,
            max_replication_entries_for_new_node: 100,
            snapshot_chunk_size: 1024,
            previous_change_timeout: Duration::from_secs(10),
            catch_up_rounds: 10,
            catch_up_round_timeout: Duration::from_secs(3),
            catch_up_timeout: Duration::from_secs(30),
            mode: Mode::Active,
        }
    }
}

/// A role name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleName {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RoleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleName::Follower => write!(f, "follower"),
            RoleName::Candidate => write!(f, "candidate"),
            RoleName::Leader => write!(f, "leader"),
        }
    }
}

/// The node's role. Exactly one of follower, candidate, or leader, each with
/// its own fields. The role owns its timer: dropping the role cancels it.
#[derive(Debug)]
pub enum Role {
    Follower {
        term: Term,
        /// Who we voted for in this term, if anyone.
        voted_for: Option<NodeId>,
        /// The leader we follow, once known.
        leader: Option<NodeId>,
        timer: ElectionTimer,
    },
    Candidate {
        term: Term,
        /// Votes received, including our own.
        votes: u64,
        timer: ElectionTimer,
    },
    Leader {
        term: Term,
        ticker: ReplicationTicker,
    },
}

impl Role {
    pub fn name(&self) -> RoleName {
        match self {
            Role::Follower { .. } => RoleName::Follower,
            Role::Candidate { .. } => RoleName::Candidate,
            Role::Leader { .. } => RoleName::Leader,
        }
    }

    pub fn term(&self) -> Term {
        match self {
            Role::Follower { term, .. } | Role::Candidate { term, .. } | Role::Leader { term, .. } => {
                *term
            }
        }
    }

    /// The vote to persist for this role. Candidates and leaders have voted
    /// for themselves.
    fn durable_vote(&self, self_id: NodeId) -> Option<NodeId> {
        match self {
            Role::Follower { voted_for, .. } => *voted_for,
            Role::Candidate { .. } | Role::Leader { .. } => Some(self_id),
        }
    }

    /// A snapshot of the role for listeners and status queries.
    pub fn state(&self) -> RoleState {
        match self {
            Role::Follower { term, voted_for, leader, .. } => {
                RoleState::Follower { term: *term, voted_for: *voted_for, leader: *leader }
            }
            Role::Candidate { term, votes, .. } => RoleState::Candidate { term: *term, votes: *votes },
            Role::Leader { term, .. } => RoleState::Leader { term: *term },
        }
    }
}

/// A snapshot of the node's role, safe to hand to other threads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleState {
    Follower { term: Term, voted_for: Option<NodeId>, leader: Option<NodeId> },
    Candidate { term: Term, votes: u64 },
    Leader { term: Term },
}

impl RoleState {
    pub fn name(&self) -> RoleName {
        match self {
            RoleState::Follower { .. } => RoleName::Follower,
            RoleState::Candidate { .. } => RoleName::Candidate,
            RoleState::Leader { .. } => RoleName::Leader,
        }
    }

    pub fn term(&self) -> Term {
        match self {
            RoleState::Follower { term, .. }
            | RoleState::Candidate { term, .. }
            | RoleState::Leader { term } => *term,
        }
    }

    /// The last known leader, from the local node's point of view.
    pub fn leader(&self, self_id: NodeId) -> Option<NodeId> {
        match self {
            RoleState::Follower { leader, .. } => *leader,
            RoleState::Candidate { .. } => None,
            RoleState::Leader { .. } => Some(self_id),
        }
    }
}

/// A role change listener. Invoked synchronously on the actor thread after a
/// change, so it must not block.
pub type RoleListener = Box<dyn Fn(&RoleState) + Send>;

/// A Raft node. All state transitions happen on the single actor thread that
/// owns the node; see [`super::Server`] for the event loop and the public
/// API around it.
pub struct Node {
    id: NodeId,
    opts: Options,
    scheduler: Scheduler,
    group: Group,
    log: Log,
    store: Box<dyn NodeStore>,
    transport: Box<dyn Transport>,
    role: Role,
    listeners: Vec<RoleListener>,
    catch_ups: CatchUpGroup,
    holder: ChangeHolder,
    /// A channel that never delivers, selected on in place of the timer the
    /// current role doesn't have.
    never: Receiver<Instant>,
}

impl Node {
    /// Creates a node with the persisted term and vote, as a follower with a
    /// fresh election timer.
    pub fn new(
        id: NodeId,
        members: Vec<Endpoint>,
        log: Log,
        mut store: Box<dyn NodeStore>,
        transport: Box<dyn Transport>,
        holder: ChangeHolder,
        opts: Options,
    ) -> Result<Self> {
        if !members.iter().any(|m| m.id == id) {
            return errinput!("members must include the local node {id}");
        }
        let scheduler = Scheduler::new(&opts);
        let term = store.term()?;
        let voted_for = store.voted_for()?;
        let role =
            Role::Follower { term, voted_for, leader: None, timer: scheduler.election_timer() };
        Ok(Self {
            id,
            opts,
            scheduler,
            group: Group::new(id, members),
            log,
            store,
            transport,
            role,
            listeners: Vec::new(),
            catch_ups: CatchUpGroup::new(),
            holder,
            never: channel::never(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role_state(&self) -> RoleState {
        self.role.state()
    }

    pub fn add_role_listener(&mut self, listener: RoleListener) {
        self.listeners.push(listener);
    }

    /// The channel the current role's election timer fires on.
    pub(crate) fn election_rx(&self) -> Receiver<Instant> {
        match &self.role {
            Role::Follower { timer, .. } | Role::Candidate { timer, .. } => timer.receiver(),
            Role::Leader { .. } => self.never.clone(),
        }
    }

    /// The channel the leader's replication ticker fires on.
    pub(crate) fn ticker_rx(&self) -> Receiver<Instant> {
        match &self.role {
            Role::Leader { ticker, .. } => ticker.receiver(),
            Role::Follower { .. } | Role::Candidate { .. } => self.never.clone(),
        }
    }

    /// Processes an inbound peer message and sends any reply.
    pub fn receive(&mut self, envelope: Envelope) -> Result<()> {
        debug!("receiving {:?}", envelope);
        match envelope.message.clone() {
            Message::RequestVote(rpc) => {
                let result = self.process_request_vote(envelope.from, rpc)?;
                self.transport.reply_request_vote(result, &envelope)
            }
            Message::RequestVoteResult(result) => {
                self.process_request_vote_result(envelope.from, result)
            }
            Message::AppendEntries(rpc) => {
                let result = self.process_append_entries(rpc)?;
                self.transport.reply_append_entries(result, &envelope)
            }
            Message::AppendEntriesResult { result, rpc } => {
                self.process_append_entries_result(envelope.from, rpc, result)
            }
            Message::InstallSnapshot(rpc) => {
                let result = self.process_install_snapshot(rpc)?;
                self.transport.reply_install_snapshot(result, &envelope)
            }
            Message::InstallSnapshotResult { result, rpc } => {
                self.process_install_snapshot_result(envelope.from, rpc, result)
            }
        }
    }

    /// Processes an API call.
    pub fn invoke(&mut self, call: ApiCall) -> Result<()> {
        debug!("invoking {:?}", call);
        match call {
            ApiCall::Append { command } => self.append(command),
            ApiCall::RegisterStateMachine { state } => self.log.set_state_machine(state),
            ApiCall::RegisterRoleListener { listener } => {
                self.listeners.push(listener);
                Ok(())
            }
            ApiCall::StartCatchUp { endpoint, done } => self.start_catch_up(endpoint, done),
            ApiCall::CancelCatchUp { id } => {
                if self.catch_ups.remove(id).is_some() {
                    info!("abandoned catch-up of node {id}");
                }
                Ok(())
            }
            ApiCall::AddNode { endpoint, next_index, match_index } => {
                self.add_node(endpoint, next_index, match_index)
            }
            ApiCall::DowngradeNode { id } => self.downgrade_node(id),
        }
    }

    /// Processes an event published by the log.
    pub fn on_log_event(&mut self, event: LogEvent) -> Result<()> {
        match event {
            // On non-leaders the new membership takes effect at append time.
            LogEvent::GroupConfigAppended { entry } => {
                if let Some(members) = entry.command.result_members() {
                    self.group.update(members);
                }
                Ok(())
            }
            // On the leader it takes effect at commit time, resolving the
            // pending change.
            LogEvent::GroupConfigCommitted { entry } => self.on_group_config_committed(entry.index),
            // A conflict removed appended config entries again; revert to the
            // membership recorded in the earliest removed one.
            LogEvent::GroupConfigsRemoved { first } => {
                if let Some(members) = first.command.members() {
                    self.group.update(members.to_vec());
                }
                Ok(())
            }
        }
    }

    /// Handles an election timeout: start (or restart) an election, or take
    /// office directly when alone.
    pub fn on_election_timeout(&mut self) -> Result<()> {
        if self.role.name() == RoleName::Leader {
            warn!("node {} is leader, ignoring election timeout", self.id);
            return Ok(());
        }
        if self.opts.mode == Mode::Standby {
            info!("standby mode, skipping election");
            return Ok(());
        }
        let term = self.role.term() + 1;
        if self.group.is_sole_member() {
            info!("no other nodes, becoming leader of term {term}");
            self.become_leader(term)?;
            return Ok(());
        }
        self.change_role(Role::Candidate {
            term,
            votes: 1,
            timer: self.scheduler.election_timer(),
        })?;
        let (last_index, last_term) = self.log.last_entry_meta();
        let rpc = RequestVoteRpc { term, candidate: self.id, last_index, last_term };
        let peers = self.group.major_endpoints_except(self.id);
        self.transport.send_request_vote(rpc, &peers)
    }

    /// Handles a replication tick: replicate the log to all peers.
    pub fn on_replication_tick(&mut self) -> Result<()> {
        if self.role.name() != RoleName::Leader {
            debug!("replication tick while not leader, ignoring");
            return Ok(());
        }
        self.replicate()
    }

    /// Closes the node's collaborators. Role timers die with the node.
    pub fn close(&mut self) -> Result<()> {
        self.log.close()?;
        self.transport.close()?;
        self.store.close()?;
        Ok(())
    }

    /// Installs a new role, following the role change protocol: the old
    /// role's timer is cancelled (dropped with it), the durable (term, vote)
    /// pair is persisted if it changed, and listeners are notified.
    fn change_role(&mut self, role: Role) -> Result<()> {
        debug!("node {} changing role to {:?}", self.id, role);
        let (term, voted_for) = (role.term(), role.durable_vote(self.id));
        if (term, voted_for) != (self.store.term()?, self.store.voted_for()?) {
            self.store.set_term_and_voted_for(term, voted_for)?;
        }
        self.role = role;
        let state = self.role.state();
        for listener in &self.listeners {
            listener(&state);
        }
        Ok(())
    }

    /// Steps into a follower role. Replacing a follower with an identical
    /// follower is a stable transition: a no-op that doesn't touch the store,
    /// notify listeners, or disturb the election timer.
    fn become_follower(
        &mut self,
        term: Term,
        voted_for: Option<NodeId>,
        leader: Option<NodeId>,
        schedule_timer: bool,
    ) -> Result<()> {
        if let Role::Follower { term: t, voted_for: v, leader: l, .. } = &self.role {
            if (*t, *v, *l) == (term, voted_for, leader) {
                return Ok(());
            }
        }
        let timer =
            if schedule_timer { self.scheduler.election_timer() } else { ElectionTimer::never() };
        self.change_role(Role::Follower { term, voted_for, leader, timer })
    }

    /// Takes office: reset peer replication state, start the replication
    /// ticker, and append a no-op entry to commit earlier terms.
    fn become_leader(&mut self, term: Term) -> Result<()> {
        self.group.reset_replication(self.log.next_index());
        self.change_role(Role::Leader { term, ticker: self.scheduler.replication_ticker() })?;
        self.log.append(term, Command::Noop)?;
        Ok(())
    }

    /// Reschedules the follower's election timer after contact from the
    /// leader. A standby follower's timer stays unarmed.
    fn refresh_election_timer(&mut self) {
        let fresh = self.scheduler.election_timer();
        if let Role::Follower { timer, .. } = &mut self.role {
            if timer.is_armed() {
                *timer = fresh;
            }
        }
    }

    fn process_request_vote(
        &mut self,
        from: NodeId,
        rpc: RequestVoteRpc,
    ) -> Result<RequestVoteResult> {
        // Only voting members get a say.
        if !self.group.is_major(from) {
            warn!("request vote from node {from} which is not a voting member, rejecting");
            return Ok(RequestVoteResult { term: self.role.term(), granted: false });
        }
        if rpc.term < self.role.term() {
            debug!("request vote term {} below ours {}, rejecting", rpc.term, self.role.term());
            return Ok(RequestVoteResult { term: self.role.term(), granted: false });
        }
        // A new term: step down, and vote if the candidate's log is at least
        // as up to date as ours.
        if rpc.term > self.role.term() {
            let grant = !self.log.is_newer_than(rpc.last_index, rpc.last_term);
            self.become_follower(rpc.term, grant.then_some(rpc.candidate), None, true)?;
            return Ok(RequestVoteResult { term: rpc.term, granted: grant });
        }
        match &self.role {
            Role::Follower { voted_for, .. } => {
                let voted_for = *voted_for;
                let grant = match voted_for {
                    None => !self.log.is_newer_than(rpc.last_index, rpc.last_term),
                    Some(vote) => vote == rpc.candidate,
                };
                if grant {
                    info!("voting for {} in term {}", rpc.candidate, rpc.term);
                    self.become_follower(rpc.term, Some(rpc.candidate), None, true)?;
                    return Ok(RequestVoteResult { term: rpc.term, granted: true });
                }
                Ok(RequestVoteResult { term: self.role.term(), granted: false })
            }
            // Candidates voted for themselves, leaders already won.
            Role::Candidate { .. } | Role::Leader { .. } => {
                Ok(RequestVoteResult { term: self.role.term(), granted: false })
            }
        }
    }

    fn process_request_vote_result(&mut self, from: NodeId, result: RequestVoteResult) -> Result<()> {
        if result.term > self.role.term() {
            return self.become_follower(result.term, None, None, true);
        }
        let Role::Candidate { term, votes, .. } = &self.role else {
            debug!("vote result from {from} but not a candidate, ignoring");
            return Ok(());
        };
        if !result.granted {
            return Ok(());
        }
        let (term, votes) = (*term, *votes + 1);
        let major_count = self.group.major_count() as u64;
        debug!("{votes} votes of {major_count} voting members");
        if votes > major_count / 2 {
            info!("won election for term {term}, becoming leader");
            self.become_leader(term)?;
            self.transport.reset_channels()?;
        } else {
            self.change_role(Role::Candidate {
                term,
                votes,
                timer: self.scheduler.election_timer(),
            })?;
        }
        Ok(())
    }

    fn process_append_entries(&mut self, rpc: AppendEntriesRpc) -> Result<AppendEntriesResult> {
        if rpc.term < self.role.term() {
            return Ok(AppendEntriesResult { id: rpc.id, term: self.role.term(), success: false });
        }
        if rpc.term > self.role.term() {
            self.become_follower(rpc.term, None, Some(rpc.leader), true)?;
            let success = self.append_from_leader(&rpc)?;
            return Ok(AppendEntriesResult { id: rpc.id, term: rpc.term, success });
        }
        match &self.role {
            Role::Follower { voted_for, .. } => {
                let voted_for = *voted_for;
                self.become_follower(rpc.term, voted_for, Some(rpc.leader), true)?;
                self.refresh_election_timer();
                let success = self.append_from_leader(&rpc)?;
                Ok(AppendEntriesResult { id: rpc.id, term: rpc.term, success })
            }
            // More than one candidate, and another node won the election.
            Role::Candidate { .. } => {
                self.become_follower(rpc.term, None, Some(rpc.leader), true)?;
                let success = self.append_from_leader(&rpc)?;
                Ok(AppendEntriesResult { id: rpc.id, term: rpc.term, success })
            }
            Role::Leader { .. } => {
                warn!("append entries from another leader {} in my term, rejecting", rpc.leader);
                Ok(AppendEntriesResult { id: rpc.id, term: rpc.term, success: false })
            }
        }
    }

    /// Appends entries from the leader to the local log and, on success,
    /// advances the commit index to what the leader covered.
    fn append_from_leader(&mut self, rpc: &AppendEntriesRpc) -> Result<bool> {
        let success =
            self.log.append_from_leader(rpc.prev_index, rpc.prev_term, rpc.entries.clone())?;
        if success {
            let commit = std::cmp::min(rpc.leader_commit, rpc.last_entry_index());
            self.log.advance_commit_index(commit, rpc.term)?;
        }
        Ok(success)
    }

    fn process_append_entries_result(
        &mut self,
        from: NodeId,
        rpc: AppendEntriesRpc,
        result: AppendEntriesResult,
    ) -> Result<()> {
        if result.term > self.role.term() {
            return self.become_follower(result.term, None, None, true);
        }
        // A pending new-node catch-up gets its results before the group.
        if self.catch_ups.contains(from) {
            return self.process_catch_up_append_result(from, rpc, result);
        }
        let Some(member) = self.group.member_mut(from) else {
            info!("append result from node {from}, which may have been removed, ignoring");
            return Ok(());
        };
        if result.success {
            if !member.is_major() {
                if member.is_removing() {
                    debug!("node {from} is being removed, skipping");
                } else {
                    warn!("append result from node {from}, neither voting nor removing");
                }
                member.stop_replicating();
                return Ok(());
            }
            if member.advance(rpc.last_entry_index()) {
                if let Some(quorum) = self.group.quorum_match_index() {
                    self.log.advance_commit_index(quorum, self.role.term())?;
                }
            }
            let member = self.group.member_mut(from).expect("member just present");
            if member.next_index() >= self.log.next_index() {
                member.stop_replicating();
                return Ok(());
            }
        } else if !member.back_off() {
            warn!("cannot back off next index any further for node {from}");
            member.stop_replicating();
            return Ok(());
        }
        self.replicate_to(from, self.opts.max_replication_entries)
    }

    fn process_install_snapshot(&mut self, rpc: InstallSnapshotRpc) -> Result<InstallSnapshotResult> {
        if rpc.term < self.role.term() {
            return Ok(InstallSnapshotResult { term: self.role.term() });
        }
        if rpc.term > self.role.term() {
            self.become_follower(rpc.term, None, Some(rpc.leader), true)?;
        }
        self.log.install_snapshot(&rpc)?;
        Ok(InstallSnapshotResult { term: rpc.term })
    }

    fn process_install_snapshot_result(
        &mut self,
        from: NodeId,
        rpc: InstallSnapshotRpc,
        result: InstallSnapshotResult,
    ) -> Result<()> {
        if result.term > self.role.term() {
            return self.become_follower(result.term, None, None, true);
        }
        if self.catch_ups.contains(from) {
            return self.process_catch_up_snapshot_result(from, rpc);
        }
        let Some(member) = self.group.member_mut(from) else {
            info!("snapshot result from node {from}, which may have been removed, ignoring");
            return Ok(());
        };
        if rpc.done {
            member.advance(rpc.last_index);
            let max_entries = if member.is_major() {
                self.opts.max_replication_entries
            } else {
                self.opts.max_replication_entries_for_new_node
            };
            return self.replicate_to(from, max_entries);
        }
        let endpoint = member.endpoint().clone();
        let offset = rpc.offset + rpc.data.len() as u64;
        let next = self.log.install_snapshot_rpc(
            self.role.term(),
            self.id,
            offset,
            self.opts.snapshot_chunk_size,
        )?;
        self.transport.send_install_snapshot(next, &endpoint)
    }

    /// Replicates the log to all peers. When alone, the whole log is
    /// trivially replicated and the commit index advances directly.
    fn replicate(&mut self) -> Result<()> {
        if self.group.is_sole_member() {
            let term = self.role.term();
            return self.log.advance_commit_index(self.log.next_index() - 1, term);
        }
        debug!("replicating log");
        for id in self.group.replication_targets() {
            let replicate = self
                .group
                .member(id)
                .map(|m| m.should_replicate(self.opts.min_replication_interval))
                .unwrap_or(false);
            if replicate {
                self.replicate_to(id, self.opts.max_replication_entries)?;
            } else {
                debug!("node {id} is replicating, skipping");
            }
        }
        Ok(())
    }

    /// Sends one append to a member, or a snapshot when the member needs a
    /// compacted prefix.
    fn replicate_to(&mut self, id: NodeId, max_entries: u64) -> Result<()> {
        let Some(member) = self.group.member_mut(id) else {
            warn!("no group member {id} to replicate to");
            return Ok(());
        };
        let (next_index, endpoint) = (member.next_index(), member.endpoint().clone());
        member.start_replicating();
        let term = self.role.term();
        match self.log.append_entries_rpc(term, self.id, next_index, max_entries) {
            Ok(rpc) => self.transport.send_append_entries(rpc, &endpoint),
            Err(Error::EntryInSnapshot) => {
                debug!("entry {next_index} is in a snapshot, sending snapshot instead");
                let rpc = self.log.install_snapshot_rpc(
                    term,
                    self.id,
                    0,
                    self.opts.snapshot_chunk_size,
                )?;
                self.transport.send_install_snapshot(rpc, &endpoint)
            }
            Err(err) => Err(err),
        }
    }

    /// Appends a command and replicates it. Leadership is re-checked here on
    /// the actor: the caller's check can go stale in flight, and a non-leader
    /// append would diverge the log.
    fn append(&mut self, command: Vec<u8>) -> Result<()> {
        let Role::Leader { term, .. } = &self.role else {
            warn!("not leader anymore, dropping append");
            return Ok(());
        };
        let term = *term;
        self.log.append(term, Command::Write(command))?;
        self.replicate()
    }

    fn start_catch_up(
        &mut self,
        endpoint: Endpoint,
        done: channel::Sender<CatchUpOutcome>,
    ) -> Result<()> {
        if self.role.name() != RoleName::Leader {
            warn!("not leader anymore, abandoning catch-up of {endpoint}");
            let _ = done.send(CatchUpOutcome::ReplicationFailed);
            return Ok(());
        }
        if self.catch_ups.contains(endpoint.id) {
            let _ = done.send(CatchUpOutcome::Duplicate);
            return Ok(());
        }
        let id = endpoint.id;
        let task = CatchUp::new(endpoint, self.log.next_index(), done);
        self.catch_ups.add(task)?;
        self.replicate_to_catch_up(id)
    }

    fn process_catch_up_append_result(
        &mut self,
        from: NodeId,
        rpc: AppendEntriesRpc,
        result: AppendEntriesResult,
    ) -> Result<()> {
        let next_log_index = self.log.next_index();
        let Some(task) = self.catch_ups.get_mut(from) else {
            return Ok(());
        };
        if result.success {
            task.advance(rpc.last_entry_index());
            if task.next_index >= next_log_index {
                let task = self.catch_ups.remove(from).expect("task just present");
                let outcome = CatchUpOutcome::Caught {
                    next_index: task.next_index,
                    match_index: task.match_index,
                };
                info!("node {from} caught up at index {}", task.match_index);
                task.finish(outcome);
                return Ok(());
            }
            if task.next_round() > self.opts.catch_up_rounds {
                warn!("node {from} used up its catch-up rounds");
                let task = self.catch_ups.remove(from).expect("task just present");
                task.finish(CatchUpOutcome::Timeout);
                return Ok(());
            }
        } else {
            if task.next_index <= 1 {
                warn!("cannot back off catch-up of node {from} any further");
                let task = self.catch_ups.remove(from).expect("task just present");
                task.finish(CatchUpOutcome::ReplicationFailed);
                return Ok(());
            }
            task.back_off();
            if task.stalled_for() >= self.opts.catch_up_round_timeout {
                warn!("catch-up of node {from} stalled");
                let task = self.catch_ups.remove(from).expect("task just present");
                task.finish(CatchUpOutcome::Timeout);
                return Ok(());
            }
        }
        self.replicate_to_catch_up(from)
    }

    fn process_catch_up_snapshot_result(
        &mut self,
        from: NodeId,
        rpc: InstallSnapshotRpc,
    ) -> Result<()> {
        if rpc.done {
            if let Some(task) = self.catch_ups.get_mut(from) {
                task.advance(rpc.last_index);
            }
            return self.replicate_to_catch_up(from);
        }
        let Some(task) = self.catch_ups.get(from) else {
            return Ok(());
        };
        let endpoint = task.endpoint.clone();
        let offset = rpc.offset + rpc.data.len() as u64;
        let next = self.log.install_snapshot_rpc(
            self.role.term(),
            self.id,
            offset,
            self.opts.snapshot_chunk_size,
        )?;
        self.transport.send_install_snapshot(next, &endpoint)
    }

    /// Streams the next batch to a catching-up node. A failure here fails the
    /// catch-up rather than the actor.
    fn replicate_to_catch_up(&mut self, id: NodeId) -> Result<()> {
        let Some(task) = self.catch_ups.get(id) else {
            return Ok(());
        };
        let (endpoint, next_index) = (task.endpoint.clone(), task.next_index);
        let term = self.role.term();
        let max_entries = self.opts.max_replication_entries_for_new_node;
        let sent = match self.log.append_entries_rpc(term, self.id, next_index, max_entries) {
            Ok(rpc) => self.transport.send_append_entries(rpc, &endpoint),
            Err(Error::EntryInSnapshot) => {
                debug!("catch-up entry {next_index} is in a snapshot, sending snapshot");
                self.log
                    .install_snapshot_rpc(term, self.id, 0, self.opts.snapshot_chunk_size)
                    .and_then(|rpc| self.transport.send_install_snapshot(rpc, &endpoint))
            }
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            warn!("catch-up replication to {endpoint} failed: {err}");
            if let Some(task) = self.catch_ups.remove(id) {
                task.finish(CatchUpOutcome::ReplicationFailed);
            }
        }
        Ok(())
    }

    /// Appends the group config entry admitting a caught-up node, updates the
    /// in-memory membership, and kicks replication. The pending change
    /// resolves when the entry commits.
    fn add_node(&mut self, endpoint: Endpoint, next_index: Index, match_index: Index) -> Result<()> {
        let Role::Leader { term, .. } = &self.role else {
            warn!("not leader anymore, abandoning addition of {endpoint}");
            self.holder.fail_in_flight();
            return Ok(());
        };
        let term = *term;
        debug_assert_ne!(endpoint.id, self.id, "cannot add the local node");
        let members = self.group.major_endpoints();
        let index = self.log.append_for_add_node(term, members, endpoint.clone())?;
        self.group.add(endpoint, next_index, match_index, true);
        self.holder.set_entry_index(index);
        self.replicate()
    }

    /// Downgrades a node out of the voting set and appends the group config
    /// entry removing it. The node is dropped from the registry when the
    /// entry commits.
    fn downgrade_node(&mut self, id: NodeId) -> Result<()> {
        let Role::Leader { term, .. } = &self.role else {
            warn!("not leader anymore, abandoning removal of node {id}");
            self.holder.fail_in_flight();
            return Ok(());
        };
        let term = *term;
        if !self.group.downgrade(id) {
            warn!("no group member {id} to remove");
            self.holder.fail_in_flight();
            return Ok(());
        }
        let members = self.group.major_endpoints();
        let index = self.log.append_for_remove_node(term, members, id)?;
        self.holder.set_entry_index(index);
        self.replicate()
    }

    /// Resolves the pending membership change once its group config entry
    /// commits. Removing ourselves means stepping down to a standby follower
    /// with no election timer.
    fn on_group_config_committed(&mut self, index: Index) -> Result<()> {
        let Some(pending) = self.holder.take_committed(index) else {
            debug!("group config entry {index} committed with no pending change");
            return Ok(());
        };
        if let Change::Remove { id } = pending.change {
            if id == self.id {
                info!("removed from the group, stepping down to standby");
                self.become_follower(self.role.term(), None, None, false)?;
            }
            self.group.remove(id);
        }
        pending.completion.set(ChangeResult::Ok);
        Ok(())
    }
}
