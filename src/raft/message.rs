use super::log::LogEvent;
use super::task::CatchUpOutcome;
use super::{Endpoint, Entry, Index, NodeId, RoleListener, State, Term};
use crate::error::Result;

use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};

/// A message envelope passed between Raft nodes. RPC results echo the RPC
/// they answer, so the recipient can match responses to the replication
/// progress they were sent for, and the sender id is always carried
/// explicitly so results can't be attributed to an unknown sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeId,
    /// The recipient.
    pub to: NodeId,
    /// The message payload.
    pub message: Message,
}

impl crate::encoding::Value for Envelope {}

/// A message passed between Raft nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Candidates solicit votes when campaigning for leadership.
    RequestVote(RequestVoteRpc),
    /// A vote reply, granted or not.
    RequestVoteResult(RequestVoteResult),
    /// Leaders replicate log entries, which doubles as the heartbeat.
    AppendEntries(AppendEntriesRpc),
    /// An append reply, echoing the RPC it answers.
    AppendEntriesResult { result: AppendEntriesResult, rpc: AppendEntriesRpc },
    /// Leaders transfer a snapshot chunk to a lagging peer.
    InstallSnapshot(InstallSnapshotRpc),
    /// A snapshot chunk reply, echoing the RPC it answers.
    InstallSnapshotResult { result: InstallSnapshotResult, rpc: InstallSnapshotRpc },
}

/// Solicits a vote for the candidate in the given term.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRpc {
    pub term: Term,
    pub candidate: NodeId,
    /// The index of the candidate's last log entry.
    pub last_index: Index,
    /// The term of the candidate's last log entry.
    pub last_term: Term,
}

/// A vote reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResult {
    pub term: Term,
    pub granted: bool,
}

/// Replicates log entries to a peer. An empty entry list is a heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRpc {
    /// A message id, echoed in the result.
    pub id: u64,
    pub term: Term,
    pub leader: NodeId,
    /// The index of the entry immediately preceding entries.
    pub prev_index: Index,
    /// The term of the entry immediately preceding entries.
    pub prev_term: Term,
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: Index,
}

impl AppendEntriesRpc {
    /// The index of the last entry carried by this RPC, or of the base entry
    /// when it carries none.
    pub fn last_entry_index(&self) -> Index {
        self.entries.last().map(|e| e.index).unwrap_or(self.prev_index)
    }
}

/// An append reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// The id of the RPC this answers.
    pub id: u64,
    pub term: Term,
    pub success: bool,
}

/// Transfers a snapshot chunk to a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRpc {
    pub term: Term,
    pub leader: NodeId,
    /// The last log index covered by the snapshot.
    pub last_index: Index,
    /// The term of the last covered entry.
    pub last_term: Term,
    /// The voting set at the time the snapshot was taken.
    pub members: Vec<Endpoint>,
    /// The chunk's byte offset into the snapshot data.
    pub offset: u64,
    /// The chunk data.
    pub data: Vec<u8>,
    /// Whether this is the final chunk.
    pub done: bool,
}

/// A snapshot chunk reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResult {
    pub term: Term,
}

/// An input consumed by the node's actor loop. Timers are selected on
/// directly and don't appear here.
pub enum Input {
    /// An inbound peer message.
    Message(Envelope),
    /// An event published by the log.
    LogEvent(LogEvent),
    /// An API call submitted by an external caller.
    Api(ApiCall),
    /// Shuts the node down, reporting the close outcome.
    Shutdown { done: Sender<Result<()>> },
}

/// An API call submitted to the actor.
pub enum ApiCall {
    /// Appends a command to the log and replicates it. Leader only.
    Append { command: Vec<u8> },
    /// Registers the state machine that committed commands are applied to.
    RegisterStateMachine { state: Box<dyn State> },
    /// Registers a role change listener.
    RegisterRoleListener { listener: RoleListener },
    /// Starts catching a prospective new member up to the log tail. The
    /// outcome is delivered on done.
    StartCatchUp { endpoint: Endpoint, done: Sender<CatchUpOutcome> },
    /// Abandons an in-flight catch-up, e.g. when the caller timed out.
    CancelCatchUp { id: NodeId },
    /// Appends the group config entry adding a caught-up node, and admits it
    /// to the group.
    AddNode { endpoint: Endpoint, next_index: Index, match_index: Index },
    /// Downgrades a node and appends the group config entry removing it.
    DowngradeNode { id: NodeId },
}

impl std::fmt::Debug for ApiCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiCall::Append { command } => write!(f, "Append({} bytes)", command.len()),
            ApiCall::RegisterStateMachine { .. } => write!(f, "RegisterStateMachine"),
            ApiCall::RegisterRoleListener { .. } => write!(f, "RegisterRoleListener"),
            ApiCall::StartCatchUp { endpoint, .. } => write!(f, "StartCatchUp({endpoint})"),
            ApiCall::CancelCatchUp { id } => write!(f, "CancelCatchUp({id})"),
            ApiCall::AddNode { endpoint, .. } => write!(f, "AddNode({endpoint})"),
            ApiCall::DowngradeNode { id } => write!(f, "DowngradeNode({id})"),
        }
    }
}
