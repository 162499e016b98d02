//! A Raft consensus node.
//!
//! The node is structured as an actor: a single thread owns all role and
//! membership state and processes a serialized stream of inputs (RPC messages,
//! log events, API calls, and timers). Around the actor sit collaborators with
//! narrow contracts: the replicated log, the durable node store, the RPC
//! transport, and the state machine.

mod group;
mod log;
mod message;
mod node;
mod scheduler;
mod server;
mod state;
mod store;
mod task;
mod transport;

pub use group::{Endpoint, Group, Member};
pub use log::{Command, Entry, Index, Log, LogEvent, Scan};
pub use message::{
    ApiCall, AppendEntriesResult, AppendEntriesRpc, Envelope, Input, InstallSnapshotResult,
    InstallSnapshotRpc, Message, RequestVoteResult, RequestVoteRpc,
};
pub use node::{Mode, Node, NodeId, Options, Role, RoleListener, RoleName, RoleState, Term};
pub use scheduler::{ElectionTimer, ReplicationTicker, Scheduler};
pub use server::Server;
pub use state::State;
pub use store::{EngineNodeStore, NodeStore};
pub use task::{
    CatchUpOutcome, Change, ChangeHandle, ChangeHolder, ChangeResult, Completion, PendingChange,
};
pub use transport::{ChannelMesh, ChannelTransport, Transport};
