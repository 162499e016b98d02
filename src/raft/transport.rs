use super::message::{
    AppendEntriesResult, AppendEntriesRpc, Envelope, InstallSnapshotResult, InstallSnapshotRpc,
    Message, RequestVoteResult, RequestVoteRpc,
};
use super::{Endpoint, NodeId};
use crate::errinternal;
use crate::error::Result;

use crossbeam::channel::{self, Receiver, Sender};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A transport for communication between a Raft node and its peers. Replies
/// are addressed by the envelope they answer, so the node never needs to
/// resolve a sender id to an address itself.
pub trait Transport: Send {
    /// Prepares the transport for use.
    fn initialize(&mut self) -> Result<()>;

    /// Returns the channel inbound messages are delivered on.
    fn receiver(&self) -> Receiver<Envelope>;

    /// Sends a vote solicitation to the given endpoints.
    fn send_request_vote(&self, rpc: RequestVoteRpc, to: &[Endpoint]) -> Result<()>;

    /// Sends an append to a single endpoint.
    fn send_append_entries(&self, rpc: AppendEntriesRpc, to: &Endpoint) -> Result<()>;

    /// Sends a snapshot chunk to a single endpoint.
    fn send_install_snapshot(&self, rpc: InstallSnapshotRpc, to: &Endpoint) -> Result<()>;

    /// Replies to a vote solicitation.
    fn reply_request_vote(&self, result: RequestVoteResult, to: &Envelope) -> Result<()>;

    /// Replies to an append, echoing the RPC so the leader can match the
    /// result to the entries it sent.
    fn reply_append_entries(&self, result: AppendEntriesResult, to: &Envelope) -> Result<()>;

    /// Replies to a snapshot chunk, echoing the RPC.
    fn reply_install_snapshot(&self, result: InstallSnapshotResult, to: &Envelope) -> Result<()>;

    /// Resets any per-peer connection state, e.g. when taking office.
    fn reset_channels(&mut self) -> Result<()>;

    /// Closes the transport.
    fn close(&mut self) -> Result<()>;
}

/// An in-process transport: a mesh of channels between nodes, keyed by node
/// id. Used by the test cluster and anything else hosting multiple nodes in
/// one process.
#[derive(Clone, Default)]
pub struct ChannelMesh {
    inboxes: Arc<Mutex<HashMap<NodeId, Sender<Envelope>>>>,
}

impl ChannelMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a node to the mesh, returning its transport. The transport's
    /// receiver yields messages other nodes send to this id.
    pub fn connect(&self, id: NodeId) -> ChannelTransport {
        let (tx, rx) = channel::unbounded();
        self.inboxes.lock().expect("mesh lock poisoned").insert(id, tx);
        ChannelTransport { id, mesh: self.clone(), rx }
    }

    fn send(&self, envelope: Envelope) -> Result<()> {
        let inboxes = self.inboxes.lock().expect("mesh lock poisoned");
        let Some(tx) = inboxes.get(&envelope.to) else {
            return errinternal!("unknown transport peer {}", envelope.to);
        };
        if tx.send(envelope).is_err() {
            return errinternal!("transport peer is gone");
        }
        Ok(())
    }

    fn disconnect(&self, id: NodeId) {
        self.inboxes.lock().expect("mesh lock poisoned").remove(&id);
    }
}

/// A node's connection to a [`ChannelMesh`].
pub struct ChannelTransport {
    id: NodeId,
    mesh: ChannelMesh,
    rx: Receiver<Envelope>,
}

impl ChannelTransport {
    fn send(&self, to: NodeId, message: Message) -> Result<()> {
        self.mesh.send(Envelope { from: self.id, to, message })
    }
}

impl Transport for ChannelTransport {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn receiver(&self) -> Receiver<Envelope> {
        self.rx.clone()
    }

    fn send_request_vote(&self, rpc: RequestVoteRpc, to: &[Endpoint]) -> Result<()> {
        for endpoint in to {
            self.send(endpoint.id, Message::RequestVote(rpc.clone()))?;
        }
        Ok(())
    }

    fn send_append_entries(&self, rpc: AppendEntriesRpc, to: &Endpoint) -> Result<()> {
        self.send(to.id, Message::AppendEntries(rpc))
    }

    fn send_install_snapshot(&self, rpc: InstallSnapshotRpc, to: &Endpoint) -> Result<()> {
        self.send(to.id, Message::InstallSnapshot(rpc))
    }

    fn reply_request_vote(&self, result: RequestVoteResult, to: &Envelope) -> Result<()> {
        self.send(to.from, Message::RequestVoteResult(result))
    }

    fn reply_append_entries(&self, result: AppendEntriesResult, to: &Envelope) -> Result<()> {
        let Message::AppendEntries(rpc) = &to.message else {
            return errinternal!("reply does not answer an append");
        };
        self.send(to.from, Message::AppendEntriesResult { result, rpc: rpc.clone() })
    }

    fn reply_install_snapshot(&self, result: InstallSnapshotResult, to: &Envelope) -> Result<()> {
        let Message::InstallSnapshot(rpc) = &to.message else {
            return errinternal!("reply does not answer a snapshot chunk");
        };
        self.send(to.from, Message::InstallSnapshotResult { result, rpc: rpc.clone() })
    }

    fn reset_channels(&mut self) -> Result<()> {
        // Channels don't carry connection state, there is nothing to reset.
        debug!("resetting transport channels");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.mesh.disconnect(self.id);
        Ok(())
    }
}
