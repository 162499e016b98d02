use super::message::{ApiCall, Input};
use super::node::{Node, RoleListener, RoleName, RoleState};
use super::task::{CatchUpOutcome, Change, ChangeHandle, ChangeHolder, ChangeResult, Completion};
use super::{Endpoint, Log, NodeId, NodeStore, Options, State, Transport};
use crate::errinternal;
use crate::error::{Error, Result};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{error, info};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// A Raft server: the node actor plus its public face.
///
/// The node itself runs on a dedicated actor thread that owns all role and
/// membership state, draining a single inbox of peer messages, log events,
/// and API calls, and selecting on the current role's timers. Public methods
/// submit work into that inbox, so callers never race on node state.
///
/// Membership changes run on a second, dedicated worker thread so the caller
/// can await the change without blocking the actor. The worker posts the
/// change's steps back into the inbox, keeping all mutations serialized.
pub struct Server {
    id: NodeId,
    opts: Options,
    /// The latest role snapshot, published by the actor for status queries.
    role: Arc<Mutex<RoleState>>,
    holder: ChangeHolder,
    inbox_tx: Sender<Input>,
    inbox_rx: Option<Receiver<Input>>,
    changes_tx: Option<Sender<Job>>,
    changes_rx: Option<Receiver<Job>>,
    parts: Option<Parts>,
    actor: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
    lifecycle: Lifecycle,
}

/// The collaborators handed over to the node when it starts.
struct Parts {
    members: Vec<Endpoint>,
    log: Log,
    store: Box<dyn NodeStore>,
    transport: Box<dyn Transport>,
}

/// A membership change job for the worker thread.
struct Job {
    change: Change,
    completion: Completion,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Started,
    Stopped,
}

impl Server {
    /// Creates a server. Nothing runs until [`Server::start`] is called.
    pub fn new(
        id: NodeId,
        members: Vec<Endpoint>,
        log: Log,
        store: Box<dyn NodeStore>,
        transport: Box<dyn Transport>,
        opts: Options,
    ) -> Self {
        let (inbox_tx, inbox_rx) = channel::unbounded();
        let (changes_tx, changes_rx) = channel::unbounded();
        Self {
            id,
            opts,
            role: Arc::new(Mutex::new(RoleState::Follower {
                term: 0,
                voted_for: None,
                leader: None,
            })),
            holder: ChangeHolder::new(),
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            changes_tx: Some(changes_tx),
            changes_rx: Some(changes_rx),
            parts: Some(Parts { members, log, store, transport }),
            actor: None,
            worker: None,
            lifecycle: Lifecycle::New,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Starts the node: initializes the transport, loads the durable term
    /// and vote into a follower role, and spawns the actor and membership
    /// worker. Idempotent while started; a stopped server can't restart.
    pub fn start(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Started => return Ok(()),
            Lifecycle::Stopped => return errinternal!("node {} has been stopped", self.id),
            Lifecycle::New => {}
        }
        info!("starting node {}", self.id);
        let Parts { members, mut log, store, mut transport } =
            self.parts.take().expect("parts are present before start");

        let (event_tx, event_rx) = channel::unbounded();
        log.publish_to(event_tx);
        transport.initialize()?;
        let ingress = transport.receiver();

        let mut node = Node::new(
            self.id,
            members,
            log,
            store,
            transport,
            self.holder.clone(),
            self.opts.clone(),
        )?;
        *lock(&self.role) = node.role_state();
        let role = self.role.clone();
        node.add_role_listener(Box::new(move |state| {
            *lock(&role) = state.clone();
        }));

        // Forward peer messages and log events into the inbox. These threads
        // exit when their source channel closes.
        let tx = self.inbox_tx.clone();
        thread::spawn(move || {
            for envelope in ingress {
                if tx.send(Input::Message(envelope)).is_err() {
                    break;
                }
            }
        });
        let tx = self.inbox_tx.clone();
        thread::spawn(move || {
            for event in event_rx {
                if tx.send(Input::LogEvent(event)).is_err() {
                    break;
                }
            }
        });

        let inbox = self.inbox_rx.take().expect("inbox is present before start");
        self.actor = Some(thread::spawn(move || Self::event_loop(node, inbox)));

        let changes = self.changes_rx.take().expect("change queue is present before start");
        let tx = self.inbox_tx.clone();
        self.worker = Some(thread::spawn(move || Self::change_loop(changes, tx)));

        self.lifecycle = Lifecycle::Started;
        Ok(())
    }

    /// Stops the node: the actor closes the log, transport, and store, the
    /// membership worker drains, and both threads are joined. Close failures
    /// surface to the caller. The server can't be restarted.
    pub fn stop(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::New => return errinternal!("node {} is not started", self.id),
            Lifecycle::Stopped => return errinternal!("node {} is already stopped", self.id),
            Lifecycle::Started => {}
        }
        info!("stopping node {}", self.id);
        self.lifecycle = Lifecycle::Stopped;

        let (done_tx, done_rx) = channel::bounded(1);
        let result = match self.inbox_tx.send(Input::Shutdown { done: done_tx }) {
            Ok(()) => done_rx.recv().unwrap_or(Err(Error::Abort)),
            Err(_) => Err(Error::Abort),
        };

        // Fail any change still in flight and let the worker drain.
        self.holder.fail_in_flight();
        self.changes_tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(actor) = self.actor.take() {
            let _ = actor.join();
        }
        result
    }

    /// Registers the state machine that committed commands are applied to.
    /// Typically called before start.
    pub fn register_state_machine(&self, state: Box<dyn State>) -> Result<()> {
        self.submit(ApiCall::RegisterStateMachine { state })
    }

    /// Registers a role change listener, invoked on the actor thread after
    /// each change. It must not block.
    pub fn add_role_listener(&self, listener: RoleListener) -> Result<()> {
        self.submit(ApiCall::RegisterRoleListener { listener })
    }

    /// Returns the current role name and last known leader.
    pub fn role_report(&self) -> (RoleName, Option<NodeId>) {
        let state = lock(&self.role).clone();
        (state.name(), state.leader(self.id))
    }

    /// Returns a snapshot of the current role.
    pub fn role_state(&self) -> RoleState {
        lock(&self.role).clone()
    }

    /// Appends a command to the replicated log. Only the leader takes
    /// appends; other roles fail with NotLeader naming the leader to go to.
    pub fn append(&self, command: Vec<u8>) -> Result<()> {
        self.ensure_started()?;
        self.ensure_leader()?;
        self.submit(ApiCall::Append { command })
    }

    /// Adds a new node to the group. Catches the node up to the log tail
    /// first, which blocks the caller, then submits the membership change
    /// and returns a handle for its outcome.
    pub fn add_node(&self, endpoint: Endpoint) -> Result<ChangeHandle> {
        self.ensure_started()?;
        self.ensure_leader()?;
        if endpoint.id == self.id {
            return Err(Error::InvalidInput("cannot add the local node itself".into()));
        }

        let (done_tx, done_rx) = channel::bounded(1);
        self.submit(ApiCall::StartCatchUp { endpoint: endpoint.clone(), done: done_tx })?;
        let outcome = match done_rx.recv_timeout(self.opts.catch_up_timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                let _ = self.submit(ApiCall::CancelCatchUp { id: endpoint.id });
                return Ok(ChangeHandle::fixed(ChangeResult::Timeout));
            }
            Err(RecvTimeoutError::Disconnected) => return Err(Error::Abort),
        };
        let (next_index, match_index) = match outcome {
            CatchUpOutcome::Caught { next_index, match_index } => (next_index, match_index),
            CatchUpOutcome::ReplicationFailed => {
                return Ok(ChangeHandle::fixed(ChangeResult::ReplicationFailed))
            }
            CatchUpOutcome::Timeout => return Ok(ChangeHandle::fixed(ChangeResult::Timeout)),
            CatchUpOutcome::Duplicate => {
                return Err(Error::InvalidInput(format!(
                    "node {} is already being added",
                    endpoint.id
                )))
            }
        };

        self.submit_change(Change::Add { endpoint, next_index, match_index })
    }

    /// Removes a node from the group, returning a handle for the outcome.
    pub fn remove_node(&self, id: NodeId) -> Result<ChangeHandle> {
        self.ensure_started()?;
        self.ensure_leader()?;
        self.submit_change(Change::Remove { id })
    }

    /// Installs and enqueues a membership change, after waiting out any
    /// previous one.
    fn submit_change(&self, change: Change) -> Result<ChangeHandle> {
        if let Err(result) = self.holder.await_previous(self.opts.previous_change_timeout) {
            return Ok(ChangeHandle::fixed(result));
        }
        let completion = Completion::new();
        self.holder.install(change.clone(), completion.clone())?;
        let Some(changes) = &self.changes_tx else {
            return Err(Error::Abort);
        };
        if changes.send(Job { change, completion: completion.clone() }).is_err() {
            return Err(Error::Abort);
        }
        Ok(ChangeHandle::new(completion))
    }

    fn submit(&self, call: ApiCall) -> Result<()> {
        self.inbox_tx.send(Input::Api(call)).map_err(|_| Error::Abort)
    }

    fn ensure_started(&self) -> Result<()> {
        if self.lifecycle != Lifecycle::Started {
            return errinternal!("node {} is not started", self.id);
        }
        Ok(())
    }

    fn ensure_leader(&self) -> Result<()> {
        let state = lock(&self.role).clone();
        if state.name() != RoleName::Leader {
            return Err(Error::NotLeader { role: state.name(), leader: state.leader(self.id) });
        }
        Ok(())
    }

    /// The actor: drains the inbox and the current role's timers. All role
    /// and membership mutations happen here. Failed tasks are logged and the
    /// node keeps serving.
    fn event_loop(mut node: Node, inbox: Receiver<Input>) {
        loop {
            let election = node.election_rx();
            let ticker = node.ticker_rx();
            let result = crossbeam::select! {
                recv(inbox) -> input => match input {
                    Ok(Input::Message(envelope)) => node.receive(envelope),
                    Ok(Input::LogEvent(event)) => node.on_log_event(event),
                    Ok(Input::Api(call)) => node.invoke(call),
                    Ok(Input::Shutdown { done }) => {
                        let _ = done.send(node.close());
                        return;
                    }
                    Err(_) => return,
                },
                recv(election) -> _ => node.on_election_timeout(),
                recv(ticker) -> _ => node.on_replication_tick(),
            };
            if let Err(err) = result {
                error!("node task failed: {err}");
            }
        }
    }

    /// The membership worker: posts each change's first step to the actor
    /// and waits for the change to resolve, one at a time.
    fn change_loop(changes: Receiver<Job>, inbox: Sender<Input>) {
        for job in changes {
            let call = match &job.change {
                Change::Add { endpoint, next_index, match_index } => ApiCall::AddNode {
                    endpoint: endpoint.clone(),
                    next_index: *next_index,
                    match_index: *match_index,
                },
                Change::Remove { id } => ApiCall::DowngradeNode { id: *id },
            };
            if inbox.send(Input::Api(call)).is_err() {
                job.completion.set(ChangeResult::Error);
                continue;
            }
            job.completion.wait(None);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::super::state::tests::TestState;
    use super::super::store::EngineNodeStore;
    use super::super::transport::ChannelMesh;
    use super::super::{Log, Mode};
    use super::*;
    use crate::storage::Memory;

    use std::time::{Duration, Instant};

    /// Builds a server wired into the mesh, with fast timers for tests.
    fn server(mesh: &ChannelMesh, id: NodeId, members: &[NodeId], opts: Options) -> Server {
        let endpoints =
            members.iter().map(|id| Endpoint::new(*id, format!("node-{id}"))).collect();
        let log = Log::new(Box::new(Memory::new())).expect("log init failed");
        let store = EngineNodeStore::new(Box::new(Memory::new())).expect("store init failed");
        Server::new(id, endpoints, log, Box::new(store), Box::new(mesh.connect(id)), opts)
    }

    /// Options for a node that should win the election immediately.
    fn eager() -> Options {
        Options {
            election_timeout: Duration::from_millis(25)..Duration::from_millis(50),
            replication_interval: Duration::from_millis(10),
            min_replication_interval: Duration::from_millis(5),
            ..Options::default()
        }
    }

    /// Options for a node that shouldn't campaign while the test runs.
    fn patient() -> Options {
        Options {
            election_timeout: Duration::from_secs(30)..Duration::from_secs(60),
            ..eager()
        }
    }

    fn wait_for(what: &str, predicate: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn solo_server_elects_and_applies() {
        let mesh = ChannelMesh::new();
        let mut server = server(&mesh, 1, &[1], eager());
        let state = TestState::new();
        server.register_state_machine(Box::new(state.clone())).expect("register failed");
        server.start().expect("start failed");
        server.start().expect("start is idempotent");

        wait_for("leadership", || server.role_report().0 == RoleName::Leader);
        assert_eq!(server.role_report(), (RoleName::Leader, Some(1)));

        server.append(vec![0x07]).expect("append failed");
        wait_for("command application", || state.writes() == vec![vec![0x07]]);

        server.stop().expect("stop failed");
        assert!(server.stop().is_err());
        assert!(server.start().is_err());
    }

    #[test]
    fn cluster_replicates_and_rejects_follower_appends() {
        let mesh = ChannelMesh::new();
        let mut leader = server(&mesh, 1, &[1, 2, 3], eager());
        let mut followers: Vec<Server> =
            [2, 3].iter().map(|id| server(&mesh, *id, &[1, 2, 3], patient())).collect();

        let leader_state = TestState::new();
        leader.register_state_machine(Box::new(leader_state.clone())).expect("register failed");
        let follower_states: Vec<TestState> = followers
            .iter()
            .map(|follower| {
                let state = TestState::new();
                follower.register_state_machine(Box::new(state.clone())).expect("register failed");
                state
            })
            .collect();

        leader.start().expect("start failed");
        for follower in &mut followers {
            follower.start().expect("start failed");
        }

        wait_for("leadership", || leader.role_report().0 == RoleName::Leader);
        wait_for("followers to learn the leader", || {
            followers.iter().all(|f| f.role_report() == (RoleName::Follower, Some(1)))
        });

        // Appends to a follower name the leader to go to instead.
        assert_eq!(
            followers[0].append(vec![0xff]),
            Err(Error::NotLeader { role: RoleName::Follower, leader: Some(1) })
        );

        leader.append(vec![0x01]).expect("append failed");
        leader.append(vec![0x02]).expect("append failed");
        let expected = vec![vec![0x01], vec![0x02]];
        wait_for("replication to all nodes", || {
            leader_state.writes() == expected
                && follower_states.iter().all(|state| state.writes() == expected)
        });

        for follower in &mut followers {
            follower.stop().expect("stop failed");
        }
        leader.stop().expect("stop failed");
    }

    #[test]
    fn membership_change_adds_and_removes_node() {
        let mesh = ChannelMesh::new();
        let mut leader = server(&mesh, 1, &[1, 2], eager());
        let mut peer = server(&mesh, 2, &[1, 2], patient());

        // The new node starts alone in standby mode, waiting to be added.
        let mut newcomer = server(&mesh, 3, &[3], Options { mode: Mode::Standby, ..patient() });
        let newcomer_state = TestState::new();
        newcomer.register_state_machine(Box::new(newcomer_state.clone())).expect("register failed");

        leader.start().expect("start failed");
        peer.start().expect("start failed");
        newcomer.start().expect("start failed");
        wait_for("leadership", || leader.role_report().0 == RoleName::Leader);

        let handle = leader.add_node(Endpoint::new(3, "node-3".into())).expect("add failed");
        assert_eq!(handle.wait(Duration::from_secs(5)), ChangeResult::Ok);
        assert!(handle.is_done());

        // The new node replicates like any member now.
        leader.append(vec![0x09]).expect("append failed");
        wait_for("replication to the new node", || {
            newcomer_state.writes() == vec![vec![0x09]]
        });

        // And can be removed again.
        let handle = leader.remove_node(3).expect("remove failed");
        assert_eq!(handle.wait(Duration::from_secs(5)), ChangeResult::Ok);

        // Adding ourselves is refused outright.
        assert!(matches!(
            leader.add_node(Endpoint::new(1, "node-1".into())),
            Err(Error::InvalidInput(_))
        ));

        newcomer.stop().expect("stop failed");
        peer.stop().expect("stop failed");
        leader.stop().expect("stop failed");
    }
}
