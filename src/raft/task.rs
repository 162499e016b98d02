use super::{Endpoint, Index, NodeId};
use crate::error::{Error, Result};

use crossbeam::channel::Sender;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// The final outcome of a group membership change, delivered through a
/// [`ChangeHandle`]. These are results, not errors: the request itself was
/// accepted, but may not have gone through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeResult {
    /// The change was committed.
    Ok,
    /// Replication to the new node failed.
    ReplicationFailed,
    /// The change did not complete in time.
    Timeout,
    /// The change failed or was cancelled.
    Error,
}

/// A single-assignment completion slot shared between the caller, the
/// membership worker, and the actor. The caller's thread and the actor
/// thread are distinct, so this is a waitable cell rather than a future.
#[derive(Clone, Default)]
pub struct Completion {
    inner: Arc<(Mutex<Option<ChangeResult>>, Condvar)>,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completes with the given result. The first result wins, later ones
    /// are ignored.
    pub fn set(&self, result: ChangeResult) {
        let (slot, signal) = &*self.inner;
        let mut slot = lock(slot);
        if slot.is_none() {
            *slot = Some(result);
            signal.notify_all();
        }
    }

    /// Returns true if a result has been set.
    pub fn done(&self) -> bool {
        lock(&self.inner.0).is_some()
    }

    /// Waits for the result, or returns None if the timeout expires first.
    /// No timeout waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<ChangeResult> {
        let (slot, signal) = &*self.inner;
        let mut slot = lock(slot);
        let deadline = timeout.map(|t| Instant::now() + t);
        while slot.is_none() {
            slot = match deadline {
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return None;
                    };
                    let (slot, _) = signal
                        .wait_timeout(slot, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    slot
                }
                None => signal.wait(slot).unwrap_or_else(PoisonError::into_inner),
            };
        }
        *slot
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A handle to a submitted group membership change. The change completes in
/// the background; the handle lets the caller await the outcome.
pub struct ChangeHandle {
    completion: Completion,
}

impl ChangeHandle {
    pub(crate) fn new(completion: Completion) -> Self {
        Self { completion }
    }

    /// A handle whose outcome is already known, e.g. a failed catch-up.
    pub(crate) fn fixed(result: ChangeResult) -> Self {
        let completion = Completion::new();
        completion.set(result);
        Self { completion }
    }

    /// Returns true if the change has completed.
    pub fn is_done(&self) -> bool {
        self.completion.done()
    }

    /// Waits for the outcome. An expired timeout yields ChangeResult::Timeout.
    pub fn wait(&self, timeout: Duration) -> ChangeResult {
        self.completion.wait(Some(timeout)).unwrap_or(ChangeResult::Timeout)
    }

    /// Cancels the change. Waiters observe ChangeResult::Error; a change
    /// already applied on the actor is not rolled back.
    pub fn cancel(&self) {
        self.completion.set(ChangeResult::Error);
    }
}

/// A group membership change.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    /// Adds a caught-up node, with the replication state derived from its
    /// catch-up.
    Add { endpoint: Endpoint, next_index: Index, match_index: Index },
    /// Removes a node.
    Remove { id: NodeId },
}

/// An in-flight membership change: the change itself, the index of its group
/// config entry once appended, and the completion the caller waits on.
pub struct PendingChange {
    pub change: Change,
    pub entry_index: Option<Index>,
    pub completion: Completion,
}

/// Holds the at-most-one in-flight membership change. Checked and installed
/// under its lock, so concurrent add/remove callers race cleanly: the loser
/// fails fast with ConcurrentChange.
#[derive(Clone, Default)]
pub struct ChangeHolder {
    inner: Arc<Mutex<Option<PendingChange>>>,
}

impl ChangeHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new in-flight change. Fails with ConcurrentChange if one is
    /// already in flight; a completed but uncollected change is replaced.
    pub fn install(&self, change: Change, completion: Completion) -> Result<()> {
        let mut slot = lock(&self.inner);
        if let Some(pending) = &*slot {
            if !pending.completion.done() {
                return Err(Error::ConcurrentChange);
            }
        }
        *slot = Some(PendingChange { change, entry_index: None, completion });
        Ok(())
    }

    /// Waits for a previous change to finish, clearing it once done. Returns
    /// the result to hand the caller if the wait times out.
    pub fn await_previous(&self, timeout: Duration) -> std::result::Result<(), ChangeResult> {
        let completion = match &*lock(&self.inner) {
            Some(pending) => pending.completion.clone(),
            None => return Ok(()),
        };
        if completion.wait(Some(timeout)).is_none() {
            log::info!("previous group config change did not complete within {timeout:?}");
            return Err(ChangeResult::Timeout);
        }
        let mut slot = lock(&self.inner);
        if slot.as_ref().map(|p| p.completion.done()).unwrap_or(false) {
            *slot = None;
        }
        Ok(())
    }

    /// Records the log index of the change's group config entry.
    pub fn set_entry_index(&self, index: Index) {
        if let Some(pending) = &mut *lock(&self.inner) {
            pending.entry_index = Some(index);
        }
    }

    /// Takes the in-flight change if its group config entry is the one that
    /// committed at the given index.
    pub fn take_committed(&self, index: Index) -> Option<PendingChange> {
        let mut slot = lock(&self.inner);
        match &*slot {
            Some(pending) if pending.entry_index == Some(index) => slot.take(),
            _ => None,
        }
    }

    /// Fails the in-flight change, if any. Used when the change can no longer
    /// complete, e.g. on shutdown or when leadership was lost mid-change.
    pub fn fail_in_flight(&self) {
        let mut slot = lock(&self.inner);
        if let Some(pending) = slot.take() {
            pending.completion.set(ChangeResult::Error);
        }
    }
}

/// The outcome of catching a prospective new member up to the log tail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatchUpOutcome {
    /// The node reached the log tail. next_index and match_index seed its
    /// replication state when it joins the group.
    Caught { next_index: Index, match_index: Index },
    /// Replication to the node failed.
    ReplicationFailed,
    /// The node did not reach the tail within the allowed rounds, or a round
    /// took too long.
    Timeout,
    /// A catch-up for this node is already running.
    Duplicate,
}

/// An in-flight catch-up session for a prospective new member. The node
/// streams log entries (and snapshots) to the member and tracks progress
/// here; the caller blocks on done until the session ends.
pub struct CatchUp {
    pub endpoint: Endpoint,
    pub next_index: Index,
    pub match_index: Index,
    round: u64,
    last_advanced_at: Instant,
    done: Sender<CatchUpOutcome>,
}

impl CatchUp {
    pub fn new(endpoint: Endpoint, next_index: Index, done: Sender<CatchUpOutcome>) -> Self {
        Self {
            endpoint,
            next_index,
            match_index: 0,
            round: 1,
            last_advanced_at: Instant::now(),
            done,
        }
    }

    /// Records that the member's log matches up to last_entry_index.
    pub fn advance(&mut self, last_entry_index: Index) {
        self.match_index = last_entry_index;
        self.next_index = last_entry_index + 1;
        self.last_advanced_at = Instant::now();
    }

    /// Starts the next round, returning its number.
    pub fn next_round(&mut self) -> u64 {
        self.round += 1;
        self.round
    }

    /// Backs the next index off by one after a rejected append.
    pub fn back_off(&mut self) {
        self.next_index = self.next_index.saturating_sub(1).max(1);
    }

    /// How long ago the member last made progress.
    pub fn stalled_for(&self) -> Duration {
        self.last_advanced_at.elapsed()
    }

    /// Ends the session with the given outcome. The caller may have given up
    /// already, in which case the outcome goes nowhere.
    pub fn finish(self, outcome: CatchUpOutcome) {
        let _ = self.done.send(outcome);
    }
}

/// The bounded set of in-flight catch-up sessions, keyed by node id.
#[derive(Default)]
pub struct CatchUpGroup {
    tasks: HashMap<NodeId, CatchUp>,
}

impl CatchUpGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a session for this node is in flight.
    pub fn contains(&self, id: NodeId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Registers a session. Fails on duplicates for the same node.
    pub fn add(&mut self, task: CatchUp) -> Result<()> {
        let id = task.endpoint.id;
        if self.tasks.insert(id, task).is_some() {
            return Err(Error::InvalidInput(format!("node {id} is already being added")));
        }
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> Option<&CatchUp> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut CatchUp> {
        self.tasks.get_mut(&id)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<CatchUp> {
        self.tasks.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[test]
    fn completion_is_single_assignment() {
        let completion = Completion::new();
        assert!(!completion.done());
        assert_eq!(completion.wait(Some(Duration::from_millis(10))), None);

        completion.set(ChangeResult::Ok);
        completion.set(ChangeResult::Error);
        assert_eq!(completion.wait(None), Some(ChangeResult::Ok));
        assert!(completion.done());
    }

    #[test]
    fn completion_wakes_waiter() {
        let completion = Completion::new();
        let waiter = completion.clone();
        let handle = std::thread::spawn(move || waiter.wait(Some(Duration::from_secs(5))));
        completion.set(ChangeResult::ReplicationFailed);
        assert_eq!(handle.join().expect("waiter panicked"), Some(ChangeResult::ReplicationFailed));
    }

    #[test]
    fn holder_allows_one_change_in_flight() {
        let holder = ChangeHolder::new();
        let first = Completion::new();
        holder.install(Change::Remove { id: 2 }, first.clone()).expect("install failed");

        // A second change fails fast while the first is in flight.
        assert_eq!(
            holder.install(Change::Remove { id: 3 }, Completion::new()),
            Err(Error::ConcurrentChange)
        );
        assert_eq!(
            holder.await_previous(Duration::from_millis(10)),
            Err(ChangeResult::Timeout)
        );

        // Once the first completes, the next change can proceed.
        first.set(ChangeResult::Ok);
        assert_eq!(holder.await_previous(Duration::from_millis(10)), Ok(()));
        holder.install(Change::Remove { id: 3 }, Completion::new()).expect("install failed");
    }

    #[test]
    fn holder_resolves_by_entry_index() {
        let holder = ChangeHolder::new();
        let completion = Completion::new();
        holder.install(Change::Remove { id: 2 }, completion).expect("install failed");
        holder.set_entry_index(7);

        assert!(holder.take_committed(6).is_none());
        let pending = holder.take_committed(7).expect("change not resolved");
        assert_eq!(pending.change, Change::Remove { id: 2 });
        // The holder is empty again.
        assert!(holder.take_committed(7).is_none());
    }
}
