use super::message::{AppendEntriesRpc, InstallSnapshotRpc};
use super::{Endpoint, NodeId, State, Term};
use crate::encoding::{bincode, Value as _};
use crate::error::{Error, Result};
use crate::storage;
use crate::{errinput, errinternal};

use crossbeam::channel::Sender;
use log::debug;
use serde::{Deserialize, Serialize};

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was added.
    pub term: Term,
    /// The replicated command.
    pub command: Command,
}

impl crate::encoding::Value for Entry {}

/// A command carried by a log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// An empty command, appended when a leader takes office to commit
    /// entries from previous terms (section 5.4.2 in the Raft paper).
    Noop,
    /// An application command, applied to the state machine once committed.
    Write(Vec<u8>),
    /// Adds a node to the group. members is the voting set before the change.
    AddNode { members: Vec<Endpoint>, node: Endpoint },
    /// Removes a node from the group. members is the voting set after the
    /// removal (the node is downgraded before the entry is appended).
    RemoveNode { members: Vec<Endpoint>, node: NodeId },
}

impl Command {
    /// Returns true if this is a group membership change.
    pub fn is_group_config(&self) -> bool {
        matches!(self, Command::AddNode { .. } | Command::RemoveNode { .. })
    }

    /// The voting set recorded when the entry was created, used to revert
    /// membership when appended group config entries are removed again.
    pub fn members(&self) -> Option<&[Endpoint]> {
        match self {
            Command::AddNode { members, .. } | Command::RemoveNode { members, .. } => Some(members),
            Command::Noop | Command::Write(_) => None,
        }
    }

    /// The voting set that results from applying this group config entry.
    pub fn result_members(&self) -> Option<Vec<Endpoint>> {
        match self {
            Command::AddNode { members, node } => {
                let mut members = members.clone();
                if !members.iter().any(|m| m.id == node.id) {
                    members.push(node.clone());
                }
                Some(members)
            }
            Command::RemoveNode { members, node } => {
                Some(members.iter().filter(|m| m.id != *node).cloned().collect())
            }
            Command::Noop | Command::Write(_) => None,
        }
    }
}

/// An event published by the log into the node's inbox. The log can't call
/// back into the node directly (the node owns it), so group config activity
/// is surfaced through a channel the node's event loop drains.
#[derive(Debug)]
pub enum LogEvent {
    /// A group config entry was appended from the leader. Non-leaders adopt
    /// the new membership as soon as the entry is appended.
    GroupConfigAppended { entry: Entry },
    /// A group config entry was committed. The leader resolves its pending
    /// membership change when this fires.
    GroupConfigCommitted { entry: Entry },
    /// Appended group config entries were removed by a log conflict. first is
    /// the earliest removed group config entry; membership reverts to the
    /// voting set recorded in it.
    GroupConfigsRemoved { first: Entry },
}

/// A snapshot of the state machine and membership up to a log index. Also
/// used as the assembly buffer while snapshot chunks are being received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Snapshot {
    last_index: Index,
    last_term: Term,
    members: Vec<Endpoint>,
    data: Vec<u8>,
}

impl crate::encoding::Value for Snapshot {}

/// A log storage key. Encoded with a tag byte followed by a big-endian entry
/// index, which preserves index order in the key/value store.
#[derive(Clone, Debug, PartialEq)]
enum Key {
    /// A log entry, by index.
    Entry(Index),
    /// The current commit index and term.
    CommitIndex,
    /// The most recent snapshot.
    Snapshot,
}

impl Key {
    fn encode(&self) -> Vec<u8> {
        match self {
            Key::Entry(index) => {
                let mut key = vec![0x00];
                key.extend(index.to_be_bytes());
                key
            }
            Key::CommitIndex => vec![0x01],
            Key::Snapshot => vec![0x02],
        }
    }
}

/// The replicated Raft log. Stores a sequence of commands that are replicated
/// across nodes and applied sequentially to the local state machine. Each
/// entry carries the term in which a leader proposed it.
///
/// In the steady state the log is append-only: the leader appends a command
/// via [`Log::append`] and replicates it to followers who append it via
/// [`Log::append_from_leader`]. Once an index is replicated to a majority it
/// becomes committed, making the log immutable up to that index. Uncommitted
/// entries can be replaced when a new leader overrides an old one.
///
/// The log has the following invariants:
///
/// * Entry indexes are contiguous (no gaps), starting after the snapshot.
/// * Entry terms never decrease from the previous entry.
/// * Appended entries are durable (flushed to disk).
/// * Committed entries are never changed or removed.
/// * Entries with the same index/term contain the same command, and identical
///   histories before it (section 5.3 in the Raft paper).
pub struct Log {
    /// The underlying storage engine. A trait object allows runtime engine
    /// selection and avoids generics throughout the node.
    engine: Box<dyn storage::Engine>,
    /// The state machine that committed commands are applied to, if any.
    state: Option<Box<dyn State>>,
    /// Publishes group config events into the node's inbox.
    events: Option<Sender<LogEvent>>,
    /// The most recent snapshot, if any. Entries at and below its last index
    /// have been compacted away.
    snapshot: Option<Snapshot>,
    /// A snapshot being received in chunks from the leader.
    installing: Option<Snapshot>,
    /// The index of the last stored entry.
    last_index: Index,
    /// The term of the last stored entry.
    last_term: Term,
    /// The index of the last committed entry.
    commit_index: Index,
    /// The term of the last committed entry.
    commit_term: Term,
}

impl Log {
    /// Initializes a log using the given storage engine.
    pub fn new(mut engine: Box<dyn storage::Engine>) -> Result<Self> {
        let snapshot = engine
            .get(&Key::Snapshot.encode())?
            .map(|v| Snapshot::decode(&v))
            .transpose()?;
        let snapshot_meta =
            snapshot.as_ref().map(|s| (s.last_index, s.last_term)).unwrap_or((0, 0));
        let (last_index, last_term) = engine
            .scan_dyn((
                std::ops::Bound::Included(Key::Entry(0).encode()),
                std::ops::Bound::Included(Key::Entry(Index::MAX).encode()),
            ))
            .next_back()
            .transpose()?
            .map(|(_, v)| Entry::decode(&v))
            .transpose()?
            .map(|e| (e.index, e.term))
            .unwrap_or(snapshot_meta);
        let (commit_index, commit_term) = engine
            .get(&Key::CommitIndex.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or(snapshot_meta);
        Ok(Self {
            engine,
            state: None,
            events: None,
            snapshot,
            installing: None,
            last_index,
            last_term,
            commit_index,
            commit_term,
        })
    }

    /// Registers the state machine that committed commands are applied to.
    /// Catches it up to the commit index straight away.
    pub fn set_state_machine(&mut self, state: Box<dyn State>) -> Result<()> {
        self.state = Some(state);
        self.apply_committed()
    }

    /// Registers the channel that group config events are published to.
    pub fn publish_to(&mut self, events: Sender<LogEvent>) {
        self.events = Some(events);
    }

    /// Returns the last entry index and term.
    pub fn last_entry_meta(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the index the next appended entry will get.
    pub fn next_index(&self) -> Index {
        self.last_index + 1
    }

    /// Returns the commit index and term.
    pub fn commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns true if our log is strictly newer than the given last entry
    /// meta, comparing (term, index) lexicographically.
    pub fn is_newer_than(&self, last_index: Index, last_term: Term) -> bool {
        (self.last_term, self.last_index) > (last_term, last_index)
    }

    /// Appends a command to the log at the given term and flushes it to disk,
    /// returning its index.
    pub fn append(&mut self, term: Term, command: Command) -> Result<Index> {
        assert!(term > 0, "can't append entry in term 0");
        assert!(term >= self.last_term, "term regression {} → {}", self.last_term, term);
        let entry = Entry { index: self.last_index + 1, term, command };
        self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        self.engine.flush()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Appends a group config entry adding node to the group. members is the
    /// current voting set, without the new node.
    pub fn append_for_add_node(
        &mut self,
        term: Term,
        members: Vec<Endpoint>,
        node: Endpoint,
    ) -> Result<Index> {
        self.append(term, Command::AddNode { members, node })
    }

    /// Appends a group config entry removing node from the group. members is
    /// the voting set after the removal.
    pub fn append_for_remove_node(
        &mut self,
        term: Term,
        members: Vec<Endpoint>,
        node: NodeId,
    ) -> Result<Index> {
        self.append(term, Command::RemoveNode { members, node })
    }

    /// Appends entries received from the leader. Returns false if the
    /// previous entry meta does not match our log. Existing entries that
    /// match by index and term are left alone, conflicting entries and
    /// everything after them are removed, and the remainder is appended.
    pub fn append_from_leader(
        &mut self,
        prev_index: Index,
        prev_term: Term,
        entries: Vec<Entry>,
    ) -> Result<bool> {
        if prev_index > 0 && !self.has(prev_index, prev_term)? {
            debug!("previous entry {prev_index}@{prev_term} not in log");
            return Ok(false);
        }
        if let Some(first) = entries.first() {
            if first.index != prev_index + 1 {
                return errinternal!("entries must start after {prev_index}, got {}", first.index);
            }
            if !entries.windows(2).all(|w| w[0].index + 1 == w[1].index) {
                return errinternal!("entries are not contiguous");
            }
        }

        // Skip entries that are already in the log (or the snapshot) with a
        // matching term, then locate the first conflict, if any.
        let snapshot_index = self.snapshot.as_ref().map(|s| s.last_index).unwrap_or(0);
        let mut new = entries.as_slice();
        while let Some(first) = new.first() {
            if first.index <= snapshot_index {
                new = &new[1..];
                continue;
            }
            if first.index > self.last_index {
                break;
            }
            let Some(existing) = self.get(first.index)? else {
                return errinternal!("log gap at index {}", first.index);
            };
            if existing.term != first.term {
                break;
            }
            new = &new[1..];
        }

        // Remove the conflicting entry and everything after it.
        let mut removed_config: Option<Entry> = None;
        if let Some(first) = new.first() {
            if first.index <= self.last_index {
                if first.index <= self.commit_index {
                    return errinternal!(
                        "leader would overwrite committed entry {}",
                        first.index
                    );
                }
                let removed = self.scan(first.index..)?.collect::<Result<Vec<_>>>()?;
                removed_config = removed.into_iter().find(|e| e.command.is_group_config());
                for index in first.index..=self.last_index {
                    self.engine.delete(&Key::Entry(index).encode())?;
                }
                let (last_index, last_term) = self.meta_at(first.index - 1)?;
                self.last_index = last_index;
                self.last_term = last_term;
            }
        }

        // Append the new entries.
        let appended = new.to_vec();
        for entry in &appended {
            self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        }
        self.engine.flush()?;
        if let Some(last) = appended.last() {
            self.last_index = last.index;
            self.last_term = last.term;
        }

        if let Some(first) = removed_config {
            self.publish(LogEvent::GroupConfigsRemoved { first });
        }
        for entry in appended.into_iter().filter(|e| e.command.is_group_config()) {
            self.publish(LogEvent::GroupConfigAppended { entry });
        }
        Ok(true)
    }

    /// Advances the commit index to the given index and applies newly
    /// committed commands to the state machine. Does nothing unless the index
    /// is beyond the current commit index and the entry at it carries the
    /// given term, which prevents a leader from directly committing entries
    /// from earlier terms (section 5.4.2 in the Raft paper).
    pub fn advance_commit_index(&mut self, index: Index, term: Term) -> Result<()> {
        if index <= self.commit_index {
            return Ok(());
        }
        let Some(entry) = self.get(index)? else {
            debug!("no entry at new commit index {index}");
            return Ok(());
        };
        if entry.term != term {
            debug!("entry term at commit index {index} is {}, not {term}", entry.term);
            return Ok(());
        }
        self.engine.set(&Key::CommitIndex.encode(), bincode::serialize(&(index, entry.term)))?;
        let old_commit_index = self.commit_index;
        self.commit_index = index;
        self.commit_term = entry.term;
        self.apply_committed()?;

        let committed = self
            .scan(old_commit_index + 1..=index)?
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|e| e.command.is_group_config());
        for entry in committed {
            self.publish(LogEvent::GroupConfigCommitted { entry });
        }
        Ok(())
    }

    /// Fetches an entry at an index, or None if it does not exist.
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        self.engine.get(&Key::Entry(index).encode())?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Checks if the log contains an entry with the given index and term. The
    /// snapshot's last entry counts as contained.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        if index == 0 || index > self.last_index {
            return Ok(false);
        }
        if (index, term) == (self.last_index, self.last_term) {
            return Ok(true);
        }
        if let Some(snapshot) = &self.snapshot {
            if index == snapshot.last_index {
                return Ok(term == snapshot.last_term);
            }
            if index < snapshot.last_index {
                return Ok(false);
            }
        }
        Ok(self.get(index)?.map(|e| e.term == term).unwrap_or(false))
    }

    /// Returns an iterator over log entries in the given index range.
    pub fn scan(&mut self, range: impl std::ops::RangeBounds<Index>) -> Result<Scan> {
        use std::ops::Bound;
        let from = match range.start_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(0).encode()),
        };
        let to = match range.end_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(Index::MAX).encode()),
        };
        Ok(Scan::new(self.engine.scan_dyn((from, to))))
    }

    /// Builds an AppendEntries RPC for a peer whose next expected index is
    /// next_index, with up to max_entries entries. Fails with EntryInSnapshot
    /// if the requested prefix has been compacted into a snapshot, in which
    /// case the caller should send the snapshot instead.
    pub fn append_entries_rpc(
        &mut self,
        term: Term,
        leader: NodeId,
        next_index: Index,
        max_entries: u64,
    ) -> Result<AppendEntriesRpc> {
        if next_index == 0 {
            return errinternal!("next index can't be 0");
        }
        if let Some(snapshot) = &self.snapshot {
            if next_index <= snapshot.last_index {
                return Err(Error::EntryInSnapshot);
            }
        }
        let (prev_index, prev_term) = self.meta_at(next_index - 1)?;
        let entries = if next_index <= self.last_index && max_entries > 0 {
            let to = std::cmp::min(self.last_index, next_index + max_entries - 1);
            self.scan(next_index..=to)?.collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        Ok(AppendEntriesRpc {
            id: rand::random(),
            term,
            leader,
            prev_index,
            prev_term,
            entries,
            leader_commit: self.commit_index,
        })
    }

    /// Builds an InstallSnapshot RPC carrying the snapshot chunk at the given
    /// offset, with up to chunk_size bytes.
    pub fn install_snapshot_rpc(
        &mut self,
        term: Term,
        leader: NodeId,
        offset: u64,
        chunk_size: u64,
    ) -> Result<InstallSnapshotRpc> {
        let Some(snapshot) = &self.snapshot else {
            return errinternal!("no snapshot to send");
        };
        let len = snapshot.data.len() as u64;
        if offset > len {
            return errinternal!("snapshot chunk offset {offset} beyond data length {len}");
        }
        let end = std::cmp::min(offset + chunk_size, len);
        Ok(InstallSnapshotRpc {
            term,
            leader,
            last_index: snapshot.last_index,
            last_term: snapshot.last_term,
            members: snapshot.members.clone(),
            offset,
            data: snapshot.data[offset as usize..end as usize].to_vec(),
            done: end == len,
        })
    }

    /// Installs a snapshot chunk received from the leader. Chunks must arrive
    /// in order, starting at offset 0. When the final chunk arrives, the
    /// snapshot replaces the covered log prefix and is restored into the
    /// state machine.
    pub fn install_snapshot(&mut self, rpc: &InstallSnapshotRpc) -> Result<()> {
        if rpc.offset == 0 {
            self.installing = Some(Snapshot {
                last_index: rpc.last_index,
                last_term: rpc.last_term,
                members: rpc.members.clone(),
                data: rpc.data.clone(),
            });
        } else {
            let Some(installing) = &mut self.installing else {
                return errinput!("no snapshot installation in progress");
            };
            if rpc.offset != installing.data.len() as u64 {
                return errinput!(
                    "unexpected snapshot chunk offset {} (expected {})",
                    rpc.offset,
                    installing.data.len()
                );
            }
            installing.data.extend_from_slice(&rpc.data);
        }
        if !rpc.done {
            return Ok(());
        }

        let snapshot = self.installing.take().expect("snapshot installation just progressed");
        if snapshot.last_index <= self.commit_index {
            debug!("snapshot at {} is stale, ignoring", snapshot.last_index);
            return Ok(());
        }

        // If the log contains the snapshot's last entry the following entries
        // remain valid, otherwise the whole log is replaced by the snapshot.
        let retain = self.has(snapshot.last_index, snapshot.last_term)?;
        let first = self.snapshot.as_ref().map(|s| s.last_index + 1).unwrap_or(1);
        let until = if retain { snapshot.last_index } else { self.last_index };
        for index in first..=until {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        if !retain {
            self.last_index = snapshot.last_index;
            self.last_term = snapshot.last_term;
        }
        self.commit_index = snapshot.last_index;
        self.commit_term = snapshot.last_term;
        self.engine.set(&Key::Snapshot.encode(), snapshot.encode())?;
        self.engine.set(
            &Key::CommitIndex.encode(),
            bincode::serialize(&(self.commit_index, self.commit_term)),
        )?;
        self.engine.flush()?;
        if let Some(state) = self.state.as_mut() {
            state.restore(snapshot.last_index, &snapshot.data)?;
        }
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Compacts the log by snapshotting the state machine at its applied
    /// index and removing the covered entries. members is the current voting
    /// set, recorded so snapshot receivers learn the membership too.
    pub fn compact(&mut self, members: Vec<Endpoint>) -> Result<()> {
        let Some(applied) = self.state.as_ref().map(|s| s.applied_index()) else {
            return errinternal!("no state machine to snapshot");
        };
        let compacted = self.snapshot.as_ref().map(|s| s.last_index).unwrap_or(0);
        if applied <= compacted {
            return Ok(());
        }
        let Some(entry) = self.get(applied)? else {
            return errinternal!("no entry at applied index {applied}");
        };
        let data = self.state.as_ref().expect("state machine present").snapshot()?;
        let snapshot = Snapshot { last_index: applied, last_term: entry.term, members, data };
        for index in compacted.max(1)..=applied {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.set(&Key::Snapshot.encode(), snapshot.encode())?;
        self.engine.flush()?;
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Flushes the log to durable storage and closes it.
    pub fn close(&mut self) -> Result<()> {
        self.engine.flush()
    }

    /// Applies committed but unapplied entries to the state machine, if one
    /// is registered.
    fn apply_committed(&mut self) -> Result<()> {
        let Some(applied) = self.state.as_ref().map(|s| s.applied_index()) else {
            return Ok(());
        };
        if applied >= self.commit_index {
            return Ok(());
        }
        let entries = self.scan(applied + 1..=self.commit_index)?.collect::<Result<Vec<_>>>()?;
        let state = self.state.as_mut().expect("state machine present");
        for entry in entries {
            debug!("applying {}@{}", entry.index, entry.term);
            state.apply(&entry)?;
        }
        Ok(())
    }

    /// Returns the entry meta at the given index, falling back to the
    /// snapshot's last entry and to (0, 0) for the log origin.
    fn meta_at(&mut self, index: Index) -> Result<(Index, Term)> {
        if index == 0 {
            return Ok((0, 0));
        }
        if let Some(snapshot) = &self.snapshot {
            if index == snapshot.last_index {
                return Ok((snapshot.last_index, snapshot.last_term));
            }
        }
        match self.get(index)? {
            Some(entry) => Ok((entry.index, entry.term)),
            None => errinternal!("no entry at index {index}"),
        }
    }

    /// Publishes a log event, if a subscriber is registered. A dropped
    /// subscriber is fine, e.g. for standalone log use in tests.
    fn publish(&self, event: LogEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("log event subscriber is gone");
            }
        }
    }
}

/// A log entry iterator.
pub struct Scan<'a> {
    inner: Box<dyn storage::ScanIterator + 'a>,
}

impl<'a> Scan<'a> {
    fn new(inner: Box<dyn storage::ScanIterator + 'a>) -> Self {
        Self { inner }
    }
}

impl std::iter::Iterator for Scan<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.and_then(|(_, v)| Entry::decode(&v)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::tests::TestState;
    use super::*;
    use crate::storage::Memory;

    use crossbeam::channel::Receiver;

    fn setup() -> (Log, Receiver<LogEvent>) {
        let mut log = Log::new(Box::new(Memory::new())).expect("log init failed");
        let (event_tx, event_rx) = crossbeam::channel::unbounded();
        log.publish_to(event_tx);
        (log, event_rx)
    }

    fn endpoints(ids: &[NodeId]) -> Vec<Endpoint> {
        ids.iter().map(|id| Endpoint::new(*id, format!("node-{id}"))).collect()
    }

    #[test]
    fn append() -> Result<()> {
        let (mut log, _events) = setup();
        assert_eq!(log.last_entry_meta(), (0, 0));
        assert_eq!(log.next_index(), 1);

        assert_eq!(log.append(1, Command::Noop)?, 1);
        assert_eq!(log.append(1, Command::Write(vec![0x01]))?, 2);
        assert_eq!(log.append(2, Command::Write(vec![0x02]))?, 3);
        assert_eq!(log.last_entry_meta(), (3, 2));
        assert_eq!(log.next_index(), 4);

        let entry = log.get(2)?.expect("entry not found");
        assert_eq!(entry, Entry { index: 2, term: 1, command: Command::Write(vec![0x01]) });
        assert_eq!(log.get(4)?, None);
        Ok(())
    }

    #[test]
    fn append_from_leader_rejects_missing_prev() -> Result<()> {
        let (mut log, _events) = setup();
        log.append(1, Command::Noop)?;

        // A base entry past the end of the log is rejected.
        let entries = vec![Entry { index: 3, term: 1, command: Command::Noop }];
        assert!(!log.append_from_leader(2, 1, entries)?);

        // A base entry with a mismatching term is rejected.
        let entries = vec![Entry { index: 2, term: 2, command: Command::Noop }];
        assert!(!log.append_from_leader(1, 2, entries)?);
        Ok(())
    }

    #[test]
    fn append_from_leader_is_idempotent() -> Result<()> {
        let (mut log, _events) = setup();
        let entries = vec![
            Entry { index: 1, term: 1, command: Command::Noop },
            Entry { index: 2, term: 1, command: Command::Write(vec![0x01]) },
        ];
        assert!(log.append_from_leader(0, 0, entries.clone())?);
        assert_eq!(log.last_entry_meta(), (2, 1));

        // Replaying entries already in the log succeeds without mutating it.
        assert!(log.append_from_leader(0, 0, entries)?);
        assert_eq!(log.last_entry_meta(), (2, 1));
        assert_eq!(log.scan(..)?.count(), 2);
        Ok(())
    }

    #[test]
    fn append_from_leader_truncates_conflicts() -> Result<()> {
        let (mut log, _events) = setup();
        log.append(1, Command::Noop)?;
        log.append(1, Command::Write(vec![0x01]))?;
        log.append(1, Command::Write(vec![0x02]))?;

        // A new leader in term 2 overrides entries 2 and 3.
        let entries = vec![Entry { index: 2, term: 2, command: Command::Write(vec![0x07]) }];
        assert!(log.append_from_leader(1, 1, entries)?);
        assert_eq!(log.last_entry_meta(), (2, 2));
        assert_eq!(
            log.get(2)?,
            Some(Entry { index: 2, term: 2, command: Command::Write(vec![0x07]) })
        );
        assert_eq!(log.get(3)?, None);
        Ok(())
    }

    #[test]
    fn append_from_leader_refuses_committed_overwrite() -> Result<()> {
        let (mut log, _events) = setup();
        log.append(1, Command::Noop)?;
        log.append(1, Command::Write(vec![0x01]))?;
        log.advance_commit_index(2, 1)?;

        let entries = vec![Entry { index: 2, term: 2, command: Command::Noop }];
        assert!(log.append_from_leader(1, 1, entries).is_err());
        Ok(())
    }

    #[test]
    fn commit_requires_current_term() -> Result<()> {
        let (mut log, _events) = setup();
        log.append(1, Command::Noop)?;
        log.append(1, Command::Write(vec![0x01]))?;

        // Entry 2 has term 1, so a term 2 leader can't commit it directly.
        log.advance_commit_index(2, 2)?;
        assert_eq!(log.commit_index(), (0, 0));

        // Once a term 2 entry covers it, the whole prefix commits.
        log.append(2, Command::Noop)?;
        log.advance_commit_index(3, 2)?;
        assert_eq!(log.commit_index(), (3, 2));

        // The commit index never regresses.
        log.advance_commit_index(2, 1)?;
        assert_eq!(log.commit_index(), (3, 2));
        Ok(())
    }

    #[test]
    fn commit_applies_to_state_machine() -> Result<()> {
        let (mut log, _events) = setup();
        let state = TestState::new();
        log.set_state_machine(Box::new(state.clone()))?;

        log.append(1, Command::Noop)?;
        log.append(1, Command::Write(vec![0x01]))?;
        log.append(1, Command::Write(vec![0x02]))?;
        log.advance_commit_index(2, 1)?;
        assert_eq!(state.writes(), vec![vec![0x01]]);
        assert_eq!(state.applied_index(), 2);

        log.advance_commit_index(3, 1)?;
        assert_eq!(state.writes(), vec![vec![0x01], vec![0x02]]);
        assert_eq!(state.applied_index(), 3);
        Ok(())
    }

    #[test]
    fn group_config_events() -> Result<()> {
        let (mut log, events) = setup();

        // Appending a group config entry from the leader fires an event.
        let config = Entry {
            index: 1,
            term: 1,
            command: Command::AddNode {
                members: endpoints(&[1, 2]),
                node: Endpoint::new(3, "node-3".into()),
            },
        };
        assert!(log.append_from_leader(0, 0, vec![config.clone()])?);
        match events.try_recv() {
            Ok(LogEvent::GroupConfigAppended { entry }) => assert_eq!(entry, config),
            other => panic!("unexpected event {other:?}"),
        }

        // Committing it fires an event.
        log.advance_commit_index(1, 1)?;
        match events.try_recv() {
            Ok(LogEvent::GroupConfigCommitted { entry }) => assert_eq!(entry, config),
            other => panic!("unexpected event {other:?}"),
        }

        // A conflicting append that removes it fires an event.
        let noop = Entry { index: 2, term: 1, command: Command::Noop };
        let config = Entry {
            index: 3,
            term: 1,
            command: Command::RemoveNode { members: endpoints(&[1, 2]), node: 3 },
        };
        assert!(log.append_from_leader(1, 1, vec![noop.clone(), config.clone()])?);
        assert!(events.try_recv().is_ok()); // appended event for the config entry

        let replacement = Entry { index: 2, term: 2, command: Command::Noop };
        assert!(log.append_from_leader(1, 1, vec![replacement])?);
        match events.try_recv() {
            Ok(LogEvent::GroupConfigsRemoved { first }) => assert_eq!(first, config),
            other => panic!("unexpected event {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn snapshot_round_trip() -> Result<()> {
        let (mut leader, _events) = setup();
        let state = TestState::new();
        leader.set_state_machine(Box::new(state.clone()))?;
        leader.append(1, Command::Noop)?;
        leader.append(1, Command::Write(vec![0x01]))?;
        leader.append(1, Command::Write(vec![0x02]))?;
        leader.advance_commit_index(3, 1)?;
        leader.compact(endpoints(&[1, 2]))?;

        // The compacted prefix can no longer be served as entries.
        assert_eq!(leader.append_entries_rpc(1, 1, 2, 10), Err(Error::EntryInSnapshot));

        // Transfer the snapshot in chunks of 2 bytes.
        let (mut follower, _follower_events) = setup();
        let follower_state = TestState::new();
        follower.set_state_machine(Box::new(follower_state.clone()))?;
        let mut offset = 0;
        loop {
            let rpc = leader.install_snapshot_rpc(1, 1, offset, 2)?;
            assert_eq!(rpc.offset, offset);
            let done = rpc.done;
            follower.install_snapshot(&rpc)?;
            if done {
                break;
            }
            offset += rpc.data.len() as u64;
        }
        assert_eq!(follower.last_entry_meta(), (3, 1));
        assert_eq!(follower.commit_index(), (3, 1));
        assert_eq!(follower_state.writes(), state.writes());

        // Replication resumes after the snapshot.
        leader.append(1, Command::Write(vec![0x03]))?;
        let rpc = leader.append_entries_rpc(1, 1, 4, 10)?;
        assert_eq!((rpc.prev_index, rpc.prev_term), (3, 1));
        assert!(follower.append_from_leader(rpc.prev_index, rpc.prev_term, rpc.entries)?);
        assert_eq!(follower.last_entry_meta(), (4, 1));
        Ok(())
    }

    #[test]
    fn snapshot_chunks_must_be_ordered() -> Result<()> {
        let (mut leader, _events) = setup();
        let state = TestState::new();
        leader.set_state_machine(Box::new(state.clone()))?;
        leader.append(1, Command::Write(vec![0x01]))?;
        leader.advance_commit_index(1, 1)?;
        leader.compact(endpoints(&[1]))?;

        let (mut follower, _follower_events) = setup();
        let rpc = leader.install_snapshot_rpc(1, 1, 2, 2)?;
        assert!(follower.install_snapshot(&rpc).is_err());
        Ok(())
    }
}
