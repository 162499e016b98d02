use super::{Index, NodeId};

use itertools::Itertools as _;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A node endpoint: the node id plus the address the transport delivers to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: NodeId,
    pub address: String,
}

impl Endpoint {
    pub fn new(id: NodeId, address: String) -> Self {
        Self { id, address }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// A group member, with the leader's replication bookkeeping for it. The
/// bookkeeping is only meaningful on the leader, and is reset whenever a node
/// takes office.
pub struct Member {
    endpoint: Endpoint,
    /// The next log index to replicate to this member.
    next_index: Index,
    /// The last log index known to match this member.
    match_index: Index,
    /// Whether the member votes and counts toward the majority.
    major: bool,
    /// Whether the member is being removed from the group.
    removing: bool,
    /// Whether a replication RPC to this member is in flight.
    replicating: bool,
    /// When the last replication RPC was sent.
    last_replicated_at: Option<Instant>,
}

impl Member {
    fn new(endpoint: Endpoint, next_index: Index, match_index: Index, major: bool) -> Self {
        Self {
            endpoint,
            next_index,
            match_index,
            major,
            removing: false,
            replicating: false,
            last_replicated_at: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.endpoint.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn next_index(&self) -> Index {
        self.next_index
    }

    pub fn match_index(&self) -> Index {
        self.match_index
    }

    pub fn is_major(&self) -> bool {
        self.major
    }

    pub fn is_removing(&self) -> bool {
        self.removing
    }

    /// Returns true if a replication RPC should be sent to this member:
    /// either none is in flight, or the last one was sent longer than
    /// min_interval ago and is presumed lost.
    pub fn should_replicate(&self, min_interval: Duration) -> bool {
        !self.replicating
            || self.last_replicated_at.map(|at| at.elapsed() >= min_interval).unwrap_or(true)
    }

    /// Marks a replication RPC as in flight.
    pub fn start_replicating(&mut self) {
        self.replicating = true;
        self.last_replicated_at = Some(Instant::now());
    }

    /// Marks replication as idle.
    pub fn stop_replicating(&mut self) {
        self.replicating = false;
    }

    /// Records that the member's log matches up to last_entry_index. Returns
    /// true if this changed the replication state.
    pub fn advance(&mut self, last_entry_index: Index) -> bool {
        let changed =
            self.match_index != last_entry_index || self.next_index != last_entry_index + 1;
        self.match_index = last_entry_index;
        self.next_index = last_entry_index + 1;
        changed
    }

    /// Backs the next index off by one after a rejected append, to probe for
    /// the last matching entry. Returns false when already at the floor.
    pub fn back_off(&mut self) -> bool {
        if self.next_index <= 1 {
            return false;
        }
        self.next_index -= 1;
        true
    }

    fn reset(&mut self, next_index: Index) {
        self.next_index = next_index;
        self.match_index = 0;
        self.replicating = false;
        self.last_replicated_at = None;
    }
}

/// The cluster membership registry: the addressable set of group members,
/// keyed by node id. Mutated only on the node's actor thread.
pub struct Group {
    self_id: NodeId,
    members: HashMap<NodeId, Member>,
}

impl Group {
    /// Creates a group from the initial endpoints. All initial members vote.
    pub fn new(self_id: NodeId, endpoints: Vec<Endpoint>) -> Self {
        let members = endpoints
            .into_iter()
            .map(|endpoint| (endpoint.id, Member::new(endpoint, 1, 0, true)))
            .collect();
        Self { self_id, members }
    }

    /// Returns true if the local node is the only group member.
    pub fn is_sole_member(&self) -> bool {
        self.members.len() == 1 && self.members.contains_key(&self.self_id)
    }

    /// Returns true if the given node is a voting member.
    pub fn is_major(&self, id: NodeId) -> bool {
        self.members.get(&id).map(|m| m.major).unwrap_or(false)
    }

    /// Returns the number of voting members.
    pub fn major_count(&self) -> usize {
        self.members.values().filter(|m| m.major).count()
    }

    /// Returns the endpoints of all voting members, ordered by id.
    pub fn major_endpoints(&self) -> Vec<Endpoint> {
        self.members
            .values()
            .filter(|m| m.major)
            .map(|m| m.endpoint.clone())
            .sorted_by_key(|e| e.id)
            .collect()
    }

    /// Returns the endpoints of all voting members except the given one,
    /// ordered by id. Used to broadcast vote requests.
    pub fn major_endpoints_except(&self, id: NodeId) -> Vec<Endpoint> {
        self.major_endpoints().into_iter().filter(|e| e.id != id).collect()
    }

    /// Returns a member by id.
    pub fn member(&self, id: NodeId) -> Option<&Member> {
        self.members.get(&id)
    }

    /// Returns a mutable member by id.
    pub fn member_mut(&mut self, id: NodeId) -> Option<&mut Member> {
        self.members.get_mut(&id)
    }

    /// Returns the ids of all replication targets (everyone but ourselves),
    /// ordered by id.
    pub fn replication_targets(&self) -> Vec<NodeId> {
        self.members.keys().copied().filter(|id| *id != self.self_id).sorted().collect()
    }

    /// Returns the highest log index known to match a majority of voting
    /// members. The local node is not counted: the leader's own log always
    /// contains everything, so with its implicit vote the middle match index
    /// of the other voting members is the majority bound. None if there are
    /// no other voting members.
    pub fn quorum_match_index(&self) -> Option<Index> {
        let matches: Vec<Index> = self
            .members
            .values()
            .filter(|m| m.major && m.id() != self.self_id)
            .map(|m| m.match_index)
            .sorted()
            .collect();
        if matches.is_empty() {
            return None;
        }
        Some(matches[matches.len() / 2])
    }

    /// Resets all peers' replication state when taking office, with the next
    /// index pointing at the leader's log tail.
    pub fn reset_replication(&mut self, next_index: Index) {
        for member in self.members.values_mut().filter(|m| m.id() != self.self_id) {
            member.reset(next_index);
        }
    }

    /// Adds a member, typically after a new node caught up.
    pub fn add(&mut self, endpoint: Endpoint, next_index: Index, match_index: Index, major: bool) {
        debug!("adding group member {endpoint}");
        self.members
            .insert(endpoint.id, Member::new(endpoint, next_index, match_index, major));
    }

    /// Downgrades a member so it no longer votes, ahead of removing it.
    /// Returns false if the member is unknown.
    pub fn downgrade(&mut self, id: NodeId) -> bool {
        let Some(member) = self.members.get_mut(&id) else {
            return false;
        };
        debug!("downgrading group member {id}");
        member.major = false;
        member.removing = true;
        true
    }

    /// Removes a member.
    pub fn remove(&mut self, id: NodeId) {
        debug!("removing group member {id}");
        self.members.remove(&id);
    }

    /// Replaces the membership with the given voting set, e.g. when a group
    /// config entry is appended from the leader or removed by a conflict.
    pub fn update(&mut self, endpoints: Vec<Endpoint>) {
        debug!("updating group members to {:?}", endpoints.iter().map(|e| e.id).collect_vec());
        self.members = endpoints
            .into_iter()
            .map(|endpoint| (endpoint.id, Member::new(endpoint, 1, 0, true)))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_case::test_case;

    fn group(self_id: NodeId, ids: &[NodeId]) -> Group {
        let endpoints =
            ids.iter().map(|id| Endpoint::new(*id, format!("node-{id}"))).collect();
        Group::new(self_id, endpoints)
    }

    #[test]
    fn sole_member() {
        assert!(group(1, &[1]).is_sole_member());
        assert!(!group(1, &[1, 2]).is_sole_member());
        // A group that doesn't contain the local node is not sole either.
        assert!(!group(1, &[2]).is_sole_member());
    }

    // The quorum match index is the index a majority of voters (counting the
    // local node) have confirmed.
    #[test_case(&[(2, 5)], 5; "one peer matches its index")]
    #[test_case(&[(2, 5), (3, 3)], 5; "one of two peers plus self is enough")]
    #[test_case(&[(2, 5), (3, 3), (4, 0)], 3; "two of four nodes is not a majority")]
    #[test_case(&[(2, 0), (3, 0)], 0; "nothing matched yet")]
    fn quorum_match_index(matches: &[(NodeId, Index)], expect: Index) {
        let ids: Vec<NodeId> = std::iter::once(1).chain(matches.iter().map(|(id, _)| *id)).collect();
        let mut group = group(1, &ids);
        for (id, match_index) in matches {
            group.member_mut(*id).expect("member not found").advance(*match_index);
            // advance() moved next_index past match_index as well.
            assert_eq!(group.member(*id).unwrap().next_index(), match_index + 1);
        }
        assert_eq!(group.quorum_match_index(), Some(expect));
    }

    #[test]
    fn quorum_match_index_ignores_non_major() {
        let mut group = group(1, &[1, 2, 3]);
        group.member_mut(2).unwrap().advance(7);
        group.member_mut(3).unwrap().advance(4);
        assert_eq!(group.quorum_match_index(), Some(7));

        // Downgrading the advanced member drops it from the calculation.
        assert!(group.downgrade(2));
        assert_eq!(group.quorum_match_index(), Some(4));
        assert_eq!(group.major_count(), 2);
    }

    #[test]
    fn back_off_floors_at_one() {
        let mut group = group(1, &[1, 2]);
        let member = group.member_mut(2).unwrap();
        member.reset(3);
        assert!(member.back_off());
        assert!(member.back_off());
        assert_eq!(member.next_index(), 1);
        assert!(!member.back_off());
        assert_eq!(member.next_index(), 1);
    }

    #[test]
    fn should_replicate_gates_on_in_flight() {
        let mut group = group(1, &[1, 2]);
        let member = group.member_mut(2).unwrap();
        assert!(member.should_replicate(Duration::from_secs(1)));

        member.start_replicating();
        assert!(!member.should_replicate(Duration::from_secs(1)));
        // A stale in-flight RPC no longer blocks replication.
        assert!(member.should_replicate(Duration::ZERO));

        member.stop_replicating();
        assert!(member.should_replicate(Duration::from_secs(1)));
    }

    #[test]
    fn update_replaces_membership() {
        let mut group = group(1, &[1, 2, 3]);
        group.update(vec![
            Endpoint::new(1, "node-1".into()),
            Endpoint::new(2, "node-2".into()),
            Endpoint::new(4, "node-4".into()),
        ]);
        assert!(group.member(3).is_none());
        assert!(group.is_major(4));
        assert_eq!(group.major_count(), 3);
        assert_eq!(group.replication_targets(), vec![2, 4]);
    }
}
