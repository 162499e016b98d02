use super::{NodeId, Term};
use crate::encoding::bincode;
use crate::error::Result;
use crate::storage;

/// Durable node state: the current term and the vote cast in it. Both must be
/// persisted before any RPC reply that depends on them, so a restarted node
/// can't vote twice in a term.
pub trait NodeStore: Send {
    /// Returns the current term, 0 if none.
    fn term(&mut self) -> Result<Term>;

    /// Persists the current term.
    fn set_term(&mut self, term: Term) -> Result<()>;

    /// Returns the vote cast in the current term, if any.
    fn voted_for(&mut self) -> Result<Option<NodeId>>;

    /// Persists the vote cast in the current term.
    fn set_voted_for(&mut self, voted_for: Option<NodeId>) -> Result<()>;

    /// Persists the term and vote as a single atomic write.
    fn set_term_and_voted_for(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()>;

    /// Closes the store.
    fn close(&mut self) -> Result<()>;
}

/// The storage key holding the (term, voted_for) pair.
const TERM_VOTE: &[u8] = &[0x00];

/// A node store backed by a key/value storage engine. The (term, voted_for)
/// pair is kept under a single key and flushed on every write.
pub struct EngineNodeStore {
    engine: Box<dyn storage::Engine>,
    term: Term,
    voted_for: Option<NodeId>,
}

impl EngineNodeStore {
    /// Creates a node store using the given storage engine.
    pub fn new(mut engine: Box<dyn storage::Engine>) -> Result<Self> {
        let (term, voted_for) =
            engine.get(TERM_VOTE)?.map(|v| bincode::deserialize(&v)).transpose()?.unwrap_or((0, None));
        Ok(Self { engine, term, voted_for })
    }

    fn write(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        self.engine.set(TERM_VOTE, bincode::serialize(&(term, voted_for)))?;
        self.engine.flush()?;
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }
}

impl NodeStore for EngineNodeStore {
    fn term(&mut self) -> Result<Term> {
        Ok(self.term)
    }

    fn set_term(&mut self, term: Term) -> Result<()> {
        let voted_for = self.voted_for;
        self.write(term, voted_for)
    }

    fn voted_for(&mut self) -> Result<Option<NodeId>> {
        Ok(self.voted_for)
    }

    fn set_voted_for(&mut self, voted_for: Option<NodeId>) -> Result<()> {
        let term = self.term;
        self.write(term, voted_for)
    }

    fn set_term_and_voted_for(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        self.write(term, voted_for)
    }

    fn close(&mut self) -> Result<()> {
        self.engine.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Memory;

    #[test]
    fn persists_term_and_vote() -> Result<()> {
        let mut store = EngineNodeStore::new(Box::new(Memory::new()))?;
        assert_eq!(store.term()?, 0);
        assert_eq!(store.voted_for()?, None);

        store.set_term_and_voted_for(3, Some(2))?;
        assert_eq!(store.term()?, 3);
        assert_eq!(store.voted_for()?, Some(2));

        store.set_voted_for(None)?;
        assert_eq!(store.term()?, 3);
        assert_eq!(store.voted_for()?, None);

        store.set_term(4)?;
        assert_eq!(store.term()?, 4);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "term regression")]
    fn term_cannot_regress() {
        let mut store = EngineNodeStore::new(Box::new(Memory::new())).expect("store init failed");
        store.set_term(3).expect("set term failed");
        let _ = store.set_term(2);
    }
}
