use super::{Entry, Index};
use crate::error::Result;

/// A Raft-managed state machine. Committed log entries are applied in index
/// order, and must be applied deterministically on every node.
pub trait State: Send {
    /// Returns the index of the last applied entry.
    fn applied_index(&self) -> Index;

    /// Applies a committed log entry. Noop and group config entries are
    /// applied too and must advance the applied index, but carry no command
    /// for the state machine itself.
    fn apply(&mut self, entry: &Entry) -> Result<()>;

    /// Serializes the state machine for a snapshot.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces the state machine contents with a snapshot taken at the given
    /// applied index.
    fn restore(&mut self, applied_index: Index, data: &[u8]) -> Result<()>;
}

#[cfg(test)]
pub mod tests {
    use super::super::Command;
    use super::*;
    use crate::encoding::bincode;

    use std::sync::{Arc, Mutex};

    /// A test state machine that records applied write commands. Clones share
    /// the underlying state, so tests can inspect it while the node owns it.
    #[derive(Clone, Default)]
    pub struct TestState {
        inner: Arc<Mutex<Inner>>,
    }

    #[derive(Default)]
    struct Inner {
        applied_index: Index,
        writes: Vec<Vec<u8>>,
    }

    impl TestState {
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns the applied write commands.
        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.inner.lock().expect("lock poisoned").writes.clone()
        }
    }

    impl State for TestState {
        fn applied_index(&self) -> Index {
            self.inner.lock().expect("lock poisoned").applied_index
        }

        fn apply(&mut self, entry: &Entry) -> Result<()> {
            let mut inner = self.inner.lock().expect("lock poisoned");
            assert_eq!(entry.index, inner.applied_index + 1, "entries must apply in order");
            if let Command::Write(command) = &entry.command {
                inner.writes.push(command.clone());
            }
            inner.applied_index = entry.index;
            Ok(())
        }

        fn snapshot(&self) -> Result<Vec<u8>> {
            Ok(bincode::serialize(&self.inner.lock().expect("lock poisoned").writes))
        }

        fn restore(&mut self, applied_index: Index, data: &[u8]) -> Result<()> {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.writes = bincode::deserialize(data)?;
            inner.applied_index = applied_index;
            Ok(())
        }
    }
}
