use super::Engine;
use crate::error::Result;

use std::collections::BTreeMap;

/// An in-memory key/value storage engine using the Rust standard library
/// B-tree implementation. Data is not persisted. Primarily for testing.
#[derive(Default)]
pub struct Memory {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    /// Creates a new Memory key/value storage engine.
    pub fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl Engine for Memory {
    type ScanIterator<'a> = ScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_> {
        ScanIterator { inner: self.data.range(range) }
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn super::ScanIterator + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }
}

/// A scan iterator over the B-tree range.
pub struct ScanIterator<'a> {
    inner: std::collections::btree_map::Range<'a, Vec<u8>, Vec<u8>>,
}

impl Iterator for ScanIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, v)| Ok((k.clone(), v.clone())))
    }
}

impl DoubleEndedIterator for ScanIterator<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|(k, v)| Ok((k.clone(), v.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ops() -> Result<()> {
        let mut engine = Memory::new();

        assert_eq!(engine.get(b"a")?, None);

        engine.set(b"a", vec![1])?;
        assert_eq!(engine.get(b"a")?, Some(vec![1]));

        engine.set(b"a", vec![2])?;
        assert_eq!(engine.get(b"a")?, Some(vec![2]));

        engine.delete(b"a")?;
        assert_eq!(engine.get(b"a")?, None);

        // Deletes of missing keys are no-ops.
        engine.delete(b"b")?;
        Ok(())
    }

    #[test]
    fn scan_ordered() -> Result<()> {
        let mut engine = Memory::new();
        engine.set(b"b", vec![2])?;
        engine.set(b"a", vec![1])?;
        engine.set(b"c", vec![3])?;

        let entries = engine.scan(b"a".to_vec()..=b"b".to_vec()).collect::<Result<Vec<_>>>()?;
        assert_eq!(entries, vec![(b"a".to_vec(), vec![1]), (b"b".to_vec(), vec![2])]);

        let last = engine.scan(..).next_back().transpose()?;
        assert_eq!(last, Some((b"c".to_vec(), vec![3])));
        Ok(())
    }
}
