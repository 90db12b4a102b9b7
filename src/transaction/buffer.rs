use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use crate::config::TxnLimits;
use crate::error::{Error, Result};
use crate::rpc::Op;
use crate::types::{Key, Value};

/// Uncommitted writes of one transaction, ordered by key. The last write
/// to a key wins.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    entries: BTreeMap<Key, Op>,
    limits: TxnLimits,
}

impl WriteBuffer {
    pub fn new(limits: TxnLimits) -> Self {
        Self {
            entries: BTreeMap::new(),
            limits,
        }
    }

    pub fn get(&self, key: &Key) -> Option<&Op> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: Key, value: Value) -> Result<()> {
        self.check(&key, value.len())?;
        self.entries.insert(key, Op::Put(value));
        Ok(())
    }

    pub fn delete(&mut self, key: Key) -> Result<()> {
        self.check(&key, 0)?;
        self.entries.insert(key, Op::Delete);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Owned copy of the entries in `[start, end)`; an empty `end` is unbounded.
    pub fn range(&self, start: &Key, end: &Key) -> VecDeque<(Key, Op)> {
        if !end.is_empty() && start >= end {
            return VecDeque::new();
        }
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.clone())
        };
        self.entries
            .range((Bound::Included(start.clone()), upper))
            .map(|(key, op)| (key.clone(), op.clone()))
            .collect()
    }

    pub fn into_mutations(self) -> BTreeMap<Key, Op> {
        self.entries
    }

    fn check(&self, key: &Key, value_len: usize) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let size = key.len() + value_len;
        if size > self.limits.max_entry_size {
            return Err(Error::EntryTooLarge {
                size,
                limit: self.limits.max_entry_size,
            });
        }
        if !self.entries.contains_key(key) && self.entries.len() >= self.limits.max_entries {
            return Err(Error::TxnTooLarge {
                entries: self.entries.len() + 1,
                limit: self.limits.max_entries,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins() {
        let mut buffer = WriteBuffer::default();
        buffer.put("k".into(), b"v1".to_vec()).unwrap();
        buffer.delete("k".into()).unwrap();
        buffer.put("k".into(), b"v2".to_vec()).unwrap();

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(&"k".into()), Some(&Op::Put(b"v2".to_vec())));
    }

    #[test]
    fn rejects_empty_and_oversized_entries() {
        let mut buffer = WriteBuffer::new(TxnLimits {
            max_entry_size: 8,
            max_entries: 2,
        });
        assert!(matches!(buffer.put(Key::EMPTY, b"v".to_vec()), Err(Error::EmptyKey)));
        assert!(matches!(buffer.delete(Key::EMPTY), Err(Error::EmptyKey)));
        assert!(matches!(
            buffer.put("key".into(), b"123456".to_vec()),
            Err(Error::EntryTooLarge { size: 9, limit: 8 })
        ));

        buffer.put("a".into(), b"1".to_vec()).unwrap();
        buffer.put("b".into(), b"2".to_vec()).unwrap();
        buffer.put("a".into(), b"3".to_vec()).expect("overwrite stays within limit");
        assert!(matches!(
            buffer.delete("c".into()),
            Err(Error::TxnTooLarge { entries: 3, limit: 2 })
        ));
        assert!(buffer.get(&"c".into()).is_none());
    }

    #[test]
    fn range_is_half_open() {
        let mut buffer = WriteBuffer::default();
        for key in ["a", "b", "c", "d"] {
            buffer.put(key.into(), key.as_bytes().to_vec()).unwrap();
        }
        let keys: Vec<Key> = buffer
            .range(&"b".into(), &"d".into())
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![Key::from("b"), Key::from("c")]);
        assert_eq!(buffer.range(&"c".into(), &Key::EMPTY).len(), 2);
        assert!(buffer.range(&"d".into(), &"a".into()).is_empty());
    }
}
