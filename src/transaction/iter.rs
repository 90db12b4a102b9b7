use std::cmp::Ordering;
use std::collections::VecDeque;

use crate::error::Result;
use crate::rpc::Op;
use crate::scanner::Scanner;
use crate::types::{Key, KvPair};

enum Side {
    Local,
    Remote,
    Both,
}

/// Ordered view of a transaction's own writes layered over a remote scan.
///
/// Where both sides hold a key the buffered write wins; buffered deletes
/// hide the remote value entirely.
pub struct UnionIter {
    local: VecDeque<(Key, Op)>,
    remote: Scanner,
    current: Option<KvPair>,
}

impl UnionIter {
    pub(crate) async fn new(local: VecDeque<(Key, Op)>, remote: Scanner) -> Result<Self> {
        let mut iter = Self {
            local,
            remote,
            current: None,
        };
        iter.advance().await?;
        Ok(iter)
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> Option<&Key> {
        self.current.as_ref().map(|pair| &pair.key)
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|pair| pair.value.as_slice())
    }

    pub async fn next(&mut self) -> Result<()> {
        self.advance().await
    }

    /// Drains the rest of the iterator.
    pub async fn collect_pairs(mut self) -> Result<Vec<KvPair>> {
        let mut pairs = Vec::new();
        while let Some(pair) = self.current.take() {
            pairs.push(pair);
            self.advance().await?;
        }
        Ok(pairs)
    }

    async fn advance(&mut self) -> Result<()> {
        loop {
            let side = match (self.local.front(), self.remote.key()) {
                (None, None) => {
                    self.current = None;
                    return Ok(());
                }
                (Some(_), None) => Side::Local,
                (None, Some(_)) => Side::Remote,
                (Some((local, _)), Some(remote)) => match local.cmp(remote) {
                    Ordering::Less => Side::Local,
                    Ordering::Greater => Side::Remote,
                    Ordering::Equal => Side::Both,
                },
            };

            match side {
                Side::Remote => {
                    self.current = self.remote.current().cloned();
                    self.remote.next().await?;
                    return Ok(());
                }
                Side::Local | Side::Both => {
                    if let Side::Both = side {
                        self.remote.next().await?;
                    }
                    if let Some((key, Op::Put(value))) = self.local.pop_front() {
                        self.current = Some(KvPair { key, value });
                        return Ok(());
                    }
                }
            }
        }
    }
}
