//! Digest -> u64 maps behind one interface.
//!
//! The backend is picked once, from the database's `map_type` setting, and
//! never changes for the lifetime of the map. Ordered backends iterate in
//! ascending key order; the hash backend iterates in an unspecified order
//! that stays the same until the next insert.

use crate::digest::{DigestKey, digest_from_stored};
use crate::error::Result;
use redb::{Database, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Bound;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MapType {
    /// Balanced ordered tree in memory.
    OrderedTree,
    /// Sorted array with binary search. Slow inserts, compact, fast lookups.
    SortedVector,
    /// Hashed buckets. Fastest lookups, unordered.
    Hash,
    /// Page-based B-tree (redb) held in memory.
    Btree,
}

impl fmt::Display for MapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MapType::OrderedTree => "ordered-tree",
            MapType::SortedVector => "sorted-vector",
            MapType::Hash => "hash",
            MapType::Btree => "btree",
        };
        f.write_str(s)
    }
}

pub type MapIter<'a, K> = Box<dyn Iterator<Item = Result<(K, u64)>> + 'a>;

/// What every backend provides.
pub trait DigestMapBackend<K>: Send + Sync {
    /// True if the key is new; an existing key keeps its slot but takes the
    /// new value.
    fn insert(&mut self, key: K, value: u64) -> Result<bool>;
    fn find(&self, key: &K) -> Result<Option<u64>>;
    fn len(&self) -> usize;
    fn iter(&self) -> MapIter<'_, K>;
}

pub struct DigestMap<K> {
    map_type: MapType,
    backend: Box<dyn DigestMapBackend<K>>,
}

impl<K: DigestKey> DigestMap<K> {
    pub fn new(map_type: MapType) -> Result<Self> {
        let backend: Box<dyn DigestMapBackend<K>> = match map_type {
            MapType::OrderedTree => Box::new(OrderedTreeMap(BTreeMap::new())),
            MapType::SortedVector => Box::new(SortedVecMap(Vec::new())),
            MapType::Hash => Box::new(HashedMap(HashMap::new())),
            MapType::Btree => Box::new(RedbTreeMap::new()?),
        };
        Ok(Self { map_type, backend })
    }

    pub fn map_type(&self) -> MapType {
        self.map_type
    }

    pub fn insert(&mut self, key: K, value: u64) -> Result<bool> {
        self.backend.insert(key, value)
    }

    pub fn find(&self, key: &K) -> Result<Option<u64>> {
        self.backend.find(key)
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> MapIter<'_, K> {
        self.backend.iter()
    }
}

impl<K: DigestKey> fmt::Debug for DigestMap<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestMap")
            .field("map_type", &self.map_type)
            .field("len", &self.len())
            .finish()
    }
}

struct OrderedTreeMap<K>(BTreeMap<K, u64>);

impl<K: DigestKey> DigestMapBackend<K> for OrderedTreeMap<K> {
    fn insert(&mut self, key: K, value: u64) -> Result<bool> {
        Ok(self.0.insert(key, value).is_none())
    }

    fn find(&self, key: &K) -> Result<Option<u64>> {
        Ok(self.0.get(key).copied())
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn iter(&self) -> MapIter<'_, K> {
        Box::new(self.0.iter().map(|(k, v)| Ok((*k, *v))))
    }
}

struct SortedVecMap<K>(Vec<(K, u64)>);

impl<K: DigestKey> DigestMapBackend<K> for SortedVecMap<K> {
    fn insert(&mut self, key: K, value: u64) -> Result<bool> {
        match self.0.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(i) => {
                self.0[i].1 = value;
                Ok(false)
            }
            Err(i) => {
                self.0.insert(i, (key, value));
                Ok(true)
            }
        }
    }

    fn find(&self, key: &K) -> Result<Option<u64>> {
        Ok(self
            .0
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|i| self.0[i].1))
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn iter(&self) -> MapIter<'_, K> {
        Box::new(self.0.iter().map(|&(k, v)| Ok((k, v))))
    }
}

struct HashedMap<K>(HashMap<K, u64>);

impl<K: DigestKey> DigestMapBackend<K> for HashedMap<K> {
    fn insert(&mut self, key: K, value: u64) -> Result<bool> {
        Ok(self.0.insert(key, value).is_none())
    }

    fn find(&self, key: &K) -> Result<Option<u64>> {
        Ok(self.0.get(key).copied())
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn iter(&self) -> MapIter<'_, K> {
        Box::new(self.0.iter().map(|(k, v)| Ok((*k, *v))))
    }
}

const TREE: TableDefinition<&[u8], u64> = TableDefinition::new("digest_map");

// Keys handed out per read transaction while iterating.
const ITER_BATCH: usize = 1024;

struct RedbTreeMap<K> {
    db: Database,
    len: usize,
    _key: PhantomData<fn() -> K>,
}

impl<K: DigestKey> RedbTreeMap<K> {
    fn new() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())?;

        let tx = db.begin_write()?;
        {
            let _ = tx.open_table(TREE)?;
        }
        tx.commit()?;

        Ok(Self {
            db,
            len: 0,
            _key: PhantomData,
        })
    }

    /// Up to ITER_BATCH entries strictly after `after`.
    fn batch_after(&self, after: Option<&[u8]>) -> Result<VecDeque<(K, u64)>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(TREE)?;

        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = match after {
            Some(k) => (Bound::Excluded(k), Bound::Unbounded),
            None => (Bound::Unbounded, Bound::Unbounded),
        };

        let mut out = VecDeque::with_capacity(ITER_BATCH);
        for item in table.range::<&[u8]>(bounds)?.take(ITER_BATCH) {
            let (k, v) = item?;
            out.push_back((digest_from_stored::<K>("digest map", k.value()), v.value()));
        }
        Ok(out)
    }
}

impl<K: DigestKey> DigestMapBackend<K> for RedbTreeMap<K> {
    fn insert(&mut self, key: K, value: u64) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let existed = {
            let mut table = tx.open_table(TREE)?;
            table.insert(key.as_bytes(), value)?.is_some()
        };
        tx.commit()?;

        if !existed {
            self.len += 1;
        }
        Ok(!existed)
    }

    fn find(&self, key: &K) -> Result<Option<u64>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(TREE)?;
        Ok(table.get(key.as_bytes())?.map(|v| v.value()))
    }

    fn len(&self) -> usize {
        self.len
    }

    fn iter(&self) -> MapIter<'_, K> {
        Box::new(RedbTreeIter {
            map: self,
            batch: VecDeque::new(),
            last: None,
            done: false,
        })
    }
}

/// Pages through the tree so no transaction outlives a single batch.
struct RedbTreeIter<'a, K> {
    map: &'a RedbTreeMap<K>,
    batch: VecDeque<(K, u64)>,
    last: Option<K>,
    done: bool,
}

impl<K: DigestKey> Iterator for RedbTreeIter<'_, K> {
    type Item = Result<(K, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch.is_empty() && !self.done {
            let after = self.last.as_ref().map(|k| k.as_bytes());
            match self.map.batch_after(after) {
                Ok(batch) => {
                    if batch.len() < ITER_BATCH {
                        self.done = true;
                    }
                    self.batch = batch;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        let (k, v) = self.batch.pop_front()?;
        self.last = Some(k);
        Some(Ok((k, v)))
    }
}

// Sanity check that the redb table reports the same size we track.
#[cfg(test)]
impl<K: DigestKey> RedbTreeMap<K> {
    fn stored_len(&self) -> u64 {
        use redb::ReadableTableMetadata;
        let tx = self.db.begin_read().unwrap();
        tx.open_table(TREE).unwrap().len().unwrap()
    }
}
