//! Approximate block hash -> duplicate count store.
//!
//! Keys are the leading `hash_prefix_bits` of a hash; each key holds a list
//! of (trailing `hash_suffix_bytes` bytes, lookup word) entries. Two hashes
//! that agree on both prefix and suffix share an entry, so counts can be
//! conflated. That is acceptable for a pre-check: a zero answer is exact,
//! anything else has to be confirmed against the hash data store.
//!
//! Inserts go to an in-memory buffer first and reach the store in batches.

use crate::changes::{Changes, bump};
use crate::dbpath;
use crate::digest::DigestKey;
use crate::digest_map::{DigestMap, MapType};
use crate::error::Result;
use crate::lookup_encoding;
use crate::schema::HASH;
use crate::settings::Settings;
use crate::store::{FileMode, Store};
use redb::{ReadableTable, TableError, WriteTransaction};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

const FLUSH_AT: usize = 4096;

pub struct HashManager<K: DigestKey> {
    store: Store,
    prefix_bits: u32,
    suffix_bytes: usize,
    index_bits: u32,
    sector_size: u64,
    map_type: MapType,
    pending: Mutex<DigestMap<K>>,
}

fn ensure_schema(tx: &WriteTransaction) -> std::result::Result<(), TableError> {
    tx.open_table(HASH)?;
    Ok(())
}

type Entries = Vec<(Vec<u8>, u64)>;

impl<K: DigestKey> HashManager<K> {
    pub fn open(hashdb_dir: &Path, mode: FileMode, settings: &Settings) -> Result<Self> {
        let store = Store::open(hashdb_dir, dbpath::HASH_STORE, mode, ensure_schema)?;
        Ok(Self {
            store,
            prefix_bits: settings.hash_prefix_bits,
            suffix_bytes: settings.hash_suffix_bytes as usize,
            index_bits: settings.source_lookup_index_bits,
            sector_size: settings.sector_size,
            map_type: settings.map_type,
            pending: Mutex::new(DigestMap::new(settings.map_type)?),
        })
    }

    /// Record how many source offset pairs `hash` now has. When there is a
    /// single pair it is packed into the word, if it fits.
    pub fn insert(
        &self,
        hash: &K,
        count: u64,
        only_pair: Option<(u64, u64)>,
        changes: &Changes,
    ) -> Result<()> {
        let word = self.lookup_word(count, only_pair)?;

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.insert(*hash, word)?;
        if pending.len() >= FLUSH_AT {
            self.flush_pending(&mut pending, changes)?;
        }
        Ok(())
    }

    /// Approximate number of source offset pairs for `hash`; 0 means the
    /// hash is certainly absent.
    pub fn find(&self, hash: &K) -> Result<u64> {
        {
            let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(word) = pending.find(hash)? {
                return Ok(lookup_encoding::count(word));
            }
        }

        let key = self.prefix_key(hash);
        let suffix = self.suffix(hash);

        let tx = self.store.begin_read()?;
        let table = tx.open_table(HASH)?;
        let Some(v) = table.get(key.as_slice())? else {
            return Ok(0);
        };
        let found = self
            .decode_entries(v.value())
            .into_iter()
            .find(|(s, _)| s.as_slice() == suffix)
            .map_or(0, |(_, word)| lookup_encoding::count(word));
        Ok(found)
    }

    /// Write the buffer to the store.
    pub fn flush(&self, changes: &Changes) -> Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.flush_pending(&mut pending, changes)
    }

    /// First stored prefix key.
    pub fn find_begin(&self) -> Result<Option<Vec<u8>>> {
        self.store.first_bytes_key(HASH)
    }

    pub fn find_next(&self, previous: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.next_bytes_key(HASH, previous)
    }

    /// Number of stored prefix keys. Buffered inserts are not counted.
    pub fn size(&self) -> Result<u64> {
        self.store.len(HASH)
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    fn lookup_word(&self, count: u64, only_pair: Option<(u64, u64)>) -> Result<u64> {
        match only_pair {
            Some((source_id, offset)) if count == 1 => {
                lookup_encoding::pack(self.index_bits, source_id, offset / self.sector_size)
                    .or_else(|_| lookup_encoding::make_count(1))
            }
            _ => lookup_encoding::make_count(count.min(lookup_encoding::MAX_COUNT)),
        }
    }

    fn flush_pending(&self, pending: &mut DigestMap<K>, changes: &Changes) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }

        let tx = self.store.begin_write()?;
        {
            let mut table = tx.open_table(HASH)?;
            for item in pending.iter() {
                let (hash, word) = item?;
                let key = self.prefix_key(&hash);
                let suffix = self.suffix(&hash);

                let mut entries = table
                    .get(key.as_slice())?
                    .map(|v| self.decode_entries(v.value()))
                    .unwrap_or_default();

                match entries.iter_mut().find(|(s, _)| s.as_slice() == suffix) {
                    Some(entry) if entry.1 == word => {
                        bump(&changes.hash_unchanged);
                        continue;
                    }
                    Some(entry) => {
                        entry.1 = word;
                        bump(&changes.hash_changed);
                    }
                    None => {
                        entries.push((suffix.to_vec(), word));
                        bump(&changes.hash_inserted);
                    }
                }
                table.insert(key.as_slice(), self.encode_entries(&entries).as_slice())?;
            }
        }
        tx.commit()?;

        tracing::debug!(entries = pending.len(), "hash store buffer flushed");
        *pending = DigestMap::new(self.map_type)?;
        Ok(())
    }

    /// Leading `prefix_bits` of the hash, the last partial byte masked.
    fn prefix_key(&self, hash: &K) -> Vec<u8> {
        let bits = self.prefix_bits as usize;
        let mut key = hash.as_bytes()[..bits.div_ceil(8)].to_vec();
        let rem = bits % 8;
        if rem != 0 {
            let last = key.len() - 1;
            key[last] &= 0xffu8 << (8 - rem);
        }
        key
    }

    fn suffix<'a>(&self, hash: &'a K) -> &'a [u8] {
        let bytes = hash.as_bytes();
        &bytes[bytes.len() - self.suffix_bytes..]
    }

    fn encode_entries(&self, entries: &Entries) -> Vec<u8> {
        let mut out = Vec::with_capacity(entries.len() * (self.suffix_bytes + 8));
        for (suffix, word) in entries {
            out.extend_from_slice(suffix);
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    fn decode_entries(&self, bytes: &[u8]) -> Entries {
        let width = self.suffix_bytes + 8;
        if bytes.len() % width != 0 {
            panic!(
                "corrupt hash record: {} bytes is not a whole number of {width}-byte entries",
                bytes.len()
            );
        }
        bytes
            .chunks_exact(width)
            .map(|chunk| {
                let (suffix, word) = chunk.split_at(self.suffix_bytes);
                let mut w = [0u8; 8];
                w.copy_from_slice(word);
                (suffix.to_vec(), u64::from_le_bytes(w))
            })
            .collect()
    }
}

impl<K: DigestKey> Drop for HashManager<K> {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !pending.is_empty() {
            tracing::warn!(
                entries = pending.len(),
                "hash store closed with unflushed entries"
            );
        }
    }
}
