//! File digest -> source id. Ids are handed out from 1 upwards and never
//! reused.

use crate::changes::{Changes, bump};
use crate::dbpath;
use crate::digest::{DigestKey, digest_from_stored};
use crate::digest_map::DigestMap;
use crate::error::Result;
use crate::schema::{KEY_NEXT_SOURCE_ID, META, SOURCE_ID};
use crate::settings::Settings;
use crate::store::{FileMode, Store};
use redb::{ReadableTable, TableError, WriteTransaction};
use std::path::Path;
use std::sync::{PoisonError, RwLock};

/// Most ids kept in the lookup cache; a full cache starts over empty.
const CACHE_LIMIT: usize = 1 << 16;

pub struct SourceIdManager<K> {
    store: Store,
    /// Recently seen ids, at most `cache_limit` of them.
    cache: RwLock<DigestMap<K>>,
    cache_limit: usize,
}

fn ensure_schema(tx: &WriteTransaction) -> std::result::Result<(), TableError> {
    tx.open_table(SOURCE_ID)?;
    tx.open_table(META)?;
    Ok(())
}

impl<K: DigestKey> SourceIdManager<K> {
    pub fn open(hashdb_dir: &Path, mode: FileMode, settings: &Settings) -> Result<Self> {
        let store = Store::open(hashdb_dir, dbpath::SOURCE_ID_STORE, mode, ensure_schema)?;
        Ok(Self {
            store,
            cache: RwLock::new(DigestMap::new(settings.map_type)?),
            cache_limit: CACHE_LIMIT,
        })
    }

    /// Id for `file_hash`, minting one if needed. The flag is true when the
    /// id is new.
    pub fn insert(&self, file_hash: &K, changes: &Changes) -> Result<(bool, u64)> {
        if let Some(id) = self.cached(file_hash)? {
            bump(&changes.source_id_already_present);
            return Ok((false, id));
        }

        let tx = self.store.begin_write()?;
        let (is_new, id) = {
            let mut ids = tx.open_table(SOURCE_ID)?;
            let existing = ids.get(file_hash.as_bytes())?.map(|v| v.value());
            match existing {
                Some(id) => (false, id),
                None => {
                    let mut meta = tx.open_table(META)?;
                    let next = meta.get(KEY_NEXT_SOURCE_ID)?.map_or(1, |v| v.value());
                    meta.insert(KEY_NEXT_SOURCE_ID, next + 1)?;
                    ids.insert(file_hash.as_bytes(), next)?;
                    (true, next)
                }
            }
        };

        if is_new {
            tx.commit()?;
            bump(&changes.source_id_inserted);
        } else {
            tx.abort()?;
            bump(&changes.source_id_already_present);
        }

        self.remember(file_hash, id)?;
        Ok((is_new, id))
    }

    pub fn find(&self, file_hash: &K) -> Result<Option<u64>> {
        if let Some(id) = self.cached(file_hash)? {
            return Ok(Some(id));
        }

        let tx = self.store.begin_read()?;
        let ids = tx.open_table(SOURCE_ID)?;
        let found = ids.get(file_hash.as_bytes())?.map(|v| v.value());
        if let Some(id) = found {
            self.remember(file_hash, id)?;
        }
        Ok(found)
    }

    pub fn find_begin(&self) -> Result<Option<K>> {
        let first = self.store.first_bytes_key(SOURCE_ID)?;
        Ok(first.map(|k| digest_from_stored("source id store", &k)))
    }

    /// Panics if `previous` is not a stored file hash.
    pub fn find_next(&self, previous: &K) -> Result<Option<K>> {
        let next = self.store.next_bytes_key(SOURCE_ID, previous.as_bytes())?;
        Ok(next.map(|k| digest_from_stored("source id store", &k)))
    }

    pub fn size(&self) -> Result<u64> {
        self.store.len(SOURCE_ID)
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    fn cached(&self, file_hash: &K) -> Result<Option<u64>> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache.find(file_hash)
    }

    fn remember(&self, file_hash: &K, id: u64) -> Result<()> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.len() >= self.cache_limit {
            tracing::trace!(entries = cache.len(), "source id cache reset");
            *cache = DigestMap::new(cache.map_type())?;
        }
        cache.insert(*file_hash, id)?;
        Ok(())
    }
}
