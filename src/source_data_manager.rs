use crate::changes::{Changes, bump};
use crate::dbpath;
use crate::digest::DigestKey;
use crate::error::Result;
use crate::records::SourceData;
use crate::schema::SOURCE_DATA;
use crate::store::{FileMode, InsertOutcome, Store};
use redb::{ReadableTable, TableError, WriteTransaction};
use std::marker::PhantomData;
use std::path::Path;

/// Source id -> file hash, size, type and non-probative count.
pub struct SourceDataManager<K> {
    store: Store,
    _key: PhantomData<fn() -> K>,
}

fn ensure_schema(tx: &WriteTransaction) -> std::result::Result<(), TableError> {
    tx.open_table(SOURCE_DATA)?;
    Ok(())
}

impl<K: DigestKey> SourceDataManager<K> {
    pub fn open(hashdb_dir: &Path, mode: FileMode) -> Result<Self> {
        let store = Store::open(hashdb_dir, dbpath::SOURCE_DATA_STORE, mode, ensure_schema)?;
        Ok(Self {
            store,
            _key: PhantomData,
        })
    }

    /// Store `data` under `source_id`.
    ///
    /// A source id belongs to one file hash forever: panics if the stored
    /// record names a different one.
    pub fn insert(
        &self,
        source_id: u64,
        data: &SourceData<K>,
        changes: &Changes,
    ) -> Result<InsertOutcome> {
        let tx = self.store.begin_write()?;
        let outcome = {
            let mut table = tx.open_table(SOURCE_DATA)?;
            let existing = table
                .get(source_id)?
                .map(|v| SourceData::<K>::decode(v.value()));

            let outcome = match existing {
                Some(old) if old.file_hash != data.file_hash => panic!(
                    "source id {source_id} belongs to file hash {}, not {}",
                    old.file_hash.to_hex(),
                    data.file_hash.to_hex()
                ),
                Some(old) if old == *data => InsertOutcome::AlreadyPresent,
                Some(_) => InsertOutcome::Updated,
                None => InsertOutcome::Inserted,
            };
            if outcome != InsertOutcome::AlreadyPresent {
                table.insert(source_id, data.encode().as_slice())?;
            }
            outcome
        };

        match outcome {
            InsertOutcome::AlreadyPresent => {
                tx.abort()?;
                bump(&changes.source_data_unchanged);
            }
            InsertOutcome::Updated => {
                tx.commit()?;
                bump(&changes.source_data_updated);
            }
            _ => {
                tx.commit()?;
                bump(&changes.source_data_inserted);
            }
        }
        Ok(outcome)
    }

    pub fn find(&self, source_id: u64) -> Result<Option<SourceData<K>>> {
        let tx = self.store.begin_read()?;
        let table = tx.open_table(SOURCE_DATA)?;
        let found = table
            .get(source_id)?
            .map(|v| SourceData::<K>::decode(v.value()));
        Ok(found)
    }

    /// Like [`find`](Self::find), for a caller that already knows which file
    /// hash the id was minted for. Panics if the stored record disagrees.
    pub fn find_checked(&self, source_id: u64, file_hash: &K) -> Result<Option<SourceData<K>>> {
        let found = self.find(source_id)?;
        match &found {
            Some(data) if data.file_hash != *file_hash => panic!(
                "source id {source_id} maps to file hash {} but its data names {}",
                file_hash.to_hex(),
                data.file_hash.to_hex()
            ),
            _ => {}
        }
        Ok(found)
    }

    pub fn find_begin(&self) -> Result<Option<u64>> {
        self.store.first_id_key(SOURCE_DATA)
    }

    /// Panics if `previous` is not a stored source id.
    pub fn find_next(&self, previous: u64) -> Result<Option<u64>> {
        self.store.next_id_key(SOURCE_DATA, previous)
    }

    pub fn size(&self) -> Result<u64> {
        self.store.len(SOURCE_DATA)
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Md5Digest;

    fn data(hash: u8, filesize: u64) -> SourceData<Md5Digest> {
        SourceData {
            file_hash: Md5Digest([hash; 16]),
            filesize,
            file_type: "txt".to_string(),
            nonprobative_count: 0,
        }
    }

    #[test]
    fn insert_update_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let m = SourceDataManager::open(tmp.path(), FileMode::Create).unwrap();
        let changes = Changes::default();

        assert_eq!(m.insert(1, &data(1, 10), &changes).unwrap(), InsertOutcome::Inserted);
        assert_eq!(m.insert(1, &data(1, 10), &changes).unwrap(), InsertOutcome::AlreadyPresent);
        assert_eq!(m.insert(1, &data(1, 20), &changes).unwrap(), InsertOutcome::Updated);
        assert_eq!(m.find(1).unwrap().unwrap().filesize, 20);
        assert_eq!(m.find(2).unwrap(), None);

        let c = changes.snapshot();
        assert_eq!(
            (c.source_data_inserted, c.source_data_unchanged, c.source_data_updated),
            (1, 1, 1)
        );
    }

    #[test]
    #[should_panic(expected = "belongs to file hash")]
    fn changing_the_file_hash_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let m = SourceDataManager::open(tmp.path(), FileMode::Create).unwrap();
        let changes = Changes::default();
        m.insert(1, &data(1, 10), &changes).unwrap();
        let _ = m.insert(1, &data(2, 10), &changes);
    }

    #[test]
    #[should_panic(expected = "maps to file hash")]
    fn checked_read_catches_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let m = SourceDataManager::open(tmp.path(), FileMode::Create).unwrap();
        m.insert(4, &data(1, 10), &Changes::default()).unwrap();
        assert!(m.find_checked(4, &Md5Digest([1; 16])).unwrap().is_some());
        let _ = m.find_checked(4, &Md5Digest([9; 16]));
    }

    #[test]
    fn ids_iterate_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let m = SourceDataManager::open(tmp.path(), FileMode::Create).unwrap();
        let changes = Changes::default();
        for id in [5, 2, 8] {
            m.insert(id, &data(id as u8, 0), &changes).unwrap();
        }
        let mut ids = Vec::new();
        let mut cur = m.find_begin().unwrap();
        while let Some(id) = cur {
            ids.push(id);
            cur = m.find_next(id).unwrap();
        }
        assert_eq!(ids, vec![2, 5, 8]);
        assert_eq!(m.size().unwrap(), 3);
    }
}
