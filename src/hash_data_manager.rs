//! Block hash -> labels, entropy and (source id, file offset) pairs.

use crate::changes::{Changes, bump};
use crate::dbpath;
use crate::digest::{DigestKey, digest_from_stored};
use crate::error::Result;
use crate::records::{HashRecord, assert_aligned};
use crate::schema::HASH_DATA;
use crate::settings::Settings;
use crate::store::{FileMode, InsertOutcome, Store};
use redb::{ReadableTable, TableError, WriteTransaction};
use std::marker::PhantomData;
use std::path::Path;

/// Result of adding one (source id, offset) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairInsert {
    pub outcome: InsertOutcome,
    /// Pairs stored for the hash afterwards.
    pub count: u64,
    /// The pair, when it is the only one the hash has.
    pub only_pair: Option<(u64, u64)>,
}

pub struct HashDataManager<K> {
    store: Store,
    sector_size: u64,
    max_pairs: u64,
    _key: PhantomData<fn() -> K>,
}

fn ensure_schema(tx: &WriteTransaction) -> std::result::Result<(), TableError> {
    tx.open_table(HASH_DATA)?;
    Ok(())
}

impl<K: DigestKey> HashDataManager<K> {
    pub fn open(hashdb_dir: &Path, mode: FileMode, settings: &Settings) -> Result<Self> {
        let store = Store::open(hashdb_dir, dbpath::HASH_DATA_STORE, mode, ensure_schema)?;
        Ok(Self {
            store,
            sector_size: settings.sector_size,
            max_pairs: settings.max_source_offset_pairs,
            _key: PhantomData,
        })
    }

    /// Create the record or replace its label, entropy and block label.
    /// Existing pairs are kept. `AlreadyPresent` when nothing differs.
    pub fn insert_hash_data(
        &self,
        hash: &K,
        non_probative_label: &str,
        entropy: u64,
        block_label: &str,
        changes: &Changes,
    ) -> Result<InsertOutcome> {
        let tx = self.store.begin_write()?;
        let (outcome, dirty) = {
            let mut table = tx.open_table(HASH_DATA)?;
            let existing = table
                .get(hash.as_bytes())?
                .map(|v| HashRecord::decode(v.value(), self.sector_size));

            let (record, outcome) = match existing {
                Some(mut rec) => {
                    let same = rec.non_probative_label == non_probative_label
                        && rec.entropy == entropy
                        && rec.block_label == block_label;
                    rec.non_probative_label = non_probative_label.to_string();
                    rec.entropy = entropy;
                    rec.block_label = block_label.to_string();
                    if same {
                        (None, InsertOutcome::AlreadyPresent)
                    } else {
                        (Some(rec), InsertOutcome::Updated)
                    }
                }
                None => (
                    Some(HashRecord::new(non_probative_label, entropy, block_label)),
                    InsertOutcome::Inserted,
                ),
            };

            let dirty = record.is_some();
            if let Some(rec) = record {
                table.insert(hash.as_bytes(), rec.encode(self.sector_size).as_slice())?;
            }
            (outcome, dirty)
        };

        if dirty {
            tx.commit()?;
        } else {
            tx.abort()?;
        }
        match outcome {
            InsertOutcome::Inserted => bump(&changes.hash_data_inserted),
            InsertOutcome::AlreadyPresent => bump(&changes.hash_data_unchanged),
            _ => bump(&changes.hash_data_updated),
        }
        Ok(outcome)
    }

    /// Add one pair to a hash that must already have a record.
    ///
    /// Panics if the record is missing or the offset is not a multiple of
    /// the sector size.
    pub fn insert_hash_source(
        &self,
        hash: &K,
        source_id: u64,
        file_offset: u64,
        changes: &Changes,
    ) -> Result<PairInsert> {
        assert_aligned(file_offset, self.sector_size);

        self.modify(hash, source_id, file_offset, changes, |existing| match existing {
            Some(rec) => rec,
            None => panic!(
                "insert_hash_source: no hash data record for {}",
                hash.to_hex()
            ),
        })
    }

    /// Create-or-update the record and add one pair, all in one transaction.
    /// An existing record keeps its non-probative label.
    pub fn insert(
        &self,
        hash: &K,
        source_id: u64,
        file_offset: u64,
        entropy: u64,
        block_label: &str,
        changes: &Changes,
    ) -> Result<PairInsert> {
        assert_aligned(file_offset, self.sector_size);

        self.modify(hash, source_id, file_offset, changes, |existing| match existing {
            Some(mut rec) => {
                if rec.entropy != entropy || rec.block_label != block_label {
                    rec.entropy = entropy;
                    rec.block_label = block_label.to_string();
                    bump(&changes.hash_data_updated);
                }
                rec
            }
            None => {
                bump(&changes.hash_data_inserted);
                HashRecord::new("", entropy, block_label)
            }
        })
    }

    fn modify(
        &self,
        hash: &K,
        source_id: u64,
        file_offset: u64,
        changes: &Changes,
        prepare: impl FnOnce(Option<HashRecord>) -> HashRecord,
    ) -> Result<PairInsert> {
        let tx = self.store.begin_write()?;
        let result = {
            let mut table = tx.open_table(HASH_DATA)?;
            let existing = table
                .get(hash.as_bytes())?
                .map(|v| HashRecord::decode(v.value(), self.sector_size));
            let before = existing.clone();
            let mut rec = prepare(existing);

            let pair = (source_id, file_offset);
            let outcome = if rec.pairs.contains(&pair) {
                bump(&changes.hash_source_already_present);
                InsertOutcome::AlreadyPresent
            } else if self.max_pairs != 0 && rec.pairs.len() as u64 >= self.max_pairs {
                bump(&changes.hash_source_at_max);
                InsertOutcome::AtMax
            } else {
                rec.pairs.insert(pair);
                bump(&changes.hash_source_inserted);
                InsertOutcome::Inserted
            };

            if before.as_ref() != Some(&rec) {
                table.insert(hash.as_bytes(), rec.encode(self.sector_size).as_slice())?;
            }

            let only_pair = match rec.pairs.len() {
                1 => rec.pairs.first().copied(),
                _ => None,
            };
            PairInsert {
                outcome,
                count: rec.pairs.len() as u64,
                only_pair,
            }
        };
        tx.commit()?;
        Ok(result)
    }

    pub fn find(&self, hash: &K) -> Result<Option<HashRecord>> {
        let tx = self.store.begin_read()?;
        let table = tx.open_table(HASH_DATA)?;
        let rec = table
            .get(hash.as_bytes())?
            .map(|v| HashRecord::decode(v.value(), self.sector_size));
        Ok(rec)
    }

    /// Number of source offset pairs, 0 if the hash is unknown.
    pub fn find_count(&self, hash: &K) -> Result<u64> {
        Ok(self.find(hash)?.map_or(0, |rec| rec.pairs.len() as u64))
    }

    pub fn find_begin(&self) -> Result<Option<K>> {
        let first = self.store.first_bytes_key(HASH_DATA)?;
        Ok(first.map(|k| digest_from_stored("hash data store", &k)))
    }

    /// Panics if `previous` is not a stored hash.
    pub fn find_next(&self, previous: &K) -> Result<Option<K>> {
        let next = self.store.next_bytes_key(HASH_DATA, previous.as_bytes())?;
        Ok(next.map(|k| digest_from_stored("hash data store", &k)))
    }

    pub fn size(&self) -> Result<u64> {
        self.store.len(HASH_DATA)
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Md5Digest;

    fn open(dir: &Path, mode: FileMode, settings: &Settings) -> HashDataManager<Md5Digest> {
        HashDataManager::open(dir, mode, settings).unwrap()
    }

    #[test]
    fn labels_are_replaced_and_pairs_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings::default();
        let m = open(tmp.path(), FileMode::Create, &settings);
        let changes = Changes::default();
        let h = Md5Digest([1; 16]);

        assert_eq!(
            m.insert_hash_data(&h, "", 5, "x", &changes).unwrap(),
            InsertOutcome::Inserted
        );
        m.insert_hash_source(&h, 1, 512, &changes).unwrap();
        assert_eq!(
            m.insert_hash_data(&h, "zeros", 6, "y", &changes).unwrap(),
            InsertOutcome::Updated
        );

        assert_eq!(
            m.insert_hash_data(&h, "zeros", 6, "y", &changes).unwrap(),
            InsertOutcome::AlreadyPresent
        );

        let rec = m.find(&h).unwrap().unwrap();
        assert_eq!(rec.non_probative_label, "zeros");
        assert_eq!(rec.entropy, 6);
        assert_eq!(rec.block_label, "y");
        assert_eq!(rec.pairs.len(), 1);

        let c = changes.snapshot();
        assert_eq!(c.hash_data_inserted, 1);
        assert_eq!(c.hash_data_updated, 1);
        assert_eq!(c.hash_data_unchanged, 1);
    }

    #[test]
    fn pairs_are_deduplicated() {
        let tmp = tempfile::tempdir().unwrap();
        let m = open(tmp.path(), FileMode::Create, &Settings::default());
        let changes = Changes::default();
        let h = Md5Digest([2; 16]);

        m.insert_hash_data(&h, "", 0, "", &changes).unwrap();
        let first = m.insert_hash_source(&h, 1, 1024, &changes).unwrap();
        assert_eq!(first.outcome, InsertOutcome::Inserted);
        assert_eq!(first.only_pair, Some((1, 1024)));

        let again = m.insert_hash_source(&h, 1, 1024, &changes).unwrap();
        assert_eq!(again.outcome, InsertOutcome::AlreadyPresent);
        assert_eq!(again.count, 1);

        let second = m.insert_hash_source(&h, 2, 0, &changes).unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.only_pair, None);

        assert_eq!(m.find_count(&h).unwrap(), 2);
        assert_eq!(m.find_count(&Md5Digest([3; 16])).unwrap(), 0);
    }

    #[test]
    fn pair_cap_is_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings {
            max_source_offset_pairs: 2,
            ..Settings::default()
        };
        let m = open(tmp.path(), FileMode::Create, &settings);
        let changes = Changes::default();
        let h = Md5Digest([4; 16]);

        m.insert(&h, 1, 0, 0, "", &changes).unwrap();
        m.insert(&h, 2, 0, 0, "", &changes).unwrap();
        let third = m.insert(&h, 3, 0, 0, "", &changes).unwrap();
        assert_eq!(third.outcome, InsertOutcome::AtMax);
        assert_eq!(third.count, 2);
        assert_eq!(changes.snapshot().hash_source_at_max, 1);
    }

    #[test]
    fn combined_insert_keeps_label() {
        let tmp = tempfile::tempdir().unwrap();
        let m = open(tmp.path(), FileMode::Create, &Settings::default());
        let changes = Changes::default();
        let h = Md5Digest([5; 16]);

        m.insert_hash_data(&h, "np", 1, "a", &changes).unwrap();
        let r = m.insert(&h, 9, 512, 2, "b", &changes).unwrap();
        assert_eq!(r.outcome, InsertOutcome::Inserted);

        let rec = m.find(&h).unwrap().unwrap();
        assert_eq!(rec.non_probative_label, "np");
        assert_eq!(rec.entropy, 2);
        assert_eq!(rec.block_label, "b");
        assert!(rec.pairs.contains(&(9, 512)));
    }

    #[test]
    #[should_panic(expected = "no hash data record")]
    fn pair_without_record_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let m = open(tmp.path(), FileMode::Create, &Settings::default());
        let _ = m.insert_hash_source(&Md5Digest([6; 16]), 1, 0, &Changes::default());
    }

    #[test]
    #[should_panic(expected = "not a multiple of sector size 4096")]
    fn misaligned_offset_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings {
            sector_size: 4096,
            ..Settings::default()
        };
        let m = open(tmp.path(), FileMode::Create, &settings);
        let _ = m.insert(&Md5Digest([7; 16]), 1, 512, 0, "", &Changes::default());
    }

    #[test]
    fn traversal_and_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings::default();
        {
            let m = open(tmp.path(), FileMode::Create, &settings);
            let changes = Changes::default();
            for b in [3u8, 1, 2] {
                m.insert(&Md5Digest([b; 16]), 1, 0, 0, "", &changes).unwrap();
            }
            m.sync().unwrap();
        }

        let m = open(tmp.path(), FileMode::ReadOnly, &settings);
        assert_eq!(m.size().unwrap(), 3);
        let mut seen = Vec::new();
        let mut cur = m.find_begin().unwrap();
        while let Some(h) = cur {
            seen.push(h.0[0]);
            cur = m.find_next(&h).unwrap();
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
