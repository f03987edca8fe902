//! Read-only access to a database.

use crate::dbpath::{self, LockMode};
use crate::digest::DigestKey;
use crate::error::Result;
use crate::hashdb::{Sizes, Stores};
use crate::json_records::{self, SourceOut};
use crate::records::{SourceData, SourceNames};
use crate::settings::Settings;
use crate::store::FileMode;
use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// What a database knows about one block hash, with source ids resolved to
/// file hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashMatch<K> {
    pub non_probative_label: String,
    pub entropy: u64,
    pub block_label: String,
    pub source_offset_pairs: BTreeSet<(K, u64)>,
}

/// Answer of [`ScanSession::find_expanded_hash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandedMatch {
    NotFound,
    /// Matched, but this session already returned the full record.
    AlreadyReported,
    Match(String),
}

struct Reported<K> {
    hashes: HashSet<K>,
    sources: HashSet<K>,
}

pub struct ScanSession<K: DigestKey> {
    stores: Stores<K>,
    reported: Mutex<Reported<K>>,
    _lock: File,
}

impl<K: DigestKey> ScanSession<K> {
    pub fn open(hashdb_dir: &Path) -> Result<Self> {
        dbpath::ensure_hashdb_dir(hashdb_dir)?;
        let lock = dbpath::open_and_lock(hashdb_dir, LockMode::Shared)?;
        let stores = Stores::open(hashdb_dir, FileMode::ReadOnly)?;
        Ok(Self {
            stores,
            reported: Mutex::new(Reported {
                hashes: HashSet::new(),
                sources: HashSet::new(),
            }),
            _lock: lock,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.stores.settings
    }

    /// Look up a block hash. The approximate store is asked first, so most
    /// misses never touch the hash data store.
    ///
    /// Panics if a stored source id has no source data, or if that data
    /// names a file hash whose id is not `source_id`.
    pub fn find_hash(&self, block_hash: &K) -> Result<Option<HashMatch<K>>> {
        if self.stores.hash.find(block_hash)? == 0 {
            return Ok(None);
        }
        let Some(rec) = self.stores.hash_data.find(block_hash)? else {
            return Ok(None);
        };

        let mut source_offset_pairs = BTreeSet::new();
        for &(source_id, offset) in &rec.pairs {
            source_offset_pairs.insert((self.file_hash_of(block_hash, source_id)?, offset));
        }

        Ok(Some(HashMatch {
            non_probative_label: rec.non_probative_label,
            entropy: rec.entropy,
            block_label: rec.block_label,
            source_offset_pairs,
        }))
    }

    fn file_hash_of(&self, block_hash: &K, source_id: u64) -> Result<K> {
        let Some(data) = self.stores.source_data.find(source_id)? else {
            panic!(
                "hash {} refers to source id {source_id}, which has no source data",
                block_hash.to_hex()
            );
        };
        match self.stores.source_id.find(&data.file_hash)? {
            Some(id) if id == source_id => Ok(data.file_hash),
            other => panic!(
                "source id {source_id} holds file hash {}, which does not map back to it (maps to {other:?})",
                data.file_hash.to_hex()
            ),
        }
    }

    pub fn find_hash_json(&self, block_hash: &K) -> Result<Option<String>> {
        let found = self.find_hash(block_hash)?.map(|m| {
            json_records::hash_to_json(
                block_hash,
                &m.non_probative_label,
                m.entropy,
                &m.block_label,
                &m.source_offset_pairs,
            )
        });
        Ok(found)
    }

    /// Like [`find_hash_json`](Self::find_hash_json), but each hash is
    /// reported in full only once per session, and each source's metadata is
    /// included only the first time the source appears.
    pub fn find_expanded_hash(&self, block_hash: &K) -> Result<ExpandedMatch> {
        let Some(m) = self.find_hash(block_hash)? else {
            return Ok(ExpandedMatch::NotFound);
        };

        // Decide what is new under the lock, read the stores outside it.
        let new_sources: Vec<K> = {
            let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);
            if !reported.hashes.insert(*block_hash) {
                return Ok(ExpandedMatch::AlreadyReported);
            }
            let distinct: BTreeSet<K> = m.source_offset_pairs.iter().map(|(k, _)| *k).collect();
            distinct
                .into_iter()
                .filter(|k| reported.sources.insert(*k))
                .collect()
        };

        let mut details = Vec::with_capacity(new_sources.len());
        for file_hash in new_sources {
            let data = self
                .find_source_data(&file_hash)?
                .unwrap_or_else(|| SourceData::placeholder(file_hash));
            let names = self.find_source_names(&file_hash)?;
            details.push((data, names));
        }
        let sources = details
            .iter()
            .map(|(data, names)| {
                SourceOut::new(
                    &data.file_hash,
                    data.filesize,
                    &data.file_type,
                    data.nonprobative_count,
                    names,
                )
            })
            .collect();

        Ok(ExpandedMatch::Match(json_records::expanded_to_json(
            block_hash,
            m.entropy,
            &m.block_label,
            &m.source_offset_pairs,
            sources,
        )))
    }

    /// Exact number of source offset pairs stored for `block_hash`.
    pub fn find_hash_count(&self, block_hash: &K) -> Result<u64> {
        self.stores.hash_data.find_count(block_hash)
    }

    /// Fast estimate from the approximate store. 0 is exact; other values
    /// may be too high.
    pub fn find_approximate_hash_count(&self, block_hash: &K) -> Result<u64> {
        self.stores.hash.find(block_hash)
    }

    /// Source data for a file hash. Panics if the data stored under the
    /// file's source id names another file hash.
    pub fn find_source_data(&self, file_hash: &K) -> Result<Option<SourceData<K>>> {
        match self.stores.source_id.find(file_hash)? {
            Some(id) => self.stores.source_data.find_checked(id, file_hash),
            None => Ok(None),
        }
    }

    /// Empty if the file hash is unknown.
    pub fn find_source_names(&self, file_hash: &K) -> Result<SourceNames> {
        match self.stores.source_id.find(file_hash)? {
            Some(id) => self.stores.source_name.find(id),
            None => Ok(SourceNames::new()),
        }
    }

    pub fn find_source_json(&self, file_hash: &K) -> Result<Option<String>> {
        let Some(data) = self.find_source_data(file_hash)? else {
            return Ok(None);
        };
        let names = self.find_source_names(file_hash)?;
        let out = SourceOut::new(
            file_hash,
            data.filesize,
            &data.file_type,
            data.nonprobative_count,
            &names,
        );
        Ok(Some(json_records::source_to_json(&out)))
    }

    pub fn hash_begin(&self) -> Result<Option<K>> {
        self.stores.hash_data.find_begin()
    }

    pub fn hash_next(&self, previous: &K) -> Result<Option<K>> {
        self.stores.hash_data.find_next(previous)
    }

    pub fn source_begin(&self) -> Result<Option<K>> {
        self.stores.source_id.find_begin()
    }

    pub fn source_next(&self, previous: &K) -> Result<Option<K>> {
        self.stores.source_id.find_next(previous)
    }

    /// Every stored block hash, in order.
    pub fn hashes(&self) -> impl Iterator<Item = Result<K>> + '_ {
        Traverse::new(move || self.hash_begin(), move |k: &K| self.hash_next(k))
    }

    /// Every known file hash, in order.
    pub fn sources(&self) -> impl Iterator<Item = Result<K>> + '_ {
        Traverse::new(move || self.source_begin(), move |k: &K| self.source_next(k))
    }

    pub fn sizes(&self) -> Result<Sizes> {
        self.stores.sizes()
    }

    pub fn size_hashes(&self) -> Result<u64> {
        self.stores.hash_data.size()
    }

    pub fn size_sources(&self) -> Result<u64> {
        self.stores.source_id.size()
    }
}

/// Drives a begin/next pair as an iterator. Stops after the first error.
struct Traverse<K, B, N> {
    begin: Option<B>,
    next: N,
    current: Option<K>,
    done: bool,
}

impl<K, B, N> Traverse<K, B, N> {
    fn new(begin: B, next: N) -> Self {
        Self {
            begin: Some(begin),
            next,
            current: None,
            done: false,
        }
    }
}

impl<K, B, N> Iterator for Traverse<K, B, N>
where
    K: Copy,
    B: FnOnce() -> Result<Option<K>>,
    N: FnMut(&K) -> Result<Option<K>>,
{
    type Item = Result<K>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = match (self.begin.take(), self.current) {
            (Some(begin), _) => begin(),
            (None, Some(prev)) => (self.next)(&prev),
            (None, None) => Ok(None),
        };
        match step {
            Ok(Some(k)) => {
                self.current = Some(k);
                Some(Ok(k))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Md5Digest;
    use crate::hashdb::create_hashdb;
    use crate::import::ImportSession;
    use serde_json::Value;
    use std::path::PathBuf;

    fn d(byte: u8) -> Md5Digest {
        Md5Digest([byte; 16])
    }

    // Block 1 is in files 0xf1 and 0xf2, block 2 only in 0xf1.
    fn sample_db(tmp: &tempfile::TempDir) -> PathBuf {
        let dir = tmp.path().join("db");
        create_hashdb(&dir, &Settings::default(), "create").unwrap();

        let session = ImportSession::<Md5Digest>::open(&dir, "import").unwrap();
        session.insert_source_name(&d(0xf1), "repoA", "file1").unwrap();
        session.insert_source_data(&d(0xf1), 4096, "bin", 0).unwrap();
        session.insert_hash(&d(1), &d(0xf1), 0, 5, "").unwrap();
        session.insert_hash(&d(1), &d(0xf2), 512, 5, "").unwrap();
        session.insert_hash(&d(2), &d(0xf1), 1024, 7, "R").unwrap();
        session.close().unwrap();
        dir
    }

    fn expanded(m: ExpandedMatch) -> Value {
        match m {
            ExpandedMatch::Match(json) => serde_json::from_str(&json).unwrap(),
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn expanded_reports_each_hash_and_source_once() {
        let tmp = tempfile::tempdir().unwrap();
        let scan = ScanSession::<Md5Digest>::open(&sample_db(&tmp)).unwrap();

        let first = expanded(scan.find_expanded_hash(&d(1)).unwrap());
        assert_eq!(first["block_hash"], d(1).to_hex());
        assert_eq!(first["entropy"], 5);
        assert_eq!(first["sources"].as_array().unwrap().len(), 2);
        assert_eq!(first["source_offset_pairs"].as_array().unwrap().len(), 4);
        assert!(first["source_list_id"].is_u64());
        assert_eq!(first["sources"][0]["name_pairs"][0], "repoA");

        // file 0xf1 was described already
        let second = expanded(scan.find_expanded_hash(&d(2)).unwrap());
        assert_eq!(second["sources"].as_array().unwrap().len(), 0);
        assert_eq!(second["block_label"], "R");

        assert_eq!(
            scan.find_expanded_hash(&d(1)).unwrap(),
            ExpandedMatch::AlreadyReported
        );
        assert_eq!(
            scan.find_expanded_hash(&d(3)).unwrap(),
            ExpandedMatch::NotFound
        );
    }

    #[test]
    fn plain_lookup_repeats() {
        let tmp = tempfile::tempdir().unwrap();
        let scan = ScanSession::<Md5Digest>::open(&sample_db(&tmp)).unwrap();

        let a = scan.find_hash_json(&d(2)).unwrap().unwrap();
        let b = scan.find_hash_json(&d(2)).unwrap().unwrap();
        assert_eq!(a, b);
        assert!(scan.find_hash(&d(9)).unwrap().is_none());
        assert_eq!(scan.find_hash_count(&d(9)).unwrap(), 0);
        assert_eq!(scan.find_approximate_hash_count(&d(9)).unwrap(), 0);
    }

    #[test]
    fn traversal_is_ordered() {
        let tmp = tempfile::tempdir().unwrap();
        let scan = ScanSession::<Md5Digest>::open(&sample_db(&tmp)).unwrap();

        let hashes: Vec<_> = scan.hashes().collect::<Result<_>>().unwrap();
        assert_eq!(hashes, vec![d(1), d(2)]);
        let sources: Vec<_> = scan.sources().collect::<Result<_>>().unwrap();
        assert_eq!(sources, vec![d(0xf1), d(0xf2)]);

        assert_eq!(scan.size_hashes().unwrap(), 2);
        assert_eq!(scan.size_sources().unwrap(), 2);

        // a file only seen through a hash has placeholder metadata
        let data = scan.find_source_data(&d(0xf2)).unwrap().unwrap();
        assert_eq!(data.filesize, 0);
        assert!(scan.find_source_names(&d(0xf2)).unwrap().is_empty());
        assert!(scan.find_source_json(&d(0xf3)).unwrap().is_none());
    }

    #[test]
    fn readers_share_the_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = sample_db(&tmp);
        let scan = ScanSession::<Md5Digest>::open(&dir).unwrap();
        assert!(matches!(
            ImportSession::<Md5Digest>::open(&dir, "import"),
            Err(crate::error::Error::Locked(_))
        ));
        drop(scan);
    }

    #[test]
    #[should_panic(expected = "does not map back")]
    fn source_data_naming_another_file_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = sample_db(&tmp);

        // point source id 1 (file 0xf1) at a file hash the database never saw
        {
            let path = crate::dbpath::store_file(&dir, crate::dbpath::SOURCE_DATA_STORE);
            let db = redb::Database::open(&path).unwrap();
            let tx = db.begin_write().unwrap();
            {
                let mut table = tx.open_table(crate::schema::SOURCE_DATA).unwrap();
                let forged = SourceData::placeholder(d(0x99)).encode();
                table.insert(1u64, forged.as_slice()).unwrap();
            }
            tx.commit().unwrap();
        }

        let scan = ScanSession::<Md5Digest>::open(&dir).unwrap();
        let _ = scan.find_hash(&d(2));
    }

    #[test]
    fn two_readers_at_once() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = sample_db(&tmp);

        let first = ScanSession::<Md5Digest>::open(&dir).unwrap();
        let second = ScanSession::<Md5Digest>::open(&dir).unwrap();
        std::thread::scope(|s| {
            for session in [&first, &second] {
                s.spawn(move || {
                    for _ in 0..50 {
                        assert_eq!(session.find_hash_count(&d(1)).unwrap(), 2);
                        assert!(session.find_hash(&d(2)).unwrap().is_some());
                    }
                });
            }
        });

        // each session keeps its own record of what it reported
        assert!(matches!(first.find_expanded_hash(&d(1)).unwrap(), ExpandedMatch::Match(_)));
        assert!(matches!(second.find_expanded_hash(&d(1)).unwrap(), ExpandedMatch::Match(_)));
        drop(first);
        drop(second);

        ImportSession::<Md5Digest>::open(&dir, "import").unwrap().close().unwrap();
    }
}
