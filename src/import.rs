//! Read-write access to a database.
//!
//! Stores are independent redb files, so a hash insert touches several of
//! them in separate transactions. The order is always: mint the source id,
//! seed its source data, then add the hash pair. A crash in between leaves
//! a source without hashes, never a hash pointing at a missing source.

use crate::changes::{ChangeCounts, Changes};
use crate::dbpath::{self, LockMode};
use crate::digest::DigestKey;
use crate::error::Result;
use crate::hashdb::{Sizes, Stores};
use crate::json_records;
use crate::records::SourceData;
use crate::session_log;
use crate::settings::Settings;
use crate::store::{FileMode, InsertOutcome};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::path::{Path, PathBuf};

pub struct ImportSession<K: DigestKey> {
    hashdb_dir: PathBuf,
    command: String,
    started: DateTime<Utc>,
    stores: Stores<K>,
    changes: Changes,
    closed: bool,
    _lock: File,
}

impl<K: DigestKey> ImportSession<K> {
    /// Open for writing. Only one import session per database can exist at a
    /// time; `command` is recorded in the session log on close.
    pub fn open(hashdb_dir: &Path, command: &str) -> Result<Self> {
        dbpath::ensure_hashdb_dir(hashdb_dir)?;
        let lock = dbpath::open_and_lock(hashdb_dir, LockMode::Exclusive)?;
        let stores = Stores::open(hashdb_dir, FileMode::ReadWrite)?;
        tracing::info!(dir = %hashdb_dir.display(), command, "import session opened");

        Ok(Self {
            hashdb_dir: hashdb_dir.to_path_buf(),
            command: command.to_string(),
            started: Utc::now(),
            stores,
            changes: Changes::default(),
            closed: false,
            _lock: lock,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.stores.settings
    }

    /// Source id for `file_hash`, creating it and a placeholder source data
    /// record when the file is new.
    fn source_id(&self, file_hash: &K) -> Result<u64> {
        let (is_new, id) = self.stores.source_id.insert(file_hash, &self.changes)?;
        if is_new {
            self.stores.source_data.insert(
                id,
                &SourceData::placeholder(*file_hash),
                &self.changes,
            )?;
        }
        Ok(id)
    }

    pub fn insert_source_name(
        &self,
        file_hash: &K,
        repository_name: &str,
        filename: &str,
    ) -> Result<InsertOutcome> {
        let id = self.source_id(file_hash)?;
        self.stores
            .source_name
            .insert(id, repository_name, filename, &self.changes)
    }

    pub fn insert_source_data(
        &self,
        file_hash: &K,
        filesize: u64,
        file_type: &str,
        nonprobative_count: u64,
    ) -> Result<InsertOutcome> {
        let (_, id) = self.stores.source_id.insert(file_hash, &self.changes)?;
        let data = SourceData {
            file_hash: *file_hash,
            filesize,
            file_type: file_type.to_string(),
            nonprobative_count,
        };
        self.stores.source_data.insert(id, &data, &self.changes)
    }

    /// Add one (file, offset) occurrence of `block_hash`, creating the hash
    /// record if needed. An existing record keeps its non-probative label.
    ///
    /// Panics if `file_offset` is not a multiple of the sector size.
    pub fn insert_hash(
        &self,
        block_hash: &K,
        file_hash: &K,
        file_offset: u64,
        entropy: u64,
        block_label: &str,
    ) -> Result<InsertOutcome> {
        let id = self.source_id(file_hash)?;
        let added = self.stores.hash_data.insert(
            block_hash,
            id,
            file_offset,
            entropy,
            block_label,
            &self.changes,
        )?;
        if added.outcome == InsertOutcome::Inserted {
            self.stores
                .hash
                .insert(block_hash, added.count, added.only_pair, &self.changes)?;
        }
        Ok(added.outcome)
    }

    /// Create the hash record or replace its labels and entropy, keeping its
    /// source offset pairs.
    pub fn insert_hash_data(
        &self,
        block_hash: &K,
        non_probative_label: &str,
        entropy: u64,
        block_label: &str,
    ) -> Result<InsertOutcome> {
        self.stores.hash_data.insert_hash_data(
            block_hash,
            non_probative_label,
            entropy,
            block_label,
            &self.changes,
        )
    }

    /// Add a pair to a hash whose record exists already.
    ///
    /// Panics if it does not, or if `file_offset` is misaligned.
    pub fn insert_hash_source(
        &self,
        block_hash: &K,
        file_hash: &K,
        file_offset: u64,
    ) -> Result<InsertOutcome> {
        let id = self.source_id(file_hash)?;
        let added =
            self.stores
                .hash_data
                .insert_hash_source(block_hash, id, file_offset, &self.changes)?;
        if added.outcome == InsertOutcome::Inserted {
            self.stores
                .hash
                .insert(block_hash, added.count, added.only_pair, &self.changes)?;
        }
        Ok(added.outcome)
    }

    /// Import one JSON hash record. Nothing is written unless every field
    /// is valid.
    pub fn insert_hash_json(&self, text: &str) -> Result<()> {
        let rec = json_records::parse_hash::<K>(text, self.settings().sector_size)?;

        if let Some(label) = &rec.non_probative_label {
            self.insert_hash_data(&rec.block_hash, label, rec.entropy, &rec.block_label)?;
        }
        for (file_hash, offset) in &rec.source_offset_pairs {
            self.insert_hash(
                &rec.block_hash,
                file_hash,
                *offset,
                rec.entropy,
                &rec.block_label,
            )?;
        }
        Ok(())
    }

    /// Import one JSON source record. Nothing is written unless every field
    /// is valid.
    pub fn insert_source_json(&self, text: &str) -> Result<()> {
        let rec = json_records::parse_source::<K>(text)?;

        self.insert_source_data(
            &rec.file_hash,
            rec.filesize,
            &rec.file_type,
            rec.nonprobative_count,
        )?;
        for (repository_name, filename) in &rec.name_pairs {
            self.insert_source_name(&rec.file_hash, repository_name, filename)?;
        }
        Ok(())
    }

    /// Counters so far. Approximate-store counters only move when its buffer
    /// is flushed.
    pub fn changes(&self) -> ChangeCounts {
        self.changes.snapshot()
    }

    /// Store sizes, after flushing the approximate store's buffer.
    pub fn sizes(&self) -> Result<Sizes> {
        self.stores.hash.flush(&self.changes)?;
        self.stores.sizes()
    }

    /// Flush, sync every store and append the session to the log.
    pub fn close(mut self) -> Result<ChangeCounts> {
        self.finish()
    }

    fn finish(&mut self) -> Result<ChangeCounts> {
        self.closed = true;
        self.stores.hash.flush(&self.changes)?;
        self.stores.sync()?;

        let counts = self.changes.snapshot();
        let sizes = self.stores.sizes()?;
        session_log::append(&self.hashdb_dir, &self.command, self.started, &counts, &sizes)?;
        tracing::info!(command = %self.command, %sizes, "import session closed");
        Ok(counts)
    }
}

impl<K: DigestKey> Drop for ImportSession<K> {
    fn drop(&mut self) {
        if !self.closed && !std::thread::panicking() {
            if let Err(e) = self.finish() {
                tracing::warn!(error = %e, "import session not closed cleanly");
            }
        }
    }
}
