//! The five stores of one database, opened together.

use crate::changes::ChangeCounts;
use crate::dbpath;
use crate::digest::{DigestKey, HashAlgorithm, Md5Digest, Sha1Digest, Sha256Digest};
use crate::error::{Error, Result};
use crate::hash_data_manager::HashDataManager;
use crate::hash_manager::HashManager;
use crate::session_log;
use crate::settings::{self, Settings};
use crate::source_data_manager::SourceDataManager;
use crate::source_id_manager::SourceIdManager;
use crate::source_name_manager::SourceNameManager;
use crate::store::FileMode;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Number of keys in each store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sizes {
    pub hash_data_store: u64,
    pub hash_store: u64,
    pub source_data_store: u64,
    pub source_id_store: u64,
    pub source_name_store: u64,
}

impl fmt::Display for Sizes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

pub(crate) struct Stores<K: DigestKey> {
    pub settings: Settings,
    pub hash_data: HashDataManager<K>,
    pub hash: HashManager<K>,
    pub source_data: SourceDataManager<K>,
    pub source_id: SourceIdManager<K>,
    pub source_name: SourceNameManager,
}

impl<K: DigestKey> Stores<K> {
    pub fn open(hashdb_dir: &Path, mode: FileMode) -> Result<Self> {
        if mode != FileMode::Create {
            dbpath::ensure_hashdb_dir(hashdb_dir)?;
        }
        let settings = settings::read_settings(hashdb_dir)?;
        if settings.hash_algorithm != K::ALGORITHM {
            return Err(Error::AlgorithmMismatch {
                expected: K::ALGORITHM.name(),
                found: settings.hash_algorithm.name(),
            });
        }

        let stores = Self {
            hash_data: HashDataManager::open(hashdb_dir, mode, &settings)?,
            hash: HashManager::open(hashdb_dir, mode, &settings)?,
            source_data: SourceDataManager::open(hashdb_dir, mode)?,
            source_id: SourceIdManager::open(hashdb_dir, mode, &settings)?,
            source_name: SourceNameManager::open(hashdb_dir, mode)?,
            settings,
        };
        tracing::debug!(dir = %hashdb_dir.display(), ?mode, "hashdb opened");
        Ok(stores)
    }

    pub fn sizes(&self) -> Result<Sizes> {
        Ok(Sizes {
            hash_data_store: self.hash_data.size()?,
            hash_store: self.hash.size()?,
            source_data_store: self.source_data.size()?,
            source_id_store: self.source_id.size()?,
            source_name_store: self.source_name.size()?,
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.hash_data.sync()?;
        self.hash.sync()?;
        self.source_data.sync()?;
        self.source_id.sync()?;
        self.source_name.sync()?;
        Ok(())
    }
}

/// Create a new, empty database at `hashdb_dir`, which must not exist.
pub fn create_hashdb(hashdb_dir: &Path, settings: &Settings, command: &str) -> Result<()> {
    let started = Utc::now();
    settings.validate()?;
    dbpath::create_hashdb_dir(hashdb_dir)?;
    settings::write_settings(hashdb_dir, settings)?;

    match settings.hash_algorithm {
        HashAlgorithm::Md5 => create_stores::<Md5Digest>(hashdb_dir)?,
        HashAlgorithm::Sha1 => create_stores::<Sha1Digest>(hashdb_dir)?,
        HashAlgorithm::Sha256 => create_stores::<Sha256Digest>(hashdb_dir)?,
    }

    session_log::append(
        hashdb_dir,
        command,
        started,
        &ChangeCounts::default(),
        &Sizes::default(),
    )?;
    tracing::info!(dir = %hashdb_dir.display(), algorithm = %settings.hash_algorithm, "hashdb created");
    Ok(())
}

fn create_stores<K: DigestKey>(hashdb_dir: &Path) -> Result<()> {
    let stores = Stores::<K>::open(hashdb_dir, FileMode::Create)?;
    stores.sync()
}
