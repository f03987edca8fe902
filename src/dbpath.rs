use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "settings.json";
pub const LOG_FILE: &str = "log.jsonl";
pub const LOCK_FILE: &str = "LOCK";
/// File name of the redb database inside each store directory.
pub const STORE_FILE: &str = "data.redb";

pub const HASH_DATA_STORE: &str = "hash_data_store";
pub const HASH_STORE: &str = "hash_store";
pub const SOURCE_DATA_STORE: &str = "source_data_store";
pub const SOURCE_ID_STORE: &str = "source_id_store";
pub const SOURCE_NAME_STORE: &str = "source_name_store";

pub const ALL_STORES: [&str; 5] = [
    HASH_DATA_STORE,
    HASH_STORE,
    SOURCE_DATA_STORE,
    SOURCE_ID_STORE,
    SOURCE_NAME_STORE,
];

pub fn store_file(hashdb_dir: &Path, store: &str) -> PathBuf {
    hashdb_dir.join(store).join(STORE_FILE)
}

/// Create the directory of a new database. The path must not exist yet.
pub fn create_hashdb_dir(hashdb_dir: &Path) -> Result<()> {
    if hashdb_dir.exists() {
        return Err(Error::AlreadyExists(hashdb_dir.to_path_buf()));
    }
    fs::create_dir_all(hashdb_dir).map_err(|e| {
        Error::io(
            format!("Unable to create new hashdb database at path '{}'", hashdb_dir.display()),
            e,
        )
    })
}

/// Check that `hashdb_dir` looks like a hashdb database before opening it.
pub fn ensure_hashdb_dir(hashdb_dir: &Path) -> Result<()> {
    if !hashdb_dir.is_dir() {
        return Err(Error::Settings(format!(
            "'{}' is not a hashdb directory",
            hashdb_dir.display()
        )));
    }

    let settings = hashdb_dir.join(SETTINGS_FILE);
    if !settings.is_file() {
        return Err(Error::Settings(format!(
            "'{}' does not look like a hashdb database (missing {})",
            hashdb_dir.display(),
            SETTINGS_FILE
        )));
    }

    for store in ALL_STORES {
        let file = store_file(hashdb_dir, store);
        if !file.is_file() {
            return Err(Error::Settings(format!(
                "'{}' is missing store file {}",
                hashdb_dir.display(),
                file.display()
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// One writer process at a time.
    Exclusive,
    /// Any number of readers, no writer.
    Shared,
}

/// Lock the database for this process. The lock is held until the returned
/// file is dropped.
pub fn open_and_lock(hashdb_dir: &Path, mode: LockMode) -> Result<File> {
    let lock_path = hashdb_dir.join(LOCK_FILE);
    let f = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| Error::io(format!("Failed to open lock file {}", lock_path.display()), e))?;

    let locked = match mode {
        LockMode::Exclusive => FileExt::try_lock_exclusive(&f),
        LockMode::Shared => FileExt::try_lock_shared(&f),
    };
    locked.map_err(|_| Error::Locked(hashdb_dir.to_path_buf()))?;

    Ok(f)
}
