use crate::dbpath;
use crate::error::{Error, Result};
use redb::{
    Database, Durability, ReadTransaction, ReadableTable, ReadableTableMetadata, TableDefinition,
    TableError, Value, WriteTransaction,
};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

// redb locks a store file for each `Database`, so a file is opened once per
// process and every session reading it shares that handle.
static OPEN_STORES: Mutex<BTreeMap<PathBuf, Weak<Database>>> = Mutex::new(BTreeMap::new());

fn open_shared(path: &Path, create: bool) -> Result<Arc<Database>> {
    let mut open = OPEN_STORES.lock().unwrap_or_else(PoisonError::into_inner);
    open.retain(|_, db| db.strong_count() > 0);

    if !create {
        let key = path
            .canonicalize()
            .map_err(|e| Error::io(format!("Failed to resolve {}", path.display()), e))?;
        if let Some(db) = open.get(&key).and_then(Weak::upgrade) {
            return Ok(db);
        }
        let db = Arc::new(Database::open(&key)?);
        open.insert(key, Arc::downgrade(&db));
        return Ok(db);
    }

    let db = Arc::new(Database::create(path)?);
    let key = path
        .canonicalize()
        .map_err(|e| Error::io(format!("Failed to resolve {}", path.display()), e))?;
    open.insert(key, Arc::downgrade(&db));
    Ok(db)
}

/// How a store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// New store in a new database directory.
    Create,
    /// Existing store, reads and writes.
    ReadWrite,
    /// Existing store, reads only.
    ReadOnly,
}

/// What an insert did to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Updated,
    /// Nothing to change.
    AlreadyPresent,
    /// The hash already carries the maximum number of source offset pairs.
    AtMax,
}

/// Creates the tables of one store inside a write transaction.
pub type EnsureSchema = fn(&WriteTransaction) -> std::result::Result<(), TableError>;

/// One redb environment living in its own subdirectory of a hashdb.
pub struct Store {
    name: &'static str,
    mode: FileMode,
    db: Arc<Database>,
}

impl Store {
    pub fn open(
        hashdb_dir: &Path,
        name: &'static str,
        mode: FileMode,
        ensure_schema: EnsureSchema,
    ) -> Result<Self> {
        let path = dbpath::store_file(hashdb_dir, name);

        let db = match mode {
            FileMode::Create => {
                let dir = hashdb_dir.join(name);
                std::fs::create_dir_all(&dir)
                    .map_err(|e| Error::io(format!("Failed to create {}", dir.display()), e))?;
                open_shared(&path, true)?
            }
            FileMode::ReadWrite | FileMode::ReadOnly => {
                if !path.is_file() {
                    return Err(Error::Settings(format!(
                        "store file {} does not exist",
                        path.display()
                    )));
                }
                open_shared(&path, false)?
            }
        };

        let store = Self { name, mode, db };

        if mode != FileMode::ReadOnly {
            let tx = store.db.begin_write()?;
            ensure_schema(&tx)?;
            tx.commit()?;
        }

        tracing::debug!(store = name, ?mode, path = %path.display(), "store opened");
        Ok(store)
    }

    /// Start a read-modify-write. redb runs one write transaction at a time,
    /// so everything done inside it is serialized against other writers.
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        if self.mode == FileMode::ReadOnly {
            panic!("{}: write attempted on a store opened read-only", self.name);
        }
        let mut tx = self.db.begin_write()?;
        // Bulk imports commit constantly; sync() at close makes it durable.
        tx.set_durability(Durability::Eventual);
        Ok(tx)
    }

    pub fn begin_read(&self) -> Result<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    /// Make every earlier commit durable.
    pub fn sync(&self) -> Result<()> {
        if self.mode == FileMode::ReadOnly {
            return Ok(());
        }
        let mut tx = self.db.begin_write()?;
        tx.set_durability(Durability::Immediate);
        tx.commit()?;
        Ok(())
    }

    /// Number of keys in `table`.
    pub fn len<K: redb::Key + 'static, V: Value + 'static>(
        &self,
        table: TableDefinition<K, V>,
    ) -> Result<u64> {
        let tx = self.db.begin_read()?;
        let t = tx.open_table(table)?;
        Ok(t.len()?)
    }

    pub fn first_bytes_key<V: Value + 'static>(
        &self,
        table: TableDefinition<&'static [u8], V>,
    ) -> Result<Option<Vec<u8>>> {
        let tx = self.db.begin_read()?;
        let t = tx.open_table(table)?;
        let first = t.first()?.map(|(k, _)| k.value().to_vec());
        Ok(first)
    }

    /// Key following `previous`, which must still be in the table.
    pub fn next_bytes_key<V: Value + 'static>(
        &self,
        table: TableDefinition<&'static [u8], V>,
        previous: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let tx = self.db.begin_read()?;
        let t = tx.open_table(table)?;

        if t.get(previous)?.is_none() {
            panic!(
                "{}: find_next called with key {} which is not in the store",
                self.name,
                hex::encode(previous)
            );
        }

        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Excluded(previous), Bound::Unbounded);
        let next = match t.range::<&[u8]>(bounds)?.next() {
            Some(item) => Some(item?.0.value().to_vec()),
            None => None,
        };
        Ok(next)
    }

    pub fn first_id_key<V: Value + 'static>(
        &self,
        table: TableDefinition<u64, V>,
    ) -> Result<Option<u64>> {
        let tx = self.db.begin_read()?;
        let t = tx.open_table(table)?;
        let first = t.first()?.map(|(k, _)| k.value());
        Ok(first)
    }

    pub fn next_id_key<V: Value + 'static>(
        &self,
        table: TableDefinition<u64, V>,
        previous: u64,
    ) -> Result<Option<u64>> {
        let tx = self.db.begin_read()?;
        let t = tx.open_table(table)?;

        if t.get(previous)?.is_none() {
            panic!(
                "{}: find_next called with id {previous} which is not in the store",
                self.name
            );
        }

        let bounds: (Bound<u64>, Bound<u64>) = (Bound::Excluded(previous), Bound::Unbounded);
        let next = match t.range(bounds)?.next() {
            Some(item) => Some(item?.0.value()),
            None => None,
        };
        Ok(next)
    }
}
