use crate::changes::{Changes, bump};
use crate::dbpath;
use crate::error::Result;
use crate::records::{SourceNames, decode_names, encode_names};
use crate::schema::SOURCE_NAME;
use crate::store::{FileMode, InsertOutcome, Store};
use redb::{ReadableTable, TableError, WriteTransaction};
use std::path::Path;

/// Source id -> set of (repository name, filename).
pub struct SourceNameManager {
    store: Store,
}

fn ensure_schema(tx: &WriteTransaction) -> std::result::Result<(), TableError> {
    tx.open_table(SOURCE_NAME)?;
    Ok(())
}

impl SourceNameManager {
    pub fn open(hashdb_dir: &Path, mode: FileMode) -> Result<Self> {
        let store = Store::open(hashdb_dir, dbpath::SOURCE_NAME_STORE, mode, ensure_schema)?;
        Ok(Self { store })
    }

    pub fn insert(
        &self,
        source_id: u64,
        repository_name: &str,
        filename: &str,
        changes: &Changes,
    ) -> Result<InsertOutcome> {
        let tx = self.store.begin_write()?;
        let added = {
            let mut table = tx.open_table(SOURCE_NAME)?;
            let mut names = table
                .get(source_id)?
                .map(|v| decode_names(v.value()))
                .unwrap_or_default();
            let added = names.insert((repository_name.to_string(), filename.to_string()));
            if added {
                table.insert(source_id, encode_names(&names).as_slice())?;
            }
            added
        };

        if added {
            tx.commit()?;
            bump(&changes.source_name_inserted);
            Ok(InsertOutcome::Inserted)
        } else {
            tx.abort()?;
            bump(&changes.source_name_already_present);
            Ok(InsertOutcome::AlreadyPresent)
        }
    }

    /// Empty if the source has no names.
    pub fn find(&self, source_id: u64) -> Result<SourceNames> {
        let tx = self.store.begin_read()?;
        let table = tx.open_table(SOURCE_NAME)?;
        let names = table
            .get(source_id)?
            .map(|v| decode_names(v.value()))
            .unwrap_or_default();
        Ok(names)
    }

    pub fn find_begin(&self) -> Result<Option<u64>> {
        self.store.first_id_key(SOURCE_NAME)
    }

    pub fn find_next(&self, previous: u64) -> Result<Option<u64>> {
        self.store.next_id_key(SOURCE_NAME, previous)
    }

    pub fn size(&self) -> Result<u64> {
        self.store.len(SOURCE_NAME)
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }
}
