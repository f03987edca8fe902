use redb::TableDefinition;

/// block digest -> encoded HashRecord
pub const HASH_DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("hash_data");

/// masked digest prefix -> list of (digest suffix, lookup word)
pub const HASH: TableDefinition<&[u8], &[u8]> = TableDefinition::new("hash");

/// source id -> encoded SourceData
pub const SOURCE_DATA: TableDefinition<u64, &[u8]> = TableDefinition::new("source_data");

/// file digest -> source id
pub const SOURCE_ID: TableDefinition<&[u8], u64> = TableDefinition::new("source_id");

/// counters for the source id store
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
pub const KEY_NEXT_SOURCE_ID: &str = "next_source_id";

/// source id -> encoded set of (repository name, filename)
pub const SOURCE_NAME: TableDefinition<u64, &[u8]> = TableDefinition::new("source_name");
