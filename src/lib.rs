//! Block hash database.
//!
//! For every block hash imported, a hashdb records which source files it was
//! seen in and at which offsets. A database is a directory of five redb
//! stores plus `settings.json` and a session log:
//!
//! - hash data: block hash -> labels, entropy, (source id, offset) pairs
//! - hash: approximate block hash -> pair count, for fast misses
//! - source data: source id -> file hash, size, type
//! - source id: file hash -> source id
//! - source name: source id -> (repository, filename) pairs
//!
//! Write through an [`ImportSession`], read through a [`ScanSession`].

mod codec;
mod schema;

pub mod changes;
pub mod dbpath;
pub mod digest;
pub mod digest_map;
pub mod error;
pub mod hash_data_manager;
pub mod hash_manager;
pub mod hashdb;
pub mod import;
pub mod json_lines;
pub mod json_records;
pub mod lookup_encoding;
pub mod records;
pub mod scan;
pub mod scan_list;
pub mod session_log;
pub mod set_ops;
pub mod settings;
pub mod source_data_manager;
pub mod source_id_manager;
pub mod source_name_manager;
pub mod store;

pub use changes::ChangeCounts;
pub use digest::{DigestKey, HashAlgorithm, Md5Digest, Sha1Digest, Sha256Digest};
pub use digest_map::MapType;
pub use error::{Error, Result};
pub use hashdb::{Sizes, create_hashdb};
pub use import::ImportSession;
pub use scan::{ExpandedMatch, HashMatch, ScanSession};
pub use settings::Settings;
pub use store::InsertOutcome;
