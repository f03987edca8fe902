use std::path::PathBuf;

/// Errors a caller of the library can act on.
///
/// Broken invariants inside the stores (misaligned offsets, corrupt
/// encodings, dangling source ids) are not represented here: they panic,
/// and the release profile aborts the process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("source lookup index bits {bits} is outside the allowed range 32..=40")]
    OutOfRange { bits: u32 },

    #[error("{what} value {value:#x} is invalid for a {bits}-bit field")]
    InvalidValue {
        what: &'static str,
        value: u64,
        bits: u32,
    },

    #[error("{0}")]
    InvalidRecord(String),

    #[error("path '{}' already exists", .0.display())]
    AlreadyExists(PathBuf),

    #[error("hashdb settings not read: {0}")]
    Settings(String),

    #[error("database uses {found} digests but {expected} was requested")]
    AlgorithmMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("database is locked (in use?): {}", .0.display())]
    Locked(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage engine: {0}")]
    Engine(#[from] redb::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid_record(msg: impl Into<String>) -> Self {
        Error::InvalidRecord(msg.into())
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

// redb splits its errors per operation; fold them into the umbrella type.
macro_rules! engine_error_from {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for Error {
                fn from(e: $t) -> Self {
                    Error::Engine(e.into())
                }
            }
        )*
    };
}

engine_error_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
