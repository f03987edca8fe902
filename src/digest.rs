use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// Hash families a database can be created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn width(self) -> usize {
        match self {
            HashAlgorithm::Md5 => Md5Digest::WIDTH,
            HashAlgorithm::Sha1 => Sha1Digest::WIDTH,
            HashAlgorithm::Sha256 => Sha256Digest::WIDTH,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fixed-width digest usable as a store key.
pub trait DigestKey:
    Copy + Ord + Hash + fmt::Debug + Send + Sync + 'static
{
    const WIDTH: usize;
    const ALGORITHM: HashAlgorithm;

    fn as_bytes(&self) -> &[u8];

    /// None unless `bytes` is exactly `WIDTH` long.
    fn from_slice(bytes: &[u8]) -> Option<Self>;

    fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

/// Turn a key read back from a store into a digest. A width mismatch means
/// the store was written with another algorithm or is corrupt.
pub(crate) fn digest_from_stored<K: DigestKey>(what: &str, bytes: &[u8]) -> K {
    match K::from_slice(bytes) {
        Some(k) => k,
        None => panic!(
            "{what} holds a {}-byte key, expected a {}-byte {} digest",
            bytes.len(),
            K::WIDTH,
            K::ALGORITHM
        ),
    }
}

macro_rules! digest_type {
    ($name:ident, $width:expr, $alg:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; $width]);

        impl DigestKey for $name {
            const WIDTH: usize = $width;
            const ALGORITHM: HashAlgorithm = $alg;

            fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            fn from_slice(bytes: &[u8]) -> Option<Self> {
                let arr: [u8; $width] = bytes.try_into().ok()?;
                Some(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }
    };
}

digest_type!(Md5Digest, 16, HashAlgorithm::Md5);
digest_type!(Sha1Digest, 20, HashAlgorithm::Sha1);
digest_type!(Sha256Digest, 32, HashAlgorithm::Sha256);
