use crate::dbpath::SETTINGS_FILE;
use crate::digest::HashAlgorithm;
use crate::digest_map::MapType;
use crate::error::{Error, Result};
use crate::lookup_encoding;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

pub const CURRENT_SETTINGS_VERSION: u32 = 3;

/// Per-database configuration, fixed when the database is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub settings_version: u32,
    pub hash_algorithm: HashAlgorithm,
    pub map_type: MapType,
    pub sector_size: u64,
    pub block_size: u64,
    /// Pairs kept per block hash; 0 means no limit.
    pub max_source_offset_pairs: u64,
    pub hash_prefix_bits: u32,
    pub hash_suffix_bytes: u32,
    pub source_lookup_index_bits: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            settings_version: CURRENT_SETTINGS_VERSION,
            hash_algorithm: HashAlgorithm::Md5,
            map_type: MapType::Btree,
            sector_size: 512,
            block_size: 512,
            max_source_offset_pairs: 100_000,
            hash_prefix_bits: 28,     // for 2^28
            hash_suffix_bytes: 3,     // for 2^(3*8)
            source_lookup_index_bits: 32,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::Settings(msg));

        if self.settings_version != CURRENT_SETTINGS_VERSION {
            return bad(format!(
                "settings version {} is not the supported version {}",
                self.settings_version, CURRENT_SETTINGS_VERSION
            ));
        }
        if self.sector_size == 0 {
            return bad("sector_size must be greater than 0".to_string());
        }
        if self.block_size == 0 || self.block_size % self.sector_size != 0 {
            return bad(format!(
                "block_size {} must be a non-zero multiple of sector_size {}",
                self.block_size, self.sector_size
            ));
        }

        let width = self.hash_algorithm.width();
        let digest_bits = (width * 8) as u32;
        if self.hash_prefix_bits == 0 || self.hash_prefix_bits > digest_bits {
            return bad(format!(
                "hash_prefix_bits {} must be in 1..={} for {}",
                self.hash_prefix_bits, digest_bits, self.hash_algorithm
            ));
        }
        if self.hash_suffix_bytes as usize > width {
            return bad(format!(
                "hash_suffix_bytes {} exceeds the {}-byte {} digest",
                self.hash_suffix_bytes, width, self.hash_algorithm
            ));
        }
        if !(lookup_encoding::MIN_INDEX_BITS..=lookup_encoding::MAX_INDEX_BITS)
            .contains(&self.source_lookup_index_bits)
        {
            return Err(Error::OutOfRange {
                bits: self.source_lookup_index_bits,
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> String {
        // Plain struct of numbers and enums; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub fn write_settings(hashdb_dir: &Path, settings: &Settings) -> Result<()> {
    settings.validate()?;
    let path = hashdb_dir.join(SETTINGS_FILE);

    let contents = serde_json::to_string_pretty(settings)
        .map_err(|e| Error::Settings(format!("cannot encode settings: {e}")))?;

    let mut f = File::create(&path)
        .map_err(|e| Error::io(format!("Failed to create {}", path.display()), e))?;
    f.write_all(contents.as_bytes())
        .map_err(|e| Error::io(format!("Failed to write {}", path.display()), e))?;
    f.sync_all()
        .map_err(|e| Error::io(format!("Failed to sync {}", path.display()), e))?;
    Ok(())
}

/// Read and validate the settings of an existing database.
pub fn read_settings(hashdb_dir: &Path) -> Result<Settings> {
    let path = hashdb_dir.join(SETTINGS_FILE);
    let text = std::fs::read_to_string(&path).map_err(|e| {
        Error::Settings(format!("cannot read {}: {e}", path.display()))
    })?;
    let settings: Settings = serde_json::from_str(&text)
        .map_err(|e| Error::Settings(format!("invalid {}: {e}", path.display())))?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            hash_algorithm: HashAlgorithm::Sha256,
            map_type: MapType::Hash,
            sector_size: 4096,
            block_size: 4096,
            ..Settings::default()
        };
        write_settings(dir.path(), &settings).unwrap();
        assert_eq!(read_settings(dir.path()).unwrap(), settings);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_settings(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Settings(_)));
        assert!(err.to_string().contains("settings.json"));
    }

    #[test]
    fn rejects_bad_values() {
        let cases = [
            Settings { sector_size: 0, ..Settings::default() },
            Settings { block_size: 700, ..Settings::default() },
            Settings { hash_prefix_bits: 129, ..Settings::default() },
            Settings { hash_suffix_bytes: 17, ..Settings::default() },
            Settings { settings_version: 2, ..Settings::default() },
        ];
        for s in cases {
            assert!(matches!(s.validate(), Err(Error::Settings(_))), "{s:?}");
        }

        let s = Settings { source_lookup_index_bits: 41, ..Settings::default() };
        assert!(matches!(s.validate(), Err(Error::OutOfRange { bits: 41 })));
    }

    #[test]
    fn json_names_are_stable() {
        let json = Settings::default().to_json();
        assert!(json.contains("\"hash_algorithm\":\"md5\""));
        assert!(json.contains("\"map_type\":\"btree\""));
    }
}
