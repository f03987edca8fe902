//! Whole-database import and export as JSON lines: source records first,
//! then hash records.

use crate::digest::DigestKey;
use crate::error::{Error, Result};
use crate::import::ImportSession;
use crate::scan::ScanSession;
use std::io::{BufRead, Write};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub hashes: u64,
    pub sources: u64,
    /// Invalid lines, logged and skipped.
    pub skipped: u64,
}

/// Import every line of `input`. A line holding `file_hash` is a source
/// record, anything else is treated as a hash record. Invalid lines are
/// reported with their line number and skipped.
pub fn import_json_lines<K: DigestKey, R: BufRead>(
    session: &ImportSession<K>,
    input: R,
) -> Result<ImportStats> {
    let mut stats = ImportStats::default();

    for (n, line) in input.lines().enumerate() {
        let line = line.map_err(|e| Error::io("Failed to read JSON input", e))?;
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }

        let is_source = text.contains("\"file_hash\"");
        let result = if is_source {
            session.insert_source_json(text)
        } else {
            session.insert_hash_json(text)
        };

        match result {
            Ok(()) if is_source => stats.sources += 1,
            Ok(()) => stats.hashes += 1,
            Err(Error::InvalidRecord(reason)) => {
                tracing::warn!(line = n + 1, %reason, "skipping invalid record");
                stats.skipped += 1;
            }
            Err(e) => return Err(e),
        }

        let done = stats.hashes + stats.sources;
        if done > 0 && done % 10_000 == 0 {
            tracing::info!(records = done, "import progress");
        }
    }

    tracing::info!(
        hashes = stats.hashes,
        sources = stats.sources,
        skipped = stats.skipped,
        "import finished"
    );
    Ok(stats)
}

/// Write every source record then every hash record. Returns the number of
/// lines written.
pub fn export_json_lines<K: DigestKey, W: Write>(
    session: &ScanSession<K>,
    mut out: W,
) -> Result<u64> {
    let write_err = |e: std::io::Error| Error::io("Failed to write JSON output", e);
    let mut lines = 0u64;

    for file_hash in session.sources() {
        let file_hash = file_hash?;
        if let Some(json) = session.find_source_json(&file_hash)? {
            writeln!(out, "{json}").map_err(write_err)?;
            lines += 1;
        }
    }

    for block_hash in session.hashes() {
        let block_hash = block_hash?;
        if let Some(json) = session.find_hash_json(&block_hash)? {
            writeln!(out, "{json}").map_err(write_err)?;
            lines += 1;
        }
    }

    out.flush().map_err(write_err)?;
    tracing::info!(lines, "export finished");
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Md5Digest;
    use crate::hashdb::create_hashdb;
    use crate::settings::Settings;

    fn d(byte: u8) -> Md5Digest {
        Md5Digest([byte; 16])
    }

    #[test]
    fn export_then_import_reproduces_the_database() {
        let tmp = tempfile::tempdir().unwrap();
        let (first, second) = (tmp.path().join("first"), tmp.path().join("second"));
        create_hashdb(&first, &Settings::default(), "create").unwrap();
        create_hashdb(&second, &Settings::default(), "create").unwrap();

        let session = ImportSession::<Md5Digest>::open(&first, "import").unwrap();
        session.insert_source_name(&d(0xf1), "repoA", "file1").unwrap();
        session.insert_source_data(&d(0xf1), 1000, "exe", 2).unwrap();
        session.insert_hash(&d(1), &d(0xf1), 512, 8, "W").unwrap();
        session.insert_hash(&d(1), &d(0xf2), 0, 8, "W").unwrap();
        session.insert_hash_data(&d(2), "zeros", 0, "").unwrap();
        session.insert_hash_source(&d(2), &d(0xf2), 1024).unwrap();
        session.close().unwrap();

        let mut exported = Vec::new();
        {
            let scan = ScanSession::<Md5Digest>::open(&first).unwrap();
            let lines = export_json_lines(&scan, &mut exported).unwrap();
            assert_eq!(lines, 4);
        }

        let with_noise = format!("# exported\n{}{{broken\n", String::from_utf8(exported.clone()).unwrap());
        let session = ImportSession::<Md5Digest>::open(&second, "import").unwrap();
        let stats = import_json_lines(&session, with_noise.as_bytes()).unwrap();
        assert_eq!(
            stats,
            ImportStats {
                hashes: 2,
                sources: 2,
                skipped: 1
            }
        );
        session.close().unwrap();

        let mut again = Vec::new();
        let scan = ScanSession::<Md5Digest>::open(&second).unwrap();
        export_json_lines(&scan, &mut again).unwrap();
        assert_eq!(String::from_utf8(again).unwrap(), String::from_utf8(exported).unwrap());
    }
}
