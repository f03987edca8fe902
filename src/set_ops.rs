//! Combine databases hash by hash.
//!
//! Every operation reads its inputs through scan sessions and writes one
//! import session. A copied hash brings along the source data and names of
//! each file it refers to, copied once per source per input. Placeholder
//! source data never overwrites real data already in the destination.

use crate::digest::DigestKey;
use crate::error::{Error, Result};
use crate::import::ImportSession;
use crate::records::SourceData;
use crate::scan::{HashMatch, ScanSession};
use std::collections::{BTreeSet, HashSet};

const PROGRESS_EVERY: u64 = 100_000;

/// Which input database a source was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Input {
    A,
    B,
}

struct Copier<'a, K: DigestKey> {
    dest: &'a ImportSession<K>,
    /// (input, file hash) pairs whose metadata is in the destination.
    copied_sources: HashSet<(Input, K)>,
    visited: u64,
    copied: u64,
}

impl<'a, K: DigestKey> Copier<'a, K> {
    fn new(dest: &'a ImportSession<K>) -> Self {
        Self {
            dest,
            copied_sources: HashSet::new(),
            visited: 0,
            copied: 0,
        }
    }

    fn check_sector_size(&self, from: &ScanSession<K>) -> Result<()> {
        let have = from.settings().sector_size;
        let want = self.dest.settings().sector_size;
        if have % want != 0 {
            return Err(Error::Settings(format!(
                "sector size {have} of the input is not a multiple of destination sector size {want}"
            )));
        }
        Ok(())
    }

    fn tick(&mut self, op: &str) {
        self.visited += 1;
        if self.visited % PROGRESS_EVERY == 0 {
            tracing::info!(op, visited = self.visited, copied = self.copied, "progress");
        }
    }

    /// Copy the record with all of its pairs.
    fn copy_hash(
        &mut self,
        from: &ScanSession<K>,
        input: Input,
        block_hash: &K,
        m: &HashMatch<K>,
    ) -> Result<()> {
        self.dest.insert_hash_data(
            block_hash,
            &m.non_probative_label,
            m.entropy,
            &m.block_label,
        )?;
        self.copy_pairs(from, input, block_hash, &m.source_offset_pairs)?;
        self.copied += 1;
        Ok(())
    }

    /// Add pairs to a record already present in the destination.
    fn copy_pairs(
        &mut self,
        from: &ScanSession<K>,
        input: Input,
        block_hash: &K,
        pairs: &BTreeSet<(K, u64)>,
    ) -> Result<()> {
        for (file_hash, offset) in pairs {
            self.copy_source(from, input, file_hash)?;
            self.dest.insert_hash_source(block_hash, file_hash, *offset)?;
        }
        Ok(())
    }

    fn copy_source(&mut self, from: &ScanSession<K>, input: Input, file_hash: &K) -> Result<()> {
        if !self.copied_sources.insert((input, *file_hash)) {
            return Ok(());
        }
        let data = from
            .find_source_data(file_hash)?
            .filter(|data| *data != SourceData::placeholder(*file_hash));
        if let Some(data) = data {
            self.dest.insert_source_data(
                file_hash,
                data.filesize,
                &data.file_type,
                data.nonprobative_count,
            )?;
        }
        for (repository_name, filename) in from.find_source_names(file_hash)? {
            self.dest
                .insert_source_name(file_hash, &repository_name, &filename)?;
        }
        Ok(())
    }

    fn finish(self, op: &str) -> u64 {
        tracing::info!(
            op,
            visited = self.visited,
            copied = self.copied,
            sources = self.copied_sources.len(),
            "done"
        );
        self.copied
    }
}

/// Copy every hash of `a` into `dest`. Returns the number of hashes copied.
pub fn add<K: DigestKey>(a: &ScanSession<K>, dest: &ImportSession<K>) -> Result<u64> {
    let mut copier = Copier::new(dest);
    copier.check_sector_size(a)?;
    copy_all(&mut copier, a, Input::A, "add")?;
    Ok(copier.finish("add"))
}

/// Copy every hash of `a` and of `b` into `dest`.
pub fn add_multiple<K: DigestKey>(
    a: &ScanSession<K>,
    b: &ScanSession<K>,
    dest: &ImportSession<K>,
) -> Result<u64> {
    let mut copier = Copier::new(dest);
    copier.check_sector_size(a)?;
    copier.check_sector_size(b)?;
    copy_all(&mut copier, a, Input::A, "add_multiple")?;
    copy_all(&mut copier, b, Input::B, "add_multiple")?;
    Ok(copier.finish("add_multiple"))
}

fn copy_all<K: DigestKey>(
    copier: &mut Copier<'_, K>,
    from: &ScanSession<K>,
    input: Input,
    op: &str,
) -> Result<()> {
    for block_hash in from.hashes() {
        let block_hash = block_hash?;
        copier.tick(op);
        if let Some(m) = from.find_hash(&block_hash)? {
            copier.copy_hash(from, input, &block_hash, &m)?;
        }
    }
    Ok(())
}

/// Hashes found in both `a` and `b`, with the pairs of both.
pub fn intersect<K: DigestKey>(
    a: &ScanSession<K>,
    b: &ScanSession<K>,
    dest: &ImportSession<K>,
) -> Result<u64> {
    let mut copier = Copier::new(dest);
    copier.check_sector_size(a)?;
    copier.check_sector_size(b)?;

    for block_hash in a.hashes() {
        let block_hash = block_hash?;
        copier.tick("intersect");
        let Some(in_b) = b.find_hash(&block_hash)? else {
            continue;
        };
        if let Some(in_a) = a.find_hash(&block_hash)? {
            copier.copy_hash(a, Input::A, &block_hash, &in_a)?;
            copier.copy_pairs(b, Input::B, &block_hash, &in_b.source_offset_pairs)?;
        }
    }
    Ok(copier.finish("intersect"))
}

/// Hashes of `a` that `b` does not have.
pub fn subtract<K: DigestKey>(
    a: &ScanSession<K>,
    b: &ScanSession<K>,
    dest: &ImportSession<K>,
) -> Result<u64> {
    let mut copier = Copier::new(dest);
    copier.check_sector_size(a)?;

    for block_hash in a.hashes() {
        let block_hash = block_hash?;
        copier.tick("subtract");
        if b.find_hash_count(&block_hash)? != 0 {
            continue;
        }
        if let Some(m) = a.find_hash(&block_hash)? {
            copier.copy_hash(a, Input::A, &block_hash, &m)?;
        }
    }
    Ok(copier.finish("subtract"))
}

/// Hashes of `a` seen exactly once.
pub fn deduplicate<K: DigestKey>(a: &ScanSession<K>, dest: &ImportSession<K>) -> Result<u64> {
    let mut copier = Copier::new(dest);
    copier.check_sector_size(a)?;

    for block_hash in a.hashes() {
        let block_hash = block_hash?;
        copier.tick("deduplicate");
        match a.find_hash(&block_hash)? {
            Some(m) if m.source_offset_pairs.len() == 1 => {
                copier.copy_hash(a, Input::A, &block_hash, &m)?;
            }
            _ => {}
        }
    }
    Ok(copier.finish("deduplicate"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Md5Digest;
    use crate::hashdb::create_hashdb;
    use crate::settings::Settings;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn d(byte: u8) -> Md5Digest {
        Md5Digest([byte; 16])
    }

    /// Database holding (block, file, offset) triples; every file is named
    /// `repo/<file byte>`.
    fn build(tmp: &TempDir, name: &str, triples: &[(u8, u8, u64)]) -> PathBuf {
        let dir = tmp.path().join(name);
        create_hashdb(&dir, &Settings::default(), "create").unwrap();
        let session = ImportSession::<Md5Digest>::open(&dir, "build").unwrap();
        for &(block, file, offset) in triples {
            session
                .insert_source_name(&d(file), "repo", &file.to_string())
                .unwrap();
            session.insert_hash(&d(block), &d(file), offset, 1, "").unwrap();
        }
        session.close().unwrap();
        dir
    }

    fn run(
        tmp: &TempDir,
        op: impl FnOnce(&ScanSession<Md5Digest>, &ScanSession<Md5Digest>, &ImportSession<Md5Digest>) -> Result<u64>,
    ) -> (u64, ScanSession<Md5Digest>) {
        let a = build(tmp, "a", &[(1, 0xf1, 0), (2, 0xf1, 512), (2, 0xf2, 0)]);
        let b = build(tmp, "b", &[(2, 0xf3, 0), (3, 0xf3, 512)]);
        let dest = tmp.path().join("dest");
        create_hashdb(&dest, &Settings::default(), "create").unwrap();

        let a = ScanSession::open(&a).unwrap();
        let b = ScanSession::open(&b).unwrap();
        let out = ImportSession::open(&dest, "op").unwrap();
        let copied = op(&a, &b, &out).unwrap();
        out.close().unwrap();
        (copied, ScanSession::open(&dest).unwrap())
    }

    fn hashes(s: &ScanSession<Md5Digest>) -> Vec<Md5Digest> {
        s.hashes().collect::<Result<_>>().unwrap()
    }

    #[test]
    fn add_copies_hashes_and_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let (copied, dest) = run(&tmp, |a, _, out| add(a, out));
        assert_eq!(copied, 2);
        assert_eq!(hashes(&dest), vec![d(1), d(2)]);
        assert_eq!(dest.find_hash_count(&d(2)).unwrap(), 2);

        let names = dest.find_source_names(&d(0xf1)).unwrap();
        assert!(names.contains(&("repo".to_string(), "241".to_string())));
        assert_eq!(dest.size_sources().unwrap(), 2);
    }

    #[test]
    fn add_multiple_merges_pairs() {
        let tmp = tempfile::tempdir().unwrap();
        let (copied, dest) = run(&tmp, |a, b, out| add_multiple(a, b, out));
        assert_eq!(copied, 4);
        assert_eq!(hashes(&dest), vec![d(1), d(2), d(3)]);
        assert_eq!(dest.find_hash_count(&d(2)).unwrap(), 3);
    }

    #[test]
    fn intersect_keeps_common_hashes() {
        let tmp = tempfile::tempdir().unwrap();
        let (copied, dest) = run(&tmp, |a, b, out| intersect(a, b, out));
        assert_eq!(copied, 1);
        assert_eq!(hashes(&dest), vec![d(2)]);
        assert_eq!(dest.find_hash_count(&d(2)).unwrap(), 3);
    }

    #[test]
    fn subtract_drops_hashes_of_b() {
        let tmp = tempfile::tempdir().unwrap();
        let (copied, dest) = run(&tmp, |a, b, out| subtract(a, b, out));
        assert_eq!(copied, 1);
        assert_eq!(hashes(&dest), vec![d(1)]);
        // only sources of copied hashes come along
        assert_eq!(dest.size_sources().unwrap(), 1);
    }

    #[test]
    fn deduplicate_keeps_single_pair_hashes() {
        let tmp = tempfile::tempdir().unwrap();
        let (copied, dest) = run(&tmp, |a, _, out| deduplicate(a, out));
        assert_eq!(copied, 1);
        assert_eq!(hashes(&dest), vec![d(1)]);
    }

    fn with_sector_size(path: &Path, sector_size: u64) {
        let settings = Settings {
            sector_size,
            block_size: sector_size,
            ..Settings::default()
        };
        create_hashdb(path, &settings, "create").unwrap();
    }

    #[test]
    fn finer_input_sectors_are_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let (a, dest) = (tmp.path().join("a"), tmp.path().join("dest"));
        with_sector_size(&a, 512);
        with_sector_size(&dest, 4096);

        let a = ScanSession::<Md5Digest>::open(&a).unwrap();
        let out = ImportSession::<Md5Digest>::open(&dest, "add").unwrap();
        assert!(matches!(add(&a, &out), Err(Error::Settings(_))));
    }

    /// File 0xf1 in one block, named under `repo`, with `filesize` (0 keeps
    /// the placeholder).
    fn with_named_source(tmp: &TempDir, name: &str, repo: &str, block: u8, filesize: u64) -> PathBuf {
        let dir = tmp.path().join(name);
        create_hashdb(&dir, &Settings::default(), "create").unwrap();
        let session = ImportSession::<Md5Digest>::open(&dir, "build").unwrap();
        session.insert_source_name(&d(0xf1), repo, "file1").unwrap();
        if filesize != 0 {
            session.insert_source_data(&d(0xf1), filesize, "exe", 0).unwrap();
        }
        session.insert_hash(&d(block), &d(0xf1), 512, 0, "").unwrap();
        session.close().unwrap();
        dir
    }

    fn merge_into(tmp: &TempDir, dest: &str, first: &Path, second: &Path) -> ScanSession<Md5Digest> {
        let dest = tmp.path().join(dest);
        create_hashdb(&dest, &Settings::default(), "create").unwrap();
        {
            let first = ScanSession::<Md5Digest>::open(first).unwrap();
            let second = ScanSession::<Md5Digest>::open(second).unwrap();
            let out = ImportSession::open(&dest, "add_multiple").unwrap();
            add_multiple(&first, &second, &out).unwrap();
            out.close().unwrap();
        }
        ScanSession::open(&dest).unwrap()
    }

    #[test]
    fn shared_source_keeps_metadata_of_both_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let a = with_named_source(&tmp, "a", "repoA", 1, 0);
        let b = with_named_source(&tmp, "b", "repoB", 2, 9999);

        let expected: Vec<(String, String)> = vec![
            ("repoA".into(), "file1".into()),
            ("repoB".into(), "file1".into()),
        ];
        for (dest, first, second) in [("ab", &a, &b), ("ba", &b, &a)] {
            let out = merge_into(&tmp, dest, first, second);
            let names: Vec<_> = out.find_source_names(&d(0xf1)).unwrap().into_iter().collect();
            assert_eq!(names, expected, "{dest}");
            let data = out.find_source_data(&d(0xf1)).unwrap().unwrap();
            assert_eq!((data.filesize, data.file_type.as_str()), (9999, "exe"), "{dest}");
        }
    }

    #[test]
    fn same_database_twice() {
        let tmp = tempfile::tempdir().unwrap();
        let a = build(&tmp, "a", &[(1, 0xf1, 0), (2, 0xf2, 512)]);
        let dest = tmp.path().join("dest");
        create_hashdb(&dest, &Settings::default(), "create").unwrap();

        let first = ScanSession::<Md5Digest>::open(&a).unwrap();
        let second = ScanSession::<Md5Digest>::open(&a).unwrap();
        let out = ImportSession::open(&dest, "intersect").unwrap();
        assert_eq!(intersect(&first, &second, &out).unwrap(), 2);
        out.close().unwrap();

        let dest = ScanSession::<Md5Digest>::open(&dest).unwrap();
        assert_eq!(hashes(&dest), vec![d(1), d(2)]);
        assert_eq!(dest.find_hash_count(&d(1)).unwrap(), 1);
    }
}
