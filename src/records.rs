use crate::codec::{self, Reader};
use crate::digest::DigestKey;
use std::collections::BTreeSet;

/// (source id, file offset) pairs, ordered by source id then offset.
pub type IdOffsetPairs = BTreeSet<(u64, u64)>;

/// (repository name, filename) pairs.
pub type SourceNames = BTreeSet<(String, String)>;

/// Everything recorded for one block hash.
///
/// Encoding details are hidden behind encode()/decode().
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashRecord {
    /// Empty means probative.
    pub non_probative_label: String,
    pub entropy: u64,
    pub block_label: String,
    pub pairs: IdOffsetPairs,
}

impl HashRecord {
    pub fn new(non_probative_label: &str, entropy: u64, block_label: &str) -> Self {
        Self {
            non_probative_label: non_probative_label.to_string(),
            entropy,
            block_label: block_label.to_string(),
            pairs: IdOffsetPairs::new(),
        }
    }

    /// Layout:
    /// label (u32 len + bytes), entropy u64, block label (u32 len + bytes),
    /// then per pair: source id u64, offset / sector_size u64. All LE.
    ///
    /// Panics if an offset is not a multiple of `sector_size`.
    pub fn encode(&self, sector_size: u64) -> Vec<u8> {
        let len = codec::str_len(&self.non_probative_label)
            + codec::U64_LEN
            + codec::str_len(&self.block_label)
            + self.pairs.len() * 2 * codec::U64_LEN;
        let mut out = Vec::with_capacity(len);

        codec::put_str(&mut out, &self.non_probative_label);
        codec::put_u64(&mut out, self.entropy);
        codec::put_str(&mut out, &self.block_label);
        for &(source_id, offset) in &self.pairs {
            assert_aligned(offset, sector_size);
            codec::put_u64(&mut out, source_id);
            codec::put_u64(&mut out, offset / sector_size);
        }

        debug_assert_eq!(out.len(), len);
        out
    }

    pub fn decode(bytes: &[u8], sector_size: u64) -> Self {
        let mut r = Reader::new("hash data", bytes);
        let non_probative_label = r.string();
        let entropy = r.u64();
        let block_label = r.string();

        let mut pairs = IdOffsetPairs::new();
        while !r.is_at_end() {
            let source_id = r.u64();
            let offset_index = r.u64();
            let Some(offset) = offset_index.checked_mul(sector_size) else {
                panic!("corrupt hash data record: offset index {offset_index} overflows");
            };
            pairs.insert((source_id, offset));
        }
        r.finish();

        Self {
            non_probative_label,
            entropy,
            block_label,
            pairs,
        }
    }
}

/// Offsets are stored in units of the sector size; anything else is a bug in
/// the caller.
pub fn assert_aligned(offset: u64, sector_size: u64) {
    if offset % sector_size != 0 {
        panic!("invalid file offset {offset}: not a multiple of sector size {sector_size}");
    }
}

/// Metadata for one source file, keyed by source id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceData<K> {
    /// Digest the source id was minted for.
    pub file_hash: K,
    pub filesize: u64,
    pub file_type: String,
    pub nonprobative_count: u64,
}

impl<K: DigestKey> SourceData<K> {
    /// Zero-valued record written when a source id is first referenced.
    pub fn placeholder(file_hash: K) -> Self {
        Self {
            file_hash,
            filesize: 0,
            file_type: String::new(),
            nonprobative_count: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let hash = self.file_hash.as_bytes();
        let mut out = Vec::with_capacity(
            codec::bytes_len(hash) + 2 * codec::U64_LEN + codec::str_len(&self.file_type),
        );
        codec::put_bytes(&mut out, hash);
        codec::put_u64(&mut out, self.filesize);
        codec::put_str(&mut out, &self.file_type);
        codec::put_u64(&mut out, self.nonprobative_count);
        out
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut r = Reader::new("source data", bytes);
        let raw_hash = r.bytes();
        let Some(file_hash) = K::from_slice(raw_hash) else {
            panic!(
                "corrupt source data record: file hash is {} bytes, expected {}",
                raw_hash.len(),
                K::WIDTH
            );
        };
        let filesize = r.u64();
        let file_type = r.string();
        let nonprobative_count = r.u64();
        r.finish();

        Self {
            file_hash,
            filesize,
            file_type,
            nonprobative_count,
        }
    }
}

pub fn encode_names(names: &SourceNames) -> Vec<u8> {
    let len = names
        .iter()
        .map(|(repo, file)| codec::str_len(repo) + codec::str_len(file))
        .sum();
    let mut out = Vec::with_capacity(len);
    for (repository_name, filename) in names {
        codec::put_str(&mut out, repository_name);
        codec::put_str(&mut out, filename);
    }
    out
}

pub fn decode_names(bytes: &[u8]) -> SourceNames {
    let mut r = Reader::new("source name", bytes);
    let mut names = SourceNames::new();
    while !r.is_at_end() {
        let repository_name = r.string();
        let filename = r.string();
        names.insert((repository_name, filename));
    }
    r.finish();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Sha1Digest;

    #[test]
    fn hash_record_round_trip() {
        let mut rec = HashRecord::new("zero block", 8, "W");
        rec.pairs.insert((1, 0));
        rec.pairs.insert((1, 4096));
        rec.pairs.insert((7, 512));

        let bytes = rec.encode(512);
        assert_eq!(HashRecord::decode(&bytes, 512), rec);
    }

    #[test]
    fn empty_fields_round_trip() {
        let rec = HashRecord::default();
        let bytes = rec.encode(4096);
        // two empty strings and the entropy
        assert_eq!(bytes.len(), 4 + 8 + 4);
        assert_eq!(HashRecord::decode(&bytes, 4096), rec);
    }

    #[test]
    fn offsets_are_stored_in_sectors() {
        let mut rec = HashRecord::default();
        rec.pairs.insert((3, 8192));
        let bytes = rec.encode(4096);
        let tail = &bytes[bytes.len() - 8..];
        assert_eq!(u64::from_le_bytes(tail.try_into().unwrap()), 2);
    }

    #[test]
    #[should_panic(expected = "not a multiple of sector size")]
    fn misaligned_offset_is_fatal() {
        let mut rec = HashRecord::default();
        rec.pairs.insert((1, 100));
        rec.encode(512);
    }

    #[test]
    #[should_panic(expected = "corrupt hash data record")]
    fn half_a_pair_is_fatal() {
        let mut bytes = HashRecord::default().encode(512);
        bytes.extend_from_slice(&1u64.to_le_bytes());
        HashRecord::decode(&bytes, 512);
    }

    #[test]
    fn source_data_round_trip() {
        let data = SourceData {
            file_hash: Sha1Digest([9; 20]),
            filesize: 800,
            file_type: "exe".to_string(),
            nonprobative_count: 2,
        };
        assert_eq!(SourceData::<Sha1Digest>::decode(&data.encode()), data);

        let blank = SourceData::placeholder(Sha1Digest([1; 20]));
        assert_eq!(SourceData::<Sha1Digest>::decode(&blank.encode()), blank);
    }

    #[test]
    #[should_panic(expected = "expected 20")]
    fn source_data_with_wrong_digest_width_is_fatal() {
        let mut bytes = Vec::new();
        codec::put_bytes(&mut bytes, &[1, 2, 3]);
        codec::put_u64(&mut bytes, 0);
        codec::put_str(&mut bytes, "");
        codec::put_u64(&mut bytes, 0);
        SourceData::<Sha1Digest>::decode(&bytes);
    }

    #[test]
    fn names_round_trip() {
        let mut names = SourceNames::new();
        names.insert(("repoA".to_string(), "file1".to_string()));
        names.insert(("repoB".to_string(), "".to_string()));
        assert_eq!(decode_names(&encode_names(&names)), names);
        assert!(decode_names(&[]).is_empty());
    }
}
