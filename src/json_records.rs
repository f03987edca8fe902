//! Hash and source records as single-line JSON objects.
//!
//! Parsing checks every field before anything is returned, so a caller that
//! applies the result only on `Ok` never half-imports a record.

use crate::digest::DigestKey;
use crate::error::{Error, Result};
use crate::records::SourceNames;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// A hash record as read from JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashJson<K> {
    pub block_hash: K,
    /// Only set when the record carries the field.
    pub non_probative_label: Option<String>,
    pub entropy: u64,
    pub block_label: String,
    pub source_offset_pairs: Vec<(K, u64)>,
}

/// A source record as read from JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceJson<K> {
    pub file_hash: K,
    pub filesize: u64,
    pub file_type: String,
    pub nonprobative_count: u64,
    pub name_pairs: Vec<(String, String)>,
}

fn invalid(msg: &str) -> Error {
    Error::invalid_record(msg)
}

fn parse_object(text: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(obj)) => Ok(obj),
        _ => Err(invalid("Invalid JSON syntax")),
    }
}

fn hex_field<K: DigestKey>(v: Option<&Value>, msg: &str) -> Result<K> {
    v.and_then(Value::as_str)
        .and_then(K::from_hex)
        .ok_or_else(|| invalid(msg))
}

fn optional_u64(obj: &Map<String, Value>, name: &str, msg: &str) -> Result<u64> {
    match obj.get(name) {
        None => Ok(0),
        Some(v) => v.as_u64().ok_or_else(|| invalid(msg)),
    }
}

fn optional_str(obj: &Map<String, Value>, name: &str, msg: &str) -> Result<Option<String>> {
    match obj.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| invalid(msg)),
    }
}

fn flat_pairs<'a>(obj: &'a Map<String, Value>, name: &str, msg: &str) -> Result<&'a [Value]> {
    match obj.get(name).and_then(Value::as_array) {
        Some(items) if items.len() % 2 == 0 => Ok(items),
        _ => Err(invalid(msg)),
    }
}

/// Parse `{"block_hash", "entropy"?, "block_label"?, "source_offset_pairs"}`.
/// Offsets must be multiples of `sector_size`.
pub fn parse_hash<K: DigestKey>(text: &str, sector_size: u64) -> Result<HashJson<K>> {
    let obj = parse_object(text)?;

    let block_hash = hex_field(obj.get("block_hash"), "Invalid block_hash field")?;
    let non_probative_label = optional_str(
        &obj,
        "non_probative_label",
        "Invalid non_probative_label field",
    )?;
    let entropy = optional_u64(&obj, "entropy", "Invalid entropy field")?;
    let block_label =
        optional_str(&obj, "block_label", "Invalid block_label field")?.unwrap_or_default();

    let items = flat_pairs(&obj, "source_offset_pairs", "Invalid source_offset_pairs field")?;
    let mut source_offset_pairs = Vec::with_capacity(items.len() / 2);
    for pair in items.chunks_exact(2) {
        let file_hash = hex_field(Some(&pair[0]), "Invalid source hash in source_offset_pair")?;
        let offset = pair[1]
            .as_u64()
            .filter(|off| off % sector_size == 0)
            .ok_or_else(|| invalid("Invalid file offset in source_offset_pair"))?;
        source_offset_pairs.push((file_hash, offset));
    }

    Ok(HashJson {
        block_hash,
        non_probative_label,
        entropy,
        block_label,
        source_offset_pairs,
    })
}

/// Parse `{"file_hash", "filesize", "file_type"?, "nonprobative_count"?,
/// "name_pairs"}`.
pub fn parse_source<K: DigestKey>(text: &str) -> Result<SourceJson<K>> {
    let obj = parse_object(text)?;

    let file_hash = hex_field(obj.get("file_hash"), "Invalid file_hash field")?;
    let filesize = obj
        .get("filesize")
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid("Invalid filesize field"))?;
    let file_type = optional_str(&obj, "file_type", "Invalid file_type field")?.unwrap_or_default();
    let nonprobative_count =
        optional_u64(&obj, "nonprobative_count", "Invalid nonprobative_count field")?;

    let items = flat_pairs(&obj, "name_pairs", "Invalid name_pairs field")?;
    let mut name_pairs = Vec::with_capacity(items.len() / 2);
    for pair in items.chunks_exact(2) {
        let repository_name = pair[0]
            .as_str()
            .ok_or_else(|| invalid("Invalid repository name in name_pairs field"))?;
        let filename = pair[1]
            .as_str()
            .ok_or_else(|| invalid("Invalid filename in name_pairs field"))?;
        name_pairs.push((repository_name.to_string(), filename.to_string()));
    }

    Ok(SourceJson {
        file_hash,
        filesize,
        file_type,
        nonprobative_count,
        name_pairs,
    })
}

/// One element of a flat `[hash, offset, hash, offset, ...]` array.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum PairItem {
    Hash(String),
    Offset(u64),
}

fn flatten_pairs<K: DigestKey>(pairs: &BTreeSet<(K, u64)>) -> Vec<PairItem> {
    let mut out = Vec::with_capacity(pairs.len() * 2);
    for (file_hash, offset) in pairs {
        out.push(PairItem::Hash(file_hash.to_hex()));
        out.push(PairItem::Offset(*offset));
    }
    out
}

#[derive(Debug, Serialize)]
pub(crate) struct SourceOut<'a> {
    file_hash: String,
    filesize: u64,
    file_type: &'a str,
    nonprobative_count: u64,
    name_pairs: Vec<&'a str>,
}

impl<'a> SourceOut<'a> {
    pub fn new<K: DigestKey>(
        file_hash: &K,
        filesize: u64,
        file_type: &'a str,
        nonprobative_count: u64,
        names: &'a SourceNames,
    ) -> Self {
        Self {
            file_hash: file_hash.to_hex(),
            filesize,
            file_type,
            nonprobative_count,
            name_pairs: names
                .iter()
                .flat_map(|(repo, file)| [repo.as_str(), file.as_str()])
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HashOut<'a> {
    block_hash: String,
    #[serde(skip_serializing_if = "str::is_empty")]
    non_probative_label: &'a str,
    entropy: u64,
    block_label: &'a str,
    source_offset_pairs: Vec<PairItem>,
}

#[derive(Debug, Serialize)]
struct ExpandedOut<'a> {
    block_hash: String,
    entropy: u64,
    block_label: &'a str,
    source_list_id: u32,
    sources: Vec<SourceOut<'a>>,
    source_offset_pairs: Vec<PairItem>,
}

fn to_line<T: Serialize>(value: &T) -> String {
    // plain structs of strings and integers always serialize
    serde_json::to_string(value).unwrap_or_default()
}

pub fn hash_to_json<K: DigestKey>(
    block_hash: &K,
    non_probative_label: &str,
    entropy: u64,
    block_label: &str,
    pairs: &BTreeSet<(K, u64)>,
) -> String {
    to_line(&HashOut {
        block_hash: block_hash.to_hex(),
        non_probative_label,
        entropy,
        block_label,
        source_offset_pairs: flatten_pairs(pairs),
    })
}

pub(crate) fn source_to_json(source: &SourceOut<'_>) -> String {
    to_line(source)
}

pub(crate) fn expanded_to_json<K: DigestKey>(
    block_hash: &K,
    entropy: u64,
    block_label: &str,
    pairs: &BTreeSet<(K, u64)>,
    sources: Vec<SourceOut<'_>>,
) -> String {
    to_line(&ExpandedOut {
        block_hash: block_hash.to_hex(),
        entropy,
        block_label,
        source_list_id: source_list_id(pairs),
        sources,
        source_offset_pairs: flatten_pairs(pairs),
    })
}

/// CRC-32 over the distinct source digests of `pairs`, in sorted order.
/// Equal ids mean (almost certainly) the same set of sources.
pub fn source_list_id<K: DigestKey>(pairs: &BTreeSet<(K, u64)>) -> u32 {
    let sources: BTreeSet<&K> = pairs.iter().map(|(k, _)| k).collect();
    let mut crc = crc32fast::Hasher::new();
    for source in sources {
        crc.update(source.as_bytes());
    }
    crc.finalize()
}
