//! Append-only record of every command that changed a database, one JSON
//! object per line.

use crate::changes::ChangeCounts;
use crate::dbpath::LOG_FILE;
use crate::error::{Error, Result};
use crate::hashdb::Sizes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct LogEntry<'a> {
    pub command: &'a str,
    pub started: String,
    pub finished: String,
    pub changes: &'a ChangeCounts,
    pub sizes: &'a Sizes,
}

pub fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn append(
    hashdb_dir: &Path,
    command: &str,
    started: DateTime<Utc>,
    changes: &ChangeCounts,
    sizes: &Sizes,
) -> Result<()> {
    let entry = LogEntry {
        command,
        started: timestamp(started),
        finished: timestamp(Utc::now()),
        changes,
        sizes,
    };
    let mut line = serde_json::to_string(&entry)
        .map_err(|e| Error::invalid_record(format!("cannot encode log entry: {e}")))?;
    line.push('\n');

    let path = hashdb_dir.join(LOG_FILE);
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| Error::io(format!("Failed to open {}", path.display()), e))?;
    f.write_all(line.as_bytes())
        .map_err(|e| Error::io(format!("Failed to append to {}", path.display()), e))?;

    tracing::debug!(command, "session logged");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_line_per_call() {
        let tmp = tempfile::tempdir().unwrap();
        let counts = ChangeCounts {
            hash_inserted: 4,
            ..ChangeCounts::default()
        };
        let sizes = Sizes::default();

        append(tmp.path(), "create db", Utc::now(), &ChangeCounts::default(), &sizes).unwrap();
        append(tmp.path(), "import db in.json", Utc::now(), &counts, &sizes).unwrap();

        let text = std::fs::read_to_string(tmp.path().join(LOG_FILE)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["command"], "import db in.json");
        assert_eq!(v["changes"]["hash_inserted"], 4);
        assert_eq!(v["sizes"]["hash_data_store"], 0);
        assert!(v["started"].as_str().unwrap().ends_with('Z'));
    }
}
