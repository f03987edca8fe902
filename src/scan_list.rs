//! Scan a list of block hashes against a database with a pool of lookup
//! workers and one writer.

use crate::digest::DigestKey;
use crate::error::{Error, Result};
use crate::scan::{ExpandedMatch, ScanSession};
use crossbeam_channel as chan;
use std::io::{BufRead, Write};
use std::thread;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanListStats {
    pub scanned: u64,
    pub matched: u64,
    /// Lines that were not a hash of the database's digest type.
    pub invalid: u64,
}

type Found<K> = Result<Option<(K, String)>>;

/// Read one hex block hash per line from `input` and write
/// `<hex>\t<json>` to `out` for every match. Blank lines and lines starting
/// with `#` are ignored. Output order follows completion, not input order.
pub fn scan_hash_list<K, R, W>(
    session: &ScanSession<K>,
    input: R,
    out: W,
    threads: usize,
) -> Result<ScanListStats>
where
    K: DigestKey,
    R: BufRead,
    W: Write + Send,
{
    let threads = threads.max(1);

    thread::scope(|s| -> Result<ScanListStats> {
        let (job_tx, job_rx) = chan::bounded::<K>(threads * 256);
        let (res_tx, res_rx) = chan::bounded::<Found<K>>(threads * 256);

        let writer = s.spawn(move || writer_loop(out, res_rx));

        for _ in 0..threads {
            let rx = job_rx.clone();
            let tx = res_tx.clone();
            s.spawn(move || worker_loop(session, rx, tx));
        }
        // Only the workers hold senders now; the writer ends when they do.
        drop(res_tx);
        drop(job_rx);

        let mut stats = ScanListStats::default();
        for (n, line) in input.lines().enumerate() {
            let line = line.map_err(|e| Error::io("Failed to read hash list", e))?;
            let text = line.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let Some(block_hash) = K::from_hex(text) else {
                tracing::warn!(line = n + 1, text, "not a {} hash, skipped", K::ALGORITHM);
                stats.invalid += 1;
                continue;
            };
            stats.scanned += 1;
            if job_tx.send(block_hash).is_err() {
                // writer gave up; its error is reported below
                break;
            }
        }
        drop(job_tx);

        stats.matched = writer
            .join()
            .unwrap_or_else(|e| std::panic::resume_unwind(e))?;
        tracing::info!(
            scanned = stats.scanned,
            matched = stats.matched,
            invalid = stats.invalid,
            "scan finished"
        );
        Ok(stats)
    })
}

fn worker_loop<K: DigestKey>(
    session: &ScanSession<K>,
    rx: chan::Receiver<K>,
    tx: chan::Sender<Found<K>>,
) {
    while let Ok(block_hash) = rx.recv() {
        let found = session.find_expanded_hash(&block_hash).map(|m| match m {
            ExpandedMatch::NotFound => None,
            ExpandedMatch::AlreadyReported => Some((
                block_hash,
                format!(r#"{{"block_hash":"{}"}}"#, block_hash.to_hex()),
            )),
            ExpandedMatch::Match(json) => Some((block_hash, json)),
        });
        if tx.send(found).is_err() {
            break;
        }
    }
}

fn writer_loop<K: DigestKey, W: Write>(mut out: W, rx: chan::Receiver<Found<K>>) -> Result<u64> {
    let mut matched: u64 = 0;

    while let Ok(found) = rx.recv() {
        let Some((block_hash, json)) = found? else {
            continue;
        };
        writeln!(out, "{}\t{}", block_hash.to_hex(), json)
            .map_err(|e| Error::io("Failed to write scan output", e))?;

        matched += 1;
        if matched % 10_000 == 0 {
            tracing::info!(matched, "scan progress");
        }
    }

    out.flush()
        .map_err(|e| Error::io("Failed to write scan output", e))?;
    Ok(matched)
}
