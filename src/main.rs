use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use hashdb::digest::{DigestKey, HashAlgorithm, Md5Digest, Sha1Digest, Sha256Digest};
use hashdb::settings::{self, Settings};
use hashdb::{ImportSession, MapType, ScanSession, json_lines, scan_list, set_ops};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

mod logging;

#[derive(Parser, Debug)]
#[command(name = "hashdb")]
#[command(version, about = "Block hash database: find where known blocks came from")]
struct Cli {
    /// Increase logging verbosity (use together with RUST_LOG for fine control).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new, empty database
    Create {
        /// Directory to create; must not exist
        db: PathBuf,

        #[arg(long, value_enum, default_value_t = HashAlgorithm::Md5)]
        algorithm: HashAlgorithm,

        /// In-memory index used for buffering and caching
        #[arg(long, value_enum, default_value_t = MapType::Btree)]
        map_type: MapType,

        /// File offsets must be multiples of this
        #[arg(long, default_value_t = 512)]
        sector_size: u64,

        #[arg(long, default_value_t = 512)]
        block_size: u64,

        /// Most (source, offset) pairs kept per hash; 0 for no limit
        #[arg(long, default_value_t = 100_000)]
        max_source_offset_pairs: u64,

        #[arg(long, default_value_t = 28)]
        hash_prefix_bits: u32,

        #[arg(long, default_value_t = 3)]
        hash_suffix_bytes: u32,

        #[arg(long, default_value_t = 32)]
        source_lookup_index_bits: u32,
    },

    /// Import JSON lines (source and hash records)
    Import {
        db: PathBuf,
        /// Input file, `-` for stdin
        input: PathBuf,
    },

    /// Export every source and hash record as JSON lines
    Export {
        db: PathBuf,
        /// Output file, stdout if omitted
        output: Option<PathBuf>,
    },

    /// Scan a list of hex block hashes, one per line
    Scan {
        db: PathBuf,
        /// Hash list, `-` for stdin
        input: PathBuf,

        /// Number of lookup threads (defaults to CPU count - 1, min 1)
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Look up one block hash
    ScanHash { db: PathBuf, hash: String },

    /// Show what is known about one source file hash
    ScanSource { db: PathBuf, hash: String },

    /// Copy all hashes of A into DEST
    Add { a: PathBuf, dest: PathBuf },

    /// Copy all hashes of A and B into DEST
    AddMultiple { a: PathBuf, b: PathBuf, dest: PathBuf },

    /// Copy hashes found in both A and B into DEST
    Intersect { a: PathBuf, b: PathBuf, dest: PathBuf },

    /// Copy hashes of A that are not in B into DEST
    Subtract { a: PathBuf, b: PathBuf, dest: PathBuf },

    /// Copy hashes of A that have exactly one source offset into DEST
    Deduplicate { a: PathBuf, dest: PathBuf },

    /// Print the number of keys in each store
    Sizes { db: PathBuf },
}

// Run `$body` with `$k` bound to the digest type of `$alg`.
macro_rules! with_digest {
    ($alg:expr, $k:ident => $body:expr) => {
        match $alg {
            HashAlgorithm::Md5 => {
                type $k = Md5Digest;
                $body
            }
            HashAlgorithm::Sha1 => {
                type $k = Sha1Digest;
                $body
            }
            HashAlgorithm::Sha256 => {
                type $k = Sha256Digest;
                $body
            }
        }
    };
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let command_line = std::env::args().collect::<Vec<_>>().join(" ");

    match cli.cmd {
        Command::Create {
            db,
            algorithm,
            map_type,
            sector_size,
            block_size,
            max_source_offset_pairs,
            hash_prefix_bits,
            hash_suffix_bytes,
            source_lookup_index_bits,
        } => {
            let settings = Settings {
                hash_algorithm: algorithm,
                map_type,
                sector_size,
                block_size,
                max_source_offset_pairs,
                hash_prefix_bits,
                hash_suffix_bytes,
                source_lookup_index_bits,
                ..Settings::default()
            };
            hashdb::create_hashdb(&db, &settings, &command_line)
                .with_context(|| format!("Failed to create database {}", db.display()))?;
            println!("{}", settings.to_json());
            Ok(())
        }

        Command::Import { db, input } => {
            let alg = algorithm_of(&db)?;
            with_digest!(alg, K => import::<K>(&db, &input, &command_line))
        }

        Command::Export { db, output } => {
            let alg = algorithm_of(&db)?;
            with_digest!(alg, K => export::<K>(&db, output.as_deref()))
        }

        Command::Scan { db, input, threads } => {
            let threads = match threads {
                Some(n) => n.max(1),
                None => std::thread::available_parallelism()
                    .map(|n| n.get().saturating_sub(1).max(1))
                    .unwrap_or(1),
            };
            let alg = algorithm_of(&db)?;
            with_digest!(alg, K => scan::<K>(&db, &input, threads))
        }

        Command::ScanHash { db, hash } => {
            let alg = algorithm_of(&db)?;
            with_digest!(alg, K => scan_hash::<K>(&db, &hash))
        }

        Command::ScanSource { db, hash } => {
            let alg = algorithm_of(&db)?;
            with_digest!(alg, K => scan_source::<K>(&db, &hash))
        }

        Command::Add { a, dest } => {
            let alg = algorithm_of(&a)?;
            with_digest!(alg, K => {
                let a = open_scan::<K>(&a)?;
                let dest = open_dest::<K>(&dest, a.settings(), &command_line)?;
                let n = set_ops::add(&a, &dest)?;
                finish_dest(dest, n)
            })
        }

        Command::AddMultiple { a, b, dest } => {
            let alg = algorithm_of(&a)?;
            with_digest!(alg, K => {
                let a = open_scan::<K>(&a)?;
                let b = open_scan::<K>(&b)?;
                let dest = open_dest::<K>(&dest, a.settings(), &command_line)?;
                let n = set_ops::add_multiple(&a, &b, &dest)?;
                finish_dest(dest, n)
            })
        }

        Command::Intersect { a, b, dest } => {
            let alg = algorithm_of(&a)?;
            with_digest!(alg, K => {
                let a = open_scan::<K>(&a)?;
                let b = open_scan::<K>(&b)?;
                let dest = open_dest::<K>(&dest, a.settings(), &command_line)?;
                let n = set_ops::intersect(&a, &b, &dest)?;
                finish_dest(dest, n)
            })
        }

        Command::Subtract { a, b, dest } => {
            let alg = algorithm_of(&a)?;
            with_digest!(alg, K => {
                let a = open_scan::<K>(&a)?;
                let b = open_scan::<K>(&b)?;
                let dest = open_dest::<K>(&dest, a.settings(), &command_line)?;
                let n = set_ops::subtract(&a, &b, &dest)?;
                finish_dest(dest, n)
            })
        }

        Command::Deduplicate { a, dest } => {
            let alg = algorithm_of(&a)?;
            with_digest!(alg, K => {
                let a = open_scan::<K>(&a)?;
                let dest = open_dest::<K>(&dest, a.settings(), &command_line)?;
                let n = set_ops::deduplicate(&a, &dest)?;
                finish_dest(dest, n)
            })
        }

        Command::Sizes { db } => {
            let alg = algorithm_of(&db)?;
            with_digest!(alg, K => {
                let session = open_scan::<K>(&db)?;
                println!("{}", session.sizes()?);
                Ok(())
            })
        }
    }
}

fn algorithm_of(db: &Path) -> Result<HashAlgorithm> {
    let settings = settings::read_settings(db)
        .with_context(|| format!("Failed to open database {}", db.display()))?;
    Ok(settings.hash_algorithm)
}

fn open_scan<K: DigestKey>(db: &Path) -> Result<ScanSession<K>> {
    ScanSession::open(db).with_context(|| format!("Failed to open database {}", db.display()))
}

/// Open the destination of a set operation, creating it with the settings of
/// the first input if it does not exist yet.
fn open_dest<K: DigestKey>(
    dest: &Path,
    settings: &Settings,
    command_line: &str,
) -> Result<ImportSession<K>> {
    if !dest.exists() {
        hashdb::create_hashdb(dest, settings, command_line)
            .with_context(|| format!("Failed to create database {}", dest.display()))?;
    }
    ImportSession::open(dest, command_line)
        .with_context(|| format!("Failed to open database {}", dest.display()))
}

fn finish_dest<K: DigestKey>(dest: ImportSession<K>, copied: u64) -> Result<()> {
    let changes = dest.close()?;
    println!("hashes copied: {copied}");
    print!("{changes}");
    Ok(())
}

fn open_input(input: &Path) -> Result<Box<dyn BufRead>> {
    if input.as_os_str() == "-" {
        return Ok(Box::new(io::stdin().lock()));
    }
    let f = File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    Ok(Box::new(BufReader::new(f)))
}

fn import<K: DigestKey>(db: &Path, input: &Path, command_line: &str) -> Result<()> {
    let reader = open_input(input)?;
    let session = ImportSession::<K>::open(db, command_line)
        .with_context(|| format!("Failed to open database {}", db.display()))?;

    let stats = json_lines::import_json_lines(&session, reader)?;
    let changes = session.close()?;

    println!(
        "records: {} hashes, {} sources, {} skipped",
        stats.hashes, stats.sources, stats.skipped
    );
    print!("{changes}");
    Ok(())
}

fn export<K: DigestKey>(db: &Path, output: Option<&Path>) -> Result<()> {
    let session = open_scan::<K>(db)?;
    match output {
        Some(path) => {
            let f = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            json_lines::export_json_lines(&session, BufWriter::new(f))?;
        }
        None => {
            json_lines::export_json_lines(&session, BufWriter::new(io::stdout().lock()))?;
        }
    }
    Ok(())
}

fn scan<K: DigestKey>(db: &Path, input: &Path, threads: usize) -> Result<()> {
    let reader = open_input(input)?;
    let session = open_scan::<K>(db)?;

    tracing::info!(db = %db.display(), threads, "scan starting");
    let stats = scan_list::scan_hash_list(&session, reader, BufWriter::new(io::stdout()), threads)?;
    if stats.invalid > 0 {
        tracing::warn!(invalid = stats.invalid, "some lines were not hashes");
    }
    Ok(())
}

fn parse_digest<K: DigestKey>(hash: &str) -> Result<K> {
    K::from_hex(hash).ok_or_else(|| anyhow!("'{hash}' is not a {} hash", K::ALGORITHM))
}

fn scan_hash<K: DigestKey>(db: &Path, hash: &str) -> Result<()> {
    let block_hash = parse_digest::<K>(hash)?;
    let session = open_scan::<K>(db)?;

    let mut out = io::stdout().lock();
    match session.find_hash_json(&block_hash)? {
        Some(json) => writeln!(out, "{json}")?,
        None => writeln!(out, "Hash not found for '{hash}'")?,
    }
    Ok(())
}

fn scan_source<K: DigestKey>(db: &Path, hash: &str) -> Result<()> {
    let file_hash = parse_digest::<K>(hash)?;
    let session = open_scan::<K>(db)?;

    let mut out = io::stdout().lock();
    match session.find_source_json(&file_hash)? {
        Some(json) => writeln!(out, "{json}")?,
        None => writeln!(out, "Source not found for '{hash}'")?,
    }
    Ok(())
}
