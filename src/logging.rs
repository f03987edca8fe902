use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt};

pub fn init(verbose: u8) -> Result<()> {
    // RUST_LOG wins; otherwise -v raises the level.
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout carries records and scan results
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}
