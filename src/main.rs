//! Tapedeck CLI

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use tapedeck::config::Config;
use tapedeck::network::NetworkHandler;
use tracing_subscriber::EnvFilter;

fn usage() -> ! {
    eprintln!("Tapedeck v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: tapedeck <config.toml> [--record | --replay]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --record    Forward to the upstream and write fixtures");
    eprintln!("  --replay    Serve from fixtures only");
    eprintln!();
    eprintln!("Without a flag the mode comes from `record` in the config file.");
    process::exit(1);
}

fn main() -> anyhow::Result<()> {
    let mut config_path = None;
    let mut record_override = None;

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--record" => record_override = Some(true),
            "--replay" => record_override = Some(false),
            "-h" | "--help" => usage(),
            flag if flag.starts_with('-') => {
                eprintln!("Unknown option: {flag}");
                usage();
            }
            path if config_path.is_none() => config_path = Some(PathBuf::from(path)),
            _ => usage(),
        }
    }

    let Some(config_path) = config_path else {
        usage();
    };

    let config = Config::from_file_with_mode(&config_path, record_override)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(async {
        let handler = NetworkHandler::new(config)?;
        handler.run().await
    })?;

    Ok(())
}
