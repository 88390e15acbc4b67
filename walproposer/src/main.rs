//! `walproposer` binary entry point: parse CLI, validate configuration, run the
//! election/streaming loop, exit non-zero on a fatal error (spec §7.3).

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use walproposer::config::{Cli, Config};
use walproposer::state::SharedState;
use walproposer::wal::FileWalSource;
use walproposer::Proposer;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match Config::from_cli(cli) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("invalid configuration: {e:#}");
            std::process::exit(1);
        }
    };

    if let Some(addr) = config.listen_metrics.clone() {
        walproposer::http::spawn(addr);
    }

    if let Err(e) = std::fs::create_dir_all(&config.state_dir) {
        tracing::error!("failed to create state directory: {e}");
        std::process::exit(1);
    }

    let shared = match SharedState::load(&config.state_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("failed to load persisted state: {e}");
            std::process::exit(1);
        }
    };

    let wal = match FileWalSource::open(config.wal_file.clone(), walproposer_api::Lsn(config.redo_start_lsn)) {
        Ok(w) => Box::new(w),
        Err(e) => {
            tracing::error!("failed to open wal file: {e}");
            std::process::exit(1);
        }
    };

    let mut proposer = match Proposer::new(config, wal, shared) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("failed to initialize proposer: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = proposer.run() {
        tracing::error!("fatal error: {e}");
        std::process::exit(1);
    }
}
