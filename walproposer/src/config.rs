//! Configuration: CLI parsing (spec §6) plus construction-time validation that turns
//! malformed input into the fatal "configuration error" class of spec §7.4, raised
//! before the event loop is ever built.

use std::net::ToSocketAddrs;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use walproposer_api::{ProposerId, TenantId, TimelineId};

pub const MAX_SAFEKEEPERS: usize = 32;

#[derive(Parser, Debug)]
#[command(name = "walproposer", about = "WAL proposer for a replicated write-ahead log")]
pub struct Cli {
    /// Tenant id, as a hex UUID.
    #[arg(long)]
    pub tenant_id: String,

    /// Timeline id, as a hex UUID.
    #[arg(long)]
    pub timeline_id: String,

    /// Comma-separated `host:port` list of acceptors (safekeepers), 1..=32 entries.
    #[arg(long, value_delimiter = ',')]
    pub safekeepers: Vec<String>,

    /// Reconnect cadence for offline acceptors. `0` disables reconnection.
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub safekeeper_reconnect_timeout: Duration,

    /// Per-acceptor inactivity cutoff; exceeding it forces the connection offline.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub safekeeper_connection_timeout: Duration,

    /// WAL segment size, advertised in the greeting and used for page-header skipping.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    pub wal_segment_size: u32,

    /// Run in one-shot "sync safekeepers" mode: exit once a quorum acknowledges the
    /// current epoch's start LSN, instead of streaming indefinitely.
    #[arg(long, default_value_t = false)]
    pub sync_safekeepers: bool,

    /// Verbatim Postgres system identifier carried in the greeting.
    #[arg(long, default_value_t = 0)]
    pub system_id: u64,

    /// Bind address for the Prometheus metrics endpoint.
    #[arg(long)]
    pub listen_metrics: Option<String>,

    /// Local file standing in for the host database's WAL (real WAL production is an
    /// external collaborator, out of scope here).
    #[arg(long, default_value = "./walproposer.wal")]
    pub wal_file: std::path::PathBuf,

    /// LSN at which this host's on-disk image begins.
    #[arg(long, default_value_t = 0)]
    pub redo_start_lsn: u64,

    /// Directory for durable proposer state (`mineLastElectedTerm`).
    #[arg(long, default_value = "./walproposer-state")]
    pub state_dir: std::path::PathBuf,
}

/// Validated, immutable configuration the rest of the proposer is built from.
#[derive(Debug, Clone)]
pub struct Config {
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,
    pub proposer_id: ProposerId,
    pub safekeepers: Vec<String>,
    pub quorum: usize,
    pub safekeeper_reconnect_timeout: Duration,
    pub safekeeper_connection_timeout: Duration,
    pub wal_segment_size: u32,
    pub sync_safekeepers: bool,
    pub system_id: u64,
    pub listen_metrics: Option<String>,
    pub wal_file: std::path::PathBuf,
    pub redo_start_lsn: u64,
    pub state_dir: std::path::PathBuf,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Config> {
        let tenant_id: TenantId = cli
            .tenant_id
            .parse()
            .with_context(|| format!("invalid --tenant-id {:?}", cli.tenant_id))?;
        let timeline_id: TimelineId = cli
            .timeline_id
            .parse()
            .with_context(|| format!("invalid --timeline-id {:?}", cli.timeline_id))?;

        if cli.safekeepers.is_empty() {
            bail!("--safekeepers must name at least one acceptor");
        }
        if cli.safekeepers.len() > MAX_SAFEKEEPERS {
            bail!(
                "--safekeepers names {} acceptors, at most {} are supported",
                cli.safekeepers.len(),
                MAX_SAFEKEEPERS
            );
        }
        for sk in &cli.safekeepers {
            sk.to_socket_addrs()
                .with_context(|| format!("unresolvable safekeeper address {:?}", sk))?;
        }

        let n = cli.safekeepers.len();
        let quorum = n / 2 + 1;

        Ok(Config {
            tenant_id,
            timeline_id,
            proposer_id: ProposerId::generate(),
            safekeepers: cli.safekeepers,
            quorum,
            safekeeper_reconnect_timeout: cli.safekeeper_reconnect_timeout,
            safekeeper_connection_timeout: cli.safekeeper_connection_timeout,
            wal_segment_size: cli.wal_segment_size,
            sync_safekeepers: cli.sync_safekeepers,
            system_id: cli.system_id,
            listen_metrics: cli.listen_metrics,
            wal_file: cli.wal_file,
            redo_start_lsn: cli.redo_start_lsn,
            state_dir: cli.state_dir,
        })
    }

    pub fn n_safekeepers(&self) -> usize {
        self.safekeepers.len()
    }
}
