//! Error taxonomy (protocol spec §7): transient per-connection failures are handled
//! locally and never escape the acceptor state machine; fatal safety violations and
//! configuration errors propagate up to `main` and terminate the process.

use thiserror::Error;

/// Errors from a single transport operation. The acceptor state machine reacts to
/// these locally by resetting the connection to `Offline`; they never escape to `main`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("peer closed the connection")]
    Eof,
    #[error("i/o error: {0}")]
    Io(#[source] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// A safety violation that unambiguously indicates a concurrent proposer or corruption.
/// Per spec §7.3, these terminate the process; no state-machine invariant is read after
/// one is raised.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("observed term {observed} higher than our term {ours}; a concurrent proposer exists")]
    HigherTermSeen { ours: u64, observed: u64 },
    #[error("vote rejected by acceptor while we still need votes for term {term}")]
    VoteRejected { term: u64 },
    #[error(
        "basebackup LSN {basebackup} does not match our epoch start LSN {epoch_start}, \
         and we were not the last proposer elected on this timeline"
    )]
    BasebackupLsnMismatch { basebackup: u64, epoch_start: u64 },
    /// Spec §7.3 names "recovery download failure" as fatal; this implementation never
    /// attempts a donor WAL download (spec §1/§2 list no recovery component to build
    /// against), so this variant exists for taxonomy completeness but is never raised.
    #[error("recovery download from donor failed: {0}")]
    RecoveryFailed(String),
    #[error("event loop wait failed: {0}")]
    EventLoopFailed(String),
    #[error("failed to persist mine_last_elected_term: {0}")]
    StatePersistFailed(String),
}
