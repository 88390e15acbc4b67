//! Proposer (leader) side of a quorum-replicated write-ahead log: runs the election
//! and streaming protocol against a fixed set of acceptors from a single cooperative
//! event loop. See the `proposer` module for the orchestration entry point.

pub mod acceptor;
pub mod config;
pub mod election;
pub mod error;
pub mod event_loop;
pub mod http;
pub mod metrics;
pub mod proposer;
pub mod state;
pub mod streaming;
pub mod transport;
pub mod wal;

pub use config::Config;
pub use error::{FatalError, TransportError};
pub use proposer::Proposer;
pub use state::{ProposerState, SharedState};
pub use wal::WalSource;
