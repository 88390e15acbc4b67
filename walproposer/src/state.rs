//! Proposer-wide state (spec §3, §5): the single-threaded election/streaming state the
//! event loop mutates each cycle, plus the small slice of state ("mine_last_elected_term")
//! that must survive a proposer restart within the same host process.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use walproposer_api::{Lsn, NodeId, PageserverFeedback, Term, TermHistory, INVALID_TERM};

/// Global proposer state (spec §3). Lives on the single event-loop thread; nothing
/// here is shared across threads except through `SharedState` below.
pub struct ProposerState {
    pub quorum: usize,
    pub available_lsn: Lsn,
    pub last_sent_commit_lsn: Lsn,
    pub prop_term: Term,
    pub prop_term_history: TermHistory,
    pub prop_epoch_start_lsn: Lsn,
    pub donor: Option<NodeId>,
    pub donor_epoch: Term,
    pub truncate_lsn: Lsn,
    pub timeline_start_lsn: Lsn,
    pub n_connected: usize,
    pub n_votes: usize,
}

impl ProposerState {
    pub fn new(quorum: usize) -> ProposerState {
        ProposerState {
            quorum,
            available_lsn: Lsn::INVALID,
            last_sent_commit_lsn: Lsn::INVALID,
            prop_term: INVALID_TERM,
            prop_term_history: TermHistory::empty(),
            prop_epoch_start_lsn: Lsn::INVALID,
            donor: None,
            donor_epoch: INVALID_TERM,
            truncate_lsn: Lsn::INVALID,
            timeline_start_lsn: Lsn::INVALID,
            n_connected: 0,
            n_votes: 0,
        }
    }

    pub fn has_quorum_votes(&self) -> bool {
        self.n_votes >= self.quorum
    }
}

/// State touched from outside the event loop (spec §5): the latest feedback snapshot
/// a monitoring endpoint might read, and the one durable fact the proposer keeps across
/// restarts. Guarded by a single mutex since updates are rare and never on the hot path.
/// `backpressure_lag` sits outside the mutex as a plain atomic, per spec §5.
pub struct SharedState {
    inner: Mutex<Shared>,
    persist: TermPersistence,
    /// How far `available_lsn` is ahead of the pageserver's last known flush
    /// position, in bytes; the host uses this to throttle WAL production.
    backpressure_lag: AtomicU64,
}

struct Shared {
    pageserver_feedback: PageserverFeedback,
    mine_last_elected_term: Term,
}

impl SharedState {
    pub fn load(state_dir: &Path) -> io::Result<SharedState> {
        let persist = TermPersistence::new(state_dir.join("last_elected_term"));
        let mine_last_elected_term = persist.load()?;
        Ok(SharedState {
            inner: Mutex::new(Shared {
                pageserver_feedback: PageserverFeedback::empty(),
                mine_last_elected_term,
            }),
            persist,
            backpressure_lag: AtomicU64::new(0),
        })
    }

    pub fn mine_last_elected_term(&self) -> Term {
        self.inner.lock().mine_last_elected_term
    }

    /// Record that we were just elected on `term`, persisting it so a future restart
    /// of this same proposer can recognize its own prior epoch (spec §4.4 cross-check).
    pub fn record_elected(&self, term: Term) -> io::Result<()> {
        self.persist.store(term)?;
        self.inner.lock().mine_last_elected_term = term;
        Ok(())
    }

    pub fn update_feedback(&self, fb: &PageserverFeedback) {
        self.inner.lock().pageserver_feedback.merge_max(fb);
    }

    pub fn feedback_snapshot(&self) -> PageserverFeedback {
        self.inner.lock().pageserver_feedback
    }

    /// Recompute the backpressure lag from `available_lsn` and the latest known
    /// pageserver flush position; 0 while no feedback has arrived yet.
    pub fn update_backpressure_lag(&self, available_lsn: Lsn) {
        let disk_consistent_lsn = self.inner.lock().pageserver_feedback.disk_consistent_lsn;
        let lag = match disk_consistent_lsn {
            Some(flushed) => u64::from(available_lsn).saturating_sub(u64::from(flushed)),
            None => 0,
        };
        self.backpressure_lag.store(lag, Ordering::Relaxed);
    }

    pub fn backpressure_lag(&self) -> u64 {
        self.backpressure_lag.load(Ordering::Relaxed)
    }
}

/// Durable storage for `mine_last_elected_term`: a single little-endian `u64` written
/// via a temp file plus rename so a crash mid-write never leaves a half-written value.
struct TermPersistence {
    path: PathBuf,
}

impl TermPersistence {
    fn new(path: PathBuf) -> TermPersistence {
        TermPersistence { path }
    }

    fn load(&self) -> io::Result<Term> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.len() == 8 => Ok(Term::from_le_bytes(bytes.try_into().unwrap())),
            Ok(_) => Ok(INVALID_TERM),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(INVALID_TERM),
            Err(e) => Err(e),
        }
    }

    fn store(&self, term: Term) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, term.to_le_bytes())?;
        fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_votes_threshold() {
        let mut st = ProposerState::new(2);
        assert!(!st.has_quorum_votes());
        st.n_votes = 2;
        assert!(st.has_quorum_votes());
    }

    #[test]
    fn term_persistence_round_trips_across_instances() {
        let dir = std::env::temp_dir().join(format!("walproposer-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let shared = SharedState::load(&dir).unwrap();
        assert_eq!(shared.mine_last_elected_term(), INVALID_TERM);
        shared.record_elected(42).unwrap();
        assert_eq!(shared.mine_last_elected_term(), 42);

        let reloaded = SharedState::load(&dir).unwrap();
        assert_eq!(reloaded.mine_last_elected_term(), 42);

        fs::remove_dir_all(&dir).ok();
    }
}
