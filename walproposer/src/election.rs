//! Election coordinator (spec §4.4): greeting aggregation, vote tallying, donor
//! selection, and the per-acceptor `startStreamingAt` computation. Kept free of I/O so
//! it can be exercised with plain unit tests; `proposer.rs` drives these functions as
//! vote responses arrive.

use tracing::warn;
use walproposer_api::{Lsn, Term, TermHistory, TermLsn};

use crate::wal::skip_xlog_page_headers;

/// One acceptor's vote, as needed to pick a donor and compute streaming start points.
#[derive(Debug, Clone)]
pub struct Ballot {
    pub index: usize,
    pub flush_lsn: Lsn,
    pub truncate_lsn: Lsn,
    pub term_history: TermHistory,
    pub timeline_start_lsn: Lsn,
}

impl Ballot {
    fn epoch(&self) -> Term {
        self.term_history.epoch(self.flush_lsn)
    }
}

pub struct EpochDecision {
    pub donor_index: usize,
    pub donor_epoch: Term,
    pub epoch_start_lsn: Lsn,
    pub truncate_lsn: Lsn,
    pub timeline_start_lsn: Lsn,
    /// set when ballots disagreed on a nonzero `timeline_start_lsn` (spec §9 open
    /// question: logged, not fatal, but worth surfacing in metrics).
    pub timeline_start_lsn_mismatch: bool,
}

/// Pick the donor (the ballot maximizing `(epoch, flush_lsn)`) and derive the epoch
/// start LSN, truncate LSN, and timeline start LSN (spec §4.4 `DetermineEpochStartLsn`).
/// Panics if `ballots` is empty; the caller only invokes this once quorum is reached.
pub fn determine_epoch_start_lsn(ballots: &[Ballot]) -> EpochDecision {
    assert!(!ballots.is_empty(), "need at least one ballot to elect a donor");

    let donor = ballots
        .iter()
        .max_by_key(|b| (b.epoch(), b.flush_lsn))
        .expect("non-empty ballots");

    let truncate_lsn = ballots.iter().map(|b| b.truncate_lsn).max().unwrap_or(Lsn::INVALID);

    let mut timeline_start_lsn = Lsn::INVALID;
    let mut mismatch = false;
    for b in ballots {
        if b.timeline_start_lsn.is_valid() {
            if timeline_start_lsn.is_valid() && timeline_start_lsn != b.timeline_start_lsn {
                mismatch = true;
            } else {
                timeline_start_lsn = b.timeline_start_lsn;
            }
        }
    }
    if mismatch {
        warn!(
            "acceptors disagree on timeline_start_lsn; using {:?}",
            timeline_start_lsn
        );
    }

    EpochDecision {
        donor_index: donor.index,
        donor_epoch: donor.epoch(),
        epoch_start_lsn: donor.flush_lsn,
        truncate_lsn,
        timeline_start_lsn,
        timeline_start_lsn_mismatch: mismatch,
    }
}

/// Bootstrap clause (spec §4.4): a brand new timeline with every acceptor reporting
/// `flush_lsn=0` starts at the host's redo start LSN instead of zero.
pub fn apply_bootstrap_clause(
    epoch_start_lsn: Lsn,
    truncate_lsn: Lsn,
    sync_safekeepers: bool,
    redo_start_lsn: Lsn,
) -> (Lsn, Lsn) {
    if epoch_start_lsn == Lsn::INVALID && !sync_safekeepers {
        (redo_start_lsn, redo_start_lsn)
    } else {
        (epoch_start_lsn, truncate_lsn)
    }
}

/// The proposer's own term history: the donor's history plus one new entry marking
/// where our term begins.
pub fn build_proposer_term_history(
    donor_history: &TermHistory,
    prop_term: Term,
    epoch_start_lsn: Lsn,
) -> TermHistory {
    let mut entries = donor_history.0.clone();
    entries.push(TermLsn {
        term: prop_term,
        lsn: epoch_start_lsn,
    });
    TermHistory(entries)
}

/// Cross-check the chosen epoch start LSN against where the host's on-disk image
/// actually begins (spec §4.4). Returns `Ok(())` if they agree (after skipping XLog
/// page headers) or if the donor's last term matches our own persisted
/// `mine_last_elected_term` (we are restarting ourselves). Otherwise the mismatch is
/// a fatal safety violation (spec §7.3).
pub fn cross_check_redo_start_lsn(
    epoch_start_lsn: Lsn,
    redo_start_lsn: Lsn,
    wal_segment_size: u32,
    donor_history: &TermHistory,
    mine_last_elected_term: Term,
) -> Result<(), (Lsn, Lsn)> {
    if skip_xlog_page_headers(epoch_start_lsn, wal_segment_size) == redo_start_lsn {
        return Ok(());
    }
    let restarted_ourselves = donor_history
        .0
        .last()
        .map(|e| e.term == mine_last_elected_term)
        .unwrap_or(false);
    if restarted_ourselves {
        return Ok(());
    }
    Err((epoch_start_lsn, redo_start_lsn))
}

/// Per-acceptor `startStreamingAt` (spec §4.4): where this acceptor's stream resumes.
pub fn start_streaming_at(
    prop_term_history: &TermHistory,
    acc_term_history: &TermHistory,
    acc_flush_lsn: Lsn,
    truncate_lsn: Lsn,
) -> Lsn {
    match TermHistory::find_highest_common_point(
        prop_term_history,
        &acc_term_history.up_to(acc_flush_lsn),
        acc_flush_lsn,
    ) {
        None => {
            let first = prop_term_history
                .0
                .first()
                .map(|e| e.lsn)
                .unwrap_or(Lsn::INVALID);
            if first < truncate_lsn {
                warn!(
                    "new acceptor's computed start {:?} is below truncate_lsn {:?}; clamping up",
                    first, truncate_lsn
                );
                truncate_lsn
            } else {
                first
            }
        }
        Some(point) => point.lsn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ballot(index: usize, epoch: Term, flush: u64, truncate: u64) -> Ballot {
        Ballot {
            index,
            flush_lsn: Lsn(flush),
            truncate_lsn: Lsn(truncate),
            term_history: TermHistory(vec![(epoch, Lsn(0)).into()]),
            timeline_start_lsn: Lsn(1),
        }
    }

    #[test]
    fn donor_is_max_epoch_then_flush_lsn() {
        // scenario 2 from spec §8: (4, 0x200), (5, 0x180), (5, 0x1F0) -> donor index 2
        let ballots = vec![
            ballot(0, 4, 0x200, 0),
            ballot(1, 5, 0x180, 0),
            ballot(2, 5, 0x1F0, 0),
        ];
        let decision = determine_epoch_start_lsn(&ballots);
        assert_eq!(decision.donor_index, 2);
        assert_eq!(decision.epoch_start_lsn, Lsn(0x1F0));
    }

    #[test]
    fn bootstrap_clause_fires_only_when_epoch_start_is_zero() {
        let (epoch, trunc) = apply_bootstrap_clause(Lsn::INVALID, Lsn::INVALID, false, Lsn(0x100));
        assert_eq!(epoch, Lsn(0x100));
        assert_eq!(trunc, Lsn(0x100));

        let (epoch, trunc) = apply_bootstrap_clause(Lsn(0x50), Lsn(0x10), false, Lsn(0x100));
        assert_eq!(epoch, Lsn(0x50));
        assert_eq!(trunc, Lsn(0x10));
    }

    #[test]
    fn bootstrap_clause_does_not_fire_in_sync_mode() {
        let (epoch, trunc) = apply_bootstrap_clause(Lsn::INVALID, Lsn::INVALID, true, Lsn(0x100));
        assert_eq!(epoch, Lsn::INVALID);
        assert_eq!(trunc, Lsn::INVALID);
    }

    #[test]
    fn empty_acceptor_clamps_to_truncate_lsn() {
        // scenario 6 from spec §8.
        let prop_th = TermHistory(vec![(6, Lsn(0x100)).into()]);
        let acc_th = TermHistory::empty();
        let started = start_streaming_at(&prop_th, &acc_th, Lsn(0), Lsn(0x100));
        assert_eq!(started, Lsn(0x100));
    }

    #[test]
    fn caught_up_acceptor_resumes_at_its_flush_lsn() {
        let prop_th = TermHistory(vec![(6, Lsn(0x100)).into()]);
        let acc_th = TermHistory(vec![(6, Lsn(0x100)).into()]);
        let started = start_streaming_at(&prop_th, &acc_th, Lsn(0x500), Lsn(0x100));
        assert_eq!(started, Lsn(0x500));
    }
}
