//! Streaming & commit engine (spec §4.5): turns newly produced WAL into `AppendRequest`
//! chunks and folds acceptor flush positions into the quorum commit LSN and the
//! truncate LSN. Kept free of I/O so the arithmetic can be unit tested directly;
//! `proposer.rs` drives the actual reads and writes.

use bytes::Bytes;
use walproposer_api::{Lsn, ProposerId, Term};

use crate::wal::{WalSource, MAX_SEND_SIZE};

/// The quorum commit LSN (spec §4.5): the highest LSN acknowledged by a majority of
/// acceptors, restricted to positions at or after `epoch_start_lsn` since flush
/// positions from a previous epoch don't carry this epoch's durability guarantee.
/// Acceptors below `epoch_start_lsn` are floored to it rather than excluded, matching
/// the source algorithm's "not yet caught up" treatment; returns `Lsn::INVALID` if
/// fewer than `quorum` acceptors are connected at all (`flush_lsns` should only include
/// connected, voted acceptors).
pub fn quorum_commit_lsn(flush_lsns: &[Lsn], epoch_start_lsn: Lsn, quorum: usize) -> Lsn {
    if flush_lsns.len() < quorum {
        return Lsn::INVALID;
    }
    let mut masked: Vec<Lsn> = flush_lsns
        .iter()
        .map(|&l| if l < epoch_start_lsn { epoch_start_lsn } else { l })
        .collect();
    masked.sort_unstable_by(|a, b| b.cmp(a));
    masked[quorum - 1]
}

/// Lowest flush LSN among connected acceptors: WAL below this point is durable
/// everywhere reachable and safe to advance `truncateLsn` up to (spec §4.5), never
/// past `commit_lsn`.
pub fn min_flush_lsn(flush_lsns: &[Lsn]) -> Option<Lsn> {
    flush_lsns.iter().copied().min()
}

/// Next truncate LSN: the highest value that is still `<=` every connected acceptor's
/// flush position and `<=` the current commit LSN, and never moves backwards.
pub fn next_truncate_lsn(current: Lsn, flush_lsns: &[Lsn], commit_lsn: Lsn) -> Lsn {
    let candidate = min_flush_lsn(flush_lsns).unwrap_or(current).min(commit_lsn);
    candidate.max(current)
}

/// One chunk of WAL to send to an acceptor (spec §4.5 step 2): `[begin_lsn, end_lsn)`,
/// capped at `MAX_SEND_SIZE` and never exceeding `flush_lsn` (WAL not yet produced).
pub fn next_send_range(begin_lsn: Lsn, flush_lsn: Lsn) -> Option<(Lsn, Lsn)> {
    if begin_lsn >= flush_lsn {
        return None;
    }
    let remaining = u64::from(flush_lsn) - u64::from(begin_lsn);
    let chunk = remaining.min(MAX_SEND_SIZE as u64);
    Some((begin_lsn, begin_lsn + chunk))
}

/// Read `[begin_lsn, end_lsn)` from the host's WAL and frame it as an `AppendRequest`.
pub fn build_append_request(
    wal: &dyn WalSource,
    proposer_id: ProposerId,
    term: Term,
    epoch_start_lsn: Lsn,
    begin_lsn: Lsn,
    end_lsn: Lsn,
    commit_lsn: Lsn,
    truncate_lsn: Lsn,
) -> std::io::Result<walproposer_api::proto::AppendRequest> {
    let mut wal_data = Vec::with_capacity((u64::from(end_lsn) - u64::from(begin_lsn)) as usize);
    wal.read_wal(begin_lsn, end_lsn, &mut wal_data)?;
    Ok(walproposer_api::proto::AppendRequest {
        h: walproposer_api::proto::AppendRequestHeader {
            term,
            epoch_start_lsn,
            begin_lsn,
            end_lsn,
            commit_lsn,
            truncate_lsn,
            proposer_id,
        },
        wal_data: Bytes::from(wal_data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_lsn_is_quorum_th_highest() {
        // three acceptors, quorum 2: commit is the 2nd-highest flush position.
        let flush = [Lsn(0x300), Lsn(0x200), Lsn(0x100)];
        assert_eq!(quorum_commit_lsn(&flush, Lsn(0), 2), Lsn(0x200));
    }

    #[test]
    fn commit_lsn_floors_stale_epoch_acceptors() {
        let flush = [Lsn(0x50), Lsn(0x300), Lsn(0x280)];
        assert_eq!(quorum_commit_lsn(&flush, Lsn(0x200), 2), Lsn(0x280));
    }

    #[test]
    fn commit_lsn_invalid_below_quorum() {
        assert_eq!(quorum_commit_lsn(&[Lsn(0x100)], Lsn(0), 2), Lsn::INVALID);
    }

    #[test]
    fn truncate_lsn_never_moves_backwards() {
        let flush = [Lsn(0x100), Lsn(0x150)];
        let next = next_truncate_lsn(Lsn(0x120), &flush, Lsn(0x200));
        assert_eq!(next, Lsn(0x120));
    }

    #[test]
    fn lagging_acceptor_clamps_truncate_until_it_catches_up() {
        // scenario 4 from spec §8: N=3, Q=2, two acceptors at 0x400, one at 0x300.
        let lagging = [Lsn(0x400), Lsn(0x400), Lsn(0x300)];
        let commit = quorum_commit_lsn(&lagging, Lsn(0), 2);
        assert_eq!(commit, Lsn(0x400));
        let truncate = next_truncate_lsn(Lsn(0), &lagging, commit);
        assert_eq!(truncate, Lsn(0x300));

        // the slow acceptor catches up: truncate_lsn may now advance to 0x400.
        let caught_up = [Lsn(0x400), Lsn(0x400), Lsn(0x400)];
        let commit = quorum_commit_lsn(&caught_up, Lsn(0), 2);
        let truncate = next_truncate_lsn(truncate, &caught_up, commit);
        assert_eq!(truncate, Lsn(0x400));
    }

    #[test]
    fn send_range_caps_at_max_send_size() {
        let begin = Lsn(0);
        let flush = Lsn(MAX_SEND_SIZE as u64 * 2);
        let (b, e) = next_send_range(begin, flush).unwrap();
        assert_eq!(b, Lsn(0));
        assert_eq!(e, Lsn(MAX_SEND_SIZE as u64));
    }

    #[test]
    fn send_range_empty_when_caught_up() {
        assert!(next_send_range(Lsn(0x100), Lsn(0x100)).is_none());
    }
}
