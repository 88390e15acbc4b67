//! Term and term history: the append-only record of "term T began at LSN L" that lets
//! proposer and acceptor agree on the authoritative WAL prefix across elections.

use std::cmp::min;
use std::fmt;

use anyhow::{bail, Result};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::lsn::Lsn;

/// Consensus logical timestamp ("ballot" in Paxos, "term" in Raft).
pub type Term = u64;
pub const INVALID_TERM: Term = 0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct TermLsn {
    pub term: Term,
    pub lsn: Lsn,
}

impl From<(Term, Lsn)> for TermLsn {
    fn from(pair: (Term, Lsn)) -> TermLsn {
        TermLsn {
            term: pair.0,
            lsn: pair.1,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TermHistory(pub Vec<TermLsn>);

impl TermHistory {
    pub fn empty() -> TermHistory {
        TermHistory(Vec::new())
    }

    /// Parse as n_entries(u32) followed by n (term:u64, lsn:u64) pairs.
    pub fn from_bytes(bytes: &mut impl Buf) -> Result<TermHistory> {
        if bytes.remaining() < 4 {
            bail!("TermHistory misses len");
        }
        let n_entries = bytes.get_u32_le();
        let mut res = Vec::with_capacity(n_entries as usize);
        for _ in 0..n_entries {
            if bytes.remaining() < 16 {
                bail!("TermHistory is incomplete");
            }
            res.push(TermLsn {
                term: bytes.get_u64_le(),
                lsn: bytes.get_u64_le().into(),
            });
        }
        Ok(TermHistory(res))
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.0.len() as u32);
        for e in &self.0 {
            buf.put_u64_le(e.term);
            buf.put_u64_le(e.lsn.into());
        }
    }

    /// Copy of self with switches happening strictly after `up_to` truncated.
    pub fn up_to(&self, up_to: Lsn) -> TermHistory {
        let mut res = Vec::with_capacity(self.0.len());
        for e in &self.0 {
            if e.lsn > up_to {
                break;
            }
            res.push(*e);
        }
        TermHistory(res)
    }

    /// Epoch is the term of the highest entry whose LSN is <= flush_lsn.
    pub fn epoch(&self, flush_lsn: Lsn) -> Term {
        match self.up_to(flush_lsn).0.last() {
            Some(e) => e.term,
            None => INVALID_TERM,
        }
    }

    /// Find the point of divergence between the proposer's (unbounded, "+infinity")
    /// term history and a voted acceptor's (bounded by its flush LSN) history.
    /// Returns `None` if the two share no common term prefix at all (the acceptor is
    /// empty or was never part of any term we recognize).
    pub fn find_highest_common_point(
        prop_th: &TermHistory,
        acc_th: &TermHistory,
        acc_flush_lsn: Lsn,
    ) -> Option<TermLsn> {
        let (prop_th, acc_th) = (&prop_th.0, &acc_th.0);

        if let Some(last) = acc_th.last() {
            assert!(
                last.lsn <= acc_flush_lsn,
                "acceptor term history end {:?} is higher than its flush LSN {:?}",
                last,
                acc_flush_lsn
            );
        }

        let mut last_common_idx = None;
        for i in 0..min(acc_th.len(), prop_th.len()) {
            if prop_th[i].term != acc_th[i].term {
                break;
            }
            assert!(
                prop_th[i].lsn == acc_th[i].lsn,
                "same term {} has different start LSNs: proposer {}, acceptor {}",
                prop_th[i].term,
                prop_th[i].lsn,
                acc_th[i].lsn
            );
            last_common_idx = Some(i);
        }
        let last_common_idx = last_common_idx?;

        if last_common_idx == prop_th.len() - 1 {
            Some(TermLsn {
                term: prop_th[last_common_idx].term,
                lsn: acc_flush_lsn,
            })
        } else {
            let prop_common_term_end = prop_th[last_common_idx + 1].lsn;
            let acc_common_term_end = if last_common_idx + 1 < acc_th.len() {
                acc_th[last_common_idx + 1].lsn
            } else {
                acc_flush_lsn
            };
            Some(TermLsn {
                term: prop_th[last_common_idx].term,
                lsn: min(prop_common_term_end, acc_common_term_end),
            })
        }
    }
}

impl fmt::Debug for TermHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n_printed = 20;
        write!(
            f,
            "{}{:?}",
            if self.0.len() > n_printed { "... " } else { "" },
            self.0
                .iter()
                .rev()
                .take(n_printed)
                .map(|&e| (e.term, e.lsn))
                .collect::<Vec<_>>()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let th = TermHistory(vec![(1, Lsn(10)).into(), (3, Lsn(100)).into()]);
        let mut buf = bytes::BytesMut::new();
        th.write_to(&mut buf);
        let mut frozen = buf.freeze();
        let parsed = TermHistory::from_bytes(&mut frozen).unwrap();
        assert!(parsed == th);
    }

    #[test]
    fn common_prefix_when_acceptor_empty() {
        let prop_th = TermHistory(vec![(1, Lsn(0)).into()]);
        let acc_th = TermHistory::empty();
        assert_eq!(
            TermHistory::find_highest_common_point(&prop_th, &acc_th, Lsn(0)),
            None
        );
    }

    #[test]
    fn common_prefix_stops_at_first_divergence() {
        let prop_th = TermHistory(vec![(1, Lsn(0)).into(), (3, Lsn(100)).into()]);
        let acc_th = TermHistory(vec![(1, Lsn(0)).into(), (2, Lsn(50)).into()]);
        let point = TermHistory::find_highest_common_point(&prop_th, &acc_th, Lsn(80)).unwrap();
        assert_eq!(point, TermLsn::from((1, Lsn(50))));
    }
}
