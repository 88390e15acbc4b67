//! Wire messages exchanged between the proposer and one acceptor, framed as individual
//! length-delimited payloads by the transport (see `walproposer::transport`). Integers
//! are little-endian; the one-byte tag is packed into 8 bytes to avoid padding, matching
//! the C struct layout this protocol descends from.

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::feedback::{HotStandbyFeedback, PageserverFeedback};
use crate::ids::{NodeId, ProposerId, TenantId, TimelineId};
use crate::lsn::Lsn;
use crate::term::{Term, TermHistory};

pub const SYSTEM_ID_UNKNOWN: u64 = 0;

/// Initial Proposer -> Acceptor message.
#[derive(Debug, Clone)]
pub struct ProposerGreeting {
    pub protocol_version: u32,
    pub pg_version: u32,
    pub proposer_id: ProposerId,
    pub system_id: u64,
    pub timeline_id: TimelineId,
    pub tenant_id: TenantId,
    pub timeline_ordinal: u32,
    pub wal_seg_size: u32,
}

impl ProposerGreeting {
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u64_le(b'g' as u64);
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.pg_version);
        buf.put_slice(&self.proposer_id.as_bytes());
        buf.put_u64_le(self.system_id);
        buf.put_slice(&self.timeline_id.as_bytes());
        buf.put_slice(&self.tenant_id.as_bytes());
        buf.put_u32_le(self.timeline_ordinal);
        buf.put_u32_le(self.wal_seg_size);
    }
}

/// Vote request sent from proposer to an acceptor.
#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub term: Term,
    pub proposer_id: ProposerId,
}

impl VoteRequest {
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u64_le(b'v' as u64);
        buf.put_u64_le(self.term);
        buf.put_slice(&self.proposer_id.as_bytes());
    }
}

/// Proposer -> Acceptor message announcing election and communicating term history.
#[derive(Debug, Clone)]
pub struct ProposerElected {
    pub term: Term,
    pub start_streaming_at: Lsn,
    pub term_history: TermHistory,
    pub timeline_start_lsn: Lsn,
}

impl ProposerElected {
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u64_le(b'e' as u64);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.start_streaming_at.into());
        self.term_history.write_to(buf);
        buf.put_u64_le(self.timeline_start_lsn.into());
    }
}

/// Header of an `AppendRequest`; the raw WAL bytes for `[begin_lsn, end_lsn)` follow.
#[derive(Debug, Clone)]
pub struct AppendRequestHeader {
    pub term: Term,
    pub epoch_start_lsn: Lsn,
    pub begin_lsn: Lsn,
    pub end_lsn: Lsn,
    pub commit_lsn: Lsn,
    pub truncate_lsn: Lsn,
    pub proposer_id: ProposerId,
}

impl AppendRequestHeader {
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u64_le(b'a' as u64);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.epoch_start_lsn.into());
        buf.put_u64_le(self.begin_lsn.into());
        buf.put_u64_le(self.end_lsn.into());
        buf.put_u64_le(self.commit_lsn.into());
        buf.put_u64_le(self.truncate_lsn.into());
        buf.put_slice(&self.proposer_id.as_bytes());
    }
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub h: AppendRequestHeader,
    pub wal_data: Bytes,
}

impl AppendRequest {
    pub fn write_to(&self, buf: &mut BytesMut) {
        self.h.write_to(buf);
        buf.put_slice(&self.wal_data);
    }
}

/// Proposer -> Acceptor messages, as produced by this crate.
#[derive(Debug, Clone)]
pub enum ProposerAcceptorMessage {
    Greeting(ProposerGreeting),
    VoteRequest(VoteRequest),
    Elected(ProposerElected),
    AppendRequest(AppendRequest),
}

impl ProposerAcceptorMessage {
    pub fn write_to(&self, buf: &mut BytesMut) {
        match self {
            ProposerAcceptorMessage::Greeting(m) => m.write_to(buf),
            ProposerAcceptorMessage::VoteRequest(m) => m.write_to(buf),
            ProposerAcceptorMessage::Elected(m) => m.write_to(buf),
            ProposerAcceptorMessage::AppendRequest(m) => m.write_to(buf),
        }
    }
}

/// Acceptor -> Proposer initial response: the highest term it has voted for.
#[derive(Debug, Clone)]
pub struct AcceptorGreeting {
    pub term: Term,
    pub node_id: NodeId,
}

/// Vote itself, sent from an acceptor to the proposer.
#[derive(Debug, Clone)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_given: bool,
    pub flush_lsn: Lsn,
    pub truncate_lsn: Lsn,
    pub term_history: TermHistory,
    pub timeline_start_lsn: Lsn,
}

/// Report of acceptor state after processing an `AppendRequest` (or as a standalone
/// heartbeat ack).
#[derive(Debug, Clone)]
pub struct AppendResponse {
    pub term: Term,
    pub flush_lsn: Lsn,
    pub commit_lsn: Lsn,
    pub hs_feedback: HotStandbyFeedback,
    pub pageserver_feedback: PageserverFeedback,
}

/// Acceptor -> Proposer messages, as consumed by this crate.
#[derive(Debug, Clone)]
pub enum AcceptorProposerMessage {
    Greeting(AcceptorGreeting),
    VoteResponse(VoteResponse),
    AppendResponse(AppendResponse),
}

impl AcceptorProposerMessage {
    /// Parse one complete message out of `bytes` (a single already-framed payload).
    pub fn parse(mut bytes: Bytes) -> Result<AcceptorProposerMessage> {
        if bytes.remaining() < 8 {
            bail!("message misses tag");
        }
        let tag = bytes.get_u64_le() as u8 as char;
        match tag {
            'g' => {
                if bytes.remaining() < 16 {
                    bail!("AcceptorGreeting is incomplete");
                }
                let term = bytes.get_u64_le();
                let node_id = NodeId(bytes.get_u64_le());
                Ok(AcceptorProposerMessage::Greeting(AcceptorGreeting {
                    term,
                    node_id,
                }))
            }
            'v' => {
                if bytes.remaining() < 32 {
                    bail!("VoteResponse is incomplete");
                }
                let term = bytes.get_u64_le();
                let vote_given = bytes.get_u64_le() != 0;
                let flush_lsn = bytes.get_u64_le().into();
                let truncate_lsn = bytes.get_u64_le().into();
                let term_history = TermHistory::from_bytes(&mut bytes)
                    .context("parsing VoteResponse term history")?;
                if bytes.remaining() < 8 {
                    bail!("VoteResponse misses timeline_start_lsn");
                }
                let timeline_start_lsn = bytes.get_u64_le().into();
                Ok(AcceptorProposerMessage::VoteResponse(VoteResponse {
                    term,
                    vote_given,
                    flush_lsn,
                    truncate_lsn,
                    term_history,
                    timeline_start_lsn,
                }))
            }
            'a' => {
                if bytes.remaining() < 48 {
                    bail!("AppendResponse is incomplete");
                }
                let term = bytes.get_u64_le();
                let flush_lsn = bytes.get_u64_le().into();
                let commit_lsn = bytes.get_u64_le().into();
                let hs_feedback = HotStandbyFeedback::from_bytes(&mut bytes)
                    .context("parsing hot standby feedback")?;
                let pageserver_feedback = PageserverFeedback::from_bytes(&mut bytes)
                    .context("parsing pageserver feedback")?;
                Ok(AcceptorProposerMessage::AppendResponse(AppendResponse {
                    term,
                    flush_lsn,
                    commit_lsn,
                    hs_feedback,
                    pageserver_feedback,
                }))
            }
            other => bail!("unknown acceptor-proposer message tag: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proposer_id() -> ProposerId {
        ProposerId::from([7u8; 16])
    }

    #[test]
    fn append_request_round_trips() {
        let req = AppendRequest {
            h: AppendRequestHeader {
                term: 6,
                epoch_start_lsn: Lsn(0x100),
                begin_lsn: Lsn(0x100),
                end_lsn: Lsn(0x200),
                commit_lsn: Lsn(0x100),
                truncate_lsn: Lsn(0x100),
                proposer_id: sample_proposer_id(),
            },
            wal_data: Bytes::from_static(b"hello wal"),
        };
        let mut buf = BytesMut::new();
        req.write_to(&mut buf);
        // AppendRequest has no acceptor-side parser in this crate (acceptors are out of
        // scope), but the header tag and field order must match what AppendResponse
        // parsing expects elsewhere, so just check the encode doesn't panic and has the
        // right shape.
        assert_eq!(buf.len(), 8 + 8 * 6 + 16 + req.wal_data.len());
    }

    #[test]
    fn vote_response_round_trips_via_manual_encode() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(b'v' as u64);
        buf.put_u64_le(6); // term
        buf.put_u64_le(1); // vote_given
        buf.put_u64_le(0x500); // flush_lsn
        buf.put_u64_le(0x100); // truncate_lsn
        TermHistory(vec![(5, Lsn(0x100)).into()]).write_to(&mut buf);
        buf.put_u64_le(0x10); // timeline_start_lsn

        let msg = AcceptorProposerMessage::parse(buf.freeze()).unwrap();
        match msg {
            AcceptorProposerMessage::VoteResponse(vr) => {
                assert_eq!(vr.term, 6);
                assert!(vr.vote_given);
                assert_eq!(vr.flush_lsn, Lsn(0x500));
                assert_eq!(vr.term_history.0.len(), 1);
            }
            _ => panic!("expected VoteResponse"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(b'z' as u64);
        assert!(AcceptorProposerMessage::parse(buf.freeze()).is_err());
    }
}
