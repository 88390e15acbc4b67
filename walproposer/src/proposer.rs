//! Top-level orchestration (spec §4.1): owns every acceptor connection, the election
//! and streaming state, and the single `epoll` event loop. This is the one place that
//! makes cross-acceptor decisions; `acceptor.rs` only knows about its own socket.

use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use walproposer_api::proto::{ProposerElected, ProposerGreeting, VoteRequest};
use walproposer_api::{Lsn, NodeId, Term};

use crate::acceptor::{self, Acceptor};
use crate::config::Config;
use crate::election::{self, Ballot};
use crate::error::FatalError;
use crate::event_loop::{Dispatch, EventLoop};
use crate::state::{ProposerState, SharedState};
use crate::streaming;
use crate::wal::WalSource;

const PROTOCOL_VERSION: u32 = 2;

/// How long quorum can go without any broadcast before we force a zero-length
/// heartbeat append (spec §4.1 step 4), so acceptors keep acking and
/// `commitLsn` keeps advancing even when the host produces no new WAL.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub struct Proposer {
    config: Config,
    wal: Box<dyn WalSource>,
    shared: std::sync::Arc<SharedState>,
    event_loop: EventLoop,
    acceptors: Vec<Acceptor>,
    state: ProposerState,
    greeting: ProposerGreeting,
    votes_seen: Vec<Option<Term>>,
    term_decided: bool,
    ballots: Vec<Option<Ballot>>,
    elected: bool,
    last_broadcast_at: Instant,
}

impl Proposer {
    pub fn new(
        config: Config,
        wal: Box<dyn WalSource>,
        shared: std::sync::Arc<SharedState>,
    ) -> anyhow::Result<Proposer> {
        let n = config.n_safekeepers();
        let mut acceptors = Vec::with_capacity(n);
        for (i, sk) in config.safekeepers.iter().enumerate() {
            let addr = sk
                .to_socket_addrs()
                .map_err(|e| anyhow::anyhow!("resolving safekeeper {sk}: {e}"))?
                .next()
                .ok_or_else(|| anyhow::anyhow!("safekeeper {sk} resolved to no addresses"))?;
            acceptors.push(Acceptor::new(i, addr));
        }

        let greeting = ProposerGreeting {
            protocol_version: PROTOCOL_VERSION,
            pg_version: 0,
            proposer_id: config.proposer_id,
            system_id: config.system_id,
            timeline_id: config.timeline_id,
            tenant_id: config.tenant_id,
            timeline_ordinal: 0,
            wal_seg_size: config.wal_segment_size,
        };

        let quorum = config.quorum;
        Ok(Proposer {
            event_loop: EventLoop::new(n)?,
            votes_seen: vec![None; n],
            ballots: (0..n).map(|_| None).collect(),
            acceptors,
            state: ProposerState::new(quorum),
            greeting,
            config,
            wal,
            shared,
            term_decided: false,
            elected: false,
            last_broadcast_at: Instant::now(),
        })
    }

    /// Run until a fatal error occurs, or (in `sync_safekeepers` mode) until a quorum
    /// has durably acknowledged the new epoch's start LSN.
    pub fn run(&mut self) -> Result<(), FatalError> {
        for i in 0..self.acceptors.len() {
            self.try_connect(i);
        }

        loop {
            let timeout = self.next_timeout();
            let dispatches = self
                .event_loop
                .wait(timeout)
                .map_err(|e| FatalError::EventLoopFailed(e.to_string()))?;

            for d in dispatches {
                match d {
                    Dispatch::Woken => self.on_wal_available()?,
                    Dispatch::Acceptor { index, .. } => self.on_acceptor_ready(index)?,
                    Dispatch::Timeout => {}
                }
            }

            self.run_reconnect_supervisor();
            self.run_inactivity_timeouts();

            if self.elected {
                self.send_pending_wal()?;
                if Instant::now().duration_since(self.last_broadcast_at) >= HEARTBEAT_INTERVAL {
                    self.send_heartbeat();
                }
            }

            if self.config.sync_safekeepers && self.sync_safekeepers_done() {
                info!("sync_safekeepers: quorum reached epoch start lsn, exiting");
                return Ok(());
            }
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        if self.config.safekeeper_reconnect_timeout.is_zero() {
            Some(HEARTBEAT_INTERVAL)
        } else {
            Some(self.config.safekeeper_reconnect_timeout.min(HEARTBEAT_INTERVAL))
        }
    }

    fn try_connect(&mut self, index: usize) {
        crate::metrics::RECONNECTS_TOTAL.inc();
        let a = &mut self.acceptors[index];
        match a.start_connect() {
            Ok(()) => {
                if let Err(e) = self.event_loop.register(a.socket().unwrap(), index, a.interest()) {
                    warn!(acceptor = index, error = %e, "failed to register acceptor socket");
                    a.reset_connection();
                }
            }
            Err(e) => warn!(acceptor = index, error = %e, "connect failed immediately"),
        }
    }

    fn run_reconnect_supervisor(&mut self) {
        if self.config.safekeeper_reconnect_timeout.is_zero() {
            return;
        }
        let now = Instant::now();
        for i in 0..self.acceptors.len() {
            let due = match self.acceptors[i].last_connect_attempt {
                None => true,
                Some(t) => {
                    self.acceptors[i].is_offline()
                        && now.duration_since(t) >= self.config.safekeeper_reconnect_timeout
                }
            };
            if self.acceptors[i].is_offline() && due {
                self.try_connect(i);
            }
        }
    }

    fn run_inactivity_timeouts(&mut self) {
        let now = Instant::now();
        for i in 0..self.acceptors.len() {
            let a = &mut self.acceptors[i];
            if !a.is_offline()
                && now.duration_since(a.last_msg_at) >= self.config.safekeeper_connection_timeout
            {
                warn!(acceptor = i, was_voting = a.is_voting(), "inactivity timeout, resetting connection");
                a.reset_connection();
            }
        }
    }

    fn on_acceptor_ready(&mut self, index: usize) -> Result<(), FatalError> {
        let greeting = self.greeting.clone();
        let event = self.acceptors[index].advance(&greeting);
        if let Some(sock) = self.acceptors[index].socket() {
            let interest = self.acceptors[index].interest();
            let _ = self.event_loop.reregister(sock, index, interest);
        }
        self.handle_event(index, event)
    }

    fn handle_event(&mut self, index: usize, event: acceptor::Event) -> Result<(), FatalError> {
        match event {
            acceptor::Event::None => Ok(()),
            acceptor::Event::WentOffline => {
                // The connection (and its fd) is already gone; the kernel drops the
                // epoll registration along with it, nothing left to deregister.
                Ok(())
            }
            acceptor::Event::Greeting(g) => {
                self.votes_seen[index] = Some(g.term);
                if self.term_decided {
                    self.request_vote(index, self.state.prop_term);
                } else {
                    self.maybe_decide_term();
                }
                Ok(())
            }
            acceptor::Event::VoteResponse(vr) => self.on_vote_response(index, vr),
            acceptor::Event::AppendResponse(ar) => {
                if ar.term > self.state.prop_term {
                    return Err(FatalError::HigherTermSeen {
                        ours: self.state.prop_term,
                        observed: ar.term,
                    });
                }
                self.shared.update_feedback(&ar.pageserver_feedback);
                self.recompute_commit_and_truncate();
                Ok(())
            }
        }
    }

    fn maybe_decide_term(&mut self) {
        let known: Vec<Term> = self.votes_seen.iter().filter_map(|t| *t).collect();
        if known.len() < self.config.quorum {
            return;
        }
        let prop_term = known.into_iter().max().unwrap_or(0) + 1;
        self.state.prop_term = prop_term;
        self.term_decided = true;
        info!(term = prop_term, "term decided, requesting votes");
        for i in 0..self.acceptors.len() {
            if self.votes_seen[i].is_some() {
                self.request_vote(i, prop_term);
            }
        }
    }

    fn request_vote(&mut self, index: usize, term: Term) {
        let req = VoteRequest {
            term,
            proposer_id: self.config.proposer_id,
        };
        if let Err(e) = self.acceptors[index].send_vote_request(&req) {
            warn!(acceptor = index, error = %e, "failed to send vote request");
        } else if let Some(sock) = self.acceptors[index].socket() {
            let interest = self.acceptors[index].interest();
            let _ = self.event_loop.reregister(sock, index, interest);
        }
    }

    fn on_vote_response(&mut self, index: usize, vr: walproposer_api::proto::VoteResponse) -> Result<(), FatalError> {
        if vr.term > self.state.prop_term {
            return Err(FatalError::HigherTermSeen {
                ours: self.state.prop_term,
                observed: vr.term,
            });
        }
        if !vr.vote_given {
            return Err(FatalError::VoteRejected { term: self.state.prop_term });
        }
        self.ballots[index] = Some(Ballot {
            index,
            flush_lsn: vr.flush_lsn,
            truncate_lsn: vr.truncate_lsn,
            term_history: vr.term_history,
            timeline_start_lsn: vr.timeline_start_lsn,
        });

        if !self.elected {
            let count = self.ballots.iter().filter(|b| b.is_some()).count();
            if count >= self.config.quorum {
                self.elect(index)?;
            }
        } else {
            // Late voter after election already happened: send it the verdict too.
            self.send_elected_to(index)?;
        }
        Ok(())
    }

    fn elect(&mut self, _just_voted: usize) -> Result<(), FatalError> {
        let ballots: Vec<Ballot> = self.ballots.iter().filter_map(|b| b.clone()).collect();
        let decision = election::determine_epoch_start_lsn(&ballots);

        let (epoch_start_lsn, truncate_lsn) = election::apply_bootstrap_clause(
            decision.epoch_start_lsn,
            decision.truncate_lsn,
            self.config.sync_safekeepers,
            self.wal.redo_start_lsn(),
        );

        if decision.timeline_start_lsn_mismatch {
            crate::metrics::TIMELINE_START_LSN_MISMATCHES.inc();
        }

        let donor = ballots
            .iter()
            .find(|b| b.index == decision.donor_index)
            .expect("donor_index refers to a ballot we just collected");
        // sync_safekeepers bootstraps the acceptor set without a real basebackup, so
        // there is nothing meaningful for `redo_start_lsn()` to agree with here.
        if !self.config.sync_safekeepers {
            election::cross_check_redo_start_lsn(
                epoch_start_lsn,
                self.wal.redo_start_lsn(),
                self.config.wal_segment_size,
                &donor.term_history,
                self.shared.mine_last_elected_term(),
            )
            .map_err(|(epoch, redo)| FatalError::BasebackupLsnMismatch {
                basebackup: redo.into(),
                epoch_start: epoch.into(),
            })?;
        }

        let prop_term_history =
            election::build_proposer_term_history(&donor.term_history, self.state.prop_term, epoch_start_lsn);

        self.state.prop_term_history = prop_term_history;
        self.state.prop_epoch_start_lsn = epoch_start_lsn;
        self.state.truncate_lsn = truncate_lsn;
        self.state.last_sent_commit_lsn = epoch_start_lsn;
        self.state.timeline_start_lsn = decision.timeline_start_lsn;
        self.state.donor = Some(NodeId(decision.donor_index as u64));
        self.state.donor_epoch = decision.donor_epoch;
        self.state.n_votes = ballots.len();
        self.elected = true;

        self.shared
            .record_elected(self.state.prop_term)
            .map_err(|e| FatalError::StatePersistFailed(e.to_string()))?;
        crate::metrics::CURRENT_TERM.set(self.state.prop_term as i64);

        info!(
            term = self.state.prop_term,
            epoch_start = ?epoch_start_lsn,
            donor = decision.donor_index,
            "elected"
        );

        let voted_indices: Vec<usize> = self
            .ballots
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|_| i))
            .collect();
        for i in voted_indices {
            self.send_elected_to(i)?;
        }
        Ok(())
    }

    fn send_elected_to(&mut self, index: usize) -> Result<(), FatalError> {
        let ballot = match &self.ballots[index] {
            Some(b) => b.clone(),
            None => return Ok(()),
        };
        let start_streaming_at = election::start_streaming_at(
            &self.state.prop_term_history,
            &ballot.term_history,
            ballot.flush_lsn,
            self.state.truncate_lsn,
        );
        let msg = ProposerElected {
            term: self.state.prop_term,
            start_streaming_at,
            term_history: self.state.prop_term_history.clone(),
            timeline_start_lsn: self.state.timeline_start_lsn,
        };
        if let Err(e) = self.acceptors[index].send_elected(&msg) {
            warn!(acceptor = index, error = %e, "failed to send election verdict");
        } else if let Some(sock) = self.acceptors[index].socket() {
            let interest = self.acceptors[index].interest();
            let _ = self.event_loop.reregister(sock, index, interest);
        }
        Ok(())
    }

    fn on_wal_available(&mut self) -> Result<(), FatalError> {
        self.state.available_lsn = self.wal.flush_lsn();
        self.send_pending_wal()
    }

    fn send_pending_wal(&mut self) -> Result<(), FatalError> {
        let available = self.wal.flush_lsn();
        self.state.available_lsn = available;
        let commit_lsn = self.state.last_sent_commit_lsn;
        let truncate_lsn = self.state.truncate_lsn;
        let term = self.state.prop_term;
        let epoch_start_lsn = self.state.prop_epoch_start_lsn;
        let proposer_id = self.config.proposer_id;

        for i in 0..self.acceptors.len() {
            if !self.acceptors[i].is_streaming() {
                continue;
            }
            // Drain everything produced so far in MAX_SEND_SIZE chunks (spec §4.5: "loop
            // while streamingAt < availableLsn"); stop only once caught up or the socket
            // pushes back with a partial write, never after a single chunk.
            loop {
                let begin = self.acceptors[i].streaming_at;
                let Some((begin, end)) = streaming::next_send_range(begin, available) else {
                    break;
                };
                let req = match streaming::build_append_request(
                    self.wal.as_ref(),
                    proposer_id,
                    term,
                    epoch_start_lsn,
                    begin,
                    end,
                    commit_lsn,
                    truncate_lsn,
                ) {
                    Ok(req) => req,
                    Err(e) => {
                        warn!(acceptor = i, error = %e, "failed reading wal to stream");
                        break;
                    }
                };
                let mut buf = bytes::BytesMut::new();
                req.write_to(&mut buf);
                if let Err(e) = self.acceptors[i].send_append(&buf, end) {
                    warn!(acceptor = i, error = %e, "failed sending append request");
                    break;
                }
                self.last_broadcast_at = Instant::now();
                if let Some(sock) = self.acceptors[i].socket() {
                    let interest = self.acceptors[i].interest();
                    let _ = self.event_loop.reregister(sock, i, interest);
                }
                if self.acceptors[i].has_pending_write() {
                    break;
                }
            }
        }
        self.recompute_commit_and_truncate();
        Ok(())
    }

    /// Force a zero-length append to every streaming acceptor so acks (and therefore
    /// quorum commit) keep progressing during a quiet period (spec §4.1 step 4).
    fn send_heartbeat(&mut self) {
        let commit_lsn = self.state.last_sent_commit_lsn;
        let truncate_lsn = self.state.truncate_lsn;
        let term = self.state.prop_term;
        let epoch_start_lsn = self.state.prop_epoch_start_lsn;
        let proposer_id = self.config.proposer_id;

        for i in 0..self.acceptors.len() {
            if !self.acceptors[i].is_streaming() {
                continue;
            }
            let at = self.acceptors[i].streaming_at;
            let req = match streaming::build_append_request(
                self.wal.as_ref(),
                proposer_id,
                term,
                epoch_start_lsn,
                at,
                at,
                commit_lsn,
                truncate_lsn,
            ) {
                Ok(req) => req,
                Err(e) => {
                    warn!(acceptor = i, error = %e, "failed building heartbeat append");
                    continue;
                }
            };
            let mut buf = bytes::BytesMut::new();
            req.write_to(&mut buf);
            if let Err(e) = self.acceptors[i].send_append(&buf, at) {
                warn!(acceptor = i, error = %e, "failed sending heartbeat append");
            } else if let Some(sock) = self.acceptors[i].socket() {
                let interest = self.acceptors[i].interest();
                let _ = self.event_loop.reregister(sock, i, interest);
            }
        }
        self.last_broadcast_at = Instant::now();
    }

    fn recompute_commit_and_truncate(&mut self) {
        if !self.elected {
            return;
        }
        let flush_lsns: Vec<Lsn> = self
            .acceptors
            .iter()
            .filter(|a| a.is_streaming())
            .map(|a| a.flush_lsn)
            .collect();
        self.state.n_connected = flush_lsns.len();
        crate::metrics::CONNECTED_ACCEPTORS.set(self.state.n_connected as i64);
        let commit = streaming::quorum_commit_lsn(&flush_lsns, self.state.prop_epoch_start_lsn, self.config.quorum);
        if commit.is_valid() {
            self.state.last_sent_commit_lsn = commit.max(self.state.last_sent_commit_lsn);
        }
        self.state.truncate_lsn =
            streaming::next_truncate_lsn(self.state.truncate_lsn, &flush_lsns, self.state.last_sent_commit_lsn);
        crate::metrics::set_commit_lsn(self.state.last_sent_commit_lsn);
        crate::metrics::set_truncate_lsn(self.state.truncate_lsn);
        self.shared.update_backpressure_lag(self.state.available_lsn);
        crate::metrics::BACKPRESSURE_LAG.set(self.shared.backpressure_lag() as i64);
        crate::metrics::set_pageserver_feedback(&self.shared.feedback_snapshot());
    }

    fn sync_safekeepers_done(&self) -> bool {
        self.elected && self.state.last_sent_commit_lsn >= self.state.prop_epoch_start_lsn
    }
}
