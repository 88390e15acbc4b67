//! Per-acceptor connection state machine (spec §4.3). One `Acceptor` owns one TCP
//! connection and walks Offline -> ConnectingWrite -> WaitExecResult -> HandshakeRecv
//! -> Voting -> WaitVerdict -> SendElectedFlush -> Idle/Active, reconnecting to Offline
//! on any transport error. `proposer.rs` owns the `Vec<Acceptor>` and reacts to the
//! events this module hands back; this module never makes cross-acceptor decisions.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::BytesMut;
use tracing::{debug, warn};
use walproposer_api::proto::{
    AcceptorGreeting, AcceptorProposerMessage, AppendResponse, ProposerElected, ProposerGreeting,
    VoteRequest, VoteResponse,
};
use walproposer_api::Lsn;

use crate::error::TransportError;
use crate::event_loop::Interest;
use crate::transport::{Connection, ConnectPoll, ExecResult, FlushOutcome, ReadOutcome, WriteOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Offline,
    ConnectingWrite,
    WaitExecResult,
    HandshakeRecv,
    Voting,
    WaitVerdict,
    SendElectedFlush,
    Idle,
    Active,
}

/// What happened on this acceptor's connection during one `advance` call.
pub enum Event {
    None,
    Greeting(AcceptorGreeting),
    VoteResponse(VoteResponse),
    AppendResponse(AppendResponse),
    /// The connection dropped or failed; state is already back to `Offline`.
    WentOffline,
}

pub struct Acceptor {
    pub index: usize,
    pub addr: SocketAddr,
    pub state: State,
    pub last_msg_at: Instant,
    pub last_connect_attempt: Option<Instant>,
    pub flush_lsn: Lsn,
    pub streaming_at: Lsn,
    pub start_streaming_at: Lsn,
    conn: Option<Connection>,
}

impl Acceptor {
    pub fn new(index: usize, addr: SocketAddr) -> Acceptor {
        Acceptor {
            index,
            addr,
            state: State::Offline,
            last_msg_at: Instant::now(),
            last_connect_attempt: None,
            flush_lsn: Lsn::INVALID,
            streaming_at: Lsn::INVALID,
            start_streaming_at: Lsn::INVALID,
            conn: None,
        }
    }

    pub fn is_offline(&self) -> bool {
        self.state == State::Offline
    }

    pub fn is_voting(&self) -> bool {
        self.state == State::WaitVerdict
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, State::Idle | State::Active)
    }

    /// The readiness this acceptor needs registered for its current state.
    pub fn interest(&self) -> Interest {
        match self.state {
            State::Offline => Interest::Read,
            State::ConnectingWrite => Interest::ReadWrite,
            State::SendElectedFlush => Interest::ReadWrite,
            State::Active => Interest::ReadWrite,
            State::WaitExecResult
            | State::HandshakeRecv
            | State::Voting
            | State::WaitVerdict
            | State::Idle => Interest::Read,
        }
    }

    pub fn socket(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }

    /// Whether a previous write is still draining; while true, no further append should
    /// be queued until the event loop reports writability again (spec §4.5).
    pub fn has_pending_write(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.has_pending_write())
    }

    /// Begin a fresh connection attempt (spec §4.3 reconnect supervisor).
    pub fn start_connect(&mut self) -> Result<(), TransportError> {
        let conn = Connection::connect_start(self.addr)?;
        self.conn = Some(conn);
        self.state = State::ConnectingWrite;
        self.last_connect_attempt = Some(Instant::now());
        self.last_msg_at = Instant::now();
        Ok(())
    }

    /// Tear the connection down and return to `Offline`; a reconnect is attempted on
    /// the next reconnect-timeout tick.
    pub fn reset_connection(&mut self) {
        self.conn = None;
        self.state = State::Offline;
    }

    /// Drive the state machine one step based on what the event loop reported ready.
    /// Greeting/vote/election messages bubble up as `Event`; the caller owns the
    /// cross-acceptor decisions (term selection, quorum, donor choice).
    pub fn advance(&mut self, greeting: &ProposerGreeting) -> Event {
        match self.state {
            State::Offline => Event::None,
            State::ConnectingWrite => match self.conn.as_ref().unwrap().connect_poll() {
                ConnectPoll::Connected => {
                    let conn = self.conn.as_mut().unwrap();
                    if let Err(e) = conn.send_query() {
                        return self.fail(e);
                    }
                    self.state = State::WaitExecResult;
                    Event::None
                }
                ConnectPoll::NeedRead | ConnectPoll::NeedWrite => Event::None,
                ConnectPoll::Failed(e) => self.fail(e),
            },
            State::WaitExecResult => match self.conn.as_mut().unwrap().get_query_result() {
                ExecResult::CopyBothOk => {
                    let mut buf = BytesMut::new();
                    greeting.write_to(&mut buf);
                    if !self.conn.as_mut().unwrap().blocking_write_framed(&buf) {
                        return self.fail(TransportError::Io(std::io::Error::other(
                            "short write sending proposer greeting",
                        )));
                    }
                    self.state = State::HandshakeRecv;
                    Event::None
                }
                ExecResult::NeedInput => Event::None,
                ExecResult::UnexpectedOk => {
                    self.fail(TransportError::Protocol("handshake ack not recognized".into()))
                }
                ExecResult::Failed(e) => self.fail(e),
            },
            State::HandshakeRecv => self.read_message(|event, msg| match msg {
                AcceptorProposerMessage::Greeting(g) => {
                    event.state = State::WaitVerdict;
                    Event::Greeting(g)
                }
                other => event.protocol_mismatch("AcceptorGreeting", &other),
            }),
            State::Voting => self.read_message(|event, msg| match msg {
                AcceptorProposerMessage::VoteResponse(vr) => {
                    event.state = State::WaitVerdict;
                    Event::VoteResponse(vr)
                }
                other => event.protocol_mismatch("VoteResponse", &other),
            }),
            State::WaitVerdict => {
                self.read_message(|event, msg| event.protocol_mismatch("<nothing, waiting for election verdict>", &msg))
            }
            State::SendElectedFlush => match self.conn.as_mut().unwrap().flush() {
                FlushOutcome::Complete => {
                    self.state = State::Idle;
                    Event::None
                }
                FlushOutcome::Partial => Event::None,
                FlushOutcome::Failed(e) => self.fail(e),
            },
            State::Idle => self.read_message(|event, msg| match msg {
                AcceptorProposerMessage::AppendResponse(ar) => {
                    event.flush_lsn = ar.flush_lsn;
                    Event::AppendResponse(ar)
                }
                other => event.protocol_mismatch("AppendResponse", &other),
            }),
            State::Active => {
                match self.try_flush_pending() {
                    Some(FlushOutcome::Complete) | None => self.state = State::Idle,
                    Some(FlushOutcome::Partial) => {}
                    Some(FlushOutcome::Failed(e)) => return self.fail(e),
                }
                self.read_message(|event, msg| match msg {
                    AcceptorProposerMessage::AppendResponse(ar) => {
                        event.flush_lsn = ar.flush_lsn;
                        Event::AppendResponse(ar)
                    }
                    other => event.protocol_mismatch("AppendResponse", &other),
                })
            }
        }
    }

    fn try_flush_pending(&mut self) -> Option<FlushOutcome> {
        let conn = self.conn.as_mut()?;
        if !conn.has_pending_write() {
            return None;
        }
        Some(conn.flush())
    }

    fn read_message(&mut self, on_msg: impl FnOnce(&mut Self, AcceptorProposerMessage) -> Event) -> Event {
        match self.conn.as_mut().unwrap().async_read() {
            ReadOutcome::ReadOk(bytes) => {
                self.last_msg_at = Instant::now();
                match AcceptorProposerMessage::parse(bytes) {
                    Ok(msg) => on_msg(self, msg),
                    Err(e) => self.fail(TransportError::Protocol(e.to_string())),
                }
            }
            ReadOutcome::TryAgain => Event::None,
            ReadOutcome::Failed(e) => self.fail(e),
        }
    }

    fn protocol_mismatch(&mut self, expected: &str, got: &AcceptorProposerMessage) -> Event {
        let got_desc = match got {
            AcceptorProposerMessage::Greeting(_) => "Greeting",
            AcceptorProposerMessage::VoteResponse(_) => "VoteResponse",
            AcceptorProposerMessage::AppendResponse(_) => "AppendResponse",
        };
        self.fail(TransportError::Protocol(format!(
            "expected {expected}, got {got_desc}"
        )))
    }

    fn fail(&mut self, e: TransportError) -> Event {
        warn!(acceptor = self.index, error = %e, "acceptor connection failed");
        self.reset_connection();
        Event::WentOffline
    }

    /// Send the vote request once the cluster-wide term has been decided (spec §4.4).
    pub fn send_vote_request(&mut self, req: &VoteRequest) -> Result<(), TransportError> {
        let mut buf = BytesMut::new();
        req.write_to(&mut buf);
        if !self.conn.as_mut().unwrap().blocking_write_framed(&buf) {
            return Err(TransportError::Io(std::io::Error::other(
                "short write sending vote request",
            )));
        }
        self.state = State::Voting;
        Ok(())
    }

    /// Broadcast the election verdict (spec §4.4 final step) and arm streaming from
    /// `start_streaming_at`.
    pub fn send_elected(&mut self, msg: &ProposerElected) -> Result<(), TransportError> {
        let mut buf = BytesMut::new();
        msg.write_to(&mut buf);
        self.streaming_at = msg.start_streaming_at;
        self.start_streaming_at = msg.start_streaming_at;
        match self.conn.as_mut().unwrap().async_write(&buf) {
            WriteOutcome::Ok => {
                self.state = State::Idle;
                Ok(())
            }
            WriteOutcome::TryFlush => {
                self.state = State::SendElectedFlush;
                Ok(())
            }
            WriteOutcome::Failed(e) => {
                self.fail(e);
                Err(TransportError::Eof)
            }
        }
    }

    /// Queue an append request (spec §4.5); may leave the socket with a partial write
    /// pending, moving to `Active` so the event loop watches for writability.
    pub fn send_append(&mut self, payload: &[u8], new_streaming_at: Lsn) -> Result<(), TransportError> {
        match self.conn.as_mut().unwrap().async_write(payload) {
            WriteOutcome::Ok => {
                self.streaming_at = new_streaming_at;
                debug!(acceptor = self.index, lsn = ?new_streaming_at, "sent append request");
                Ok(())
            }
            WriteOutcome::TryFlush => {
                self.streaming_at = new_streaming_at;
                self.state = State::Active;
                Ok(())
            }
            WriteOutcome::Failed(e) => {
                self.fail(e);
                Err(TransportError::Eof)
            }
        }
    }
}
