//! Single-threaded cooperative event loop (spec §4.1, §9 design note). One `epoll` set
//! holds a wake latch ("new WAL available") plus one registration per non-offline
//! acceptor; membership changes rebuild the whole set rather than surgically
//! deregistering a single connection, a deliberate simplification the spec calls out.

use std::os::unix::io::AsRawFd;
use std::time::Duration;

use queen_io::epoll::{Epoll, EpollOpt, Events, Ready, Token};
use queen_io::waker::Waker;

/// Readiness demanded from an acceptor's socket: read-only, or read+write once it has
/// data to send or is mid-connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    ReadWrite,
}

impl Interest {
    fn to_ready(self) -> Ready {
        match self {
            Interest::Read => Ready::readable(),
            Interest::ReadWrite => Ready::readable() | Ready::writable(),
        }
    }
}

/// Reserved token identifying the wake latch; acceptor tokens start at 1.
pub const WAKE_TOKEN: Token = Token(0);

pub enum Dispatch {
    /// New WAL is available; the caller should re-check `flush_lsn()` before waiting
    /// again.
    Woken,
    /// Acceptor at this index (`token.0 - 1`) became ready.
    Acceptor { index: usize, readiness: Ready },
    /// Nothing fired before the timeout elapsed.
    Timeout,
}

/// Wraps the epoll set and wake latch; callers register/deregister per-acceptor
/// sources and call `wait` once per poll cycle (spec §4.1 step 2).
pub struct EventLoop {
    epoll: Epoll,
    events: Events,
    waker: Waker,
}

impl EventLoop {
    pub fn new(capacity: usize) -> std::io::Result<EventLoop> {
        let epoll = Epoll::new()?;
        let waker = Waker::new()?;
        epoll.add(&waker, WAKE_TOKEN, Ready::readable(), EpollOpt::level())?;
        Ok(EventLoop {
            epoll,
            events: Events::with_capacity(capacity.max(16)),
            waker,
        })
    }

    /// Register an acceptor's socket under token `index + 1`.
    pub fn register<S: queen_io::epoll::Source + AsRawFd + ?Sized>(
        &self,
        source: &S,
        index: usize,
        interest: Interest,
    ) -> std::io::Result<()> {
        self.epoll
            .add(source, Token(index + 1), interest.to_ready(), EpollOpt::level())
    }

    pub fn reregister<S: queen_io::epoll::Source + AsRawFd + ?Sized>(
        &self,
        source: &S,
        index: usize,
        interest: Interest,
    ) -> std::io::Result<()> {
        self.epoll
            .modify(source, Token(index + 1), interest.to_ready(), EpollOpt::level())
    }

    /// Wait for the next round of events, up to `timeout` (spec §4.1 step 1-2). A
    /// `None` timeout means "wait forever". Drains every ready event from this cycle so
    /// one syscall can dispatch to all acceptors that became ready at once.
    pub fn wait(&mut self, timeout: Option<Duration>) -> std::io::Result<Vec<Dispatch>> {
        let n = self.epoll.wait(&mut self.events, timeout)?;
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let event = self.events.get(i).expect("index within wait() count");
            if event.token() == WAKE_TOKEN {
                self.waker.finish()?;
                out.push(Dispatch::Woken);
            } else {
                out.push(Dispatch::Acceptor {
                    index: event.token().0 - 1,
                    readiness: event.readiness(),
                });
            }
        }
        if out.is_empty() {
            out.push(Dispatch::Timeout);
        }
        Ok(out)
    }
}
