//! Readiness multiplexer with a backend chosen at runtime
//!
//! Linux offers `epoll` (default), `poll` and `select`; other platforms use
//! `mio`. All backends are level-triggered and report hang-up and error
//! conditions as readable, so the owner notices a dead socket on its next
//! read.
//!
//! Each registration carries a caller-chosen token (`id`) that comes back in
//! [`Event::id`]. A multiplexer belongs to one thread: registration changes
//! and `wait()` happen there, so a token that was deregistered is never
//! reported by a later `wait()`. Other threads interrupt a blocked wait
//! through a [`Waker`](crate::Waker) registered under its own token.
//!
//! ```rust,no_run
//! use sluice_transport::mux::{Interest, Multiplexer, MultiplexerType};
//! use std::net::TcpListener;
//! use std::time::Duration;
//!
//! let listener = TcpListener::bind("127.0.0.1:0").unwrap();
//! let mut mux = Multiplexer::new(MultiplexerType::default()).unwrap();
//! mux.register_fd(&listener, 7, Interest::READABLE).unwrap();
//!
//! for event in mux.wait(Some(Duration::from_millis(100))).unwrap() {
//!     assert_eq!(event.id, 7);
//! }
//! ```

use crate::{Error, Result};
use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::str::FromStr;
use std::time::Duration;

#[cfg(target_os = "linux")]
use nix::poll::{PollFd, PollFlags, PollTimeout};
#[cfg(target_os = "linux")]
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
#[cfg(target_os = "linux")]
use nix::sys::select::{select, FdSet, FD_SETSIZE};
#[cfg(target_os = "linux")]
use nix::sys::time::TimeVal;

#[cfg(not(target_os = "linux"))]
use mio::{Events, Interest as MioInterest, Poll, Token};

/// Highest fd (exclusive) an `fd_set` can hold
#[cfg(target_os = "linux")]
const SELECT_FD_LIMIT: RawFd = FD_SETSIZE as RawFd;

const EVENT_CAPACITY: usize = 256;

/// Available multiplexer backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplexerType {
    #[cfg(target_os = "linux")]
    Epoll,
    #[cfg(target_os = "linux")]
    Poll,
    /// Limited to fds below `FD_SETSIZE` (1024)
    #[cfg(target_os = "linux")]
    Select,
    /// kqueue on macOS/BSD
    #[cfg(not(target_os = "linux"))]
    Mio,
}

impl MultiplexerType {
    /// Every backend this platform supports, default first
    #[cfg(target_os = "linux")]
    pub const ALL: &'static [MultiplexerType] =
        &[MultiplexerType::Epoll, MultiplexerType::Poll, MultiplexerType::Select];
    #[cfg(not(target_os = "linux"))]
    pub const ALL: &'static [MultiplexerType] = &[MultiplexerType::Mio];

    pub fn name(self) -> &'static str {
        match self {
            #[cfg(target_os = "linux")]
            MultiplexerType::Epoll => "epoll",
            #[cfg(target_os = "linux")]
            MultiplexerType::Poll => "poll",
            #[cfg(target_os = "linux")]
            MultiplexerType::Select => "select",
            #[cfg(not(target_os = "linux"))]
            MultiplexerType::Mio => "mio",
        }
    }
}

impl Default for MultiplexerType {
    fn default() -> Self {
        MultiplexerType::ALL[0]
    }
}

impl fmt::Display for MultiplexerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MultiplexerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MultiplexerType::ALL
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let known: Vec<&str> = MultiplexerType::ALL.iter().map(|k| k.name()).collect();
                Error::Config(format!("Unknown multiplexer '{s}' (available: {})", known.join(", ")))
            })
    }
}

/// Readiness a registration asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    /// No readiness interest. Error and hang-up conditions are still reported.
    pub const NONE: Interest = Interest { readable: false, writable: false };
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };
    pub const BOTH: Interest = Interest { readable: true, writable: true };

    pub fn new(readable: bool, writable: bool) -> Self {
        Self { readable, writable }
    }
}

/// Readiness of one registration, reported under its token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub id: usize,
    pub readable: bool,
    pub writable: bool,
}

impl Event {
    fn ready(id: usize, readable: bool, writable: bool) -> Option<Event> {
        (readable || writable).then_some(Event { id, readable, writable })
    }
}

/// Whole milliseconds for a kernel timeout, rounded up so sub-millisecond
/// waits do not turn into busy polling, and capped at `i32::MAX`.
fn timeout_millis(d: Duration) -> i32 {
    let ms = d.as_nanos().div_ceil(1_000_000);
    ms.min(i32::MAX as u128) as i32
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    fd: RawFd,
    id: usize,
    interest: Interest,
}

/// One registration table in front of whichever backend was selected
pub struct Multiplexer {
    backend: Backend,
    registrations: Vec<Registration>,
}

/// Kernel-side state of each backend. `poll` and `select` keep none and
/// rebuild their sets from the registration table on every wait.
enum Backend {
    #[cfg(target_os = "linux")]
    Epoll { epoll: Epoll, events: Vec<EpollEvent> },
    #[cfg(target_os = "linux")]
    Poll,
    #[cfg(target_os = "linux")]
    Select,
    #[cfg(not(target_os = "linux"))]
    Mio { poll: Poll, events: Events },
}

fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    // Registrations are removed before their fd is closed
    unsafe { BorrowedFd::borrow_raw(fd) }
}

#[cfg(target_os = "linux")]
fn epoll_flags(interest: Interest) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if interest.readable {
        // RDHUP only with read interest: a channel that stopped reading must
        // not be woken over and over by a half-closed peer
        flags |= EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
    }
    if interest.writable {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

#[cfg(not(target_os = "linux"))]
fn mio_interest(interest: Interest) -> MioInterest {
    // mio cannot express an empty interest
    match (interest.readable, interest.writable) {
        (true, true) => MioInterest::READABLE | MioInterest::WRITABLE,
        (false, true) => MioInterest::WRITABLE,
        _ => MioInterest::READABLE,
    }
}

impl Backend {
    fn open(kind: MultiplexerType) -> Result<Self> {
        Ok(match kind {
            #[cfg(target_os = "linux")]
            MultiplexerType::Epoll => Backend::Epoll {
                epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
                events: vec![EpollEvent::empty(); EVENT_CAPACITY],
            },
            #[cfg(target_os = "linux")]
            MultiplexerType::Poll => Backend::Poll,
            #[cfg(target_os = "linux")]
            MultiplexerType::Select => Backend::Select,
            #[cfg(not(target_os = "linux"))]
            MultiplexerType::Mio => {
                Backend::Mio { poll: Poll::new()?, events: Events::with_capacity(EVENT_CAPACITY) }
            }
        })
    }

    fn kind(&self) -> MultiplexerType {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll { .. } => MultiplexerType::Epoll,
            #[cfg(target_os = "linux")]
            Backend::Poll => MultiplexerType::Poll,
            #[cfg(target_os = "linux")]
            Backend::Select => MultiplexerType::Select,
            #[cfg(not(target_os = "linux"))]
            Backend::Mio { .. } => MultiplexerType::Mio,
        }
    }

    /// Refuse descriptors the backend cannot watch
    fn check(&self, fd: RawFd) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Select if !(0..SELECT_FD_LIMIT).contains(&fd) => {
                Err(Error::FdOutOfRange { fd, limit: SELECT_FD_LIMIT })
            }
            _ => Ok(()),
        }
    }

    fn add(&mut self, reg: &Registration) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll { epoll, .. } => {
                epoll.add(borrow(reg.fd), EpollEvent::new(epoll_flags(reg.interest), reg.id as u64))?
            }
            #[cfg(not(target_os = "linux"))]
            Backend::Mio { poll, .. } => poll.registry().register(
                &mut mio::unix::SourceFd(&reg.fd),
                Token(reg.id),
                mio_interest(reg.interest),
            )?,
            #[allow(unreachable_patterns)]
            _ => {}
        }
        Ok(())
    }

    fn update(&mut self, reg: &Registration) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll { epoll, .. } => {
                let mut event = EpollEvent::new(epoll_flags(reg.interest), reg.id as u64);
                epoll.modify(borrow(reg.fd), &mut event)?
            }
            #[cfg(not(target_os = "linux"))]
            Backend::Mio { poll, .. } => poll.registry().reregister(
                &mut mio::unix::SourceFd(&reg.fd),
                Token(reg.id),
                mio_interest(reg.interest),
            )?,
            #[allow(unreachable_patterns)]
            _ => {}
        }
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll { epoll, .. } => epoll.delete(borrow(fd))?,
            #[cfg(not(target_os = "linux"))]
            Backend::Mio { poll, .. } => poll.registry().deregister(&mut mio::unix::SourceFd(&fd))?,
            #[allow(unreachable_patterns)]
            _ => {}
        }
        Ok(())
    }

    fn poll(&mut self, registrations: &[Registration], timeout: Option<Duration>) -> Result<Vec<Event>> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll { epoll, events } => {
                let timeout = timeout
                    .and_then(|d| EpollTimeout::try_from(timeout_millis(d)).ok())
                    .unwrap_or(EpollTimeout::NONE);
                let n = epoll.wait(events, timeout)?;
                Ok(events[..n]
                    .iter()
                    .filter_map(|e| {
                        let flags = e.events();
                        let hangup = EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR | EpollFlags::EPOLLRDHUP;
                        Event::ready(
                            e.data() as usize,
                            flags.intersects(EpollFlags::EPOLLIN | hangup),
                            flags.contains(EpollFlags::EPOLLOUT),
                        )
                    })
                    .collect())
            }
            #[cfg(target_os = "linux")]
            Backend::Poll => {
                let mut fds: Vec<PollFd> = registrations
                    .iter()
                    .map(|reg| {
                        let mut flags = PollFlags::empty();
                        flags.set(PollFlags::POLLIN, reg.interest.readable);
                        flags.set(PollFlags::POLLOUT, reg.interest.writable);
                        PollFd::new(borrow(reg.fd), flags)
                    })
                    .collect();
                let timeout = match timeout {
                    Some(d) => PollTimeout::try_from(timeout_millis(d)).unwrap_or(PollTimeout::MAX),
                    None => PollTimeout::NONE,
                };
                nix::poll::poll(&mut fds, timeout)?;
                let hangup = PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;
                Ok(fds
                    .iter()
                    .zip(registrations)
                    .filter_map(|(pfd, reg)| {
                        let revents = pfd.revents()?;
                        Event::ready(
                            reg.id,
                            revents.intersects(PollFlags::POLLIN | hangup),
                            revents.contains(PollFlags::POLLOUT),
                        )
                    })
                    .collect())
            }
            #[cfg(target_os = "linux")]
            Backend::Select => {
                let mut read = FdSet::new();
                let mut write = FdSet::new();
                let mut error = FdSet::new();
                let mut highest: RawFd = -1;
                for reg in registrations {
                    let fd = borrow(reg.fd);
                    if reg.interest.readable {
                        read.insert(fd);
                    }
                    if reg.interest.writable {
                        write.insert(fd);
                    }
                    error.insert(fd);
                    highest = highest.max(reg.fd);
                }
                let mut timeout = timeout.map(|d| {
                    let ms = i64::from(timeout_millis(d));
                    TimeVal::new(ms / 1000, (ms % 1000) * 1000)
                });
                select(highest + 1, &mut read, &mut write, &mut error, timeout.as_mut())?;
                Ok(registrations
                    .iter()
                    .filter_map(|reg| {
                        let fd = borrow(reg.fd);
                        Event::ready(reg.id, read.contains(fd) || error.contains(fd), write.contains(fd))
                    })
                    .collect())
            }
            #[cfg(not(target_os = "linux"))]
            Backend::Mio { poll, events } => {
                let _ = registrations;
                poll.poll(events, timeout)?;
                Ok(events
                    .iter()
                    .filter_map(|e| {
                        Event::ready(
                            e.token().0,
                            e.is_readable() || e.is_read_closed() || e.is_error(),
                            e.is_writable(),
                        )
                    })
                    .collect())
            }
        }
    }
}

impl Multiplexer {
    pub fn new(kind: MultiplexerType) -> Result<Self> {
        Ok(Self { backend: Backend::open(kind)?, registrations: Vec::new() })
    }

    pub fn mux_type(&self) -> MultiplexerType {
        self.backend.kind()
    }

    /// Watch `fd` and report its readiness under token `id`
    ///
    /// Fails if `fd` is already registered or the backend cannot watch it
    /// (`select` refuses fds at or above `FD_SETSIZE`).
    pub fn register(&mut self, fd: RawFd, id: usize, interest: Interest) -> Result<()> {
        if self.position(fd).is_some() {
            return Err(Error::Config(format!("fd {fd} is already registered")));
        }
        self.backend.check(fd)?;
        let reg = Registration { fd, id, interest };
        self.backend.add(&reg)?;
        self.registrations.push(reg);
        Ok(())
    }

    /// Change the interest or token of a registered fd
    pub fn modify(&mut self, fd: RawFd, id: usize, interest: Interest) -> Result<()> {
        let index = self.position(fd).ok_or_else(|| Error::Config(format!("fd {fd} is not registered")))?;
        let reg = Registration { fd, id, interest };
        let current = self.registrations[index];
        if current.id == id && current.interest == interest {
            return Ok(());
        }
        self.backend.update(&reg)?;
        self.registrations[index] = reg;
        Ok(())
    }

    /// Stop watching `fd`. Unknown fds are ignored.
    pub fn deregister(&mut self, fd: RawFd) -> Result<()> {
        let Some(index) = self.position(fd) else {
            return Ok(());
        };
        self.registrations.swap_remove(index);
        self.backend.remove(fd)
    }

    pub fn register_fd<F: AsRawFd>(&mut self, source: &F, id: usize, interest: Interest) -> Result<()> {
        self.register(source.as_raw_fd(), id, interest)
    }

    pub fn modify_fd<F: AsRawFd>(&mut self, source: &F, id: usize, interest: Interest) -> Result<()> {
        self.modify(source.as_raw_fd(), id, interest)
    }

    pub fn deregister_fd<F: AsRawFd>(&mut self, source: &F) -> Result<()> {
        self.deregister(source.as_raw_fd())
    }

    /// Block until a registration is ready or `timeout` elapses (`None`
    /// waits forever). `EINTR` is retried; every other failure is returned.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        loop {
            match self.backend.poll(&self.registrations, timeout) {
                Err(e) if e.is_interrupted() => tracing::trace!("multiplexer wait interrupted"),
                other => return other,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn position(&self, fd: RawFd) -> Option<usize> {
        self.registrations.iter().position(|r| r.fd == fd)
    }
}
