use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use rustc_hash::FxHashSet;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::clock::Deadline;
use crate::epoll::EpollId;
use crate::error::{SocketError, SocketResult};
use crate::handshake::HandshakeTransport;
use crate::options::{OptionValue, SocketOption, SocketOptions};

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SocketId(pub u32);
impl Debug for SocketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}
impl Display for SocketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SocketState {
    Init,
    Opened,
    Connecting,
    Connected,
    /// The most recent connect attempt failed. This is terminal for the attempt, not for the
    ///  socket: a new connect is accepted.
    Broken,
    Closed,
}
impl SocketState {
    pub fn name(&self) -> &'static str {
        match self {
            SocketState::Init => "INIT",
            SocketState::Opened => "OPENED",
            SocketState::Connecting => "CONNECTING",
            SocketState::Connected => "CONNECTED",
            SocketState::Broken => "BROKEN",
            SocketState::Closed => "CLOSED",
        }
    }
}

/// Readiness of the data path as reported from outside the connection core. The defaults mean
///  'nothing to read, not blocked for writing'.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct IoReadiness {
    pub readable: bool,
    pub write_blocked: bool,
}

pub type SharedHandshake = Arc<tokio::sync::Mutex<Box<dyn HandshakeTransport>>>;

/// The outcome of a connect attempt as delivered to a caller waiting for it
pub type ConnectOutcome = SocketResult<()>;

/// Everything the caller of `connect` needs after the socket entered `Connecting`
pub struct ConnectTicket {
    pub attempt: u64,
    pub deadline: Deadline,
    pub options: SocketOptions,
    /// present in blocking mode only
    pub completion: Option<oneshot::Receiver<ConnectOutcome>>,
}

/// What the connection worker should do with a socket it tracks
pub enum WorkerStep {
    /// The tracked attempt is over (or the socket was closed): stop tracking it
    Idle,
    /// The attempt's deadline passed, and the socket was moved to `Broken`. The contained epoll
    ///  contexts must be notified.
    TimedOut(Vec<EpollId>),
    /// still connecting, but the handshake was not installed yet
    Waiting,
    Advance(SharedHandshake),
}

struct SocketInner {
    state: SocketState,
    options: SocketOptions,
    /// incremented for every connect attempt - transitions are applied only for the current one
    attempt: u64,
    deadline: Option<Deadline>,
    peer_addr: Option<SocketAddr>,
    peer_socket_id: Option<u32>,
    last_error: Option<SocketError>,
    handshake: Option<SharedHandshake>,
    completion: Option<oneshot::Sender<ConnectOutcome>>,
    io: IoReadiness,
    epolls: FxHashSet<EpollId>,
}

impl SocketInner {
    fn check_open(&self, id: SocketId) -> SocketResult<()> {
        if self.state == SocketState::Closed {
            return Err(SocketError::ClosedSocket(id));
        }
        Ok(())
    }

    fn epoll_ids(&self) -> Vec<EpollId> {
        self.epolls.iter().copied().collect()
    }

    fn complete(&mut self, outcome: ConnectOutcome) {
        if let Some(completion) = self.completion.take() {
            // the receiver is gone if the blocking caller was cancelled, which is fine
            let _ = completion.send(outcome);
        }
    }
}

/// One socket record. All fields are guarded by a single lock which is never held across an
///  `.await`, so the worker and callers see each transition atomically.
pub struct Socket {
    id: SocketId,
    inner: Mutex<SocketInner>,
}

impl Debug for Socket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Socket{{{}:{}}}", self.id, self.state().name())
    }
}

impl Socket {
    /// creates a socket in state `Init` - it becomes usable through `open()`
    pub fn new(id: SocketId, options: SocketOptions) -> Socket {
        Socket {
            id,
            inner: Mutex::new(SocketInner {
                state: SocketState::Init,
                options,
                attempt: 0,
                deadline: None,
                peer_addr: None,
                peer_socket_id: None,
                last_error: None,
                handshake: None,
                completion: None,
                io: IoReadiness::default(),
                epolls: FxHashSet::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SocketInner> {
        // a poisoned lock means a panic while holding it, which none of the code below can cause
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn open(&self) {
        let mut inner = self.lock();
        if inner.state == SocketState::Init {
            inner.state = SocketState::Opened;
        }
    }

    pub fn state(&self) -> SocketState {
        self.lock().state
    }

    pub fn last_error(&self) -> SocketResult<Option<SocketError>> {
        let inner = self.lock();
        inner.check_open(self.id)?;
        Ok(inner.last_error.clone())
    }

    pub fn peer_socket_id(&self) -> SocketResult<Option<u32>> {
        let inner = self.lock();
        inner.check_open(self.id)?;
        Ok(inner.peer_socket_id)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().peer_addr
    }

    pub fn get_option(&self, option: SocketOption) -> SocketResult<OptionValue> {
        let inner = self.lock();
        inner.check_open(self.id)?;
        Ok(inner.options.get(option))
    }

    pub fn set_option(&self, option: SocketOption, value: OptionValue) -> SocketResult<()> {
        let mut inner = self.lock();
        match inner.state {
            SocketState::Closed => Err(SocketError::ClosedSocket(self.id)),
            SocketState::Connecting | SocketState::Connected => Err(SocketError::InvalidState {
                state: inner.state.name(),
                detail: "options cannot be changed after connect was started",
            }),
            SocketState::Init | SocketState::Opened | SocketState::Broken => {
                inner.options.set(option, value)?;
                debug!("socket {}: {} set to {:?}", self.id, option, value);
                Ok(())
            }
        }
    }

    /// Moves the socket to `Connecting`, starting a new attempt. The deadline is derived from the
    ///  options at this point, so changing them later (which is rejected anyway) could not affect
    ///  the attempt.
    pub fn begin_connect(&self, peer_addr: SocketAddr, now: Instant) -> SocketResult<ConnectTicket> {
        let mut inner = self.lock();
        match inner.state {
            SocketState::Closed => return Err(SocketError::ClosedSocket(self.id)),
            SocketState::Connecting => return Err(SocketError::InvalidState {
                state: inner.state.name(),
                detail: "a connect attempt is already in progress",
            }),
            SocketState::Connected => return Err(SocketError::InvalidState {
                state: inner.state.name(),
                detail: "cannot connect a connected socket",
            }),
            SocketState::Init => return Err(SocketError::InvalidState {
                state: inner.state.name(),
                detail: "socket is not opened",
            }),
            SocketState::Opened | SocketState::Broken => {}
        }

        let deadline = Deadline::after(now, inner.options.connect_timeout);
        let (completion, completion_receiver) = if inner.options.receive_sync {
            let (send, recv) = oneshot::channel();
            (Some(send), Some(recv))
        }
        else {
            (None, None)
        };

        inner.attempt += 1;
        inner.state = SocketState::Connecting;
        inner.deadline = Some(deadline);
        inner.peer_addr = Some(peer_addr);
        inner.peer_socket_id = None;
        inner.last_error = None;
        inner.handshake = None;
        inner.completion = completion;

        debug!("socket {}: connecting to {:?} (attempt {}, timeout {:?})", self.id, peer_addr, inner.attempt, inner.options.connect_timeout);

        Ok(ConnectTicket {
            attempt: inner.attempt,
            deadline,
            options: inner.options.clone(),
            completion: completion_receiver,
        })
    }

    /// Returns `false` if the attempt is not current any more, i.e. the socket was closed or the
    ///  attempt timed out while the handshake was being set up.
    #[must_use]
    pub fn install_handshake(&self, attempt: u64, handshake: SharedHandshake) -> bool {
        let mut inner = self.lock();
        if inner.state != SocketState::Connecting || inner.attempt != attempt {
            return false;
        }
        inner.handshake = Some(handshake);
        true
    }

    /// Applies the outcome of a connect attempt. This is a no-op returning `None` unless the
    ///  socket is still connecting in the given attempt - this is what makes `close` win over
    ///  any concurrent worker action. Otherwise the epoll contexts to notify are returned.
    pub fn resolve(&self, attempt: u64, outcome: Result<u32, SocketError>) -> Option<Vec<EpollId>> {
        let mut inner = self.lock();
        if inner.state != SocketState::Connecting || inner.attempt != attempt {
            trace!("socket {}: ignoring outcome of stale attempt {}", self.id, attempt);
            return None;
        }
        Some(self.do_resolve(&mut inner, outcome))
    }

    fn do_resolve(&self, inner: &mut SocketInner, outcome: Result<u32, SocketError>) -> Vec<EpollId> {
        inner.deadline = None;
        inner.handshake = None;

        match outcome {
            Ok(peer_socket_id) => {
                debug!("socket {}: connected to {:?} (peer socket {})", self.id, inner.peer_addr, peer_socket_id);
                inner.state = SocketState::Connected;
                inner.peer_socket_id = Some(peer_socket_id);
                inner.complete(Ok(()));
            }
            Err(e) => {
                debug!("socket {}: connect attempt {} failed: {}", self.id, inner.attempt, e);
                inner.state = SocketState::Broken;
                inner.last_error = Some(e.clone());
                inner.complete(Err(e));
            }
        }
        inner.epoll_ids()
    }

    /// Called by the connection worker on every scan of a socket it tracks for `attempt`
    pub fn poll_deadline(&self, attempt: u64, now: Instant) -> WorkerStep {
        let mut inner = self.lock();
        if inner.state != SocketState::Connecting || inner.attempt != attempt {
            return WorkerStep::Idle;
        }

        match inner.deadline {
            Some(deadline) if deadline.is_expired(now) => {
                WorkerStep::TimedOut(self.do_resolve(&mut inner, Err(SocketError::ConnectionTimedOut)))
            }
            _ => match &inner.handshake {
                Some(handshake) => WorkerStep::Advance(handshake.clone()),
                None => WorkerStep::Waiting,
            }
        }
    }

    /// Moves the socket to `Closed`, cancelling a connect attempt in flight. A caller blocked in
    ///  `connect` is woken with `ClosedSocket`. Returns the epoll contexts the socket was
    ///  registered with - the subscriptions must be dropped by the caller.
    pub fn close(&self) -> SocketResult<Vec<EpollId>> {
        let mut inner = self.lock();
        inner.check_open(self.id)?;

        debug!("socket {}: closing in state {}", self.id, inner.state.name());
        inner.state = SocketState::Closed;
        inner.deadline = None;
        inner.handshake = None;
        inner.complete(Err(SocketError::ClosedSocket(self.id)));

        Ok(inner.epolls.drain().collect())
    }

    pub fn attach_epoll(&self, epoll: EpollId) -> SocketResult<()> {
        let mut inner = self.lock();
        inner.check_open(self.id)?;
        inner.epolls.insert(epoll);
        Ok(())
    }

    pub fn detach_epoll(&self, epoll: EpollId) {
        self.lock().epolls.remove(&epoll);
    }

    /// Records readiness reported by the data path, returning the epoll contexts to notify
    pub fn set_io_readiness(&self, io: IoReadiness) -> SocketResult<Vec<EpollId>> {
        let mut inner = self.lock();
        inner.check_open(self.id)?;
        inner.io = io;
        Ok(inner.epoll_ids())
    }

    pub fn readiness_snapshot(&self) -> (SocketState, IoReadiness) {
        let inner = self.lock();
        (inner.state, inner.io)
    }
}
