use std::cmp::min;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use bitflags::bitflags;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{Notify, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};
use crate::clock::Clock;
use crate::error::{SocketError, SocketResult};
use crate::socket::{IoReadiness, SocketId, SocketState};
use crate::socket_table::SocketTable;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EpollId(pub u32);
impl Debug for EpollId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "E{}", self.0)
    }
}
impl Display for EpollId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "E{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
    pub struct EpollFlags: u8 {
        const READ  = 0b0000_0001;
        const WRITE = 0b0000_0010;
        const ERROR = 0b0000_0100;
    }
}

/// Derives the events a socket signals for a subscription with the given interest.
///
/// A connected socket is writable unless the data path reported backpressure, and readable if
///  the data path reported data. A broken socket signals ERROR, and it is additionally reported
///  as readable and / or writable: callers waiting only for reading or only for writing must
///  observe the failure as well. ERROR interest counts for both directions here, so a
///  subscription for WRITE|ERROR reports a broken socket in all three sets.
pub fn readiness(state: SocketState, io: IoReadiness, interest: EpollFlags) -> EpollFlags {
    let mut result = EpollFlags::empty();
    match state {
        SocketState::Connected => {
            if interest.contains(EpollFlags::READ) && io.readable {
                result |= EpollFlags::READ;
            }
            if interest.contains(EpollFlags::WRITE) && !io.write_blocked {
                result |= EpollFlags::WRITE;
            }
        }
        SocketState::Broken => {
            if interest.contains(EpollFlags::ERROR) {
                result |= EpollFlags::ERROR;
            }
            if interest.intersects(EpollFlags::READ | EpollFlags::ERROR) {
                result |= EpollFlags::READ;
            }
            if interest.intersects(EpollFlags::WRITE | EpollFlags::ERROR) {
                result |= EpollFlags::WRITE;
            }
        }
        SocketState::Init | SocketState::Opened | SocketState::Connecting | SocketState::Closed => {}
    }
    result
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ReadySets {
    pub read: Vec<SocketId>,
    pub write: Vec<SocketId>,
    pub error: Vec<SocketId>,
}
impl ReadySets {
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.error.is_empty()
    }

    /// number of entries in the read and write sets - a broken socket is counted twice
    pub fn len(&self) -> usize {
        self.read.len() + self.write.len()
    }

    fn add(&mut self, socket: SocketId, flags: EpollFlags) {
        if flags.contains(EpollFlags::READ) {
            self.read.push(socket);
        }
        if flags.contains(EpollFlags::WRITE) {
            self.write.push(socket);
        }
        if flags.contains(EpollFlags::ERROR) {
            self.error.push(socket);
        }
    }

    fn sort(&mut self) {
        self.read.sort();
        self.write.sort();
        self.error.sort();
    }
}

/// Result of waiting on an epoll context. Running into the timeout is a regular outcome rather
///  than an error.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WaitOutcome {
    Ready(ReadySets),
    TimedOut,
}
impl WaitOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitOutcome::TimedOut)
    }

    pub fn ready(self) -> Option<ReadySets> {
        match self {
            WaitOutcome::Ready(sets) => Some(sets),
            WaitOutcome::TimedOut => None,
        }
    }
}

pub struct EpollContext {
    id: EpollId,
    subscriptions: Mutex<FxHashMap<SocketId, EpollFlags>>,
    notify: Notify,
    released: AtomicBool,
}

impl Debug for EpollContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EpollContext{{{}}}", self.id)
    }
}

impl EpollContext {
    fn new(id: EpollId) -> EpollContext {
        EpollContext {
            id,
            subscriptions: Default::default(),
            notify: Notify::new(),
            released: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<SocketId, EpollFlags>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> EpollId {
        self.id
    }

    pub fn subscribe(&self, socket: SocketId, interest: EpollFlags) {
        trace!("epoll {}: subscribing {} for {:?}", self.id, socket, interest);
        self.lock().insert(socket, interest);
        self.notify.notify_waiters();
    }

    pub fn unsubscribe(&self, socket: SocketId) -> SocketResult<()> {
        match self.lock().remove(&socket) {
            Some(_) => Ok(()),
            None => Err(SocketError::UnknownSubscription { epoll: self.id, socket }),
        }
    }

    /// drops a subscription without notifying anybody - used for sockets that were closed
    pub fn forget(&self, socket: SocketId) {
        self.lock().remove(&socket);
    }

    pub fn subscriptions(&self) -> Vec<(SocketId, EpollFlags)> {
        self.lock().iter()
            .map(|(&socket, &flags)| (socket, flags))
            .collect()
    }

    /// wakes all waiters so they re-evaluate readiness
    pub fn publish(&self) {
        self.notify.notify_waiters();
    }

    fn release(&self) -> Vec<SocketId> {
        self.released.store(true, Ordering::Release);
        let sockets = self.lock().drain().map(|(socket, _)| socket).collect();
        self.notify.notify_waiters();
        sockets
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Evaluates readiness for all subscribed sockets. The subscription map is copied before
    ///  looking at any socket so that no socket lock is ever acquired while holding the epoll
    ///  lock.
    pub async fn collect(&self, sockets: &SocketTable) -> ReadySets {
        let mut result = ReadySets::default();
        for (socket_id, interest) in self.subscriptions() {
            match sockets.lookup(socket_id).await {
                Some(socket) => {
                    let (state, io) = socket.readiness_snapshot();
                    result.add(socket_id, readiness(state, io, interest));
                }
                None => {
                    trace!("epoll {}: dropping subscription for closed socket {}", self.id, socket_id);
                    self.forget(socket_id);
                }
            }
        }
        result.sort();
        result
    }

    /// Waits until at least one subscribed socket is ready or the timeout elapses. `None` waits
    ///  indefinitely, a zero timeout evaluates readiness exactly once.
    ///
    /// Readiness is re-evaluated whenever a state change is published and in addition at
    ///  `recheck_interval` at the latest.
    pub async fn wait(&self, sockets: &SocketTable, timeout: Option<Duration>, recheck_interval: Duration, clock: &dyn Clock) -> SocketResult<WaitOutcome> {
        let deadline = timeout.map(|t| clock.now() + t);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before evaluating so that no publication between evaluation and waiting
            //  is lost
            notified.as_mut().enable();

            if self.is_released() {
                return Err(SocketError::UnknownEpoll(self.id));
            }

            let ready = self.collect(sockets).await;
            if !ready.is_empty() {
                trace!("epoll {}: ready {:?}", self.id, ready);
                return Ok(WaitOutcome::Ready(ready));
            }

            let now = clock.now();
            let wake_at = match deadline {
                Some(deadline) if now >= deadline => return Ok(WaitOutcome::TimedOut),
                Some(deadline) => min(deadline, now + recheck_interval),
                None => now + recheck_interval,
            };

            select! {
                _ = &mut notified => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }
}

struct EpollTableInner {
    contexts: FxHashMap<EpollId, Arc<EpollContext>>,
    next_id: u32,
}

/// Registry of all epoll contexts of a socket manager
pub struct EpollTable {
    inner: RwLock<EpollTableInner>,
    max_contexts: usize,
}

impl EpollTable {
    pub fn new(max_contexts: usize) -> EpollTable {
        EpollTable {
            inner: RwLock::new(EpollTableInner {
                contexts: FxHashMap::default(),
                next_id: 1,
            }),
            max_contexts,
        }
    }

    pub async fn create(&self) -> SocketResult<Arc<EpollContext>> {
        let mut inner = self.inner.write().await;
        if inner.contexts.len() >= self.max_contexts {
            return Err(SocketError::ResourceExhausted("epoll context limit reached"));
        }
        let id = EpollId(inner.next_id);
        inner.next_id = inner.next_id.checked_add(1)
            .ok_or(SocketError::ResourceExhausted("epoll ids"))?;

        let context = Arc::new(EpollContext::new(id));
        inner.contexts.insert(id, context.clone());
        debug!("created epoll context {}", id);
        Ok(context)
    }

    pub async fn get(&self, id: EpollId) -> SocketResult<Arc<EpollContext>> {
        self.inner.read().await
            .contexts
            .get(&id)
            .cloned()
            .ok_or(SocketError::UnknownEpoll(id))
    }

    /// Removes the context, returning the sockets that were subscribed to it
    pub async fn release(&self, id: EpollId) -> SocketResult<Vec<SocketId>> {
        let context = self.inner.write().await
            .contexts
            .remove(&id)
            .ok_or(SocketError::UnknownEpoll(id))?;
        debug!("released epoll context {}", id);
        Ok(context.release())
    }

    /// wakes the waiters of all given contexts, skipping contexts that were released meanwhile
    pub async fn publish(&self, ids: &[EpollId]) {
        if ids.is_empty() {
            return;
        }
        let inner = self.inner.read().await;
        for id in ids {
            if let Some(context) = inner.contexts.get(id) {
                trace!("publishing readiness change to epoll {}", id);
                context.publish();
            }
        }
    }

    /// drops the subscriptions of a socket that was closed
    pub async fn forget_socket(&self, socket: SocketId, ids: &[EpollId]) {
        let inner = self.inner.read().await;
        for id in ids {
            if let Some(context) = inner.contexts.get(id) {
                context.forget(socket);
            }
        }
    }
}
