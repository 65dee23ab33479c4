use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio::time;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace};
use crate::clock::Clock;
use crate::epoll::EpollTable;
use crate::error::SocketError;
use crate::handshake::HandshakeStatus;
use crate::socket::{SharedHandshake, Socket, SocketId, WorkerStep};
use crate::socket_table::SocketTable;

type AdvanceHandle = JoinHandle<anyhow::Result<HandshakeStatus>>;

/// A tracked connect attempt, and the handshake step that is still running for it (if any).
///  A step that does not finish within one scan is picked up again by a later scan.
struct Tracked {
    attempt: u64,
    advance: Option<AdvanceHandle>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        if let Some(advance) = &self.advance {
            advance.abort();
        }
    }
}

/// The single background activity of a socket manager. On every tick it visits all sockets that
///  are connecting: it enforces their deadlines and advances their handshakes, publishing every
///  resulting transition to the epoll contexts the socket is registered with.
///
/// Sockets are tracked by (id, attempt). The worker never transitions a socket unless it is still
///  connecting in the tracked attempt, which is checked under the socket's lock together with the
///  transition itself.
///
/// Deadlines of all tracked sockets are enforced before any handshake is awaited, and handshake
///  steps run in tasks of their own. A scan waits for them for at most one tick, so a stalled
///  transport delays neither other sockets nor its own timeout.
pub struct ConnectionWorker {
    tracked: Mutex<FxHashMap<SocketId, Tracked>>,
    sockets: Arc<SocketTable>,
    epolls: Arc<EpollTable>,
    clock: Arc<dyn Clock>,
    tick: Duration,
}

impl ConnectionWorker {
    pub fn new(sockets: Arc<SocketTable>, epolls: Arc<EpollTable>, clock: Arc<dyn Clock>, tick: Duration) -> ConnectionWorker {
        ConnectionWorker {
            tracked: Default::default(),
            sockets,
            epolls,
            clock,
            tick,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<SocketId, Tracked>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn track(&self, id: SocketId, attempt: u64) {
        trace!("tracking socket {} attempt {}", id, attempt);
        self.lock().insert(id, Tracked { attempt, advance: None });
    }

    /// Stops tracking a socket, but only if it is still tracked for `attempt`: a new attempt may
    ///  have been started in the meantime, and that one must stay tracked.
    pub fn untrack(&self, id: SocketId, attempt: u64) {
        let mut tracked = self.lock();
        if tracked.get(&id).map(|t| t.attempt) == Some(attempt) {
            tracked.remove(&id);
        }
    }

    pub fn untrack_all(&self, id: SocketId) {
        self.lock().remove(&id);
    }

    pub fn is_tracked(&self, id: SocketId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn num_tracked(&self) -> usize {
        self.lock().len()
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        debug!("starting connection worker with a tick of {:?}", self.tick);

        let mut ticks = time::interval(self.tick);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticks.tick() => {
                    self.scan().await;
                }
                _ = shutdown.recv() => {
                    debug!("connection worker shutting down");
                    break;
                }
            }
        }
    }

    /// one pass over all tracked sockets
    pub async fn scan(&self) {
        let tracked: Vec<(SocketId, u64)> = self.lock().iter()
            .map(|(&id, t)| (id, t.attempt))
            .collect();

        let mut advancing = Vec::new();
        for (id, attempt) in tracked {
            if let Some((socket, handshake)) = self.check_deadline(id, attempt).await {
                if let Some(advance) = self.start_advance(id, attempt, handshake) {
                    advancing.push((socket, attempt, advance));
                }
            }
        }

        let until = time::Instant::now() + self.tick;
        for (socket, attempt, mut advance) in advancing {
            match time::timeout_at(until, &mut advance).await {
                Ok(outcome) => self.conclude(&socket, attempt, outcome).await,
                Err(_) => {
                    trace!("socket {}: handshake step still running", socket.id());
                    self.park_advance(socket.id(), attempt, advance);
                }
            }
        }
    }

    /// Times out the attempt if its deadline passed. Returns the handshake if it should be
    ///  advanced.
    async fn check_deadline(&self, id: SocketId, attempt: u64) -> Option<(Arc<Socket>, SharedHandshake)> {
        let Some(socket) = self.sockets.lookup(id).await else {
            trace!("socket {} was closed - untracking", id);
            self.untrack(id, attempt);
            return None;
        };

        match socket.poll_deadline(attempt, self.clock.now()) {
            WorkerStep::Idle => {
                self.untrack(id, attempt);
                None
            }
            WorkerStep::Waiting => None,
            WorkerStep::TimedOut(epolls) => {
                debug!("socket {}: connect attempt {} to {:?} timed out", id, attempt, socket.peer_addr());
                self.untrack(id, attempt);
                self.epolls.publish(&epolls).await;
                None
            }
            WorkerStep::Advance(handshake) => Some((socket, handshake)),
        }
    }

    /// Takes over the handshake step left running by a previous scan, or spawns a new one. The
    ///  step runs in a task of its own so that a panicking transport takes down its own attempt
    ///  only.
    fn start_advance(&self, id: SocketId, attempt: u64, handshake: SharedHandshake) -> Option<AdvanceHandle> {
        let mut tracked = self.lock();
        let entry = tracked.get_mut(&id)
            .filter(|t| t.attempt == attempt)?;

        Some(match entry.advance.take() {
            Some(advance) => advance,
            None => {
                let now = self.clock.now();
                tokio::spawn(async move {
                    handshake.lock().await
                        .advance(now).await
                })
            }
        })
    }

    fn park_advance(&self, id: SocketId, attempt: u64, advance: AdvanceHandle) {
        let mut tracked = self.lock();
        match tracked.get_mut(&id) {
            Some(t) if t.attempt == attempt => t.advance = Some(advance),
            _ => advance.abort(),
        }
    }

    async fn conclude(&self, socket: &Socket, attempt: u64, outcome: Result<anyhow::Result<HandshakeStatus>, JoinError>) {
        let id = socket.id();
        let resolution = match outcome {
            Ok(Ok(HandshakeStatus::Pending)) => return,
            Ok(Ok(HandshakeStatus::Accepted { peer_socket_id })) => Ok(peer_socket_id),
            Ok(Ok(HandshakeStatus::Rejected(reason))) => Err(SocketError::ConnectionRefused(reason)),
            Ok(Err(e)) => Err(SocketError::ConnectionSetup(e.to_string())),
            Err(e) => {
                error!("socket {}: handshake failed unexpectedly: {}", id, e);
                Err(SocketError::ConnectionSetup(format!("handshake failed: {}", e)))
            }
        };

        self.untrack(id, attempt);
        if let Some(epolls) = socket.resolve(attempt, resolution) {
            self.epolls.publish(&epolls).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio::time::Instant;
    use crate::clock::{MockClock, TokioClock};
    use crate::epoll::{EpollFlags, WaitOutcome};
    use crate::handshake::{HandshakeTransport, MockHandshakeTransport, RejectReason};
    use crate::options::{OptionValue, SocketOption, SocketOptions};
    use crate::socket::SocketState;

    const TICK: Duration = Duration::from_millis(10);

    struct Fixture {
        sockets: Arc<SocketTable>,
        epolls: Arc<EpollTable>,
        worker: Arc<ConnectionWorker>,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture::with_clock(Arc::new(TokioClock))
        }

        fn with_clock(clock: Arc<dyn Clock>) -> Fixture {
            let sockets = Arc::new(SocketTable::new(100));
            let epolls = Arc::new(EpollTable::new(10));
            let worker = Arc::new(ConnectionWorker::new(sockets.clone(), epolls.clone(), clock, TICK));
            Fixture { sockets, epolls, worker }
        }

        /// the same steps as closing through the socket manager
        async fn close(&self, socket: &Socket) {
            let epolls = socket.close().unwrap();
            self.sockets.remove(socket.id()).await;
            self.worker.untrack_all(socket.id());
            self.epolls.forget_socket(socket.id(), &epolls).await;
        }

        /// a non-blocking socket connecting with a timeout of 500ms and the given handshake
        async fn connecting(&self, handshake: Option<Box<dyn HandshakeTransport>>) -> (Arc<Socket>, u64) {
            let socket = self.sockets.create(SocketOptions::new(Duration::from_millis(500))).await.unwrap();
            socket.set_option(SocketOption::ReceiveSync, OptionValue::Bool(false)).unwrap();

            let ticket = socket.begin_connect("127.0.0.1:5555".parse().unwrap(), Instant::now()).unwrap();
            self.worker.track(socket.id(), ticket.attempt);
            if let Some(handshake) = handshake {
                assert!(socket.install_handshake(ticket.attempt, Arc::new(tokio::sync::Mutex::new(handshake))));
            }
            (socket, ticket.attempt)
        }
    }

    /// a transport whose `advance` does not return before `gate` is notified
    struct Gated {
        gate: Arc<Notify>,
        status: HandshakeStatus,
    }

    #[async_trait]
    impl HandshakeTransport for Gated {
        async fn start(&mut self, _now: Instant) -> anyhow::Result<()> {
            Ok(())
        }

        async fn advance(&mut self, _now: Instant) -> anyhow::Result<HandshakeStatus> {
            self.gate.notified().await;
            Ok(self.status)
        }
    }

    fn gated(status: HandshakeStatus) -> (Box<dyn HandshakeTransport>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (Box::new(Gated { gate: gate.clone(), status }), gate)
    }

    fn answering(status: HandshakeStatus) -> Box<dyn HandshakeTransport> {
        let mut handshake = MockHandshakeTransport::new();
        handshake.expect_advance()
            .returning(move |_| Ok(status));
        Box::new(handshake)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let fixture = Fixture::new();
        let (socket, _) = fixture.connecting(Some(answering(HandshakeStatus::Pending))).await;

        time::advance(Duration::from_millis(499)).await;
        fixture.worker.scan().await;
        assert_eq!(socket.state(), SocketState::Connecting);
        assert!(fixture.worker.is_tracked(socket.id()));

        time::advance(Duration::from_millis(1)).await;
        fixture.worker.scan().await;
        assert_eq!(socket.state(), SocketState::Broken);
        assert_eq!(socket.last_error().unwrap(), Some(SocketError::ConnectionTimedOut));
        assert!(!fixture.worker.is_tracked(socket.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_handshake() {
        let fixture = Fixture::new();
        let (socket, _) = fixture.connecting(None).await;

        fixture.worker.scan().await;
        assert_eq!(socket.state(), SocketState::Connecting);

        time::advance(Duration::from_millis(500)).await;
        fixture.worker.scan().await;
        assert_eq!(socket.last_error().unwrap(), Some(SocketError::ConnectionTimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted() {
        let fixture = Fixture::new();
        let (socket, _) = fixture.connecting(Some(answering(HandshakeStatus::Accepted { peer_socket_id: 33 }))).await;

        fixture.worker.scan().await;
        assert_eq!(socket.state(), SocketState::Connected);
        assert_eq!(socket.peer_socket_id().unwrap(), Some(33));
        assert_eq!(fixture.worker.num_tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected() {
        let fixture = Fixture::new();
        let (socket, _) = fixture.connecting(Some(answering(HandshakeStatus::Rejected(RejectReason::Peer)))).await;

        fixture.worker.scan().await;
        assert_eq!(socket.state(), SocketState::Broken);
        assert_eq!(socket.last_error().unwrap(), Some(SocketError::ConnectionRefused(RejectReason::Peer)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_error() {
        let fixture = Fixture::new();
        let mut handshake = MockHandshakeTransport::new();
        handshake.expect_advance()
            .returning(|_| Err(anyhow!("network unreachable")));
        let (socket, _) = fixture.connecting(Some(Box::new(handshake))).await;

        fixture.worker.scan().await;
        assert_eq!(socket.last_error().unwrap(), Some(SocketError::ConnectionSetup("network unreachable".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handshake_affects_its_socket_only() {
        let fixture = Fixture::new();
        let mut handshake = MockHandshakeTransport::new();
        handshake.expect_advance()
            .returning(|_| panic!("buggy transport"));
        let (faulty, _) = fixture.connecting(Some(Box::new(handshake))).await;
        let (healthy, _) = fixture.connecting(Some(answering(HandshakeStatus::Accepted { peer_socket_id: 1 }))).await;

        fixture.worker.scan().await;
        assert_eq!(faulty.state(), SocketState::Broken);
        assert!(matches!(faulty.last_error().unwrap(), Some(SocketError::ConnectionSetup(_))));
        assert_eq!(healthy.state(), SocketState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_socket_is_skipped() {
        let fixture = Fixture::new();
        let (socket, _) = fixture.connecting(Some(answering(HandshakeStatus::Accepted { peer_socket_id: 1 }))).await;

        socket.close().unwrap();
        fixture.sockets.remove(socket.id()).await;

        fixture.worker.scan().await;
        assert_eq!(socket.state(), SocketState::Closed);
        assert_eq!(fixture.worker.num_tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untrack_keeps_newer_attempt() {
        let fixture = Fixture::new();
        let (socket, first) = fixture.connecting(None).await;
        socket.resolve(first, Err(SocketError::ConnectionTimedOut));

        let second = socket.begin_connect("127.0.0.1:5555".parse().unwrap(), Instant::now()).unwrap().attempt;
        fixture.worker.track(socket.id(), second);

        fixture.worker.untrack(socket.id(), first);
        assert!(fixture.worker.is_tracked(socket.id()));

        fixture.worker.untrack(socket.id(), second);
        assert!(!fixture.worker.is_tracked(socket.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_published() {
        let fixture = Fixture::new();
        let (socket, _) = fixture.connecting(None).await;
        let epoll = fixture.epolls.create().await.unwrap();
        socket.attach_epoll(epoll.id()).unwrap();
        epoll.subscribe(socket.id(), EpollFlags::WRITE | EpollFlags::ERROR);

        let (shutdown_send, shutdown_recv) = broadcast::channel(1);
        let run_handle = tokio::spawn(fixture.worker.clone().run(shutdown_recv));

        let start = Instant::now();
        let outcome = epoll.wait(&fixture.sockets, Some(Duration::from_millis(600)), Duration::from_secs(3600), &TokioClock).await.unwrap();
        let elapsed = Instant::now() - start;

        let WaitOutcome::Ready(ready) = outcome else {
            panic!("expected the socket to become ready");
        };
        assert_eq!(ready.read, vec![socket.id()]);
        assert_eq!(ready.write, vec![socket.id()]);
        assert_eq!(ready.error, vec![socket.id()]);
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed <= Duration::from_millis(510));

        shutdown_send.send(()).unwrap();
        run_handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let fixture = Fixture::new();
        let (shutdown_send, shutdown_recv) = broadcast::channel(1);
        let handle = tokio::spawn(fixture.worker.clone().run(shutdown_recv));

        time::sleep(Duration::from_millis(35)).await;
        shutdown_send.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handshake_continues_in_later_scan() {
        let fixture = Fixture::new();
        let (handshake, gate) = gated(HandshakeStatus::Accepted { peer_socket_id: 12 });
        let (socket, _) = fixture.connecting(Some(handshake)).await;

        let start = Instant::now();
        fixture.worker.scan().await;
        assert_eq!(Instant::now() - start, TICK);
        assert_eq!(socket.state(), SocketState::Connecting);
        assert!(fixture.worker.is_tracked(socket.id()));

        gate.notify_one();
        fixture.worker.scan().await;
        assert_eq!(socket.state(), SocketState::Connected);
        assert_eq!(socket.peer_socket_id().unwrap(), Some(12));
        assert_eq!(fixture.worker.num_tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_handshake_does_not_delay_timeouts() {
        let fixture = Fixture::new();
        let (stalled_handshake, _gate) = gated(HandshakeStatus::Accepted { peer_socket_id: 1 });
        let (stalled, _) = fixture.connecting(Some(stalled_handshake)).await;
        let (waiting, _) = fixture.connecting(Some(answering(HandshakeStatus::Pending))).await;

        let (shutdown_send, shutdown_recv) = broadcast::channel(1);
        let run_handle = tokio::spawn(fixture.worker.clone().run(shutdown_recv));

        time::sleep(Duration::from_millis(530)).await;
        assert_eq!(waiting.last_error().unwrap(), Some(SocketError::ConnectionTimedOut));
        assert_eq!(stalled.last_error().unwrap(), Some(SocketError::ConnectionTimedOut));
        assert_eq!(fixture.worker.num_tracked(), 0);

        shutdown_send.send(()).unwrap();
        run_handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_scan_awaits_handshake() {
        let fixture = Fixture::new();
        let (handshake, gate) = gated(HandshakeStatus::Accepted { peer_socket_id: 5 });
        let (socket, _) = fixture.connecting(Some(handshake)).await;
        let epoll = fixture.epolls.create().await.unwrap();
        socket.attach_epoll(epoll.id()).unwrap();
        epoll.subscribe(socket.id(), EpollFlags::all());

        let scan = {
            let worker = fixture.worker.clone();
            tokio::spawn(async move { worker.scan().await })
        };
        time::sleep(Duration::from_millis(1)).await;
        assert!(!scan.is_finished());

        fixture.close(&socket).await;
        gate.notify_one();
        scan.await.unwrap();

        assert_eq!(socket.state(), SocketState::Closed);
        assert_eq!(socket.peer_socket_id(), Err(SocketError::ClosedSocket(socket.id())));
        let outcome = epoll.wait(&fixture.sockets, Some(Duration::ZERO), Duration::from_secs(3600), &TokioClock).await.unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(fixture.worker.num_tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_follows_injected_clock() {
        let start = Instant::now();
        let mut clock = MockClock::new();
        clock.expect_now()
            .returning(move || start + Duration::from_millis(500));
        let fixture = Fixture::with_clock(Arc::new(clock));
        let (socket, _) = fixture.connecting(Some(answering(HandshakeStatus::Pending))).await;

        fixture.worker.scan().await;
        assert_eq!(Instant::now(), start);
        assert_eq!(socket.last_error().unwrap(), Some(SocketError::ConnectionTimedOut));
    }
}
