use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, span, Instrument, Level};
use crate::clock::{Clock, TokioClock};
use crate::config::CoreConfig;
use crate::epoll::{EpollFlags, EpollId, EpollTable, WaitOutcome};
use crate::error::{SocketError, SocketResult};
use crate::handshake::udp::UdpTransportFactory;
use crate::handshake::TransportFactory;
use crate::options::{OptionValue, SocketOption, SocketOptions};
use crate::socket::{IoReadiness, Socket, SocketId, SocketState, WorkerStep};
use crate::socket_table::SocketTable;
use crate::worker::ConnectionWorker;

/// Entry point for applications: owns the socket and epoll tables and the connection worker.
///
/// All operations address sockets and epoll contexts by id. A socket id stays valid after the
///  socket is closed in the sense that operations on it fail with `ClosedSocket` rather than
///  `UnknownSocket`.
pub struct SocketManager {
    config: CoreConfig,
    sockets: Arc<SocketTable>,
    epolls: Arc<EpollTable>,
    worker: Arc<ConnectionWorker>,
    factory: Arc<dyn TransportFactory>,
    clock: Arc<dyn Clock>,
    shutdown: broadcast::Sender<()>,
    is_shut_down: AtomicBool,
    worker_handle: JoinHandle<()>,
}

impl Debug for SocketManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SocketManager")
    }
}

impl SocketManager {
    /// Spawns the connection worker, so this must be called from inside a tokio runtime
    pub fn new(config: CoreConfig, factory: Arc<dyn TransportFactory>, clock: Arc<dyn Clock>) -> anyhow::Result<SocketManager> {
        config.validate()?;

        let sockets = Arc::new(SocketTable::new(config.max_sockets));
        let epolls = Arc::new(EpollTable::new(config.max_epoll_contexts));
        let worker = Arc::new(ConnectionWorker::new(sockets.clone(), epolls.clone(), clock.clone(), config.worker_tick));

        let (shutdown, shutdown_recv) = broadcast::channel(1);
        let worker_handle = tokio::spawn(worker.clone().run(shutdown_recv));

        info!("socket manager started");
        Ok(SocketManager {
            config,
            sockets,
            epolls,
            worker,
            factory,
            clock,
            shutdown,
            is_shut_down: AtomicBool::new(false),
            worker_handle,
        })
    }

    /// a manager that performs handshakes over UDP
    pub fn new_udp(config: CoreConfig) -> anyhow::Result<SocketManager> {
        let factory = Arc::new(UdpTransportFactory::new(config.handshake_resend_interval));
        SocketManager::new(config, factory, Arc::new(TokioClock))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub async fn create_socket(&self) -> SocketResult<SocketId> {
        let socket = self.sockets.create(SocketOptions::new(self.config.default_connect_timeout)).await?;
        Ok(socket.id())
    }

    pub async fn set_option(&self, id: SocketId, option: SocketOption, value: impl Into<OptionValue>) -> SocketResult<()> {
        self.sockets.get(id).await?
            .set_option(option, value.into())
    }

    pub async fn get_option(&self, id: SocketId, option: SocketOption) -> SocketResult<OptionValue> {
        self.sockets.get(id).await?
            .get_option(option)
    }

    pub async fn set_option_by_name(&self, id: SocketId, name: &str, value: impl Into<OptionValue>) -> SocketResult<()> {
        let option = SocketOption::from_str(name)?;
        self.set_option(id, option, value).await
    }

    pub async fn get_option_by_name(&self, id: SocketId, name: &str) -> SocketResult<OptionValue> {
        let option = SocketOption::from_str(name)?;
        self.get_option(id, option).await
    }

    /// Starts a connect attempt. In blocking mode (option `receive_sync`) the returned future
    ///  completes when the attempt is resolved, returning its outcome. In non-blocking mode it
    ///  completes as soon as the handshake is initiated, and the outcome is observable through
    ///  epoll contexts and `socket_state` / `last_error`.
    ///
    /// Dropping the future of a blocking connect does not cancel the attempt.
    ///
    /// After `shutdown` there is no worker to drive connect attempts, so they are refused.
    pub async fn connect(&self, id: SocketId, addr: SocketAddr) -> SocketResult<()> {
        validate_target(addr)?;
        let socket = self.sockets.get(id).await?;
        if self.is_shut_down.load(Ordering::Acquire) {
            return Err(SocketError::InvalidState {
                state: socket.state().name(),
                detail: "the socket manager is shut down",
            });
        }

        let span = span!(Level::DEBUG, "connect", socket = %id, peer = %addr);
        self.do_connect(socket, addr)
            .instrument(span)
            .await
    }

    async fn do_connect(&self, socket: Arc<Socket>, addr: SocketAddr) -> SocketResult<()> {
        let id = socket.id();
        let ticket = socket.begin_connect(addr, self.clock.now())?;
        self.worker.track(id, ticket.attempt);

        let mut handshake = match self.factory.create(id, addr, &ticket.options).await {
            Ok(handshake) => handshake,
            Err(e) => return self.fail_setup(&socket, ticket.attempt, e).await,
        };
        if let Err(e) = handshake.start(self.clock.now()).await {
            return self.fail_setup(&socket, ticket.attempt, e).await;
        }

        if !socket.install_handshake(ticket.attempt, Arc::new(tokio::sync::Mutex::new(handshake))) {
            debug!("attempt {} ended while the handshake was set up", ticket.attempt);
        }

        let Some(mut completion) = ticket.completion else {
            return Ok(());
        };

        // resolves at the deadline at the latest, even without a running worker
        let outcome = select! {
            outcome = &mut completion => outcome,
            _ = tokio::time::sleep(ticket.deadline.remaining(self.clock.now())) => {
                if let WorkerStep::TimedOut(epolls) = socket.poll_deadline(ticket.attempt, self.clock.now()) {
                    debug!("attempt {} timed out before the worker got to it", ticket.attempt);
                    self.worker.untrack(id, ticket.attempt);
                    self.epolls.publish(&epolls).await;
                }
                completion.await
            }
        };
        match outcome {
            Ok(outcome) => outcome,
            // the sender is dropped with the socket record
            Err(_) => Err(SocketError::ClosedSocket(id)),
        }
    }

    /// A local failure to set up the handshake resolves the attempt right away in both modes
    async fn fail_setup(&self, socket: &Socket, attempt: u64, e: anyhow::Error) -> SocketResult<()> {
        debug!("handshake setup failed: {}", e);
        let error = SocketError::ConnectionSetup(e.to_string());

        self.worker.untrack(socket.id(), attempt);
        match socket.resolve(attempt, Err(error.clone())) {
            Some(epolls) => {
                self.epolls.publish(&epolls).await;
                Err(error)
            }
            None if socket.state() == SocketState::Closed => Err(SocketError::ClosedSocket(socket.id())),
            None => Err(socket.last_error()?.unwrap_or(error)),
        }
    }

    /// Closes the socket, cancelling a connect attempt in flight. A socket can be closed only
    ///  once.
    pub async fn close(&self, id: SocketId) -> SocketResult<()> {
        let socket = self.sockets.get(id).await?;
        let epolls = socket.close()?;

        self.sockets.remove(id).await;
        self.worker.untrack_all(id);
        self.epolls.forget_socket(id, &epolls).await;
        Ok(())
    }

    pub async fn socket_state(&self, id: SocketId) -> SocketResult<SocketState> {
        Ok(self.sockets.get(id).await?.state())
    }

    pub async fn last_error(&self, id: SocketId) -> SocketResult<Option<SocketError>> {
        self.sockets.get(id).await?
            .last_error()
    }

    pub async fn peer_socket_id(&self, id: SocketId) -> SocketResult<Option<u32>> {
        self.sockets.get(id).await?
            .peer_socket_id()
    }

    /// Lets the data path report read availability and write backpressure
    pub async fn report_io(&self, id: SocketId, io: IoReadiness) -> SocketResult<()> {
        let epolls = self.sockets.get(id).await?
            .set_io_readiness(io)?;
        self.epolls.publish(&epolls).await;
        Ok(())
    }

    pub async fn epoll_create(&self) -> SocketResult<EpollId> {
        Ok(self.epolls.create().await?.id())
    }

    /// Subscribes a socket, replacing the interest of an existing subscription
    pub async fn epoll_add(&self, epoll: EpollId, id: SocketId, interest: EpollFlags) -> SocketResult<()> {
        let context = self.epolls.get(epoll).await?;
        let socket = self.sockets.get(id).await?;

        socket.attach_epoll(epoll)?;
        context.subscribe(id, interest);
        Ok(())
    }

    pub async fn epoll_remove(&self, epoll: EpollId, id: SocketId) -> SocketResult<()> {
        let context = self.epolls.get(epoll).await?;
        context.unsubscribe(id)?;

        if let Some(socket) = self.sockets.lookup(id).await {
            socket.detach_epoll(epoll);
        }
        Ok(())
    }

    /// `None` waits until a socket becomes ready, `Some(Duration::ZERO)` checks exactly once
    pub async fn epoll_wait(&self, epoll: EpollId, timeout: Option<Duration>) -> SocketResult<WaitOutcome> {
        let context = self.epolls.get(epoll).await?;
        context.wait(&self.sockets, timeout, self.config.epoll_recheck_interval, self.clock.as_ref()).await
    }

    /// Drops the epoll context and its subscriptions. The subscribed sockets are not affected.
    pub async fn epoll_release(&self, epoll: EpollId) -> SocketResult<()> {
        for id in self.epolls.release(epoll).await? {
            if let Some(socket) = self.sockets.lookup(id).await {
                socket.detach_epoll(epoll);
            }
        }
        Ok(())
    }

    /// Stops the connection worker. Non-blocking attempts in flight stay `Connecting` until the
    ///  socket is closed, and later calls to `connect` fail.
    pub fn shutdown(&self) {
        info!("shutting down socket manager");
        self.is_shut_down.store(true, Ordering::Release);
        // the worker may have terminated already
        let _ = self.shutdown.send(());
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        self.worker_handle.abort();
    }
}

fn validate_target(addr: SocketAddr) -> SocketResult<()> {
    if addr.ip().is_unspecified() {
        return Err(SocketError::InvalidAddress { addr: addr.to_string(), reason: "unspecified IP address" });
    }
    if addr.ip().is_multicast() {
        return Err(SocketError::InvalidAddress { addr: addr.to_string(), reason: "multicast address" });
    }
    if addr.port() == 0 {
        return Err(SocketError::InvalidAddress { addr: addr.to_string(), reason: "port 0" });
    }
    Ok(())
}
