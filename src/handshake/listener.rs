use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Duration;
use rustc_hash::{FxHashMap, FxHasher};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;
use crate::handshake::packet::{HandshakeFlags, HandshakeKind, HandshakePacket};
use crate::handshake::RejectReason;

/// A connection request as presented to the accept callback
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectRequest {
    pub peer_addr: SocketAddr,
    pub peer_socket_id: u32,
    pub flags: HandshakeFlags,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AcceptedPeer {
    pub peer_addr: SocketAddr,
    pub peer_socket_id: u32,
    /// the id the listener assigned to its side of the connection
    pub local_socket_id: u32,
    pub flags: HandshakeFlags,
}

type AcceptCallback = Box<dyn Fn(&ConnectRequest) -> Result<(), RejectReason> + Send + Sync>;

/// How long a repeated conclusion request is answered from memory. Callers resend only until
///  their connect attempt is resolved, which is bounded by their connect timeout.
const ESTABLISHED_TTL: Duration = Duration::from_secs(30);

/// Listening side of the handshake. It answers induction requests with a cookie bound to the
///  caller's address, and accepts conclusion requests that carry that cookie and pass the accept
///  callback. Accepted peers are queued for `accept()` up to the configured backlog; requests
///  beyond that are rejected.
pub struct HandshakeListener {
    local_addr: SocketAddr,
    accepted: Mutex<mpsc::Receiver<AcceptedPeer>>,
    shutdown: broadcast::Sender<()>,
}

impl Debug for HandshakeListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HandshakeListener{{{:?}}}", self.local_addr)
    }
}

impl HandshakeListener {
    /// `accept_callback` decides whether a connection request is accepted: returning a reason
    ///  rejects it.
    pub async fn spawn<F>(addr: SocketAddr, backlog: usize, accept_callback: F) -> anyhow::Result<HandshakeListener>
    where F: Fn(&ConnectRequest) -> Result<(), RejectReason> + Send + Sync + 'static
    {
        if backlog == 0 {
            anyhow::bail!("listener backlog must be positive");
        }

        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("listening for connections on {:?}", local_addr);

        let (accepted_send, accepted_recv) = mpsc::channel(backlog);
        let (shutdown, shutdown_recv) = broadcast::channel(1);

        let state = ListenerLoop::new(socket, Box::new(accept_callback), accepted_send);
        tokio::spawn(state.recv_loop(shutdown_recv));

        Ok(HandshakeListener {
            local_addr,
            accepted: Mutex::new(accepted_recv),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next accepted peer. Returns `None` after shutdown once all queued peers
    ///  were taken.
    pub async fn accept(&self) -> Option<AcceptedPeer> {
        self.accepted.lock().await
            .recv().await
    }

    pub fn shutdown(&self) {
        // the receive loop may have terminated already
        let _ = self.shutdown.send(());
    }
}

impl Drop for HandshakeListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ListenerLoop {
    socket: UdpSocket,
    secret: u32,
    accept_callback: AcceptCallback,
    accepted: mpsc::Sender<AcceptedPeer>,
    /// (peer address, peer socket id) -> (local socket id, time of acceptance), for answering
    ///  repeated conclusions
    established: FxHashMap<(SocketAddr, u32), (u32, Instant)>,
    next_socket_id: u32,
}

impl ListenerLoop {
    fn new(socket: UdpSocket, accept_callback: AcceptCallback, accepted: mpsc::Sender<AcceptedPeer>) -> ListenerLoop {
        ListenerLoop {
            socket,
            secret: rand::random(),
            accept_callback,
            accepted,
            established: FxHashMap::default(),
            next_socket_id: 1,
        }
    }

    async fn recv_loop(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = [0u8; 1500];
        loop {
            select! {
                _ = shutdown.recv() => {
                    info!("shutting down listener on {:?}", self.socket.local_addr().ok());
                    break;
                }
                recv_result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match recv_result {
                        Ok(x) => x,
                        Err(e) => {
                            debug!("listener receive error: {}", e);
                            continue;
                        }
                    };

                    let correlation_id = Uuid::new_v4();
                    let span = span!(Level::TRACE, "handshake_received", ?correlation_id);
                    let _entered = span.enter();

                    let packet = match HandshakePacket::deser(&mut &buf[..len]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            warn!("received unparsable handshake datagram from {:?}: {} - dropping", from, e);
                            continue;
                        }
                    };
                    trace!("received {:?} from {:?}", packet, from);

                    if let Some(reply) = self.on_packet(packet, from) {
                        trace!("replying {:?} to {:?}", reply, from);
                        if let Err(e) = self.socket.try_send_to(&reply.to_vec(), from) {
                            error!("error sending handshake reply to {:?}: {}", from, e);
                        }
                    }
                }
            }
        }
    }

    fn cookie_for(&self, peer: SocketAddr) -> u32 {
        let mut hasher = FxHasher::default();
        peer.hash(&mut hasher);
        (hasher.finish() as u32) ^ self.secret
    }

    fn on_packet(&mut self, packet: HandshakePacket, from: SocketAddr) -> Option<HandshakePacket> {
        match packet.kind {
            HandshakeKind::InductionRequest => {
                Some(HandshakePacket::new(HandshakeKind::InductionResponse, HandshakeFlags::empty(), 0, packet.source_socket_id, self.cookie_for(from)))
            }
            HandshakeKind::ConclusionRequest => {
                let reply = match self.conclude(&packet, from) {
                    Ok(local_socket_id) => HandshakePacket::new(HandshakeKind::ConclusionResponse, HandshakeFlags::empty(), local_socket_id, packet.source_socket_id, packet.cookie),
                    Err(reason) => {
                        debug!("rejecting connection from {:?}: {:?}", from, reason);
                        HandshakePacket::rejection(0, packet.source_socket_id, reason)
                    }
                };
                Some(reply)
            }
            kind => {
                debug!("unexpected handshake packet {:?} from {:?} - dropping", kind, from);
                None
            }
        }
    }

    fn conclude(&mut self, packet: &HandshakePacket, from: SocketAddr) -> Result<u32, RejectReason> {
        if packet.cookie != self.cookie_for(from) {
            warn!("conclusion request from {:?} with a cookie that was not issued to it", from);
            return Err(RejectReason::Cookie);
        }

        let now = Instant::now();
        self.established.retain(|_, (_, accepted_at)| now.duration_since(*accepted_at) < ESTABLISHED_TTL);

        let key = (from, packet.source_socket_id);
        if let Some(&(local_socket_id, _)) = self.established.get(&key) {
            trace!("repeated conclusion request from {:?} - re-sending response", from);
            return Ok(local_socket_id);
        }

        let request = ConnectRequest {
            peer_addr: from,
            peer_socket_id: packet.source_socket_id,
            flags: packet.flags,
        };
        (self.accept_callback)(&request)?;

        let local_socket_id = self.next_socket_id;
        let accepted = AcceptedPeer {
            peer_addr: from,
            peer_socket_id: packet.source_socket_id,
            local_socket_id,
            flags: packet.flags,
        };
        match self.accepted.try_send(accepted) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(RejectReason::Backlog),
            Err(TrySendError::Closed(_)) => return Err(RejectReason::Close),
        }

        self.next_socket_id = self.next_socket_id.checked_add(1)
            .ok_or(RejectReason::Resource)?;
        self.established.insert(key, (local_socket_id, now));
        debug!("accepted connection from {:?} as socket {}", from, local_socket_id);
        Ok(local_socket_id)
    }
}
