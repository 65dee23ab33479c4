use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::handshake::packet::{HandshakeFlags, HandshakeKind, HandshakePacket};
use crate::handshake::{HandshakeStatus, HandshakeTransport, TransportFactory};
use crate::options::SocketOptions;
use crate::socket::SocketId;

const RECEIVE_BUFFER_SIZE: usize = 1500;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Phase {
    Induction,
    Conclusion { cookie: u32 },
}

/// Caller side of the handshake. It binds its own ephemeral UDP socket, so replies from the
///  listener arrive at this attempt only and a later attempt never sees stale responses.
pub struct UdpHandshake {
    socket: UdpSocket,
    local_id: SocketId,
    peer: SocketAddr,
    flags: HandshakeFlags,
    phase: Phase,
    resend_interval: Duration,
    last_sent: Option<Instant>,
}

impl UdpHandshake {
    pub async fn bind(local_id: SocketId, peer: SocketAddr, options: &SocketOptions, resend_interval: Duration) -> anyhow::Result<UdpHandshake> {
        let socket = if peer.is_ipv4() {
            UdpSocket::bind("0.0.0.0:0").await?
        }
        else {
            UdpSocket::bind("[::]:0").await?
        };
        trace!("socket {}: handshake bound to {:?}", local_id, socket.local_addr()?);

        Ok(UdpHandshake {
            socket,
            local_id,
            peer,
            flags: HandshakeFlags::from_options(options),
            phase: Phase::Induction,
            resend_interval,
            last_sent: None,
        })
    }

    fn request(&self) -> HandshakePacket {
        match self.phase {
            Phase::Induction => HandshakePacket::new(HandshakeKind::InductionRequest, self.flags, self.local_id.0, 0, 0),
            Phase::Conclusion { cookie } => HandshakePacket::new(HandshakeKind::ConclusionRequest, self.flags, self.local_id.0, 0, cookie),
        }
    }

    async fn send_request(&mut self, now: Instant) -> anyhow::Result<()> {
        let packet = self.request();
        trace!("socket {}: sending {:?} to {:?}", self.local_id, packet, self.peer);
        self.socket.send_to(&packet.to_vec(), self.peer).await?;
        self.last_sent = Some(now);
        Ok(())
    }

    fn is_resend_due(&self, now: Instant) -> bool {
        match self.last_sent {
            Some(last_sent) => now >= last_sent + self.resend_interval,
            None => true,
        }
    }

    /// Applies a packet from the peer, returning a final status if the handshake is complete
    async fn on_packet(&mut self, packet: HandshakePacket, now: Instant) -> anyhow::Result<Option<HandshakeStatus>> {
        if packet.destination_socket_id != self.local_id.0 {
            debug!("socket {}: handshake packet for socket {} - dropping", self.local_id, packet.destination_socket_id);
            return Ok(None);
        }

        match (packet.kind, self.phase) {
            (HandshakeKind::InductionResponse, Phase::Induction) => {
                trace!("socket {}: induction complete, concluding", self.local_id);
                self.phase = Phase::Conclusion { cookie: packet.cookie };
                self.send_request(now).await?;
                Ok(None)
            }
            (HandshakeKind::ConclusionResponse, Phase::Conclusion { .. }) => {
                Ok(Some(HandshakeStatus::Accepted { peer_socket_id: packet.source_socket_id }))
            }
            (HandshakeKind::Rejection, _) => {
                Ok(Some(HandshakeStatus::Rejected(packet.reject_reason)))
            }
            (kind, phase) => {
                // duplicates of responses to re-sent requests end up here
                trace!("socket {}: ignoring {:?} in phase {:?}", self.local_id, kind, phase);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl HandshakeTransport for UdpHandshake {
    async fn start(&mut self, now: Instant) -> anyhow::Result<()> {
        self.send_request(now).await
    }

    async fn advance(&mut self, now: Instant) -> anyhow::Result<HandshakeStatus> {
        let mut buf = [0u8; RECEIVE_BUFFER_SIZE];
        loop {
            let (len, from) = match self.socket.try_recv_from(&mut buf) {
                Ok(x) => x,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    // ICMP 'port unreachable' surfaces here on some platforms: the peer may
                    //  still come up within the timeout
                    trace!("socket {}: receive error during handshake: {}", self.local_id, e);
                    break;
                }
            };

            if from != self.peer {
                debug!("socket {}: handshake datagram from unexpected address {:?} - dropping", self.local_id, from);
                continue;
            }

            let packet = match HandshakePacket::deser(&mut &buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("socket {}: unparsable handshake datagram from {:?}: {}", self.local_id, from, e);
                    continue;
                }
            };
            trace!("socket {}: received {:?}", self.local_id, packet);

            if let Some(status) = self.on_packet(packet, now).await? {
                return Ok(status);
            }
        }

        if self.is_resend_due(now) {
            self.send_request(now).await?;
        }
        Ok(HandshakeStatus::Pending)
    }
}

#[derive(Debug, Clone)]
pub struct UdpTransportFactory {
    resend_interval: Duration,
}
impl UdpTransportFactory {
    pub fn new(resend_interval: Duration) -> UdpTransportFactory {
        UdpTransportFactory { resend_interval }
    }
}

#[async_trait]
impl TransportFactory for UdpTransportFactory {
    async fn create(&self, local_id: SocketId, peer: SocketAddr, options: &SocketOptions) -> anyhow::Result<Box<dyn HandshakeTransport>> {
        Ok(Box::new(UdpHandshake::bind(local_id, peer, options, self.resend_interval).await?))
    }
}
