//! Connection setup with a remote peer. The connection core does not care how a handshake is
//!  performed: it creates one `HandshakeTransport` per connect attempt through a
//!  `TransportFactory` and drives it from the connection worker until it reports an outcome or
//!  the attempt's deadline passes.
//!
//! `UdpHandshake` and `HandshakeListener` implement the two sides of a two-phase
//!  induction / conclusion exchange over UDP.

pub mod listener;
pub mod packet;
pub mod udp;

use std::net::SocketAddr;
use async_trait::async_trait;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::time::Instant;
use crate::options::SocketOptions;
use crate::socket::SocketId;

/// Reason codes sent by a listener when it refuses a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum RejectReason {
    Unknown = 0,
    /// system function error on the listener side
    System = 1,
    /// the accept callback refused the connection
    Peer = 2,
    /// the listener ran out of resources
    Resource = 3,
    /// incorrect or unexpected data in the handshake
    Rogue = 4,
    /// too many pending connections
    Backlog = 5,
    Internal = 6,
    /// the listener is shutting down
    Close = 7,
    Version = 8,
    /// the conclusion request carried a cookie the listener did not issue
    Cookie = 9,
    /// application specific, for use by accept callbacks
    Predefined = 1000,
    UserDefined = 2000,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandshakeStatus {
    Pending,
    Accepted { peer_socket_id: u32 },
    Rejected(RejectReason),
}

/// One connect attempt's exchange with the peer. Implementations must not block: `advance` is
///  called on every tick of the connection worker, and it processes whatever arrived since the
///  previous call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HandshakeTransport: Send + Sync + 'static {
    /// sends the initial request
    async fn start(&mut self, now: Instant) -> anyhow::Result<()>;

    /// An `Err` ends the attempt as a setup failure. Deadlines are enforced by the caller, so
    ///  implementations keep returning `Pending` for as long as they have no answer.
    async fn advance(&mut self, now: Instant) -> anyhow::Result<HandshakeStatus>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    async fn create(&self, local_id: SocketId, peer: SocketAddr, options: &SocketOptions) -> anyhow::Result<Box<dyn HandshakeTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::unknown(0, Some(RejectReason::Unknown))]
    #[case::backlog(5, Some(RejectReason::Backlog))]
    #[case::cookie(9, Some(RejectReason::Cookie))]
    #[case::user(2000, Some(RejectReason::UserDefined))]
    #[case::undefined(10, None)]
    fn test_reject_reason_from_wire(#[case] raw: u16, #[case] expected: Option<RejectReason>) {
        assert_eq!(RejectReason::try_from(raw).ok(), expected);
    }

    #[test]
    fn test_reject_reason_to_wire() {
        assert_eq!(u16::from(RejectReason::Peer), 2);
        assert_eq!(u16::from(RejectReason::Predefined), 1000);
    }
}
