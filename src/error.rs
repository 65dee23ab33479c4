use crate::epoll::EpollId;
use crate::handshake::RejectReason;
use crate::options::SocketOption;
use crate::socket::SocketId;
use thiserror::Error;

pub type SocketResult<T> = Result<T, SocketError>;

/// Failure classification for all socket and epoll operations. Values are stored on the socket as
///  its `last_error`, hence `Clone`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SocketError {
    #[error("operation not supported in socket state {state}: {detail}")]
    InvalidState { state: &'static str, detail: &'static str },
    #[error("invalid address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: &'static str },
    #[error("invalid value for option {option}: {reason}")]
    InvalidValue { option: SocketOption, reason: String },
    #[error("unknown socket option '{0}'")]
    UnknownOption(String),
    #[error("connection setup failure: connection timed out")]
    ConnectionTimedOut,
    #[error("connection setup failure: connection rejected by peer ({0:?})")]
    ConnectionRefused(RejectReason),
    #[error("connection setup failure: {0}")]
    ConnectionSetup(String),
    #[error("socket {0} is closed")]
    ClosedSocket(SocketId),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),
    #[error("unknown epoll context {0}")]
    UnknownEpoll(EpollId),
    #[error("socket {socket} is not subscribed to epoll context {epoll}")]
    UnknownSubscription { epoll: EpollId, socket: SocketId },
}

impl SocketError {
    /// A recoverable error leaves the socket (or the caller) in a state where retrying the same
    ///  operation is legal.
    pub fn is_recoverable(&self) -> bool {
        use SocketError::*;

        match self {
            ConnectionTimedOut | ConnectionRefused(_) | ConnectionSetup(_) | ResourceExhausted(_) => true,
            InvalidState { .. } | InvalidAddress { .. } | InvalidValue { .. } | UnknownOption(_) => true,
            ClosedSocket(_) | UnknownSocket(_) | UnknownEpoll(_) | UnknownSubscription { .. } => false,
        }
    }
}
