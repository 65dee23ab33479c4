//! Connect timeouts against a peer that never answers, over real UDP on the loopback interface.
//!
//! The 'peer' is a bound UDP socket that is never read from: handshake requests are delivered
//!  and silently queued, so every connect attempt runs into its timeout.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::Level;
use streamconn::config::CoreConfig;
use streamconn::epoll::{EpollFlags, WaitOutcome};
use streamconn::error::SocketError;
use streamconn::manager::SocketManager;
use streamconn::options::{OptionValue, SocketOption};
use streamconn::socket::SocketState;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

async fn silent_peer() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

fn manager() -> SocketManager {
    SocketManager::new_udp(CoreConfig::default()).expect("valid config")
}

#[tokio::test]
async fn test_default_connect_timeout() {
    let manager = manager();
    let socket = manager.create_socket().await.unwrap();

    assert_eq!(manager.get_option(socket, SocketOption::ConnectTimeout).await.unwrap(), OptionValue::Int(3000));
    assert_eq!(manager.get_option_by_name(socket, "connect_timeout").await.unwrap(), OptionValue::Int(3000));
}

#[tokio::test]
async fn test_non_blocking_timeout_is_reported_as_readable_and_writable() {
    let (_peer, peer_addr) = silent_peer().await;
    let manager = manager();

    let socket = manager.create_socket().await.unwrap();
    manager.set_option(socket, SocketOption::ReceiveSync, false).await.unwrap();
    manager.set_option(socket, SocketOption::ConnectTimeout, 500).await.unwrap();

    let epoll = manager.epoll_create().await.unwrap();
    manager.epoll_add(epoll, socket, EpollFlags::WRITE | EpollFlags::ERROR).await.unwrap();

    let start = Instant::now();
    manager.connect(socket, peer_addr).await.unwrap();
    assert_eq!(manager.socket_state(socket).await.unwrap(), SocketState::Connecting);

    let outcome = manager.epoll_wait(epoll, Some(Duration::from_millis(600))).await.unwrap();
    let elapsed = start.elapsed();

    let WaitOutcome::Ready(ready) = outcome else {
        panic!("the timed out socket was not reported");
    };
    assert!(elapsed >= Duration::from_millis(450), "reported after {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(550), "reported after {:?}", elapsed);

    assert_eq!(ready.read, vec![socket]);
    assert_eq!(ready.write, vec![socket]);
    assert_eq!(ready.error, vec![socket]);
    assert_eq!(ready.len(), 2);

    assert_eq!(manager.socket_state(socket).await.unwrap(), SocketState::Broken);
    assert_eq!(manager.last_error(socket).await.unwrap(), Some(SocketError::ConnectionTimedOut));
}

#[tokio::test]
async fn test_blocking_timeouts_repeat() {
    let (_peer, peer_addr) = silent_peer().await;
    let manager = manager();

    let socket = manager.create_socket().await.unwrap();
    manager.set_option(socket, SocketOption::ConnectTimeout, 100).await.unwrap();

    for attempt in 0..10 {
        let start = Instant::now();
        let result = manager.connect(socket, peer_addr).await;
        assert_eq!(result, Err(SocketError::ConnectionTimedOut), "attempt {}", attempt);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(manager.socket_state(socket).await.unwrap(), SocketState::Broken);
    }
}

#[tokio::test]
async fn test_poll_once_without_ready_sockets() {
    let (_peer, peer_addr) = silent_peer().await;
    let manager = manager();

    let socket = manager.create_socket().await.unwrap();
    manager.set_option(socket, SocketOption::ReceiveSync, false).await.unwrap();
    let epoll = manager.epoll_create().await.unwrap();
    manager.epoll_add(epoll, socket, EpollFlags::all()).await.unwrap();
    manager.connect(socket, peer_addr).await.unwrap();

    let start = Instant::now();
    let outcome = manager.epoll_wait(epoll, Some(Duration::ZERO)).await.unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn test_closing_a_connecting_socket() {
    let (_peer, peer_addr) = silent_peer().await;
    let manager = manager();

    let socket = manager.create_socket().await.unwrap();
    manager.set_option(socket, SocketOption::ReceiveSync, false).await.unwrap();
    manager.set_option(socket, SocketOption::ConnectTimeout, 200).await.unwrap();
    let epoll = manager.epoll_create().await.unwrap();
    manager.epoll_add(epoll, socket, EpollFlags::all()).await.unwrap();

    manager.connect(socket, peer_addr).await.unwrap();
    manager.close(socket).await.unwrap();

    // the deadline passes while waiting, but the socket is gone
    let outcome = manager.epoll_wait(epoll, Some(Duration::from_millis(400))).await.unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);

    assert_eq!(manager.close(socket).await, Err(SocketError::ClosedSocket(socket)));
    assert_eq!(manager.connect(socket, peer_addr).await, Err(SocketError::ClosedSocket(socket)));
    assert_eq!(manager.last_error(socket).await, Err(SocketError::ClosedSocket(socket)));
}
