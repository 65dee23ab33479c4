//! Connection lifecycle and readiness core for a UDP based streaming transport.
//!
//! Sockets go through a state machine from creation to close, connecting to a peer through a
//!  handshake that is driven by a single background worker. Connect attempts are bounded by a
//!  per-socket timeout which is enforced identically for blocking and non-blocking sockets.
//!  Applications observe the outcome of non-blocking connects through epoll contexts, which
//!  report sockets as readable, writable or failed.
//!
//! ```no_run
//! use std::time::Duration;
//! use streamconn::config::CoreConfig;
//! use streamconn::epoll::EpollFlags;
//! use streamconn::manager::SocketManager;
//! use streamconn::options::SocketOption;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let manager = SocketManager::new_udp(CoreConfig::default())?;
//! let socket = manager.create_socket().await?;
//! manager.set_option(socket, SocketOption::ReceiveSync, false).await?;
//!
//! let epoll = manager.epoll_create().await?;
//! manager.epoll_add(epoll, socket, EpollFlags::WRITE | EpollFlags::ERROR).await?;
//! manager.connect(socket, "127.0.0.1:5555".parse()?).await?;
//!
//! if let Some(ready) = manager.epoll_wait(epoll, Some(Duration::from_secs(5))).await?.ready() {
//!     println!("ready for writing: {:?}, failed: {:?}", ready.write, ready.error);
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod epoll;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod options;
pub mod socket;
pub mod socket_table;
pub mod worker;
