use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{info, Level};
use streamconn::config::CoreConfig;
use streamconn::epoll::{EpollFlags, WaitOutcome};
use streamconn::handshake::listener::HandshakeListener;
use streamconn::manager::SocketManager;
use streamconn::options::SocketOption;

fn init_logging() {
    tracing_subscriber::fmt()
        // .with_max_level(Level::TRACE)
        .with_max_level(Level::DEBUG)
        .with_thread_ids(true)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let listener = HandshakeListener::spawn(SocketAddr::from_str("127.0.0.1:9200")?, 16, |request| {
        info!("accepting {:?}", request);
        Ok(())
    }).await?;

    // bound but never read from, so connect attempts to it time out
    let silent = UdpSocket::bind("127.0.0.1:0").await?;

    let manager = SocketManager::new_udp(CoreConfig::default())?;
    let epoll = manager.epoll_create().await?;

    let to_listener = manager.create_socket().await?;
    let to_silent = manager.create_socket().await?;
    for socket in [to_listener, to_silent] {
        manager.set_option(socket, SocketOption::ReceiveSync, false).await?;
        manager.set_option(socket, SocketOption::ConnectTimeout, 1000).await?;
        manager.epoll_add(epoll, socket, EpollFlags::WRITE | EpollFlags::ERROR).await?;
    }

    manager.connect(to_listener, listener.local_addr()).await?;
    manager.connect(to_silent, silent.local_addr()?).await?;

    let mut pending = 2;
    while pending > 0 {
        match manager.epoll_wait(epoll, Some(Duration::from_secs(5))).await? {
            WaitOutcome::TimedOut => {
                info!("nothing happened for 5 seconds");
                break;
            }
            WaitOutcome::Ready(ready) => {
                for socket in ready.write {
                    info!("socket {} is {:?}, last error: {:?}", socket, manager.socket_state(socket).await?, manager.last_error(socket).await?);
                    manager.epoll_remove(epoll, socket).await?;
                    pending -= 1;
                }
            }
        }
    }

    if let Some(peer) = listener.accept().await {
        info!("listener side: {:?}", peer);
    }

    manager.epoll_release(epoll).await?;
    manager.close(to_listener).await?;
    manager.close(to_silent).await?;
    manager.shutdown();
    listener.shutdown();
    Ok(())
}
