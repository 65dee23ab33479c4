use std::sync::Arc;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;
use crate::error::{SocketError, SocketResult};
use crate::options::SocketOptions;
use crate::socket::{Socket, SocketId};

struct SocketTableInner {
    sockets: FxHashMap<SocketId, Arc<Socket>>,
    next_id: u32,
}

/// Registry of live sockets. Ids are allocated monotonically and never reused, so an id that was
///  handed out but is no longer registered belongs to a closed socket.
pub struct SocketTable {
    inner: RwLock<SocketTableInner>,
    max_sockets: usize,
}

impl SocketTable {
    pub fn new(max_sockets: usize) -> SocketTable {
        SocketTable {
            inner: RwLock::new(SocketTableInner {
                sockets: FxHashMap::default(),
                next_id: 1,
            }),
            max_sockets,
        }
    }

    /// creates and registers a socket in state `Opened`
    pub async fn create(&self, options: SocketOptions) -> SocketResult<Arc<Socket>> {
        let mut inner = self.inner.write().await;
        if inner.sockets.len() >= self.max_sockets {
            return Err(SocketError::ResourceExhausted("socket limit reached"));
        }

        let id = SocketId(inner.next_id);
        inner.next_id = inner.next_id.checked_add(1)
            .ok_or(SocketError::ResourceExhausted("socket ids"))?;

        let socket = Arc::new(Socket::new(id, options));
        socket.open();
        inner.sockets.insert(id, socket.clone());
        debug!("created socket {}", id);
        Ok(socket)
    }

    pub async fn get(&self, id: SocketId) -> SocketResult<Arc<Socket>> {
        let inner = self.inner.read().await;
        match inner.sockets.get(&id) {
            Some(socket) => Ok(socket.clone()),
            None if id.0 > 0 && id.0 < inner.next_id => Err(SocketError::ClosedSocket(id)),
            None => Err(SocketError::UnknownSocket(id)),
        }
    }

    /// like `get`, but without distinguishing why a socket is absent
    pub async fn lookup(&self, id: SocketId) -> Option<Arc<Socket>> {
        self.inner.read().await
            .sockets
            .get(&id)
            .cloned()
    }

    pub async fn remove(&self, id: SocketId) -> Option<Arc<Socket>> {
        self.inner.write().await
            .sockets
            .remove(&id)
    }
}
