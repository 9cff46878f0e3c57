//! Reverse listener registry.
//!
//! The agent opens listeners on behalf of the proxy and parks every
//! accepted socket until the proxy claims it with a sock-attach session.
//! Both tables live here, owned by the agent's top level and handed to
//! session tasks as a shared handle; ids are process-monotonic signed
//! counters, conntrack ids monotonic across all listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use pivot_core::{Error, Result};

struct ListenerEntry {
    shutdown_tx: mpsc::Sender<()>,
}

struct ParkedSock {
    listener_id: i32,
    stream: TcpStream,
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<i32, ListenerEntry>>,
    conntrack: Mutex<HashMap<i32, ParkedSock>>,
    next_listener_id: AtomicI32,
    next_sock_id: AtomicI32,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a freshly bound listener. The returned receiver
    /// fires when the listener should stop accepting.
    pub fn register(&self) -> (i32, mpsc::Receiver<()>) {
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.listeners
            .lock()
            .unwrap()
            .insert(listener_id, ListenerEntry { shutdown_tx });
        (listener_id, shutdown_rx)
    }

    /// Park an accepted socket, returning its conntrack id.
    pub fn park(&self, listener_id: i32, stream: TcpStream) -> i32 {
        let sock_id = self.next_sock_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.conntrack
            .lock()
            .unwrap()
            .insert(sock_id, ParkedSock { listener_id, stream });
        sock_id
    }

    /// Remove and return a parked socket.
    pub fn claim(&self, sock_id: i32) -> Option<TcpStream> {
        self.conntrack
            .lock()
            .unwrap()
            .remove(&sock_id)
            .map(|parked| parked.stream)
    }

    /// Close a listener: signal its accept loop and drop every socket it
    /// accepted that was never claimed.
    pub fn close(&self, listener_id: i32) -> Result<()> {
        let entry = self
            .listeners
            .lock()
            .unwrap()
            .remove(&listener_id)
            .ok_or(Error::UnknownListener(listener_id))?;
        let _ = entry.shutdown_tx.try_send(());

        let mut conntrack = self.conntrack.lock().unwrap();
        let before = conntrack.len();
        conntrack.retain(|_, parked| parked.listener_id != listener_id);
        let dropped = before - conntrack.len();
        if dropped > 0 {
            debug!(listener_id, dropped, "dropped unclaimed sockets");
        }

        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn listener_ids_start_at_zero_and_increase() {
        let registry = ListenerRegistry::new();
        let (first, _rx1) = registry.register();
        let (second, _rx2) = registry.register();
        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert_eq!(registry.listener_count(), 2);
    }

    #[tokio::test]
    async fn sock_ids_start_at_one_and_span_listeners() {
        let registry = ListenerRegistry::new();
        let (a, _rx_a) = registry.register();
        let (b, _rx_b) = registry.register();

        let (_c1, s1) = connected_pair().await;
        let (_c2, s2) = connected_pair().await;

        assert_eq!(registry.park(a, s1), 1);
        assert_eq!(registry.park(b, s2), 2);
    }

    #[tokio::test]
    async fn claim_removes_the_parked_socket() {
        let registry = ListenerRegistry::new();
        let (id, _rx) = registry.register();
        let (_client, server) = connected_pair().await;

        let sock_id = registry.park(id, server);
        assert!(registry.claim(sock_id).is_some());
        assert!(registry.claim(sock_id).is_none());
    }

    #[tokio::test]
    async fn close_signals_shutdown_and_drains_unclaimed() {
        let registry = ListenerRegistry::new();
        let (id, mut shutdown_rx) = registry.register();

        let (mut client, server) = connected_pair().await;
        let sock_id = registry.park(id, server);

        registry.close(id).unwrap();

        // The accept loop was signalled...
        assert!(shutdown_rx.recv().await.is_some());
        // ...the parked socket is gone and its peer sees the close.
        assert!(registry.claim(sock_id).is_none());
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_leaves_other_listeners_sockets_alone() {
        let registry = ListenerRegistry::new();
        let (a, _rx_a) = registry.register();
        let (b, _rx_b) = registry.register();

        let (_ca, sa) = connected_pair().await;
        let (_cb, sb) = connected_pair().await;
        let _sock_a = registry.park(a, sa);
        let sock_b = registry.park(b, sb);

        registry.close(a).unwrap();
        assert!(registry.claim(sock_b).is_some());
    }

    #[test]
    fn close_unknown_listener_fails() {
        let registry = ListenerRegistry::new();
        assert!(matches!(
            registry.close(99),
            Err(Error::UnknownListener(99))
        ));
    }
}
