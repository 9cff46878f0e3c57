//! The connection pool: a closable FIFO of terminated flows.
//!
//! Forwarder tasks enqueue without blocking; one broker consumes. The
//! lifecycle is monotonic: open, then closed. Closing drains whatever is
//! still queued, resetting queued TCP flows so nothing is left half-open
//! on the userland stack, and wakes every blocked `next` caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

use pivot_core::{Error, Result};

use crate::flow::TunConn;

pub struct ConnPool {
    queue: Mutex<VecDeque<TunConn>>,
    closed: AtomicBool,
    notify: Notify,
}

impl ConnPool {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Enqueue a flow. Non-blocking; fails once the pool is closed.
    pub fn add(&self, conn: TunConn) -> Result<()> {
        let mut queue = self.queue.lock().unwrap();
        if self.closed() {
            return Err(Error::PoolClosed);
        }
        queue.push_back(conn);
        drop(queue);

        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the next flow in FIFO order, waiting while the pool is open
    /// and empty. Returns `PoolClosed` once closed.
    pub async fn next(&self) -> Result<TunConn> {
        loop {
            // Register interest before checking, so a close or add racing
            // with the check still wakes this waiter.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.queue.lock().unwrap();
                if let Some(conn) = queue.pop_front() {
                    return Ok(conn);
                }
                if self.closed() {
                    return Err(Error::PoolClosed);
                }
            }

            notified.await;
        }
    }

    /// Close the pool. Idempotent. Queued TCP flows are terminated with
    /// reset; queued UDP and ICMP entries are dropped.
    pub fn close(&self) {
        let drained: Vec<TunConn> = {
            let mut queue = self.queue.lock().unwrap();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            queue.drain(..).collect()
        };

        if !drained.is_empty() {
            debug!(pending = drained.len(), "resetting flows queued at pool close");
        }
        for conn in drained {
            conn.terminate(true);
        }

        self.notify.notify_waiters();
    }
}

impl Default for ConnPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnPool {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowId, TcpRequest, UdpDatagram};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn flow(port: u16) -> FlowId {
        FlowId {
            src: "10.0.0.9:41000".parse().unwrap(),
            dst: format!("10.0.0.5:{port}").parse().unwrap(),
        }
    }

    fn datagram(port: u16) -> TunConn {
        TunConn::Udp(UdpDatagram {
            flow: flow(port),
            payload: vec![0u8; 4],
        })
    }

    #[tokio::test]
    async fn next_preserves_fifo_order() {
        let pool = ConnPool::new();
        for port in [1, 2, 3] {
            pool.add(datagram(port)).unwrap();
        }

        for port in [1u16, 2, 3] {
            match pool.next().await.unwrap() {
                TunConn::Udp(d) => assert_eq!(d.flow.dst.port(), port),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn next_wakes_on_add() {
        let pool = Arc::new(ConnPool::new());

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.add(datagram(7)).unwrap();
        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(conn.kind(), "udp");
    }

    #[tokio::test]
    async fn close_wakes_blocked_next_with_pool_closed() {
        let pool = Arc::new(ConnPool::new());

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn add_after_close_fails() {
        let pool = ConnPool::new();
        pool.close();
        assert!(matches!(pool.add(datagram(1)), Err(Error::PoolClosed)));
        assert!(pool.closed());
    }

    #[tokio::test]
    async fn next_drains_remaining_items_before_reporting_closed() {
        let pool = ConnPool::new();
        pool.add(datagram(1)).unwrap();
        // Close first, then observe: already-queued items were drained by
        // close itself, so next reports closed immediately.
        pool.close();
        assert!(matches!(pool.next().await, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn close_resets_queued_tcp_flows() {
        let pool = ConnPool::new();

        let (near, mut far) = tokio::io::duplex(64);
        pool.add(TunConn::Tcp(TcpRequest::new(flow(80), near))).unwrap();

        pool.close();

        // The peer of the queued stream observes teardown.
        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let pool = ConnPool::new();
        pool.close();
        pool.close();
        assert!(pool.closed());
    }
}
