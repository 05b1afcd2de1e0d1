use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;

use crate::error::{Error, PoolClosed};

use super::mux::MuxClient;

/// bounded set of multiplexed clients for a single endpoint. dialing cost is
/// amortized across callers; dead clients are evicted on the next
/// acquisition. fairness across callers is round-robin, not load aware.
pub(crate) struct ConnectionPool {
    addr: String,
    max_active: usize,
    dial_timeout: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    conns: Vec<Arc<MuxClient>>,
    next: usize,
    closed: bool,
}

impl ConnectionPool {
    pub(crate) fn new(addr: String, max_active: usize, dial_timeout: Duration) -> Self {
        Self {
            addr,
            max_active: max_active.max(1),
            dial_timeout,
            inner: Mutex::new(Inner {
                conns: Vec::new(),
                next: 0,
                closed: false,
            }),
        }
    }

    /// hand out a live client, dialing a new one while the pool is below its
    /// cap or when every pooled client has died. the inner lock is held
    /// across the dial so concurrent acquisitions do not overshoot the cap.
    pub(crate) async fn acquire(&self) -> Result<Arc<MuxClient>, Error> {
        let mut inner = self.inner.lock().await;

        if inner.closed {
            return Err(PoolClosed.into());
        }

        if inner.conns.len() < self.max_active {
            let client = Arc::new(MuxClient::connect(&self.addr, self.dial_timeout).await?);
            inner.conns.push(client.clone());
            return Ok(client);
        }

        inner.conns.retain(|client| !client.is_closed());

        if !inner.conns.is_empty() {
            let idx = inner.next % inner.conns.len();
            inner.next = idx + 1;
            return Ok(inner.conns[idx].clone());
        }

        // every pooled client was dead. start over with a fresh dial.
        let client = Arc::new(MuxClient::connect(&self.addr, self.dial_timeout).await?);
        inner.conns.push(client.clone());
        Ok(client)
    }

    /// mark closed and close every client. no new acquisitions are allowed.
    pub(crate) async fn close(&self) {
        let mut inner = self.inner.lock().await;

        if inner.closed {
            return;
        }
        inner.closed = true;

        for client in inner.conns.drain(..) {
            client.close();
        }
    }
}
