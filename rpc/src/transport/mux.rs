use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::{
    error::{ConnectionClosed, DialFailed, Error, RemoteError},
    protocol::Message,
};

use super::{
    connection::Connection,
    response::{pair, Completer, Response},
};

/// one TCP connection carrying many concurrent requests, correlated by the
/// request id assigned at send time. one writer lock, one reader task, any
/// number of callers.
pub(crate) struct MuxClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MuxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxClient").finish_non_exhaustive()
    }
}

struct Shared {
    conn: Connection,
    seq: AtomicU64,
    pending: Mutex<HashMap<u64, Completer>>,
    closed: AtomicBool,
}

impl MuxClient {
    pub(crate) async fn connect(addr: &str, dial_timeout: Duration) -> Result<Self, Error> {
        let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DialFailed::timed_out())?
            .map_err(DialFailed)?;
        let _ = stream.set_nodelay(true);

        debug!("connected to {addr}");

        let shared = Arc::new(Shared {
            conn: Connection::new(stream),
            seq: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(read_loop(shared.clone()));

        Ok(Self { shared })
    }

    /// true once the client entered failed state or was closed. such a client
    /// rejects every send and is evicted by the pool on next acquisition.
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// assign a request id, park a completion handle in the pending table and
    /// write the frame. a write failure removes the handle, kills the whole
    /// client and fails every other in flight request with it.
    pub(crate) async fn send(&self, mut msg: Message) -> Result<Response, Error> {
        if self.is_closed() {
            return Err(ConnectionClosed.into());
        }

        let id = self.shared.seq.fetch_add(1, Ordering::Relaxed) + 1;
        msg.header.request_id = id;

        let (completer, response) = pair();
        self.shared.pending.lock().unwrap().insert(id, completer);

        if let Err(e) = self.shared.conn.write(&msg).await {
            self.shared.pending.lock().unwrap().remove(&id);
            self.shared.fail(&e.to_string());
            return Err(e);
        }

        Ok(response)
    }

    pub(crate) fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.conn.close();
        }
    }
}

/// runs for the client's lifetime. matches responses to pending requests by
/// request id; a response nobody is waiting for is discarded. any read
/// failure fails the whole client.
async fn read_loop(shared: Arc<Shared>) {
    loop {
        match shared.conn.read().await {
            Ok(msg) => {
                let completer = shared.pending.lock().unwrap().remove(&msg.header.request_id);
                let Some(completer) = completer else { continue };

                if msg.header.error.is_empty() {
                    completer.complete(Ok(msg.body));
                } else {
                    completer.complete(Err(RemoteError(msg.header.error).into()));
                }
            }
            Err(e) => {
                shared.fail(&e.to_string());
                return;
            }
        }
    }
}

impl Shared {
    /// one shot transition into failed state: close the socket and drain the
    /// pending table, completing every waiter with the failure.
    fn fail(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        error!("connection failed: {reason}");
        self.conn.close();

        let drained = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, completer)| completer).collect::<Vec<_>>()
        };

        for completer in drained {
            completer.complete(Err(io::Error::new(io::ErrorKind::BrokenPipe, reason.to_owned()).into()));
        }
    }
}
