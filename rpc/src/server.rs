use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    net::TcpListener,
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, error, info};

use crate::{
    codec::{self, CodecType},
    compress::Compression,
    error::{Error, MethodNotFound, RateLimited},
    limit::TokenBucket,
    protocol::{Header, Message},
    transport::Connection,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Method = Box<dyn Fn(CodecType, &[u8]) -> Result<Vec<u8>, BoxError> + Send + Sync>;

/// a named bag of methods. each registration wraps the handler in a shim that
/// owns unmarshaling the request and marshaling the reply, so dispatch only
/// ever deals in bytes and `service_name + method_name` stays the sole
/// routing key on the wire.
#[derive(Default)]
pub struct Service {
    methods: HashMap<String, Method>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// register a method under `name`. the handler receives the unmarshaled
    /// request and a fresh zero valued reply to fill in; returning an error
    /// turns into an error response carrying the error's message.
    pub fn method<Req, Reply, F>(mut self, name: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Default,
        Reply: Serialize + Default,
        F: Fn(Req, &mut Reply) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let shim = move |codec_type: CodecType, body: &[u8]| -> Result<Vec<u8>, BoxError> {
            let req = if body.is_empty() {
                Req::default()
            } else {
                codec::unmarshal(codec_type, body)?
            };

            let mut reply = Reply::default();
            handler(req, &mut reply)?;

            Ok(codec::marshal(codec_type, &reply)?)
        };

        self.methods.insert(name.to_owned(), Box::new(shim));
        self
    }
}

/// builder for [`Server`].
pub struct ServerBuilder {
    codec: CodecType,
    rate: u64,
}

impl ServerBuilder {
    /// set the codec replies are marshaled with.
    ///
    /// # Default
    /// codec default to JSON
    pub fn codec(mut self, codec: CodecType) -> Self {
        self.codec = codec;
        self
    }

    /// set the server side admission rate in requests per second.
    ///
    /// # Default
    /// rate default to 10000
    pub fn rate(mut self, rate: u64) -> Self {
        self.rate = rate;
        self
    }

    pub fn build(self) -> Server {
        Server {
            codec: self.codec,
            rate: self.rate,
            services: HashMap::new(),
        }
    }
}

/// rpc server: accept loop plus per connection frame dispatch.
///
/// requests from a single connection are processed strictly in order; a slow
/// method blocks the next request on the same connection. callers needing
/// parallelism open more connections.
pub struct Server {
    codec: CodecType,
    rate: u64,
    services: HashMap<String, Service>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            codec: CodecType::Json,
            rate: 10_000,
        }
    }

    /// register a service under the name clients route to.
    pub fn register(&mut self, name: impl Into<String>, service: Service) {
        self.services.insert(name.into(), service);
    }

    /// bind `addr` and spawn the accept loop. the returned handle owns the
    /// server's lifetime.
    pub async fn serve(self, addr: &str) -> Result<ServerHandle, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!("listening on {local_addr}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            codec: self.codec,
            limiter: TokenBucket::new(self.rate),
            services: self.services,
        });

        let accept = tokio::spawn(accept_loop(listener, shared, shutdown_rx));

        Ok(ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            accept,
        })
    }
}

/// handle to a running server. dropping it shuts the server down as well.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// stop accepting, then signal every connection task to close its socket.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.accept.await;
        info!("server shutdown complete");
    }
}

struct Shared {
    codec: CodecType,
    limiter: TokenBucket,
    services: HashMap<String, Service>,
}

impl Shared {
    fn dispatch(&self, msg: &Message) -> Message {
        match self.invoke(msg) {
            Ok(body) => Message {
                header: Header {
                    request_id: msg.header.request_id,
                    codec_type: self.codec,
                    compression: Compression::Gzip,
                    ..Default::default()
                },
                body,
            },
            Err(e) => error_response(msg.header.request_id, &e.to_string()),
        }
    }

    fn invoke(&self, msg: &Message) -> Result<Vec<u8>, BoxError> {
        let header = &msg.header;

        let method = self
            .services
            .get(&header.service_name)
            .and_then(|service| service.methods.get(&header.method_name))
            .ok_or_else(|| MethodNotFound {
                service: header.service_name.clone(),
                method: header.method_name.clone(),
            })?;

        (method)(self.codec, &msg.body)
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(handle_connection(
                        Connection::new(stream),
                        shared.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => error!("accept failed: {e}"),
            },
            _ = shutdown.changed() => {
                info!("accept loop stopped");
                return;
            }
        }
    }
}

/// reads frames off one connection until it dies or shutdown is signalled.
/// admission runs before dispatch; a refused request is answered in band so
/// the caller's pending entry resolves.
async fn handle_connection(conn: Connection, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let msg = tokio::select! {
            res = conn.read() => match res {
                Ok(msg) => msg,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        if !shared.limiter.allow() {
            let resp = error_response(msg.header.request_id, &RateLimited.to_string());
            if conn.write(&resp).await.is_err() {
                break;
            }
            continue;
        }

        // TODO: dispatch on a task per request so a slow method stops
        // blocking the requests queued behind it on the same connection.
        let resp = shared.dispatch(&msg);
        if conn.write(&resp).await.is_err() {
            break;
        }
    }

    conn.close();
}

fn error_response(request_id: u64, error: &str) -> Message {
    Message {
        header: Header {
            request_id,
            error: error.to_owned(),
            compression: Compression::Gzip,
            ..Default::default()
        },
        body: Vec::new(),
    }
}
