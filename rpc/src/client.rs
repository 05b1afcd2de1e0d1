use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    balance::{LoadBalance, RoundRobin},
    breaker::CircuitBreaker,
    codec::{self, CodecType},
    compress::Compression,
    error::{BreakerOpen, Error, NoInstance, RateLimited, Timeout},
    limit::TokenBucket,
    protocol::{Header, Message},
    registry::Registry,
    transport::{ConnectionPool, Response},
};

/// builder for [`Client`]. every knob has a production default; construction
/// happens inside a tokio runtime (the admission bucket spawns its refill
/// task).
pub struct ClientBuilder {
    registry: Arc<Registry>,
    codec: CodecType,
    timeout: Duration,
    balancer: Box<dyn LoadBalance>,
    rate: u64,
    max_active: usize,
    breaker_window: usize,
    breaker_threshold: f64,
    breaker_open_timeout: Duration,
}

impl ClientBuilder {
    /// set the codec bodies are marshaled with.
    ///
    /// # Default
    /// codec default to JSON
    pub fn codec(mut self, codec: CodecType) -> Self {
        self.codec = codec;
        self
    }

    /// set the overall request timeout. bounds pool acquisition (including
    /// the dial) and waiting for the response.
    ///
    /// # Default
    /// timeout default to 5 seconds
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// set the balancer picking an endpoint out of each discovery snapshot.
    ///
    /// # Default
    /// balancer default to round robin
    pub fn balancer<B>(mut self, balancer: B) -> Self
    where
        B: LoadBalance + 'static,
    {
        self.balancer = Box::new(balancer) as _;
        self
    }

    /// set the local admission rate in requests per second.
    ///
    /// # Default
    /// rate default to 10000
    pub fn rate(mut self, rate: u64) -> Self {
        self.rate = rate;
        self
    }

    /// set how many multiplexed connections each endpoint pool may hold.
    ///
    /// # Default
    /// max_active default to 1: a single multiplexed connection per endpoint
    pub fn max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active.max(1);
        self
    }

    /// configure the circuit breakers created per (service, addr) pair.
    ///
    /// # Default
    /// window 10 outcomes, failure threshold 0.6, open timeout 5 seconds
    pub fn breaker(mut self, window: usize, threshold: f64, open_timeout: Duration) -> Self {
        self.breaker_window = window;
        self.breaker_threshold = threshold;
        self.breaker_open_timeout = open_timeout;
        self
    }

    pub fn build(self) -> Client {
        Client {
            registry: self.registry,
            codec: self.codec,
            timeout: self.timeout,
            balancer: self.balancer,
            limiter: TokenBucket::new(self.rate),
            max_active: self.max_active,
            breaker_window: self.breaker_window,
            breaker_threshold: self.breaker_threshold,
            breaker_open_timeout: self.breaker_open_timeout,
            pools: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }
}

/// rpc client. composes admission control, service discovery, load
/// balancing, per endpoint circuit breaking and connection pooling around the
/// multiplexed transport.
pub struct Client {
    registry: Arc<Registry>,
    codec: CodecType,
    timeout: Duration,
    balancer: Box<dyn LoadBalance>,
    limiter: TokenBucket,
    max_active: usize,
    breaker_window: usize,
    breaker_threshold: f64,
    breaker_open_timeout: Duration,
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Client {
    pub fn builder(registry: Arc<Registry>) -> ClientBuilder {
        ClientBuilder {
            registry,
            codec: CodecType::Json,
            timeout: Duration::from_secs(5),
            balancer: Box::new(RoundRobin::new()),
            rate: 10_000,
            max_active: 1,
            breaker_window: 10,
            breaker_threshold: 0.6,
            breaker_open_timeout: Duration::from_secs(5),
        }
    }

    /// fire a request and hand back its completion handle. the breaker for
    /// the selected endpoint is fed from the completion outcome, so an
    /// abandoned handle still counts.
    pub async fn invoke_async<A>(&self, service: &str, method: &str, args: &A) -> Result<Response, Error>
    where
        A: Serialize,
    {
        if !self.limiter.allow() {
            return Err(RateLimited.into());
        }

        let instances = self.registry.discover(service).await?;
        let addr = match self.balancer.select(&instances) {
            Some(instance) => instance.addr.clone(),
            None => return Err(NoInstance.into()),
        };

        debug!("{service}.{method} routed to {addr}");

        let breaker = self.breaker(service, &addr);
        if !breaker.allow() {
            return Err(BreakerOpen.into());
        }

        let pool = self.pool(&addr);
        let client = match tokio::time::timeout(self.timeout, pool.acquire()).await {
            Ok(res) => res?,
            Err(_) => return Err(Timeout.into()),
        };

        let body = codec::marshal(self.codec, args)?;

        let msg = Message {
            header: Header {
                service_name: service.to_owned(),
                method_name: method.to_owned(),
                codec_type: self.codec,
                compression: Compression::Gzip,
                ..Default::default()
            },
            body,
        };

        match client.send(msg).await {
            Ok(response) => {
                let breaker = breaker.clone();
                response.on_complete(move |err| {
                    if err.is_some() {
                        breaker.record_failure();
                    } else {
                        breaker.record_success();
                    }
                });
                Ok(response)
            }
            Err(e) => {
                breaker.record_failure();
                Err(e)
            }
        }
    }

    /// synchronous form: fire, wait bounded by the configured timeout and
    /// unmarshal the reply. the in flight request is not cancelled when the
    /// wait ends early; a late response resolves in the background.
    pub async fn invoke<A, R>(&self, service: &str, method: &str, args: &A) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let response = self.invoke_async(service, method, args).await?;

        let body = match tokio::time::timeout(self.timeout, response.recv()).await {
            Ok(res) => res?,
            Err(_) => return Err(Timeout.into()),
        };

        codec::unmarshal(self.codec, &body).map_err(Into::into)
    }

    /// close every endpoint pool. no new requests can be sent; waits on
    /// still outstanding responses end through their timeout.
    pub async fn close(&self) {
        let pools = {
            let mut pools = self.pools.lock().unwrap();
            pools.drain().map(|(_, pool)| pool).collect::<Vec<_>>()
        };

        for pool in pools {
            pool.close().await;
        }
    }

    fn pool(&self, addr: &str) -> Arc<ConnectionPool> {
        self.pools
            .lock()
            .unwrap()
            .entry(addr.to_owned())
            .or_insert_with(|| {
                Arc::new(ConnectionPool::new(addr.to_owned(), self.max_active, self.timeout))
            })
            .clone()
    }

    fn breaker(&self, service: &str, addr: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .unwrap()
            .entry(format!("{service}|{addr}"))
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.breaker_window,
                    self.breaker_threshold,
                    self.breaker_open_timeout,
                ))
            })
            .clone()
    }
}
