//! service registration and discovery against an external strongly consistent
//! key value store with lease and watch semantics. the [`Store`] trait is the
//! boundary; [`MemoryStore`] is the in-process implementation used by tests
//! and single-host setups.
//!
//! discovered instances are cached per service. the cache is seeded on the
//! first discovery and kept live by a background watch task, so it is
//! eventually consistent with the store: a freshly deleted instance may be
//! returned until its delete event is applied.

mod memory;

pub use self::memory::MemoryStore;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::warn;

use crate::error::Error;

/// namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "mux-rpc";

/// one registered service endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// "host:port" of the endpoint.
    pub addr: String,
}

impl Instance {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

/// change notification delivered by a watch.
#[derive(Debug, Clone)]
pub enum Event {
    Put { key: String, value: String },
    Delete { key: String },
}

/// live subscription to store events under a prefix. the stream ends when the
/// store drops the subscription; the registry reconnects with backoff.
pub struct Watcher {
    rx: mpsc::Receiver<Event>,
}

impl Watcher {
    pub fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// keep-alive handle for a lease backed registration. the store acks
/// periodically while the lease is being kept alive; the stream closing means
/// the registration is gone.
pub struct Lease {
    acks: mpsc::Receiver<()>,
}

impl Lease {
    pub fn new(acks: mpsc::Receiver<()>) -> Self {
        Self { acks }
    }

    pub async fn recv(&mut self) -> Option<()> {
        self.acks.recv().await
    }
}

/// the abstract key value store the registry runs against. implementations
/// must provide lease scoped puts, point in time prefix listing and prefix
/// watches.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// persist `key = value` under a lease of `ttl_secs`, keeping the lease
    /// alive until the returned handle is dropped.
    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> Result<Lease, Error>;

    /// point in time listing of every key under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, Error>;

    /// subscribe to changes under `prefix`.
    async fn watch(&self, prefix: &str) -> Result<Watcher, Error>;
}

type Cache = Arc<RwLock<HashMap<String, HashMap<String, Instance>>>>;

/// watch backed service registry. keys are laid out as
/// `/<namespace>/services/<service>/<addr>` with the addr as value.
pub struct Registry {
    store: Arc<dyn Store>,
    prefix: String,
    services: Cache,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_namespace(store, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(store: Arc<dyn Store>, namespace: &str) -> Self {
        Self {
            store,
            prefix: format!("/{namespace}/services/"),
            services: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// register an instance with a lease of `ttl_secs`. failure to establish
    /// the initial lease is returned; once established, a background task
    /// drains keep-alive acks and a later loss of the lease only drops the
    /// registration (no re-registration is attempted).
    pub async fn register(&self, service: &str, instance: Instance, ttl_secs: u64) -> Result<(), Error> {
        let key = format!("{}{}/{}", self.prefix, service, instance.addr);
        let mut lease = self.store.put(&key, &instance.addr, ttl_secs).await?;

        let task = tokio::spawn(async move {
            while lease.recv().await.is_some() {}
            warn!("keep-alive for {key} closed. registration dropped");
        });
        self.tasks.lock().unwrap().push(task);

        Ok(())
    }

    /// snapshot of the live instances of a service. the first call per
    /// service lists the store, seeds the cache and starts the watch task
    /// that keeps it live; every later call reads the cache only.
    pub async fn discover(&self, service: &str) -> Result<Vec<Instance>, Error> {
        if let Some(instances) = self.snapshot(service) {
            return Ok(instances);
        }

        self.init_service(service).await?;

        Ok(self.snapshot(service).unwrap_or_default())
    }

    /// stop every keep-alive and watch task. also runs on drop.
    pub fn close(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    fn snapshot(&self, service: &str) -> Option<Vec<Instance>> {
        self.services
            .read()
            .unwrap()
            .get(service)
            .map(|instances| instances.values().cloned().collect())
    }

    async fn init_service(&self, service: &str) -> Result<(), Error> {
        let prefix = format!("{}{}/", self.prefix, service);

        // subscribe before listing so nothing slips between the snapshot and
        // the watch. events overlapping the snapshot re-apply idempotently.
        let watcher = self.store.watch(&prefix).await?;
        let kvs = self.store.list(&prefix).await?;

        {
            let mut services = self.services.write().unwrap();
            // a concurrent discovery may have won the seeding race.
            if services.contains_key(service) {
                return Ok(());
            }

            let instances = kvs
                .into_iter()
                .map(|(_, addr)| (addr.clone(), Instance { addr }))
                .collect();
            services.insert(service.to_owned(), instances);
        }

        let task = tokio::spawn(watch_service(
            self.store.clone(),
            self.services.clone(),
            prefix,
            service.to_owned(),
            watcher,
        ));
        self.tasks.lock().unwrap().push(task);

        Ok(())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.close();
    }
}

/// applies put/delete events to the service cache for as long as the registry
/// lives, re-subscribing with at least a second of backoff whenever the watch
/// stream drops.
async fn watch_service(
    store: Arc<dyn Store>,
    services: Cache,
    prefix: String,
    service: String,
    mut watcher: Watcher,
) {
    loop {
        while let Some(event) = watcher.next().await {
            let mut services = services.write().unwrap();
            let Some(instances) = services.get_mut(&service) else {
                continue;
            };

            match event {
                Event::Put { value, .. } => {
                    instances.insert(value.clone(), Instance { addr: value });
                }
                Event::Delete { key } => {
                    let addr = key.strip_prefix(&prefix).unwrap_or(&key);
                    instances.remove(addr);
                }
            }
        }

        warn!("watch stream for {service} ended. re-subscribing");

        watcher = loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match store.watch(&prefix).await {
                Ok(watcher) => break watcher,
                Err(e) => warn!("watch for {service} failed: {e}. retrying"),
            }
        };
    }
}
