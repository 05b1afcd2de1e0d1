use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Error;

use super::{Event, Lease, Store, Watcher};

const WATCH_BUFFER: usize = 64;

/// in-process [`Store`]. keys live for as long as their lease handle does:
/// dropping the [`Lease`] (or the registry draining it) removes the key and
/// emits a delete event, mirroring lease expiry in an external store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, String>,
    watchers: Vec<Watch>,
}

struct Watch {
    prefix: String,
    tx: mpsc::Sender<Event>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// administrative delete, emitting the delete event to live watchers.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.data.remove(key).is_some() {
            inner.broadcast(Event::Delete { key: key.to_owned() });
        }
    }
}

impl Inner {
    fn broadcast(&mut self, event: Event) {
        let key = match &event {
            Event::Put { key, .. } | Event::Delete { key } => key.clone(),
        };
        // a watcher that went away or can not keep up loses its subscription.
        // the registry re-subscribes with backoff.
        self.watchers
            .retain(|w| !key.starts_with(&w.prefix) || w.tx.try_send(event.clone()).is_ok());
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> Result<Lease, Error> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.data.insert(key.to_owned(), value.to_owned());
            inner.broadcast(Event::Put {
                key: key.to_owned(),
                value: value.to_owned(),
            });
        }

        let (ack_tx, ack_rx) = mpsc::channel(1);
        let store = self.inner.clone();
        let key = key.to_owned();
        let period = Duration::from_secs((ttl_secs / 2).max(1));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if ack_tx.send(()).await.is_err() {
                    // lease holder is gone; expire the key.
                    let mut inner = store.lock().unwrap();
                    if inner.data.remove(&key).is_some() {
                        inner.broadcast(Event::Delete { key: key.clone() });
                    }
                    return;
                }
            }
        });

        Ok(Lease::new(ack_rx))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<Watcher, Error> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.inner.lock().unwrap().watchers.push(Watch {
            prefix: prefix.to_owned(),
            tx,
        });
        Ok(Watcher::new(rx))
    }
}
