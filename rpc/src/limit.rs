use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

/// process local admission control. coarse by design: a background task
/// resets the bucket to its full rate once per second rather than refilling
/// continuously.
pub(crate) struct TokenBucket {
    inner: Arc<Inner>,
}

struct Inner {
    tokens: Mutex<u64>,
    rate: u64,
}

impl TokenBucket {
    /// must be called from within a tokio runtime; the refill task stops by
    /// itself once the bucket is dropped.
    pub(crate) fn new(rate: u64) -> Self {
        let inner = Arc::new(Inner {
            tokens: Mutex::new(rate),
            rate,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(refill(weak));

        Self { inner }
    }

    pub(crate) fn allow(&self) -> bool {
        let mut tokens = self.inner.tokens.lock().unwrap();
        if *tokens > 0 {
            *tokens -= 1;
            return true;
        }
        false
    }
}

async fn refill(inner: Weak<Inner>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.tick().await;

    loop {
        interval.tick().await;
        match inner.upgrade() {
            Some(inner) => *inner.tokens.lock().unwrap() = inner.rate,
            None => return,
        }
    }
}
