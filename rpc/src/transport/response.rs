use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::Error;

type Callback = Box<dyn FnOnce(Option<&Error>) + Send>;

/// one shot completion handle for a single in flight request.
///
/// completion happens at most once, from whichever side observes the outcome
/// first: the reader task on a matched response, or the failure path when the
/// owning connection dies. dropping the handle abandons the wait without
/// cancelling the request at the server; a late response still resolves the
/// shared state so outcome callbacks fire.
pub struct Response {
    inner: Arc<Shared>,
}

/// completion side held in the pending table.
pub(crate) struct Completer {
    inner: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

enum State {
    Pending { on_complete: Option<Callback> },
    Complete(Option<Result<Vec<u8>, Error>>),
}

pub(crate) fn pair() -> (Completer, Response) {
    let inner = Arc::new(Shared {
        state: Mutex::new(State::Pending { on_complete: None }),
        notify: Notify::new(),
    });
    (
        Completer {
            inner: inner.clone(),
        },
        Response { inner },
    )
}

impl Completer {
    /// resolve the request. later calls are ignored. the outcome callback, if
    /// registered, runs on the completing task before waiters wake.
    pub(crate) fn complete(&self, res: Result<Vec<u8>, Error>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            let State::Pending { on_complete } = &mut *state else {
                return;
            };
            if let Some(cb) = on_complete.take() {
                cb(res.as_ref().err());
            }
            *state = State::Complete(Some(res));
        }
        self.inner.notify.notify_waiters();
    }
}

impl Response {
    /// wait for the response body. a populated remote error header or a
    /// connection failure resolves to the corresponding error.
    pub async fn recv(self) -> Result<Vec<u8>, Error> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().unwrap();
                if let State::Complete(res) = &mut *state {
                    return res.take().expect("response resolved twice");
                }
            }
            notified.await;
        }
    }

    /// register an outcome callback. invoked with the completion error (or
    /// `None` on success) on the completing task; when registered after
    /// completion it is invoked immediately.
    pub(crate) fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Option<&Error>) + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        match &mut *state {
            State::Pending { on_complete } => *on_complete = Some(Box::new(f)),
            State::Complete(res) => f(res.as_ref().and_then(|r| r.as_ref().err())),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::RemoteError;

    use super::*;

    #[tokio::test]
    async fn completes_once() {
        let (completer, response) = pair();

        completer.complete(Ok(b"first".to_vec()));
        completer.complete(Ok(b"second".to_vec()));

        assert_eq!(response.recv().await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn error_completion() {
        let (completer, response) = pair();
        completer.complete(Err(RemoteError("boom".to_string()).into()));

        let err = response.recv().await.unwrap_err();
        assert_eq!(err.downcast_ref::<RemoteError>().unwrap().0, "boom");
    }

    #[tokio::test]
    async fn callback_fires_without_a_waiter() {
        let fired = Arc::new(AtomicU32::new(0));
        let (completer, response) = pair();

        let count = fired.clone();
        response.on_complete(move |err| {
            assert!(err.is_some());
            count.fetch_add(1, Ordering::SeqCst);
        });

        // the caller walks away before the outcome arrives.
        drop(response);
        completer.complete(Err(RemoteError("late".to_string()).into()));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_after_completion_runs_immediately() {
        let fired = Arc::new(AtomicU32::new(0));
        let (completer, response) = pair();

        completer.complete(Ok(Vec::new()));

        let count = fired.clone();
        response.on_complete(move |err| {
            assert!(err.is_none());
            count.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiter_wakes_after_completion_from_another_task() {
        let (completer, response) = pair();

        let handle = tokio::spawn(async move { response.recv().await });
        tokio::task::yield_now().await;
        completer.complete(Ok(b"done".to_vec()));

        assert_eq!(handle.await.unwrap().unwrap(), b"done");
    }
}
