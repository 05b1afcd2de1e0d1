//! per endpoint circuit breaking with half open probing.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

/// three state machine guarding calls to one (service, addr) pair.
///
/// in `Closed` every call is admitted and outcomes are counted; once a full
/// window of outcomes exists and the failure rate reaches the threshold the
/// breaker opens. `Open` rejects everything until `open_timeout` has passed,
/// at which point a single probe call is admitted (`HalfOpen`). the probe's
/// outcome decides between going back to `Closed` or re-opening.
pub struct CircuitBreaker {
    window_size: usize,
    failure_threshold: f64,
    open_timeout: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    state: State,
    success: usize,
    failure: usize,
    last_state_change: Instant,
    half_open_probe: bool,
}

impl CircuitBreaker {
    pub fn new(window_size: usize, failure_threshold: f64, open_timeout: Duration) -> Self {
        Self {
            window_size,
            failure_threshold,
            open_timeout,
            inner: Mutex::new(Inner {
                state: State::Closed,
                success: 0,
                failure: 0,
                last_state_change: Instant::now(),
                half_open_probe: false,
            }),
        }
    }

    /// whether the next call may go out. in `Open` this is also where the
    /// open timeout is checked: the first caller past it becomes the half
    /// open probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            State::Closed => true,
            State::Open => {
                if inner.last_state_change.elapsed() > self.open_timeout {
                    inner.state = State::HalfOpen;
                    inner.half_open_probe = true;
                    return true;
                }
                false
            }
            State::HalfOpen => {
                if inner.half_open_probe {
                    return false;
                }
                inner.half_open_probe = true;
                true
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            State::Closed => inner.success += 1,
            // probe succeeded, recover.
            State::HalfOpen => inner.to_closed(),
            State::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            State::Closed => {
                inner.failure += 1;

                let total = inner.failure + inner.success;
                if total < self.window_size {
                    return;
                }

                let rate = inner.failure as f64 / total as f64;
                if rate >= self.failure_threshold {
                    inner.to_open();
                    return;
                }

                inner.reset_counts();
            }
            // probe failed, trip again.
            State::HalfOpen => inner.to_open(),
            State::Open => {}
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }
}

impl Inner {
    fn to_open(&mut self) {
        self.state = State::Open;
        self.last_state_change = Instant::now();
        self.reset_counts();
        self.half_open_probe = false;
    }

    fn to_closed(&mut self) {
        self.state = State::Closed;
        self.last_state_change = Instant::now();
        self.reset_counts();
        self.half_open_probe = false;
    }

    fn reset_counts(&mut self) {
        self.success = 0;
        self.failure = 0;
    }
}

#[cfg(test)]
mod test {
    use std::thread::sleep;

    use super::*;

    const OPEN_TIMEOUT: Duration = Duration::from_millis(40);

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(10, 0.6, OPEN_TIMEOUT)
    }

    #[test]
    fn trips_at_threshold() {
        let cb = breaker();

        // 4 successes and 5 failures: window not full yet, still closed.
        for _ in 0..4 {
            cb.record_success();
        }
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), State::Closed);
        assert!(cb.allow());

        // 10th outcome makes the window full with a 60% failure rate.
        cb.record_failure();
        assert_eq!(cb.state(), State::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn healthy_window_resets_counts() {
        let cb = breaker();

        for _ in 0..8 {
            cb.record_success();
        }
        cb.record_failure();
        cb.record_failure();

        // 2/10 failures is under the threshold; the window restarts closed.
        assert_eq!(cb.state(), State::Closed);

        for _ in 0..9 {
            cb.record_failure();
        }
        // a fresh window needs 10 outcomes again before tripping.
        assert_eq!(cb.state(), State::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), State::Open);
    }

    #[test]
    fn single_probe_after_open_timeout() {
        let cb = breaker();
        for _ in 0..10 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), State::Open);

        sleep(OPEN_TIMEOUT + Duration::from_millis(10));

        // exactly one probe is admitted.
        assert!(cb.allow());
        assert_eq!(cb.state(), State::HalfOpen);
        assert!(!cb.allow());
        assert!(!cb.allow());
    }

    #[test]
    fn probe_success_recovers() {
        let cb = breaker();
        for _ in 0..10 {
            cb.record_failure();
        }

        sleep(OPEN_TIMEOUT + Duration::from_millis(10));
        assert!(cb.allow());
        cb.record_success();

        assert_eq!(cb.state(), State::Closed);
        assert!(cb.allow());
    }

    #[test]
    fn probe_failure_reopens() {
        let cb = breaker();
        for _ in 0..10 {
            cb.record_failure();
        }

        sleep(OPEN_TIMEOUT + Duration::from_millis(10));
        assert!(cb.allow());
        cb.record_failure();

        assert_eq!(cb.state(), State::Open);
        assert!(!cb.allow());

        // a stalled probe recovers as well: the timeout re-issues it.
        sleep(OPEN_TIMEOUT + Duration::from_millis(10));
        assert!(cb.allow());
        assert!(!cb.allow());
    }
}
