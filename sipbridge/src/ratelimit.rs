//! Call admission control.
//!
//! A per-second bucket consulted once for every new inbound dialog.
//! `-1` admits everything, `0` denies everything, `N > 0` admits N
//! call attempts per second.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: i64,
    window_start: Instant,
    accepted_in_window: i64,
}

pub struct CallLimiter {
    limit: i64,
    bucket: Mutex<Bucket>,
}

impl CallLimiter {
    pub fn new(limit: i64) -> Self {
        CallLimiter {
            limit,
            bucket: Mutex::new(Bucket {
                tokens: limit.max(0),
                window_start: Instant::now(),
                accepted_in_window: 0,
            }),
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Admission decision for one new inbound dialog.
    pub fn accept_new_call(&self) -> bool {
        match self.limit {
            -1 => true,
            0 => false,
            _ => {
                let mut bucket = self.bucket.lock().expect("limiter lock");
                let now = Instant::now();
                if now.duration_since(bucket.window_start) >= Duration::from_secs(1) {
                    bucket.tokens = self.limit;
                    bucket.window_start = now;
                    bucket.accepted_in_window = 0;
                }
                if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    bucket.accepted_in_window += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Calls admitted in the current one-second window (the CAPS
    /// gauge).
    pub fn current_caps(&self) -> i64 {
        if self.limit <= 0 {
            return 0;
        }
        self.bucket.lock().expect("limiter lock").accepted_in_window
    }
}

impl std::fmt::Display for CallLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.limit {
            -1 => write!(f, "Unlimited CAPS"),
            0 => write!(f, "No Calls Allowed!"),
            n => write!(f, "{} CAPS", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_rejects() {
        let limiter = CallLimiter::new(-1);
        for _ in 0..1000 {
            assert!(limiter.accept_new_call());
        }
    }

    #[test]
    fn zero_rejects_the_very_first_call() {
        let limiter = CallLimiter::new(0);
        assert!(!limiter.accept_new_call());
    }

    #[test]
    fn bounded_rate_caps_within_a_window() {
        let limiter = CallLimiter::new(2);
        assert!(limiter.accept_new_call());
        assert!(limiter.accept_new_call());
        assert!(!limiter.accept_new_call());
        assert_eq!(limiter.current_caps(), 2);
    }
}
