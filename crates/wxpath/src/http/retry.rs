use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;

use super::Request;

/// When and how fast to retry failed requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_statuses: HashSet<u16>,
    pub backoff_base: f64,
    pub backoff_cap: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_statuses: [500, 502, 503, 504].into_iter().collect(),
            backoff_base: 0.5,
            backoff_cap: 30.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Retry on a retryable status or on any transport failure, unless the
    /// request opted out or a retry budget is exhausted.
    pub fn should_retry(&self, request: &Request, status: Option<u16>, failed: bool) -> bool {
        if request.dont_retry {
            return false;
        }
        if let Some(max) = request.max_retries {
            if request.retries >= max {
                return false;
            }
        }
        if request.retries >= self.max_retries {
            return false;
        }
        if let Some(status) = status {
            if self.retry_statuses.contains(&status) {
                return true;
            }
        }
        failed
    }

    pub fn delay_for(&self, request: &Request) -> Duration {
        exponential_backoff(
            request.retries,
            self.backoff_base,
            self.backoff_cap,
            self.jitter,
        )
    }
}

/// `min(cap, base * 2^attempt)`, multiplied by `uniform(0.7, 1.3)` when
/// jitter is enabled.
pub fn exponential_backoff(attempt: u32, base: f64, cap: f64, jitter: bool) -> Duration {
    let mut delay = cap.min(base * 2f64.powi(attempt as i32));
    if jitter {
        delay *= rand::thread_rng().gen_range(0.7..1.3);
    }
    Duration::from_secs_f64(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_per_request_budget() {
        let policy = RetryPolicy::default();
        let mut req = Request::new("http://test/").with_max_retries(1);
        assert!(policy.should_retry(&req, Some(500), false));
        req.retries = 1;
        assert!(!policy.should_retry(&req, Some(500), false));
    }

    #[test]
    fn retries_any_transport_failure() {
        let policy = RetryPolicy::default();
        let req = Request::new("http://test/");
        assert!(policy.should_retry(&req, None, true));
        assert!(!policy.should_retry(&req, Some(404), false));
    }

    #[test]
    fn dont_retry_wins() {
        let policy = RetryPolicy::default();
        let mut req = Request::new("http://test/");
        req.dont_retry = true;
        assert!(!policy.should_retry(&req, Some(503), true));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let d0 = exponential_backoff(0, 0.5, 30.0, false);
        let d1 = exponential_backoff(1, 0.5, 30.0, false);
        let d9 = exponential_backoff(9, 0.5, 30.0, false);
        assert_eq!(d0, Duration::from_secs_f64(0.5));
        assert_eq!(d1, Duration::from_secs_f64(1.0));
        assert_eq!(d9, Duration::from_secs_f64(30.0));
    }
}
