use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Per-host politeness. `Auto` adapts the delay to observed latency,
/// `Fixed` sleeps a constant delay, `Off` never waits.
#[derive(Debug)]
pub enum Throttle {
    Auto(AutoThrottler),
    Fixed(Duration),
    Off,
}

impl Throttle {
    pub async fn wait(&self, host: &str) {
        match self {
            Throttle::Auto(auto) => {
                let delay = auto.delay_for(host);
                if delay > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
            }
            Throttle::Fixed(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(*delay).await;
                }
            }
            Throttle::Off => {}
        }
    }

    pub fn record_latency(&self, host: &str, latency: f64) {
        if let Throttle::Auto(auto) = self {
            auto.record_latency(host, latency);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HostState {
    latency: Option<f64>,
    delay: f64,
}

/// Scrapy-style auto-throttle, simplified: the per-host delay tracks a
/// smoothed latency divided by the target concurrency, clamped to
/// `[0, max_delay]`.
#[derive(Debug)]
pub struct AutoThrottler {
    start_delay: f64,
    max_delay: f64,
    target_concurrency: f64,
    smoothing: f64,
    hosts: Mutex<HashMap<String, HostState>>,
}

impl AutoThrottler {
    pub fn new(start_delay: f64, max_delay: f64, target_concurrency: f64, smoothing: f64) -> Self {
        Self {
            start_delay,
            max_delay,
            target_concurrency,
            smoothing,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn delay_for(&self, host: &str) -> f64 {
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .map(|s| s.delay)
            .unwrap_or(self.start_delay)
    }

    pub fn record_latency(&self, host: &str, latency: f64) {
        let mut hosts = self.hosts.lock().unwrap();
        let state = hosts.entry(host.to_string()).or_insert(HostState {
            latency: None,
            delay: self.start_delay,
        });

        let smoothed = match state.latency {
            None => latency,
            Some(prev) => self.smoothing * prev + (1.0 - self.smoothing) * latency,
        };
        state.latency = Some(smoothed);

        let target_delay = smoothed / self.target_concurrency;
        state.delay = target_delay.clamp(0.0, self.max_delay);
    }
}

impl Default for AutoThrottler {
    fn default() -> Self {
        Self::new(0.25, 10.0, 4.0, 0.7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increasing_latency_never_decreases_delay() {
        let auto = AutoThrottler::new(0.0, 10.0, 1.0, 0.7);
        let mut last = 0.0;
        for latency in [0.1, 0.2, 0.4, 0.8, 1.6] {
            auto.record_latency("h", latency);
            let delay = auto.delay_for("h");
            assert!(delay >= last, "delay regressed: {delay} < {last}");
            last = delay;
        }
    }

    #[test]
    fn fast_response_lowers_delay_without_smoothing() {
        let auto = AutoThrottler::new(0.0, 10.0, 1.0, 0.0);
        auto.record_latency("h", 2.0);
        let high = auto.delay_for("h");
        auto.record_latency("h", 0.1);
        let low = auto.delay_for("h");
        assert!(low < high);
    }

    #[test]
    fn delay_is_clamped_to_max() {
        let auto = AutoThrottler::new(0.0, 1.5, 1.0, 0.0);
        auto.record_latency("h", 60.0);
        assert_eq!(auto.delay_for("h"), 1.5);
    }
}
