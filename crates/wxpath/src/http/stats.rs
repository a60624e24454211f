use std::collections::HashMap;
use std::sync::Mutex;

/// Counters kept by the HTTP client, updated from the worker loop.
#[derive(Debug, Default, Clone)]
pub struct StatsSnapshot {
    // Lifecycle counts.
    pub requests_enqueued: u64,
    pub requests_started: u64,
    pub requests_completed: u64,
    /// Reserved for a response cache; never incremented by the core client.
    pub requests_cache_hit: u64,

    // Concurrency.
    pub in_flight_global: i64,
    pub in_flight_per_host: HashMap<String, i64>,

    // Throttling.
    pub throttle_waits: u64,
    pub throttle_wait_time: f64,
    pub throttle_waits_by_host: HashMap<String, u64>,

    // Latency feedback (EWMA with alpha = 0.3).
    pub latency_samples: u64,
    pub latency_ewma: f64,
    pub min_latency: Option<f64>,
    pub max_latency: Option<f64>,

    // Outcomes.
    pub status_counts: HashMap<u16, u64>,
    pub bytes_received: u64,
    pub retries_scheduled: u64,
    pub retries_executed: u64,
    pub errors_by_host: HashMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct CrawlerStats {
    inner: Mutex<StatsSnapshot>,
}

const LATENCY_ALPHA: f64 = 0.3;

impl CrawlerStats {
    pub fn record_enqueued(&self) {
        self.inner.lock().unwrap().requests_enqueued += 1;
    }

    pub fn record_started(&self, host: &str) {
        let mut s = self.inner.lock().unwrap();
        s.requests_started += 1;
        s.in_flight_global += 1;
        *s.in_flight_per_host.entry(host.to_string()).or_default() += 1;
    }

    pub fn record_completed(&self, host: &str, status: u16, latency: f64, bytes: usize) {
        let mut s = self.inner.lock().unwrap();
        s.requests_completed += 1;
        s.in_flight_global -= 1;
        *s.in_flight_per_host.entry(host.to_string()).or_default() -= 1;

        s.latency_samples += 1;
        s.latency_ewma = LATENCY_ALPHA * latency + (1.0 - LATENCY_ALPHA) * s.latency_ewma;
        s.min_latency = Some(s.min_latency.map_or(latency, |m: f64| m.min(latency)));
        s.max_latency = Some(s.max_latency.map_or(latency, |m: f64| m.max(latency)));

        *s.status_counts.entry(status).or_default() += 1;
        s.bytes_received += bytes as u64;
    }

    pub fn record_error(&self, host: &str) {
        let mut s = self.inner.lock().unwrap();
        s.in_flight_global -= 1;
        *s.in_flight_per_host.entry(host.to_string()).or_default() -= 1;
        *s.errors_by_host.entry(host.to_string()).or_default() += 1;
    }

    pub fn record_throttle_wait(&self, host: &str, seconds: f64) {
        let mut s = self.inner.lock().unwrap();
        s.throttle_waits += 1;
        s.throttle_wait_time += seconds;
        *s.throttle_waits_by_host.entry(host.to_string()).or_default() += 1;
    }

    pub fn record_retry_scheduled(&self) {
        self.inner.lock().unwrap().retries_scheduled += 1;
    }

    pub fn record_retry_executed(&self) {
        self.inner.lock().unwrap().retries_executed += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().unwrap().clone()
    }
}
