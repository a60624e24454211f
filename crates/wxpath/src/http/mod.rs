//! The HTTP side of the evaluator: a bounded-concurrency fetcher with
//! per-host throttling, a retry policy, optional robots.txt enforcement,
//! and request statistics.

pub mod client;
pub mod retry;
pub mod robots;
pub mod stats;
pub mod throttle;

pub use client::HttpClient;
pub use retry::RetryPolicy;
pub use robots::RobotsPolicy;
pub use stats::CrawlerStats;
pub use throttle::{AutoThrottler, Throttle};

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub retries: u32,
    pub max_retries: Option<u32>,
    pub dont_retry: bool,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            timeout: None,
            retries: 0,
            max_retries: None,
            dont_retry: false,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn host(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct Response {
    pub request: Request,
    pub status: u16,
    pub body: Bytes,
    pub headers: HashMap<String, String>,
    pub error: Option<String>,
    pub request_start: Option<Instant>,
    pub response_end: Option<Instant>,
}

impl Response {
    pub fn failed(request: Request, error: impl Into<String>) -> Self {
        Self {
            request,
            status: 0,
            body: Bytes::new(),
            headers: HashMap::new(),
            error: Some(error.into()),
            request_start: None,
            response_end: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }

    /// Time between request start and response end.
    pub fn latency(&self) -> Option<Duration> {
        match (self.request_start, self.response_end) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }
}
