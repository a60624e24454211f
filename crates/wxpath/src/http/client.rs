//! The fetch worker pool. Requests go in through [`HttpClient::submit`];
//! responses come out of a single stream in completion order. A fixed pool
//! of workers drains the pending queue, each request passing through the
//! global and per-host semaphores (in that order) and the throttler before
//! the GET is issued. Failures become error responses; no request is ever
//! dropped silently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::http::retry::RetryPolicy;
use crate::http::stats::CrawlerStats;
use crate::http::throttle::{AutoThrottler, Throttle};
use crate::http::{Request, Response};

/// Extensions whose URLs are not worth retrying.
const NO_RETRY_EXTENSIONS: [&str; 3] = [".pdf", ".zip", ".exe"];

/// Aborts the wrapped task when dropped, so cancellation of the owner
/// reliably reaps its children.
pub(crate) struct TaskGuard(pub JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Shared {
    http: reqwest::Client,
    config: ClientConfig,
    retry: RetryPolicy,
    throttle: Throttle,
    stats: CrawlerStats,
    sem_global: Arc<Semaphore>,
    host_sems: Mutex<HashMap<String, Arc<Semaphore>>>,
    pending_tx: mpsc::UnboundedSender<Request>,
    results_tx: mpsc::UnboundedSender<Response>,
    closed: AtomicBool,
}

pub struct HttpClient {
    shared: Arc<Shared>,
    workers: Vec<TaskGuard>,
    results_rx: Option<mpsc::UnboundedReceiver<Response>>,
}

/// A cheap submit-only handle, usable from other tasks.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
}

impl ClientHandle {
    pub fn submit(&self, request: Request) -> Result<(), Error> {
        submit(&self.shared, request)
    }
}

impl HttpClient {
    pub fn start(
        config: ClientConfig,
        retry: RetryPolicy,
        throttle: Option<Throttle>,
    ) -> Result<Self, Error> {
        let http = build_http(&config).map_err(|e| Error::Fetch {
            url: String::new(),
            reason: format!("could not build HTTP client: {e}"),
        })?;

        let throttle = throttle.unwrap_or_else(|| {
            let auto = || {
                Throttle::Auto(AutoThrottler::new(
                    0.25,
                    10.0,
                    (config.concurrency as f64 / 4.0).max(1.0),
                    0.7,
                ))
            };
            match config.throttle {
                None | Some(crate::config::ThrottleConfig::Auto) => auto(),
                Some(crate::config::ThrottleConfig::Delay(secs)) => {
                    Throttle::Fixed(Duration::from_secs_f64(secs))
                }
                Some(crate::config::ThrottleConfig::Off) => Throttle::Off,
            }
        });

        let (pending_tx, pending_rx) = mpsc::unbounded_channel::<Request>();
        let (results_tx, results_rx) = mpsc::unbounded_channel::<Response>();

        let sem_global = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let shared = Arc::new(Shared {
            http,
            config,
            retry,
            throttle,
            stats: CrawlerStats::default(),
            sem_global,
            host_sems: Mutex::new(HashMap::new()),
            pending_tx,
            results_tx,
            closed: AtomicBool::new(false),
        });

        let pending_rx = Arc::new(tokio::sync::Mutex::new(pending_rx));
        let workers = (0..shared.config.concurrency)
            .map(|_| {
                let shared = shared.clone();
                let pending_rx = pending_rx.clone();
                TaskGuard(tokio::spawn(worker(shared, pending_rx)))
            })
            .collect();

        Ok(Self {
            shared,
            workers,
            results_rx: Some(results_rx),
        })
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn submit(&self, request: Request) -> Result<(), Error> {
        submit(&self.shared, request)
    }

    /// The response stream. May be taken once.
    pub fn take_results(&mut self) -> mpsc::UnboundedReceiver<Response> {
        self.results_rx.take().expect("results already taken")
    }

    pub fn stats(&self) -> &CrawlerStats {
        &self.shared.stats
    }

    /// Stop accepting submissions and cancel the workers. In-flight request
    /// cancellations surface as ignored errors.
    pub fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.workers.clear();
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn submit(shared: &Shared, request: Request) -> Result<(), Error> {
    if shared.closed.load(Ordering::SeqCst) {
        return Err(Error::Fetch {
            url: request.url,
            reason: "client is closed".into(),
        });
    }
    shared.stats.record_enqueued();
    shared.pending_tx.send(request).map_err(|e| Error::Fetch {
        url: e.0.url.clone(),
        reason: "client is closed".into(),
    })
}

fn build_http(config: &ClientConfig) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::ClientBuilder::new()
        .gzip(true)
        .deflate(true)
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs_f64(config.timeout));

    if !config.proxies.is_empty() {
        let proxies = config.proxies.clone();
        builder = builder.proxy(reqwest::Proxy::custom(move |url| {
            url.host_str()
                .and_then(|host| proxies.get(host))
                .and_then(|proxy| reqwest::Url::parse(proxy).ok())
        }));
    }

    builder.build()
}

async fn worker(shared: Arc<Shared>, pending_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Request>>>) {
    loop {
        let request = {
            let mut rx = pending_rx.lock().await;
            rx.recv().await
        };
        let Some(request) = request else { break };

        if let Some(response) = fetch_one(&shared, request).await {
            if shared.results_tx.send(response).is_err() {
                break;
            }
        }
    }
}

/// Fetch one request. Returns `None` when a retry was scheduled instead of
/// a response.
async fn fetch_one(shared: &Shared, mut request: Request) -> Option<Response> {
    let lowered = request.url.to_lowercase();
    if NO_RETRY_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext)) {
        request.max_retries = Some(0);
    }

    let host = request.host();

    // Global before host, to avoid permit inversion.
    let _global = shared.sem_global.clone().acquire_owned().await.ok()?;
    let host_sem = {
        let mut sems = shared.host_sems.lock().unwrap();
        sems.entry(host.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(shared.config.per_host)))
            .clone()
    };
    let _host = host_sem.acquire_owned().await.ok()?;

    let throttle_start = Instant::now();
    shared.throttle.wait(&host).await;
    shared
        .stats
        .record_throttle_wait(&host, throttle_start.elapsed().as_secs_f64());

    shared.stats.record_started(&host);
    let start = Instant::now();

    let mut builder = shared.http.get(&request.url);
    for (name, value) in shared.config.headers.iter().chain(request.headers.iter()) {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(timeout) = request.timeout {
        builder = builder.timeout(timeout);
    }

    let outcome = match builder.send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let headers = resp
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                .collect::<HashMap<_, _>>();
            match resp.bytes().await {
                Ok(body) => Ok((status, headers, body)),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    };

    let end = Instant::now();
    let latency = end.duration_since(start).as_secs_f64();
    shared.throttle.record_latency(&host, latency);

    match outcome {
        Ok((status, headers, body)) => {
            shared
                .stats
                .record_completed(&host, status, latency, body.len());

            if shared.retry.should_retry(&request, Some(status), false) {
                schedule_retry(shared, request).await;
                return None;
            }

            Some(Response {
                request,
                status,
                body,
                headers,
                error: None,
                request_start: Some(start),
                response_end: Some(end),
            })
        }
        Err(e) => {
            shared.stats.record_error(&host);

            if shared.retry.should_retry(&request, None, true) {
                schedule_retry(shared, request).await;
                return None;
            }

            log::warn!("request failed for {}: {e}", request.url);
            Some(Response {
                request,
                status: 0,
                body: bytes::Bytes::new(),
                headers: HashMap::new(),
                error: Some(e.to_string()),
                request_start: Some(start),
                response_end: Some(end),
            })
        }
    }
}

async fn schedule_retry(shared: &Shared, mut request: Request) {
    request.retries += 1;
    shared.stats.record_retry_scheduled();

    let delay = shared.retry.delay_for(&request);
    log::warn!(
        "retrying {} (attempt {}) in {:.2}s",
        request.url,
        request.retries,
        delay.as_secs_f64()
    );
    tokio::time::sleep(delay).await;

    shared.stats.record_retry_executed();
    if !shared.closed.load(Ordering::SeqCst) {
        let _ = shared.pending_tx.send(request);
    }
}
