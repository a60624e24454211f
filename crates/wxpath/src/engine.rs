//! The concurrent BFS driver.
//!
//! One evaluation owns a queue of pending [`Task`]s, a `seen` URL set, an
//! `inflight` map, and a pending-request count. A spawned submitter drains
//! the queue into the HTTP client, de-duplicating URLs at submission time;
//! the driver (running on the consumer's task) drains the response stream,
//! parses documents, applies hooks, and feeds loaded documents through the
//! local pipeline. Results surface in first-ready order through the
//! returned stream.
//!
//! Documents are confined to the driver: only URLs and page strings cross
//! task boundaries, so the evaluation stream itself is not `Send` and is
//! consumed on the calling task.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::stream::{self, Stream, StreamExt};
use sxd_document::dom;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::EngineConfig;
use crate::error::{self, Error};
use crate::hooks::{self, FetchContext};
use crate::html::{self, Document, PageMeta, ResponseMeta};
use crate::http::client::{ClientHandle, TaskGuard};
use crate::http::{HttpClient, Request, Response, RetryPolicy, RobotsPolicy};
use crate::ops::{self, Emit, Intent, PipeItem};
use crate::parser::{self, Segment};
use crate::value::{Fragment, Page, Value};

/// A unit of crawl work: a URL to fetch and what to do with the result.
#[derive(Debug, Clone)]
struct Task {
    url: String,
    segments: Vec<Segment>,
    depth: i64,
    backlink: Option<String>,
}

/// `queued` counts tasks enqueued but not yet handled by the submitter;
/// `pending` counts submitted fetches without a response yet. The
/// evaluation is over when both reach zero with an empty inflight map.
#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    pending: AtomicUsize,
}

pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Parse `expr` and evaluate it, streaming extracted values as they
    /// become ready. Syntax errors are fatal and reported here; per-branch
    /// errors during the crawl follow the active error policy.
    pub fn run(&self, expr: &str, max_depth: i64) -> Result<EvalStream, Error> {
        let program = parser::parse(expr)?;
        EvalStream::start(self.config.clone(), program, None, max_depth)
    }

    /// Like [`run`](Self::run), but the program starts on a caller-provided
    /// document (for programs whose first segment is an XPath step).
    pub fn run_seeded(
        &self,
        seed: Document,
        expr: &str,
        max_depth: i64,
    ) -> Result<EvalStream, Error> {
        let program = parser::parse(expr)?;
        EvalStream::start(self.config.clone(), program, Some(seed), max_depth)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// The lazy result stream of one evaluation. Dropping it cancels the
/// submitter and the HTTP workers; values already yielded are unaffected.
pub struct EvalStream {
    inner: Pin<Box<dyn Stream<Item = Result<Value, Error>>>>,
}

impl Stream for EvalStream {
    type Item = Result<Value, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for EvalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalStream").finish_non_exhaustive()
    }
}

impl EvalStream {
    fn start(
        config: EngineConfig,
        program: Vec<Segment>,
        seed_doc: Option<Document>,
        max_depth: i64,
    ) -> Result<Self, Error> {
        let mut client = HttpClient::start(config.client.clone(), RetryPolicy::default(), None)?;
        let results_rx = client.take_results();

        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<Task>();
        let counters = Arc::new(Counters::default());
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let inflight = Arc::new(Mutex::new(HashMap::new()));
        let wake = Arc::new(Notify::new());

        let robots = if config.respect_robots {
            let http = reqwest::ClientBuilder::new()
                .user_agent(config.client.user_agent.clone())
                .build()
                .map_err(|e| Error::Fetch {
                    url: String::new(),
                    reason: format!("could not build robots client: {e}"),
                })?;
            Some(Arc::new(RobotsPolicy::new(
                http,
                config.client.user_agent.clone(),
            )))
        } else {
            None
        };

        let submitter = TaskGuard(tokio::spawn(submitter_loop(
            queue_rx,
            client.handle(),
            seen.clone(),
            inflight.clone(),
            counters.clone(),
            wake.clone(),
            robots,
        )));

        let run = EngineRun {
            program,
            max_depth,
            client,
            results_rx,
            queue_tx,
            counters,
            inflight,
            wake,
            submitter: Some(submitter),
            outbuf: VecDeque::new(),
            seeded: false,
            seed_doc,
            done: false,
        };

        let inner = stream::unfold(run, |mut run| async move {
            run.next_item().await.map(|item| (item, run))
        });

        Ok(Self {
            inner: Box::pin(inner),
        })
    }
}

/// The submitter: pulls tasks off the queue, drops already-seen URLs, and
/// hands fresh ones to the HTTP client.
async fn submitter_loop(
    queue_rx: mpsc::UnboundedReceiver<Task>,
    client: ClientHandle,
    seen: Arc<Mutex<HashSet<String>>>,
    inflight: Arc<Mutex<HashMap<String, Task>>>,
    counters: Arc<Counters>,
    wake: Arc<Notify>,
    robots: Option<Arc<RobotsPolicy>>,
) {
    let mut tasks = UnboundedReceiverStream::new(queue_rx);

    while let Some(task) = tasks.next().await {
        let duplicate = seen.lock().unwrap().contains(&task.url)
            || inflight.lock().unwrap().contains_key(&task.url);
        if duplicate {
            counters.queued.fetch_sub(1, Ordering::SeqCst);
            // The drop may have made the run terminal; the driver must
            // re-check rather than sit on the response channel.
            wake.notify_one();
            continue;
        }

        if let Some(robots) = &robots {
            if !robots.can_fetch(&task.url).await {
                log::info!("robots.txt disallows {}", task.url);
                counters.queued.fetch_sub(1, Ordering::SeqCst);
                wake.notify_one();
                continue;
            }
        }

        seen.lock().unwrap().insert(task.url.clone());
        inflight.lock().unwrap().insert(task.url.clone(), task.clone());

        // Pending rises before queued falls, so the termination check never
        // observes both at zero mid-handoff.
        counters.pending.fetch_add(1, Ordering::SeqCst);
        counters.queued.fetch_sub(1, Ordering::SeqCst);

        if client.submit(Request::new(task.url.clone())).is_err() {
            wake.notify_one();
            break;
        }
    }
}

struct EngineRun {
    program: Vec<Segment>,
    max_depth: i64,
    client: HttpClient,
    results_rx: mpsc::UnboundedReceiver<Response>,
    queue_tx: mpsc::UnboundedSender<Task>,
    counters: Arc<Counters>,
    inflight: Arc<Mutex<HashMap<String, Task>>>,
    wake: Arc<Notify>,
    submitter: Option<TaskGuard>,
    outbuf: VecDeque<Result<Value, Error>>,
    seeded: bool,
    seed_doc: Option<Document>,
    done: bool,
}

impl EngineRun {
    async fn next_item(&mut self) -> Option<Result<Value, Error>> {
        loop {
            if let Some(item) = self.outbuf.pop_front() {
                if item.is_err() {
                    // Fatal: nothing further after this is yielded.
                    self.done = true;
                    self.shutdown();
                }
                return Some(item);
            }
            if self.done {
                return None;
            }

            if !self.seeded {
                self.seeded = true;
                self.seed();
                continue;
            }

            if self.is_terminal() {
                self.done = true;
                self.shutdown();
                return None;
            }

            tokio::select! {
                response = self.results_rx.recv() => match response {
                    Some(response) => self.handle_response(response),
                    None => {
                        self.done = true;
                        return None;
                    }
                },
                // A dropped duplicate may have been the last outstanding
                // work; loop around and re-check the termination condition.
                _ = self.wake.notified() => {}
            }
        }
    }

    /// Kick off the program: a dummy task whose children enter at depth 0,
    /// or the caller-provided seed document at depth 0.
    fn seed(&mut self) {
        let doc = self.seed_doc.take().map(Rc::new);
        let depth = if doc.is_some() { 0 } else { -1 };
        let program = self.program.clone();
        self.run_pipeline(doc, program, depth);
    }

    fn is_terminal(&self) -> bool {
        self.counters.queued.load(Ordering::SeqCst) == 0
            && self.counters.pending.load(Ordering::SeqCst) == 0
            && self.inflight.lock().unwrap().is_empty()
    }

    /// Cancellation propagates top-down: the submitter first, then the
    /// HTTP client's workers.
    fn shutdown(&mut self) {
        self.submitter.take();
        self.client.close();
    }

    fn handle_response(&mut self, response: Response) {
        let task = self.inflight.lock().unwrap().remove(&response.request.url);
        let Some(task) = task else {
            log::warn!("unexpected response from {}", response.request.url);
            return;
        };
        self.counters.pending.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = &response.error {
            log::warn!("fetch failed for {}: {err}", task.url);
            return;
        }
        if !response.is_success() || response.body.is_empty() {
            log::warn!(
                "skipping {} (status {}, {} bytes)",
                task.url,
                response.status,
                response.body.len()
            );
            return;
        }

        let ctx = FetchContext {
            url: task.url.clone(),
            backlink: task.backlink.clone(),
            depth: task.depth,
            segments: task.segments.clone(),
        };

        let mut body = response.body.clone();
        for hook in hooks::hooks() {
            match hook.post_fetch(&ctx, body) {
                Some(b) => body = b,
                None => {
                    log::debug!("hook dropped {} after fetch", task.url);
                    return;
                }
            }
        }

        let text = String::from_utf8_lossy(&body);
        let meta = PageMeta::new(task.url.clone())
            .with_backlink(task.backlink.clone())
            .with_depth(task.depth)
            .with_response(Some(ResponseMeta {
                status: response.status,
                elapsed: response
                    .latency()
                    .map(|d| d.as_secs_f64())
                    .unwrap_or_default(),
            }));

        let mut doc = match Document::parse(&text, meta) {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!("{e}");
                return;
            }
        };

        for hook in hooks::hooks() {
            match hook.post_parse(&ctx, doc) {
                Some(d) => doc = d,
                None => {
                    log::debug!("hook dropped {} after parse", task.url);
                    return;
                }
            }
        }

        if task.segments.is_empty() {
            self.emit(Value::Page(Page::new(Rc::new(doc))));
        } else {
            self.run_pipeline(Some(Rc::new(doc)), task.segments, task.depth);
        }
    }

    /// The local pipeline: contiguous non-fetching segments evaluated
    /// against one loaded document. `Data` goes downstream, `Crawl` onto
    /// the queue with a depth bump, everything else loops locally.
    fn run_pipeline(&mut self, doc: Option<Rc<Document>>, segments: Vec<Segment>, depth: i64) {
        let doc_ref: Option<&Document> = doc.as_deref();
        let backlink = doc_ref.map(|d| d.meta().base_url.clone());

        let mut local: VecDeque<(Option<PipeItem>, Vec<Segment>)> = VecDeque::new();
        local.push_back((doc_ref.map(|d| PipeItem::Node(d.root_node())), segments));

        while let Some((item, segs)) = local.pop_front() {
            if segs.is_empty() {
                continue;
            }

            let intents = match ops::dispatch(doc_ref, item, &segs, depth) {
                Ok(intents) => intents,
                Err(e) if e.is_fatal() => {
                    self.outbuf.push_back(Err(e));
                    return;
                }
                Err(e) => {
                    let mut ctx = BTreeMap::new();
                    ctx.insert("depth".to_string(), Value::Number(depth as f64));
                    if let Some(url) = &backlink {
                        ctx.insert("url".to_string(), Value::from(url.clone()));
                    }
                    match error::apply_policy(e, error::current_error_policy(), ctx) {
                        Ok(None) => continue,
                        Ok(Some(collected)) => {
                            self.emit(collected);
                            continue;
                        }
                        Err(e) => {
                            self.outbuf.push_back(Err(e));
                            return;
                        }
                    }
                }
            };

            for intent in intents {
                match intent {
                    Intent::Data(emit) => {
                        let value = materialize(emit, doc.as_ref());
                        self.emit(value);
                    }
                    Intent::Crawl { url, next } => {
                        let next_depth = depth + 1;
                        if next_depth <= self.max_depth {
                            self.enqueue(Task {
                                url,
                                segments: next,
                                depth: next_depth,
                                backlink: backlink.clone(),
                            });
                        } else {
                            log::debug!("reached max depth at {url}");
                        }
                    }
                    Intent::Process { item, next }
                    | Intent::Extract { item, next }
                    | Intent::InfiniteCrawl { item, next } => {
                        local.push_back((Some(item), next));
                    }
                }
            }
        }
    }

    fn enqueue(&self, task: Task) {
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(task).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn emit(&mut self, value: Value) {
        if let Some(value) = hooks::apply_post_extract(value) {
            self.outbuf.push_back(Ok(value));
        }
    }
}

/// Turn a handler's emission into an owned value: the document itself for
/// root nodes, a detached fragment for inner nodes.
fn materialize(emit: Emit<'_>, doc: Option<&Rc<Document>>) -> Value {
    match emit {
        Emit::Value(value) => value,
        Emit::Node(node) => {
            let Some(doc) = doc else {
                return Value::from(html::serialize_node(node));
            };
            let is_root = match node {
                sxd_xpath::nodeset::Node::Root(_) => true,
                sxd_xpath::nodeset::Node::Element(el) => {
                    matches!(el.parent(), Some(dom::ParentOfChild::Root(_)))
                }
                _ => false,
            };
            if is_root {
                Value::Page(Page::new(doc.clone()))
            } else {
                Value::Fragment(Fragment {
                    tag: html::node_tag(node),
                    html: html::serialize_node(node),
                    base_url: Some(doc.meta().base_url.clone()),
                    depth: doc.meta().depth,
                })
            }
        }
    }
}

/// Evaluate an expression to completion on a private single-threaded
/// runtime. Convenience for synchronous callers; must not be invoked from
/// within an async context.
pub fn evaluate_blocking(
    config: EngineConfig,
    expr: &str,
    max_depth: i64,
) -> Result<Vec<Value>, Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Fetch {
            url: String::new(),
            reason: format!("could not build runtime: {e}"),
        })?;

    runtime.block_on(async move {
        let engine = Engine::new(config);
        let mut stream = engine.run(expr, max_depth)?;
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item?);
        }
        Ok(out)
    })
}
