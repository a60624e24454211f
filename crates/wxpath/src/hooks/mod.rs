//! Pluggable observers around the engine's hot path.
//!
//! Hooks are registered once, before an evaluation begins, and invoked in
//! registration order at three advisory stages. Returning `None` from any
//! stage drops the item and short-circuits the chain; that is the normal
//! veto signal, not an error.

pub mod serialize;
pub mod writer;

pub use serialize::Serializer;
pub use writer::NdjsonWriter;

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::html::Document;
use crate::parser::Segment;
use crate::value::Value;

/// The crawl context handed to fetch-side hook stages.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub url: String,
    pub backlink: Option<String>,
    pub depth: i64,
    /// Remaining segments to execute after this fetch.
    pub segments: Vec<Segment>,
}

/// Every stage is optional; the defaults pass items through untouched.
pub trait Hook: Send + Sync {
    /// Observe or rewrite the fetched body before parsing.
    fn post_fetch(&self, _ctx: &FetchContext, body: Bytes) -> Option<Bytes> {
        Some(body)
    }

    /// Observe or replace the parsed document before the pipeline runs.
    fn post_parse(&self, _ctx: &FetchContext, doc: Document) -> Option<Document> {
        Some(doc)
    }

    /// Observe, transform, or drop every extracted value.
    fn post_extract(&self, value: Value) -> Option<Value> {
        Some(value)
    }
}

static HOOKS: Lazy<RwLock<Vec<(String, Arc<dyn Hook>)>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Register a hook under its type name. Registration is idempotent: a
/// second hook with the same name is ignored.
pub fn register<H: Hook + 'static>(hook: H) {
    register_named(std::any::type_name::<H>(), hook);
}

pub fn register_named<H: Hook + 'static>(name: &str, hook: H) {
    let mut hooks = HOOKS.write().unwrap();
    if hooks.iter().any(|(n, _)| n == name) {
        return;
    }
    hooks.push((name.to_string(), Arc::new(hook)));
}

/// Snapshot of the registered hooks, in registration order.
pub fn hooks() -> Vec<Arc<dyn Hook>> {
    HOOKS.read().unwrap().iter().map(|(_, h)| h.clone()).collect()
}

pub fn hook_names() -> Vec<String> {
    HOOKS.read().unwrap().iter().map(|(n, _)| n.clone()).collect()
}

/// Remove all registered hooks.
pub fn clear() {
    HOOKS.write().unwrap().clear();
}

/// Run a value through every hook's `post_extract`, honoring drops.
pub fn apply_post_extract(mut value: Value) -> Option<Value> {
    for hook in hooks() {
        value = hook.post_extract(value)?;
    }
    Some(value)
}
