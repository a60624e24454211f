//! A crawling XPath dialect.
//!
//! One wxpath expression interleaves web fetching with tree navigation,
//! driving a concurrent breadth-first crawl that streams extracted values
//! (documents, strings, maps) as they become ready:
//!
//! ```text
//! url('https://example.com/')//h1/text()
//! url('https://example.com/')//url(@href)
//! url('https://example.com/')///url(@href)        (crawl until max depth)
//! url('https://example.com/', follow=//a[@class='next']/@href)
//! ```
//!
//! The [`Engine`](Engine) parses an expression into segments, executes them
//! through the operator pipeline, and coordinates a bounded fetch worker
//! pool with per-host throttling, URL de-duplication, and depth accounting.
//! [`hooks`](hooks) observe fetches, parsed documents, and extracted
//! values.

pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod html;
pub mod http;
pub mod ops;
pub mod parser;
pub mod value;

pub use config::{ClientConfig, EngineConfig, ThrottleConfig};
pub use engine::{evaluate_blocking, Engine, EvalStream};
pub use error::{
    current_error_policy, set_default_error_policy, with_error_policy, Error, ErrorPolicy,
};
pub use html::{Document, PageMeta};
pub use parser::{parse, render, Segment};
pub use value::{Page, Value, WxStr};

pub use bytes;
