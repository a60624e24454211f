use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use crate::html::Document;

/// A string extracted from a document, carrying the URL and crawl depth of
/// the document it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct WxStr {
    pub value: String,
    pub base_url: Option<String>,
    pub depth: i64,
}

impl WxStr {
    pub fn new(value: impl Into<String>, base_url: Option<String>, depth: i64) -> Self {
        Self {
            value: value.into(),
            base_url,
            depth,
        }
    }

    /// A string with no provenance, as produced outside any document.
    pub fn plain(value: impl Into<String>) -> Self {
        Self::new(value, None, -1)
    }
}

impl Deref for WxStr {
    type Target = str;

    fn deref(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for WxStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// A whole fetched document, shared by reference between the pipeline and
/// any values yielded downstream.
#[derive(Clone)]
pub struct Page {
    doc: Rc<Document>,
}

impl Page {
    pub fn new(doc: Rc<Document>) -> Self {
        Self { doc }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn base_url(&self) -> &str {
        &self.doc.meta().base_url
    }

    pub fn backlink(&self) -> Option<&str> {
        self.doc.meta().backlink.as_deref()
    }

    pub fn depth(&self) -> i64 {
        self.doc.meta().depth
    }

    pub fn status(&self) -> Option<u16> {
        self.doc.meta().response.as_ref().map(|r| r.status)
    }

    pub fn tag(&self) -> String {
        self.doc.root_tag()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("tag", &self.tag())
            .field("base_url", &self.base_url())
            .field("depth", &self.depth())
            .finish()
    }
}

/// An element node extracted from a document, detached as serialized markup.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub tag: String,
    pub html: String,
    pub base_url: Option<String>,
    pub depth: i64,
}

/// A value produced by evaluating a wxpath expression.
#[derive(Debug, Clone)]
pub enum Value {
    Str(WxStr),
    Number(f64),
    Bool(bool),
    Map(BTreeMap<String, Value>),
    Seq(Vec<Value>),
    Page(Page),
    Fragment(Fragment),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(&s.value),
            _ => None,
        }
    }

    pub fn as_page(&self) -> Option<&Page> {
        match self {
            Value::Page(p) => Some(p),
            _ => None,
        }
    }

    /// Convert to plain JSON. Documents and fragments are reduced to their
    /// metadata so that every value has a JSON shape.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Str(s) => serde_json::Value::String(s.value.clone()),
            Value::Number(n) => number_to_json(*n),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Seq(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Page(page) => serde_json::json!({
                "_element": page.tag(),
                "url": page.base_url(),
                "depth": page.depth(),
            }),
            Value::Fragment(frag) => serde_json::json!({
                "_element": frag.tag,
                "url": frag.base_url,
                "depth": frag.depth,
            }),
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < i64::MAX as f64 {
        serde_json::Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(WxStr::plain(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(WxStr::plain(s))
    }
}

impl From<WxStr> for Value {
    fn from(s: WxStr) -> Self {
        Value::Str(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}
