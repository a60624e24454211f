//! Operator dispatch: applying one segment to one node yields a finite list
//! of [`Intent`]s for the engine to react to. Handlers are pure functions of
//! `(node, segments, depth)`: no I/O and no queue manipulation happen here.

pub mod atomic;

use std::collections::BTreeMap;
use std::collections::HashSet;

use sxd_xpath::nodeset::Node;

use crate::error::Error;
use crate::html::{self, Document, XItem};
use crate::parser::{Segment, UrlArg};
use crate::value::{Fragment, Value, WxStr};

/// A value flowing through the local pipeline of one document.
pub enum PipeItem<'d> {
    Node(Node<'d>),
    Str(WxStr),
    Value(Value),
}

/// What a handler wants emitted downstream: either an owned value or a node
/// of the current document, which the engine detaches when yielding.
pub enum Emit<'d> {
    Value(Value),
    Node(Node<'d>),
}

/// The result of executing one segment against one node.
pub enum Intent<'d> {
    /// Yield a value downstream.
    Data(Emit<'d>),
    /// Fetch `url`, then continue with `next`.
    Crawl { url: String, next: Vec<Segment> },
    /// Continue on an already-loaded item, no network round-trip.
    Process {
        item: PipeItem<'d>,
        next: Vec<Segment>,
    },
    /// Like `Process`; produced when an infinite-crawl page still has
    /// trailing extraction segments.
    Extract {
        item: PipeItem<'d>,
        next: Vec<Segment>,
    },
    /// Continue expanding an infinite crawl from the loaded document.
    InfiniteCrawl {
        item: PipeItem<'d>,
        next: Vec<Segment>,
    },
}

/// Look up and run the handler for the head segment.
pub fn dispatch<'d>(
    doc: Option<&'d Document>,
    item: Option<PipeItem<'d>>,
    segments: &[Segment],
    depth: i64,
) -> Result<Vec<Intent<'d>>, Error> {
    let head = segments
        .first()
        .ok_or_else(|| Error::Dispatch("empty segment list".into()))?;
    let rest = &segments[1..];

    match head {
        Segment::UrlLit(url) => Ok(vec![Intent::Crawl {
            url: url.clone(),
            next: rest.to_vec(),
        }]),

        Segment::UrlCrawl {
            url,
            follow,
            max_depth,
        } => {
            let mut next = Vec::with_capacity(rest.len() + 1);
            next.push(Segment::UrlInfAndXpath {
                xpath: follow.clone(),
                url: url.clone(),
                budget: *max_depth,
            });
            next.extend_from_slice(rest);
            Ok(vec![Intent::Crawl {
                url: url.clone(),
                next,
            }])
        }

        Segment::Xpath(expr) => handle_xpath(doc, item, expr, rest, depth),

        Segment::UrlQuery { arg, slashes } => {
            handle_url_query(doc, item, arg, *slashes, rest)
        }

        Segment::UrlInf { xpath, budget } => handle_url_inf(doc, item, xpath, *budget, rest),

        Segment::UrlInfAndXpath { xpath, budget, .. } => {
            let node = require_node(doc, item, head)?;
            let mut intents = Vec::new();
            if rest.is_empty() {
                intents.push(Intent::Data(Emit::Node(node)));
            } else {
                intents.push(Intent::Extract {
                    item: PipeItem::Node(node),
                    next: rest.to_vec(),
                });
            }
            let mut next = Vec::with_capacity(rest.len() + 1);
            next.push(Segment::UrlInf {
                xpath: xpath.clone(),
                budget: *budget,
            });
            next.extend_from_slice(rest);
            intents.push(Intent::InfiniteCrawl {
                item: PipeItem::Node(node),
                next,
            });
            Ok(intents)
        }

        Segment::Binary { left, op: _, right } => handle_binary(doc, item, left, right, depth),
    }
}

fn require_doc<'d>(doc: Option<&'d Document>, segment: &Segment) -> Result<&'d Document, Error> {
    doc.ok_or_else(|| {
        Error::Syntax(format!(
            "segment `{segment}` needs an already-loaded document"
        ))
    })
}

fn require_node<'d>(
    doc: Option<&'d Document>,
    item: Option<PipeItem<'d>>,
    segment: &Segment,
) -> Result<Node<'d>, Error> {
    match item {
        Some(PipeItem::Node(node)) => Ok(node),
        None => Ok(require_doc(doc, segment)?.root_node()),
        Some(_) => Err(Error::Xpath {
            expr: segment.to_string(),
            reason: "segment applies to element nodes, not atomic values".into(),
        }),
    }
}

fn handle_xpath<'d>(
    doc: Option<&'d Document>,
    item: Option<PipeItem<'d>>,
    expr: &str,
    rest: &[Segment],
    depth: i64,
) -> Result<Vec<Intent<'d>>, Error> {
    let segment = Segment::Xpath(expr.to_string());
    let doc = require_doc(doc, &segment)?;
    let node = require_node(Some(doc), item, &segment)?;
    let base_url = doc.meta().base_url.clone();

    if let Some(pairs) = parse_map_expr(expr) {
        let map = eval_map(doc, node, &pairs, depth)?;
        let value = Value::Map(map);
        return Ok(vec![if rest.is_empty() {
            Intent::Data(Emit::Value(value))
        } else {
            Intent::Process {
                item: PipeItem::Value(value),
                next: rest.to_vec(),
            }
        }]);
    }

    let items = doc.xpath3(Some(node), expr)?;
    let mut intents = Vec::with_capacity(items.len());
    for item in items {
        let last = rest.is_empty();
        match item {
            XItem::Str(s) => {
                let wx = WxStr::new(s, Some(base_url.clone()), depth);
                intents.push(if last {
                    Intent::Data(Emit::Value(Value::Str(wx)))
                } else {
                    Intent::Process {
                        item: PipeItem::Str(wx),
                        next: rest.to_vec(),
                    }
                });
            }
            XItem::Node(node) => {
                intents.push(if last {
                    Intent::Data(Emit::Node(node))
                } else {
                    Intent::Process {
                        item: PipeItem::Node(node),
                        next: rest.to_vec(),
                    }
                });
            }
            XItem::Number(n) => intents.push(wrap_scalar(Value::Number(n), rest, last)),
            XItem::Bool(b) => intents.push(wrap_scalar(Value::Bool(b), rest, last)),
        }
    }
    Ok(intents)
}

fn wrap_scalar<'d>(value: Value, rest: &[Segment], last: bool) -> Intent<'d> {
    if last {
        Intent::Data(Emit::Value(value))
    } else {
        Intent::Process {
            item: PipeItem::Value(value),
            next: rest.to_vec(),
        }
    }
}

fn handle_url_query<'d>(
    doc: Option<&'d Document>,
    item: Option<PipeItem<'d>>,
    arg: &UrlArg,
    slashes: u8,
    rest: &[Segment],
) -> Result<Vec<Intent<'d>>, Error> {
    match arg {
        UrlArg::ContextItem => {
            let (value, base) = match item {
                Some(PipeItem::Str(s)) => (s.value.clone(), s.base_url.clone()),
                Some(PipeItem::Value(Value::Str(s))) => (s.value.clone(), s.base_url.clone()),
                _ => {
                    return Err(Error::Xpath {
                        expr: "url(.)".into(),
                        reason: "the context item is not a string".into(),
                    })
                }
            };
            let url = resolve_url(base.as_deref(), &value);
            Ok(vec![Intent::Crawl {
                url,
                next: rest.to_vec(),
            }])
        }
        UrlArg::Xpath(xpath) => {
            let segment = Segment::UrlQuery {
                arg: arg.clone(),
                slashes,
            };
            let doc = require_doc(doc, &segment)?;
            let node = require_node(Some(doc), item, &segment)?;

            // An attribute-shaped argument is evaluated relative to the
            // current node, with the leading slashes as the step separator:
            // `//url(@href)` reads `.//@href`.
            let effective = if xpath.starts_with('@') {
                format!(".{}{}", "/".repeat(slashes.max(1) as usize), xpath)
            } else {
                xpath.clone()
            };

            let urls = collect_urls(doc, node, &effective)?;
            Ok(urls
                .into_iter()
                .map(|url| Intent::Crawl {
                    url,
                    next: rest.to_vec(),
                })
                .collect())
        }
    }
}

fn handle_url_inf<'d>(
    doc: Option<&'d Document>,
    item: Option<PipeItem<'d>>,
    xpath: &str,
    budget: Option<u32>,
    rest: &[Segment],
) -> Result<Vec<Intent<'d>>, Error> {
    if budget == Some(0) {
        return Ok(Vec::new());
    }

    let segment = Segment::UrlInf {
        xpath: xpath.to_string(),
        budget,
    };
    let doc = require_doc(doc, &segment)?;
    let node = require_node(Some(doc), item, &segment)?;

    let effective = if xpath.starts_with('@') {
        format!(".//{xpath}")
    } else {
        xpath.to_string()
    };

    let urls = collect_urls(doc, node, &effective)?;
    let next_budget = budget.map(|b| b.saturating_sub(1));

    Ok(urls
        .into_iter()
        .map(|url| {
            let mut next = Vec::with_capacity(rest.len() + 1);
            next.push(Segment::UrlInfAndXpath {
                xpath: xpath.to_string(),
                url: url.clone(),
                budget: next_budget,
            });
            next.extend_from_slice(rest);
            Intent::Crawl { url, next }
        })
        .collect())
}

fn handle_binary<'d>(
    doc: Option<&'d Document>,
    item: Option<PipeItem<'d>>,
    left: &str,
    right: &[Segment],
    depth: i64,
) -> Result<Vec<Intent<'d>>, Error> {
    if right.is_empty() {
        return Err(Error::Dispatch(
            "binary segment expects non-empty trailing segments".into(),
        ));
    }

    // Without a document the left side can only be an atomic expression;
    // with one, path expressions go to the XPath engine.
    if doc.is_none() || atomic::is_atomic_expr(left) {
        let ctx = match &item {
            Some(PipeItem::Str(s)) => Some(atomic::Atomic::Str(s.value.clone())),
            _ => None,
        };
        let results = atomic::eval(left, ctx.as_ref())?;
        return Ok(results
            .into_iter()
            .map(|atom| {
                let item = match atom {
                    atomic::Atomic::Str(s) => PipeItem::Str(WxStr::plain(s)),
                    atomic::Atomic::Integer(i) => PipeItem::Value(Value::Number(i as f64)),
                    atomic::Atomic::Double(d) => PipeItem::Value(Value::Number(d)),
                    atomic::Atomic::Bool(b) => PipeItem::Value(Value::Bool(b)),
                };
                Intent::Process {
                    item,
                    next: right.to_vec(),
                }
            })
            .collect());
    }

    let doc = require_doc(doc, &Segment::Xpath(left.to_string()))?;
    let node = match item {
        Some(PipeItem::Node(n)) => n,
        _ => doc.root_node(),
    };
    let base_url = doc.meta().base_url.clone();

    let items = doc.xpath3(Some(node), left)?;
    Ok(items
        .into_iter()
        .map(|item| {
            let pipe_item = match item {
                XItem::Str(s) => PipeItem::Str(WxStr::new(s, Some(base_url.clone()), depth)),
                XItem::Node(n) => PipeItem::Node(n),
                XItem::Number(n) => PipeItem::Value(Value::Number(n)),
                XItem::Bool(b) => PipeItem::Value(Value::Bool(b)),
            };
            Intent::Process {
                item: pipe_item,
                next: right.to_vec(),
            }
        })
        .collect())
}

/// Run `xpath` on `node` and resolve every result absolute against the
/// document's base URL, de-duplicating while keeping first-seen order.
fn collect_urls(doc: &Document, node: Node<'_>, xpath: &str) -> Result<Vec<String>, Error> {
    let base = doc.meta().base_url.clone();
    let items = doc.xpath3(Some(node), xpath)?;

    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for item in items {
        let link = match item {
            XItem::Str(s) => s,
            XItem::Node(n) => html::node_string_value(n),
            _ => continue,
        };
        if link.is_empty() {
            continue;
        }
        let url = resolve_url(Some(&base), &link);
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    }
    Ok(urls)
}

/// Resolve `link` against `base`, falling back to the link itself when it is
/// already absolute or no base is known.
pub fn resolve_url(base: Option<&str>, link: &str) -> String {
    if let Some(base) = base {
        if let Ok(base) = url::Url::parse(base) {
            if let Ok(joined) = base.join(link) {
                return joined.to_string();
            }
        }
    }
    link.to_string()
}

// --- map{ ... } constructors ---

/// Recognize `map{ 'key': <expr>, ... }` (with an optional leading `/`).
fn parse_map_expr(expr: &str) -> Option<Vec<(String, String)>> {
    let t = expr.trim();
    let t = t.strip_prefix('/').unwrap_or(t).trim_start();
    let t = t.strip_prefix("map")?.trim_start();
    let inner = t.strip_prefix('{')?.strip_suffix('}')?;

    let mut pairs = Vec::new();
    for part in split_top_level(inner, ',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let colon = find_top_level(part, ':')?;
        let key = part[..colon].trim().trim_matches(|c| c == '\'' || c == '"');
        let value = part[colon + 1..].trim();
        pairs.push((key.to_string(), value.to_string()));
    }
    Some(pairs)
}

fn eval_map(
    doc: &Document,
    node: Node<'_>,
    pairs: &[(String, String)],
    depth: i64,
) -> Result<BTreeMap<String, Value>, Error> {
    let base_url = doc.meta().base_url.clone();
    let mut map = BTreeMap::new();

    for (key, expr) in pairs {
        let items = doc.xpath3(Some(node), expr)?;
        let mut values: Vec<Value> = items
            .into_iter()
            .map(|item| match item {
                XItem::Str(s) => Value::Str(WxStr::new(s, Some(base_url.clone()), depth)),
                XItem::Number(n) => Value::Number(n),
                XItem::Bool(b) => Value::Bool(b),
                XItem::Node(n) => Value::Fragment(Fragment {
                    tag: html::node_tag(n),
                    html: html::serialize_node(n),
                    base_url: Some(base_url.clone()),
                    depth,
                }),
            })
            .collect();
        let value = match values.len() {
            1 => values.pop().unwrap(),
            _ => Value::Seq(values),
        };
        map.insert(key.clone(), value);
    }

    Ok(map)
}

/// Split on `sep` at top level only: not inside parens, brackets, braces, or
/// string literals.
fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for ch in s.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '(' | '[' | '{' => {
                    depth += 1;
                    current.push(ch);
                }
                ')' | ']' | '}' => {
                    depth -= 1;
                    current.push(ch);
                }
                c if c == sep && depth == 0 => {
                    parts.push(std::mem::take(&mut current));
                }
                _ => current.push(ch),
            },
        }
    }
    parts.push(current);
    parts
}

fn find_top_level(s: &str, needle: char) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, ch) in s.char_indices() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                c if c == needle && depth == 0 => return Some(i),
                _ => {}
            },
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::html::PageMeta;

    fn doc(body: &str) -> Document {
        Document::parse(body, PageMeta::new("http://test/").with_depth(0)).unwrap()
    }

    #[test]
    fn url_literal_becomes_a_crawl() {
        let program = crate::parser::parse("url('http://test/')//h1/text()").unwrap();
        let intents = dispatch(None, None, &program, -1).unwrap();
        match &intents[..] {
            [Intent::Crawl { url, next }] => {
                assert_eq!(url, "http://test/");
                assert_eq!(next, &[Segment::Xpath("//h1/text()".into())]);
            }
            _ => panic!("expected a single crawl intent"),
        }
    }

    #[test]
    fn attribute_query_is_relative_to_the_current_node() {
        let d = doc(
            r#"<html><body>
                <a href="a.html">A</a>
                <a href="b.html">B</a>
                <a href="a.html">A again</a>
            </body></html>"#,
        );
        let intents = dispatch(
            Some(&d),
            Some(PipeItem::Node(d.root_node())),
            &[Segment::UrlQuery {
                arg: UrlArg::Xpath("@href".into()),
                slashes: 2,
            }],
            0,
        )
        .unwrap();

        let urls: Vec<_> = intents
            .iter()
            .map(|i| match i {
                Intent::Crawl { url, .. } => url.clone(),
                _ => panic!("expected crawl intents"),
            })
            .collect();
        // Absolute, de-duplicated, first-seen order.
        assert_eq!(urls, vec!["http://test/a.html", "http://test/b.html"]);
    }

    #[test]
    fn last_xpath_segment_yields_data() {
        let d = doc("<html><body><h1>Title</h1></body></html>");
        let intents = dispatch(
            Some(&d),
            Some(PipeItem::Node(d.root_node())),
            &[Segment::Xpath("//h1/text()".into())],
            0,
        )
        .unwrap();
        match &intents[..] {
            [Intent::Data(Emit::Value(Value::Str(s)))] => {
                assert_eq!(s.value, "Title");
                assert_eq!(s.base_url.as_deref(), Some("http://test/"));
            }
            _ => panic!("expected one data intent"),
        }
    }

    #[test]
    fn map_constructor_builds_a_map() {
        let d = doc("<html><body><h1>Title</h1></body></html>");
        let intents = dispatch(
            Some(&d),
            Some(PipeItem::Node(d.root_node())),
            &[Segment::Xpath(
                "map{ 'title': string(//h1), 'depth': wx:depth() }".into(),
            )],
            0,
        )
        .unwrap();
        match &intents[..] {
            [Intent::Data(Emit::Value(Value::Map(map)))] => {
                assert_eq!(map["title"].as_str(), Some("Title"));
                assert!(matches!(map["depth"], Value::Number(n) if n == 0.0));
            }
            _ => panic!("expected one map"),
        }
    }

    #[test]
    fn infinite_crawl_reenqueues_itself() {
        let d = doc(r#"<html><body><a href="next.html">next</a></body></html>"#);
        let intents = dispatch(
            Some(&d),
            Some(PipeItem::Node(d.root_node())),
            &[Segment::UrlInf {
                xpath: "@href".into(),
                budget: None,
            }],
            0,
        )
        .unwrap();
        match &intents[..] {
            [Intent::Crawl { url, next }] => {
                assert_eq!(url, "http://test/next.html");
                assert!(matches!(next[0], Segment::UrlInfAndXpath { .. }));
            }
            _ => panic!("expected one crawl"),
        }
    }

    #[test]
    fn exhausted_budget_stops_expansion() {
        let d = doc(r#"<html><body><a href="next.html">next</a></body></html>"#);
        let intents = dispatch(
            Some(&d),
            Some(PipeItem::Node(d.root_node())),
            &[Segment::UrlInf {
                xpath: "@href".into(),
                budget: Some(0),
            }],
            0,
        )
        .unwrap();
        assert!(intents.is_empty());
    }
}
