//! Fetched bytes become a [`Document`]: an XPath-queryable tree annotated
//! with per-document crawl metadata (base URL, backlink, depth, response).
//!
//! HTML is parsed with html5ever (via `scraper`) and rebuilt node-by-node
//! into an `sxd-document` tree, which the XPath engine evaluates against.
//! html5ever always normalizes markup into a single `<html>` root, so the
//! tree handed to the XPath engine is guaranteed well-formed.

use lazy_static::lazy_static;
use sxd_document::dom;
use sxd_document::Package;
use sxd_xpath::context::{self, Context};
use sxd_xpath::function::{self, Function};
use sxd_xpath::nodeset::{Node, Nodeset};
use sxd_xpath::{Factory, Value as XValue};

use crate::error::Error;

/// Namespace of the DSL-specific XPath functions.
pub const WX_NAMESPACE: &str = "http://wxpath.dev/ns";

lazy_static! {
    static ref XP_FACTORY: Factory = Factory::new();
}

/// Response details recorded on the document that a fetch produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMeta {
    pub status: u16,
    /// Seconds between request start and response end.
    pub elapsed: f64,
}

/// Crawl metadata attached to a document before any user XPath runs.
#[derive(Debug, Clone, PartialEq)]
pub struct PageMeta {
    pub base_url: String,
    pub backlink: Option<String>,
    pub depth: i64,
    pub response: Option<ResponseMeta>,
}

impl PageMeta {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            backlink: None,
            depth: 0,
            response: None,
        }
    }

    pub fn with_backlink(mut self, backlink: Option<String>) -> Self {
        self.backlink = backlink;
        self
    }

    pub fn with_depth(mut self, depth: i64) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_response(mut self, response: Option<ResponseMeta>) -> Self {
        self.response = response;
        self
    }
}

/// An HTML document plus its crawl metadata.
pub struct Document {
    package: Package,
    meta: PageMeta,
}

/// One item out of an XPath evaluation. Attribute and text nodes come back
/// as strings, mirroring how results feed the rest of the pipeline.
pub enum XItem<'d> {
    Node(Node<'d>),
    Str(String),
    Number(f64),
    Bool(bool),
}

impl Document {
    /// Parse `body` into a document carrying `meta`.
    pub fn parse(body: &str, meta: PageMeta) -> Result<Self, Error> {
        let html = scraper::Html::parse_document(body);
        let package = build_package(&html);

        let doc = Self { package, meta };
        if doc.root_element().is_none() {
            return Err(Error::Parse {
                url: doc.meta.base_url.clone(),
            });
        }
        Ok(doc)
    }

    pub fn meta(&self) -> &PageMeta {
        &self.meta
    }

    pub fn root_element(&self) -> Option<dom::Element<'_>> {
        self.package
            .as_document()
            .root()
            .children()
            .into_iter()
            .find_map(|c| c.element())
    }

    pub fn root_node(&self) -> Node<'_> {
        match self.root_element() {
            Some(el) => Node::Element(el),
            None => Node::Root(self.package.as_document().root()),
        }
    }

    pub fn root_tag(&self) -> String {
        self.root_element()
            .map(|el| el.name().local_part().to_string())
            .unwrap_or_default()
    }

    /// Evaluate an XPath expression with the `wx:*` function library bound.
    /// `node` is the context item; the document root when `None`.
    pub fn xpath3<'d>(
        &'d self,
        node: Option<Node<'d>>,
        expr: &str,
    ) -> Result<Vec<XItem<'d>>, Error> {
        let expanded = self.expand_wx_macros(expr);
        let xpath_err = |reason: String| Error::Xpath {
            expr: expr.to_string(),
            reason,
        };

        let xpath = XP_FACTORY
            .build(&expanded)
            .map_err(|e| xpath_err(e.to_string()))?
            .ok_or_else(|| xpath_err("empty expression".into()))?;

        let context = self.build_context();
        let context_node = node.unwrap_or_else(|| self.root_node());
        let value = xpath
            .evaluate(&context, context_node)
            .map_err(|e| xpath_err(e.to_string()))?;

        Ok(match value {
            XValue::Nodeset(nodes) => nodes
                .document_order()
                .into_iter()
                .filter_map(|node| match node {
                    Node::Attribute(attr) => Some(XItem::Str(attr.value().to_string())),
                    Node::Text(text) => Some(XItem::Str(text.text().to_string())),
                    Node::Comment(c) => Some(XItem::Str(c.text().to_string())),
                    Node::Namespace(_) => None,
                    other => Some(XItem::Node(other)),
                })
                .collect(),
            XValue::String(s) => vec![XItem::Str(s)],
            XValue::Number(n) => vec![XItem::Number(n)],
            XValue::Boolean(b) => vec![XItem::Bool(b)],
        })
    }

    /// Expand the scalar `wx:*` functions as literals against this
    /// document's recorded metadata, before the XPath engine sees them.
    fn expand_wx_macros(&self, expr: &str) -> String {
        if !expr.contains("wx:") {
            return expr.to_string();
        }

        let backlink = format!(
            "string('{}')",
            self.meta.backlink.clone().unwrap_or_default()
        );
        let depth = format!("number({})", self.meta.depth);
        let current_url = format!("string('{}')", self.meta.base_url);

        let mut out = expr.to_string();
        for pat in ["wx:backlink()", "wx:backlink(.)"] {
            out = out.replace(pat, &backlink);
        }
        for pat in ["wx:depth()", "wx:depth(.)"] {
            out = out.replace(pat, &depth);
        }
        out = out.replace("wx:current-url()", &current_url);

        if let Some(resp) = &self.meta.response {
            out = out.replace("wx:status-code()", &format!("number({})", resp.status));
            let elapsed = format!("number({})", resp.elapsed);
            out = out.replace("wx:fetch-time()", &elapsed);
            out = out.replace("wx:elapsed()", &elapsed);
        }

        out
    }

    fn build_context(&self) -> Context<'_> {
        let mut context = Context::new();
        context.set_namespace("wx", WX_NAMESPACE);
        context.set_function((WX_NAMESPACE, "elem"), WxElem);
        context.set_function((WX_NAMESPACE, "main-article-text"), WxMainArticleText);
        context.set_function(
            (WX_NAMESPACE, "internal-links"),
            WxLinks {
                base_url: self.meta.base_url.clone(),
                internal: true,
            },
        );
        context.set_function(
            (WX_NAMESPACE, "external-links"),
            WxLinks {
                base_url: self.meta.base_url.clone(),
                internal: false,
            },
        );
        context
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("tag", &self.root_tag())
            .field("meta", &self.meta)
            .finish()
    }
}

// --- html5ever tree -> sxd tree ---

fn build_package(html: &scraper::Html) -> Package {
    let package = Package::new();
    let doc = package.as_document();

    for child in html.tree.root().children() {
        if let scraper::Node::Element(el) = child.value() {
            let root = doc.create_element(el.name());
            copy_attributes(el, root);
            doc.root().append_child(root);
            for grandchild in child.children() {
                build_into(doc, root, grandchild);
            }
            // html5ever produces a single root element.
            break;
        }
    }

    package
}

fn build_into(
    doc: dom::Document<'_>,
    parent: dom::Element<'_>,
    node: ego_tree::NodeRef<'_, scraper::Node>,
) {
    match node.value() {
        scraper::Node::Element(el) => {
            let child = doc.create_element(el.name());
            copy_attributes(el, child);
            parent.append_child(child);
            for grandchild in node.children() {
                build_into(doc, child, grandchild);
            }
        }
        scraper::Node::Text(text) => {
            parent.append_child(doc.create_text(&text.text));
        }
        _ => {}
    }
}

fn copy_attributes(el: &scraper::node::Element, target: dom::Element<'_>) {
    for (name, value) in el.attrs() {
        if is_plain_attr_name(name) {
            target.set_attribute_value(name, value);
        }
    }
}

/// Attribute names the XPath tree can carry; namespaced and otherwise
/// irregular names from real-world markup are dropped.
fn is_plain_attr_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// --- serialization of extracted nodes ---

/// Serialize a node subtree back to markup, for detaching extracted
/// elements from their document.
pub fn serialize_node(node: Node<'_>) -> String {
    let mut out = String::new();
    write_node(&mut out, node);
    out
}

fn write_node(out: &mut String, node: Node<'_>) {
    match node {
        Node::Element(el) => write_element(out, el),
        Node::Text(text) => out.push_str(&escape_text(text.text())),
        Node::Root(root) => {
            for child in root.children() {
                if let dom::ChildOfRoot::Element(el) = child {
                    write_element(out, el);
                }
            }
        }
        _ => {}
    }
}

fn write_element(out: &mut String, el: dom::Element<'_>) {
    out.push('<');
    out.push_str(el.name().local_part());
    for attr in el.attributes() {
        out.push(' ');
        out.push_str(attr.name().local_part());
        out.push_str("=\"");
        out.push_str(&escape_text(attr.value()).replace('"', "&quot;"));
        out.push('"');
    }
    out.push('>');
    for child in el.children() {
        match child {
            dom::ChildOfElement::Element(e) => write_element(out, e),
            dom::ChildOfElement::Text(t) => out.push_str(&escape_text(t.text())),
            _ => {}
        }
    }
    out.push_str("</");
    out.push_str(el.name().local_part());
    out.push('>');
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// XPath string-value of a node: concatenated descendant text for
/// elements, the literal value for attributes and text nodes.
pub fn node_string_value(node: Node<'_>) -> String {
    match node {
        Node::Element(el) => collect_text(el),
        Node::Attribute(attr) => attr.value().to_string(),
        Node::Text(text) => text.text().to_string(),
        Node::Comment(c) => c.text().to_string(),
        Node::Root(root) => root
            .children()
            .into_iter()
            .filter_map(|c| match c {
                dom::ChildOfRoot::Element(el) => Some(collect_text(el)),
                _ => None,
            })
            .collect(),
        _ => String::new(),
    }
}

pub fn node_tag(node: Node<'_>) -> String {
    match node {
        Node::Element(el) => el.name().local_part().to_string(),
        Node::Root(_) => "#document".to_string(),
        _ => "#node".to_string(),
    }
}

// --- registrable domain heuristic ---

/// "Last two labels, or last three labels if the penultimate label has at
/// most 3 characters and the last label has 2" — so `bbc.co.uk` stays
/// `bbc.co.uk` while `books.toscrape.com` becomes `toscrape.com`.
pub fn registrable_domain(base_url: &str) -> String {
    let host = url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();

    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() > 2 {
        let last = parts[parts.len() - 1];
        let penultimate = parts[parts.len() - 2];
        if last.len() == 2 && penultimate.len() <= 3 {
            parts[parts.len() - 3..].join(".")
        } else {
            parts[parts.len() - 2..].join(".")
        }
    } else {
        host
    }
}

fn is_internal_href(href: &str, root_domain: &str) -> bool {
    !href.starts_with("http")
        || href.contains(&format!("://{root_domain}"))
        || href.contains(&format!(".{root_domain}"))
}

// --- wx:* native functions ---

fn exactly_zero_args(args: &[XValue<'_>]) -> Result<(), function::Error> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(function::Error::TooManyArguments {
            expected: 0,
            actual: args.len(),
        })
    }
}

/// `wx:elem()` — the context element itself, useful in map constructors.
struct WxElem;

impl Function for WxElem {
    fn evaluate<'c, 'd>(
        &self,
        context: &context::Evaluation<'c, 'd>,
        args: Vec<XValue<'d>>,
    ) -> Result<XValue<'d>, function::Error> {
        exactly_zero_args(&args)?;
        let mut nodes = Nodeset::new();
        nodes.add(context.node);
        Ok(XValue::Nodeset(nodes))
    }
}

/// `wx:internal-links()` / `wx:external-links()` — `href` attribute nodes of
/// anchors pointing inside (or outside) the document's registrable domain.
/// Allows for false positives; relative links count as internal.
struct WxLinks {
    base_url: String,
    internal: bool,
}

impl Function for WxLinks {
    fn evaluate<'c, 'd>(
        &self,
        context: &context::Evaluation<'c, 'd>,
        args: Vec<XValue<'d>>,
    ) -> Result<XValue<'d>, function::Error> {
        exactly_zero_args(&args)?;
        let root_domain = registrable_domain(&self.base_url);

        let mut nodes = Nodeset::new();
        let root = context.node.document().root();
        for element in descendant_elements(root) {
            if element.name().local_part() != "a" {
                continue;
            }
            if let Some(attr) = element.attribute("href") {
                if is_internal_href(attr.value(), &root_domain) == self.internal {
                    nodes.add(Node::Attribute(attr));
                }
            }
        }
        Ok(XValue::Nodeset(nodes))
    }
}

/// `wx:main-article-text()` — the frequency-of-text-parents heuristic:
/// gather parents of long text nodes, pick the most common parent path, and
/// join the text under it.
struct WxMainArticleText;

impl Function for WxMainArticleText {
    fn evaluate<'c, 'd>(
        &self,
        context: &context::Evaluation<'c, 'd>,
        args: Vec<XValue<'d>>,
    ) -> Result<XValue<'d>, function::Error> {
        exactly_zero_args(&args)?;
        let root = context.node.document().root();
        Ok(XValue::String(main_article_text(root)))
    }
}

const NON_CONTENT_TAGS: [&str; 8] = [
    "script", "noscript", "style", "i", "b", "strong", "span", "a",
];

pub fn main_article_text(root: dom::Root<'_>) -> String {
    // (path of parent element, parent element), one entry per parent.
    let mut candidates: Vec<(String, dom::Element<'_>)> = Vec::new();

    for (path, element) in indexed_elements(root) {
        if !path.contains("/body") || NON_CONTENT_TAGS.contains(&element.name().local_part()) {
            continue;
        }
        let has_long_text = element.children().into_iter().any(|c| match c {
            dom::ChildOfElement::Text(t) => normalize_space(t.text()).len() > 20,
            _ => false,
        });
        if has_long_text && !candidates.iter().any(|(p, _)| p == &path) {
            candidates.push((path, element));
        }
    }

    // Most common grandparent path wins.
    let mut counts: Vec<(String, usize)> = Vec::new();
    for (path, _) in &candidates {
        let parent_path = match path.rsplit_once('/') {
            Some((head, _)) => head.to_string(),
            None => String::new(),
        };
        match counts.iter_mut().find(|(p, _)| *p == parent_path) {
            Some((_, n)) => *n += 1,
            None => counts.push((parent_path, 1)),
        }
    }
    let Some((max_path, _)) = counts.iter().max_by_key(|(_, n)| *n) else {
        return String::new();
    };

    let texts: Vec<String> = candidates
        .iter()
        .filter(|(path, _)| path.contains(max_path.as_str()))
        .map(|(_, el)| collect_text(*el))
        .collect();
    texts.join(" ")
}

fn normalize_space(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_text(el: dom::Element<'_>) -> String {
    let mut out = String::new();
    fn walk(el: dom::Element<'_>, out: &mut String) {
        for child in el.children() {
            match child {
                dom::ChildOfElement::Text(t) => out.push_str(t.text()),
                dom::ChildOfElement::Element(e) => walk(e, out),
                _ => {}
            }
        }
    }
    walk(el, &mut out);
    out
}

fn descendant_elements(root: dom::Root<'_>) -> Vec<dom::Element<'_>> {
    let mut out = Vec::new();
    fn walk<'d>(el: dom::Element<'d>, out: &mut Vec<dom::Element<'d>>) {
        out.push(el);
        for child in el.children() {
            if let dom::ChildOfElement::Element(e) = child {
                walk(e, out);
            }
        }
    }
    for child in root.children() {
        if let dom::ChildOfRoot::Element(el) = child {
            walk(el, &mut out);
        }
    }
    out
}

/// Elements paired with an lxml-style indexed path such as
/// `/html/body/div[1]/p[2]`.
fn indexed_elements(root: dom::Root<'_>) -> Vec<(String, dom::Element<'_>)> {
    let mut out = Vec::new();

    fn walk<'d>(el: dom::Element<'d>, path: String, out: &mut Vec<(String, dom::Element<'d>)>) {
        out.push((path.clone(), el));

        let children: Vec<dom::Element<'d>> = el
            .children()
            .into_iter()
            .filter_map(|c| match c {
                dom::ChildOfElement::Element(e) => Some(e),
                _ => None,
            })
            .collect();

        for (i, child) in children.iter().enumerate() {
            let name = child.name().local_part();
            let same_name = children
                .iter()
                .filter(|c| c.name().local_part() == name)
                .count();
            let index = children[..i]
                .iter()
                .filter(|c| c.name().local_part() == name)
                .count()
                + 1;
            let child_path = if same_name > 1 {
                format!("{path}/{name}[{index}]")
            } else {
                format!("{path}/{name}")
            };
            walk(*child, child_path, out);
        }
    }

    for child in root.children() {
        if let dom::ChildOfRoot::Element(el) = child {
            let name = el.name().local_part().to_string();
            walk(el, format!("/{name}"), &mut out);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(body: &str) -> Document {
        Document::parse(body, PageMeta::new("http://test/").with_depth(1)).unwrap()
    }

    #[test]
    fn attaches_metadata_before_xpath_runs() {
        let d = doc("<html><body><p>Hello</p></body></html>");
        assert_eq!(d.meta().base_url, "http://test/");
        assert_eq!(d.meta().depth, 1);
        assert_eq!(d.root_tag(), "html");
    }

    #[test]
    fn fragments_normalize_to_a_single_root() {
        let d = doc("<p>one</p><p>two</p>");
        assert_eq!(d.root_tag(), "html");
        let items = d.xpath3(None, "//p/text()").unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn attribute_results_come_back_as_strings() {
        let d = doc(r#"<html><body><a href="a.html">A</a></body></html>"#);
        let items = d.xpath3(None, "//a/@href").unwrap();
        match &items[..] {
            [XItem::Str(s)] => assert_eq!(s, "a.html"),
            _ => panic!("expected one string"),
        }
    }

    #[test]
    fn depth_macro_expands_from_metadata() {
        let d = doc("<html><body><p>x</p></body></html>");
        let items = d.xpath3(None, "wx:depth()").unwrap();
        match &items[..] {
            [XItem::Number(n)] => assert_eq!(*n, 1.0),
            _ => panic!("expected a number"),
        }
    }

    #[test]
    fn registrable_domain_heuristic() {
        assert_eq!(registrable_domain("https://www.bbc.co.uk/x"), "bbc.co.uk");
        assert_eq!(
            registrable_domain("https://books.toscrape.com/"),
            "toscrape.com"
        );
        assert_eq!(registrable_domain("http://test/"), "test");
    }

    #[test]
    fn internal_links_include_relative_hrefs() {
        let d = Document::parse(
            r#"<html><body>
                <a href="/rel">rel</a>
                <a href="https://other.example.org/x">ext</a>
                <a href="https://sub.test.com/y">int</a>
            </body></html>"#,
            PageMeta::new("https://www.test.com/"),
        )
        .unwrap();
        let internal = d.xpath3(None, "wx:internal-links()").unwrap();
        assert_eq!(internal.len(), 2);
        let external = d.xpath3(None, "wx:external-links()").unwrap();
        assert_eq!(external.len(), 1);
    }

    #[test]
    fn main_article_text_picks_dominant_parent() {
        let d = doc(
            "<html><body>\
             <div><p>This paragraph easily exceeds twenty characters.</p>\
             <p>Another sufficiently long paragraph of body text.</p></div>\
             <nav><a href=\"x\">short</a></nav>\
             </body></html>",
        );
        let items = d.xpath3(None, "wx:main-article-text()").unwrap();
        match &items[..] {
            [XItem::Str(s)] => {
                assert!(s.contains("This paragraph"));
                assert!(s.contains("Another sufficiently"));
            }
            _ => panic!("expected a string"),
        }
    }
}
