use std::fmt;

/// Argument of a `url(...)` segment that extracts URLs from the current
/// document rather than naming one literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlArg {
    /// A relative XPath, e.g. `@href` or `//main//a/@href`.
    Xpath(String),
    /// The context item `.`: the current value is itself the URL.
    ContextItem,
}

impl UrlArg {
    pub fn as_xpath(&self) -> Option<&str> {
        match self {
            UrlArg::Xpath(x) => Some(x),
            UrlArg::ContextItem => None,
        }
    }
}

/// One compiled step of a wxpath program.
///
/// `UrlInfAndXpath` is only ever produced by the engine while expanding an
/// infinite crawl; the parser never emits it.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// `url('...')`
    UrlLit(String),
    /// `url(<xpath>)` / `url(.)`, with the number of leading slashes kept
    /// for relative evaluation and printing (0..=2).
    UrlQuery { arg: UrlArg, slashes: u8 },
    /// `url('...', follow=<xpath>[, depth=N])`
    UrlCrawl {
        url: String,
        follow: String,
        max_depth: Option<u32>,
    },
    /// `///url(<xpath>)`; `budget` bounds a `follow=` chain independently of
    /// the global max depth.
    UrlInf {
        xpath: String,
        budget: Option<u32>,
    },
    /// Internal: the page at `url` has been scheduled as part of an infinite
    /// crawl driven by `xpath`.
    UrlInfAndXpath {
        xpath: String,
        url: String,
        budget: Option<u32>,
    },
    /// A plain XPath step evaluated against the current node.
    Xpath(String),
    /// A pure XPath prefix joined to trailing segments by a top-level
    /// operator, e.g. `(1 to 3) ! url(.)`.
    Binary {
        left: String,
        op: String,
        right: Vec<Segment>,
    },
}

impl Segment {
    pub fn is_url_inf(&self) -> bool {
        matches!(self, Segment::UrlInf { .. })
    }

    /// Whether this segment needs an already-loaded document to run.
    pub fn needs_element(&self) -> bool {
        matches!(
            self,
            Segment::UrlQuery { .. } | Segment::UrlInf { .. } | Segment::Xpath(_)
        )
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::UrlLit(url) => write!(f, "url('{url}')"),
            Segment::UrlQuery { arg, slashes } => {
                for _ in 0..*slashes {
                    f.write_str("/")?;
                }
                match arg {
                    UrlArg::Xpath(x) => write!(f, "url({x})"),
                    UrlArg::ContextItem => write!(f, "url(.)"),
                }
            }
            Segment::UrlCrawl {
                url,
                follow,
                max_depth,
            } => {
                write!(f, "url('{url}', follow={follow}")?;
                if let Some(depth) = max_depth {
                    write!(f, ", depth={depth}")?;
                }
                write!(f, ")")
            }
            Segment::UrlInf { xpath, .. } => write!(f, "///url({xpath})"),
            Segment::UrlInfAndXpath { xpath, url, .. } => {
                write!(f, "///url({xpath}, '{url}')")
            }
            Segment::Xpath(x) => f.write_str(x),
            Segment::Binary { left, op, right } => {
                write!(f, "{left} {op} {}", render(right))
            }
        }
    }
}

/// Canonical printer: `parse(render(parse(src))) == parse(src)`.
pub fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        out.push_str(&segment.to_string());
    }
    out
}
