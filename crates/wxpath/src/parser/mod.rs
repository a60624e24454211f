//! The wxpath parser: a token stream (see [`lexer`]) is folded into a
//! sequence of [`Segment`]s, the program the engine executes.
//!
//! A program either starts with a `url('...')` fetch or with an XPath prefix
//! acting on a caller-provided node. A pure XPath prefix joined to the rest
//! by a top-level operator (`!`, `||`, comparisons) is split off into a
//! [`Segment::Binary`].

pub mod ast;
pub mod lexer;

pub use ast::{render, Segment, UrlArg};

use lexer::{tokenize, Token, TokenKind};

use crate::error::Error;

/// Operators that may join a pure XPath prefix to trailing wxpath segments.
/// Path syntax (`/`, `*`, `+`, `-`) is deliberately absent: those characters
/// occur inside ordinary XPath steps and names.
const BOUNDARY_OPS: [&str; 8] = ["||", "!", "=", "!=", "<", "<=", ">", ">="];

/// Parse wxpath source into an executable program.
pub fn parse(src: &str) -> Result<Vec<Segment>, Error> {
    let tokens = tokenize(src);

    let has_wxpath = tokens.iter().any(|t| t.kind == TokenKind::Wxpath);
    if !has_wxpath {
        return Ok(vec![Segment::Xpath(src.trim().to_string())]);
    }

    if let Some(op_pos) = find_boundary(&tokens) {
        let left = src[..tokens[op_pos].start].trim().to_string();
        let op = tokens[op_pos].text.clone();
        let mut parser = Parser::new(&tokens[op_pos + 1..]);
        let right = parser.parse_segments()?;
        parser.expect_eof()?;
        let right = collapse_inf_prefix(right)?;
        validate(&right, false)?;
        let program = vec![Segment::Binary { left, op, right }];
        validate_single_inf(&program)?;
        return Ok(program);
    }

    let mut parser = Parser::new(&tokens);
    let segments = parser.parse_segments()?;
    parser.expect_eof()?;
    let segments = collapse_inf_prefix(segments)?;
    validate(&segments, true)?;
    validate_single_inf(&segments)?;
    Ok(segments)
}

/// Find the operator connecting a pure XPath prefix to the first `url`
/// marker: the closest top-level boundary operator before it.
fn find_boundary(tokens: &[Token]) -> Option<usize> {
    let wx_pos = tokens.iter().position(|t| t.kind == TokenKind::Wxpath)?;

    let mut paren_depth = 0i32;
    for i in (0..wx_pos).rev() {
        match tokens[i].kind {
            TokenKind::RParen => paren_depth += 1,
            TokenKind::LParen => paren_depth -= 1,
            TokenKind::Op
                if paren_depth == 0 && BOUNDARY_OPS.contains(&tokens[i].text.as_str()) =>
            {
                return Some(i);
            }
            _ => {}
        }
    }
    None
}

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

/// Argument shapes collected inside `url( ... )`.
enum ArgItem {
    Xpath(String),
    ContextItem,
    Nested(Vec<Segment>),
}

#[derive(Default)]
struct UrlArgs {
    items: Vec<ArgItem>,
    follow: Option<String>,
    depth: Option<u32>,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn expect_eof(&self) -> Result<(), Error> {
        match self.peek().kind {
            TokenKind::Eof => Ok(()),
            _ => Err(Error::Syntax(format!(
                "unexpected token `{}` at offset {}",
                self.peek().text,
                self.peek().start
            ))),
        }
    }

    /// Parse `url()` calls interspersed with XPath fragments.
    fn parse_segments(&mut self) -> Result<Vec<Segment>, Error> {
        let mut segments = Vec::new();

        loop {
            match self.peek().kind {
                TokenKind::Eof => break,
                TokenKind::Wxpath => {
                    let spliced = self.parse_url_call()?;
                    segments.extend(spliced);
                }
                TokenKind::RParen | TokenKind::Comma | TokenKind::RBrace => break,
                _ => {
                    let xpath = self.capture_xpath();
                    let xpath = xpath.trim();
                    if !xpath.is_empty() {
                        segments.push(Segment::Xpath(xpath.to_string()));
                    }
                }
            }
        }

        Ok(segments)
    }

    /// Capture XPath content until the next `url` marker or the end of the
    /// enclosing context. Parens and braces are balanced so that XPath
    /// function calls and `map{ ... }` constructors are captured verbatim.
    fn capture_xpath(&mut self) -> String {
        let mut out = String::new();
        let mut paren_depth = 0i32;
        let mut brace_depth = 0i32;

        loop {
            let token = self.peek();
            match token.kind {
                TokenKind::Eof => break,
                TokenKind::Wxpath | TokenKind::RParen | TokenKind::Comma
                    if paren_depth == 0 && brace_depth == 0 =>
                {
                    break;
                }
                TokenKind::LParen => {
                    paren_depth += 1;
                    out.push_str(&token.text);
                    self.advance();
                }
                TokenKind::RParen => {
                    paren_depth -= 1;
                    if paren_depth < 0 {
                        break;
                    }
                    out.push_str(&token.text);
                    self.advance();
                }
                TokenKind::LBrace => {
                    brace_depth += 1;
                    out.push_str(&token.text);
                    self.advance();
                }
                TokenKind::RBrace => {
                    brace_depth -= 1;
                    if brace_depth < 0 {
                        break;
                    }
                    out.push_str(&token.text);
                    self.advance();
                }
                _ => {
                    out.push_str(&token.text);
                    self.advance();
                }
            }
        }

        out
    }

    /// Parse one `url(...)` call (the `url` marker is the current token) and
    /// return the segments it contributes to the program. Nested calls like
    /// `url( url('..')//a/@href )` splice into several segments.
    fn parse_url_call(&mut self) -> Result<Vec<Segment>, Error> {
        let marker = self.peek().text.clone();
        let slashes = marker.bytes().filter(|b| *b == b'/').count() as u8;
        self.advance();

        if self.peek().kind != TokenKind::LParen {
            return Err(Error::Syntax(format!(
                "expected '(' after `{}`",
                marker.trim()
            )));
        }
        self.advance();

        // url('literal', ...) is resolved up front so that quoted URLs are
        // never confused with XPath content.
        if self.peek().kind == TokenKind::Str {
            let url = strip_quotes(&self.peek().text);
            self.advance();
            let args = self.capture_url_args()?;
            self.expect_rparen()?;

            if !args.items.is_empty() {
                return Err(Error::Syntax(
                    "unexpected content after the URL literal in url(...)".into(),
                ));
            }
            if slashes > 0 {
                return Err(Error::Syntax(format!(
                    "url() may not combine a string literal argument with \
                     leading navigation slashes: {marker}(...)"
                )));
            }

            let segment = match args.follow {
                Some(follow) => Segment::UrlCrawl {
                    url,
                    follow,
                    max_depth: args.depth,
                },
                None => Segment::UrlLit(url),
            };
            return Ok(vec![segment]);
        }

        let args = self.capture_url_args()?;
        self.expect_rparen()?;

        if args.follow.is_some() || args.depth.is_some() {
            return Err(Error::Syntax(
                "follow=/depth= require a string literal URL argument".into(),
            ));
        }

        let mut items = args.items;
        match items.len() {
            0 => Err(Error::Syntax("url() requires an argument".into())),
            1 => match items.remove(0) {
                ArgItem::ContextItem if slashes == 3 => Err(Error::Syntax(
                    "///url(.) is not meaningful: the context item names a single URL".into(),
                )),
                ArgItem::ContextItem => Ok(vec![Segment::UrlQuery {
                    arg: UrlArg::ContextItem,
                    slashes,
                }]),
                ArgItem::Xpath(x) if slashes == 3 => Ok(vec![Segment::UrlInf {
                    xpath: x,
                    budget: None,
                }]),
                ArgItem::Xpath(x) => Ok(vec![Segment::UrlQuery {
                    arg: UrlArg::Xpath(x),
                    slashes,
                }]),
                ArgItem::Nested(mut nested) => {
                    nested.push(Segment::UrlQuery {
                        arg: UrlArg::ContextItem,
                        slashes: 0,
                    });
                    Ok(nested)
                }
            },
            2 => {
                let second = items.pop().unwrap();
                let first = items.pop().unwrap();
                match (first, second) {
                    (ArgItem::Nested(mut nested), ArgItem::Xpath(x)) => {
                        nested.push(Segment::Xpath(x));
                        nested.push(Segment::UrlQuery {
                            arg: UrlArg::ContextItem,
                            slashes: 0,
                        });
                        Ok(nested)
                    }
                    _ => Err(Error::Syntax("unsupported arguments in url(...)".into())),
                }
            }
            _ => Err(Error::Syntax("unsupported arguments in url(...)".into())),
        }
    }

    fn expect_rparen(&mut self) -> Result<(), Error> {
        if self.peek().kind != TokenKind::RParen {
            return Err(Error::Syntax("unbalanced parentheses in url()".into()));
        }
        self.advance();
        Ok(())
    }

    /// Capture the inside of a `url(...)` call: XPath content, nested `url`
    /// calls, and `follow=` / `depth=` keyword arguments. Stops before the
    /// closing paren of the call.
    fn capture_url_args(&mut self) -> Result<UrlArgs, Error> {
        let mut args = UrlArgs::default();
        let mut current = String::new();
        let mut follow = String::new();
        let mut depth = String::new();

        enum Sink {
            Xpath,
            Follow,
            Depth,
        }
        let mut sink = Sink::Xpath;

        let mut paren_balance = 1i32;

        loop {
            let token = self.peek().clone();
            match token.kind {
                TokenKind::Eof => break,
                TokenKind::Wxpath => {
                    flush(&mut current, &mut args);
                    let nested = self.parse_url_call()?;
                    args.items.push(ArgItem::Nested(nested));
                }
                TokenKind::Follow => {
                    sink = Sink::Follow;
                    self.advance();
                }
                TokenKind::Depth => {
                    sink = Sink::Depth;
                    self.advance();
                }
                TokenKind::LParen => {
                    paren_balance += 1;
                    push_sink(&mut sink, &mut current, &mut follow, &mut depth, &token.text);
                    self.advance();
                }
                TokenKind::RParen => {
                    paren_balance -= 1;
                    if paren_balance == 0 {
                        break;
                    }
                    push_sink(&mut sink, &mut current, &mut follow, &mut depth, &token.text);
                    self.advance();
                }
                _ => {
                    push_sink(&mut sink, &mut current, &mut follow, &mut depth, &token.text);
                    self.advance();
                }
            }
        }

        if paren_balance != 0 {
            return Err(Error::Syntax("unbalanced parentheses in url()".into()));
        }

        flush(&mut current, &mut args);

        let follow = follow.trim();
        if !follow.is_empty() {
            args.follow = Some(follow.to_string());
        }
        let depth = depth.trim();
        if !depth.is_empty() {
            args.depth = Some(depth.parse::<u32>().map_err(|_| {
                Error::Syntax(format!("depth= expects an integer, got `{depth}`"))
            })?);
        }

        return Ok(args);

        fn flush(current: &mut String, args: &mut UrlArgs) {
            let content = current.trim();
            if !content.is_empty() {
                if content == "." {
                    args.items.push(ArgItem::ContextItem);
                } else {
                    args.items.push(ArgItem::Xpath(content.to_string()));
                }
            }
            current.clear();
        }

        fn push_sink(
            sink: &mut Sink,
            current: &mut String,
            follow: &mut String,
            depth: &mut String,
            text: &str,
        ) {
            match sink {
                Sink::Xpath => current.push_str(text),
                Sink::Follow => follow.push_str(text),
                Sink::Depth => depth.push_str(text),
            }
        }
    }
}

fn strip_quotes(text: &str) -> String {
    let inner = &text[1..text.len() - 1];
    inner.replace("\\'", "'").replace("\\\"", "\"")
}

/// Fuse an `///<xpath>` prefix with a following `url(<xpath>)` step into a
/// single infinite-crawl segment: `///main//a/url(@href)` becomes
/// `///url(//main//a/@href)`.
fn collapse_inf_prefix(segments: Vec<Segment>) -> Result<Vec<Segment>, Error> {
    let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
    let mut iter = segments.into_iter().peekable();

    while let Some(segment) = iter.next() {
        let is_inf_prefix = matches!(&segment, Segment::Xpath(x) if x.starts_with("///"));
        if is_inf_prefix {
            if let Some(Segment::UrlQuery {
                arg: UrlArg::Xpath(_),
                ..
            }) = iter.peek()
            {
                let prefix = match &segment {
                    Segment::Xpath(x) => format!("//{}", &x[3..]),
                    _ => unreachable!(),
                };
                let (arg, slashes) = match iter.next() {
                    Some(Segment::UrlQuery {
                        arg: UrlArg::Xpath(arg),
                        slashes,
                    }) => (arg, slashes),
                    _ => unreachable!(),
                };
                let sep = "/".repeat(slashes.max(1) as usize);
                out.push(Segment::UrlInf {
                    xpath: format!("{prefix}{sep}{arg}"),
                    budget: None,
                });
                continue;
            }
            return Err(Error::Syntax(format!(
                "`///` prefix must be followed by a url(<xpath>) step: {segment}"
            )));
        }
        out.push(segment);
    }

    Ok(out)
}

fn validate(segments: &[Segment], top_level: bool) -> Result<(), Error> {
    if top_level {
        if let Some(first) = segments.first() {
            if matches!(first, Segment::UrlQuery { .. } | Segment::UrlInf { .. }) {
                return Err(Error::Syntax(format!(
                    "a program cannot start with url(<xpath>): \
                     there is no document to query yet ({first})"
                )));
            }
        }
    }

    for pair in segments.windows(2) {
        let relative_arg = match &pair[1] {
            Segment::UrlQuery {
                arg: UrlArg::Xpath(x),
                ..
            } => Some(x),
            Segment::UrlInf { xpath, .. } => Some(xpath),
            _ => None,
        };
        if let (Segment::Xpath(_), Some(arg)) = (&pair[0], relative_arg) {
            if arg.starts_with('/') {
                return Err(Error::Syntax(format!(
                    "the <xpath> in url(<xpath>) may not begin with / or // \
                     when it follows an XPath segment: url({arg})"
                )));
            }
        }
    }

    Ok(())
}

fn validate_single_inf(segments: &[Segment]) -> Result<(), Error> {
    fn count(segments: &[Segment]) -> usize {
        segments
            .iter()
            .map(|s| match s {
                Segment::UrlInf { .. } => 1,
                Segment::Binary { right, .. } => count(right),
                _ => 0,
            })
            .sum()
    }

    if count(segments) > 1 {
        return Err(Error::Syntax(
            "only one ///url() segment is allowed per program".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splices_nested_url_calls() {
        let program = parse("url( url('http://a/')//a/@href )").unwrap();
        assert_eq!(
            program,
            vec![
                Segment::UrlLit("http://a/".into()),
                Segment::Xpath("//a/@href".into()),
                Segment::UrlQuery {
                    arg: UrlArg::ContextItem,
                    slashes: 0
                },
            ]
        );
    }

    #[test]
    fn inf_prefix_collapses_like_plain_inf() {
        let a = parse("url('http://e/')///main//a/url(@href)").unwrap();
        let b = parse("url('http://e/')///url(//main//a/@href)").unwrap();
        assert_eq!(a, b);
    }
}
