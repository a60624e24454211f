use wxpath::parser::{parse, render, Segment, UrlArg};

#[test]
fn single_url_literal() {
    assert_eq!(
        parse("url('http://example.com')").unwrap(),
        vec![Segment::UrlLit("http://example.com".into())]
    );
}

#[test]
fn mixed_segments() {
    let program = parse(
        "url('https://en.wikipedia.org/wiki/Expression_language')\
         //url(@href[starts-with(., '/wiki/')])\
         //url(@href)",
    )
    .unwrap();
    assert_eq!(
        program,
        vec![
            Segment::UrlLit("https://en.wikipedia.org/wiki/Expression_language".into()),
            Segment::UrlQuery {
                arg: UrlArg::Xpath("@href[starts-with(., '/wiki/')]".into()),
                slashes: 2,
            },
            Segment::UrlQuery {
                arg: UrlArg::Xpath("@href".into()),
                slashes: 2,
            },
        ]
    );
}

#[test]
fn xpath_steps_interleave_with_fetches() {
    let program = parse("url('https://a/')//main//a/url(@href)").unwrap();
    assert_eq!(
        program,
        vec![
            Segment::UrlLit("https://a/".into()),
            Segment::Xpath("//main//a".into()),
            Segment::UrlQuery {
                arg: UrlArg::Xpath("@href".into()),
                slashes: 1,
            },
        ]
    );
}

#[test]
fn inf_crawl_forms_are_equivalent() {
    let a = parse("url('https://e/w')///main//a/url(@href)").unwrap();
    let b = parse("url('https://e/w')///url(//main//a/@href)").unwrap();
    assert_eq!(a, b);
}

#[test]
fn follow_and_depth_arguments() {
    let program = parse("url('https://a/', follow=//a[@class='next']/@href, depth=2)").unwrap();
    assert_eq!(
        program,
        vec![Segment::UrlCrawl {
            url: "https://a/".into(),
            follow: "//a[@class='next']/@href".into(),
            max_depth: Some(2),
        }]
    );
}

#[test]
fn map_constructor_is_captured_verbatim() {
    let program = parse("url('http://example.com')/map{ 'title':string(//h1/text()) }").unwrap();
    assert_eq!(
        program,
        vec![
            Segment::UrlLit("http://example.com".into()),
            Segment::Xpath("/map{ 'title':string(//h1/text()) }".into()),
        ]
    );
}

#[test]
fn pure_xpath_has_no_url_segments() {
    assert_eq!(
        parse("//h1/text()").unwrap(),
        vec![Segment::Xpath("//h1/text()".into())]
    );
}

#[test]
fn boundary_split_produces_binary() {
    let program = parse("(1 to 3) ! ('http://test/' || .) ! url(.)").unwrap();
    match &program[..] {
        [Segment::Binary { left, op, right }] => {
            assert_eq!(left, "(1 to 3) ! ('http://test/' || .)");
            assert_eq!(op, "!");
            assert_eq!(
                right,
                &vec![Segment::UrlQuery {
                    arg: UrlArg::ContextItem,
                    slashes: 0,
                }]
            );
        }
        other => panic!("expected a binary segment, got {other:?}"),
    }
}

#[test]
fn rejects_multiple_infinite_crawls() {
    let err = parse("url('http://example.com/')///url(@href)///url(@href)").unwrap_err();
    assert!(err.to_string().contains("only one ///url()"));
}

#[test]
fn rejects_literal_url_with_navigation_slashes() {
    let err = parse("url('http://example.com/')//url('http://example2.com/')").unwrap_err();
    assert!(err.to_string().contains("navigation slashes"));
}

#[test]
fn rejects_leading_url_query() {
    let err = parse("//url(@href)").unwrap_err();
    assert!(err.to_string().contains("cannot start with url(<xpath>)"));
}

#[test]
fn rejects_absolute_sub_url_after_xpath() {
    let err = parse("url('https://a/')//main//a/url(//@href)").unwrap_err();
    assert!(err.to_string().contains("may not begin with / or //"));
}

#[test]
fn rejects_unbalanced_parens() {
    let err = parse("url('https://a/'").unwrap_err();
    assert!(err.to_string().contains("parentheses"));
}

#[test]
fn parse_is_idempotent_through_the_printer() {
    let sources = [
        "url('http://example.com')",
        "url('http://a/')//h1/text()",
        "url('https://a/')//url(@href)",
        "url('https://a/')//main//a/url(@href)",
        "url('https://a/')///url(@href)",
        "url('https://a/', follow=//a[@class='next']/@href)",
        "url('https://a/', follow=//a[@class='next']/@href, depth=3)",
        "url('http://example.com')/map{ 'title':string(//h1/text()) }",
        "(1 to 3) ! ('http://test/' || .) ! url(.)",
    ];

    for src in sources {
        let once = parse(src).unwrap();
        let twice = parse(&render(&once)).unwrap();
        assert_eq!(once, twice, "round-trip changed the program for {src}");
    }
}
