use std::time::Duration;

use tokio::time::timeout;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use wxpath::http::{HttpClient, Request, RetryPolicy, Throttle};
use wxpath::ClientConfig;

fn config() -> ClientConfig {
    ClientConfig {
        concurrency: 4,
        per_host: 4,
        ..ClientConfig::default()
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        backoff_base: 0.05,
        backoff_cap: 0.2,
        jitter: false,
        ..RetryPolicy::default()
    }
}

#[tokio::test]
async fn retry_then_success_yields_one_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<p>ok</p>"))
        .mount(&server)
        .await;

    let mut client = HttpClient::start(config(), fast_retry(), Some(Throttle::Off)).unwrap();
    let mut results = client.take_results();

    client.submit(Request::new(format!("{}/", server.uri()))).unwrap();

    let response = timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.request.retries, 1);
    assert!(response.is_success());

    // The failed attempt produced no extra response.
    assert!(timeout(Duration::from_millis(300), results.recv())
        .await
        .is_err());

    let stats = client.stats().snapshot();
    assert_eq!(stats.retries_scheduled, 1);
    assert_eq!(stats.retries_executed, 1);
    assert_eq!(stats.requests_completed, 2);
    assert_eq!(stats.status_counts.get(&500), Some(&1));
    assert_eq!(stats.status_counts.get(&200), Some(&1));
}

#[tokio::test]
async fn retry_exhaustion_surfaces_the_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut client = HttpClient::start(config(), fast_retry(), Some(Throttle::Off)).unwrap();
    let mut results = client.take_results();

    client
        .submit(Request::new(format!("{}/", server.uri())).with_max_retries(1))
        .unwrap();

    let response = timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(response.request.retries, 1);
    assert!(!response.is_success());
}

#[tokio::test]
async fn a_retrying_request_does_not_block_others() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fast"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<p>ok</p>"))
        .mount(&server)
        .await;

    let retry = RetryPolicy {
        backoff_base: 0.5,
        jitter: false,
        ..RetryPolicy::default()
    };
    let mut client = HttpClient::start(config(), retry, Some(Throttle::Off)).unwrap();
    let mut results = client.take_results();

    client
        .submit(Request::new(format!("{}/slow", server.uri())).with_max_retries(1))
        .unwrap();
    client.submit(Request::new(format!("{}/fast", server.uri()))).unwrap();

    let first = timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first.request.url.ends_with("/fast"));

    let second = timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(second.request.url.ends_with("/slow"));
    assert_eq!(second.status, 500);
}

#[tokio::test]
async fn binary_file_urls_are_never_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/report.pdf"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let mut client = HttpClient::start(config(), fast_retry(), Some(Throttle::Off)).unwrap();
    let mut results = client.take_results();

    client
        .submit(Request::new(format!("{}/report.pdf", server.uri())))
        .unwrap();

    let response = timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(response.request.retries, 0);
}

#[tokio::test]
async fn transport_failures_become_error_responses() {
    // Nothing is listening on this port.
    let mut client = HttpClient::start(config(), RetryPolicy {
        max_retries: 0,
        ..fast_retry()
    }, Some(Throttle::Off))
    .unwrap();
    let mut results = client.take_results();

    client
        .submit(Request::new("http://127.0.0.1:9/unreachable"))
        .unwrap();

    let response = timeout(Duration::from_secs(10), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(response.error.is_some());
    assert_eq!(response.status, 0);
}

#[tokio::test]
async fn submissions_fail_after_close() {
    let server = MockServer::start().await;
    let mut client = HttpClient::start(config(), fast_retry(), Some(Throttle::Off)).unwrap();
    client.close();
    assert!(client.submit(Request::new(format!("{}/", server.uri()))).is_err());
}
