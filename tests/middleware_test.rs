//! End-to-end tests for the routing middleware
//!
//! Spin up mock backends and a live proxy instance on ephemeral ports and
//! drive them with a real HTTP client: rule matching, weighted splits,
//! session stickiness, body replay, and the error surfaces.

use bytes::Bytes;
use forklift::{Config, Forklift, RoutingRule, RuleCondition};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

type TestClient = Client<HttpConnector, Full<Bytes>>;

fn test_client() -> TestClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// A mock backend that answers `<label>:<path>` and, when the request
/// carried a body, `<label>:<path>:<body>` — which lets assertions verify
/// both routing and body replay.
async fn spawn_backend(label: &'static str) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |request: Request<Incoming>| async move {
                    let path = request.uri().path().to_string();
                    let body = request.into_body().collect().await.unwrap().to_bytes();
                    let text = if body.is_empty() {
                        format!("{}:{}", label, path)
                    } else {
                        format!("{}:{}:{}", label, path, String::from_utf8_lossy(&body))
                    };
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(text))))
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    (url, handle)
}

async fn spawn_proxy(config: Config) -> (String, JoinHandle<()>) {
    let forklift = Arc::new(Forklift::new(config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let _ = forklift.serve(listener).await;
    });
    (url, handle)
}

struct TestResponse {
    status: StatusCode,
    set_cookie: Option<String>,
    selected_backend: Option<String>,
    body: String,
}

async fn send(client: &TestClient, request: Request<Full<Bytes>>) -> TestResponse {
    let response = client.request(request).await.unwrap();
    let status = response.status();
    let set_cookie = response
        .headers()
        .get(SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let selected_backend = response
        .headers()
        .get("x-selected-backend")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    TestResponse {
        status,
        set_cookie,
        selected_backend,
        body: String::from_utf8_lossy(&body).to_string(),
    }
}

async fn get(client: &TestClient, url: &str) -> TestResponse {
    let request = Request::builder()
        .method(Method::GET)
        .uri(url)
        .body(Full::default())
        .unwrap();
    send(client, request).await
}

async fn get_with_cookie(client: &TestClient, url: &str, cookie: &str) -> TestResponse {
    let request = Request::builder()
        .method(Method::GET)
        .uri(url)
        .header(COOKIE, cookie)
        .body(Full::default())
        .unwrap();
    send(client, request).await
}

async fn post_form(client: &TestClient, url: &str, form: &str) -> TestResponse {
    let request = Request::builder()
        .method(Method::POST)
        .uri(url)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Full::new(Bytes::from(form.to_string())))
        .unwrap();
    send(client, request).await
}

/// The session cookie pair (`forklift_id=...`) out of a Set-Cookie value.
fn cookie_pair(set_cookie: &str) -> String {
    set_cookie.split(';').next().unwrap().to_string()
}

fn form_condition(parameter: &str, operator: &str, value: &str) -> RuleCondition {
    RuleCondition {
        condition_type: "form".to_string(),
        parameter: parameter.to_string(),
        operator: operator.to_string(),
        value: value.to_string(),
        ..Default::default()
    }
}

/// The reference rule set: an exact-path override, a 50/50 root split, a
/// second exact-path rule, form-conditioned rules, and a query rule.
fn scenario_config(default: &str, echo1: &str, echo2: &str, echo3: &str) -> Config {
    let mut query_condition = RuleCondition {
        condition_type: "query".to_string(),
        operator: "eq".to_string(),
        value: "two".to_string(),
        ..Default::default()
    };
    query_condition.query_param = "mid".to_string();

    Config {
        default_backend: default.to_string(),
        debug: false,
        rules: vec![
            RoutingRule {
                path: "/v2".to_string(),
                method: "GET".to_string(),
                backend: echo2.to_string(),
                priority: 2,
                ..Default::default()
            },
            RoutingRule {
                path: "/".to_string(),
                method: "GET".to_string(),
                backend: echo1.to_string(),
                priority: 1,
                percentage: 50.0,
                affinity_token: "group1".to_string(),
                ..Default::default()
            },
            RoutingRule {
                path: "/".to_string(),
                method: "GET".to_string(),
                backend: echo2.to_string(),
                priority: 1,
                percentage: 50.0,
                affinity_token: "group2".to_string(),
                ..Default::default()
            },
            RoutingRule {
                path: "/v3".to_string(),
                method: "GET".to_string(),
                backend: echo3.to_string(),
                priority: 2,
                ..Default::default()
            },
            RoutingRule {
                path: "/".to_string(),
                method: "POST".to_string(),
                backend: echo2.to_string(),
                priority: 2,
                conditions: vec![form_condition("MID", "eq", "a")],
                ..Default::default()
            },
            RoutingRule {
                path: "/query-test".to_string(),
                method: "GET".to_string(),
                backend: echo2.to_string(),
                conditions: vec![query_condition],
                ..Default::default()
            },
            RoutingRule {
                path: "/".to_string(),
                method: "POST".to_string(),
                backend: echo3.to_string(),
                priority: 2,
                percentage: 10.0,
                conditions: vec![form_condition("MID", "eq", "d")],
                ..Default::default()
            },
        ],
    }
}

#[tokio::test]
async fn test_exact_path_rules_override_split() {
    let (default_url, _h0) = spawn_backend("default").await;
    let (echo1_url, _h1) = spawn_backend("echo1").await;
    let (echo2_url, _h2) = spawn_backend("echo2").await;
    let (echo3_url, _h3) = spawn_backend("echo3").await;
    let (proxy, _hp) =
        spawn_proxy(scenario_config(&default_url, &echo1_url, &echo2_url, &echo3_url)).await;
    let client = test_client();

    let response = get(&client, &format!("{}/v2", proxy)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, "echo2:/v2");

    let response = get(&client, &format!("{}/v3", proxy)).await;
    assert_eq!(response.body, "echo3:/v3");
}

#[tokio::test]
async fn test_unmatched_path_falls_through_to_default() {
    let (default_url, _h0) = spawn_backend("default").await;
    let (echo1_url, _h1) = spawn_backend("echo1").await;
    let (echo2_url, _h2) = spawn_backend("echo2").await;
    let (echo3_url, _h3) = spawn_backend("echo3").await;
    let (proxy, _hp) =
        spawn_proxy(scenario_config(&default_url, &echo1_url, &echo2_url, &echo3_url)).await;
    let client = test_client();

    let response = get(&client, &format!("{}/unknown", proxy)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, "default:/unknown");
}

#[tokio::test]
async fn test_query_condition_routing() {
    let (default_url, _h0) = spawn_backend("default").await;
    let (echo1_url, _h1) = spawn_backend("echo1").await;
    let (echo2_url, _h2) = spawn_backend("echo2").await;
    let (echo3_url, _h3) = spawn_backend("echo3").await;
    let (proxy, _hp) =
        spawn_proxy(scenario_config(&default_url, &echo1_url, &echo2_url, &echo3_url)).await;
    let client = test_client();

    let response = get(&client, &format!("{}/query-test?mid=two", proxy)).await;
    assert_eq!(response.body, "echo2:/query-test");

    let response = get(&client, &format!("{}/query-test?mid=three", proxy)).await;
    assert_eq!(response.body, "default:/query-test");
}

#[tokio::test]
async fn test_form_condition_routing_replays_body() {
    let (default_url, _h0) = spawn_backend("default").await;
    let (echo1_url, _h1) = spawn_backend("echo1").await;
    let (echo2_url, _h2) = spawn_backend("echo2").await;
    let (echo3_url, _h3) = spawn_backend("echo3").await;
    let (proxy, _hp) =
        spawn_proxy(scenario_config(&default_url, &echo1_url, &echo2_url, &echo3_url)).await;
    let client = test_client();

    // The matcher consumed the body; the backend must still receive it
    let response = post_form(&client, &format!("{}/", proxy), "MID=a").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, "echo2:/:MID=a");

    // No form rule matches; the POST falls through to the default backend
    let response = post_form(&client, &format!("{}/", proxy), "MID=z").await;
    assert_eq!(response.body, "default:/:MID=z");
}

#[tokio::test]
async fn test_weighted_split_across_fresh_sessions() {
    let (default_url, _h0) = spawn_backend("default").await;
    let (echo1_url, _h1) = spawn_backend("echo1").await;
    let (echo2_url, _h2) = spawn_backend("echo2").await;
    let (echo3_url, _h3) = spawn_backend("echo3").await;
    let (proxy, _hp) =
        spawn_proxy(scenario_config(&default_url, &echo1_url, &echo2_url, &echo3_url)).await;
    let client = test_client();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..400 {
        // No cookie: every request is a fresh session
        let response = get(&client, &format!("{}/", proxy)).await;
        let label = response.body.split(':').next().unwrap().to_string();
        *counts.entry(label).or_insert(0) += 1;
    }

    let echo1 = counts.get("echo1").copied().unwrap_or(0);
    let echo2 = counts.get("echo2").copied().unwrap_or(0);
    assert_eq!(echo1 + echo2, 400, "all root requests belong to the split");
    // p = 0.5 over 400 draws, sigma = 10; six sigma tolerance
    assert!((140..=260).contains(&echo1), "echo1 share: {}", echo1);
}

#[tokio::test]
async fn test_session_stickiness_across_requests() {
    let (default_url, _h0) = spawn_backend("default").await;
    let (echo1_url, _h1) = spawn_backend("echo1").await;
    let (echo2_url, _h2) = spawn_backend("echo2").await;
    let (echo3_url, _h3) = spawn_backend("echo3").await;
    let (proxy, _hp) =
        spawn_proxy(scenario_config(&default_url, &echo1_url, &echo2_url, &echo3_url)).await;
    let client = test_client();

    let first = get(&client, &format!("{}/", proxy)).await;
    let set_cookie = first.set_cookie.expect("first response mints a session");
    let cookie = cookie_pair(&set_cookie);

    for _ in 0..10 {
        let response = get_with_cookie(&client, &format!("{}/", proxy), &cookie).await;
        assert_eq!(response.body, first.body, "session must stay pinned");
        // A valid session cookie is never re-minted
        assert!(response.set_cookie.is_none());
    }
}

#[tokio::test]
async fn test_session_cookie_attributes() {
    let (default_url, _h0) = spawn_backend("default").await;
    let (proxy, _hp) = spawn_proxy(Config {
        default_backend: default_url.clone(),
        rules: vec![],
        debug: false,
    })
    .await;
    let client = test_client();

    let response = get(&client, &format!("{}/", proxy)).await;
    let set_cookie = response.set_cookie.expect("session cookie must be set");

    assert!(set_cookie.starts_with("forklift_id="));
    assert!(set_cookie.contains("Path=/"));
    assert!(set_cookie.contains("Max-Age=2592000"));
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Strict"));
    // Plain HTTP: no Secure attribute
    assert!(!set_cookie.contains("Secure"));
}

#[tokio::test]
async fn test_malformed_session_cookie_is_replaced() {
    let (default_url, _h0) = spawn_backend("default").await;
    let (proxy, _hp) = spawn_proxy(Config {
        default_backend: default_url.clone(),
        rules: vec![],
        debug: false,
    })
    .await;
    let client = test_client();

    let response =
        get_with_cookie(&client, &format!("{}/", proxy), "forklift_id=not!valid!b64").await;
    assert_eq!(response.status, StatusCode::OK);
    let set_cookie = response.set_cookie.expect("invalid cookie must be replaced");
    assert!(!set_cookie.contains("not!valid!b64"));
}

#[tokio::test]
async fn test_debug_header_names_selected_backend() {
    let (echo2_url, _h2) = spawn_backend("echo2").await;
    let (default_url, _h0) = spawn_backend("default").await;
    let (proxy, _hp) = spawn_proxy(Config {
        default_backend: default_url.clone(),
        debug: true,
        rules: vec![RoutingRule {
            path: "/v2".to_string(),
            method: "GET".to_string(),
            backend: echo2_url.clone(),
            priority: 2,
            ..Default::default()
        }],
    })
    .await;
    let client = test_client();

    let response = get(&client, &format!("{}/v2", proxy)).await;
    assert_eq!(response.selected_backend.as_deref(), Some(echo2_url.as_str()));

    let response = get(&client, &format!("{}/other", proxy)).await;
    assert_eq!(
        response.selected_backend.as_deref(),
        Some(default_url.as_str())
    );
}

#[tokio::test]
async fn test_path_prefix_rewrite_end_to_end() {
    let (default_url, _h0) = spawn_backend("default").await;
    let (api_url, _h1) = spawn_backend("api").await;
    let (proxy, _hp) = spawn_proxy(Config {
        default_backend: default_url.clone(),
        debug: false,
        rules: vec![RoutingRule {
            path_prefix: "/api".to_string(),
            path_prefix_rewrite: "/internal".to_string(),
            backend: api_url.clone(),
            priority: 1,
            ..Default::default()
        }],
    })
    .await;
    let client = test_client();

    let response = get(&client, &format!("{}/api/users", proxy)).await;
    assert_eq!(response.body, "api:/internal/users");

    // Outside the prefix: no rewrite, default backend
    let response = get(&client, &format!("{}/web/index", proxy)).await;
    assert_eq!(response.body, "default:/web/index");
}

#[tokio::test]
async fn test_unreachable_backend_yields_502() {
    // Reserve a port, then free it so the connection is refused
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_url = format!("http://{}", reserved.local_addr().unwrap());
    drop(reserved);

    let (proxy, _hp) = spawn_proxy(Config {
        default_backend: dead_url,
        rules: vec![],
        debug: false,
    })
    .await;
    let client = test_client();

    let response = get(&client, &format!("{}/", proxy)).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    // Stickiness begins with first contact, even on errors
    assert!(response.set_cookie.is_some());
}

#[tokio::test]
async fn test_query_string_is_forwarded() {
    let (default_url, _h0) = spawn_backend("default").await;

    // A backend that echoes the full path-and-query
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_url = format!("http://{}", listener.local_addr().unwrap());
    let _backend = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(|request: Request<Incoming>| async move {
                    let text = request.uri().to_string();
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(text))))
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    let (proxy, _hp) = spawn_proxy(Config {
        default_backend: default_url.clone(),
        debug: false,
        rules: vec![RoutingRule {
            path_prefix: "/search".to_string(),
            backend: echo_url,
            priority: 1,
            ..Default::default()
        }],
    })
    .await;
    let client = test_client();

    let response = get(&client, &format!("{}/search?q=hello+world&page=2", proxy)).await;
    assert_eq!(response.body, "/search?q=hello+world&page=2");
}
