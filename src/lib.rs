//! Forklift
//!
//! A session-sticky A/B testing and canary routing reverse proxy. Incoming
//! requests are scored against a declarative rule list (path, method,
//! header, query, cookie and form conditions); priority-ordered rules and
//! weighted percentage splits then pick a backend, and a per-client session
//! cookie keeps every client pinned to its backend across requests without
//! any server-side state.

pub mod components;
pub mod config;
pub mod error;

pub use config::{AppConfig, Config, RoutingRule, RuleCondition};
pub use error::ForkliftError;

use bytes::Bytes;
use components::forwarder::{Forwarder, ProxyBody};
use components::matcher::RequestView;
use components::router::Router;
use components::session;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, SET_COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Response header naming the chosen backend when debug is enabled.
pub const SELECTED_BACKEND_HEADER: &str = "x-selected-backend";

/// How often the decision cache is wiped.
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// The middleware handle: an immutable configuration plus the routing
/// pipeline, shared read-only by all request tasks.
pub struct Forklift {
    config: Arc<Config>,
    router: Router,
    forwarder: Forwarder,
}

impl Forklift {
    /// Validate the configuration and build the middleware. Rules are
    /// sorted by priority (stable, descending) once, here.
    pub fn new(mut config: Config) -> Result<Self, ForkliftError> {
        config.validate()?;
        config.rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let config = Arc::new(config);
        info!(
            "forklift middleware configured: {} rule(s), default backend {}",
            config.rules.len(),
            config.default_backend
        );

        Ok(Self {
            router: Router::new(Arc::clone(&config)),
            forwarder: Forwarder::new(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle one request: resolve the session, route, forward, and stream
    /// the backend's response back. Errors surface as 500/502 responses.
    ///
    /// `via_tls` reflects how the request reached us and only controls the
    /// `Secure` attribute of a freshly minted session cookie.
    pub async fn handle_request(
        &self,
        request: Request<Incoming>,
        via_tls: bool,
    ) -> Response<ProxyBody> {
        let (parts, body) = request.into_parts();

        if self.config.debug {
            debug!("received request: {} {}", parts.method, parts.uri);
        }

        let (session_id, set_cookie) =
            match session::get_or_create_session_id(&parts.headers, via_tls) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("error handling session id: {}", e);
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal Server Error",
                    );
                }
            };

        // Form conditions consume the body; buffer it so the matcher can
        // read it and the forwarder can replay the same bytes.
        let (outbound_body, form_body): (ProxyBody, Option<Bytes>) =
            if self.wants_form_buffer(&parts) {
                match body.collect().await {
                    Ok(collected) => {
                        let bytes = collected.to_bytes();
                        let replay: ProxyBody = Full::new(bytes.clone())
                            .map_err(|never| match never {})
                            .boxed();
                        (replay, Some(bytes))
                    }
                    Err(e) => {
                        let e = ForkliftError::Body(e.to_string());
                        error!("error buffering request body: {}", e);
                        let mut response =
                            error_response(e.to_status_code(), "Internal Server Error");
                        attach_cookie(&mut response, set_cookie);
                        return response;
                    }
                }
            } else {
                let streamed: ProxyBody = body
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
                    .boxed();
                (streamed, None)
            };

        let view = RequestView::from_parts(&parts, form_body.as_deref());
        let decision = self.router.decide(&view, &session_id);
        let backend = decision.backend.to_string();

        if self.config.debug {
            debug!("routing request to backend: {}", backend);
            if let Some(rule) = decision.rule {
                debug!(
                    "selected rule: path: {}, method: {}, backend: {}, percentage: {}",
                    rule.path, rule.method, rule.backend, rule.percentage
                );
            }
        }

        let proxy_request =
            match self
                .forwarder
                .build_request(&parts, outbound_body, decision.backend, decision.rule)
            {
                Ok(request) => request,
                Err(e) => {
                    error!("error creating proxy request: {}", e);
                    let mut response =
                        error_response(e.to_status_code(), "Error creating proxy request");
                    self.finalize(&mut response, set_cookie, &backend);
                    return response;
                }
            };

        let mut response = match self.forwarder.dispatch(proxy_request).await {
            Ok(upstream) => {
                let (parts, body) = upstream.into_parts();
                let body: ProxyBody = body
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
                    .boxed();
                Response::from_parts(parts, body)
            }
            Err(e) => {
                error!("error sending request to backend: {}", e);
                error_response(e.to_status_code(), "Error sending request to backend")
            }
        };

        self.finalize(&mut response, set_cookie, &backend);
        response
    }

    /// Serve the middleware over plain HTTP/1.1 until ctrl-c. One task per
    /// connection; a background task wipes the decision cache periodically.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ForkliftError> {
        info!("forklift listening on {}", listener.local_addr()?);

        let sweeper = {
            let forklift = Arc::clone(&self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    forklift.router.clear_cache();
                    debug!("decision cache cleared");
                }
            })
        };

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let forklift = Arc::clone(&self);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |request| {
                                    let forklift = Arc::clone(&forklift);
                                    async move {
                                        Ok::<_, Infallible>(
                                            forklift.handle_request(request, false).await,
                                        )
                                    }
                                });
                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        sweeper.abort();
        Ok(())
    }

    /// Form bodies are only buffered when some rule actually reads them and
    /// the request plausibly carries one.
    fn wants_form_buffer(&self, parts: &http::request::Parts) -> bool {
        if !self.router.has_form_conditions() {
            return false;
        }
        let method = &parts.method;
        if method != Method::POST && method != Method::PUT && method != Method::PATCH {
            return false;
        }
        parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|ct| ct.starts_with(FORM_CONTENT_TYPE))
            .unwrap_or(false)
    }

    fn finalize(&self, response: &mut Response<ProxyBody>, set_cookie: Option<String>, backend: &str) {
        attach_cookie(response, set_cookie);
        if self.config.debug {
            if let Ok(value) = HeaderValue::from_str(backend) {
                response
                    .headers_mut()
                    .insert(SELECTED_BACKEND_HEADER, value);
            }
        }
    }
}

fn attach_cookie(response: &mut Response<ProxyBody>, set_cookie: Option<String>) {
    if let Some(cookie) = set_cookie {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
}

/// A plain-text error response.
fn error_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let body: ProxyBody = Full::new(Bytes::from_static(message.as_bytes()))
        .map_err(|never| match never {})
        .boxed();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(body)
        .unwrap_or_else(|_| {
            let mut response = Response::new(
                Full::new(Bytes::from_static(b"Internal Server Error"))
                    .map_err(|never| match never {})
                    .boxed(),
            );
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        })
}
