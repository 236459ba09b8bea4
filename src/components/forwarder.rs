//! Proxy boundary
//!
//! Builds the outbound request for the selected backend (path prefix
//! rewrite, verbatim headers, Host swapped to the backend authority) and
//! dispatches it through a pooled HTTP client with a whole-request timeout.

use crate::config::RoutingRule;
use crate::error::ForkliftError;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Body type flowing through the proxy: either the original streaming body
/// or a buffered replay, boxed to a single type.
pub type ProxyBody = BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Whole-request timeout for the backend call.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Forwarder {
    client: Client<HttpConnector, ProxyBody>,
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Build the outbound request: method and headers copied verbatim, the
    /// path possibly prefix-rewritten, the query preserved, and the Host
    /// header replaced with the backend authority.
    pub fn build_request(
        &self,
        parts: &http::request::Parts,
        body: ProxyBody,
        backend: &str,
        rule: Option<&RoutingRule>,
    ) -> Result<Request<ProxyBody>, ForkliftError> {
        let path = rewrite_path(parts.uri.path(), rule);
        let uri_str = match parts.uri.query() {
            Some(query) => format!("{}{}?{}", backend, path, query),
            None => format!("{}{}", backend, path),
        };
        let uri: Uri = uri_str
            .parse()
            .map_err(|e| ForkliftError::RequestConstruction(format!("{}: {}", uri_str, e)))?;
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| {
                ForkliftError::RequestConstruction(format!("no authority in {}", uri_str))
            })?;
        let host = HeaderValue::from_str(authority.as_str()).map_err(|e| {
            ForkliftError::RequestConstruction(format!("invalid authority {}: {}", authority, e))
        })?;

        let mut request = Request::builder()
            .method(parts.method.clone())
            .uri(uri)
            .body(body)
            .map_err(|e| ForkliftError::RequestConstruction(e.to_string()))?;

        *request.headers_mut() = parts.headers.clone();
        request.headers_mut().insert(HOST, host);

        debug!("proxy request: {} {}", request.method(), request.uri());
        Ok(request)
    }

    /// Dispatch the outbound request. Connection failures, DNS errors and
    /// the 10 second timeout all surface as upstream errors (502).
    pub async fn dispatch(
        &self,
        request: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, ForkliftError> {
        let url = request.uri().to_string();
        match timeout(UPSTREAM_TIMEOUT, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ForkliftError::Upstream {
                url,
                reason: e.to_string(),
            }),
            Err(_) => Err(ForkliftError::UpstreamTimeout {
                url,
                timeout_ms: UPSTREAM_TIMEOUT.as_millis() as u64,
            }),
        }
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply the selected rule's path prefix rewrite: the first occurrence of
/// the prefix is replaced when the path starts with it, otherwise the path
/// passes through untouched.
pub fn rewrite_path(path: &str, rule: Option<&RoutingRule>) -> String {
    if let Some(rule) = rule {
        if !rule.path_prefix_rewrite.is_empty()
            && !rule.path_prefix.is_empty()
            && path.starts_with(&rule.path_prefix)
        {
            return path.replacen(&rule.path_prefix, &rule.path_prefix_rewrite, 1);
        }
    }
    path.to_string()
}
