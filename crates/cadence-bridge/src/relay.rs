//! Async HTTP request relay.
//!
//! Requests are prepared synchronously on the calling (script) thread so
//! that a malformed request is rejected before any background work starts.
//! Prepared requests run as tokio tasks on the bridge's runtime; completion
//! is reported through exactly one of the success/error continuations.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;

use crate::callbacks::{CallbackOutcome, HttpReply, PendingCall};
use crate::config::BridgeConfig;
use crate::error::BridgeError;

/// Maximum HTTP response body size (10 MB).
const MAX_HTTP_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Maximum number of redirects followed by the transport.
const MAX_REDIRECTS: usize = 10;

/// Optional request settings sent by a resolver. Absent fields use
/// transport defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
}

impl RequestOptions {
    pub fn parse(json: &str) -> Result<Self, BridgeError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A fully validated request, ready to dispatch.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: reqwest::Method,
    pub url: url::Url,
    pub headers: HeaderMap,
    pub basic_auth: Option<(String, Option<String>)>,
    pub body: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Build a request from the raw strings a resolver passed across the
/// bridge. Fails without side effects on any malformed input.
pub fn prepare(
    url: &str,
    extra_headers: Option<&str>,
    options: Option<&str>,
) -> Result<HttpRequest, BridgeError> {
    let headers: HashMap<String, String> = match non_empty(extra_headers) {
        Some(json) => serde_json::from_str(json)?,
        None => HashMap::new(),
    };
    let options = match non_empty(options) {
        Some(json) => RequestOptions::parse(json)?,
        None => RequestOptions::default(),
    };

    let url = url::Url::parse(url)
        .map_err(|e| BridgeError::InvalidRequest(format!("invalid URL '{url}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(BridgeError::InvalidRequest(format!(
            "unsupported URL scheme '{}'",
            url.scheme()
        )));
    }

    let method = match non_empty(options.method.as_deref()) {
        Some(m) => reqwest::Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| BridgeError::InvalidRequest(format!("invalid HTTP method '{m}'")))?,
        None => reqwest::Method::GET,
    };

    let mut header_map = HeaderMap::with_capacity(headers.len());
    for (name, value) in &headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| BridgeError::InvalidRequest(format!("invalid header name '{name}'")))?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            BridgeError::InvalidRequest(format!("invalid value for header '{name}'"))
        })?;
        header_map.insert(name, value);
    }

    let basic_auth = options
        .username
        .map(|user| (user, options.password));

    Ok(HttpRequest {
        method,
        url,
        headers: header_map,
        basic_auth,
        body: options.data,
    })
}

// ─── Relay ──────────────────────────────────────────────────────────────

/// Runs prepared requests in the background and reports back through the
/// callback registry.
#[derive(Clone)]
pub struct RequestRelay {
    resolver: String,
    client: reqwest::Client,
    runtime: tokio::runtime::Handle,
}

impl std::fmt::Debug for RequestRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRelay")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl RequestRelay {
    pub fn new(
        resolver: impl Into<String>,
        config: &BridgeConfig,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| BridgeError::Http(e.to_string()))?;
        Ok(Self {
            resolver: resolver.into(),
            client,
            runtime,
        })
    }

    /// Run `request` on a background task. Exactly one of the continuations
    /// matching the outcome is invoked, if present.
    pub fn dispatch(
        &self,
        request: HttpRequest,
        on_success: Option<PendingCall>,
        on_error: Option<PendingCall>,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let resolver = self.resolver.clone();
        self.runtime.spawn(async move {
            let method = request.method.clone();
            let url = request.url.clone();
            let (outcome, reply) = match execute(&client, request).await {
                Ok(reply) if reply.status < 400 => (CallbackOutcome::Success, reply),
                Ok(reply) => (CallbackOutcome::Error, reply),
                Err(e) => {
                    tracing::warn!(
                        resolver = %resolver,
                        method = %method,
                        url = %url,
                        "relayed request failed: {e}"
                    );
                    (
                        CallbackOutcome::Error,
                        HttpReply {
                            status_text: e.to_string(),
                            ..HttpReply::default()
                        },
                    )
                }
            };

            tracing::debug!(
                resolver = %resolver,
                method = %method,
                url = %url,
                status = reply.status,
                "relayed request completed"
            );

            let (target, _other) = match outcome {
                CallbackOutcome::Success => (on_success, on_error),
                CallbackOutcome::Error => (on_error, on_success),
            };
            match target {
                Some(call) => {
                    call.invoke(outcome, reply);
                }
                None => tracing::debug!(
                    resolver = %resolver,
                    url = %url,
                    ?outcome,
                    "no continuation registered for request outcome"
                ),
            }
        })
    }
}

async fn execute(client: &reqwest::Client, request: HttpRequest) -> Result<HttpReply, BridgeError> {
    let mut builder = client
        .request(request.method, request.url)
        .headers(request.headers);
    if let Some((user, password)) = request.basic_auth {
        builder = builder.basic_auth(user, password);
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let resp = builder
        .send()
        .await
        .map_err(|e| BridgeError::Http(e.to_string()))?;
    read_response(resp).await
}

/// Read an HTTP response, refusing bodies over [`MAX_HTTP_RESPONSE_BYTES`]
/// before they are buffered.
async fn read_response(mut resp: reqwest::Response) -> Result<HttpReply, BridgeError> {
    let status = resp.status();
    let mut response_headers: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in resp.headers() {
        response_headers
            .entry(name.to_string())
            .or_default()
            .push(value.to_str().unwrap_or("").to_string());
    }

    let too_large = |len: u64| {
        BridgeError::Http(format!(
            "response body too large: {len} bytes (max: {MAX_HTTP_RESPONSE_BYTES} bytes)"
        ))
    };
    if let Some(len) = resp.content_length() {
        if len > MAX_HTTP_RESPONSE_BYTES as u64 {
            return Err(too_large(len));
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| BridgeError::Http(e.to_string()))?
    {
        if body.len() + chunk.len() > MAX_HTTP_RESPONSE_BYTES {
            return Err(too_large((body.len() + chunk.len()) as u64));
        }
        body.extend_from_slice(&chunk);
    }

    Ok(HttpReply {
        response_text: String::from_utf8_lossy(&body).into_owned(),
        response_headers,
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
    })
}
