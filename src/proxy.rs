//! Reverse Proxy (C6): forwards HTTP traffic addressed to a
//! `{workspace_id, port}` pair to the host actually running that
//! workspace's container.
//!
//! Mirrors `container_runtime::ContainerRuntimeClient` in spirit: a
//! single pooled `reqwest::Client` built once and shared via `Arc`,
//! rather than one client per request.

use std::time::Duration;

use http::{HeaderMap, HeaderValue, Method, StatusCode};

use crate::error::CoreError;
use crate::registry::Registry;
use crate::store::WorkspaceStore;
use crate::types::WorkspaceStatus;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Request/response headers that must never be forwarded verbatim
/// across a proxy hop, per RFC 7230 §6.1 plus `host` (the upstream
/// needs its own).
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const RESPONSE_STRIP: &[&str] = &["content-encoding", "transfer-encoding", "connection"];

pub struct ProxiedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Clone)]
pub struct ProxyClient {
    http: reqwest::Client,
}

impl ProxyClient {
    pub fn new() -> Self {
        ProxyClient {
            http: reqwest::Client::builder()
                .pool_max_idle_per_host(20)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client builds with default TLS backend"),
        }
    }

    /// Forwards one request to the workspace's assigned host. Fails fast
    /// with `InvalidState` if the workspace isn't RUNNING, per §4.6 step
    /// 1, before any network call is attempted.
    pub async fn forward(
        &self,
        store: &WorkspaceStore,
        registry: &Registry,
        workspace_id: &str,
        port: u16,
        method: Method,
        path_and_query: &str,
        request_headers: &HeaderMap,
        body: Vec<u8>,
    ) -> Result<ProxiedResponse, CoreError> {
        let record = store
            .get(&workspace_id.to_string())
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .ok_or_else(|| CoreError::NotFound {
                kind: "workspace",
                id: workspace_id.to_string(),
            })?;

        if record.status != WorkspaceStatus::Running {
            return Err(CoreError::InvalidState {
                reason: format!("workspace '{workspace_id}' is not RUNNING"),
            });
        }

        let host_address = record.assigned.host_address.clone().ok_or_else(|| {
            CoreError::Internal(format!("running workspace '{workspace_id}' has no assigned host"))
        })?;

        // Cross-check against the live Registry entry so a host that was
        // drained/removed out from under a still-RUNNING record doesn't
        // silently proxy to a dead address.
        if let Some(server_id) = &record.assigned.server_id {
            if registry.get(server_id).is_none() {
                return Err(CoreError::UpstreamUnreachable {
                    detail: format!("server '{server_id}' is no longer registered"),
                });
            }
        }

        let url = format!("http://{host_address}:{port}{path_and_query}");

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in request_headers.iter() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }

        let resp = self
            .http
            .request(method, &url)
            .headers(headers)
            .body(body)
            .timeout(READ_TIMEOUT)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    CoreError::UpstreamTimeout
                } else {
                    CoreError::UpstreamUnreachable {
                        detail: err.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        let mut response_headers = HeaderMap::new();
        for (name, value) in resp.headers().iter() {
            if RESPONSE_STRIP.contains(&name.as_str()) {
                continue;
            }
            response_headers.insert(name.clone(), value.clone());
        }

        let raw = resp
            .bytes()
            .await
            .map_err(|err| CoreError::UpstreamUnreachable {
                detail: err.to_string(),
            })?
            .to_vec();

        let is_html = response_headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/html"))
            .unwrap_or(false);

        let body = if is_html {
            let rewritten = inject_tracer_script(&raw);
            if rewritten.len() != raw.len() {
                response_headers.insert(
                    http::header::CONTENT_LENGTH,
                    HeaderValue::from_str(&rewritten.len().to_string())
                        .expect("decimal length is always a valid header value"),
                );
            }
            rewritten
        } else {
            raw
        };

        Ok(ProxiedResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}

const TRACER_SCRIPT: &str =
    "<script>window.__workspace_bridge && window.__workspace_bridge.init();</script>";

/// Injects the bridge's tracer script right before `</body>`, or appends
/// it if the document has no closing body tag. A pure function of the
/// response bytes — the rewrite itself is an implementation detail,
/// only its call site (content-length must be kept honest) is
/// load-bearing.
fn inject_tracer_script(body: &[u8]) -> Vec<u8> {
    const NEEDLE: &[u8] = b"</body>";
    if let Some(pos) = find_subslice(body, NEEDLE) {
        let mut out = Vec::with_capacity(body.len() + TRACER_SCRIPT.len());
        out.extend_from_slice(&body[..pos]);
        out.extend_from_slice(TRACER_SCRIPT.as_bytes());
        out.extend_from_slice(&body[pos..]);
        out
    } else {
        let mut out = body.to_vec();
        out.extend_from_slice(TRACER_SCRIPT.as_bytes());
        out
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_before_closing_body_tag() {
        let html = b"<html><body><h1>hi</h1></body></html>".to_vec();
        let rewritten = inject_tracer_script(&html);
        let as_str = String::from_utf8(rewritten).unwrap();
        assert!(as_str.contains(TRACER_SCRIPT));
        assert!(as_str.find(TRACER_SCRIPT).unwrap() < as_str.find("</body>").unwrap());
    }

    #[test]
    fn appends_when_no_closing_body_tag() {
        let html = b"<html>no body tag here".to_vec();
        let rewritten = inject_tracer_script(&html);
        assert!(rewritten.len() > html.len());
        assert!(String::from_utf8(rewritten).unwrap().ends_with(TRACER_SCRIPT));
    }

    #[test]
    fn grows_body_length() {
        let html = b"<body></body>".to_vec();
        let original_len = html.len();
        let rewritten = inject_tracer_script(&html);
        assert!(rewritten.len() > original_len);
    }
}
