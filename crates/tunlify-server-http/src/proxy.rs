//! Public entry point
//!
//! The edge router resolves `{subdomain}.{region}.{base_domain}` and forwards
//! the call here with the tunnel identity in `X-Tunnel-Subdomain` and
//! `X-Tunnel-Region`.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tunlify_control::{ForwardedRequest, ForwardedResponse, RelayError, TunnelKey};
use tunlify_proto::{HeaderValues, Headers};

use crate::error::ServerError;
use crate::AppState;

pub const TUNNEL_SUBDOMAIN_HEADER: &str = "x-tunnel-subdomain";
pub const TUNNEL_REGION_HEADER: &str = "x-tunnel-region";
pub const TUNNEL_USER_HEADER: &str = "x-tunnel-user";
pub const POWERED_BY: &str = "Tunlify";

/// Route prefix stripped before forwarding
pub const PROXY_PREFIX: &str = "/tunnel-proxy";

/// Largest request body accepted for forwarding
pub const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;

/// Response headers that describe the client's connection, not the payload
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Forward a public request to its tunnel client
pub async fn tunnel_proxy(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, ServerError> {
    let (parts, body) = request.into_parts();

    let key = tunnel_key(&parts.headers).ok_or_else(|| {
        warn!("Rejecting proxy request without routing headers");
        ServerError::MissingRoutingHeaders
    })?;

    let Some(session) = state.registry.lookup(&key) else {
        return Err(no_session(&state, &key).await);
    };

    let url = forwarded_url(parts.uri.path(), parts.uri.query());
    let body = if parts.method == Method::GET || parts.method == Method::HEAD {
        Bytes::new()
    } else {
        to_bytes(body, MAX_REQUEST_BODY)
            .await
            .map_err(|_| ServerError::PayloadTooLarge)?
    };

    debug!(tunnel = %key, method = %parts.method, %url, "Proxying request");

    let forwarded = ForwardedRequest {
        method: parts.method.to_string(),
        url,
        headers: wire_headers(&parts.headers),
        body,
    };

    let reply = match state.multiplexer.forward(&key, forwarded).await {
        Ok(reply) => reply,
        Err(RelayError::NoSession(_)) => {
            // Session went away between lookup and dispatch
            return Err(ServerError::ClientNotConnected(key.to_string()));
        }
        Err(source) => {
            info!(tunnel = %key, "Forwarding failed: {}", source);
            return Err(ServerError::Relay {
                tunnel: key.to_string(),
                source,
            });
        }
    };

    build_response(&key, session.owner_email(), reply)
}

fn tunnel_key(headers: &HeaderMap) -> Option<TunnelKey> {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    Some(TunnelKey::new(
        value(TUNNEL_SUBDOMAIN_HEADER)?,
        value(TUNNEL_REGION_HEADER)?,
    ))
}

/// 404 when the tunnel does not exist at all, 503 when its client is away
async fn no_session(state: &AppState, key: &TunnelKey) -> ServerError {
    match state
        .directory
        .get_by_key(&key.subdomain, &key.region)
        .await
    {
        Ok(Some(_)) => ServerError::ClientNotConnected(key.to_string()),
        Ok(None) => ServerError::TunnelNotFound(key.to_string()),
        Err(e) => {
            warn!(tunnel = %key, "Tunnel lookup failed: {}", e);
            ServerError::DirectoryUnavailable
        }
    }
}

/// Path after the proxy prefix, plus the query string
pub fn forwarded_url(path: &str, query: Option<&str>) -> String {
    let rest = path.strip_prefix(PROXY_PREFIX).unwrap_or(path);
    let mut url = if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    };

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn wire_headers(headers: &HeaderMap) -> Headers {
    let mut wire = Headers::new();

    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            debug!("Skipping non-text request header {}", name);
            continue;
        };

        match wire.get_mut(name.as_str()) {
            Some(values) => values.push(value.to_string()),
            None => {
                wire.insert(name.as_str().to_string(), HeaderValues::from(value));
            }
        }
    }
    wire
}

fn build_response(
    key: &TunnelKey,
    owner_email: Option<&str>,
    reply: ForwardedResponse,
) -> Result<Response, ServerError> {
    let status = StatusCode::from_u16(reply.status_code)
        .map_err(|_| ServerError::InvalidStatus(reply.status_code))?;

    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, values) in &reply.headers {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }

        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(tunnel = %key, "Skipping invalid response header name {:?}", name);
            continue;
        };

        for value in values.iter() {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(header_name.clone(), value);
                }
                Err(_) => debug!(tunnel = %key, "Skipping invalid value for header {}", name),
            }
        }
    }

    insert_diagnostic(headers, TUNNEL_SUBDOMAIN_HEADER, &key.subdomain);
    insert_diagnostic(headers, TUNNEL_REGION_HEADER, &key.region);
    insert_diagnostic(headers, TUNNEL_USER_HEADER, owner_email.unwrap_or("unknown"));
    headers.insert(
        HeaderName::from_static("x-powered-by"),
        HeaderValue::from_static(POWERED_BY),
    );

    Ok(response)
}

fn insert_diagnostic(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
