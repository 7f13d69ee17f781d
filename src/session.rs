// src/session.rs
//! Session-token propagation for outgoing API requests.
//!
//! Requests are built explicitly with the caller's token instead of relying
//! on any process-wide client state.

use http::{HeaderValue, Method};
use reqwest::{Client, RequestBuilder};

/// Header carrying the hosted auth session token.
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

/// Builds a request for `url` that carries `session_token`.
///
/// A missing or unrepresentable token is sent as an empty header value, so
/// the server always sees the header.
pub fn build_request(
    client: &Client,
    method: Method,
    url: &str,
    session_token: Option<&str>,
) -> RequestBuilder {
    let value = session_token
        .and_then(|token| HeaderValue::from_str(token).ok())
        .unwrap_or_else(|| HeaderValue::from_static(""));

    client
        .request(method, url)
        .header(SESSION_TOKEN_HEADER, value)
}
