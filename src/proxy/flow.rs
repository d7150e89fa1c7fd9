/* httpctl (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::{fmt, net::SocketAddr, time::Duration};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use uuid::Uuid;

/// Whether the inbound leg was plaintext or TLS-terminated; decides the origin scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// One client request on its way to the origin.
///
/// Built by the inbound session once the request head and body are fully read; owned by
/// the task forwarding it, so nothing here needs synchronization.
#[derive(Debug)]
pub struct ForwardRequest {
    /// UUID v7, so flow ids sort by creation time in logs.
    pub id: Uuid,
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    /// Origin hostname, lowercase, without port.
    pub host: String,
    pub port: u16,
    pub headers: HeaderMap,
    pub body: BodyBuffer,
    pub scheme: Scheme,
    /// ALPN the client negotiated with us, if the inbound leg was TLS.
    pub client_alpn: Option<Vec<u8>>,
    pub peer: SocketAddr,
}

impl ForwardRequest {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        scheme: Scheme,
        peer: SocketAddr,
    ) -> Self {
        let (host, port) = origin_target(&uri, &headers, scheme);
        Self {
            id: Uuid::now_v7(),
            method,
            uri,
            version: Version::HTTP_11,
            host,
            port,
            headers,
            body: BodyBuffer::default(),
            scheme,
            client_alpn: None,
            peer,
        }
    }

    /// Origin-form target: path plus query, `/` when the URI carries neither.
    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/")
    }

    /// `host[:port]`, with the port elided when it is the scheme default.
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn client_negotiated_h2(&self) -> bool {
        self.client_alpn.as_deref() == Some(&b"h2"[..])
    }
}

/// Picks the origin host and port from the absolute URI or, failing that, `Host`.
fn origin_target(uri: &Uri, headers: &HeaderMap, scheme: Scheme) -> (String, u16) {
    if let Some(host) = uri.host() {
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
        return (normalize_host(host), port);
    }

    let raw = headers
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    split_host_port(raw, scheme.default_port())
}

/// Splits `host[:port]`, tolerating bracketed IPv6 literals.
pub fn split_host_port(raw: &str, default_port: u16) -> (String, u16) {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_ascii_lowercase(), port);
        }
    }
    match raw.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (normalize_host(host), port),
            Err(_) => (normalize_host(raw), default_port),
        },
        _ => (normalize_host(raw), default_port),
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_matches(|c| c == '[' || c == ']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Origin response head as seen by the forwarder, before client-side framing.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }
}

/// Growable byte buffer for request bodies.
///
/// Request bodies are buffered in full before dialing; responses stream.
#[derive(Debug, Default)]
pub struct BodyBuffer {
    data: BytesMut,
}

impl BodyBuffer {
    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Owned copy for transports that send `Bytes` frames.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }
}

/// Forwarding progress of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Received,
    Resolved,
    Dialed,
    Forwarding,
    Complete,
    Failed,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FlowState::Received => "received",
            FlowState::Resolved => "resolved",
            FlowState::Dialed => "dialed",
            FlowState::Forwarding => "forwarding",
            FlowState::Complete => "complete",
            FlowState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Summary of a finished flow, handed to telemetry.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub method: Method,
    pub host: String,
    pub path: String,
    pub scheme: Scheme,
    pub state: FlowState,
    pub status: Option<StatusCode>,
    pub transport: Option<&'static str>,
    pub response_bytes: u64,
    pub elapsed: Duration,
    pub error: Option<String>,
}
