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

//! Origin transports. One [`TransportKind`] is chosen per request and the matching
//! [`OriginTransport`] dials, sends the buffered request, and hands back the response head
//! plus a body stream.

pub mod h1;
pub mod h2;
pub mod h3;

use std::{fmt, net::{Ipv4Addr, SocketAddr}, time::Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, Version};

use crate::{config::TransportMode, utils::ForwardError};

use super::{
    alt_svc::AltSvcCache,
    flow::{ForwardRequest, ResponseHead, Scheme},
    headers::origin_request_headers,
};

pub use h1::H1Transport;
pub use h2::H2Transport;
pub use h3::H3Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    H1,
    H2,
    H3,
}

impl TransportKind {
    pub fn label(self) -> &'static str {
        match self {
            TransportKind::H1 => "http/1.1",
            TransportKind::H2 => "h2",
            TransportKind::H3 => "h3",
        }
    }

    /// Picks the origin transport and port for one request.
    ///
    /// Plaintext requests always use HTTP/1.1. A forced mode applies to TLS requests.
    /// In auto mode HTTP/3 wins when enabled and the origin advertised it, then HTTP/2
    /// when the client itself negotiated h2, then HTTP/1.1.
    pub fn select(
        req: &ForwardRequest,
        mode: TransportMode,
        http3_enabled: bool,
        alt_svc: &AltSvcCache,
        now: Instant,
    ) -> DialPlan {
        let tcp = |kind| DialPlan {
            kind,
            port: req.port,
        };
        if req.scheme == Scheme::Http {
            return tcp(TransportKind::H1);
        }
        match mode {
            TransportMode::H1 => tcp(TransportKind::H1),
            TransportMode::H2 => tcp(TransportKind::H2),
            TransportMode::H3 => DialPlan {
                kind: TransportKind::H3,
                port: alt_svc.h3_port(&req.authority(), now).unwrap_or(req.port),
            },
            TransportMode::Auto => {
                if http3_enabled {
                    if let Some(port) = alt_svc.h3_port(&req.authority(), now) {
                        return DialPlan {
                            kind: TransportKind::H3,
                            port,
                        };
                    }
                }
                Self::tcp_fallback(req)
            }
        }
    }

    /// TCP choice used by auto mode, also after a failed QUIC dial.
    pub fn tcp_fallback(req: &ForwardRequest) -> DialPlan {
        let kind = if req.client_negotiated_h2() {
            TransportKind::H2
        } else {
            TransportKind::H1
        };
        DialPlan {
            kind,
            port: req.port,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Transport plus the port it dials (HTTP/3 may live on an advertised alternative port).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialPlan {
    pub kind: TransportKind,
    pub port: u16,
}

/// Streamed response body from an origin.
#[async_trait]
pub trait BodyStream: Send {
    /// Next raw (still content-encoded) chunk; `None` at end of body.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ForwardError>;
}

/// Body with no bytes, for HEAD and bodiless statuses.
pub struct EmptyBody;

#[async_trait]
impl BodyStream for EmptyBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ForwardError> {
        Ok(None)
    }
}

pub struct OriginResponse {
    pub head: ResponseHead,
    pub body: Box<dyn BodyStream>,
    /// Protocol actually spoken, which can differ from the plan after an ALPN fallback.
    pub protocol: &'static str,
    pub remote: SocketAddr,
}

#[async_trait]
pub trait OriginTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn send(
        &self,
        req: &ForwardRequest,
        ips: &[Ipv4Addr],
        port: u16,
    ) -> Result<OriginResponse, ForwardError>;
}

/// Request head for the multiplexed transports: absolute URI, no connection-specific
/// headers, `Content-Length` from the buffered body.
pub(crate) fn multiplexed_request(
    req: &ForwardRequest,
    version: Version,
) -> Result<Request<()>, ForwardError> {
    let uri = format!("https://{}{}", req.authority(), req.path_and_query());
    let mut builder = Request::builder()
        .method(req.method.clone())
        .uri(uri)
        .version(version);

    if let Some(headers) = builder.headers_mut() {
        *headers = origin_request_headers(&req.headers, false);
        if !req.body.is_empty() || expects_body(&req.method) {
            headers.insert(http::header::CONTENT_LENGTH, req.body.len().into());
        }
    }
    builder
        .body(())
        .map_err(|err| ForwardError::upstream(format!("failed to build request head: {err}")))
}

/// Methods whose requests always carry a length, even when empty.
pub(crate) fn expects_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Safe to replay, so eligible for QUIC 0-RTT.
pub(crate) fn is_idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}
