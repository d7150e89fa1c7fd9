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

use std::sync::Arc;

use anyhow::Result;
use http::{header, HeaderMap, Method};
use rustls::RootCertStore;
use tokio::time::{timeout_at, Instant};

use crate::{
    config::{TransportMode, UpstreamConfig},
    executor::{ExecutorSet, RequestMeta, ResponseMeta},
    resolver::ResolutionCache,
    telemetry::TelemetrySink,
    utils::ForwardError,
};

use super::{
    alt_svc::AltSvcCache,
    body::{BufferPool, SinkTee},
    client::{UpstreamDialer, WEBPKI_ROOTS},
    flow::{FlowRecord, FlowState, ForwardRequest, ResponseHead, Scheme},
    headers::client_response_headers,
    respond::{send_plain, ResponseWriter},
    transport::{H1Transport, H2Transport, H3Transport, OriginResponse, OriginTransport, TransportKind},
    wire,
};

/// Drives one request from resolution to the last body byte.
///
/// The client receives the origin's bytes exactly as sent; executor sinks get the same
/// body decoded. Every state change is logged at debug level under the flow id, and a
/// telemetry event is emitted once the flow ends.
pub struct ProtocolForwarder {
    resolver: Arc<ResolutionCache>,
    executors: ExecutorSet,
    alt_svc: AltSvcCache,
    h1: H1Transport,
    h2: H2Transport,
    h3: Option<H3Transport>,
    cfg: UpstreamConfig,
    telemetry: TelemetrySink,
}

impl ProtocolForwarder {
    pub fn new(
        cfg: &UpstreamConfig,
        resolver: Arc<ResolutionCache>,
        executors: ExecutorSet,
        telemetry: TelemetrySink,
    ) -> Result<Self> {
        Self::with_roots(cfg, resolver, executors, telemetry, WEBPKI_ROOTS.clone())
    }

    /// Same as [`ProtocolForwarder::new`] but trusting `roots` for origin certificates.
    pub fn with_roots(
        cfg: &UpstreamConfig,
        resolver: Arc<ResolutionCache>,
        executors: ExecutorSet,
        telemetry: TelemetrySink,
        roots: RootCertStore,
    ) -> Result<Self> {
        let dialer = Arc::new(UpstreamDialer::new(cfg, roots.clone())?);
        let pool = BufferPool::default();
        let h3 = if cfg.http3 || cfg.transport == TransportMode::H3 {
            Some(H3Transport::new(cfg, roots)?)
        } else {
            None
        };

        Ok(Self {
            resolver,
            executors,
            alt_svc: AltSvcCache::new(),
            h1: H1Transport::new(dialer.clone(), pool.clone(), cfg.idle_timeout()),
            h2: H2Transport::new(dialer, pool, cfg.idle_timeout()),
            h3,
            cfg: cfg.clone(),
            telemetry,
        })
    }

    pub fn alt_svc(&self) -> &AltSvcCache {
        &self.alt_svc
    }

    /// Forwards `req` and writes the response through `writer`.
    ///
    /// Failures before the response head reaches the client become a plain-text 502/504.
    /// Later failures can only cut the response short; the returned record says which.
    pub async fn handle<W>(&self, req: ForwardRequest, writer: &mut W) -> FlowRecord
    where
        W: ResponseWriter + ?Sized,
    {
        let started = Instant::now();
        let mut flow = FlowRecord {
            id: req.id,
            peer: req.peer,
            method: req.method.clone(),
            host: req.host.clone(),
            path: req.path_and_query().to_string(),
            scheme: req.scheme,
            state: FlowState::Received,
            status: None,
            transport: None,
            response_bytes: 0,
            elapsed: Default::default(),
            error: None,
        };
        tracing::debug!(
            flow = %flow.id,
            state = %flow.state,
            method = %flow.method,
            host = %flow.host,
            port = req.port,
            path = %flow.path,
            body_bytes = req.body.len(),
            "flow state"
        );

        let deadline = started + self.cfg.request_timeout();
        let fetched = tokio::select! {
            biased;
            _ = writer.cancelled() => Err(ForwardError::ClientGone),
            fetched = timeout_at(deadline, self.fetch(&req, deadline, &mut flow)) => {
                fetched.unwrap_or(Err(ForwardError::Timeout("waiting for origin response headers")))
            }
        };

        let result = match fetched {
            Ok(origin) => self.relay(&req, origin, writer, &mut flow).await,
            Err(err) => {
                if !matches!(err, ForwardError::ClientGone) {
                    let status = err.status_code();
                    flow.status = Some(status);
                    if send_plain(writer, status, &err.to_string()).await.is_err() {
                        tracing::debug!(flow = %flow.id, "client left before the error response");
                    }
                }
                Err(err)
            }
        };

        match result {
            Ok(()) => advance(&mut flow, FlowState::Complete),
            Err(err) => {
                tracing::debug!(flow = %flow.id, host = %flow.host, error = %err, "flow failed");
                flow.error = Some(err.to_string());
                advance(&mut flow, FlowState::Failed);
            }
        }
        flow.elapsed = started.elapsed();
        self.telemetry.flow(&flow);
        flow
    }

    /// Resolves and dials, returning once the origin's response head is in.
    async fn fetch(
        &self,
        req: &ForwardRequest,
        deadline: Instant,
        flow: &mut FlowRecord,
    ) -> Result<OriginResponse, ForwardError> {
        let ips = self.resolver.lookup(&req.host, deadline).await?;
        tracing::debug!(flow = %flow.id, ips = ?ips, "resolved");
        advance(flow, FlowState::Resolved);

        let plan = TransportKind::select(
            req,
            self.cfg.transport,
            self.cfg.http3,
            &self.alt_svc,
            std::time::Instant::now(),
        );
        tracing::debug!(flow = %flow.id, transport = %plan.kind, port = plan.port, "dialing origin");

        let origin = match (plan.kind, self.h3.as_ref()) {
            (TransportKind::H3, Some(h3)) => match h3.send(req, &ips, plan.port).await {
                Ok(origin) => origin,
                Err(err) if self.cfg.transport == TransportMode::Auto => {
                    tracing::debug!(flow = %flow.id, error = %err, "h3 failed, falling back to TCP");
                    self.alt_svc.forget(&req.authority());
                    let fallback = TransportKind::tcp_fallback(req);
                    self.tcp(fallback.kind).send(req, &ips, fallback.port).await?
                }
                Err(err) => return Err(err),
            },
            (TransportKind::H3, None) => {
                let fallback = TransportKind::tcp_fallback(req);
                self.tcp(fallback.kind).send(req, &ips, fallback.port).await?
            }
            (kind, _) => self.tcp(kind).send(req, &ips, plan.port).await?,
        };

        flow.transport = Some(origin.protocol);
        tracing::debug!(
            flow = %flow.id,
            remote = %origin.remote,
            protocol = origin.protocol,
            status = %origin.head.status,
            "origin answered"
        );
        advance(flow, FlowState::Dialed);
        Ok(origin)
    }

    fn tcp(&self, kind: TransportKind) -> &dyn OriginTransport {
        match kind {
            TransportKind::H2 => &self.h2,
            _ => &self.h1,
        }
    }

    /// Streams the origin response to the client and, decoded, to the executor sinks.
    async fn relay<W>(
        &self,
        req: &ForwardRequest,
        mut origin: OriginResponse,
        writer: &mut W,
        flow: &mut FlowRecord,
    ) -> Result<(), ForwardError>
    where
        W: ResponseWriter + ?Sized,
    {
        let status = origin.head.status;
        self.alt_svc
            .observe(&req.authority(), &origin.head.headers, std::time::Instant::now());

        let mut tee = if self.executors.is_empty() {
            SinkTee::disabled()
        } else {
            let sinks = self
                .executors
                .open_all(&request_meta(req), &response_meta(&origin.head));
            SinkTee::new(&origin.head.headers, sinks)
        };

        let bodyless = req.method == Method::HEAD || wire::bodyless_status(status);
        flow.status = Some(status);
        writer
            .send_head(status, client_response_headers(&origin.head.headers), bodyless)
            .await?;
        advance(flow, FlowState::Forwarding);

        if !bodyless {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = writer.cancelled() => Err(ForwardError::ClientGone),
                    chunk = origin.body.next_chunk() => chunk,
                };
                let Some(chunk) = next? else { break };
                tee.feed(&chunk);
                flow.response_bytes += chunk.len() as u64;
                writer.send_data(chunk).await?;
            }
            writer.finish().await?;
        }

        if let Some(decoded) = tee.finish() {
            tracing::trace!(flow = %flow.id, decoded, "sinks received decoded body");
        }
        Ok(())
    }
}

fn advance(flow: &mut FlowRecord, state: FlowState) {
    flow.state = state;
    tracing::debug!(flow = %flow.id, state = %state, host = %flow.host, "flow state");
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn request_meta(req: &ForwardRequest) -> RequestMeta {
    let connection_close = req
        .headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"));

    RequestMeta {
        host: req.host.clone(),
        request_uri: req.path_and_query().to_string(),
        method: req.method.clone(),
        user_agent: header_str(&req.headers, header::USER_AGENT),
        content_type: header_str(&req.headers, header::CONTENT_TYPE),
        connection_close,
        https: req.scheme == Scheme::Https,
    }
}

fn response_meta(head: &ResponseHead) -> ResponseMeta {
    ResponseMeta {
        status: head.status,
        content_type: header_str(&head.headers, header::CONTENT_TYPE),
    }
}
