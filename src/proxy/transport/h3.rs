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

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::future::poll_fn;
use h3::client::{RequestStream, SendRequest};
use h3_quinn::{BidiStream, OpenStreams};
use once_cell::sync::OnceCell;
use quinn::{
    crypto::rustls::QuicClientConfig, ClientConfig, Endpoint, IdleTimeout, TransportConfig,
    ZeroRttAccepted,
};
use rustls::{crypto::aws_lc_rs, RootCertStore};
use tokio::{task::JoinHandle, time::timeout};

use crate::{
    config::UpstreamConfig,
    proxy::flow::{ForwardRequest, ResponseHead},
    utils::ForwardError,
};

use super::{is_idempotent, multiplexed_request, BodyStream, OriginResponse, OriginTransport, TransportKind};

/// HTTP/3 over QUIC, ALPN `h3`.
///
/// One client endpoint is bound lazily and shared; each request gets its own connection.
/// Idempotent requests go out as 0-RTT when a resumption ticket for the origin exists; if
/// the origin turns the early data down and the request fails, it is retried once on a
/// fully handshaken connection.
pub struct H3Transport {
    client_config: ClientConfig,
    endpoint: OnceCell<Endpoint>,
    handshake_timeout: Duration,
    idle_timeout: Duration,
}

impl H3Transport {
    pub fn new(cfg: &UpstreamConfig, roots: RootCertStore) -> Result<Self> {
        let mut tls = rustls::ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .context("crypto provider rejected TLS 1.3")?
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls.alpn_protocols = vec![b"h3".to_vec()];
        tls.enable_early_data = true;

        let quic_tls = QuicClientConfig::try_from(tls).context("TLS config unusable for QUIC")?;
        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(
            IdleTimeout::try_from(cfg.idle_timeout()).context("idle timeout out of range for QUIC")?,
        ));

        let mut client_config = ClientConfig::new(Arc::new(quic_tls));
        client_config.transport_config(Arc::new(transport));

        Ok(Self {
            client_config,
            endpoint: OnceCell::new(),
            handshake_timeout: cfg.handshake_timeout(),
            idle_timeout: cfg.idle_timeout(),
        })
    }

    fn endpoint(&self) -> Result<&Endpoint, ForwardError> {
        self.endpoint.get_or_try_init(|| {
            let mut endpoint = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
                .map_err(|err| ForwardError::dial("0.0.0.0:0", format!("failed to bind QUIC endpoint: {err}")))?;
            endpoint.set_default_client_config(self.client_config.clone());
            Ok(endpoint)
        })
    }

    /// Opens a QUIC connection to the first address that answers.
    async fn connect(
        &self,
        host: &str,
        ips: &[Ipv4Addr],
        port: u16,
        early: bool,
    ) -> Result<(quinn::Connection, Option<ZeroRttAccepted>, SocketAddr), ForwardError> {
        let endpoint = self.endpoint()?;
        let mut last_err = None;
        for ip in ips {
            let addr = SocketAddr::new(IpAddr::V4(*ip), port);
            let connecting = match endpoint.connect(addr, host) {
                Ok(connecting) => connecting,
                Err(err) => {
                    last_err = Some(err.to_string());
                    continue;
                }
            };

            let connecting = if early {
                match connecting.into_0rtt() {
                    Ok((conn, accepted)) => {
                        tracing::trace!(%host, %addr, "sending over QUIC 0-RTT");
                        return Ok((conn, Some(accepted), addr));
                    }
                    Err(connecting) => connecting,
                }
            } else {
                connecting
            };

            match timeout(self.handshake_timeout, connecting).await {
                Ok(Ok(conn)) => return Ok((conn, None, addr)),
                Ok(Err(err)) => {
                    tracing::debug!(%host, %addr, error = %err, "QUIC handshake failed");
                    last_err = Some(err.to_string());
                }
                Err(_) => {
                    last_err = Some(format!("QUIC handshake timed out after {:?}", self.handshake_timeout));
                }
            }
        }

        Err(ForwardError::dial(
            format!("{host}:{port}"),
            last_err.unwrap_or_else(|| "no resolved addresses".to_string()),
        ))
    }

    async fn exchange(
        &self,
        req: &ForwardRequest,
        conn: quinn::Connection,
        remote: SocketAddr,
    ) -> Result<OriginResponse, ForwardError> {
        let (mut driver, mut client) = h3::client::new(h3_quinn::Connection::new(conn.clone()))
            .await
            .map_err(|err| ForwardError::dial(remote.to_string(), format!("h3 setup failed: {err}")))?;
        let flow = req.id;
        let driver = tokio::spawn(async move {
            let closed = poll_fn(|cx| driver.poll_close(cx)).await;
            tracing::trace!(%flow, ?closed, "origin h3 connection closed");
        });
        let mut body = H3Body {
            stream: None,
            _client: None,
            _conn: conn,
            driver,
            idle: self.idle_timeout,
        };

        let head = multiplexed_request(req, http::Version::HTTP_3)?;
        let mut stream = client
            .send_request(head)
            .await
            .map_err(|err| ForwardError::upstream(format!("failed to send h3 request: {err}")))?;
        if !req.body.is_empty() {
            stream
                .send_data(req.body.to_bytes())
                .await
                .map_err(|err| ForwardError::upstream(format!("failed to send h3 body: {err}")))?;
        }
        stream
            .finish()
            .await
            .map_err(|err| ForwardError::upstream(format!("failed to finish h3 request: {err}")))?;

        let response = stream
            .recv_response()
            .await
            .map_err(|err| ForwardError::upstream(format!("h3 request failed before headers: {err}")))?;
        tracing::trace!(flow = %req.id, status = %response.status(), %remote, "origin h3 head");

        let (parts, ()) = response.into_parts();
        body.stream = Some(stream);
        body._client = Some(client);
        Ok(OriginResponse {
            head: ResponseHead {
                status: parts.status,
                version: http::Version::HTTP_3,
                headers: parts.headers,
            },
            body: Box::new(body),
            protocol: TransportKind::H3.label(),
            remote,
        })
    }
}

#[async_trait]
impl OriginTransport for H3Transport {
    fn kind(&self) -> TransportKind {
        TransportKind::H3
    }

    async fn send(
        &self,
        req: &ForwardRequest,
        ips: &[Ipv4Addr],
        port: u16,
    ) -> Result<OriginResponse, ForwardError> {
        let replayable = is_idempotent(&req.method);
        let (conn, early, remote) = self.connect(&req.host, ips, port, replayable).await?;

        match (self.exchange(req, conn, remote).await, early) {
            (Ok(response), _) => Ok(response),
            (Err(err), Some(accepted)) => {
                if accepted.await {
                    return Err(err);
                }
                tracing::debug!(flow = %req.id, host = %req.host, "origin rejected 0-RTT, retrying after handshake");
                let (conn, _, remote) = self.connect(&req.host, ips, port, false).await?;
                self.exchange(req, conn, remote).await
            }
            (Err(err), None) => Err(err),
        }
    }
}

struct H3Body {
    stream: Option<RequestStream<BidiStream<Bytes>, Bytes>>,
    _client: Option<SendRequest<OpenStreams, Bytes>>,
    _conn: quinn::Connection,
    driver: JoinHandle<()>,
    idle: Duration,
}

#[async_trait]
impl BodyStream for H3Body {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ForwardError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        let data = timeout(self.idle, stream.recv_data())
            .await
            .map_err(|_| ForwardError::Timeout("reading origin body"))?
            .map_err(|err| ForwardError::upstream(format!("h3 body stream failed: {err}")))?;
        Ok(data.map(|mut buf| buf.copy_to_bytes(buf.remaining())))
    }
}

impl Drop for H3Body {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
