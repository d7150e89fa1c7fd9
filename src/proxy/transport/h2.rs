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

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use h2::{client::SendRequest, RecvStream};
use http::Version;
use tokio::time::timeout;

use crate::{
    proxy::{
        body::BufferPool,
        client::{Alpn, UpstreamDialer},
        flow::{ForwardRequest, ResponseHead},
    },
    utils::ForwardError,
};

use super::{h1, multiplexed_request, BodyStream, OriginResponse, OriginTransport, TransportKind};

/// HTTP/2 over TLS with ALPN forced to `h2`.
///
/// Origins that answer ALPN with anything else get the same request in HTTP/1.1 framing
/// on the connection already open.
pub struct H2Transport {
    dialer: Arc<UpstreamDialer>,
    pool: BufferPool,
    idle_timeout: Duration,
}

impl H2Transport {
    pub fn new(dialer: Arc<UpstreamDialer>, pool: BufferPool, idle_timeout: Duration) -> Self {
        Self {
            dialer,
            pool,
            idle_timeout,
        }
    }
}

#[async_trait]
impl OriginTransport for H2Transport {
    fn kind(&self) -> TransportKind {
        TransportKind::H2
    }

    async fn send(
        &self,
        req: &ForwardRequest,
        ips: &[Ipv4Addr],
        port: u16,
    ) -> Result<OriginResponse, ForwardError> {
        let (tls, remote) = self
            .dialer
            .connect_tls(&req.host, ips, port, Alpn::H2)
            .await?;

        if tls.get_ref().1.alpn_protocol() != Some(&b"h2"[..]) {
            tracing::debug!(
                flow = %req.id,
                host = %req.host,
                "origin declined h2 during ALPN, speaking HTTP/1.1 instead"
            );
            return h1::exchange(Box::new(tls), req, remote, self.pool.clone(), self.idle_timeout)
                .await;
        }

        let (client, connection) = h2::client::handshake(tls)
            .await
            .map_err(|err| ForwardError::dial(remote.to_string(), format!("h2 handshake failed: {err}")))?;
        let flow = req.id;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(%flow, "origin h2 connection closed: {err}");
            }
        });

        let mut client = client
            .ready()
            .await
            .map_err(|err| ForwardError::upstream(format!("h2 connection not ready: {err}")))?;

        let head = multiplexed_request(req, Version::HTTP_2)?;
        let end_of_stream = req.body.is_empty();
        let (response, mut stream) = client
            .send_request(head, end_of_stream)
            .map_err(|err| ForwardError::upstream(format!("failed to send h2 request: {err}")))?;
        if !end_of_stream {
            stream
                .send_data(req.body.to_bytes(), true)
                .map_err(|err| ForwardError::upstream(format!("failed to send h2 body: {err}")))?;
        }

        let response = response
            .await
            .map_err(|err| ForwardError::upstream(format!("h2 request failed before headers: {err}")))?;
        let (parts, recv) = response.into_parts();
        tracing::trace!(flow = %req.id, status = %parts.status, %remote, "origin h2 head");

        Ok(OriginResponse {
            head: ResponseHead {
                status: parts.status,
                version: Version::HTTP_2,
                headers: parts.headers,
            },
            body: Box::new(H2Body {
                recv,
                _client: client,
                idle: self.idle_timeout,
            }),
            protocol: TransportKind::H2.label(),
            remote,
        })
    }
}

struct H2Body {
    recv: RecvStream,
    /// Holds the connection open until the body is drained.
    _client: SendRequest<Bytes>,
    idle: Duration,
}

#[async_trait]
impl BodyStream for H2Body {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ForwardError> {
        let frame = timeout(self.idle, self.recv.data())
            .await
            .map_err(|_| ForwardError::Timeout("reading origin body"))?;
        match frame {
            None => Ok(None),
            Some(Ok(chunk)) => {
                // Hand the window back so the origin keeps sending.
                let _ = self.recv.flow_control().release_capacity(chunk.len());
                Ok(Some(chunk))
            }
            Some(Err(err)) => Err(ForwardError::upstream(format!("h2 body stream failed: {err}"))),
        }
    }
}
