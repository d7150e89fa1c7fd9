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
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, Method};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    time::timeout,
};

use crate::{
    proxy::{
        body::BufferPool,
        client::{Alpn, UpstreamDialer},
        flow::{ForwardRequest, ResponseHead, Scheme},
        headers::origin_request_headers,
        wire,
    },
    utils::ForwardError,
};

use super::{expects_body, BodyStream, EmptyBody, OriginResponse, OriginTransport, TransportKind};

/// Byte stream to an origin: plain TCP or TLS over TCP.
pub(crate) trait OriginIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> OriginIo for T {}

/// HTTP/1.1 with a fresh connection per request and `Connection: close`.
pub struct H1Transport {
    dialer: Arc<UpstreamDialer>,
    pool: BufferPool,
    idle_timeout: Duration,
}

impl H1Transport {
    pub fn new(dialer: Arc<UpstreamDialer>, pool: BufferPool, idle_timeout: Duration) -> Self {
        Self {
            dialer,
            pool,
            idle_timeout,
        }
    }
}

#[async_trait]
impl OriginTransport for H1Transport {
    fn kind(&self) -> TransportKind {
        TransportKind::H1
    }

    async fn send(
        &self,
        req: &ForwardRequest,
        ips: &[Ipv4Addr],
        port: u16,
    ) -> Result<OriginResponse, ForwardError> {
        let (io, remote): (Box<dyn OriginIo>, SocketAddr) = match req.scheme {
            Scheme::Http => {
                let (stream, remote) = self.dialer.connect_tcp(ips, port).await?;
                (Box::new(stream), remote)
            }
            Scheme::Https => {
                let (stream, remote) = self
                    .dialer
                    .connect_tls(&req.host, ips, port, Alpn::Http1)
                    .await?;
                (Box::new(stream), remote)
            }
        };
        exchange(io, req, remote, self.pool.clone(), self.idle_timeout).await
    }
}

/// Writes the request on an established connection and reads the response head.
///
/// Also used by the HTTP/2 transport when an origin declines `h2` during ALPN.
pub(crate) async fn exchange(
    io: Box<dyn OriginIo>,
    req: &ForwardRequest,
    remote: SocketAddr,
    pool: BufferPool,
    idle: Duration,
) -> Result<OriginResponse, ForwardError> {
    let mut reader = BufReader::new(io);
    write_request(reader.get_mut(), req)
        .await
        .map_err(|err| ForwardError::upstream(format!("failed to send request: {err}")))?;

    let head = read_head(&mut reader)
        .await
        .map_err(|err| ForwardError::upstream(format!("failed to read response head: {err}")))?;
    tracing::trace!(flow = %req.id, status = %head.status, %remote, "origin HTTP/1.1 head");

    let framing = Framing::for_response(&head, &req.method);
    let body: Box<dyn BodyStream> = match framing {
        Framing::Empty => Box::new(EmptyBody),
        framing => Box::new(H1Body {
            reader,
            framing,
            pool,
            idle,
        }),
    };
    Ok(OriginResponse {
        head,
        body,
        protocol: TransportKind::H1.label(),
        remote,
    })
}

async fn write_request<W>(writer: &mut W, req: &ForwardRequest) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut headers = origin_request_headers(&req.headers, true);
    if let Ok(host) = HeaderValue::from_str(&req.authority()) {
        headers.insert(header::HOST, host);
    }
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    if !req.body.is_empty() || expects_body(&req.method) {
        headers.insert(header::CONTENT_LENGTH, req.body.len().into());
    }

    let start = format!("{} {} HTTP/1.1", req.method, req.path_and_query());
    wire::write_head(writer, &start, &headers).await?;
    if !req.body.is_empty() {
        writer.write_all(req.body.as_bytes()).await?;
    }
    writer.flush().await
}

/// Reads status line and headers, skipping interim 1xx responses (except 101).
async fn read_head<R>(reader: &mut BufReader<R>) -> io::Result<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut budget = wire::MAX_HEAD_BYTES;
        let line = wire::read_line(reader, &mut budget).await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "origin closed connection before sending a status line",
            )
        })?;
        let (version, status) = wire::parse_status_line(&line)?;
        let headers = wire::read_headers(reader, &mut budget).await?;
        if status.is_informational() && status != http::StatusCode::SWITCHING_PROTOCOLS {
            continue;
        }
        return Ok(ResponseHead {
            status,
            version,
            headers,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(u64),
    /// Bytes left in the current chunk; `None` when a size line is due.
    Chunked(Option<u64>),
    Close,
    Done,
}

impl Framing {
    fn for_response(head: &ResponseHead, method: &Method) -> Self {
        if *method == Method::HEAD || wire::bodyless_status(head.status) {
            return Framing::Empty;
        }
        if wire::is_chunked(&head.headers) {
            return Framing::Chunked(None);
        }
        match wire::content_length(&head.headers) {
            Some(0) => Framing::Empty,
            Some(len) => Framing::Length(len),
            None => Framing::Close,
        }
    }
}

/// Response body read straight off the origin connection into pooled buffers.
struct H1Body<R> {
    reader: BufReader<R>,
    framing: Framing,
    pool: BufferPool,
    idle: Duration,
}

async fn idle_read<T>(
    idle: Duration,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, ForwardError> {
    match timeout(idle, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ForwardError::upstream(format!("origin body read failed: {err}"))),
        Err(_) => Err(ForwardError::Timeout("reading origin body")),
    }
}

impl<R: AsyncRead + Unpin + Send> H1Body<R> {
    async fn read_some(&mut self, limit: u64) -> Result<Option<Bytes>, ForwardError> {
        let mut buf = self.pool.acquire();
        let cap = buf.len().min(usize::try_from(limit).unwrap_or(usize::MAX));
        let n = idle_read(self.idle, self.reader.read(&mut buf[..cap])).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&buf[..n])))
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> BodyStream for H1Body<R> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ForwardError> {
        loop {
            match self.framing {
                Framing::Empty | Framing::Done => return Ok(None),
                Framing::Close => {
                    let chunk = self.read_some(u64::MAX).await?;
                    if chunk.is_none() {
                        self.framing = Framing::Done;
                    }
                    return Ok(chunk);
                }
                Framing::Length(remaining) => {
                    let chunk = self.read_some(remaining).await?.ok_or_else(|| {
                        ForwardError::upstream(format!(
                            "origin closed with {remaining} body bytes outstanding"
                        ))
                    })?;
                    let left = remaining - chunk.len() as u64;
                    self.framing = if left == 0 {
                        Framing::Done
                    } else {
                        Framing::Length(left)
                    };
                    return Ok(Some(chunk));
                }
                Framing::Chunked(None) => {
                    let mut budget = wire::MAX_HEAD_BYTES;
                    let line = idle_read(self.idle, wire::read_line(&mut self.reader, &mut budget))
                        .await?
                        .ok_or_else(|| ForwardError::upstream("origin closed inside chunked body"))?;
                    let size = wire::parse_chunk_size(&line)
                        .map_err(|err| ForwardError::upstream(err.to_string()))?;
                    if size == 0 {
                        idle_read(self.idle, wire::skip_trailers(&mut self.reader)).await?;
                        self.framing = Framing::Done;
                        return Ok(None);
                    }
                    self.framing = Framing::Chunked(Some(size));
                }
                Framing::Chunked(Some(remaining)) => {
                    let chunk = self
                        .read_some(remaining)
                        .await?
                        .ok_or_else(|| ForwardError::upstream("origin closed inside a chunk"))?;
                    let left = remaining - chunk.len() as u64;
                    if left == 0 {
                        idle_read(self.idle, wire::expect_crlf(&mut self.reader)).await?;
                        self.framing = Framing::Chunked(None);
                    } else {
                        self.framing = Framing::Chunked(Some(left));
                    }
                    return Ok(Some(chunk));
                }
            }
        }
    }
}
