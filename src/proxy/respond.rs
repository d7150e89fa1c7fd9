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

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::poll_fn;
use h2::{server::SendResponse, SendStream};
use http::{header, HeaderMap, HeaderValue, Response, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::utils::ForwardError;

use super::wire;

/// Client side of one exchange. Any write failure means the client is gone.
#[async_trait]
pub trait ResponseWriter: Send {
    async fn send_head(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        end_of_stream: bool,
    ) -> Result<(), ForwardError>;

    async fn send_data(&mut self, chunk: Bytes) -> Result<(), ForwardError>;

    async fn finish(&mut self) -> Result<(), ForwardError>;

    /// Completes once the client has abandoned the exchange.
    async fn cancelled(&mut self) {
        std::future::pending::<()>().await
    }
}

/// Response writer for an HTTP/1.x connection.
///
/// Bodies without a `Content-Length` are re-framed as chunked for HTTP/1.1 clients and
/// close-delimited for HTTP/1.0 ones. With [`watch_client`](Self::watch_client) the
/// writer also notices the client hanging up while the origin is still working.
pub struct H1ResponseWriter<'a, W> {
    io: &'a mut W,
    client: Option<&'a mut (dyn AsyncBufRead + Unpin + Send)>,
    version: Version,
    head_request: bool,
    keep_alive: bool,
    chunked: bool,
    head_sent: bool,
}

impl<'a, W> H1ResponseWriter<'a, W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(io: &'a mut W, version: Version, head_request: bool, keep_alive: bool) -> Self {
        Self {
            io,
            client: None,
            version,
            head_request,
            keep_alive,
            chunked: false,
            head_sent: false,
        }
    }

    /// Read half of the same connection. EOF or a read error on it cancels the exchange;
    /// pipelined bytes are left buffered for the next request.
    pub fn watch_client(mut self, client: &'a mut (dyn AsyncBufRead + Unpin + Send)) -> Self {
        self.client = Some(client);
        self
    }

    pub fn head_sent(&self) -> bool {
        self.head_sent
    }

    /// False once the framing forced a close-delimited body.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

fn gone(_err: std::io::Error) -> ForwardError {
    ForwardError::ClientGone
}

#[async_trait]
impl<'a, W> ResponseWriter for H1ResponseWriter<'a, W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_head(
        &mut self,
        status: StatusCode,
        mut headers: HeaderMap,
        end_of_stream: bool,
    ) -> Result<(), ForwardError> {
        let has_length = headers.contains_key(header::CONTENT_LENGTH);
        if end_of_stream {
            if !has_length && !self.head_request && !wire::bodyless_status(status) {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            }
        } else if !has_length {
            if self.version == Version::HTTP_10 {
                self.keep_alive = false;
            } else {
                self.chunked = true;
                headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            }
        }
        if !self.keep_alive {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        let start = format!(
            "{} {} {}",
            wire::version_str(self.version),
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        wire::write_head(&mut *self.io, &start, &headers).await.map_err(gone)?;
        self.head_sent = true;
        if end_of_stream {
            self.io.flush().await.map_err(gone)?;
        }
        Ok(())
    }

    async fn send_data(&mut self, chunk: Bytes) -> Result<(), ForwardError> {
        if chunk.is_empty() {
            return Ok(());
        }
        if self.chunked {
            let size = format!("{:x}\r\n", chunk.len());
            self.io.write_all(size.as_bytes()).await.map_err(gone)?;
            self.io.write_all(&chunk).await.map_err(gone)?;
            self.io.write_all(b"\r\n").await.map_err(gone)
        } else {
            self.io.write_all(&chunk).await.map_err(gone)
        }
    }

    async fn finish(&mut self) -> Result<(), ForwardError> {
        if self.chunked {
            self.io.write_all(b"0\r\n\r\n").await.map_err(gone)?;
        }
        self.io.flush().await.map_err(gone)
    }

    async fn cancelled(&mut self) {
        if let Some(client) = self.client.as_mut() {
            match client.fill_buf().await {
                Ok([]) => {
                    tracing::debug!("HTTP/1 client closed mid-exchange");
                    return;
                }
                Err(err) => {
                    tracing::debug!("HTTP/1 client read failed mid-exchange: {err}");
                    return;
                }
                Ok(_) => {}
            }
        }
        std::future::pending::<()>().await
    }
}

/// Response writer for one HTTP/2 stream. DATA frames are sized by the flow-control
/// window the client grants.
pub struct H2ResponseWriter {
    respond: SendResponse<Bytes>,
    stream: Option<SendStream<Bytes>>,
}

impl H2ResponseWriter {
    pub fn new(respond: SendResponse<Bytes>) -> Self {
        Self {
            respond,
            stream: None,
        }
    }
}

#[async_trait]
impl ResponseWriter for H2ResponseWriter {
    async fn send_head(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        end_of_stream: bool,
    ) -> Result<(), ForwardError> {
        let mut response = Response::new(());
        *response.status_mut() = status;
        *response.version_mut() = Version::HTTP_2;
        *response.headers_mut() = headers;

        let stream = self
            .respond
            .send_response(response, end_of_stream)
            .map_err(|_| ForwardError::ClientGone)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn send_data(&mut self, mut chunk: Bytes) -> Result<(), ForwardError> {
        let stream = self.stream.as_mut().ok_or(ForwardError::ClientGone)?;
        while !chunk.is_empty() {
            stream.reserve_capacity(chunk.len());
            let granted = match poll_fn(|cx| stream.poll_capacity(cx)).await {
                Some(Ok(granted)) => granted,
                _ => return Err(ForwardError::ClientGone),
            };
            if granted == 0 {
                continue;
            }
            let piece = chunk.split_to(granted.min(chunk.len()));
            stream
                .send_data(piece, false)
                .map_err(|_| ForwardError::ClientGone)?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), ForwardError> {
        if let Some(stream) = self.stream.as_mut() {
            stream
                .send_data(Bytes::new(), true)
                .map_err(|_| ForwardError::ClientGone)?;
        }
        Ok(())
    }

    async fn cancelled(&mut self) {
        let reason = match self.stream.as_mut() {
            Some(stream) => poll_fn(|cx| stream.poll_reset(cx)).await,
            None => poll_fn(|cx| self.respond.poll_reset(cx)).await,
        };
        tracing::debug!(?reason, "client reset the h2 stream");
    }
}

/// Writes a complete plain-text response in one go.
pub async fn send_plain<W: ResponseWriter + ?Sized>(
    writer: &mut W,
    status: StatusCode,
    text: &str,
) -> Result<(), ForwardError> {
    let body = Bytes::from(format!("{text}\n"));
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CONTENT_LENGTH, body.len().into());
    writer.send_head(status, headers, false).await?;
    writer.send_data(body).await?;
    writer.finish().await
}
