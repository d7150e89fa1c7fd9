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

use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Version};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::{timeout, Duration},
};

use crate::tls::{self, cert::CertificateAuthority};

use super::{
    flow::{BodyBuffer, FlowState, ForwardRequest, Scheme},
    forwarder::ProtocolForwarder,
    respond::{send_plain, H1ResponseWriter, H2ResponseWriter},
    wire,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a keep-alive client may sit between requests.
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Which listener accepted the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// Plain proxy port: absolute-form requests and CONNECT tunnels.
    Http,
    /// TLS port: clients start the handshake right away.
    Https,
}

/// Everything a connection task needs, cheap to clone per accept.
#[derive(Clone)]
pub struct ProxyContext {
    pub ca: Arc<CertificateAuthority>,
    pub forwarder: Arc<ProtocolForwarder>,
}

#[derive(Debug, PartialEq)]
enum Protocol {
    Tls,
    Connect,
    Http,
    Unknown,
}

/// Sniffs the first bytes without consuming them: a TLS handshake record starts with
/// 0x16, HTTP with an upper-case method token.
async fn detect_protocol(socket: &TcpStream) -> std::io::Result<Protocol> {
    let mut buf = [0u8; 8];
    let n = socket.peek(&mut buf).await?;
    if n == 0 {
        return Ok(Protocol::Unknown);
    }
    Ok(match buf[0] {
        0x16 => Protocol::Tls,
        _ if b"CONNECT "[..n] == buf[..n] => Protocol::Connect,
        b'A'..=b'Z' => Protocol::Http,
        _ => Protocol::Unknown,
    })
}

/// Serves one accepted socket until the client goes away.
///
/// TLS is terminated with a leaf for the client's SNI, then the session speaks HTTP/2 or
/// HTTP/1.1 as negotiated by ALPN. A CONNECT preamble is answered first and the tunnel
/// contents are sniffed again, so tunnels carrying plaintext HTTP work too.
pub async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    kind: ListenerKind,
    ctx: ProxyContext,
) -> Result<()> {
    let mut connect_target = None;
    let mut protocol = detect_protocol(&socket).await?;

    if protocol == Protocol::Connect {
        let target = handle_connect_tunnel(&mut socket).await?;
        tracing::debug!(%peer, target = %target, "CONNECT tunnel established");
        connect_target = Some(target);
        protocol = detect_protocol(&socket).await?;
    }

    match protocol {
        Protocol::Tls => serve_tls(socket, peer, connect_target, ctx).await,
        Protocol::Http if kind == ListenerKind::Http || connect_target.is_some() => {
            serve_http1(socket, peer, Scheme::Http, None, connect_target, &ctx).await
        }
        Protocol::Http => bail!("plaintext HTTP on the TLS listener"),
        Protocol::Connect | Protocol::Unknown => {
            tracing::debug!(%peer, "rejecting connection with unknown protocol");
            bail!("unknown protocol")
        }
    }
}

/// Consumes `CONNECT host:port HTTP/1.1` and its headers, then answers 200 so the client
/// starts talking through the tunnel. Returns the requested target.
async fn handle_connect_tunnel(socket: &mut TcpStream) -> Result<String> {
    let mut reader = BufReader::new(&mut *socket);
    let mut budget = wire::MAX_HEAD_BYTES;
    let line = wire::read_line(&mut reader, &mut budget)
        .await
        .context("failed to read CONNECT request line")?
        .ok_or_else(|| anyhow!("client closed before sending CONNECT"))?;
    let (method, uri, _) = wire::parse_request_line(&line)?;
    if method != Method::CONNECT {
        bail!("expected CONNECT, got {method}");
    }
    wire::read_headers(&mut reader, &mut budget)
        .await
        .context("failed to read CONNECT headers")?;
    if !reader.buffer().is_empty() {
        bail!("client sent tunnel data before the CONNECT response");
    }

    let target = uri
        .authority()
        .map(|authority| authority.to_string())
        .ok_or_else(|| anyhow!("CONNECT target lacks an authority"))?;

    socket
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .context("failed to send 200 Connection Established")?;
    Ok(target)
}

async fn serve_tls(
    socket: TcpStream,
    peer: SocketAddr,
    connect_target: Option<String>,
    ctx: ProxyContext,
) -> Result<()> {
    let terminated = timeout(
        HANDSHAKE_TIMEOUT,
        tls::terminate(&ctx.ca, socket, connect_target.as_deref()),
    )
        .await
        .map_err(|_| anyhow!("TLS handshake timed out for {peer} after {:?}", HANDSHAKE_TIMEOUT))?
        .with_context(|| format!("TLS handshake failed for {peer}"))?;

    tracing::debug!(
        %peer,
        sni = terminated.sni.as_deref().unwrap_or("<none>"),
        alpn = ?terminated.alpn.as_deref().map(String::from_utf8_lossy),
        "client handshake complete"
    );

    // Requests without any authority fall back to the tunnel target, then the SNI.
    let fallback = connect_target.or_else(|| terminated.sni.clone());
    if terminated.negotiated_h2() {
        serve_h2(terminated.stream, peer, fallback, ctx).await
    } else {
        let alpn = terminated.alpn.clone();
        serve_http1(terminated.stream, peer, Scheme::Https, alpn, fallback, &ctx).await
    }
}

/// HTTP/1.x keep-alive loop: one request at a time, each fully buffered before forwarding.
async fn serve_http1<S>(
    stream: S,
    peer: SocketAddr,
    scheme: Scheme,
    client_alpn: Option<Vec<u8>>,
    fallback_authority: Option<String>,
    ctx: &ProxyContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    loop {
        let mut budget = wire::MAX_HEAD_BYTES;
        let line = match timeout(CLIENT_IDLE_TIMEOUT, wire::read_line(&mut reader, &mut budget)).await {
            Err(_) => {
                tracing::trace!(%peer, "keep-alive connection idle, closing");
                break;
            }
            Ok(Ok(None)) => break,
            Ok(Ok(Some(line))) if line.is_empty() => continue,
            Ok(Ok(Some(line))) => line,
            Ok(Err(err)) => return Err(err).context("failed to read request line"),
        };

        let (method, uri, version) = wire::parse_request_line(&line)?;
        let mut headers = wire::read_headers(&mut reader, &mut budget)
            .await
            .context("failed to read request headers")?;
        tracing::trace!(%peer, %method, %uri, "parsed HTTP/1.x request");

        if method == Method::CONNECT {
            let mut writer = H1ResponseWriter::new(&mut write_half, version, false, false);
            let _ = send_plain(&mut writer, StatusCode::METHOD_NOT_ALLOWED, "nested CONNECT is not supported").await;
            break;
        }

        if expects_continue(&headers) {
            headers.remove(header::EXPECT);
            let interim = format!("{} 100 Continue\r\n\r\n", wire::version_str(version));
            write_half.write_all(interim.as_bytes()).await?;
            write_half.flush().await?;
        }

        let mut body = BodyBuffer::default();
        wire::read_request_body(&mut reader, &headers, &mut body)
            .await
            .context("failed to read request body")?;

        if uri.host().is_none() && !headers.contains_key(header::HOST) {
            if let Some(value) = fallback_authority
                .as_deref()
                .and_then(|authority| HeaderValue::from_str(authority).ok())
            {
                headers.insert(header::HOST, value);
            }
        }

        let keep_alive = client_keep_alive(version, &headers);
        let head_request = method == Method::HEAD;
        let mut req = ForwardRequest::new(method, uri, headers, scheme, peer);
        req.version = version;
        req.body = body;
        req.client_alpn = client_alpn.clone();

        let mut writer = H1ResponseWriter::new(&mut write_half, version, head_request, keep_alive)
            .watch_client(&mut reader);
        if req.host.is_empty() {
            let _ = send_plain(&mut writer, StatusCode::BAD_REQUEST, "request has no host").await;
            break;
        }

        let record = ctx.forwarder.handle(req, &mut writer).await;
        if record.state != FlowState::Complete || !writer.keep_alive() {
            break;
        }
    }

    let _ = write_half.shutdown().await;
    Ok(())
}

fn expects_continue(headers: &HeaderMap) -> bool {
    headers
        .get(header::EXPECT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
}

/// HTTP/1.1 keeps the connection unless told otherwise; HTTP/1.0 connections close.
fn client_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    if version == Version::HTTP_10 {
        return false;
    }
    !headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// Terminates the client-facing HTTP/2 connection; every stream runs in its own task
/// while this loop keeps polling the connection.
async fn serve_h2<S>(
    stream: S,
    peer: SocketAddr,
    fallback_authority: Option<String>,
    ctx: ProxyContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut connection = h2::server::handshake(stream)
        .await
        .context("failed to negotiate HTTP/2 with client")?;

    while let Some(result) = connection.accept().await {
        let (request, respond) = match result {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(%peer, "client h2 connection ended: {err}");
                break;
            }
        };
        let ctx = ctx.clone();
        let fallback = fallback_authority.clone();
        tokio::spawn(async move {
            let mut writer = H2ResponseWriter::new(respond);
            match request_from_h2(request, peer, fallback.as_deref()).await {
                Ok(req) => {
                    ctx.forwarder.handle(req, &mut writer).await;
                }
                Err(err) => {
                    tracing::debug!(%peer, "unreadable h2 request: {err:#}");
                    let _ = send_plain(&mut writer, StatusCode::BAD_REQUEST, &err.to_string()).await;
                }
            }
        });
    }
    Ok(())
}

/// Buffers one HTTP/2 request, returning flow-control credit as DATA arrives.
async fn request_from_h2(
    request: http::Request<h2::RecvStream>,
    peer: SocketAddr,
    fallback_authority: Option<&str>,
) -> Result<ForwardRequest> {
    let (parts, mut recv) = request.into_parts();
    let mut body = BodyBuffer::default();
    while let Some(chunk) = recv.data().await {
        let chunk = chunk.context("client h2 body failed")?;
        if body.len() + chunk.len() > wire::MAX_REQUEST_BODY {
            bail!("request body too large");
        }
        body.push_bytes(&chunk);
        let _ = recv.flow_control().release_capacity(chunk.len());
    }

    let mut headers = parts.headers;
    if parts.uri.host().is_none() && !headers.contains_key(header::HOST) {
        if let Some(value) = fallback_authority.and_then(|authority| HeaderValue::from_str(authority).ok()) {
            headers.insert(header::HOST, value);
        }
    }

    let mut req = ForwardRequest::new(parts.method, parts.uri, headers, Scheme::Https, peer);
    if req.host.is_empty() {
        bail!("request has no authority");
    }
    req.version = Version::HTTP_2;
    req.body = body;
    req.client_alpn = Some(b"h2".to_vec());
    Ok(req)
}
