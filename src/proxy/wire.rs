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

//! HTTP/1.x framing shared by the inbound sessions and the HTTP/1.1 origin transport.

use std::io;

use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::flow::BodyBuffer;

/// Upper bound on a request or status line plus all header lines.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Request bodies are buffered before dialing, so they get a ceiling.
pub const MAX_REQUEST_BODY: usize = 64 * 1024 * 1024;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    &line[..end]
}

/// Reads one line (CRLF stripped), charging its length against `budget`.
///
/// Returns `None` on a clean EOF before any byte of the line.
pub async fn read_line<R>(reader: &mut R, budget: &mut usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(*budget as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if read > *budget {
        return Err(invalid("message head too large"));
    }
    *budget -= read;
    if line.last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-line",
        ));
    }
    Ok(Some(trim_crlf(&line).to_vec()))
}

/// Reads header lines up to the blank line. Malformed lines are skipped.
pub async fn read_headers<R>(reader: &mut R, budget: &mut usize) -> io::Result<HeaderMap>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();
    loop {
        let line = read_line(reader, budget)
            .await?
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "EOF inside headers"))?;
        if line.is_empty() {
            return Ok(headers);
        }
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            continue;
        };
        let name = line[..colon].trim_ascii();
        let value = line[colon + 1..].trim_ascii();
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name), HeaderValue::from_bytes(value)) {
            headers.append(name, value);
        }
    }
}

pub fn parse_version(token: &str) -> Version {
    match token {
        "HTTP/1.0" => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

pub fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// `METHOD target VERSION`.
pub fn parse_request_line(line: &[u8]) -> io::Result<(Method, Uri, Version)> {
    let line = std::str::from_utf8(line).map_err(|_| invalid("request line is not UTF-8"))?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    let [method, target, version] = parts.as_slice() else {
        return Err(invalid(format!("malformed request line: {line}")));
    };
    let method = method
        .parse::<Method>()
        .map_err(|err| invalid(format!("invalid method: {err}")))?;
    let uri = target
        .parse::<Uri>()
        .map_err(|err| invalid(format!("invalid request target: {err}")))?;
    Ok((method, uri, parse_version(version)))
}

/// `VERSION code [reason]`.
pub fn parse_status_line(line: &[u8]) -> io::Result<(Version, StatusCode)> {
    let line = std::str::from_utf8(line).map_err(|_| invalid("status line is not UTF-8"))?;
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|v| v.starts_with("HTTP/"))
        .ok_or_else(|| invalid(format!("malformed status line: {line}")))?;
    let code = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| invalid(format!("invalid status code in: {line}")))?;
    Ok((parse_version(version), code))
}

pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|enc| enc.trim().eq_ignore_ascii_case("chunked"))
}

pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Statuses that never carry a body, whatever the headers claim.
pub fn bodyless_status(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Parses a chunk-size line, ignoring extensions.
pub fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let token = line.split(|b| *b == b';').next().unwrap_or(line).trim_ascii();
    let token = std::str::from_utf8(token).map_err(|_| invalid("chunk size is not ASCII"))?;
    u64::from_str_radix(token, 16).map_err(|_| invalid(format!("invalid chunk size: {token}")))
}

/// Skips the trailer section after the last chunk.
pub async fn skip_trailers<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_BYTES;
    while let Some(line) = read_line(reader, &mut budget).await? {
        if line.is_empty() {
            break;
        }
    }
    Ok(())
}

pub async fn expect_crlf<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if crlf != *b"\r\n" {
        return Err(invalid("chunk missing CRLF terminator"));
    }
    Ok(())
}

/// Checks that `incoming` more bytes fit next to `buffered` under [`MAX_REQUEST_BODY`].
fn body_allowance(buffered: usize, incoming: u64) -> io::Result<usize> {
    usize::try_from(incoming)
        .ok()
        .filter(|&n| n <= MAX_REQUEST_BODY.saturating_sub(buffered))
        .ok_or_else(|| invalid("request body too large"))
}

/// Reads a complete request body into `body`, honoring chunked or fixed-length framing.
pub async fn read_request_body<R>(
    reader: &mut R,
    headers: &HeaderMap,
    body: &mut BodyBuffer,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    if is_chunked(headers) {
        loop {
            let mut budget = MAX_HEAD_BYTES;
            let line = read_line(reader, &mut budget)
                .await?
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "EOF in chunk size"))?;
            let size = parse_chunk_size(&line)?;
            if size == 0 {
                return skip_trailers(reader).await;
            }
            let size = body_allowance(body.len(), size)?;
            let mut chunk = vec![0u8; size];
            reader.read_exact(&mut chunk).await?;
            body.push_bytes(&chunk);
            expect_crlf(reader).await?;
        }
    }

    let len = body_allowance(0, content_length(headers).unwrap_or(0))?;
    if len > 0 {
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        body.push_bytes(&buf);
    }
    Ok(())
}

/// Writes a start line, the headers, and the blank line.
pub async fn write_head<W>(writer: &mut W, start_line: &str, headers: &HeaderMap) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = Vec::with_capacity(start_line.len() + 32 * headers.len() + 4);
    head.extend_from_slice(start_line.as_bytes());
    head.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    writer.write_all(&head).await
}
