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
    io::{self, Write},
    ops::{Deref, DerefMut},
    sync::Arc,
};

use flate2::write::{GzDecoder, ZlibDecoder};
use http::{header::CONTENT_ENCODING, HeaderMap};
use parking_lot::Mutex;

use crate::executor::BodySink;

pub const POOLED_BUFFER_SIZE: usize = 16 * 1024;
const POOL_MAX_IDLE: usize = 256;
const BROTLI_BUFFER_SIZE: usize = 4096;

/// `Content-Encoding` values the sink path can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl ContentEncoding {
    /// Reads the response's encoding; `Err` carries the unsupported token.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, String> {
        let Some(value) = headers.get(CONTENT_ENCODING) else {
            return Ok(ContentEncoding::Identity);
        };
        let raw = value
            .to_str()
            .map_err(|_| "non-ascii content-encoding".to_string())?
            .trim()
            .to_ascii_lowercase();
        match raw.as_str() {
            "" | "identity" => Ok(ContentEncoding::Identity),
            "gzip" | "x-gzip" => Ok(ContentEncoding::Gzip),
            "deflate" => Ok(ContentEncoding::Deflate),
            "br" => Ok(ContentEncoding::Brotli),
            _ => Err(raw),
        }
    }
}

/// Writes every chunk to all sinks; a sink that fails is dropped and the rest continue.
pub struct FanOut {
    sinks: Vec<Box<dyn BodySink>>,
    written: u64,
}

impl FanOut {
    pub fn new(sinks: Vec<Box<dyn BodySink>>) -> Self {
        Self { sinks, written: 0 }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn finish(self) -> u64 {
        for sink in self.sinks {
            if let Err(err) = sink.finish() {
                tracing::warn!(target: "executor", error = %err, "body sink failed to finish");
            }
        }
        self.written
    }
}

impl Write for FanOut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sinks.retain_mut(|sink| match sink.write(buf) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(target: "executor", error = %err, "body sink failed; detaching it");
                false
            }
        });
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum ContentDecoder {
    Identity(FanOut),
    Gzip(GzDecoder<FanOut>),
    Deflate(ZlibDecoder<FanOut>),
    Brotli(Box<brotli::DecompressorWriter<FanOut>>),
}

impl ContentDecoder {
    fn new(encoding: ContentEncoding, out: FanOut) -> Self {
        match encoding {
            ContentEncoding::Identity => ContentDecoder::Identity(out),
            ContentEncoding::Gzip => ContentDecoder::Gzip(GzDecoder::new(out)),
            ContentEncoding::Deflate => ContentDecoder::Deflate(ZlibDecoder::new(out)),
            ContentEncoding::Brotli => ContentDecoder::Brotli(Box::new(
                brotli::DecompressorWriter::new(out, BROTLI_BUFFER_SIZE),
            )),
        }
    }

    fn write_all(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            ContentDecoder::Identity(out) => out.write_all(chunk),
            ContentDecoder::Gzip(dec) => dec.write_all(chunk),
            ContentDecoder::Deflate(dec) => dec.write_all(chunk),
            ContentDecoder::Brotli(dec) => dec.write_all(chunk),
        }
    }

    fn finish(self) -> io::Result<FanOut> {
        match self {
            ContentDecoder::Identity(out) => Ok(out),
            ContentDecoder::Gzip(dec) => dec.finish(),
            ContentDecoder::Deflate(dec) => dec.finish(),
            ContentDecoder::Brotli(dec) => dec.into_inner().map_err(|_| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "truncated brotli stream")
            }),
        }
    }
}

/// Decoded side-channel of a response body.
///
/// The raw bytes go to the client elsewhere; this only feeds sinks. Any decode error
/// detaches every sink for the rest of the body without touching the client path.
pub struct SinkTee {
    decoder: Option<ContentDecoder>,
}

impl SinkTee {
    pub fn new(headers: &HeaderMap, sinks: Vec<Box<dyn BodySink>>) -> Self {
        if sinks.is_empty() {
            return Self::disabled();
        }
        match ContentEncoding::from_headers(headers) {
            Ok(encoding) => Self {
                decoder: Some(ContentDecoder::new(encoding, FanOut::new(sinks))),
            },
            Err(encoding) => {
                tracing::debug!(target: "executor", %encoding, "unsupported content-encoding; sinks skipped");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self { decoder: None }
    }

    pub fn is_active(&self) -> bool {
        self.decoder.is_some()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };
        if let Err(err) = decoder.write_all(chunk) {
            tracing::warn!(target: "executor", error = %err, "response body failed to decode; sinks detached");
            self.decoder = None;
        }
    }

    /// Flushes the decoder and finishes every sink; returns the decoded byte count.
    pub fn finish(self) -> Option<u64> {
        let decoder = self.decoder?;
        match decoder.finish() {
            Ok(out) => Some(out.finish()),
            Err(err) => {
                tracing::warn!(target: "executor", error = %err, "response body ended mid-stream; sinks detached");
                None
            }
        }
    }
}

/// Free list of fixed-size read buffers shared by all flows.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
    max_idle: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(POOLED_BUFFER_SIZE, POOL_MAX_IDLE)
    }
}

impl BufferPool {
    pub fn new(buf_size: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                buf_size,
                max_idle,
            }),
        }
    }

    pub fn acquire(&self) -> PooledBuffer {
        let buf = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buf_size]);
        PooledBuffer {
            buf,
            pool: self.inner.clone(),
        }
    }

    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// Buffer on loan from a [`BufferPool`]; returned on drop.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        let mut free = self.pool.free.lock();
        if free.len() < self.pool.max_idle {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use http::HeaderValue;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<(Vec<u8>, bool)>>);

    impl BodySink for Capture {
        fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
            self.0.lock().0.extend_from_slice(chunk);
            Ok(())
        }

        fn finish(self: Box<Self>) -> io::Result<()> {
            self.0.lock().1 = true;
            Ok(())
        }
    }

    struct Broken;

    impl BodySink for Broken {
        fn write(&mut self, _chunk: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    fn headers(encoding: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
        headers
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).expect("gzip write");
        enc.finish().expect("gzip finish")
    }

    #[test]
    fn gzip_is_decoded_across_chunk_boundaries() {
        let encoded = gzip(b"hello sinks, hello sinks");
        let capture = Capture::default();
        let mut tee = SinkTee::new(&headers("gzip"), vec![Box::new(capture.clone())]);
        for piece in encoded.chunks(3) {
            tee.feed(piece);
        }
        assert_eq!(tee.finish(), Some(24));
        let (data, finished) = capture.0.lock().clone();
        assert_eq!(data, b"hello sinks, hello sinks");
        assert!(finished);
    }

    #[test]
    fn brotli_is_decoded() {
        let mut encoded = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut encoded, 4096, 5, 22);
            writer.write_all(b"brotli body").expect("brotli write");
        }
        let capture = Capture::default();
        let mut tee = SinkTee::new(&headers("br"), vec![Box::new(capture.clone())]);
        tee.feed(&encoded);
        tee.finish();
        assert_eq!(capture.0.lock().0, b"brotli body");
    }

    #[test]
    fn corrupt_input_detaches_sinks_without_finishing_them() {
        let capture = Capture::default();
        let mut tee = SinkTee::new(&headers("gzip"), vec![Box::new(capture.clone())]);
        tee.feed(b"definitely not gzip");
        assert!(!tee.is_active());
        assert_eq!(tee.finish(), None);
        assert!(!capture.0.lock().1);
    }

    #[test]
    fn unknown_encoding_disables_the_tee() {
        let tee = SinkTee::new(&headers("zstd"), vec![Box::new(Capture::default())]);
        assert!(!tee.is_active());
    }

    #[test]
    fn failing_sink_does_not_starve_the_others() {
        let capture = Capture::default();
        let mut tee = SinkTee::new(
            &HeaderMap::new(),
            vec![Box::new(Broken), Box::new(capture.clone())],
        );
        tee.feed(b"plain");
        tee.finish();
        assert_eq!(capture.0.lock().0, b"plain");
    }

    #[test]
    fn pooled_buffers_return_on_drop() {
        let pool = BufferPool::new(8, 1);
        {
            let mut a = pool.acquire();
            let _b = pool.acquire();
            a[0] = 1;
            assert_eq!(a.len(), 8);
        }
        assert_eq!(pool.idle(), 1, "idle list is capped");
        let _again = pool.acquire();
        assert_eq!(pool.idle(), 0);
    }
}
