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
    collections::HashMap,
    io::{self, Write},
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use http::{header, HeaderMap, HeaderValue, Method, Response, StatusCode, Uri, Version};
use httpctl::config::{ListenerConfig, ResolverConfig, TelemetryConfig, TlsConfig, UpstreamConfig};
use httpctl::executor::{BodySink, Executor, ExecutorSet, RequestMeta, ResponseMeta};
use httpctl::proxy::respond::H1ResponseWriter;
use httpctl::proxy::{FlowState, ForwardRequest, ProtocolForwarder, ProxyContext, ProxyServer, Scheme};
use httpctl::resolver::ResolutionCache;
use httpctl::telemetry::TelemetrySink;
use httpctl::tls::CertificateAuthority;
use parking_lot::Mutex;
use rustls::{
    crypto::aws_lc_rs,
    pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
    RootCertStore,
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const PAGE: &str = "<html><body>hello from the origin</body></html>";

#[derive(Clone, Default)]
struct Captured {
    body: Arc<Mutex<Vec<u8>>>,
    finished: Arc<AtomicBool>,
}

struct CaptureExecutor(Captured);

struct CaptureSink(Captured);

impl Executor for CaptureExecutor {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn open(&self, _req: &RequestMeta, _res: &ResponseMeta) -> Option<Box<dyn BodySink>> {
        Some(Box::new(CaptureSink(self.0.clone())))
    }
}

impl BodySink for CaptureSink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.0.body.lock().extend_from_slice(chunk);
        Ok(())
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

async fn read_head<S: AsyncRead + Unpin>(socket: &mut S) -> String {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.expect("read request");
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
    }
    String::from_utf8_lossy(&request).into_owned()
}

async fn answer<S: AsyncRead + AsyncWrite + Unpin>(mut socket: S, response: &[u8]) -> String {
    let request = read_head(&mut socket).await;
    socket.write_all(response).await.expect("write response");
    let _ = socket.shutdown().await;
    request
}

/// Serves exactly one connection: reads the request head, answers with `response`, and
/// hands back what the proxy sent.
async fn spawn_origin(response: Vec<u8>) -> (SocketAddr, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");
    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept");
        answer(socket, &response).await
    });
    (addr, handle)
}

fn pinned_resolver() -> Arc<ResolutionCache> {
    let cfg = ResolverConfig {
        nameservers: Vec::new(),
        hosts: HashMap::from([("origin.test".to_string(), vec![Ipv4Addr::LOCALHOST])]),
        ..ResolverConfig::default()
    };
    Arc::new(ResolutionCache::from_config(&cfg))
}

fn upstream() -> UpstreamConfig {
    UpstreamConfig {
        http3: false,
        ..UpstreamConfig::default()
    }
}

fn forwarder(executors: ExecutorSet) -> ProtocolForwarder {
    ProtocolForwarder::new(
        &upstream(),
        pinned_resolver(),
        executors,
        TelemetrySink::new(TelemetryConfig::default()),
    )
    .expect("forwarder")
}

/// Forwarder that trusts only `ca`, for origins serving leaves it issued.
fn trusting_forwarder(ca: &CertificateAuthority) -> ProtocolForwarder {
    ProtocolForwarder::with_roots(
        &upstream(),
        pinned_resolver(),
        ExecutorSet::default(),
        TelemetrySink::new(TelemetryConfig::default()),
        trust(ca),
    )
    .expect("forwarder")
}

fn trust(ca: &CertificateAuthority) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add(ca.root().certificate().clone()).expect("trust root");
    roots
}

fn plain_request(uri: &str) -> ForwardRequest {
    request(uri, Scheme::Http)
}

fn request(uri: &str, scheme: Scheme) -> ForwardRequest {
    let uri: Uri = uri.parse().expect("uri");
    let mut headers = HeaderMap::new();
    if let Some(authority) = uri.authority() {
        headers.insert(
            header::HOST,
            HeaderValue::from_str(authority.as_str()).expect("host header"),
        );
    }
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    ForwardRequest::new(
        Method::GET,
        uri,
        headers,
        scheme,
        "127.0.0.1:50000".parse().expect("peer"),
    )
}

#[tokio::test]
async fn client_gets_raw_bytes_while_executors_get_decoded_body() {
    let compressed = gzip(PAGE.as_bytes());
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
        compressed.len()
    )
    .into_bytes();
    response.extend_from_slice(&compressed);
    let (origin, origin_task) = spawn_origin(response).await;

    let captured = Captured::default();
    let mut executors = ExecutorSet::default();
    executors.push(Arc::new(CaptureExecutor(captured.clone())));
    let forwarder = forwarder(executors);

    let req = plain_request(&format!("http://origin.test:{}/page?x=1", origin.port()));
    let mut out = Vec::new();
    let record = {
        let mut writer = H1ResponseWriter::new(&mut out, Version::HTTP_11, false, true);
        forwarder.handle(req, &mut writer).await
    };

    assert_eq!(record.state, FlowState::Complete);
    assert_eq!(record.status, Some(StatusCode::OK));
    assert_eq!(record.transport, Some("http/1.1"));
    assert_eq!(record.response_bytes, compressed.len() as u64);

    let head_end = out
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head")
        + 4;
    let head = String::from_utf8_lossy(&out[..head_end]).to_ascii_lowercase();
    assert!(head.starts_with("http/1.1 200 ok\r\n"));
    assert!(head.contains("content-encoding: gzip\r\n"));
    assert_eq!(&out[head_end..], &compressed[..]);

    assert_eq!(captured.body.lock().as_slice(), PAGE.as_bytes());
    assert!(captured.finished.load(Ordering::SeqCst));

    let sent = origin_task.await.expect("origin task");
    assert!(sent.starts_with("GET /page?x=1 HTTP/1.1\r\n"), "origin saw: {sent}");
    assert!(sent.to_ascii_lowercase().contains(&format!("host: origin.test:{}\r\n", origin.port())));
}

#[tokio::test]
async fn refused_dial_becomes_502() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let forwarder = forwarder(ExecutorSet::default());

    let mut out = Vec::new();
    let record = {
        let mut writer = H1ResponseWriter::new(&mut out, Version::HTTP_11, false, true);
        forwarder
            .handle(plain_request(&format!("http://origin.test:{closed}/")), &mut writer)
            .await
    };

    assert_eq!(record.state, FlowState::Failed);
    assert_eq!(record.status, Some(StatusCode::BAD_GATEWAY));
    assert!(record.error.as_deref().is_some_and(|e| e.contains("failed to dial")));
    assert!(String::from_utf8_lossy(&out).starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
}

#[tokio::test]
async fn unresolvable_host_becomes_502() {
    let forwarder = forwarder(ExecutorSet::default());

    let mut out = Vec::new();
    let record = {
        let mut writer = H1ResponseWriter::new(&mut out, Version::HTTP_11, false, true);
        forwarder
            .handle(plain_request("http://nowhere.test/"), &mut writer)
            .await
    };

    assert_eq!(record.state, FlowState::Failed);
    assert_eq!(record.transport, None);
    assert!(String::from_utf8_lossy(&out).starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
}

fn write_root(dir: &Path) {
    let mut params = rcgen::CertificateParams::new(Vec::new());
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "httpctl test root");
    let root = rcgen::Certificate::from_params(params).expect("root");
    std::fs::write(dir.join("rootCA.pem"), root.serialize_pem().expect("pem")).expect("write cert");
    std::fs::write(dir.join("rootCA-key.pem"), root.serialize_private_key_pem()).expect("write key");
}

fn test_ca() -> (TempDir, CertificateAuthority) {
    let caroot = tempfile::tempdir().expect("tempdir");
    write_root(caroot.path());
    let ca = CertificateAuthority::from_config(&TlsConfig {
        caroot: Some(caroot.path().to_path_buf()),
        ..TlsConfig::default()
    })
    .expect("ca");
    (caroot, ca)
}

/// TLS acceptor for an origin named `origin.test`, signed by `ca`. An empty `alpn` list
/// makes the origin ignore whatever the client offers.
async fn origin_acceptor(ca: &CertificateAuthority, alpn: &[&[u8]]) -> TlsAcceptor {
    let leaf = ca.get_certificate("origin.test").await.expect("origin leaf");
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der.clone()));
    let mut cfg = rustls::ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("versions")
        .with_no_client_auth()
        .with_single_cert(leaf.chain.clone(), key)
        .expect("origin certificate");
    cfg.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
    TlsAcceptor::from(Arc::new(cfg))
}

struct RunningProxy {
    http_addr: SocketAddr,
    stop_tx: oneshot::Sender<()>,
    serving: JoinHandle<anyhow::Result<()>>,
    _caroot: TempDir,
}

impl RunningProxy {
    async fn start(forwarder: ProtocolForwarder) -> (Self, Arc<CertificateAuthority>) {
        let (caroot, ca) = test_ca();
        let ca = Arc::new(ca);
        let ctx = ProxyContext {
            ca: ca.clone(),
            forwarder: Arc::new(forwarder),
        };
        let listeners = ListenerConfig {
            http_address: "127.0.0.1:0".into(),
            https_address: "127.0.0.1:0".into(),
        };
        let server = ProxyServer::bind(&listeners, ctx).await.expect("bind proxy");
        let (http_addr, _) = server.local_addrs().expect("addrs");
        let (stop, stopped) = oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve(async {
            let _ = stopped.await;
        }));
        let proxy = Self {
            http_addr,
            stop_tx: stop,
            serving,
            _caroot: caroot,
        };
        (proxy, ca)
    }

    async fn stop(self) {
        self.stop_tx.send(()).expect("stop server");
        self.serving.await.expect("join").expect("serve");
    }
}

#[tokio::test]
async fn absolute_form_request_through_the_http_listener() {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        PAGE.len(),
        PAGE
    );
    let (origin, _origin_task) = spawn_origin(response.into_bytes()).await;
    let (proxy, _ca) = RunningProxy::start(forwarder(ExecutorSet::default())).await;

    let mut client = TcpStream::connect(proxy.http_addr).await.expect("connect proxy");
    let request = format!(
        "GET http://origin.test:{port}/hello HTTP/1.1\r\nHost: origin.test:{port}\r\nConnection: close\r\n\r\n",
        port = origin.port()
    );
    client.write_all(request.as_bytes()).await.expect("send request");
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.expect("read reply");

    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "proxy replied: {reply}");
    assert!(reply.contains("connection: close\r\n"));
    assert!(reply.ends_with(PAGE));

    proxy.stop().await;
}

#[tokio::test]
async fn client_hangup_aborts_the_origin_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin = listener.local_addr().expect("origin addr");
    let (got_request, request_seen) = oneshot::channel::<()>();
    let origin_task = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        read_head(&mut socket).await;
        let _ = got_request.send(());
        // Never answer; the proxy should give up once its client is gone.
        let mut buf = [0u8; 64];
        timeout(Duration::from_secs(10), socket.read(&mut buf)).await
    });

    let (proxy, _ca) = RunningProxy::start(forwarder(ExecutorSet::default())).await;
    let mut client = TcpStream::connect(proxy.http_addr).await.expect("connect proxy");
    let request = format!(
        "GET http://origin.test:{port}/slow HTTP/1.1\r\nHost: origin.test:{port}\r\n\r\n",
        port = origin.port()
    );
    client.write_all(request.as_bytes()).await.expect("send request");
    request_seen.await.expect("origin saw the request");
    drop(client);

    let read = origin_task
        .await
        .expect("origin task")
        .expect("origin connection closed before its read timeout");
    assert!(matches!(read, Ok(0) | Err(_)), "origin should see the proxy hang up");

    proxy.stop().await;
}

#[tokio::test]
async fn connect_to_an_ip_literal_gets_a_leaf_for_that_ip() {
    let (proxy, ca) = RunningProxy::start(forwarder(ExecutorSet::default())).await;

    let mut client = TcpStream::connect(proxy.http_addr).await.expect("connect proxy");
    client
        .write_all(b"CONNECT 127.0.0.1:443 HTTP/1.1\r\nHost: 127.0.0.1:443\r\n\r\n")
        .await
        .expect("send CONNECT");
    let established = read_head(&mut client).await;
    assert!(established.starts_with("HTTP/1.1 200"), "proxy replied: {established}");

    let client_cfg = rustls::ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("versions")
        .with_root_certificates(trust(&ca))
        .with_no_client_auth();
    let name = ServerName::try_from("127.0.0.1").expect("ip server name");
    let tls = TlsConnector::from(Arc::new(client_cfg))
        .connect(name, client)
        .await
        .expect("client accepts the leaf for 127.0.0.1");
    drop(tls);

    let leaf = ca.get_certificate("127.0.0.1").await.expect("cached leaf");
    assert_eq!(leaf.host, "127.0.0.1");
    assert_eq!(ca.cached_leaves(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn h2_client_requests_reach_an_h2_origin() {
    let (_caroot, ca) = test_ca();
    let acceptor = origin_acceptor(&ca, &[b"h2"]).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin = listener.local_addr().expect("origin addr");
    let (seen_tx, seen_rx) = oneshot::channel::<(Version, String)>();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept");
        let tls = acceptor.accept(socket).await.expect("origin handshake");
        let mut conn = h2::server::handshake(tls).await.expect("h2 handshake");
        let (request, mut respond) = conn.accept().await.expect("stream").expect("request");
        let _ = seen_tx.send((request.version(), request.uri().path().to_string()));
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html")
            .body(())
            .expect("response");
        let mut send = respond.send_response(response, false).expect("send head");
        send.send_data(Bytes::from_static(PAGE.as_bytes()), true)
            .expect("send body");
        while let Some(Ok(_)) = conn.accept().await {}
    });

    let forwarder = trusting_forwarder(&ca);
    let mut req = request(&format!("https://origin.test:{}/secure", origin.port()), Scheme::Https);
    req.client_alpn = Some(b"h2".to_vec());

    let mut out = Vec::new();
    let record = {
        let mut writer = H1ResponseWriter::new(&mut out, Version::HTTP_11, false, true);
        forwarder.handle(req, &mut writer).await
    };

    assert_eq!(record.state, FlowState::Complete, "error: {:?}", record.error);
    assert_eq!(record.transport, Some("h2"));
    assert_eq!(record.status, Some(StatusCode::OK));
    let (version, path) = seen_rx.await.expect("origin saw the request");
    assert_eq!(version, Version::HTTP_2);
    assert_eq!(path, "/secure");

    let out = String::from_utf8_lossy(&out);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains(PAGE));
}

#[tokio::test]
async fn origin_declining_h2_is_spoken_to_in_http1() {
    let (_caroot, ca) = test_ca();
    let acceptor = origin_acceptor(&ca, &[]).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin = listener.local_addr().expect("origin addr");
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
        PAGE.len(),
        PAGE
    );
    let origin_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept");
        let tls = acceptor.accept(socket).await.expect("origin handshake");
        answer(tls, response.as_bytes()).await
    });

    let forwarder = trusting_forwarder(&ca);
    let mut req = request(&format!("https://origin.test:{}/secure", origin.port()), Scheme::Https);
    req.client_alpn = Some(b"h2".to_vec());

    let mut out = Vec::new();
    let record = {
        let mut writer = H1ResponseWriter::new(&mut out, Version::HTTP_11, false, true);
        forwarder.handle(req, &mut writer).await
    };

    assert_eq!(record.state, FlowState::Complete, "error: {:?}", record.error);
    assert_eq!(record.transport, Some("http/1.1"));
    let sent = origin_task.await.expect("origin task");
    assert!(sent.starts_with("GET /secure HTTP/1.1\r\n"), "origin saw: {sent}");
    assert!(String::from_utf8_lossy(&out).ends_with(PAGE));
}
