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

use rustls::{
    crypto::aws_lc_rs,
    server::{Acceptor, ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{server::TlsStream, LazyConfigAcceptor};

use crate::utils::{ProxyError, ProxyResult};

use super::cert::CertificateAuthority;

pub const CLIENT_ALPN: &[&[u8]] = &[b"h2", b"http/1.1"];

/// Outcome of terminating a client's TLS session.
pub struct TerminatedTls<S> {
    pub stream: TlsStream<S>,
    pub sni: Option<String>,
    pub alpn: Option<Vec<u8>>,
}

impl<S> TerminatedTls<S> {
    pub fn negotiated_h2(&self) -> bool {
        self.alpn.as_deref() == Some(&b"h2"[..])
    }
}

/// Reads the ClientHello, asks the CA for a leaf matching its SNI, then finishes the
/// handshake with that leaf.
///
/// Clients leave SNI out when they dial an IP literal, so `fallback_host` (usually the
/// CONNECT target, port included or not) names the leaf in that case.
///
/// Issuance happens between the two steps on the async side, so a slow RSA keygen parks
/// this task instead of blocking a rustls callback.
pub async fn terminate<S>(
    ca: &CertificateAuthority,
    io: S,
    fallback_host: Option<&str>,
) -> ProxyResult<TerminatedTls<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = LazyConfigAcceptor::new(Acceptor::default(), io)
        .await
        .map_err(|err| ProxyError::TlsHandshake(format!("failed to read ClientHello: {err}")))?;

    let sni = start.client_hello().server_name().map(str::to_owned);
    let requested = sni.as_deref().or(fallback_host).unwrap_or_default();
    let leaf = ca.get_certificate(requested).await?;
    tracing::trace!(sni = sni.as_deref().unwrap_or("<none>"), host = %leaf.host, "serving leaf");

    let config = server_config(leaf.certified.clone())?;
    let stream = start
        .into_stream(Arc::new(config))
        .await
        .map_err(|err| ProxyError::TlsHandshake(err.to_string()))?;
    let alpn = stream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);

    Ok(TerminatedTls { stream, sni, alpn })
}

fn server_config(certified: Arc<CertifiedKey>) -> ProxyResult<ServerConfig> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|err| ProxyError::TlsHandshake(err.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(IssuedLeaf(certified)));
    config.alpn_protocols = CLIENT_ALPN.iter().map(|proto| proto.to_vec()).collect();
    Ok(config)
}

/// Serves the single leaf already issued for this connection.
#[derive(Debug)]
struct IssuedLeaf(Arc<CertifiedKey>);

impl ResolvesServerCert for IssuedLeaf {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}
