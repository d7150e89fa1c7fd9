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
use once_cell::sync::Lazy;
use rustls::{crypto::aws_lc_rs, pki_types::ServerName, ClientConfig, RootCertStore};
use tokio::{net::TcpStream, time::timeout};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::{config::UpstreamConfig, utils::ForwardError};

/// Mozilla's root program, loaded once per process.
pub static WEBPKI_ROOTS: Lazy<RootCertStore> = Lazy::new(|| {
    let mut store = RootCertStore::empty();
    store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    store
});

/// ALPN offer for an origin TLS dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpn {
    Http1,
    H2,
}

/// Opens TCP and TLS connections to origins.
///
/// Every resolved address is tried in order until one connects; each attempt is bounded
/// by the connect timeout, and the TLS handshake by the handshake timeout. Certificates
/// are verified against `roots` with the request's hostname as SNI, never the IP.
pub struct UpstreamDialer {
    connect_timeout: Duration,
    handshake_timeout: Duration,
    tls_http1: Arc<ClientConfig>,
    tls_h2: Arc<ClientConfig>,
}

impl UpstreamDialer {
    pub fn new(cfg: &UpstreamConfig, roots: RootCertStore) -> Result<Self> {
        Ok(Self {
            connect_timeout: cfg.connect_timeout(),
            handshake_timeout: cfg.handshake_timeout(),
            tls_http1: Arc::new(client_config(roots.clone(), &[b"http/1.1"])?),
            tls_h2: Arc::new(client_config(roots, &[b"h2"])?),
        })
    }

    pub async fn connect_tcp(
        &self,
        ips: &[Ipv4Addr],
        port: u16,
    ) -> Result<(TcpStream, SocketAddr), ForwardError> {
        let mut last_err: Option<String> = None;
        for ip in ips {
            let addr = SocketAddr::new(IpAddr::V4(*ip), port);
            tracing::debug!(%addr, "attempting upstream TCP connect");
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok((stream, addr));
                }
                Ok(Err(err)) => {
                    tracing::debug!(%addr, error = %err, "upstream TCP connect failed");
                    last_err = Some(err.to_string());
                }
                Err(_) => {
                    tracing::warn!(%addr, "upstream TCP connect timed out after {:?}", self.connect_timeout);
                    last_err = Some(format!("connect timed out after {:?}", self.connect_timeout));
                }
            }
        }

        let target = match ips.first() {
            Some(ip) => format!("{ip}:{port}"),
            None => format!("<no address>:{port}"),
        };
        Err(ForwardError::dial(
            target,
            last_err.unwrap_or_else(|| "no resolved addresses".to_string()),
        ))
    }

    pub async fn connect_tls(
        &self,
        host: &str,
        ips: &[Ipv4Addr],
        port: u16,
        alpn: Alpn,
    ) -> Result<(TlsStream<TcpStream>, SocketAddr), ForwardError> {
        let (stream, addr) = self.connect_tcp(ips, port).await?;
        let config = match alpn {
            Alpn::Http1 => self.tls_http1.clone(),
            Alpn::H2 => self.tls_h2.clone(),
        };
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|err| ForwardError::dial(format!("{host}:{port}"), err))?;

        let connector = TlsConnector::from(config);
        let tls = match timeout(self.handshake_timeout, connector.connect(server_name, stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(err)) => {
                return Err(ForwardError::dial(
                    format!("{host}:{port}"),
                    format!("TLS handshake failed: {err}"),
                ))
            }
            Err(_) => {
                return Err(ForwardError::dial(
                    format!("{host}:{port}"),
                    format!("TLS handshake timed out after {:?}", self.handshake_timeout),
                ))
            }
        };

        tracing::debug!(
            %host,
            peer = %addr,
            alpn = ?tls.get_ref().1.alpn_protocol().map(String::from_utf8_lossy),
            "upstream TLS handshake complete"
        );
        Ok((tls, addr))
    }
}

fn client_config(roots: RootCertStore, alpn: &[&[u8]]) -> Result<ClientConfig> {
    let mut cfg = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .context("crypto provider rejected default protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth();
    cfg.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
    Ok(cfg)
}
