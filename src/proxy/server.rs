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

use std::{future::Future, net::SocketAddr};

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::config::ListenerConfig;

use super::connection::{handle_connection, ListenerKind, ProxyContext};

/// Owns both listening sockets and spawns one task per accepted client.
///
/// Handler errors are logged and end only that connection. Accept errors are logged and
/// the loop keeps going.
pub struct ProxyServer {
    http: TcpListener,
    https: TcpListener,
    ctx: ProxyContext,
}

impl ProxyServer {
    /// Binds the plain and TLS listeners. Port 0 picks an ephemeral port.
    pub async fn bind(cfg: &ListenerConfig, ctx: ProxyContext) -> Result<Self> {
        let http = TcpListener::bind(&cfg.http_address)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {}", cfg.http_address))?;
        let https = TcpListener::bind(&cfg.https_address)
            .await
            .with_context(|| format!("failed to bind HTTPS listener on {}", cfg.https_address))?;
        Ok(Self { http, https, ctx })
    }

    /// Bound `(http, https)` addresses.
    pub fn local_addrs(&self) -> Result<(SocketAddr, SocketAddr)> {
        Ok((self.http.local_addr()?, self.https.local_addr()?))
    }

    /// Accepts until `shutdown` resolves. In-flight connections keep running on their own
    /// tasks.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (http_addr, https_addr) = self.local_addrs()?;
        tracing::info!(http = %http_addr, https = %https_addr, "httpctl listeners online");

        tokio::pin!(shutdown);
        loop {
            let (accepted, kind) = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("listeners shutting down");
                    return Ok(());
                }
                accepted = self.http.accept() => (accepted, ListenerKind::Http),
                accepted = self.https.accept() => (accepted, ListenerKind::Https),
            };

            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(?kind, "accept failed: {err}");
                    continue;
                }
            };
            let _ = socket.set_nodelay(true);
            tracing::debug!(%peer, ?kind, "accepted client");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(socket, peer, kind, ctx).await {
                    tracing::debug!(%peer, "client session ended with error: {err:#}");
                }
            });
        }
    }
}
