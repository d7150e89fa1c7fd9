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

use anyhow::{Context, Result};

use crate::{
    config::HttpCtlConfig,
    executor::ExecutorSet,
    proxy::{ProtocolForwarder, ProxyContext, ProxyServer},
    resolver::ResolutionCache,
    telemetry::TelemetrySink,
    tls::CertificateAuthority,
};

/// Wires configuration, the root CA, the resolver, and the forwarder into a running
/// proxy.
///
/// Startup is fail-fast: a missing or unreadable root, or a listener that cannot bind,
/// aborts construction instead of leaving a half-working proxy behind.
pub struct App {
    server: ProxyServer,
    resolver: Arc<ResolutionCache>,
}

impl App {
    pub async fn new(config: HttpCtlConfig) -> Result<Self> {
        let telemetry = TelemetrySink::new(config.telemetry.clone());

        let ca = CertificateAuthority::from_config(&config.tls)
            .context("failed to load the root CA; run `mkcert -install` or set CAROOT")?;
        tracing::info!(subject = ca.root().subject(), "root CA loaded");

        let resolver = Arc::new(ResolutionCache::from_config(&config.resolver));
        resolver.start_janitor();

        let executors = ExecutorSet::from_config(&config.executor);
        tracing::info!(executors = ?executors.names(), "executors enabled");

        let forwarder = ProtocolForwarder::new(&config.upstream, resolver.clone(), executors, telemetry)
            .context("failed to build origin transports")?;

        let ctx = ProxyContext {
            ca: Arc::new(ca),
            forwarder: Arc::new(forwarder),
        };
        let server = ProxyServer::bind(&config.listener, ctx).await?;

        Ok(Self { server, resolver })
    }

    /// Bound `(http, https)` listener addresses.
    pub fn local_addrs(&self) -> Result<(SocketAddr, SocketAddr)> {
        self.server.local_addrs()
    }

    /// Serves until Ctrl+C, then stops the resolver janitor.
    pub async fn run(self) -> Result<()> {
        let shutdown = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for ctrl-c: {err}");
                std::future::pending::<()>().await;
            }
        };
        let served = self.server.serve(shutdown).await;
        self.resolver.shutdown().await;
        served
    }
}
