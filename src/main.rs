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

use std::path::PathBuf;

use clap::Parser;
use httpctl::{app::App, config::HttpCtlConfig, utils::init_tracing};

/// Only the config path and log format are flags; everything else lives in TOML.
#[derive(Debug, Parser)]
#[command(
    name = "httpctl",
    version,
    about = "Intercepting HTTP/HTTPS proxy with on-demand certificates"
)]
struct Cli {
    /// Path to the httpctl configuration file (TOML).
    #[arg(
        short,
        long,
        env = "HTTPCTL_CONFIG",
        default_value = "config/httpctl.example.toml"
    )]
    config: PathBuf,

    /// Emit JSON-formatted logs instead of compact text.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = HttpCtlConfig::load(&cli.config)?;
    let app = App::new(config).await?;
    app.run().await
}
