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

//! httpctl: an intercepting HTTP/HTTPS proxy.
//!
//! TLS is terminated with leaves minted on demand from a local root, requests are
//! forwarded over HTTP/1.1, HTTP/2 or HTTP/3, and executors observe decoded bodies.

pub mod app;
pub mod cache;
pub mod config;
pub mod executor;
pub mod proxy;
pub mod resolver;
pub mod telemetry;
pub mod tls;
pub mod utils;
