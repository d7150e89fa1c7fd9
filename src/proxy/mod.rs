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

//! Client-facing listeners and the forwarding path to origins.

pub mod alt_svc;
pub mod body;
pub mod client;
pub mod connection;
pub mod flow;
pub mod forwarder;
pub mod headers;
pub mod respond;
pub mod server;
pub mod transport;
pub mod wire;

pub use connection::{handle_connection, ListenerKind, ProxyContext};
pub use flow::{FlowRecord, FlowState, ForwardRequest, Scheme};
pub use forwarder::ProtocolForwarder;
pub use server::ProxyServer;
