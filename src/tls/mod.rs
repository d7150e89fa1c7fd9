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

//! Certificate authority, leaf cache, and client-facing TLS termination.

pub mod cert;
pub mod handshake;
pub mod keystream;
pub mod leaf_cache;
pub mod signer;

pub use cert::{caroot, issue_leaf, normalize_sni, CertificateAuthority, LeafCertificate, RootCredential};
pub use handshake::{terminate, TerminatedTls};
pub use keystream::KeyStream;
pub use leaf_cache::{CacheMetrics, LeafCertificateCache};
pub use signer::KeyAlgorithm;
