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

//! Building blocks shared by the certificate and resolution caches.

pub mod clock;
pub mod single_flight;

use async_trait::async_trait;

pub use clock::{Clock, ManualClock, SystemClock};
pub use single_flight::Flights;

/// Produces the value for a cache key on a miss.
///
/// The generator owns whatever context it needs (root credential, timeouts), so a cache
/// never has to know what it is caching.
#[async_trait]
pub trait Generator: Send + Sync {
    type Value: Clone + Send + Sync + 'static;
    type Error: Send + 'static;

    async fn generate(&self, key: &str) -> Result<Self::Value, Self::Error>;
}
