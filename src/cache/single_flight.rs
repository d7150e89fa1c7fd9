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

use std::{collections::HashMap, future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

/// Per-key coordination so concurrent misses on one key share a single computation.
///
/// Callers for the same key wait on the same cell; callers for different keys never
/// block each other beyond the map lock, which is held only to look up or remove a cell.
/// A failed computation is not remembered: the cell stays empty and the next waiter runs
/// its own attempt.
#[derive(Debug)]
pub struct Flights<V> {
    inflight: Mutex<HashMap<String, Arc<OnceCell<V>>>>,
}

impl<V> Default for Flights<V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> Flights<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `init` for `key` unless an identical flight is already underway, in which case
    /// the caller waits for that flight's value.
    pub async fn run<F, Fut, E>(&self, key: &str, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut inflight = self.inflight.lock();
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell.get_or_try_init(init).await.cloned();

        // Only the cell we waited on is retired; a newer flight for the key stays put.
        let mut inflight = self.inflight.lock();
        if inflight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell))
        {
            inflight.remove(key);
        }

        result
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}
