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
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::RwLock;

use crate::cache::{Flights, Generator};

pub const DEFAULT_LEAF_CAPACITY: usize = 1024;

/// Hostname-keyed store of issued leaves with at-most-once generation per key.
///
/// Bounded by entry count with least-recently-used eviction. Hits only take the read
/// lock: recency lives in a per-entry atomic tick, so concurrent handshakes for cached
/// hosts never serialize on the writer.
#[derive(Debug)]
pub struct LeafCertificateCache<V> {
    capacity: usize,
    entries: RwLock<HashMap<String, Slot<V>>>,
    clock: AtomicU64,
    flights: Flights<V>,
    stats: CacheStats,
}

#[derive(Debug)]
struct Slot<V> {
    value: V,
    last_used: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> LeafCertificateCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            flights: Flights::new(),
            stats: CacheStats::default(),
        }
    }

    /// Returns the cached value for `key`, generating it on a miss.
    ///
    /// Concurrent misses on the same key share one `generate` call; misses on different
    /// keys run in parallel. A failed generation is never cached; a caller still parked on
    /// that flight makes its own attempt.
    pub async fn fetch<G>(&self, key: &str, generator: &G) -> Result<V, G::Error>
    where
        G: Generator<Value = V>,
    {
        if let Some(hit) = self.get(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        self.flights
            .run(key, || async {
                // A flight that finished between our miss and now already filled the slot.
                if let Some(hit) = self.get(key) {
                    return Ok::<V, G::Error>(hit);
                }
                let value = generator.generate(key).await?;
                self.stats.generated.fetch_add(1, Ordering::Relaxed);
                self.insert(key.to_string(), value.clone());
                Ok(value)
            })
            .await
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read();
        let slot = entries.get(key)?;
        slot.last_used.store(self.tick(), Ordering::Relaxed);
        Some(slot.value.clone())
    }

    pub fn insert(&self, key: String, value: V) {
        if self.capacity == 0 {
            return;
        }

        let mut entries = self.entries.write();
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let victim = entries
                .iter()
                .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
                .map(|(host, _)| host.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(host = %victim, "evicted least recently used leaf");
            }
        }

        entries.insert(
            key,
            Slot {
                value,
                last_used: AtomicU64::new(self.tick()),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.stats.snapshot()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub generated: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    generated: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            generated: self.generated.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
