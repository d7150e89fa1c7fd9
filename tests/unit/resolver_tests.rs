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
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use httpctl::cache::SystemClock;
use httpctl::config::ResolverConfig;
use httpctl::resolver::{Answer, DnsExchange, ResolutionCache};
use httpctl::utils::ResolutionError;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Answers every A query with a fixed address after `delay`, failing for nameservers
/// listed in `broken`.
#[derive(Default)]
struct CountingExchange {
    queries: AtomicUsize,
    delay: Duration,
    broken: Vec<SocketAddr>,
    asked: Mutex<Vec<SocketAddr>>,
}

#[async_trait]
impl DnsExchange for CountingExchange {
    async fn query_a(&self, nameserver: SocketAddr, host: &str) -> Result<Vec<Answer>, ResolutionError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.asked.lock().push(nameserver);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.broken.contains(&nameserver) {
            return Err(ResolutionError::Exchange {
                nameserver: nameserver.to_string(),
                reason: format!("connection refused while asking for {host}"),
            });
        }
        Ok(vec![Answer::A(Ipv4Addr::new(93, 184, 216, 34))])
    }
}

fn config(nameservers: &[&str], ttl_secs: u64) -> ResolverConfig {
    ResolverConfig {
        nameservers: nameservers.iter().map(|ns| ns.to_string()).collect(),
        ttl_secs,
        ..ResolverConfig::default()
    }
}

fn cache(cfg: &ResolverConfig, exchange: Arc<CountingExchange>) -> Arc<ResolutionCache> {
    Arc::new(ResolutionCache::new(cfg, exchange, Arc::new(SystemClock)))
}

fn in_a_while() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

#[tokio::test]
async fn cached_answers_skip_the_network() {
    let exchange = Arc::new(CountingExchange::default());
    let cache = cache(&config(&["10.0.0.53"], 600), exchange.clone());

    let first = cache.lookup("Example.com.", in_a_while()).await.expect("resolved");
    let second = cache.lookup("example.com", in_a_while()).await.expect("cached");

    assert_eq!(first, vec![Ipv4Addr::new(93, 184, 216, 34)]);
    assert_eq!(first, second);
    assert_eq!(exchange.queries.load(Ordering::SeqCst), 1);

    let entry = cache.entry("example.com").expect("entry stored");
    assert_eq!(entry.nameserver, Some("10.0.0.53:53".parse().expect("addr")));
    assert!(entry.expires_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_share_one_query() {
    let exchange = Arc::new(CountingExchange {
        delay: Duration::from_millis(200),
        ..CountingExchange::default()
    });
    let cache = cache(&config(&["10.0.0.53"], 600), exchange.clone());

    let lookups: Vec<_> = (0..50)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.lookup("busy.example", in_a_while()).await })
        })
        .collect();
    for lookup in lookups {
        let ips = lookup.await.expect("join").expect("resolved");
        assert_eq!(ips, vec![Ipv4Addr::new(93, 184, 216, 34)]);
    }

    assert_eq!(exchange.queries.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn janitor_evicts_expired_entries() {
    let exchange = Arc::new(CountingExchange::default());
    let cache = cache(&config(&["10.0.0.53"], 2), exchange.clone());
    cache.start_janitor();

    cache.lookup("short.example", in_a_while()).await.expect("resolved");
    assert_eq!(cache.len(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    tokio::task::yield_now().await;
    assert!(cache.is_empty(), "janitor removed the expired entry");

    cache.lookup("short.example", in_a_while()).await.expect("re-resolved");
    assert_eq!(exchange.queries.load(Ordering::SeqCst), 2);
    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_nameserver_is_retried_elsewhere() {
    let broken: SocketAddr = "10.0.0.1:53".parse().expect("addr");
    let exchange = Arc::new(CountingExchange {
        broken: vec![broken],
        ..CountingExchange::default()
    });
    let cache = cache(&config(&["10.0.0.1", "10.0.0.2"], 600), exchange.clone());

    cache.lookup("retry.example", in_a_while()).await.expect("second nameserver answers");

    let asked = exchange.asked.lock().clone();
    assert!(asked.len() <= 2);
    assert_eq!(asked.last(), Some(&"10.0.0.2:53".parse().expect("addr")));
    assert_eq!(
        cache.entry("retry.example").and_then(|entry| entry.nameserver),
        Some("10.0.0.2:53".parse().expect("addr"))
    );
}

#[tokio::test(start_paused = true)]
async fn slow_nameserver_hits_the_caller_deadline() {
    let exchange = Arc::new(CountingExchange {
        delay: Duration::from_secs(60),
        ..CountingExchange::default()
    });
    let cache = cache(&config(&["10.0.0.53"], 600), exchange);

    let err = cache
        .lookup("slow.example", Instant::now() + Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, ResolutionError::Timeout(host) if host == "slow.example"));
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_does_not_wait_for_a_running_refresh() {
    let exchange = Arc::new(CountingExchange {
        delay: Duration::from_secs(5),
        ..CountingExchange::default()
    });
    let cfg = ResolverConfig {
        timeout_secs: 60,
        refresh_secs: 10,
        ..config(&["10.0.0.53"], 600)
    };
    let cache = cache(&cfg, exchange.clone());
    for host in ["a.example", "b.example", "c.example"] {
        cache.lookup(host, Instant::now() + Duration::from_secs(60)).await.expect("seeded");
    }
    assert_eq!(exchange.queries.load(Ordering::SeqCst), 3);

    cache.start_janitor();
    tokio::time::sleep(Duration::from_millis(10_100)).await;
    assert_eq!(exchange.queries.load(Ordering::SeqCst), 4, "refresh is mid-query");

    let started = Instant::now();
    cache.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(cache.len(), 3);
}
