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

use std::{sync::Weak, time::Duration};

use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use super::ResolutionCache;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Background task that sweeps expired entries and, when configured, refreshes the rest.
///
/// It holds only a weak reference to the cache, so dropping the last `Arc` ends the task
/// at its next tick. Dropping the `Janitor` itself closes the stop channel.
pub(crate) struct Janitor {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Janitor {
    pub(crate) fn spawn(
        cache: Weak<ResolutionCache>,
        sweep_every: Duration,
        refresh_every: Option<Duration>,
    ) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut sweep = interval(sweep_every.max(MIN_SWEEP_INTERVAL));
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Far-future period when refresh is off keeps the select! arms uniform.
            let mut refresh = interval(refresh_every.unwrap_or(Duration::from_secs(86_400 * 365)));
            refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
            sweep.tick().await;
            refresh.tick().await;

            tracing::debug!(target: "dns", ?sweep_every, ?refresh_every, "resolver janitor started");
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = sweep.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        cache.sweep_expired();
                    }
                    _ = refresh.tick(), if refresh_every.is_some() => {
                        let Some(cache) = cache.upgrade() else { break };
                        // Stop wins over an in-flight refresh.
                        tokio::select! {
                            _ = &mut stopped => break,
                            _ = cache.refresh() => {}
                        }
                    }
                }
            }
            tracing::debug!(target: "dns", "resolver janitor stopped");
        });

        Self { stop, handle }
    }

    /// Signals the task without waiting for it.
    pub(crate) fn stop(self) {
        let _ = self.stop.send(());
    }

    pub(crate) async fn join(self) {
        let _ = self.stop.send(());
        if let Err(err) = self.handle.await {
            tracing::warn!(target: "dns", error = %err, "resolver janitor task failed");
        }
    }
}
