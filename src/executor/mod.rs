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

//! Post-processors that receive decoded response bodies.
//!
//! Each executor decides per response whether it wants the body; when it does it hands
//! back a [`BodySink`] that the forwarder feeds with decoded bytes while the raw bytes go
//! to the client.

mod example;
mod sitecopy;

pub use example::ExampleExecutor;
pub use sitecopy::SiteCopyExecutor;

use std::{io, sync::Arc};

use http::{Method, StatusCode};

use crate::config::ExecutorConfig;

/// Request facts an executor may filter on.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub host: String,
    /// Path plus query as sent on the request line.
    pub request_uri: String,
    pub method: Method,
    pub user_agent: Option<String>,
    pub content_type: Option<String>,
    pub connection_close: bool,
    pub https: bool,
}

#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: StatusCode,
    pub content_type: Option<String>,
}

/// Consumer of one decoded response body.
pub trait BodySink: Send {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// End of stream; only called when every byte was decoded cleanly.
    fn finish(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns a sink when this executor wants the response body.
    fn open(&self, req: &RequestMeta, res: &ResponseMeta) -> Option<Box<dyn BodySink>>;
}

/// Ordered set of enabled executors, shared by every flow.
#[derive(Clone, Default)]
pub struct ExecutorSet {
    executors: Vec<Arc<dyn Executor>>,
}

impl ExecutorSet {
    pub fn from_config(cfg: &ExecutorConfig) -> Self {
        let mut set = Self::default();
        if cfg.example.enable {
            set.push(Arc::new(ExampleExecutor::new()));
        }
        if cfg.sitecopy.enable {
            set.push(Arc::new(SiteCopyExecutor::new(cfg.sitecopy.clone())));
        }
        tracing::debug!(executors = ?set.names(), "executors enabled");
        set
    }

    pub fn push(&mut self, executor: Arc<dyn Executor>) {
        self.executors.push(executor);
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.executors.iter().map(|e| e.name()).collect()
    }

    /// Asks every executor for a sink; executors that decline are skipped.
    pub fn open_all(&self, req: &RequestMeta, res: &ResponseMeta) -> Vec<Box<dyn BodySink>> {
        self.executors
            .iter()
            .filter_map(|executor| executor.open(req, res))
            .collect()
    }
}

impl std::fmt::Debug for ExecutorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
