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

use std::io;

use super::{BodySink, Executor, RequestMeta, ResponseMeta};

/// Logs every response it sees and counts the decoded bytes.
#[derive(Debug, Default)]
pub struct ExampleExecutor;

impl ExampleExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for ExampleExecutor {
    fn name(&self) -> &'static str {
        "example"
    }

    fn open(&self, req: &RequestMeta, res: &ResponseMeta) -> Option<Box<dyn BodySink>> {
        tracing::debug!(target: "executor", host = %req.host, uri = %req.request_uri, status = %res.status, "example executor saw response");
        Some(Box::new(CountingSink {
            label: format!("{}{}", req.host, req.request_uri),
            bytes: 0,
        }))
    }
}

struct CountingSink {
    label: String,
    bytes: u64,
}

impl BodySink for CountingSink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        tracing::debug!(target: "executor", resource = %self.label, decoded_bytes = self.bytes, "example executor finished");
        Ok(())
    }
}
