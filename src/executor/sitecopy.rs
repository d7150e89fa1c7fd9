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
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use http::{Method, StatusCode};

use crate::config::SiteCopyExecutorConfig;

use super::{BodySink, Executor, RequestMeta, ResponseMeta};

const INDEX_FILE: &str = "index.html";

/// Mirrors successful GET responses for configured hosts under `output_path/<host>/<path>`.
#[derive(Debug, Clone)]
pub struct SiteCopyExecutor {
    hosts: Vec<String>,
    output: PathBuf,
}

impl SiteCopyExecutor {
    pub fn new(cfg: SiteCopyExecutorConfig) -> Self {
        Self {
            hosts: cfg.hosts.iter().map(|h| h.to_ascii_lowercase()).collect(),
            output: cfg.output_path,
        }
    }

    fn wants(&self, req: &RequestMeta, res: &ResponseMeta) -> bool {
        let host = req.host.to_ascii_lowercase();
        self.hosts.iter().any(|h| *h == host)
            && req.method != Method::POST
            && !req.request_uri.contains('?')
            && res.status == StatusCode::OK
    }

    /// Maps a request onto a file below the output directory.
    ///
    /// Empty, `.` and `..` segments are dropped so a request can never escape the host's
    /// directory. Directory-style URIs land on `index.html`.
    pub fn target_path(&self, host: &str, request_uri: &str) -> PathBuf {
        let mut path = self.output.join(host.to_ascii_lowercase());
        let segments: Vec<&str> = request_uri
            .split('/')
            .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
            .collect();
        for seg in &segments {
            path.push(seg);
        }
        if segments.is_empty() || request_uri.ends_with('/') {
            path.push(INDEX_FILE);
        }
        path
    }
}

impl Executor for SiteCopyExecutor {
    fn name(&self) -> &'static str {
        "sitecopy"
    }

    fn open(&self, req: &RequestMeta, res: &ResponseMeta) -> Option<Box<dyn BodySink>> {
        if !self.wants(req, res) {
            return None;
        }

        let target = self.target_path(&req.host, &req.request_uri);
        if target.exists() {
            tracing::debug!(target: "executor", file = %target.display(), "sitecopy file exists; skipping");
            return None;
        }

        match FileSink::create(target.clone()) {
            Ok(sink) => {
                tracing::info!(target: "executor", file = %target.display(), "generating site file");
                Some(Box::new(sink))
            }
            Err(err) => {
                tracing::error!(target: "executor", file = %target.display(), error = %err, "cannot create site file");
                None
            }
        }
    }
}

/// Writes into `<target>.part` and renames on a clean finish. A sink dropped before that
/// deletes its `.part` file.
struct FileSink {
    target: PathBuf,
    partial: PathBuf,
    writer: BufWriter<File>,
    committed: bool,
}

impl FileSink {
    fn create(target: PathBuf) -> io::Result<Self> {
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir)?;
        }
        let partial = partial_path(&target);
        let writer = BufWriter::new(File::create(&partial)?);
        Ok(Self {
            target,
            partial,
            writer,
            committed: false,
        })
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

impl BodySink for FileSink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.writer.write_all(chunk)
    }

    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(&self.partial, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = fs::remove_file(&self.partial) {
            tracing::debug!(target: "executor", file = %self.partial.display(), error = %err, "could not remove partial site file");
        }
    }
}
