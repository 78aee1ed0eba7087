// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The shared, append-only activity log.
//!
//! Every proxied exchange emits a handful of lines here, each prefixed with
//! its transaction id (or `(no-id)` when none was assigned). Lines are
//! written whole under a lock, so concurrent workers never interleave
//! within a line.

use chrono::{DateTime, Local};
use log::warn;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::time::SystemTime;

use wicket_error::{ErrorKind::*, OrErr, Result};

/// The line-atomic log sink.
pub struct ActivityLog {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl ActivityLog {
    /// Log to standard output (demo mode).
    pub fn to_stdout() -> Self {
        ActivityLog {
            sink: Mutex::new(Box::new(io::stdout())),
        }
    }

    /// Append to the file at `path`, creating it and its parent directory
    /// if needed.
    pub fn to_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                std::fs::create_dir_all(parent).or_err_with(FileCreateError, || {
                    format!("failed to create log directory {}", parent.display())
                })?;
            }
        }
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .or_err_with(FileOpenError, || {
                format!("failed to open activity log {}", path.display())
            })?;
        Ok(ActivityLog {
            sink: Mutex::new(Box::new(file)),
        })
    }

    /// Emit one line: `<id>: <text>`, or `(no-id): <text>` when no
    /// transaction id was assigned.
    pub fn emit(&self, id: Option<&str>, text: &str) {
        let mut sink = self.sink.lock();
        let res = match id {
            Some(id) => writeln!(sink, "{id}: {text}"),
            None => writeln!(sink, "(no-id): {text}"),
        };
        if let Err(e) = res.and_then(|_| sink.flush()) {
            warn!("failed to write activity log line: {e}");
        }
    }
}

/// The current time in `asctime` style, e.g. `Sun Nov  6 08:49:37 1994`.
pub fn asctime_now() -> String {
    asctime_from(SystemTime::now())
}

/// An `asctime`-style rendering of `t`.
pub fn asctime_from(t: SystemTime) -> String {
    let dt: DateTime<Local> = t.into();
    dt.format("%a %b %e %H:%M:%S %Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_emit_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.log");
        let log = ActivityLog::to_file(&path).unwrap();
        log.emit(Some("1"), "in cache, valid");
        log.emit(None, "Tunnel closed");
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "1: in cache, valid\n(no-id): Tunnel closed\n");
    }

    #[test]
    fn test_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("erss").join("proxy.log");
        let log = ActivityLog::to_file(&path).unwrap();
        log.emit(Some("2"), "not in cache");
        assert!(path.is_file());
    }

    #[test]
    fn test_asctime_format() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(784111777);
        let s = asctime_from(t);
        // Sun Nov  6 08:49:37 1994 in UTC; the local rendering keeps the
        // asctime shape either way
        assert_eq!(s.len(), 24);
        assert!(s.ends_with("1994"));
    }
}
