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

//! Running the proxy in the background.
//!
//! The no-argument invocation detaches into a daemon before any socket is
//! bound: pid file for service scripts, group-accessible umask so the cache
//! and logs stay readable by operators in the same group, and stderr
//! optionally redirected to the error log so diagnostics survive losing
//! the terminal.

use daemonize::Daemonize;
use log::{debug, error};
use std::fs::{self, OpenOptions};
use std::path::Path;

use crate::conf::ProxyConf;

// A pid file left behind by a crashed or killed instance is set aside as
// `<path>.old` rather than clobbered, so the previous run can still be
// identified while the new one starts.
fn retire_stale_pid_file(path: &str) {
    if !Path::new(path).exists() {
        return;
    }
    let retired = format!("{path}.old");
    match fs::rename(path, &retired) {
        Ok(()) => debug!("stale pid file moved to {retired}"),
        Err(e) => error!("failed to move stale pid file {path} aside: {e}"),
    }
}

/// Detach the process into the background.
#[cfg(unix)]
pub fn daemonize(conf: &ProxyConf) {
    retire_stale_pid_file(&conf.pid_file);

    let mut daemonize = Daemonize::new()
        .umask(0o007) // same group may read the cache and logs, others may not
        .pid_file(&conf.pid_file);

    if let Some(error_log) = conf.error_log.as_ref() {
        // stderr carries the diagnostic log once the terminal is gone
        let sink = OpenOptions::new()
            .append(true)
            .create(true)
            .open(error_log)
            .unwrap();
        daemonize = daemonize.stderr(sink);
    }

    daemonize.start().unwrap(); // nothing to salvage if the fork fails
}
