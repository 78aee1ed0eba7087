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

//! The wicket binary.
//!
//! With no arguments the proxy daemonizes and serves on the configured port
//! with a file-backed activity log. With any positional argument it runs in
//! the foreground on the demo port, logging activity to standard output.

use log::error;
use std::path::Path;
use std::process;
use std::sync::Arc;

use wicket_cache::ProxyCache;
use wicket_proxy::{ActivityLog, Opt, Proxy, ProxyConf};

fn main() {
    let opt = Opt::parse_args();
    let demo = ProxyConf::demo_mode(&opt);

    let conf = if opt.conf.is_some() {
        ProxyConf::load_yaml_with_opt_override(&opt)
    } else {
        Ok(ProxyConf::new_with_opt_override(&opt))
    };
    let conf = match conf {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("configuration error: {e}");
            process::exit(1);
        }
    };

    if opt.test {
        println!("{}", conf.to_yaml());
        return;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    #[cfg(unix)]
    if conf.daemon && !demo {
        wicket_proxy::daemon::daemonize(&conf);
    }

    let access_log = if demo {
        ActivityLog::to_stdout()
    } else {
        match ActivityLog::to_file(Path::new(&conf.access_log)) {
            Ok(log) => log,
            Err(e) => {
                eprintln!("failed to open activity log: {e}");
                process::exit(1);
            }
        }
    };

    let cache = match ProxyCache::new(Path::new(&conf.work_dir)) {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            eprintln!("failed to open cache: {e}");
            process::exit(1);
        }
    };

    let proxy = Proxy::new(
        conf.listen_port(demo),
        conf.backlog,
        cache,
        Arc::new(access_log),
    );

    // hard crash when the runtime cannot start, nothing to clean up yet
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async move {
        // the first bind is the bootstrap: failure exits non-zero
        let mut listener = match proxy.bind() {
            Ok(listener) => listener,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        };
        loop {
            if let Err(e) = proxy.serve(listener).await {
                error!("{e}");
                error!("Restart server...");
            }
            listener = match proxy.bind() {
                Ok(listener) => listener,
                Err(e) => {
                    eprintln!("{e}");
                    process::exit(1);
                }
            };
        }
    });
}
