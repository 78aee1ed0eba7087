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

//! Server configuration
//!
//! The configuration file is YAML; every key has a default, so an empty (or
//! absent) file is a valid configuration. Command line arguments override a
//! subset of the keys.

use clap::Parser;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::fs;

use wicket_error::{Error, ErrorKind::*, OrErr, Result};

/// The configuration for the proxy.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConf {
    /// Version
    pub version: usize,
    /// Whether to run this process in the background. Demo mode forces
    /// foreground regardless.
    pub daemon: bool,
    /// The port the proxy listens on in normal operation.
    pub port: u16,
    /// The port used when running a foreground demo.
    pub demo_port: u16,
    /// Listen backlog on the accepting socket.
    pub backlog: u32,
    /// The directory under which the `__cache__` store lives.
    pub work_dir: String,
    /// Where activity log lines go when not in demo mode.
    pub access_log: String,
    /// When configured and `daemon` is `true`, stderr (and with it the
    /// diagnostic log) is redirected to this file.
    pub error_log: Option<String>,
    /// The pid file written when running in the background.
    pub pid_file: String,
}

impl Default for ProxyConf {
    fn default() -> Self {
        ProxyConf {
            version: 0,
            daemon: true,
            port: 12345,
            demo_port: 1234,
            backlog: 500,
            work_dir: ".".to_string(),
            access_log: "/var/log/erss/proxy.log".to_string(),
            error_log: None,
            pid_file: "/tmp/wicket.pid".to_string(),
        }
    }
}

/// Command-line options
///
/// Call `Opt::parse_args()` to build this object from the process's command
/// line arguments. Invoking the proxy with any positional argument selects
/// the foreground demo mode on the demo port.
#[derive(Parser, Debug, Default)]
#[clap(name = "wicket", long_about = None)]
pub struct Opt {
    /// The path to the configuration file.
    #[clap(short, long, help = "The path to the configuration file.", long_help = None)]
    pub conf: Option<String>,

    /// Test the configuration and exit
    ///
    /// When this flag is set the process parses and validates its
    /// configuration, prints it, and exits without binding any socket.
    #[clap(short, long)]
    pub test: bool,

    /// Any positional argument runs the proxy in the foreground on the demo
    /// port, logging to standard output.
    pub demo: Vec<String>,
}

impl ProxyConf {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ConfError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ConfError, "No path specified")
        }
    }

    pub fn new_with_opt_override(opt: &Opt) -> Self {
        let mut conf = Self::default();
        conf.merge_with_opt(opt);
        conf
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: ProxyConf = serde_yaml::from_str(conf_str).or_err_with(ConfError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");
        conf.validate()
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap()
    }

    pub fn validate(self) -> Result<Self> {
        if self.work_dir.is_empty() {
            return Error::e_explain(ConfError, "work_dir must not be empty");
        }
        Ok(self)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if !opt.demo.is_empty() {
            self.daemon = false;
        }
    }

    /// Whether this invocation is the foreground demo.
    pub fn demo_mode(opt: &Opt) -> bool {
        !opt.demo.is_empty()
    }

    /// The port to bind given the invocation mode.
    pub fn listen_port(&self, demo: bool) -> u16 {
        if demo {
            self.demo_port
        } else {
            self.port
        }
    }
}

/// Create an instance of Opt by parsing the current command-line args.
/// This is equivalent to running `Opt::parse` but does not require the
/// caller to have included the `clap::Parser`
impl Opt {
    pub fn parse_args() -> Self {
        Opt::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_default() {
        init_log();
        let conf = ProxyConf::from_yaml("---\nversion: 1").unwrap();
        assert_eq!(1, conf.version);
        assert!(conf.daemon);
        assert_eq!(12345, conf.port);
        assert_eq!(1234, conf.demo_port);
        assert_eq!(500, conf.backlog);
        assert_eq!("/var/log/erss/proxy.log", conf.access_log);
        assert_eq!("/tmp/wicket.pid", conf.pid_file);
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
version: 1
port: 8080
work_dir: /srv/proxy
        "#
        .to_string();
        let conf = ProxyConf::from_yaml(&conf_str).unwrap();
        assert_eq!(8080, conf.port);
        assert_eq!("/srv/proxy", conf.work_dir);
        // untouched keys keep their defaults
        assert_eq!(1234, conf.demo_port);
    }

    #[test]
    fn test_invalid_work_dir() {
        init_log();
        assert!(ProxyConf::from_yaml("---\nwork_dir: \"\"").is_err());
    }

    #[test]
    fn test_demo_overrides() {
        init_log();
        let opt = Opt {
            conf: None,
            test: false,
            demo: vec!["demo".to_string()],
        };
        let conf = ProxyConf::new_with_opt_override(&opt);
        assert!(!conf.daemon);
        assert!(ProxyConf::demo_mode(&opt));
        assert_eq!(conf.listen_port(true), 1234);
        assert_eq!(conf.listen_port(false), 12345);
    }

    #[test]
    fn test_yaml_round_trip() {
        init_log();
        let conf = ProxyConf::default();
        let conf2 = ProxyConf::from_yaml(&conf.to_yaml()).unwrap();
        assert_eq!(conf, conf2);
    }
}
