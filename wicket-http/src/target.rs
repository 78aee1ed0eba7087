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

//! Request-target decomposition.
//!
//! A proxy's clients use `absolute-form` (`http://host[:port][/path]`) for
//! GET/POST and `authority-form` (`host:port`) only for CONNECT. The target
//! is stored verbatim on the [Request](crate::Request); these helpers take
//! it apart when the proxy has to dial the origin.

use std::str;

use crate::parser::ParseError;

/// `http://HOST[:PORT][/PATH]` decomposed. The port is kept optional here;
/// defaulting to 80 happens at the point of connection, not during parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteForm {
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl AbsoluteForm {
    /// The port to dial, defaulting to 80.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(80)
    }
}

/// `host:port`, the CONNECT request-target. The colon is mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityForm {
    pub host: String,
    pub port: u16,
}

/// Decompose an absolute-form request-target.
pub fn parse_absolute_form(target: &[u8]) -> Result<AbsoluteForm, ParseError> {
    let target = str::from_utf8(target)
        .map_err(|_| ParseError::BadMessage("request-target is not valid utf-8"))?;
    let rest = target
        .strip_prefix("http://")
        .ok_or(ParseError::BadMessage("request-target is not absolute-form"))?;

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ParseError::BadMessage("invalid port in request-target"))?;
            (host, Some(port))
        }
        None => (authority, None),
    };
    if host.is_empty() {
        return Err(ParseError::BadMessage("empty host in request-target"));
    }
    Ok(AbsoluteForm {
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

/// Decompose an authority-form request-target.
pub fn parse_authority_form(target: &[u8]) -> Result<AuthorityForm, ParseError> {
    let target = str::from_utf8(target)
        .map_err(|_| ParseError::BadMessage("request-target is not valid utf-8"))?;
    let (host, port) = target
        .split_once(':')
        .ok_or(ParseError::BadMessage("authority-form requires a port"))?;
    if host.is_empty() {
        return Err(ParseError::BadMessage("empty host in request-target"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| ParseError::BadMessage("invalid port in request-target"))?;
    Ok(AuthorityForm {
        host: host.to_string(),
        port,
    })
}
