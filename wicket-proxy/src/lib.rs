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

//! # Wicket
//!
//! A caching HTTP/1.1 forward proxy. Wicket interposes between browsers and
//! origin servers: `GET` is answered from a persistent response cache
//! governed by RFC 7234 freshness rules, `POST` is forwarded straight
//! through, and `CONNECT` opens an opaque TCP tunnel. Every proxied
//! exchange is recorded to a shared activity log under a monotonically
//! assigned transaction id.
//!
//! The accept loop dispatches each client connection to a detached worker
//! task; the shared pieces (the cache facade and the log sink) are held
//! behind `Arc`s and synchronize internally.

pub mod accesslog;
pub mod conf;
pub mod connection;
#[cfg(unix)]
pub mod daemon;
pub mod error_resp;
pub mod server;
pub mod tunnel;

pub use accesslog::ActivityLog;
pub use conf::{Opt, ProxyConf};
pub use server::Proxy;
