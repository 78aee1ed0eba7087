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

//! The listening socket and the accept loop.

use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};

use wicket_cache::ProxyCache;
use wicket_error::{ErrorKind::*, OrErr, Result};

use crate::accesslog::ActivityLog;
use crate::connection::ConnectionHandler;

/// The accepting server: binds one TCP port and hands every accepted
/// connection to a detached worker.
pub struct Proxy {
    port: u16,
    backlog: u32,
    cache: Arc<ProxyCache>,
    log: Arc<ActivityLog>,
}

impl Proxy {
    pub fn new(port: u16, backlog: u32, cache: Arc<ProxyCache>, log: Arc<ActivityLog>) -> Self {
        Proxy {
            port,
            backlog,
            cache,
            log,
        }
    }

    /// Bind the listening socket on all interfaces.
    pub fn bind(&self) -> Result<TcpListener> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let socket = TcpSocket::new_v4().or_err(BindError, "failed to create listening socket")?;
        socket
            .set_reuseaddr(true)
            .or_err(SocketError, "failed to set SO_REUSEADDR")?;
        socket
            .bind(addr)
            .or_err_with(BindError, || format!("bind() failed on {addr}"))?;
        let listener = socket
            .listen(self.backlog)
            .or_err_with(BindError, || format!("listen() failed on {addr}"))?;
        if let Ok(local) = listener.local_addr() {
            info!("listening on {local}");
        }
        Ok(listener)
    }

    /// Accept until the listener fails. Workers are spawned per connection
    /// and detached; nothing here waits on them.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .or_err(AcceptError, "failed to accept connection")?;
            debug!("accepted connection from {peer}");
            let handler = ConnectionHandler::new(self.cache.clone(), self.log.clone());
            tokio::spawn(handler.handle(stream, peer));
        }
    }

    /// Bind and serve.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }
}
