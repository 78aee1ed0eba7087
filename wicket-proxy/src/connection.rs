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

//! The per-connection worker.
//!
//! Each accepted client runs one request through receive, dispatch on the
//! method, respond, log. GET consults the cache first; POST is forwarded
//! verbatim; CONNECT turns the connection into an opaque tunnel. Any error
//! that escapes a branch is caught at the worker boundary so one bad
//! request can never take the server down.

use log::{debug, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use wicket_cache::{CacheDecision, ProxyCache, SaveOutcome};
use wicket_error::{ErrorKind::*, OrErr, Result};
use wicket_http::target::{parse_absolute_form, parse_authority_form};
use wicket_http::{Method, ParseError, Request, RequestParser, Status, StatusParser};

use crate::accesslog::{asctime_from, asctime_now, ActivityLog};
use crate::error_resp;

/// How many receive-append iterations a single message may take before the
/// peer is abandoned.
const RECV_RETRY: usize = 2000;
const RECV_BUF_SIZE: usize = 64 * 1024;

/// One worker per accepted client connection.
pub struct ConnectionHandler {
    cache: Arc<ProxyCache>,
    log: Arc<ActivityLog>,
}

impl ConnectionHandler {
    pub fn new(cache: Arc<ProxyCache>, log: Arc<ActivityLog>) -> Self {
        ConnectionHandler { cache, log }
    }

    /// Run the connection to completion. Never panics the server: errors
    /// are logged as warnings and the socket is dropped.
    pub async fn handle(self, mut client: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.do_handle(&mut client, peer).await {
            warn!("Exception ignored, what(): {e}");
        }
        // the client socket closes when `client` drops here
    }

    async fn do_handle(&self, client: &mut TcpStream, peer: SocketAddr) -> Result<()> {
        let id = self.cache.offer_id()?;

        let Some(req) = self.receive_request(client, &id).await? else {
            debug!("failed to get a request from {peer}");
            return Ok(());
        };

        // the parser only lets these three methods through
        if req.method() == &Method::GET {
            self.handle_get(client, req, id, peer).await
        } else if req.method() == &Method::POST {
            self.log_request_line(&id, &req, peer);
            self.handle_post(client, req, id).await
        } else {
            self.log_request_line(&id, &req, peer);
            self.handle_connect(client, req, id).await
        }
    }

    fn log_request_line(&self, id: &str, req: &Request, peer: SocketAddr) {
        self.log.emit(
            Some(id),
            &format!(
                "\"{}\" from {} @ {}",
                req.start_line(),
                peer.ip(),
                asctime_now()
            ),
        );
    }

    async fn handle_get(
        &self,
        client: &mut TcpStream,
        req: Request,
        id: String,
        peer: SocketAddr,
    ) -> Result<()> {
        let decision = self.cache.construct_response(&req);
        // the cache may already know this request line under an earlier id;
        // rebind so the whole transaction logs coherently
        let id = match &decision {
            CacheDecision::Serve { id, .. } | CacheDecision::Revalidate { id, .. } => id.clone(),
            CacheDecision::Miss => id,
        };
        self.log_request_line(&id, &req, peer);

        match decision {
            CacheDecision::Serve { resp, .. } => {
                self.log.emit(Some(id.as_str()), "in cache, valid");
                client
                    .write_all(&resp.to_wire())
                    .await
                    .or_err(WriteError, "while serving cached response")?;
                self.log
                    .emit(Some(id.as_str()), &format!("Responding \"{}\"", resp.status_line()));
                Ok(())
            }
            CacheDecision::Miss => {
                self.log.emit(Some(id.as_str()), "not in cache");
                self.fetch_from_origin(client, &req, &id).await
            }
            CacheDecision::Revalidate {
                cached, request, ..
            } => {
                self.log.emit(Some(id.as_str()), "in cache, requires validation");
                self.revalidate(client, &req, cached, request, &id).await
            }
        }
    }

    // GET miss: fetch from the origin, cache, forward.
    async fn fetch_from_origin(
        &self,
        client: &mut TcpStream,
        req: &Request,
        id: &str,
    ) -> Result<()> {
        let Some(mut upstream) = self.dial_origin(client, req, id).await? else {
            return Ok(());
        };
        let host = origin_host(req);

        self.log.emit(
            Some(id),
            &format!("Requesting \"{}\" from {}", req.start_line(), host),
        );
        if let Err(e) = upstream.write_all(&req.to_wire()).await {
            debug!("failed to send request upstream: {e}");
            self.respond_502(client, id, "failed to send request to origin")
                .await;
            return Ok(());
        }

        let Some(status) = receive_status(&mut upstream, false).await else {
            self.respond_502(client, id, "Received illegal response from server")
                .await;
            return Ok(());
        };
        self.log.emit(
            Some(id),
            &format!("Received \"{}\" from {}", status.status_line(), host),
        );

        self.save_and_note(req, &status, id);

        self.log.emit(
            Some(id),
            &format!("Responding \"{}\"", status.status_line()),
        );
        client
            .write_all(&status.to_wire())
            .await
            .or_err(WriteError, "while forwarding origin response")?;
        Ok(())
    }

    // GET revalidation: conditional request, then 304 -> cached copy,
    // 200 -> fresh copy, anything else -> 502.
    async fn revalidate(
        &self,
        client: &mut TcpStream,
        req: &Request,
        cached: Status,
        validation_req: Request,
        id: &str,
    ) -> Result<()> {
        let Some(mut upstream) = self.dial_origin(client, req, id).await? else {
            return Ok(());
        };
        let host = origin_host(req);

        self.log.emit(
            Some(id),
            &format!(
                "Requesting \"{}\" from {}",
                validation_req.start_line(),
                host
            ),
        );
        if let Err(e) = upstream.write_all(&validation_req.to_wire()).await {
            debug!("failed to send validation request upstream: {e}");
            self.respond_502(client, id, "failed to send request to origin")
                .await;
            return Ok(());
        }

        let Some(status) = receive_status(&mut upstream, false).await else {
            self.respond_502(client, id, "while revalidating, we don't understand what server said")
                .await;
            return Ok(());
        };
        self.log.emit(
            Some(id),
            &format!("Received \"{}\" from {}", status.status_line(), host),
        );

        match status.code().as_u16() {
            200 => {
                self.save_and_note(req, &status, id);
                self.log.emit(
                    Some(id),
                    &format!("Responding \"{}\"", status.status_line()),
                );
                client
                    .write_all(&status.to_wire())
                    .await
                    .or_err(WriteError, "while forwarding revalidated response")?;
            }
            304 => {
                self.log.emit(
                    Some(id),
                    &format!("Responding \"{}\"", cached.status_line()),
                );
                client
                    .write_all(&cached.to_wire())
                    .await
                    .or_err(WriteError, "while serving revalidated cached response")?;
            }
            _ => {
                self.respond_502(
                    client,
                    id,
                    "while revalidating, server returned neither 200 nor 304",
                )
                .await;
            }
        }
        Ok(())
    }

    async fn handle_post(
        &self,
        client: &mut TcpStream,
        req: Request,
        id: String,
    ) -> Result<()> {
        let Some(mut upstream) = self.dial_origin(client, &req, &id).await? else {
            return Ok(());
        };
        let host = origin_host(&req);

        self.log.emit(
            Some(id.as_str()),
            &format!("Requesting \"{}\" from {}", req.start_line(), host),
        );
        if let Err(e) = upstream.write_all(&req.to_wire()).await {
            debug!("failed to send request upstream: {e}");
            self.respond_502(client, &id, "failed to send request to origin")
                .await;
            return Ok(());
        }

        let Some(status) = receive_status(&mut upstream, false).await else {
            self.respond_502(client, &id, "Received illegal response from server")
                .await;
            return Ok(());
        };
        self.log.emit(
            Some(id.as_str()),
            &format!("Received \"{}\" from {}", status.status_line(), host),
        );

        self.log.emit(
            Some(id.as_str()),
            &format!("Responding \"{}\"", status.status_line()),
        );
        client
            .write_all(&status.to_wire())
            .await
            .or_err(WriteError, "while forwarding origin response")?;
        Ok(())
    }

    async fn handle_connect(
        &self,
        client: &mut TcpStream,
        req: Request,
        id: String,
    ) -> Result<()> {
        let authority = match parse_authority_form(req.raw_target()) {
            Ok(a) => a,
            Err(e) => {
                debug!("bad CONNECT target: {e}");
                return Ok(());
            }
        };
        let dialed = TcpStream::connect((authority.host.as_str(), authority.port))
            .await
            .or_err_with(ConnectError, || {
                format!("dialing {}:{} for tunnel", authority.host, authority.port)
            });
        let mut upstream = match dialed {
            Ok(s) => s,
            Err(e) => {
                warn!("{e}");
                return Ok(());
            }
        };

        self.log
            .emit(Some(id.as_str()), "Responding \"HTTP/1.1 200 OK\"");
        if client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.is_err() {
            self.log.emit(Some(id.as_str()), "Tunnel closed");
            warn!("failed to return 200 to tunnel client");
            return Ok(());
        }

        crate::tunnel::relay(client, &mut upstream).await;
        self.log.emit(Some(id.as_str()), "Tunnel closed");
        Ok(())
    }

    // Dial the origin named by the absolute-form target. A malformed target
    // is the client's fault (400); a failed connect is answered with 502.
    // None means the error was already answered.
    async fn dial_origin(
        &self,
        client: &mut TcpStream,
        req: &Request,
        id: &str,
    ) -> Result<Option<TcpStream>> {
        let form = match parse_absolute_form(req.raw_target()) {
            Ok(f) => f,
            Err(e) => {
                debug!("bad request-target: {e}");
                self.respond_error(client, id, error_resp::bad_request("request-target not understood"))
                    .await;
                return Ok(None);
            }
        };
        let port = form.port_or_default();
        let dialed = TcpStream::connect((form.host.as_str(), port))
            .await
            .or_err_with(ConnectError, || format!("dialing {}:{}", form.host, port));
        match dialed {
            Ok(s) => Ok(Some(s)),
            Err(e) => {
                warn!("{e}");
                self.respond_502(client, id, "failed to connect to origin server")
                    .await;
                Ok(None)
            }
        }
    }

    fn save_and_note(&self, req: &Request, status: &Status, id: &str) {
        match self.cache.save(req, status, Some(id)) {
            Ok(SaveOutcome::Saved { expires_at, .. }) => match expires_at {
                Some(t) => self.log.emit(
                    Some(id),
                    &format!("NOTE cached, expires at {}", asctime_from(t)),
                ),
                None => self
                    .log
                    .emit(Some(id), "NOTE cached, but requires re-validation"),
            },
            Ok(SaveOutcome::Skipped { reason, .. }) => {
                self.log
                    .emit(Some(id), &format!("NOTE not cacheable because {reason}"));
            }
            Ok(SaveOutcome::NotEligible) => {}
            Err(e) => {
                // a broken cache degrades to a pass-through proxy
                warn!("cache store error ignored: {e}");
            }
        }
    }

    async fn respond_502(&self, client: &mut TcpStream, id: &str, detail: &str) {
        self.respond_error(client, id, error_resp::bad_gateway(detail))
            .await;
    }

    async fn respond_error(&self, client: &mut TcpStream, id: &str, resp: Status) {
        self.log
            .emit(Some(id), &format!("Responding \"{}\"", resp.status_line()));
        if let Err(e) = client.write_all(&resp.to_wire()).await {
            debug!("failed to send error response: {e}");
        }
    }

    // Append-and-retry until a full request is buffered. None means the
    // client is done for: EOF mid-message, a spent retry budget (both
    // silent) or a protocol violation (answered with 400).
    async fn receive_request(
        &self,
        client: &mut TcpStream,
        id: &str,
    ) -> Result<Option<Request>> {
        let mut parser = RequestParser::new();
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        for _ in 0..RECV_RETRY {
            let n = client
                .read(&mut buf)
                .await
                .or_err(ReadError, "while receiving request")?;
            if n == 0 {
                // the client went away without completing a message
                return Ok(None);
            }
            parser.append(&buf[..n]);
            match parser.build() {
                Ok(req) => return Ok(Some(req)),
                Err(ParseError::Incomplete) => continue,
                Err(ParseError::BadMessage(reason)) => {
                    debug!("malformed request: {reason}");
                    self.respond_error(client, id, error_resp::bad_request(reason))
                        .await;
                    return Ok(None);
                }
                // requests never wait for connection close
                Err(ParseError::StatusNotComplete) => continue,
            }
        }
        warn!("request did not complete within the retry budget");
        Ok(None)
    }
}

/// Append-and-retry until a full response is buffered. EOF completes a
/// close-delimited body; anything else unfinished is a `None`.
pub(crate) async fn receive_status(
    upstream: &mut TcpStream,
    connect_request: bool,
) -> Option<Status> {
    let mut parser = StatusParser::new();
    parser.set_connect_request(connect_request);
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    for i in 0..RECV_RETRY {
        if i != 0 && i % (RECV_RETRY / 10) == 0 {
            warn!("a very large response is still being received, please wait");
        }
        let n = match upstream.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!("upstream read failed: {e}");
                return None;
            }
        };
        if n == 0 {
            parser.mark_closed();
            return parser.build().ok();
        }
        parser.append(&buf[..n]);
        match parser.build() {
            Ok(sta) => return Some(sta),
            Err(ParseError::Incomplete) | Err(ParseError::StatusNotComplete) => continue,
            Err(ParseError::BadMessage(reason)) => {
                debug!("malformed response: {reason}");
                return None;
            }
        }
    }
    warn!("The response is bad or too large");
    None
}

fn origin_host(req: &Request) -> String {
    parse_absolute_form(req.raw_target())
        .map(|f| f.host)
        .unwrap_or_else(|_| String::from_utf8_lossy(req.raw_target()).into_owned())
}
