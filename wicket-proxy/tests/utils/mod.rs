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

//! Shared fixture for the end-to-end tests: one proxy instance, one
//! scripted mock origin and one raw echo server, all in-process.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use wicket_cache::ProxyCache;
use wicket_http::target::parse_absolute_form;
use wicket_http::{Method, ParseError, Request, RequestParser};
use wicket_proxy::{ActivityLog, Proxy};

pub struct Fixture {
    pub proxy_addr: SocketAddr,
    pub origin_addr: SocketAddr,
    pub echo_addr: SocketAddr,
    pub cache_dir: PathBuf,
    pub log_path: PathBuf,
    requests_by_path: Arc<Mutex<HashMap<String, usize>>>,
}

pub static FIXTURE: Lazy<Fixture> = Lazy::new(init);

fn init() -> Fixture {
    let tmp = Box::leak(Box::new(tempfile::tempdir().unwrap()));
    let cache_dir = tmp.path().to_path_buf();
    let log_path = tmp.path().join("proxy.log");
    let requests_by_path = Arc::new(Mutex::new(HashMap::new()));

    let (tx, rx) = std::sync::mpsc::channel();
    let counter = requests_by_path.clone();
    let fixture_cache_dir = cache_dir.clone();
    let fixture_log_path = log_path.clone();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let origin_addr = spawn_origin(counter).await;
            let echo_addr = spawn_echo().await;

            let cache = Arc::new(ProxyCache::new(&fixture_cache_dir).unwrap());
            let log = Arc::new(ActivityLog::to_file(&fixture_log_path).unwrap());
            // port 0: let the kernel pick, the tests read it back
            let proxy = Proxy::new(0, 128, cache, log);
            let listener = proxy.bind().unwrap();
            let proxy_addr = listener.local_addr().unwrap();
            tx.send((proxy_addr, origin_addr, echo_addr)).unwrap();
            proxy.serve(listener).await.unwrap();
        });
    });

    let (proxy_addr, origin_addr, echo_addr) = rx.recv().unwrap();
    Fixture {
        proxy_addr,
        origin_addr,
        echo_addr,
        cache_dir,
        log_path,
        requests_by_path,
    }
}

impl Fixture {
    /// How many requests the mock origin has seen for `path`.
    pub fn origin_requests(&self, path: &str) -> usize {
        *self.requests_by_path.lock().get(path).unwrap_or(&0)
    }

    pub fn read_log(&self) -> String {
        std::fs::read_to_string(&self.log_path).unwrap_or_default()
    }

    /// `(name, content)` of every blob currently in the cache directory.
    pub fn cache_entries(&self) -> Vec<(String, Vec<u8>)> {
        let dir = self.cache_dir.join("__cache__");
        let mut entries = Vec::new();
        for e in std::fs::read_dir(dir).unwrap() {
            let e = e.unwrap();
            if e.path().is_file() {
                entries.push((
                    e.file_name().to_string_lossy().into_owned(),
                    std::fs::read(e.path()).unwrap(),
                ));
            }
        }
        entries
    }

    /// The absolute-form target for `path` on the mock origin.
    pub fn origin_target(&self, path: &str) -> String {
        format!("http://{}{}", self.origin_addr, path)
    }
}

/// Open a client connection to the proxy, send `raw`, and read the full
/// response until the proxy closes the connection.
pub async fn send_request(proxy: SocketAddr, raw: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    out
}

async fn spawn_origin(counter: Arc<Mutex<HashMap<String, usize>>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                break;
            };
            let counter = counter.clone();
            tokio::spawn(handle_origin_conn(sock, counter));
        }
    });
    addr
}

async fn handle_origin_conn(mut sock: TcpStream, counter: Arc<Mutex<HashMap<String, usize>>>) {
    let Some(req) = read_full_request(&mut sock).await else {
        return;
    };
    let path = parse_absolute_form(req.raw_target())
        .map(|f| f.path)
        .unwrap_or_else(|_| "/".to_string());
    *counter.lock().entry(path.clone()).or_insert(0) += 1;

    let conditional = req.headers().contains_key("if-none-match")
        || req.headers().contains_key("if-modified-since");

    let response: Vec<u8> = match path.as_str() {
        "/cacheable" => {
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nCache-Control: max-age=60\r\n\r\nabc"
                .to_vec()
        }
        "/etag" => {
            if conditional {
                b"HTTP/1.1 304 Not Modified\r\n\r\n".to_vec()
            } else {
                b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nCache-Control: max-age=0\r\nETag: \"v1\"\r\n\r\nabc"
                    .to_vec()
            }
        }
        "/refresh" => {
            if conditional {
                b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nCache-Control: max-age=0\r\nETag: \"v2\"\r\n\r\nxyz"
                    .to_vec()
            } else {
                b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nCache-Control: max-age=0\r\nETag: \"v1\"\r\n\r\nabc"
                    .to_vec()
            }
        }
        "/nostore" => {
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nCache-Control: no-store\r\n\r\nabc"
                .to_vec()
        }
        "/close-delimited" => b"HTTP/1.1 200 OK\r\n\r\nunframed body".to_vec(),
        "/post" if req.method() == &Method::POST => {
            let body = req.body().clone();
            let mut resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .into_bytes();
            resp.extend_from_slice(&body);
            resp
        }
        _ => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec(),
    };

    let _ = sock.write_all(&response).await;
    // dropping the socket closes the connection, which also ends any
    // close-delimited body
}

async fn read_full_request(sock: &mut TcpStream) -> Option<Request> {
    let mut parser = RequestParser::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = sock.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        parser.append(&buf[..n]);
        match parser.build() {
            Ok(req) => return Some(req),
            Err(ParseError::Incomplete) => continue,
            Err(_) => return None,
        }
    }
}

async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}
