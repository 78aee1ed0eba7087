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

//! The opaque byte relay behind CONNECT.

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const RELAY_BUF_SIZE: usize = 64 * 1024;

/// Relay bytes between the client and the upstream in both directions until
/// either side closes or errors. Closing one half tears the whole tunnel
/// down; both sockets are closed when the streams drop in the caller.
pub async fn relay(client: &mut TcpStream, upstream: &mut TcpStream) {
    let (mut client_rd, mut client_wr) = client.split();
    let (mut upstream_rd, mut upstream_wr) = upstream.split();

    let mut client_buf = vec![0u8; RELAY_BUF_SIZE];
    let mut upstream_buf = vec![0u8; RELAY_BUF_SIZE];

    loop {
        tokio::select! {
            res = upstream_rd.read(&mut upstream_buf) => {
                match res {
                    Ok(0) => {
                        debug!("tunnel: upstream closed");
                        break;
                    }
                    Ok(n) => {
                        if client_wr.write_all(&upstream_buf[..n]).await.is_err() {
                            debug!("tunnel: client write failed");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("tunnel: upstream read failed: {e}");
                        break;
                    }
                }
            }
            res = client_rd.read(&mut client_buf) => {
                match res {
                    Ok(0) => {
                        debug!("tunnel: client closed");
                        break;
                    }
                    Ok(n) => {
                        if upstream_wr.write_all(&client_buf[..n]).await.is_err() {
                            debug!("tunnel: upstream write failed");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("tunnel: client read failed: {e}");
                        break;
                    }
                }
            }
        }
    }
}
