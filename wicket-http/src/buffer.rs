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

//! The growable octet buffer and its CRLF line framer.

use bytes::{Buf, Bytes, BytesMut};

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// How a line extraction can fail.
///
/// The split is load-bearing: [LineError::Incomplete] means "wait for more
/// bytes and retry", everything else is fatal to the message being parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineError {
    /// No full `CR LF` yet: empty buffer, no CR seen, or the buffer ends in
    /// a lone CR whose next byte has not arrived.
    Incomplete,
    /// A bare LF with no preceding CR.
    BareLf,
    /// A CR followed by something other than LF.
    CrWithoutLf,
}

/// A growable octet buffer that hands out CRLF-delimited lines.
#[derive(Debug, Default, Clone)]
pub struct MsgBuffer {
    bytes: BytesMut,
}

impl MsgBuffer {
    pub fn new() -> Self {
        MsgBuffer {
            bytes: BytesMut::new(),
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        MsgBuffer {
            bytes: BytesMut::from(data),
        }
    }

    /// Append raw bytes at the end of the buffer.
    pub fn append(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Replace the buffer content.
    pub fn set(&mut self, data: &[u8]) {
        self.bytes.clear();
        self.bytes.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Drop the first `cnt` bytes.
    ///
    /// # Panics
    /// Panics if `cnt` exceeds the buffered length.
    pub fn advance(&mut self, cnt: usize) {
        self.bytes.advance(cnt);
    }

    /// Extract the first CRLF-terminated line, without its terminator.
    ///
    /// The line and the terminator are erased from the buffer. The empty
    /// line before a message body comes back as an empty [Bytes].
    pub fn take_crlf_line(&mut self) -> Result<Bytes, LineError> {
        let at = find_crlf(&self.bytes)?;
        let line = self.bytes.split_to(at).freeze();
        self.bytes.advance(2); // the CR LF pair
        Ok(line)
    }

    /// Take exactly `n` bytes off the front, or `None` if fewer are buffered.
    pub fn take_bytes(&mut self, n: usize) -> Option<Bytes> {
        if self.bytes.len() < n {
            return None;
        }
        Some(self.bytes.split_to(n).freeze())
    }

    /// Drain the entire buffer.
    pub fn take_all(&mut self) -> Bytes {
        self.bytes.split().freeze()
    }
}

// Scan for the first CR LF pair and return the index of the CR.
fn find_crlf(buf: &[u8]) -> Result<usize, LineError> {
    for (i, b) in buf.iter().enumerate() {
        match *b {
            CR => {
                return if i + 1 == buf.len() {
                    // lone CR at the end, the LF may still be in flight
                    Err(LineError::Incomplete)
                } else if buf[i + 1] == LF {
                    Ok(i)
                } else {
                    Err(LineError::CrWithoutLf)
                };
            }
            LF => return Err(LineError::BareLf),
            _ => {}
        }
    }
    Err(LineError::Incomplete)
}
