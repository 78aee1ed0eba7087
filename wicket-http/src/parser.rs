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

//! Incremental, restartable parsers for HTTP/1.1 requests and responses.
//!
//! A parser owns its accumulation buffer. Callers feed it with
//! [set_buffer](RequestParser::set_buffer) or [append](RequestParser::append)
//! and call `build()`; on [ParseError::Incomplete] they read more bytes off
//! the socket and call `build()` again. A successful `build()` consumes
//! exactly one message and leaves any trailing bytes buffered.
//!
//! [ParseError::StatusNotComplete] is the third verdict, raised only for
//! responses that carry no framing signal: the caller must read until the
//! peer closes, call [StatusParser::mark_closed], and re-run `build()`.

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::StatusCode;
use thiserror::Error;

use crate::body::{self, BodyFraming};
use crate::buffer::MsgBuffer;
use crate::{Method, Request, Status, Version};

/// Reads per append are capped by the connection handler; this bounds a
/// single header line instead.
const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Not enough bytes buffered to finish the message. Retryable.
    #[error("need more data")]
    Incomplete,
    /// A protocol violation in the received bytes. Fatal to this message.
    #[error("bad message: {0}")]
    BadMessage(&'static str),
    /// The response has no framing signal and can only be delimited by the
    /// peer closing its connection.
    #[error("response complete only at connection close")]
    StatusNotComplete,
}

/// Parser for request messages.
#[derive(Debug, Default)]
pub struct RequestParser {
    buf: MsgBuffer,
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            buf: MsgBuffer::new(),
        }
    }

    /// Replace the accumulation buffer. This also discards any bytes left
    /// over from a previous message.
    pub fn set_buffer(&mut self, data: &[u8]) {
        self.buf.set(data);
    }

    /// Append newly received bytes at the end of the accumulation buffer.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.append(data);
    }

    /// Bytes buffered beyond the last successfully built message.
    pub fn remaining(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Try to build a [Request] out of the buffered bytes.
    pub fn build(&mut self) -> Result<Request, ParseError> {
        // parse on a scratch copy so that an Incomplete verdict leaves the
        // accumulation buffer untouched for the next append
        let mut work = MsgBuffer::from_slice(self.buf.as_slice());
        let req = parse_request(&mut work)?;
        self.buf = work;
        Ok(req)
    }
}

/// Parser for response messages.
#[derive(Debug, Default)]
pub struct StatusParser {
    buf: MsgBuffer,
    connect_request: bool,
    peer_closed: bool,
}

impl StatusParser {
    pub fn new() -> Self {
        StatusParser {
            buf: MsgBuffer::new(),
            connect_request: false,
            peer_closed: false,
        }
    }

    /// Mark this parser as parsing the response to a CONNECT request: any
    /// 2xx then has no body regardless of framing headers.
    pub fn set_connect_request(&mut self, connect: bool) {
        self.connect_request = connect;
    }

    /// Record that the peer closed its end. A body delimited by connection
    /// close is complete after this.
    pub fn mark_closed(&mut self) {
        self.peer_closed = true;
    }

    pub fn set_buffer(&mut self, data: &[u8]) {
        self.buf.set(data);
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.append(data);
    }

    pub fn remaining(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Try to build a [Status] out of the buffered bytes.
    pub fn build(&mut self) -> Result<Status, ParseError> {
        let mut work = MsgBuffer::from_slice(self.buf.as_slice());
        let sta = parse_status(&mut work, self.connect_request, self.peer_closed)?;
        self.buf = work;
        Ok(sta)
    }
}

fn parse_request(work: &mut MsgBuffer) -> Result<Request, ParseError> {
    let line = work.take_crlf_line().map_err(body::line_to_parse_error)?;
    let (method, target, version) = parse_request_line(&line)?;
    let mut req = Request::new(method, target, version);
    for (name, value) in parse_header_block(work)? {
        let value = HeaderValue::from_bytes(&value)
            .map_err(|_| ParseError::BadMessage("invalid header value"))?;
        req.append_header(name, value)
            .map_err(|_| ParseError::BadMessage("invalid header field"))?;
    }

    match body::request_framing(req.headers())? {
        BodyFraming::Empty => {}
        BodyFraming::ContentLength(n) => {
            let body = work.take_bytes(n).ok_or(ParseError::Incomplete)?;
            req.set_body(body);
        }
        BodyFraming::Chunked => {
            let body = body::decode_chunked(work)?;
            replace_chunked_framing_req(&mut req, body.len())?;
            req.set_body(body);
        }
        // request_framing never returns UntilClose
        BodyFraming::UntilClose => unreachable!(),
    }
    Ok(req)
}

fn parse_status(
    work: &mut MsgBuffer,
    connect_request: bool,
    peer_closed: bool,
) -> Result<Status, ParseError> {
    let line = work.take_crlf_line().map_err(body::line_to_parse_error)?;
    let (version, code, reason) = parse_status_line(&line)?;
    let mut sta = Status::new(version, code, reason);
    for (name, value) in parse_header_block(work)? {
        let value = HeaderValue::from_bytes(&value)
            .map_err(|_| ParseError::BadMessage("invalid header value"))?;
        sta.append_header(name, value)
            .map_err(|_| ParseError::BadMessage("invalid header field"))?;
    }

    match body::response_framing(code, connect_request, sta.headers())? {
        BodyFraming::Empty => {}
        BodyFraming::ContentLength(n) => {
            let body = work.take_bytes(n).ok_or(ParseError::Incomplete)?;
            sta.set_body(body);
        }
        BodyFraming::Chunked => {
            let body = body::decode_chunked(work)?;
            replace_chunked_framing_sta(&mut sta, body.len())?;
            sta.set_body(body);
        }
        BodyFraming::UntilClose => {
            if !peer_closed {
                return Err(ParseError::StatusNotComplete);
            }
            let body = work.take_all();
            sta.set_body(body);
        }
    }
    Ok(sta)
}

// The body was de-chunked, so the serialized message must be framed by
// length from here on. The header rewrite keeps a relayed or cached copy of
// the message parseable.
fn replace_chunked_framing_req(req: &mut Request, len: usize) -> Result<(), ParseError> {
    req.remove_header(&TRANSFER_ENCODING);
    req.remove_header(&CONTENT_LENGTH);
    req.insert_header(CONTENT_LENGTH, len)
        .map_err(|_| ParseError::BadMessage("invalid content-length"))
}

fn replace_chunked_framing_sta(sta: &mut Status, len: usize) -> Result<(), ParseError> {
    sta.remove_header(&TRANSFER_ENCODING);
    sta.remove_header(&CONTENT_LENGTH);
    sta.insert_header(CONTENT_LENGTH, len)
        .map_err(|_| ParseError::BadMessage("invalid content-length"))
}

// request-line = method SP request-target SP HTTP-version
// Exactly two spaces, three non-empty parts. A leading, doubled or trailing
// space makes one of the parts empty or corrupts the version and is
// rejected here.
fn parse_request_line(line: &[u8]) -> Result<(Method, Bytes, Version), ParseError> {
    if line.is_empty() {
        return Err(ParseError::BadMessage("request line is empty"));
    }
    if line.len() > MAX_LINE {
        return Err(ParseError::BadMessage("request line too long"));
    }
    let mut parts = line.split(|b| *b == b' ');
    let method = parts.next().unwrap_or(b"");
    let target = parts.next().unwrap_or(b"");
    let version = parts.next().unwrap_or(b"");
    if parts.next().is_some() {
        return Err(ParseError::BadMessage("unexpected space in request line"));
    }
    if method.is_empty() || target.is_empty() {
        return Err(ParseError::BadMessage("request line incomplete"));
    }

    let method = match method {
        b"GET" => Method::GET,
        b"POST" => Method::POST,
        b"CONNECT" => Method::CONNECT,
        _ => return Err(ParseError::BadMessage("request method not recognized")),
    };
    let version = Version::from_wire(version)
        .ok_or(ParseError::BadMessage("request HTTP version not recognized"))?;
    Ok((method, Bytes::copy_from_slice(target), version))
}

// status-line = HTTP-version SP status-code SP reason-phrase
// The reason phrase is a free-form run to the end of the line and may be
// empty, but the space introducing it is mandatory.
fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode, String), ParseError> {
    if line.is_empty() {
        return Err(ParseError::BadMessage("status line is empty"));
    }
    if line.len() > MAX_LINE {
        return Err(ParseError::BadMessage("status line too long"));
    }
    let sp = line
        .iter()
        .position(|b| *b == b' ')
        .ok_or(ParseError::BadMessage("status line incomplete"))?;
    let version = Version::from_wire(&line[..sp])
        .ok_or(ParseError::BadMessage("status HTTP version not recognized"))?;

    let rest = &line[sp + 1..];
    if rest.len() < 4 || rest[3] != b' ' {
        return Err(ParseError::BadMessage("status line incomplete"));
    }
    let code = &rest[..3];
    if !code.iter().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::BadMessage("status code not recognized"));
    }
    let code = StatusCode::from_bytes(code)
        .map_err(|_| ParseError::BadMessage("status code not recognized"))?;

    let reason = String::from_utf8_lossy(&rest[4..]).into_owned();
    Ok((version, code, reason))
}

// header-field = field-name ":" OWS field-value OWS
// No whitespace inside the field-name or between it and the colon; values
// are stored with surrounding OWS stripped; duplicates are all retained.
fn parse_header_block(work: &mut MsgBuffer) -> Result<Vec<(Bytes, Bytes)>, ParseError> {
    let mut fields = Vec::new();
    loop {
        let line = work.take_crlf_line().map_err(body::line_to_parse_error)?;
        if line.is_empty() {
            return Ok(fields);
        }
        if line.len() > MAX_LINE {
            return Err(ParseError::BadMessage("header line too long"));
        }
        if line[0] == b' ' || line[0] == b'\t' {
            // also rejects obs-fold line continuation
            return Err(ParseError::BadMessage("header line begins with whitespace"));
        }
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or(ParseError::BadMessage("header line missing colon"))?;
        let name = line.slice(..colon);
        if name.is_empty() {
            return Err(ParseError::BadMessage("header name is empty"));
        }
        if name.iter().any(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::BadMessage("whitespace in header name"));
        }
        let value = trim_value(&line, colon + 1);
        fields.push((name, value));
    }
}

fn trim_value(line: &Bytes, from: usize) -> Bytes {
    let bytes = &line[from..];
    let head = bytes
        .iter()
        .position(|b| *b != b' ' && *b != b'\t')
        .unwrap_or(bytes.len());
    let tail = bytes
        .iter()
        .rposition(|b| *b != b' ' && *b != b'\t')
        .map_or(head, |p| p + 1);
    line.slice(from + head..from + tail)
}
