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

//! HTTP/1.1 message objects that preserve the bytes they were parsed from
//!
//! A proxy ideally shouldn't alter the traffic it relays. The [Request] and
//! [Status] types here keep the request-target, the HTTP version digits, the
//! reason phrase and the original case of every header name exactly as
//! received, so that a message can be serialized back to the wire (and into
//! the cache) byte for byte.
//!
//! Header fields form a multiset: a name may repeat with different values,
//! and appending never drops the earlier entries.

#![allow(clippy::new_without_default)]

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{AsHeaderName, HeaderName, HeaderValue};
use std::fmt;

pub use http::method::Method;
pub use http::status::StatusCode;
pub use http::HeaderMap as HMap;

mod buffer;
mod case_header_name;
pub mod parser;
pub mod target;

pub(crate) mod body;

pub use buffer::{LineError, MsgBuffer};
pub use case_header_name::IntoCaseHeaderName;
use case_header_name::CaseHeaderName;
pub use parser::{ParseError, RequestParser, StatusParser};

use wicket_error::{ErrorKind::*, OrErr, Result};

pub const CRLF: &[u8; 2] = b"\r\n";
pub const HEADER_KV_DELIMITER: &[u8; 2] = b": ";

// The original spelling of every header name, kept in a second HeaderMap
// that shadows the value map: "foo" -> ["Foo", "foO", "FoO"]. HeaderMap
// iteration order is "arbitrary, but consistent", so two maps fed the same
// sequence of appends iterate in step; header_to_h1_wire zips them on that
// basis.
type CaseMap = HMap<CaseHeaderName>;

/// The HTTP version as received on the wire: `HTTP/<major>.<minor>`.
///
/// Unlike [http::Version] this keeps the two digits verbatim, so that e.g. a
/// `HTTP/1.0` origin response round-trips unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_10: Version = Version { major: 1, minor: 0 };
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };

    /// Parse `HTTP/<d>.<d>`, exactly 8 bytes. None on any deviation.
    pub fn from_wire(buf: &[u8]) -> Option<Self> {
        if buf.len() != 8 || &buf[..5] != b"HTTP/" || buf[6] != b'.' {
            return None;
        }
        if !buf[5].is_ascii_digit() || !buf[7].is_ascii_digit() {
            return None;
        }
        Some(Version {
            major: buf[5] - b'0',
            minor: buf[7] - b'0',
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// The HTTP request message type.
///
/// Holds the request line, the header multiset and the body octets. The
/// request-target is kept as raw bytes; [target](crate::target) decomposes it
/// into absolute-form or authority-form when the proxy needs to dial out.
#[derive(Debug)]
pub struct Request {
    method: Method,
    target: Bytes,
    version: Version,
    headers: HMap<HeaderValue>,
    header_name_map: CaseMap,
    body: Bytes,
}

impl Request {
    /// Create a new [Request] with the given method and raw request-target.
    pub fn new(method: Method, target: impl Into<Bytes>, version: Version) -> Self {
        Request {
            method,
            target: target.into(),
            version,
            headers: HMap::new(),
            header_name_map: CaseMap::with_capacity(0),
            body: Bytes::new(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request-target exactly as received.
    pub fn raw_target(&self) -> &[u8] {
        &self.target
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HMap<HeaderValue> {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    /// Append the header name and value to `self`.
    ///
    /// If there are already some headers under the same name, a new value will be added without
    /// any others being removed.
    pub fn append_header(
        &mut self,
        name: impl IntoCaseHeaderName,
        value: impl TryInto<HeaderValue>,
    ) -> Result<bool> {
        let header_value = value
            .try_into()
            .explain_err(InvalidHTTPHeader, |_| "invalid value while append")?;
        append_header_value(
            &mut self.header_name_map,
            &mut self.headers,
            name,
            header_value,
        )
    }

    /// Insert the header name and value to `self`.
    ///
    /// Different from [Self::append_header()], this method will replace all other existing headers
    /// under the same name (case-insensitive).
    pub fn insert_header(
        &mut self,
        name: impl IntoCaseHeaderName,
        value: impl TryInto<HeaderValue>,
    ) -> Result<()> {
        let header_value = value
            .try_into()
            .explain_err(InvalidHTTPHeader, |_| "invalid value while insert")?;
        insert_header_value(
            &mut self.header_name_map,
            &mut self.headers,
            name,
            header_value,
        )
    }

    /// Remove all headers under the name
    pub fn remove_header<'a, N: ?Sized>(&mut self, name: &'a N) -> Option<HeaderValue>
    where
        &'a N: 'a + AsHeaderName,
    {
        remove_header(&mut self.header_name_map, &mut self.headers, name)
    }

    /// The request line without its CRLF, e.g. `GET http://h/x HTTP/1.1`.
    pub fn start_line(&self) -> String {
        format!(
            "{} {} {}",
            self.method,
            String::from_utf8_lossy(&self.target),
            self.version
        )
    }

    /// Whether two requests share the same request line.
    ///
    /// This is the cache key comparison: header variation is ignored.
    pub fn start_line_eq(&self, other: &Request) -> bool {
        self.method == other.method && self.target == other.target && self.version == other.version
    }

    /// Serialize the whole message in HTTP/1.1 wire format.
    ///
    /// The header case will be preserved.
    pub fn to_wire(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256 + self.body.len());
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(&self.target);
        buf.put_u8(b' ');
        buf.put_slice(self.version.to_string().as_bytes());
        buf.put_slice(CRLF);
        header_to_h1_wire(&self.header_name_map, &self.headers, &mut buf);
        buf.put_slice(CRLF);
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

impl Clone for Request {
    fn clone(&self) -> Self {
        Request {
            method: self.method.clone(),
            target: self.target.clone(),
            version: self.version,
            headers: self.headers.clone(),
            header_name_map: self.header_name_map.clone(),
            body: self.body.clone(),
        }
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.start_line_eq(other) && self.headers == other.headers && self.body == other.body
    }
}

impl Eq for Request {}

/// The HTTP response message type.
///
/// The reason phrase is stored verbatim; an origin that says `200 Okey-dokey`
/// is relayed as such.
#[derive(Debug)]
pub struct Status {
    version: Version,
    code: StatusCode,
    reason: String,
    headers: HMap<HeaderValue>,
    header_name_map: CaseMap,
    body: Bytes,
}

impl Status {
    /// Create a new [Status] with the given status code.
    pub fn new(version: Version, code: StatusCode, reason: impl Into<String>) -> Self {
        Status {
            version,
            code,
            reason: reason.into(),
            headers: HMap::new(),
            header_name_map: CaseMap::with_capacity(0),
            body: Bytes::new(),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &HMap<HeaderValue> {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    /// Append the header name and value to `self`, keeping existing entries
    /// under the same name.
    pub fn append_header(
        &mut self,
        name: impl IntoCaseHeaderName,
        value: impl TryInto<HeaderValue>,
    ) -> Result<bool> {
        let header_value = value
            .try_into()
            .explain_err(InvalidHTTPHeader, |_| "invalid value while append")?;
        append_header_value(
            &mut self.header_name_map,
            &mut self.headers,
            name,
            header_value,
        )
    }

    /// Insert the header name and value to `self`, replacing all existing
    /// entries under the same name (case-insensitive).
    pub fn insert_header(
        &mut self,
        name: impl IntoCaseHeaderName,
        value: impl TryInto<HeaderValue>,
    ) -> Result<()> {
        let header_value = value
            .try_into()
            .explain_err(InvalidHTTPHeader, |_| "invalid value while insert")?;
        insert_header_value(
            &mut self.header_name_map,
            &mut self.headers,
            name,
            header_value,
        )
    }

    /// Remove all headers under the name
    pub fn remove_header<'a, N: ?Sized>(&mut self, name: &'a N) -> Option<HeaderValue>
    where
        &'a N: 'a + AsHeaderName,
    {
        remove_header(&mut self.header_name_map, &mut self.headers, name)
    }

    /// The status line without its CRLF, e.g. `HTTP/1.1 200 OK`.
    pub fn status_line(&self) -> String {
        format!("{} {} {}", self.version, self.code.as_str(), self.reason)
    }

    /// Serialize the whole message in HTTP/1.1 wire format.
    pub fn to_wire(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256 + self.body.len());
        buf.put_slice(self.version.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.code.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.reason.as_bytes());
        buf.put_slice(CRLF);
        header_to_h1_wire(&self.header_name_map, &self.headers, &mut buf);
        buf.put_slice(CRLF);
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

impl Clone for Status {
    fn clone(&self) -> Self {
        Status {
            version: self.version,
            code: self.code,
            reason: self.reason.clone(),
            headers: self.headers.clone(),
            header_name_map: self.header_name_map.clone(),
            body: self.body.clone(),
        }
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.code == other.code
            && self.reason == other.reason
            && self.headers == other.headers
            && self.body == other.body
    }
}

impl Eq for Status {}

#[inline]
fn append_header_value<T>(
    name_map: &mut CaseMap,
    value_map: &mut HMap<T>,
    name: impl IntoCaseHeaderName,
    value: T,
) -> Result<bool> {
    let case_header_name = name.into_case_header_name();
    let header_name: HeaderName = case_header_name
        .as_slice()
        .try_into()
        .or_err(InvalidHTTPHeader, "invalid header name")?;
    // store the original case in the map
    name_map.append(header_name.clone(), case_header_name);
    Ok(value_map.append(header_name, value))
}

#[inline]
fn insert_header_value<T>(
    name_map: &mut CaseMap,
    value_map: &mut HMap<T>,
    name: impl IntoCaseHeaderName,
    value: T,
) -> Result<()> {
    let case_header_name = name.into_case_header_name();
    let header_name: HeaderName = case_header_name
        .as_slice()
        .try_into()
        .or_err(InvalidHTTPHeader, "invalid header name")?;
    // store the original case in the map
    name_map.insert(header_name.clone(), case_header_name);
    value_map.insert(header_name, value);
    Ok(())
}

// the &N here is to avoid clone(). None Copy type like String can impl AsHeaderName
#[inline]
fn remove_header<'a, T, N: ?Sized>(
    name_map: &mut CaseMap,
    value_map: &mut HMap<T>,
    name: &'a N,
) -> Option<T>
where
    &'a N: 'a + AsHeaderName,
{
    let removed = value_map.remove(name);
    if removed.is_some() {
        name_map.remove(name);
    }
    removed
}

#[inline]
fn header_to_h1_wire(key_map: &CaseMap, value_map: &HMap<HeaderValue>, buf: &mut impl BufMut) {
    let iter = key_map.iter().zip(value_map.iter());
    for ((header, case_header), (header2, val)) in iter {
        if header != header2 {
            // in case the header iteration order changes in future versions of HMap
            panic!("header iter mismatch {}, {}", header, header2)
        }
        buf.put_slice(case_header.as_slice());
        buf.put_slice(HEADER_KV_DELIMITER);
        buf.put_slice(val.as_ref());
        buf.put_slice(CRLF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_from_wire() {
        assert_eq!(Version::from_wire(b"HTTP/1.1"), Some(Version::HTTP_11));
        assert_eq!(
            Version::from_wire(b"HTTP/2.0"),
            Some(Version { major: 2, minor: 0 })
        );
        assert_eq!(Version::from_wire(b"HTTP/1."), None);
        assert_eq!(Version::from_wire(b"HTTP/x.1"), None);
        assert_eq!(Version::from_wire(b"http/1.1"), None);
        assert_eq!(Version::from_wire(b"HTTP/1.1 "), None);
    }

    #[test]
    fn test_single_header() {
        let mut req = Request::new(Method::GET, &b"http://example.org/"[..], Version::HTTP_11);
        req.insert_header("foo", "bar").unwrap();
        req.insert_header("FoO", "Bar").unwrap();
        let wire = req.to_wire();
        assert_eq!(wire, &b"GET http://example.org/ HTTP/1.1\r\nFoO: Bar\r\n\r\n"[..]);
    }

    #[test]
    fn test_multiple_header() {
        let mut req = Request::new(Method::GET, &b"http://h/x"[..], Version::HTTP_11);
        req.append_header("FoO", "Bar").unwrap();
        req.append_header("fOO", "bar").unwrap();
        req.append_header("BAZ", "baR").unwrap();
        req.append_header(http::header::CONTENT_LENGTH, "0").unwrap();
        req.append_header("a", "b").unwrap();
        req.remove_header("a");
        let wire = req.to_wire();
        assert_eq!(
            wire,
            &b"GET http://h/x HTTP/1.1\r\nFoO: Bar\r\nfOO: bar\r\nBAZ: baR\r\nContent-Length: 0\r\n\r\n"[..]
        );
    }

    #[test]
    fn test_start_line_eq() {
        let a = Request::new(Method::GET, &b"http://h/x"[..], Version::HTTP_11);
        let mut b = Request::new(Method::GET, &b"http://h/x"[..], Version::HTTP_11);
        b.append_header("Host", "h").unwrap();
        assert!(a.start_line_eq(&b));
        assert_ne!(a, b);

        let c = Request::new(Method::POST, &b"http://h/x"[..], Version::HTTP_11);
        assert!(!a.start_line_eq(&c));
        let d = Request::new(Method::GET, &b"http://h/y"[..], Version::HTTP_11);
        assert!(!a.start_line_eq(&d));
    }

    #[test]
    fn test_status_wire() {
        let mut sta = Status::new(Version::HTTP_11, StatusCode::OK, "OK");
        sta.append_header("Content-Length", "3").unwrap();
        sta.set_body(Bytes::from_static(b"abc"));
        assert_eq!(sta.status_line(), "HTTP/1.1 200 OK");
        assert_eq!(
            sta.to_wire(),
            &b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc"[..]
        );
    }

    #[test]
    fn test_status_custom_reason() {
        let sta = Status::new(Version::HTTP_10, StatusCode::OK, "Okey-dokey");
        assert_eq!(sta.to_wire(), &b"HTTP/1.0 200 Okey-dokey\r\n\r\n"[..]);
    }
}
