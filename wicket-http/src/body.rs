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

//! Message body framing per RFC 7230 section 3.3.3.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::StatusCode;
use log::warn;
use std::str;

use crate::buffer::{LineError, MsgBuffer};
use crate::parser::ParseError;
use crate::HMap;

/// How the body of the message being parsed is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body, regardless of any framing headers.
    Empty,
    /// Exactly this many octets follow the header block.
    ContentLength(usize),
    /// Chunked transfer coding.
    Chunked,
    /// The body runs until the peer closes the connection (responses only).
    UntilClose,
}

/// Resolve the framing of a request body. The rules, in precedence order:
/// chunked transfer coding, rejected non-chunked codings, a single valid
/// `Content-Length`, otherwise no body.
pub(crate) fn request_framing(headers: &HMap<HeaderValue>) -> Result<BodyFraming, ParseError> {
    if headers.contains_key(TRANSFER_ENCODING) {
        // transfer-encoding takes priority over content-length
        return if final_encoding_is_chunked(headers) {
            Ok(BodyFraming::Chunked)
        } else {
            // a request body whose end cannot be determined
            Err(ParseError::BadMessage(
                "request transfer coding does not end with chunked",
            ))
        };
    }
    match single_content_length(headers)? {
        Some(n) => Ok(BodyFraming::ContentLength(n)),
        None => Ok(BodyFraming::Empty),
    }
}

/// Resolve the framing of a response body.
///
/// `connect_request` marks a response to a CONNECT, whose 2xx has no body no
/// matter what the headers claim.
pub(crate) fn response_framing(
    code: StatusCode,
    connect_request: bool,
    headers: &HMap<HeaderValue>,
) -> Result<BodyFraming, ParseError> {
    if code.is_informational() || code == StatusCode::NO_CONTENT || code == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::Empty);
    }
    if connect_request && code.is_success() {
        return Ok(BodyFraming::Empty);
    }
    if headers.contains_key(TRANSFER_ENCODING) {
        return if final_encoding_is_chunked(headers) {
            Ok(BodyFraming::Chunked)
        } else {
            // only the closing of the connection can delimit this body
            Ok(BodyFraming::UntilClose)
        };
    }
    match single_content_length(headers)? {
        Some(n) => Ok(BodyFraming::ContentLength(n)),
        None => Ok(BodyFraming::UntilClose),
    }
}

// Whether the final transfer-coding token across all Transfer-Encoding
// header lines is `chunked`.
fn final_encoding_is_chunked(headers: &HMap<HeaderValue>) -> bool {
    let mut last: Option<&[u8]> = None;
    for value in headers.get_all(TRANSFER_ENCODING) {
        for token in value.as_bytes().split(|b| *b == b',') {
            let token = trim_ows(token);
            if !token.is_empty() {
                last = Some(token);
            }
        }
    }
    last.map_or(false, |t| t.eq_ignore_ascii_case(b"chunked"))
}

// A single valid Content-Length, None when absent. Multiple headers or a
// non-numeric/negative value are a hard protocol violation.
fn single_content_length(headers: &HMap<HeaderValue>) -> Result<Option<usize>, ParseError> {
    let mut values = headers.get_all(CONTENT_LENGTH).iter();
    let Some(value) = values.next() else {
        return Ok(None);
    };
    if values.next().is_some() {
        return Err(ParseError::BadMessage("multiple content-length headers"));
    }
    let value = str::from_utf8(value.as_bytes())
        .map_err(|_| ParseError::BadMessage("invalid content-length encoding"))?;
    match value.parse::<i64>() {
        Ok(n) if n >= 0 => Ok(Some(n as usize)),
        Ok(n) => {
            warn!("negative content-length header value {n}");
            Err(ParseError::BadMessage("negative content-length"))
        }
        Err(_) => Err(ParseError::BadMessage("non-numeric content-length")),
    }
}

fn trim_ows(bytes: &[u8]) -> &[u8] {
    fn not_ows(b: &u8) -> bool {
        *b != b' ' && *b != b'\t'
    }
    let head = bytes.iter().position(not_ows).unwrap_or(bytes.len());
    let tail = bytes.iter().rposition(not_ows).map_or(head, |p| p + 1);
    &bytes[head..tail]
}

/// Decode a chunked body from the front of `work`, consuming the chunk
/// grammar (`chunk-size [chunk-ext] CRLF chunk-data CRLF ... 0 CRLF
/// trailer* CRLF`) and returning the reassembled octets. Trailer fields are
/// consumed and discarded.
pub(crate) fn decode_chunked(work: &mut MsgBuffer) -> Result<Bytes, ParseError> {
    let mut body = BytesMut::new();
    loop {
        let (payload_index, chunk_size) = match httparse::parse_chunk_size(work.as_slice()) {
            Ok(httparse::Status::Complete((idx, size))) => (idx, size as usize),
            Ok(httparse::Status::Partial) => return Err(ParseError::Incomplete),
            Err(_) => return Err(ParseError::BadMessage("invalid chunk size")),
        };
        if chunk_size == 0 {
            // terminating chunk; what follows is zero or more trailers and
            // the final empty line
            work.advance(payload_index);
            loop {
                let line = work.take_crlf_line().map_err(line_to_parse_error)?;
                if line.is_empty() {
                    return Ok(body.freeze());
                }
            }
        }
        let data_end = payload_index + chunk_size;
        if work.len() < data_end + 2 {
            return Err(ParseError::Incomplete);
        }
        let slice = work.as_slice();
        if &slice[data_end..data_end + 2] != b"\r\n" {
            return Err(ParseError::BadMessage("chunk data not followed by CRLF"));
        }
        body.extend_from_slice(&slice[payload_index..data_end]);
        work.advance(data_end + 2);
    }
}

pub(crate) fn line_to_parse_error(e: LineError) -> ParseError {
    match e {
        LineError::Incomplete => ParseError::Incomplete,
        LineError::BareLf => ParseError::BadMessage("bare LF in message"),
        LineError::CrWithoutLf => ParseError::BadMessage("CR not followed by LF"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HMap<HeaderValue> {
        let mut map = HMap::new();
        for (k, v) in pairs {
            map.append(
                http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_request_framing() {
        assert_eq!(request_framing(&headers(&[])).unwrap(), BodyFraming::Empty);
        assert_eq!(
            request_framing(&headers(&[("content-length", "12")])).unwrap(),
            BodyFraming::ContentLength(12)
        );
        assert_eq!(
            request_framing(&headers(&[("transfer-encoding", "chunked")])).unwrap(),
            BodyFraming::Chunked
        );
        // transfer-encoding wins over content-length
        assert_eq!(
            request_framing(&headers(&[
                ("transfer-encoding", "chunked"),
                ("content-length", "12")
            ]))
            .unwrap(),
            BodyFraming::Chunked
        );
        // non-chunked final coding is not acceptable on a request
        assert!(request_framing(&headers(&[("transfer-encoding", "gzip")])).is_err());
    }

    #[test]
    fn test_final_encoding_token() {
        assert!(final_encoding_is_chunked(&headers(&[(
            "transfer-encoding",
            "gzip, chunked"
        )])));
        assert!(final_encoding_is_chunked(&headers(&[(
            "transfer-encoding",
            "CHUNKED"
        )])));
        assert!(!final_encoding_is_chunked(&headers(&[(
            "transfer-encoding",
            "chunked, gzip"
        )])));
    }

    #[test]
    fn test_response_framing_implicit_empty() {
        for code in [100, 101, 204, 304] {
            let f = response_framing(
                StatusCode::from_u16(code).unwrap(),
                false,
                &headers(&[("content-length", "10")]),
            )
            .unwrap();
            assert_eq!(f, BodyFraming::Empty, "code {code}");
        }
        // 2xx to a CONNECT ignores framing headers
        assert_eq!(
            response_framing(StatusCode::OK, true, &headers(&[("content-length", "10")])).unwrap(),
            BodyFraming::Empty
        );
        // but a non-2xx to a CONNECT frames normally
        assert_eq!(
            response_framing(
                StatusCode::FORBIDDEN,
                true,
                &headers(&[("content-length", "10")])
            )
            .unwrap(),
            BodyFraming::ContentLength(10)
        );
    }

    #[test]
    fn test_response_framing_until_close() {
        assert_eq!(
            response_framing(StatusCode::OK, false, &headers(&[])).unwrap(),
            BodyFraming::UntilClose
        );
        assert_eq!(
            response_framing(StatusCode::OK, false, &headers(&[("transfer-encoding", "gzip")]))
                .unwrap(),
            BodyFraming::UntilClose
        );
    }

    #[test]
    fn test_content_length_validation() {
        assert!(single_content_length(&headers(&[("content-length", "abc")])).is_err());
        assert!(single_content_length(&headers(&[("content-length", "-1")])).is_err());
        assert!(single_content_length(&headers(&[
            ("content-length", "3"),
            ("content-length", "3")
        ]))
        .is_err());
        assert_eq!(
            single_content_length(&headers(&[("content-length", "0")])).unwrap(),
            Some(0)
        );
    }

    #[test]
    fn test_decode_chunked() {
        let mut buf = MsgBuffer::from_slice(b"3\r\nabc\r\n4\r\ndefg\r\n0\r\n\r\nrest");
        let body = decode_chunked(&mut buf).unwrap();
        assert_eq!(body, &b"abcdefg"[..]);
        assert_eq!(buf.as_slice(), b"rest");
    }

    #[test]
    fn test_decode_chunked_with_ext_and_trailer() {
        let mut buf =
            MsgBuffer::from_slice(b"3;name=val\r\nabc\r\n0\r\nExpires: whenever\r\n\r\n");
        let body = decode_chunked(&mut buf).unwrap();
        assert_eq!(body, &b"abc"[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_chunked_incomplete() {
        // chunk head not complete
        let mut buf = MsgBuffer::from_slice(b"3");
        assert_eq!(decode_chunked(&mut buf), Err(ParseError::Incomplete));
        // chunk data not complete
        let mut buf = MsgBuffer::from_slice(b"3\r\nab");
        assert_eq!(decode_chunked(&mut buf), Err(ParseError::Incomplete));
        // missing terminating chunk
        let mut buf = MsgBuffer::from_slice(b"3\r\nabc\r\n");
        assert_eq!(decode_chunked(&mut buf), Err(ParseError::Incomplete));
    }

    #[test]
    fn test_decode_chunked_malformed() {
        let mut buf = MsgBuffer::from_slice(b"zz\r\nabc\r\n");
        assert!(matches!(
            decode_chunked(&mut buf),
            Err(ParseError::BadMessage(_))
        ));
        // data does not end with CRLF where the chunk size says it should
        let mut buf = MsgBuffer::from_slice(b"3\r\nabcd\r\n0\r\n\r\n");
        assert!(matches!(
            decode_chunked(&mut buf),
            Err(ParseError::BadMessage(_))
        ));
    }
}
