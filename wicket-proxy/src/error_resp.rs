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

//! Error response generating utilities.

use bytes::Bytes;
use wicket_http::{Status, StatusCode, Version};

/// Generate an error response with the given status code and a small HTML
/// page carrying `detail`.
pub fn gen_error_response(code: StatusCode, detail: &str) -> Status {
    let reason = code.canonical_reason().unwrap_or("Error");
    let body = format!(
        "<html><head><title>{} {reason}</title></head>\n\
         <body><h1>{} {reason}</h1>\n\
         <p>{detail}</p>\n\
         </body></html>\n",
        code.as_str(),
        code.as_str(),
    );
    let mut resp = Status::new(Version::HTTP_11, code, reason);
    resp.insert_header("Content-Type", "text/html").unwrap();
    resp.insert_header("Content-Length", body.len()).unwrap();
    resp.insert_header("Cache-Control", "private, no-store")
        .unwrap();
    resp.set_body(Bytes::from(body));
    resp
}

/// The 400 sent for malformed client requests.
pub fn bad_request(detail: &str) -> Status {
    gen_error_response(StatusCode::BAD_REQUEST, detail)
}

/// The 502 sent when the origin misbehaves or is unreachable.
pub fn bad_gateway(detail: &str) -> Status {
    gen_error_response(StatusCode::BAD_GATEWAY, detail)
}
