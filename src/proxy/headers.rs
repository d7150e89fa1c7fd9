/* httpctl (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use http::{
    header::{CONNECTION, CONTENT_LENGTH, HOST, SET_COOKIE, TE},
    HeaderMap, HeaderName, HeaderValue,
};

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "proxy-authorization",
    "proxy-authenticate",
];

/// True for hop-by-hop names, including any listed in the message's `Connection` header.
fn is_hop_by_hop(name: &HeaderName, listed: &[String]) -> bool {
    let name = name.as_str();
    HOP_BY_HOP_HEADERS.contains(&name) || listed.iter().any(|l| l == name)
}

fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Request headers for the origin leg.
///
/// Hop-by-hop fields go; so does `Content-Length` (the body is re-framed from the buffered
/// copy). `Host` is kept for HTTP/1.1 and dropped for HTTP/2 and HTTP/3, which carry the
/// authority as a pseudo-header.
pub fn origin_request_headers(headers: &HeaderMap, keep_host: bool) -> HeaderMap {
    let listed = connection_listed(headers);
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name, &listed) || name == CONTENT_LENGTH {
            continue;
        }
        if name == HOST && !keep_host {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    // `te: trailers` is the one TE value HTTP/2 allows through.
    if !keep_host
        && headers
            .get(TE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("trailers"))
    {
        out.insert(TE, HeaderValue::from_static("trailers"));
    }
    out
}

/// Response headers for the client leg.
///
/// Hop-by-hop fields are stripped. Repeated fields are folded into one value joined with
/// `", "`, except `Set-Cookie`, whose values cannot be folded.
pub fn client_response_headers(headers: &HeaderMap) -> HeaderMap {
    let listed = connection_listed(headers);
    let mut out = HeaderMap::with_capacity(headers.keys_len());
    for name in headers.keys() {
        if is_hop_by_hop(name, &listed) {
            continue;
        }
        let values: Vec<&HeaderValue> = headers.get_all(name).iter().collect();
        if name == SET_COOKIE || values.len() == 1 {
            for value in values {
                out.append(name.clone(), value.clone());
            }
            continue;
        }

        let joined = values
            .iter()
            .map(|v| v.as_bytes())
            .collect::<Vec<_>>()
            .join(&b", "[..]);
        match HeaderValue::from_bytes(&joined) {
            Ok(value) => {
                out.insert(name.clone(), value);
            }
            Err(_) => {
                for value in values {
                    out.append(name.clone(), value.clone());
                }
            }
        }
    }
    out
}
