//! The RFC 6455 server handshake.

use base64::Engine as _;
use ember_http::Request;
use sha1::{Digest, Sha1};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// Injected into every 101 response; management consoles are browsers.
const SECURITY_HEADERS: &[(&str, &str)] = &[
    (
        "strict-transport-security",
        "max-age=31536000; includeSubdomains; preload",
    ),
    ("pragma", "no-cache"),
    ("cache-control", "no-Store,no-Cache"),
    ("content-security-policy", "default-src 'self'"),
    ("x-xss-protection", "1; mode=block"),
    ("x-content-type-options", "nosniff"),
];

pub(crate) fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(sha.finalize())
}

/// Builds the `101 Switching Protocols` response, echoing the requested
/// subprotocol. `None` when the request carries no `Sec-WebSocket-Key`.
pub(crate) fn accept_response(req: &Request) -> Option<Vec<u8>> {
    let key = req.header("sec-websocket-key")?.trim();
    if key.is_empty() {
        return None;
    }

    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    out.extend_from_slice(b"upgrade: websocket\r\n");
    out.extend_from_slice(b"connection: Upgrade\r\n");
    out.extend_from_slice(b"sec-websocket-accept: ");
    out.extend_from_slice(accept_key(key).as_bytes());
    out.extend_from_slice(b"\r\n");
    if let Some(protocol) = req.header("sec-websocket-protocol") {
        if !protocol.is_empty() {
            out.extend_from_slice(b"sec-websocket-protocol: ");
            out.extend_from_slice(protocol.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    for (name, value) in SECURITY_HEADERS {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::header::{HeaderMap, HeaderValue};
    use http::{Method, Version};

    fn upgrade_request(headers: &[(&str, &str)]) -> Request {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        Request::new(
            Method::GET,
            Version::HTTP_11,
            "/console".to_owned(),
            map,
            Bytes::new(),
            true,
        )
    }

    #[test]
    fn accept_key_matches_rfc_sample() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn response_echoes_protocol_and_injects_security_headers() {
        let req = upgrade_request(&[
            ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("sec-websocket-protocol", "console.v1"),
        ]);
        let out = accept_response(&req).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("sec-websocket-protocol: console.v1\r\n"));
        assert!(text.contains("content-security-policy: default-src 'self'\r\n"));
        assert!(text.contains("x-content-type-options: nosniff\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn missing_key_is_rejected() {
        let req = upgrade_request(&[("upgrade", "websocket")]);
        assert!(accept_response(&req).is_none());
    }
}
