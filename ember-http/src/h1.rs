//! HTTP/1.x head parsing, body framing and response serialization.

use bytes::{Buf, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};

use crate::error::{Error, Parse};
use crate::response::Response;

/// Upper bound on the request head (request line plus header section).
pub(crate) const MAX_HEAD_BYTES: usize = 8192;

/// Request body limit: 30 MiB.
pub(crate) const MAX_BODY_BYTES: usize = 1024 * 1024 * 30;

const MAX_HEADERS: usize = 64;

#[derive(Debug)]
pub(crate) struct Head {
    pub(crate) method: Method,
    pub(crate) version: Version,
    pub(crate) target: String,
    pub(crate) headers: HeaderMap,
}

#[derive(Debug)]
pub(crate) enum ParseStatus {
    /// Head parsed; the request line and headers consumed this many
    /// bytes.
    Complete(Head, usize),
    /// More bytes are needed.
    Partial,
}

pub(crate) fn parse_head(buf: &[u8]) -> Result<ParseStatus, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parser = httparse::Request::new(&mut headers);
    match parser.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let method = parser
                .method
                .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
                .ok_or_else(|| Error::new_parse(Parse::Header))?;
            let version = match parser.version {
                Some(0) => Version::HTTP_10,
                Some(1) => Version::HTTP_11,
                _ => return Err(Error::new_parse(Parse::Version)),
            };
            let target = parser
                .path
                .ok_or_else(|| Error::new_parse(Parse::Header))?
                .to_owned();
            let mut map = HeaderMap::with_capacity(parser.headers.len());
            for h in parser.headers.iter() {
                let name = HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(|err| Error::new_parse(Parse::Header).with(err))?;
                let value = HeaderValue::from_bytes(h.value)
                    .map_err(|err| Error::new_parse(Parse::Header).with(err))?;
                map.append(name, value);
            }
            Ok(ParseStatus::Complete(
                Head {
                    method,
                    version,
                    target,
                    headers: map,
                },
                consumed,
            ))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEAD_BYTES {
                Err(Error::new_parse(Parse::HeadTooLarge))
            } else {
                Ok(ParseStatus::Partial)
            }
        }
        Err(err) => Err(Error::new_parse(Parse::Header).with(err)),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
}

pub(crate) fn body_framing(headers: &HeaderMap) -> Result<BodyFraming, Error> {
    if let Some(te) = headers.get(header::TRANSFER_ENCODING) {
        let te = te
            .to_str()
            .map_err(|err| Error::new_parse(Parse::Framing).with(err))?;
        let chunked_last = te
            .split(',')
            .next_back()
            .is_some_and(|token| token.trim().eq_ignore_ascii_case("chunked"));
        if !chunked_last {
            return Err(Error::new_parse(Parse::Framing));
        }
        return Ok(BodyFraming::Chunked);
    }

    let mut lengths = headers.get_all(header::CONTENT_LENGTH).iter();
    let Some(first) = lengths.next() else {
        return Ok(BodyFraming::None);
    };
    if lengths.next().is_some() {
        return Err(Error::new_parse(Parse::Framing));
    }
    let length: u64 = first
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| Error::new_parse(Parse::Framing))?;
    Ok(BodyFraming::ContentLength(length))
}

/// HTTP/1.1 defaults to keep-alive unless the client says `close`;
/// HTTP/1.0 the other way around.
pub(crate) fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let token = |needle: &str| {
        headers
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(needle)))
    };
    match version {
        Version::HTTP_10 => token("keep-alive"),
        _ => !token("close"),
    }
}

enum ChunkState {
    Size,
    Data(u64),
    DataCrlf,
    Trailer,
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder.
pub(crate) struct ChunkedDecoder {
    state: ChunkState,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    /// Drains as much of `buf` as possible into `out`. Returns `true`
    /// once the terminating chunk and trailer section were consumed.
    pub(crate) fn decode(
        &mut self,
        buf: &mut BytesMut,
        out: &mut Vec<u8>,
        max: usize,
    ) -> Result<bool, Error> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(line_end) = memchr::memchr(b'\n', buf) else {
                        if buf.len() > MAX_HEAD_BYTES {
                            return Err(Error::new_parse(Parse::Framing));
                        }
                        return Ok(false);
                    };
                    let line = &buf[..line_end];
                    let line = line.strip_suffix(b"\r").unwrap_or(line);
                    // Chunk extensions after ';' are ignored.
                    let size_part = match memchr::memchr(b';', line) {
                        Some(at) => &line[..at],
                        None => line,
                    };
                    let size = parse_hex(size_part)?;
                    buf.advance(line_end + 1);
                    if size == 0 {
                        self.state = ChunkState::Trailer;
                    } else {
                        if out.len() as u64 + size > max as u64 {
                            return Err(Error::new_body_too_large());
                        }
                        self.state = ChunkState::Data(size);
                    }
                }
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(false);
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    out.extend_from_slice(&buf[..take]);
                    buf.advance(take);
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        ChunkState::DataCrlf
                    } else {
                        ChunkState::Data(remaining)
                    };
                }
                ChunkState::DataCrlf => {
                    let Some(line_end) = memchr::memchr(b'\n', buf) else {
                        return Ok(false);
                    };
                    if !matches!(&buf[..line_end], [] | [b'\r']) {
                        return Err(Error::new_parse(Parse::Framing));
                    }
                    buf.advance(line_end + 1);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    // Trailer headers are consumed and dropped; an empty
                    // line ends the message.
                    let Some(line_end) = memchr::memchr(b'\n', buf) else {
                        if buf.len() > MAX_HEAD_BYTES {
                            return Err(Error::new_parse(Parse::Framing));
                        }
                        return Ok(false);
                    };
                    let empty = matches!(&buf[..line_end], [] | [b'\r']);
                    buf.advance(line_end + 1);
                    if empty {
                        self.state = ChunkState::Done;
                        return Ok(true);
                    }
                }
                ChunkState::Done => return Ok(true),
            }
        }
    }
}

fn parse_hex(bytes: &[u8]) -> Result<u64, Error> {
    if bytes.is_empty() || bytes.len() > 16 {
        return Err(Error::new_parse(Parse::Framing));
    }
    let mut value: u64 = 0;
    for &b in bytes {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(Error::new_parse(Parse::Framing)),
        };
        value = (value << 4) | u64::from(digit);
    }
    Ok(value)
}

/// Serializes the response head and body into `buf`, mirroring the
/// request's HTTP version.
pub(crate) fn encode_response(res: &Response, version: Version, buf: &mut Vec<u8>) {
    buf.extend_from_slice(match version {
        Version::HTTP_10 => b"HTTP/1.0 ",
        _ => b"HTTP/1.1 ",
    });
    let status = res.status();
    let mut code = itoa::Buffer::new();
    buf.extend_from_slice(code.format(status.as_u16()).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buf.extend_from_slice(b"\r\n");

    for (name, value) in res.headers.iter() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if body_allowed(status) {
        buf.extend_from_slice(b"content-length: ");
        let mut length = itoa::Buffer::new();
        buf.extend_from_slice(length.format(res.body().len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if res.keep_alive {
        if version == Version::HTTP_10 {
            buf.extend_from_slice(b"connection: keep-alive\r\n");
        }
    } else {
        buf.extend_from_slice(b"connection: close\r\n");
    }

    buf.extend_from_slice(b"\r\n");
    if body_allowed(status) {
        buf.extend_from_slice(res.body());
    }
}

fn body_allowed(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_request() {
        let buf = b"GET /a/42/b?x=1 HTTP/1.1\r\nHost: bmc\r\nAccept: */*\r\n\r\n";
        let ParseStatus::Complete(head, consumed) = parse_head(buf).unwrap() else {
            panic!("expected a complete head");
        };
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.target, "/a/42/b?x=1");
        assert_eq!(head.headers.get(header::HOST).unwrap(), "bmc");
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn incomplete_head_is_partial() {
        assert!(matches!(
            parse_head(b"GET / HTTP/1.1\r\nHos").unwrap(),
            ParseStatus::Partial
        ));
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut buf = b"GET / HTTP/1.1\r\nx-pad: ".to_vec();
        buf.extend(std::iter::repeat_n(b'a', MAX_HEAD_BYTES + 1));
        let err = parse_head(&buf).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(parse_head(b"\0\0\0\r\n\r\n").is_err());
    }

    #[test]
    fn unsupported_version_is_rejected() {
        // httparse rejects the version digit itself
        assert!(parse_head(b"GET / HTTP/2.4\r\n\r\n").is_err());
    }

    #[test]
    fn framing_prefers_chunked_and_validates_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(body_framing(&headers).unwrap(), BodyFraming::None);

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("17"));
        assert_eq!(
            body_framing(&headers).unwrap(),
            BodyFraming::ContentLength(17)
        );

        headers.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("gzip, chunked"),
        );
        assert_eq!(body_framing(&headers).unwrap(), BodyFraming::Chunked);

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("nope"));
        assert!(body_framing(&headers).is_err());

        let mut headers = HeaderMap::new();
        headers.append(header::CONTENT_LENGTH, HeaderValue::from_static("1"));
        headers.append(header::CONTENT_LENGTH, HeaderValue::from_static("2"));
        assert!(body_framing(&headers).is_err());
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        let empty = HeaderMap::new();
        assert!(keep_alive(Version::HTTP_11, &empty));
        assert!(!keep_alive(Version::HTTP_10, &empty));

        let mut close = HeaderMap::new();
        close.insert(header::CONNECTION, HeaderValue::from_static("close"));
        assert!(!keep_alive(Version::HTTP_11, &close));

        let mut ka = HeaderMap::new();
        ka.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(keep_alive(Version::HTTP_10, &ka));
    }

    #[test]
    fn chunked_decode_in_one_feed() {
        let mut buf = BytesMut::from(&b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\n"[..]);
        let mut out = Vec::new();
        let mut decoder = ChunkedDecoder::new();
        assert!(decoder.decode(&mut buf, &mut out, 1024).unwrap());
        assert_eq!(out, b"Wikipedia");
        assert!(buf.is_empty());
    }

    #[test]
    fn chunked_decode_across_feeds() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();

        let mut buf = BytesMut::from(&b"6\r\nab"[..]);
        assert!(!decoder.decode(&mut buf, &mut out, 1024).unwrap());

        buf.extend_from_slice(b"cdef\r\n0\r\n");
        assert!(!decoder.decode(&mut buf, &mut out, 1024).unwrap());

        buf.extend_from_slice(b"x-trailer: 1\r\n\r\n");
        assert!(decoder.decode(&mut buf, &mut out, 1024).unwrap());
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn chunked_decode_enforces_limit() {
        let mut buf = BytesMut::from(&b"ff\r\n"[..]);
        let mut out = Vec::new();
        let mut decoder = ChunkedDecoder::new();
        let err = decoder.decode(&mut buf, &mut out, 16).unwrap_err();
        assert!(err.is_body_too_large());
    }

    #[test]
    fn chunked_decode_rejects_bad_size() {
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();
        assert!(decoder
            .decode(&mut buf, &mut Vec::new(), 1024)
            .is_err());
    }

    #[test]
    fn encodes_response_with_length_and_connection() {
        let mut res = Response::new();
        res.set_status(StatusCode::OK);
        res.write("n=42");
        res.keep_alive = false;
        let mut buf = Vec::new();
        encode_response(&res, Version::HTTP_11, &mut buf);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 4\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nn=42"));
    }

    #[test]
    fn http10_keep_alive_is_explicit() {
        let res = Response::new();
        let mut buf = Vec::new();
        encode_response(&res, Version::HTTP_10, &mut buf);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("connection: keep-alive\r\n"));
    }

    #[test]
    fn no_content_omits_length_and_body() {
        let mut res = Response::new();
        res.set_status(StatusCode::NO_CONTENT);
        let mut buf = Vec::new();
        encode_response(&res, Version::HTTP_11, &mut buf);
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("content-length"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
