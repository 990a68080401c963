//! HTTP request parser.
//!
//! Decoding is deliberately permissive: malformed input never fails, it
//! produces a best-effort [`Request`] plus a [`Leniency`] record of what was
//! discarded, so the caller decides how strict to be.

use super::Headers;
use bytes::Bytes;
use std::collections::HashMap;

/// A decoded HTTP request. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Request target without the query string.
    pub path: String,
    /// Raw query string (without `?`), empty when absent.
    pub query: String,
    pub query_params: HashMap<String, String>,
    pub version: String,
    pub headers: Headers,
    pub cookies: HashMap<String, String>,
    pub body: Bytes,
    pub is_chunked: bool,
    pub leniency: Leniency,
}

/// What the parser dropped or could not make sense of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Leniency {
    /// Request line had fewer than three tokens; method, path and version are empty.
    pub malformed_request_line: bool,
    /// Query pairs without exactly one `=`.
    pub dropped_query_pairs: usize,
    /// Cookie pairs without `=` or with an empty name.
    pub dropped_cookie_pairs: usize,
    /// Chunked body ended early on a garbled size line or short data.
    pub chunked_truncated: bool,
}

impl Leniency {
    /// True when nothing was discarded.
    pub fn is_clean(&self) -> bool {
        *self == Leniency::default()
    }
}

impl Request {
    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Whether the client asked to keep the connection open after this exchange.
    ///
    /// HTTP/1.1 defaults to persistent connections, HTTP/1.0 must opt in.
    pub fn wants_keep_alive(&self) -> bool {
        let has_token = |token: &str| {
            self.header("Connection").is_some_and(|value| {
                value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case(token))
            })
        };

        match self.version.as_str() {
            "HTTP/1.1" => !has_token("close"),
            "HTTP/1.0" => has_token("keep-alive"),
            _ => false,
        }
    }
}

/// Position of the `\r\n\r\n` that ends the header section.
pub fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Declared body length of a header section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentLength {
    Absent,
    Valid(usize),
    /// Present but not a non-negative integer.
    Invalid,
}

/// Scan header lines (request line excluded) for `Content-Length`.
///
/// The first matching header wins.
pub fn content_length(head: &[u8]) -> ContentLength {
    let head = String::from_utf8_lossy(head);
    for line in head.split("\r\n").skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return match value.trim().parse::<usize>() {
                    Ok(n) => ContentLength::Valid(n),
                    Err(_) => ContentLength::Invalid,
                };
            }
        }
    }
    ContentLength::Absent
}

/// Decode a request framed by Content-Length (or without a body).
///
/// Everything after the header terminator is taken as the body verbatim.
pub fn decode(raw: &[u8]) -> Request {
    let header_end = find_header_end(raw);
    let mut request = decode_head(match header_end {
        Some(end) => &raw[..end],
        None => raw,
    });

    if let Some(end) = header_end {
        request.body = Bytes::copy_from_slice(&raw[end + 4..]);
    }
    request
}

/// Decode a request whose body uses chunked transfer coding.
///
/// Stops at the zero-size chunk. A size line that is not hexadecimal, or data
/// that runs past the end of the input, ends decoding with the body collected
/// so far and sets [`Leniency::chunked_truncated`].
pub fn decode_chunked(raw: &[u8]) -> Request {
    let header_end = find_header_end(raw);
    let mut request = decode_head(match header_end {
        Some(end) => &raw[..end],
        None => raw,
    });
    request.is_chunked = true;

    let Some(end) = header_end else {
        return request;
    };

    let mut body = Vec::new();
    let walk = walk_chunks(&raw[end + 4..], |data| body.extend_from_slice(data));
    request.leniency.chunked_truncated = walk != ChunkWalk::Done;
    request.body = Bytes::from(body);
    request
}

/// How far a chunked body could be followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWalk {
    /// Zero-size chunk and the terminating blank line were seen.
    Done,
    /// A size line or chunk delimiter was malformed.
    Garbled,
    /// Input ended before the last chunk.
    Incomplete,
}

/// Longest chunk size line accepted, extensions included.
const MAX_CHUNK_LINE: usize = 4096;

/// Room allowed for trailer fields after the zero-size chunk.
const MAX_TRAILER_BYTES: usize = 64 * 1024;

/// One step of chunk framing at the front of the input.
enum Chunk<'a> {
    /// A complete chunk: its data and the bytes it spans, delimiters included.
    Data(&'a [u8], usize),
    /// Zero-size chunk, trailers and the blank line.
    Last,
    /// Input ends inside this chunk. Holds the data present so far.
    Partial(&'a [u8]),
    /// Framing is broken. Holds data that preceded the break in this chunk.
    Garbled(&'a [u8]),
}

fn next_chunk(input: &[u8]) -> Chunk<'_> {
    let none = &input[..0];
    let Some(line_end) = find_crlf(&input[..input.len().min(MAX_CHUNK_LINE)]) else {
        return if input.len() >= MAX_CHUNK_LINE {
            Chunk::Garbled(none)
        } else {
            Chunk::Partial(none)
        };
    };
    let Some(size) = parse_chunk_size(&input[..line_end]) else {
        return Chunk::Garbled(none);
    };
    let rest = &input[line_end + 2..];

    if size == 0 {
        // Optional trailers, then a blank line
        let trailers = &rest[..rest.len().min(MAX_TRAILER_BYTES)];
        return if rest.starts_with(b"\r\n") || find_header_end(trailers).is_some() {
            Chunk::Last
        } else if rest.len() >= MAX_TRAILER_BYTES {
            Chunk::Garbled(none)
        } else {
            Chunk::Partial(none)
        };
    }

    if rest.len() < size {
        return Chunk::Partial(rest);
    }
    let (data, after) = rest.split_at(size);
    if after.len() < 2 {
        return Chunk::Partial(data);
    }
    if !after.starts_with(b"\r\n") {
        return Chunk::Garbled(data);
    }
    Chunk::Data(data, line_end + 2 + size + 2)
}

/// Follow chunk framing over `input`, handing each data slice to `on_data`.
pub fn walk_chunks<'a>(mut input: &'a [u8], mut on_data: impl FnMut(&'a [u8])) -> ChunkWalk {
    loop {
        match next_chunk(input) {
            Chunk::Data(data, len) => {
                on_data(data);
                input = &input[len..];
            }
            Chunk::Last => return ChunkWalk::Done,
            Chunk::Partial(data) => {
                on_data(data);
                return ChunkWalk::Incomplete;
            }
            Chunk::Garbled(data) => {
                on_data(data);
                return ChunkWalk::Garbled;
            }
        }
    }
}

/// Chunk walk over a body that arrives in pieces.
///
/// Complete chunks are stepped over once. Each call resumes at the first
/// chunk that was still partial, so feeding a growing buffer costs time
/// proportional to the new bytes rather than the whole body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Body bytes spanned by complete chunks.
    consumed: usize,
    /// Data bytes in those chunks.
    received: usize,
    walk: ChunkWalk,
}

impl Default for ChunkProgress {
    fn default() -> Self {
        Self {
            consumed: 0,
            received: 0,
            walk: ChunkWalk::Incomplete,
        }
    }
}

impl ChunkProgress {
    /// Continue over `body`, the whole chunked body buffered so far.
    ///
    /// Returns the walk outcome and the data bytes seen, counting data of a
    /// chunk that is still arriving. `body` must extend the buffer passed to
    /// earlier calls.
    pub fn advance(&mut self, body: &[u8]) -> (ChunkWalk, usize) {
        if self.walk != ChunkWalk::Incomplete {
            return (self.walk, self.received);
        }
        loop {
            match next_chunk(&body[self.consumed..]) {
                Chunk::Data(data, len) => {
                    self.received += data.len();
                    self.consumed += len;
                }
                Chunk::Last => {
                    self.walk = ChunkWalk::Done;
                    return (self.walk, self.received);
                }
                Chunk::Partial(data) => {
                    return (ChunkWalk::Incomplete, self.received + data.len());
                }
                Chunk::Garbled(data) => {
                    self.received += data.len();
                    self.walk = ChunkWalk::Garbled;
                    return (self.walk, self.received);
                }
            }
        }
    }
}

/// Parse a hexadecimal chunk size, ignoring chunk extensions.
fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?;
    let size = line.split(';').next()?.trim();
    if size.is_empty() || size.starts_with('+') {
        return None;
    }
    usize::from_str_radix(size, 16).ok()
}

/// Parse the request line and header fields.
fn decode_head(head: &[u8]) -> Request {
    let head = String::from_utf8_lossy(head);
    let mut lines = head.split("\r\n");
    let mut request = Request::default();

    if let Some(line) = lines.next() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() >= 3 {
            request.method = tokens[0].to_string();
            parse_target(tokens[1], &mut request);
            request.version = tokens[2].to_string();
        } else {
            request.leniency.malformed_request_line = true;
        }
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            continue;
        }

        if name.eq_ignore_ascii_case("Transfer-Encoding") && value.eq_ignore_ascii_case("chunked")
        {
            request.is_chunked = true;
        }
        if name.eq_ignore_ascii_case("Cookie") {
            parse_cookies(value, &mut request);
        }
        request.headers.insert(name, value);
    }

    request
}

/// Split a request target into path and query parameters.
fn parse_target(target: &str, request: &mut Request) {
    match target.split_once('?') {
        Some((path, query)) => {
            request.path = path.to_string();
            request.query = query.to_string();
            for pair in query.split('&') {
                match pair.split_once('=') {
                    Some((key, value)) if !value.contains('=') => {
                        request
                            .query_params
                            .insert(key.to_string(), value.to_string());
                    }
                    _ => request.leniency.dropped_query_pairs += 1,
                }
            }
        }
        None => request.path = target.to_string(),
    }
}

fn parse_cookies(header: &str, request: &mut Request) {
    for pair in header.split(';') {
        if pair.trim().is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                request
                    .cookies
                    .insert(name.trim().to_string(), value.trim().to_string());
            }
            _ => request.leniency.dropped_cookie_pairs += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_simple_get() {
        let request = decode(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/index.html");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.header("host"), Some("example.com"));
        assert!(request.body.is_empty());
        assert!(!request.is_chunked);
        assert!(request.leniency.is_clean());
    }

    #[test]
    fn test_decode_body_verbatim() {
        let raw = b"POST /submit HTTP/1.1\r\nContent-Length: 12\r\n\r\nline1\r\nline2";
        let request = decode(raw);
        assert_eq!(request.method, "POST");
        assert_eq!(&request.body[..], b"line1\r\nline2");
    }

    #[test]
    fn test_decode_query_params() {
        let request = decode(b"GET /search?q=rust&page=2&flag&a=b=c&empty= HTTP/1.1\r\n\r\n");
        assert_eq!(request.path, "/search");
        assert_eq!(request.query, "q=rust&page=2&flag&a=b=c&empty=");
        assert_eq!(request.query_params.get("q").map(String::as_str), Some("rust"));
        assert_eq!(request.query_params.get("page").map(String::as_str), Some("2"));
        assert_eq!(request.query_params.get("empty").map(String::as_str), Some(""));
        assert!(!request.query_params.contains_key("flag"));
        assert!(!request.query_params.contains_key("a"));
        assert_eq!(request.leniency.dropped_query_pairs, 2);
    }

    #[test]
    fn test_decode_cookies() {
        let raw = b"GET / HTTP/1.1\r\ncookie: session=abc123; theme = dark; broken; =nokey\r\n\r\n";
        let request = decode(raw);
        assert_eq!(request.cookies.get("session").map(String::as_str), Some("abc123"));
        assert_eq!(request.cookies.get("theme").map(String::as_str), Some("dark"));
        assert_eq!(request.cookies.len(), 2);
        assert_eq!(request.leniency.dropped_cookie_pairs, 2);
    }

    #[test]
    fn test_malformed_request_line() {
        let request = decode(b"GARBAGE\r\nHost: x\r\n\r\n");
        assert!(request.method.is_empty());
        assert!(request.path.is_empty());
        assert!(request.version.is_empty());
        assert!(request.leniency.malformed_request_line);
        // Headers are still parsed
        assert_eq!(request.header("Host"), Some("x"));
    }

    #[test]
    fn test_transfer_encoding_case_insensitive() {
        let request = decode(b"POST / HTTP/1.1\r\ntransfer-encoding: Chunked\r\n\r\n");
        assert!(request.is_chunked);
    }

    #[test]
    fn test_decode_chunked_single() {
        let raw = b"POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n";
        let request = decode_chunked(raw);
        assert_eq!(&request.body[..], b"Wiki");
        assert!(request.is_chunked);
        assert!(!request.leniency.chunked_truncated);
    }

    #[test]
    fn test_decode_chunked_multiple_with_extension() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                    4;name=v\r\nWiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n";
        let request = decode_chunked(raw);
        assert_eq!(&request.body[..], b"Wikipedia in\r\n\r\nchunks.");
    }

    #[test]
    fn test_decode_chunked_garbled_size_truncates() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\nzz\r\nmore\r\n0\r\n\r\n";
        let request = decode_chunked(raw);
        assert_eq!(&request.body[..], b"Wiki");
        assert!(request.leniency.chunked_truncated);
    }

    #[test]
    fn test_decode_chunked_short_data_truncates() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nA\r\nabc";
        let request = decode_chunked(raw);
        assert_eq!(&request.body[..], b"abc");
        assert!(request.leniency.chunked_truncated);
    }

    #[test]
    fn test_walk_chunks_states() {
        assert_eq!(walk_chunks(b"4\r\nWiki\r\n0\r\n\r\n", |_| {}), ChunkWalk::Done);
        assert_eq!(walk_chunks(b"4\r\nWiki\r\n0\r\n", |_| {}), ChunkWalk::Incomplete);
        assert_eq!(walk_chunks(b"4\r\nWi", |_| {}), ChunkWalk::Incomplete);
        assert_eq!(walk_chunks(b"4\r\nWikiXX", |_| {}), ChunkWalk::Garbled);
        assert_eq!(walk_chunks(b"xyz\r\n", |_| {}), ChunkWalk::Garbled);
        assert_eq!(
            walk_chunks(b"0\r\nExpires: never\r\n\r\n", |_| {}),
            ChunkWalk::Done
        );
    }

    #[test]
    fn test_chunk_progress_resumes() {
        let body = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut progress = ChunkProgress::default();

        // Fed one byte at a time, the running count never runs ahead of the input
        for end in 1..body.len() {
            let (walk, received) = progress.advance(&body[..end]);
            assert_eq!(walk, ChunkWalk::Incomplete, "after {end} bytes");
            assert!(received <= 9);
        }
        assert_eq!(progress.advance(body), (ChunkWalk::Done, 9));
        assert_eq!(progress.consumed, 19);

        let mut progress = ChunkProgress::default();
        assert_eq!(progress.advance(b"A\r\nabc"), (ChunkWalk::Incomplete, 3));
        assert_eq!(progress.advance(b"A\r\nabcdefghijXX"), (ChunkWalk::Garbled, 10));
        // Settled outcomes stick
        assert_eq!(progress.advance(b""), (ChunkWalk::Garbled, 10));
    }

    #[test]
    fn test_chunk_size_line_is_bounded() {
        let line = vec![b'a'; MAX_CHUNK_LINE - 1];
        assert_eq!(walk_chunks(&line, |_| {}), ChunkWalk::Incomplete);

        let line = vec![b'a'; MAX_CHUNK_LINE];
        assert_eq!(walk_chunks(&line, |_| {}), ChunkWalk::Garbled);

        let mut trailers = b"0\r\n".to_vec();
        trailers.resize(4 + MAX_TRAILER_BYTES, b'x');
        assert_eq!(walk_chunks(&trailers, |_| {}), ChunkWalk::Garbled);
    }

    #[test]
    fn test_content_length() {
        assert_eq!(
            content_length(b"POST / HTTP/1.1\r\ncontent-length: 42"),
            ContentLength::Valid(42)
        );
        assert_eq!(
            content_length(b"POST / HTTP/1.1\r\nContent-Length: abc"),
            ContentLength::Invalid
        );
        assert_eq!(
            content_length(b"GET / HTTP/1.1\r\nHost: x"),
            ContentLength::Absent
        );
    }

    #[test]
    fn test_keep_alive_negotiation() {
        let request = decode(b"GET / HTTP/1.1\r\n\r\n");
        assert!(request.wants_keep_alive());

        let request = decode(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!request.wants_keep_alive());

        let request = decode(b"GET / HTTP/1.0\r\n\r\n");
        assert!(!request.wants_keep_alive());

        let request = decode(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n");
        assert!(request.wants_keep_alive());
    }
}
