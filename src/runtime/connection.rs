//! Connection state machine for HTTP connections.
//!
//! Each connection accumulates request bytes until framing says a full
//! request has arrived, holds the encoded response while it is written, and
//! tracks the timestamps used by the idle sweep.

use crate::protocols::http::parser::{
    content_length, decode, decode_chunked, find_header_end, ChunkProgress, ChunkWalk,
    ContentLength,
};
use crate::protocols::http::Request;
use bytes::{Buf, Bytes, BytesMut};
use slab::Slab;
use std::time::{Duration, Instant};

/// Largest header section accepted, request line included.
///
/// Also the room allowed on top of the body limit before a request whose
/// length cannot be determined is cut off.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Literal marker that routes a request to the chunked decoder.
///
/// Matched case-sensitively against the raw header bytes, so variants such as
/// `transfer-encoding: Chunked` fall back to Content-Length framing.
const CHUNKED_MARKER: &[u8] = b"Transfer-Encoding: chunked";

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accumulating request bytes.
    Reading,
    /// Request handed to the CGI pool, waiting for its output.
    AwaitingCgi,
    /// Writing the response.
    Writing,
}

/// Framing of the buffered request, known once its header section ends.
#[derive(Debug, Clone, Copy)]
struct Head {
    /// Offset of the `\r\n\r\n` terminator.
    end: usize,
    chunked: bool,
    length: ContentLength,
}

impl Head {
    fn body_start(&self) -> usize {
        self.end + 4
    }
}

/// Per-connection buffers and bookkeeping.
#[derive(Debug)]
pub struct Connection {
    inbound: BytesMut,
    outbound: Option<Bytes>,
    state: ConnState,
    created_at: Instant,
    last_activity: Instant,
    keep_alive: bool,
    /// Distinguishes this connection from earlier ones that used the same slot.
    serial: u64,
    head: Option<Head>,
    /// Bytes already searched for the header terminator.
    scanned: usize,
    chunks: ChunkProgress,
    /// Latest chunk walk outcome and data bytes seen.
    chunk_walk: ChunkWalk,
    chunk_bytes: usize,
}

impl Connection {
    /// Create a new connection in initial reading state.
    pub fn new(serial: u64) -> Self {
        let now = Instant::now();
        Self {
            inbound: BytesMut::with_capacity(8 * 1024),
            outbound: None,
            state: ConnState::Reading,
            created_at: now,
            last_activity: now,
            keep_alive: false,
            serial,
            head: None,
            scanned: 0,
            chunks: ChunkProgress::default(),
            chunk_walk: ChunkWalk::Incomplete,
            chunk_bytes: 0,
        }
    }

    /// Append bytes read from the socket and advance framing over them.
    pub fn append(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
        self.last_activity = Instant::now();
        self.scan();
    }

    /// Look only at bytes added since the last call.
    fn scan(&mut self) {
        if self.head.is_none() {
            // Back up so a terminator split across reads is still found
            let from = self.scanned.saturating_sub(3);
            if let Some(pos) = find_header_end(&self.inbound[from..]) {
                let end = from + pos;
                let head = &self.inbound[..end];
                self.head = Some(Head {
                    end,
                    chunked: head
                        .windows(CHUNKED_MARKER.len())
                        .any(|w| w == CHUNKED_MARKER),
                    length: content_length(head),
                });
            }
            self.scanned = self.inbound.len();
        }

        if let Some(head) = self.head.filter(|head| head.chunked) {
            let body = &self.inbound[head.body_start()..];
            (self.chunk_walk, self.chunk_bytes) = self.chunks.advance(body);
        }
    }

    /// Whether the buffered bytes hold a complete request.
    ///
    /// An unparseable Content-Length never completes: the connection keeps
    /// buffering until it times out or outgrows the body limit.
    pub fn has_complete_request(&self) -> bool {
        let Some(head) = self.head else {
            return false;
        };

        if head.chunked {
            // A garbled chunk counts as complete; the decoder truncates there
            return self.chunk_walk != ChunkWalk::Incomplete;
        }

        match head.length {
            ContentLength::Absent => true,
            ContentLength::Valid(len) => {
                self.inbound.len() >= head.body_start().saturating_add(len)
            }
            ContentLength::Invalid => false,
        }
    }

    /// Whether the request carries the literal chunked transfer-encoding header.
    pub fn is_chunked(&self) -> bool {
        self.head.is_some_and(|head| head.chunked)
    }

    /// Whether the header section has outgrown [`MAX_HEADER_BYTES`], with or
    /// without its terminator.
    pub fn header_too_large(&self) -> bool {
        match self.head {
            Some(head) => head.end > MAX_HEADER_BYTES,
            None => self.inbound.len() > MAX_HEADER_BYTES,
        }
    }

    /// Whether the request body is already known to exceed `limit` bytes.
    pub fn exceeds_body_limit(&self, limit: usize) -> bool {
        if self.inbound.len() > limit.saturating_add(MAX_HEADER_BYTES) {
            return true;
        }
        let Some(head) = self.head else {
            return false;
        };

        if head.chunked {
            return self.chunk_bytes > limit;
        }

        match head.length {
            ContentLength::Valid(len) => len > limit,
            _ => false,
        }
    }

    /// Decode the buffered request with the framing it was sent in.
    pub fn request(&self) -> Request {
        if self.is_chunked() {
            decode_chunked(&self.inbound)
        } else {
            decode(&self.inbound)
        }
    }

    /// Park the connection while a CGI job runs.
    pub fn start_cgi(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
        self.state = ConnState::AwaitingCgi;
        self.last_activity = Instant::now();
    }

    /// Transition to writing state with an encoded response.
    pub fn start_writing(&mut self, response: impl Into<Bytes>, keep_alive: bool) {
        self.outbound = Some(response.into());
        self.keep_alive = keep_alive;
        self.state = ConnState::Writing;
        self.last_activity = Instant::now();
    }

    /// Response bytes not yet written.
    pub fn pending_output(&self) -> &[u8] {
        self.outbound.as_deref().unwrap_or_default()
    }

    /// Record `n` bytes written. Returns true once the response is flushed.
    pub fn advance_output(&mut self, n: usize) -> bool {
        self.last_activity = Instant::now();
        match &mut self.outbound {
            Some(out) => {
                out.advance(n.min(out.len()));
                out.is_empty()
            }
            None => true,
        }
    }

    /// Prepare for the next request on a kept-alive connection.
    pub fn reset(&mut self) {
        self.inbound.clear();
        self.head = None;
        self.scanned = 0;
        self.chunks = ChunkProgress::default();
        self.chunk_walk = ChunkWalk::Incomplete;
        self.chunk_bytes = 0;
        self.outbound = None;
        self.state = ConnState::Reading;
        self.last_activity = Instant::now();
    }

    /// Whether a CGI completion tagged with `serial` belongs to this connection.
    pub fn accepts_completion(&self, serial: u64) -> bool {
        self.serial == serial && self.state == ConnState::AwaitingCgi
    }

    /// Whether the connection has been silent for longer than `timeout`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. The key doubles as
/// the connection's poll token.
pub struct ConnectionRegistry<T> {
    connections: Slab<T>,
    max_connections: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(4096)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: T) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<T> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.connections.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GET: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";

    #[test]
    fn test_incomplete_until_header_terminator() {
        let mut conn = Connection::new(1);
        conn.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert!(!conn.has_complete_request());
        conn.append(b"\r\n");
        assert!(conn.has_complete_request());
    }

    #[test]
    fn test_content_length_threshold() {
        let head = b"POST /submit HTTP/1.1\r\nContent-Length: 10\r\n\r\n";
        let body = b"0123456789";

        for received in 0..=body.len() {
            let mut conn = Connection::new(1);
            conn.append(head);
            conn.append(&body[..received]);
            assert_eq!(
                conn.has_complete_request(),
                conn.buffered() >= head.len() + 10,
                "received {received} body bytes"
            );
        }
    }

    #[test]
    fn test_invalid_content_length_never_completes() {
        let mut conn = Connection::new(1);
        conn.append(b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n0123456789");
        assert!(!conn.has_complete_request());
    }

    #[test]
    fn test_chunked_waits_for_last_chunk() {
        let mut conn = Connection::new(1);
        conn.append(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert!(conn.is_chunked());
        assert!(!conn.has_complete_request());

        conn.append(b"4\r\nWiki\r\n");
        assert!(!conn.has_complete_request());

        conn.append(b"0\r\n\r\n");
        assert!(conn.has_complete_request());

        let request = conn.request();
        assert!(request.is_chunked);
        assert_eq!(&request.body[..], b"Wiki");
    }

    #[test]
    fn test_chunked_marker_is_case_sensitive() {
        let mut conn = Connection::new(1);
        conn.append(b"POST / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n");
        assert!(!conn.is_chunked());
        // Falls back to Content-Length framing, which is absent
        assert!(conn.has_complete_request());
    }

    #[test]
    fn test_body_limit() {
        let mut conn = Connection::new(1);
        conn.append(b"POST / HTTP/1.1\r\nContent-Length: 20\r\n\r\n");
        assert!(conn.exceeds_body_limit(10));
        assert!(!conn.exceeds_body_limit(20));

        let mut conn = Connection::new(1);
        conn.append(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n8\r\n01234567\r\n");
        assert!(!conn.exceeds_body_limit(10));
        conn.append(b"8\r\n89abcdef\r\n");
        assert!(conn.exceeds_body_limit(10));

        let mut conn = Connection::new(1);
        conn.append(&vec![b'a'; MAX_HEADER_BYTES + 11]);
        assert!(conn.exceeds_body_limit(10));
    }

    #[test]
    fn test_unterminated_header_rejected_before_body_limit() {
        let body_limit = 10 * 1024 * 1024;
        let mut conn = Connection::new(1);
        conn.append(b"GET / HTTP/1.1\r\nX-Pad: ");

        let pad = vec![b'a'; 8 * 1024];
        while conn.buffered() <= MAX_HEADER_BYTES {
            assert!(!conn.header_too_large());
            conn.append(&pad);
        }

        assert!(conn.buffered() > MAX_HEADER_BYTES);
        assert!(conn.buffered() < MAX_HEADER_BYTES + pad.len() + 1);
        assert!(conn.header_too_large());
        assert!(!conn.exceeds_body_limit(body_limit));
        assert!(!conn.has_complete_request());
    }

    #[test]
    fn test_header_at_limit_accepted() {
        let mut conn = Connection::new(1);
        let mut head = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        head.resize(MAX_HEADER_BYTES, b'a');
        conn.append(&head);
        conn.append(b"\r\n\r\n");
        assert!(!conn.header_too_large());
        assert!(conn.has_complete_request());

        head.push(b'a');
        let mut conn = Connection::new(1);
        conn.append(&head);
        conn.append(b"\r\n\r\n");
        assert!(conn.header_too_large());
    }

    #[test]
    fn test_terminator_split_across_reads() {
        for split in 1..4 {
            let mut conn = Connection::new(1);
            conn.append(b"GET / HTTP/1.1\r\nHost: x");
            conn.append(&b"\r\n\r\n"[..split]);
            assert!(!conn.has_complete_request());
            conn.append(&b"\r\n\r\n"[split..]);
            assert!(conn.has_complete_request(), "split at {split}");
        }
    }

    #[test]
    fn test_chunked_body_fed_bytewise() {
        let mut conn = Connection::new(1);
        conn.append(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");

        let mut body = Vec::new();
        for _ in 0..500 {
            body.extend_from_slice(b"1\r\nx\r\n");
        }
        body.extend_from_slice(b"0\r\n\r\n");

        for byte in &body[..body.len() - 1] {
            conn.append(std::slice::from_ref(byte));
            assert!(!conn.has_complete_request());
        }
        assert!(!conn.exceeds_body_limit(500));
        assert!(conn.exceeds_body_limit(499));

        conn.append(&body[body.len() - 1..]);
        assert!(conn.has_complete_request());
        assert_eq!(conn.request().body.len(), 500);
    }

    #[test]
    fn test_reset_matches_fresh_connection() {
        let mut reused = Connection::new(1);
        reused.append(b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc");
        reused.start_writing(b"HTTP/1.1 200 OK\r\n\r\n".to_vec(), true);
        reused.reset();

        for input in [&GET[..], b"GET / HTTP/1.1\r\n", b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\na"] {
            let mut fresh = Connection::new(2);
            let mut again = Connection::new(1);
            again.append(b"leftover");
            again.reset();

            fresh.append(input);
            again.append(input);
            assert_eq!(fresh.has_complete_request(), again.has_complete_request());
        }

        assert_eq!(reused.state(), ConnState::Reading);
        assert_eq!(reused.buffered(), 0);
        assert!(reused.pending_output().is_empty());
    }

    #[test]
    fn test_partial_writes() {
        let mut conn = Connection::new(1);
        conn.append(GET);
        conn.start_writing(b"0123456789".to_vec(), false);
        assert_eq!(conn.state(), ConnState::Writing);
        assert!(!conn.keep_alive());

        assert!(!conn.advance_output(4));
        assert_eq!(conn.pending_output(), b"456789");
        assert!(conn.advance_output(6));
        assert!(conn.pending_output().is_empty());
    }

    #[test]
    fn test_cgi_completion_matching() {
        let mut conn = Connection::new(7);
        assert!(!conn.accepts_completion(7), "not waiting yet");

        conn.start_cgi(true);
        assert_eq!(conn.state(), ConnState::AwaitingCgi);
        assert!(conn.accepts_completion(7));
        // A completion for an earlier occupant of the slot
        assert!(!conn.accepts_completion(6));

        conn.start_writing(b"HTTP/1.1 200 OK\r\n\r\n".to_vec(), true);
        assert!(!conn.accepts_completion(7));
    }

    #[test]
    fn test_idle_detection() {
        let conn = Connection::new(1);
        let now = Instant::now();
        assert!(!conn.is_idle(now, Duration::from_secs(30)));
        assert!(conn.is_idle(now + Duration::from_secs(31), Duration::from_secs(30)));
        assert!(conn.created_at() <= conn.last_activity());
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let id1 = registry.insert(Connection::new(1)).unwrap();
        let id2 = registry.insert(Connection::new(2)).unwrap();

        // At capacity
        assert!(registry.insert(Connection::new(3)).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), 2);
        assert_eq!(registry.get(id1).unwrap().serial(), 1);
        assert_eq!(registry.get(id2).unwrap().serial(), 2);

        registry.remove(id1);
        assert!(!registry.contains(id1));
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.len(), 1);

        // Freed slot is reused, serial tells occupants apart
        let id3 = registry.insert(Connection::new(3)).unwrap();
        assert_eq!(id3, id1);
        assert_eq!(registry.get_mut(id3).unwrap().serial(), 3);
    }
}
