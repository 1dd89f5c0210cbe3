//! Contracts between the engine and its host runtime.
//!
//! The engine is sans-io: the event loop, the HTTP/1.1 parser and the
//! hijacking mechanism live in the host. The host hands the engine a
//! [`Session`] at upgrade time and routes every subsequent chunk of transport
//! bytes to [`Upgrader::on_read`](crate::Upgrader::on_read). Writes the
//! engine originates (the 101 response, pong echoes, close replies) go back
//! through [`Transport::write`], which must serialize writes internally; the
//! engine never awaits completion.

use std::{fmt, io, sync::Arc, time::Instant};

use bytes::{BufMut, BytesMut};

use crate::{
    CloseCode, MessageType, frame,
    pool::{Allocator, BucketPool},
};

/// Non-blocking byte transport owned by the host event loop.
///
/// TLS, buffering and writability notification are the implementor's
/// concern. `write` must accept the full buffer or fail; the engine does not
/// retry partial writes.
pub trait Transport: Send + Sync {
    fn write(&self, buf: &[u8]) -> io::Result<()>;
    fn set_write_deadline(&self, deadline: Instant);
    fn close(&self);
}

/// Serialized task runner.
///
/// Handler invocations are enqueued here instead of being called from the
/// decoder loop, so user code that blocks cannot stall frame parsing. For a
/// given connection, tasks must run in submission order; tasks of different
/// connections may run concurrently.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs every task immediately on the submitting thread.
///
/// Submission order is trivially preserved. Suitable for single-threaded
/// hosts and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// Shared runtime services: pooled allocation and payload policies.
///
/// One engine typically backs every connection of a listener.
pub struct Engine {
    body_allocator: Arc<dyn Allocator>,
    release_websocket_payload: bool,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            body_allocator: Arc::new(BucketPool::new()),
            release_websocket_payload: false,
        }
    }

    /// Uses `allocator` for payload and accumulation buffers.
    pub fn with_allocator(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            body_allocator: allocator,
            release_websocket_payload: false,
        }
    }

    /// When set, payload buffers are returned to the pool as soon as the
    /// user callback returns. Callbacks must not retain the slice.
    pub fn set_release_websocket_payload(&mut self, release: bool) {
        self.release_websocket_payload = release;
    }

    pub fn release_websocket_payload(&self) -> bool {
        self.release_websocket_payload
    }

    pub fn body_allocator(&self) -> &dyn Allocator {
        &*self.body_allocator
    }

    /// Validates text payloads.
    pub fn check_utf8(&self, data: &[u8]) -> bool {
        check_utf8_impl(data)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "simd")]
fn check_utf8_impl(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

#[cfg(not(feature = "simd"))]
fn check_utf8_impl(data: &[u8]) -> bool {
    std::str::from_utf8(data).is_ok()
}

/// A hijacked connection as delivered by the host's HTTP layer.
#[derive(Clone)]
pub struct Session {
    pub transport: Arc<dyn Transport>,
    pub executor: Arc<dyn Executor>,
    pub engine: Arc<Engine>,
}

/// Response surface the handshake needs from the host's HTTP layer.
///
/// On a failed upgrade the engine sets a `Sec-WebSocket-Version: 13` header
/// and sends the rejection status through `send_error`; the host renders the
/// actual response. `hijack` releases the raw transport for a successful
/// upgrade and returns `None` when the underlying connection cannot be taken
/// over (e.g. an HTTP/2 stream).
pub trait ResponseWriter {
    fn set_header(&mut self, name: http::HeaderName, value: http::HeaderValue);
    fn send_error(&mut self, status: http::StatusCode);
    fn hijack(&mut self) -> Option<Session>;
}

/// An established server-side WebSocket connection.
///
/// Handed to every handler. Writes go straight to the transport; the
/// write-path framing here covers only the unfragmented, uncompressed frames
/// the engine itself needs to emit.
pub struct Conn {
    transport: Arc<dyn Transport>,
    executor: Arc<dyn Executor>,
    engine: Arc<Engine>,
    subprotocol: Option<String>,
    compressed: bool,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("subprotocol", &self.subprotocol)
            .field("compressed", &self.compressed)
            .finish_non_exhaustive()
    }
}

impl Conn {
    pub(crate) fn new(session: &Session, subprotocol: Option<String>, compressed: bool) -> Self {
        Self {
            transport: session.transport.clone(),
            executor: session.executor.clone(),
            engine: session.engine.clone(),
            subprotocol,
            compressed,
        }
    }

    /// The subprotocol selected during the handshake, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Whether permessage-deflate was negotiated for this connection.
    pub fn compression_negotiated(&self) -> bool {
        self.compressed
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub(crate) fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Writes a single unfragmented, uncompressed frame.
    pub fn write_message(&self, kind: MessageType, payload: &[u8]) -> io::Result<()> {
        let frame = frame::encode_frame(kind, payload);
        self.transport.write(&frame)
    }

    /// Writes a close frame carrying `code` and `reason`.
    pub fn write_close(&self, code: CloseCode, reason: &str) -> io::Result<()> {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code.into());
        payload.extend_from_slice(reason.as_bytes());
        self.write_message(MessageType::Close, &payload)
    }

    /// Closes the transport immediately.
    pub fn close(&self) {
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        written: Mutex<Vec<Vec<u8>>>,
    }

    impl Transport for RecordingTransport {
        fn write(&self, buf: &[u8]) -> io::Result<()> {
            self.written.lock().unwrap().push(buf.to_vec());
            Ok(())
        }

        fn set_write_deadline(&self, _deadline: Instant) {}

        fn close(&self) {}
    }

    fn conn(transport: Arc<RecordingTransport>) -> Conn {
        let session = Session {
            transport,
            executor: Arc::new(InlineExecutor),
            engine: Arc::new(Engine::new()),
        };
        Conn::new(&session, Some("chat".into()), false)
    }

    #[test]
    fn write_message_frames_payload() {
        let transport = Arc::new(RecordingTransport::default());
        let conn = conn(transport.clone());
        conn.write_message(MessageType::Pong, b"p").unwrap();

        let written = transport.written.lock().unwrap();
        assert_eq!(written[0], vec![0x8A, 0x01, b'p']);
    }

    #[test]
    fn write_close_prepends_code() {
        let transport = Arc::new(RecordingTransport::default());
        let conn = conn(transport.clone());
        conn.write_close(CloseCode::Protocol, "bad").unwrap();

        let written = transport.written.lock().unwrap();
        assert_eq!(written[0], vec![0x88, 0x05, 0x03, 0xEA, b'b', b'a', b'd']);
    }

    #[test]
    fn connection_reports_handshake_results() {
        let conn = conn(Arc::new(RecordingTransport::default()));
        assert_eq!(conn.subprotocol(), Some("chat"));
        assert!(!conn.compression_negotiated());
    }

    #[test]
    fn engine_utf8_validation() {
        let engine = Engine::new();
        assert!(engine.check_utf8(b"Hello"));
        assert!(engine.check_utf8("héllo 世界".as_bytes()));
        assert!(!engine.check_utf8(&[0xFF, 0xFE]));
        assert!(!engine.check_utf8(&[0xED, 0xA0, 0x80])); // UTF-16 surrogate
    }
}
