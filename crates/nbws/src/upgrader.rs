//! The per-connection protocol engine.
//!
//! An [`Upgrader`] serves exactly one connection. [`Upgrader::upgrade`] runs
//! the HTTP handshake once; afterwards the host routes every chunk the
//! transport reads to [`Upgrader::on_read`], which parses frames, reassembles
//! messages, validates protocol conformance and enqueues handler calls on
//! the connection's executor. [`Upgrader::close`] releases the buffers and
//! fires the close callback when the transport goes away.

use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header};

use crate::{
    Error, Result, codec,
    close::{CloseCode, valid_close_code},
    compression::Decompressor,
    frame::{FrameHeader, MAX_CONTROL_PAYLOAD, MessageType},
    handshake::{self, EXTENSION_PERMESSAGE_DEFLATE},
    headers::{header_contains, parse_extensions},
    runtime::{Conn, Engine, ResponseWriter},
    settings::Settings,
};

/// Server-side WebSocket engine for one connection.
///
/// Create one per incoming connection, sharing a single
/// [`Settings`] instance across all of them:
///
/// ```
/// use std::sync::Arc;
/// use nbws::{Settings, Upgrader};
///
/// let mut settings = Settings::new();
/// settings.on_message(|conn, kind, data| {
///     let _ = conn.write_message(kind, data);
/// });
/// let settings = Arc::new(settings);
///
/// let upgrader = Upgrader::new(settings.clone());
/// # let _ = upgrader;
/// ```
pub struct Upgrader {
    settings: Arc<Settings>,
    conn: Option<Arc<Conn>>,
    /// Whether permessage-deflate was negotiated at upgrade time.
    compress_negotiated: bool,
    /// True between a non-FIN data frame and the FIN frame of its message.
    expecting_fragments: bool,
    /// RSV1 of the current message's first frame.
    compress: bool,
    /// Type of the message in progress; `None` outside fragmentation.
    message_opcode: Option<MessageType>,
    /// Unparsed bytes carried across reads.
    buffer: BytesMut,
    /// Accumulated payload of the message in progress.
    message: Option<BytesMut>,
    decompressor: Option<Decompressor>,
}

impl Upgrader {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            conn: None,
            compress_negotiated: false,
            expecting_fragments: false,
            compress: false,
            message_opcode: None,
            buffer: BytesMut::new(),
            message: None,
            decompressor: None,
        }
    }

    /// The connection, once [`upgrade`](Self::upgrade) has succeeded.
    pub fn conn(&self) -> Option<&Arc<Conn>> {
        self.conn.as_ref()
    }

    /// Whether permessage-deflate was negotiated for this connection.
    pub fn compression_negotiated(&self) -> bool {
        self.compress_negotiated
    }

    /// Validates the upgrade request and completes the handshake.
    ///
    /// Preconditions are checked in a fixed order; the first failure is
    /// reported through `w` with its HTTP status and returned as the
    /// matching error. On success the 101 response has been written,
    /// `on_open` has fired, and the returned [`Conn`] is live.
    ///
    /// `response_header` entries are appended to the 101 response, except
    /// `Sec-WebSocket-Protocol` (covered by subprotocol negotiation) and
    /// `Sec-WebSocket-Extensions`, which only the engine may produce.
    pub fn upgrade(
        &mut self,
        request: &Request<()>,
        response_header: Option<&HeaderMap>,
        w: &mut dyn ResponseWriter,
    ) -> Result<Arc<Conn>> {
        if self.conn.is_some() {
            return Err(self.reject(w, StatusCode::INTERNAL_SERVER_ERROR, Error::UpgraderReused));
        }
        if !header_contains(request.headers(), "connection", "upgrade") {
            return Err(self.reject(w, StatusCode::BAD_REQUEST, Error::UpgradeTokenNotFound));
        }
        if !header_contains(request.headers(), "upgrade", "websocket") {
            return Err(self.reject(w, StatusCode::BAD_REQUEST, Error::UpgradeTokenNotFound));
        }
        if request.method() != Method::GET {
            return Err(self.reject(w, StatusCode::METHOD_NOT_ALLOWED, Error::MethodNotGet));
        }
        if !header_contains(request.headers(), "sec-websocket-version", "13") {
            return Err(self.reject(w, StatusCode::BAD_REQUEST, Error::InvalidWebsocketVersion));
        }
        if response_header.is_some_and(|h| h.contains_key(header::SEC_WEBSOCKET_EXTENSIONS)) {
            return Err(self.reject(
                w,
                StatusCode::INTERNAL_SERVER_ERROR,
                Error::UnsupportedExtensions,
            ));
        }
        let origin_ok = match &self.settings.check_origin {
            Some(check) => check(request),
            None => handshake::check_same_origin(request),
        };
        if !origin_ok {
            return Err(self.reject(w, StatusCode::FORBIDDEN, Error::OriginNotAllowed));
        }
        let challenge = request
            .headers()
            .get(header::SEC_WEBSOCKET_KEY)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");
        if challenge.is_empty() {
            return Err(self.reject(w, StatusCode::BAD_REQUEST, Error::MissingWebsocketKey));
        }

        let subprotocol = handshake::select_subprotocol(&self.settings, request, response_header);

        let mut compress = false;
        if self.settings.enable_compression {
            for ext in parse_extensions(request.headers()) {
                if ext.get("").map(String::as_str) == Some(EXTENSION_PERMESSAGE_DEFLATE) {
                    compress = true;
                    break;
                }
            }
        }

        let Some(session) = w.hijack() else {
            return Err(self.reject(w, StatusCode::INTERNAL_SERVER_ERROR, Error::NotHijackable));
        };

        let response = handshake::build_response(
            session.engine.body_allocator(),
            &handshake::accept_key(challenge),
            subprotocol.as_deref(),
            compress,
            response_header,
        );

        if self.settings.handshake_timeout > Duration::ZERO {
            session
                .transport
                .set_write_deadline(Instant::now() + self.settings.handshake_timeout);
        }
        let written = session.transport.write(&response);
        session.engine.body_allocator().free(response);
        if let Err(err) = written {
            session.transport.close();
            return Err(err.into());
        }

        if compress {
            tracing::debug!("negotiated permessage-deflate, no context takeover");
            self.decompressor = Some(Decompressor::no_context_takeover());
        }

        let conn = Arc::new(Conn::new(&session, subprotocol, compress));
        self.conn = Some(conn.clone());
        self.compress_negotiated = compress;

        if let Some(open) = &self.settings.open_handler {
            open(&conn);
        }

        Ok(conn)
    }

    fn reject(&self, w: &mut dyn ResponseWriter, status: StatusCode, err: Error) -> Error {
        w.set_header(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        w.send_error(status);
        err
    }

    /// Consumes one chunk of transport bytes.
    ///
    /// Parses as many complete frames as the chunk plus any buffered residue
    /// contain, dispatching handlers along the way. At most one error is
    /// returned per call, after which the host is expected to tear the
    /// connection down; UTF-8 and close-code violations are handled by
    /// closing the transport instead of propagating.
    ///
    /// When nothing was buffered, parsing runs over `data` in place
    /// (unmasking included) and only a leftover partial frame is copied out.
    pub fn on_read(&mut self, data: &mut [u8]) -> Result<()> {
        let Some(conn) = self.conn.clone() else {
            debug_assert!(false, "on_read before a successful upgrade");
            return Ok(());
        };

        let buffered = self.buffer.len();
        let limit = self.settings.read_limit;
        if limit > 0 {
            let message_len = self.message.as_ref().map_or(0, |m| m.len());
            if buffered + data.len() > limit || buffered + message_len > limit {
                return Err(Error::ReadLimitExceeded);
            }
        }

        let mut owned = std::mem::take(&mut self.buffer);
        let borrowed = owned.is_empty();
        if !borrowed {
            owned.extend_from_slice(data);
        }
        let work: &mut [u8] = if borrowed { data } else { &mut owned };

        let mut pos = 0;
        let mut result = Ok(());
        loop {
            let frame = match codec::next_frame(&mut work[pos..]) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };
            let consumed = frame.consumed;
            let outcome = self.handle_frame(&conn, frame.header, frame.payload);
            pos += consumed;
            if let Err(err) = outcome {
                result = Err(err);
                break;
            }
            if pos == work.len() {
                break;
            }
        }

        let alloc = conn.engine().body_allocator();
        if borrowed {
            if pos < work.len() {
                let mut promoted = alloc.malloc(work.len() - pos);
                promoted.extend_from_slice(&work[pos..]);
                self.buffer = promoted;
            }
        } else if pos > 0 {
            // The buffer shrank: move the residue to a tightly sized buffer
            // instead of pinning the old one across reads.
            if pos < owned.len() {
                let mut shrunk = alloc.malloc(owned.len() - pos);
                shrunk.extend_from_slice(&owned[pos..]);
                self.buffer = shrunk;
            }
            alloc.free(owned);
        } else {
            self.buffer = owned;
        }

        result
    }

    /// Releases the connection's buffers and fires the close callback.
    ///
    /// Invoked by the host when the transport is torn down, with the error
    /// that caused it, if any.
    pub fn close(&mut self, err: Option<&Error>) {
        let Some(conn) = &self.conn else {
            return;
        };
        if let Some(handler) = &self.settings.close_handler {
            handler(conn, err);
        }
        let alloc = conn.engine().body_allocator();
        if !self.buffer.is_empty() {
            alloc.free(std::mem::take(&mut self.buffer));
        }
        if let Some(message) = self.message.take() {
            alloc.free(message);
        }
    }

    fn handle_frame(&mut self, conn: &Arc<Conn>, header: FrameHeader, payload: &[u8]) -> Result<()> {
        let opcode = self.validate_frame(&header)?;
        if opcode.is_control() {
            self.handle_control_frame(conn, opcode, payload)
        } else {
            self.handle_data_frame(conn, opcode, header.fin, header.rsv1, payload)
        }
    }

    fn validate_frame(&self, header: &FrameHeader) -> Result<MessageType> {
        if header.rsv1 && !self.compress_negotiated {
            return Err(Error::ReservedBitSet);
        }
        if header.rsv2 || header.rsv3 {
            return Err(Error::ReservedBitSet);
        }
        let opcode = MessageType::try_from(header.opcode)?;
        if opcode.is_control() {
            if !header.fin {
                return Err(Error::FragmentedControlFrame);
            }
            if header.payload_len > MAX_CONTROL_PAYLOAD {
                return Err(Error::ControlFrameTooLarge);
            }
        }
        if self.expecting_fragments
            && matches!(opcode, MessageType::Text | MessageType::Binary)
        {
            return Err(Error::ExpectedContinuation);
        }
        if !self.expecting_fragments && opcode == MessageType::Continuation {
            return Err(Error::InvalidContinuation);
        }
        Ok(opcode)
    }

    fn handle_data_frame(
        &mut self,
        conn: &Arc<Conn>,
        opcode: MessageType,
        fin: bool,
        rsv1: bool,
        payload: &[u8],
    ) -> Result<()> {
        if self.message_opcode.is_none() {
            self.message_opcode = Some(opcode);
            self.compress = rsv1;
        }
        let message_opcode = self.message_opcode.unwrap_or(opcode);
        let engine = conn.engine().clone();

        if let Some(handler) = self.settings.data_frame_handler.clone() {
            if self.message_too_large(payload.len()) {
                return Err(Error::MessageTooLarge);
            }
            let mut frame_buf = engine.body_allocator().malloc(payload.len());
            frame_buf.extend_from_slice(payload);
            if message_opcode == MessageType::Text
                && !frame_buf.is_empty()
                && !engine.check_utf8(&frame_buf)
            {
                engine.body_allocator().free(frame_buf);
                conn.close();
            } else {
                let conn = conn.clone();
                let executor = conn.executor().clone();
                executor.execute(Box::new(move || {
                    handler(&conn, message_opcode, fin, &frame_buf);
                    if conn.engine().release_websocket_payload() {
                        conn.engine().body_allocator().free(frame_buf);
                    }
                }));
            }
        }

        if self.settings.message_handler.is_some() && !payload.is_empty() {
            let accumulated = self.message.as_ref().map_or(0, |m| m.len());
            if self.message_too_large(accumulated + payload.len()) {
                return Err(Error::MessageTooLarge);
            }
            match &mut self.message {
                Some(message) => message.extend_from_slice(payload),
                None => {
                    let mut message = engine.body_allocator().malloc(payload.len());
                    message.extend_from_slice(payload);
                    self.message = Some(message);
                }
            }
        }

        if fin {
            if let Some(handler) = self.settings.message_handler.clone() {
                let mut message = self
                    .message
                    .take()
                    .unwrap_or_else(|| engine.body_allocator().malloc(0));
                if self.compress {
                    message = match self.inflate_message(&engine, message) {
                        Ok(message) => message,
                        Err(err) => {
                            self.reset_message_state();
                            return Err(err);
                        }
                    };
                }
                if message_opcode == MessageType::Text && !engine.check_utf8(&message) {
                    engine.body_allocator().free(message);
                    conn.close();
                } else {
                    let conn = conn.clone();
                    let executor = conn.executor().clone();
                    executor.execute(Box::new(move || {
                        handler(&conn, message_opcode, &message);
                        if conn.engine().release_websocket_payload() {
                            conn.engine().body_allocator().free(message);
                        }
                    }));
                }
            }
            self.reset_message_state();
        } else {
            self.expecting_fragments = true;
        }
        Ok(())
    }

    fn handle_control_frame(
        &mut self,
        conn: &Arc<Conn>,
        opcode: MessageType,
        payload: &[u8],
    ) -> Result<()> {
        if self.message_too_large(payload.len()) {
            return Err(Error::MessageTooLarge);
        }
        let engine = conn.engine();
        let mut control = engine.body_allocator().malloc(payload.len());
        control.extend_from_slice(payload);

        let settings = self.settings.clone();
        let conn = conn.clone();
        let executor = conn.executor().clone();
        executor.execute(Box::new(move || {
            match opcode {
                MessageType::Close => {
                    if control.len() >= 2 {
                        let code = u16::from_be_bytes([control[0], control[1]]);
                        if !valid_close_code(code) || !conn.engine().check_utf8(&control[2..]) {
                            let _ = conn.write_close(CloseCode::Protocol, "");
                        } else {
                            let text = std::str::from_utf8(&control[2..]).unwrap_or_default();
                            (settings.close_message_handler)(&conn, code, text);
                        }
                    } else {
                        let _ = conn.write_message(MessageType::Close, &[]);
                    }
                    // Close right away; no point draining writes for a peer
                    // that asked to go.
                    conn.close();
                }
                MessageType::Ping => (settings.ping_handler)(&conn, &control),
                MessageType::Pong => (settings.pong_handler)(&conn, &control),
                _ => {
                    tracing::debug!("data opcode {opcode:?} reached control dispatch");
                    conn.close();
                }
            }
            if !control.is_empty() && conn.engine().release_websocket_payload() {
                conn.engine().body_allocator().free(control);
            }
        }));
        Ok(())
    }

    fn inflate_message(&mut self, engine: &Arc<Engine>, message: BytesMut) -> Result<BytesMut> {
        let alloc = engine.body_allocator();
        let inflated = match self.decompressor.as_mut() {
            Some(decompressor) => decompressor.decompress_message(&message, alloc),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "compressed message without negotiated extension",
            )),
        };
        alloc.free(message);
        Ok(inflated?)
    }

    fn reset_message_state(&mut self) {
        self.compress = false;
        self.expecting_fragments = false;
        self.message_opcode = None;
        if let Some(message) = self.message.take() {
            if let Some(conn) = &self.conn {
                conn.engine().body_allocator().free(message);
            }
        }
    }

    fn message_too_large(&self, len: usize) -> bool {
        self.settings.message_length_limit > 0 && len > self.settings.message_length_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrader() -> Upgrader {
        Upgrader::new(Arc::new(Settings::new()))
    }

    fn header(byte0: u8, payload_len: usize) -> FrameHeader {
        FrameHeader {
            fin: byte0 & 0x80 != 0,
            rsv1: byte0 & 0x40 != 0,
            rsv2: byte0 & 0x20 != 0,
            rsv3: byte0 & 0x10 != 0,
            opcode: byte0 & 0x0F,
            masked: true,
            payload_len,
            mask_key: [0; 4],
            header_size: 6,
        }
    }

    #[test]
    fn rsv1_requires_negotiated_compression() {
        let u = upgrader();
        assert!(matches!(
            u.validate_frame(&header(0xC1, 0)),
            Err(Error::ReservedBitSet)
        ));

        let mut u = upgrader();
        u.compress_negotiated = true;
        assert!(u.validate_frame(&header(0xC1, 0)).is_ok());
    }

    #[test]
    fn rsv2_and_rsv3_are_always_rejected() {
        let mut u = upgrader();
        u.compress_negotiated = true;
        assert!(matches!(
            u.validate_frame(&header(0xA1, 0)),
            Err(Error::ReservedBitSet)
        ));
        assert!(matches!(
            u.validate_frame(&header(0x91, 0)),
            Err(Error::ReservedBitSet)
        ));
    }

    #[test]
    fn reserved_opcodes_are_rejected() {
        let u = upgrader();
        for opcode in [0x3, 0x7, 0xB, 0xF] {
            assert!(matches!(
                u.validate_frame(&header(0x80 | opcode, 0)),
                Err(Error::ReservedOpcode(v)) if v == opcode
            ));
        }
    }

    #[test]
    fn control_frames_must_be_final_and_small() {
        let u = upgrader();
        assert!(matches!(
            u.validate_frame(&header(0x09, 0)),
            Err(Error::FragmentedControlFrame)
        ));
        assert!(matches!(
            u.validate_frame(&header(0x88, 126)),
            Err(Error::ControlFrameTooLarge)
        ));
        assert!(u.validate_frame(&header(0x88, 125)).is_ok());
    }

    #[test]
    fn fragmentation_opcode_rules() {
        let mut u = upgrader();
        // Outside fragmentation: text is fine, continuation is not.
        assert!(u.validate_frame(&header(0x01, 0)).is_ok());
        assert!(matches!(
            u.validate_frame(&header(0x80, 0)),
            Err(Error::InvalidContinuation)
        ));

        // Inside fragmentation: continuation and control pass, text does not.
        u.expecting_fragments = true;
        assert!(u.validate_frame(&header(0x80, 0)).is_ok());
        assert!(u.validate_frame(&header(0x89, 0)).is_ok());
        assert!(matches!(
            u.validate_frame(&header(0x81, 0)),
            Err(Error::ExpectedContinuation)
        ));
        assert!(matches!(
            u.validate_frame(&header(0x02, 0)),
            Err(Error::ExpectedContinuation)
        ));
    }

    #[test]
    fn message_length_limit_is_optional() {
        let u = upgrader();
        assert!(!u.message_too_large(usize::MAX));

        let mut settings = Settings::new();
        settings.message_length_limit = 10;
        let u = Upgrader::new(Arc::new(settings));
        assert!(!u.message_too_large(10));
        assert!(u.message_too_large(11));
    }
}
