//! Shared connection policy and handler registry.

use std::{sync::Arc, time::Duration};

use http::Request;

use crate::{
    CloseCode, Conn, MessageType,
    frame::MAX_CONTROL_PAYLOAD,
};

pub type OpenHandler = Arc<dyn Fn(&Conn) + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(&Conn, MessageType, &[u8]) + Send + Sync>;
pub type DataFrameHandler = Arc<dyn Fn(&Conn, MessageType, bool, &[u8]) + Send + Sync>;
pub type CloseHandler = Arc<dyn Fn(&Conn, Option<&crate::Error>) + Send + Sync>;
pub type ControlHandler = Arc<dyn Fn(&Conn, &[u8]) + Send + Sync>;
pub type CloseMessageHandler = Arc<dyn Fn(&Conn, u16, &str) + Send + Sync>;
pub type OriginCheck = Arc<dyn Fn(&Request<()>) -> bool + Send + Sync>;

/// Policies and callbacks shared by every connection of an endpoint.
///
/// Configure one instance at startup, wrap it in an [`Arc`], and hand a
/// clone to each [`Upgrader`](crate::Upgrader). The registry is read-only
/// once connections are live; nothing here is synchronized.
pub struct Settings {
    /// Maximum unparsed bytes the engine will buffer per connection.
    /// 0 means unlimited.
    pub read_limit: usize,
    /// Maximum length of one message, before decompression. 0 means
    /// unlimited.
    pub message_length_limit: usize,
    /// Write deadline applied to the 101 response. Zero disables it.
    pub handshake_timeout: Duration,
    /// Server subprotocols in preference order. Empty defers to any
    /// subprotocol the caller placed in the response headers.
    pub subprotocols: Vec<String>,
    /// Advisory flag for hosts that compress outgoing messages themselves;
    /// the engine's own write path never compresses.
    pub enable_write_compression: bool,
    /// Compression level for hosts honoring `enable_write_compression`.
    pub compression_level: u32,

    pub(crate) enable_compression: bool,
    pub(crate) check_origin: Option<OriginCheck>,

    pub(crate) open_handler: Option<OpenHandler>,
    pub(crate) message_handler: Option<MessageHandler>,
    pub(crate) data_frame_handler: Option<DataFrameHandler>,
    pub(crate) close_handler: Option<CloseHandler>,
    pub(crate) ping_handler: ControlHandler,
    pub(crate) pong_handler: ControlHandler,
    pub(crate) close_message_handler: CloseMessageHandler,
}

impl Settings {
    pub fn new() -> Self {
        Self {
            read_limit: 0,
            message_length_limit: 0,
            handshake_timeout: Duration::ZERO,
            subprotocols: Vec::new(),
            enable_write_compression: false,
            compression_level: 1,
            enable_compression: false,
            check_origin: None,
            open_handler: None,
            message_handler: None,
            data_frame_handler: None,
            close_handler: None,
            ping_handler: Arc::new(default_ping_handler),
            pong_handler: Arc::new(|_, _| {}),
            close_message_handler: Arc::new(default_close_handler),
        }
    }

    /// Called once per connection after a successful upgrade.
    pub fn on_open(&mut self, handler: impl Fn(&Conn) + Send + Sync + 'static) {
        self.open_handler = Some(Arc::new(handler));
    }

    /// Called with each complete (reassembled, decompressed) message.
    pub fn on_message(&mut self, handler: impl Fn(&Conn, MessageType, &[u8]) + Send + Sync + 'static) {
        self.message_handler = Some(Arc::new(handler));
    }

    /// Called with each data frame as it arrives. The message type is the
    /// one of the message in progress, and `fin` marks its last frame.
    pub fn on_data_frame(
        &mut self,
        handler: impl Fn(&Conn, MessageType, bool, &[u8]) + Send + Sync + 'static,
    ) {
        self.data_frame_handler = Some(Arc::new(handler));
    }

    /// Called when the connection goes away, with the error that ended it,
    /// if any.
    pub fn on_close(&mut self, handler: impl Fn(&Conn, Option<&crate::Error>) + Send + Sync + 'static) {
        self.close_handler = Some(Arc::new(handler));
    }

    /// Replaces the default ping handler (pong echo with the 125-byte cap).
    pub fn set_ping_handler(&mut self, handler: impl Fn(&Conn, &[u8]) + Send + Sync + 'static) {
        self.ping_handler = Arc::new(handler);
    }

    /// Replaces the default pong handler (no-op).
    pub fn set_pong_handler(&mut self, handler: impl Fn(&Conn, &[u8]) + Send + Sync + 'static) {
        self.pong_handler = Arc::new(handler);
    }

    /// Replaces the default close handler (echo of code and reason).
    pub fn set_close_handler(
        &mut self,
        handler: impl Fn(&Conn, u16, &str) + Send + Sync + 'static,
    ) {
        self.close_message_handler = Arc::new(handler);
    }

    /// Replaces the default same-origin check.
    pub fn set_check_origin(
        &mut self,
        check: impl Fn(&Request<()>) -> bool + Send + Sync + 'static,
    ) {
        self.check_origin = Some(Arc::new(check));
    }

    /// Offers permessage-deflate to clients that request it.
    pub fn enable_compression(&mut self, enable: bool) {
        self.enable_compression = enable;
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

fn default_ping_handler(conn: &Conn, data: &[u8]) {
    if data.len() > MAX_CONTROL_PAYLOAD {
        conn.close();
        return;
    }
    if let Err(err) = conn.write_message(MessageType::Pong, data) {
        tracing::debug!("failed to send pong: {err}");
        conn.close();
    }
}

fn default_close_handler(conn: &Conn, code: u16, text: &str) {
    // The reply is a control frame too: drop the reason rather than exceed
    // the 125-byte cap.
    let reason = if 2 + text.len() > MAX_CONTROL_PAYLOAD {
        ""
    } else {
        text
    };
    let _ = conn.write_close(CloseCode::from(code), reason);
}
