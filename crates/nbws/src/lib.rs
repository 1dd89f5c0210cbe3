//! # nbws
//!
//! Server-side WebSocket (RFC 6455) protocol engine for non-blocking,
//! event-driven byte transports, with permessage-deflate (RFC 7692) support.
//!
//! The crate is sans-io: it never owns a socket, an event loop or a thread.
//! The host runtime parses the HTTP/1.1 upgrade request, hijacks the
//! transport, and then feeds raw byte chunks — of arbitrary size and
//! boundary — into the engine, which parses frames, reassembles messages,
//! validates protocol conformance, decompresses payloads and dispatches user
//! callbacks through a per-connection serialized executor.
//!
//! ```text
//! transport bytes ──▶ Upgrader::on_read ──▶ frames ──▶ messages ──▶ handlers
//!                        │                                             ▲
//!                        └── pong / close replies ◀── Conn ◀── executor┘
//! ```
//!
//! # Usage
//!
//! Configure a [`Settings`] registry once, then drive one [`Upgrader`] per
//! connection:
//!
//! ```
//! use std::sync::Arc;
//! use nbws::{MessageType, Settings, Upgrader};
//!
//! let mut settings = Settings::new();
//! settings.enable_compression(true);
//! settings.on_message(|conn, kind, data| {
//!     if kind == MessageType::Text {
//!         let _ = conn.write_message(kind, data);
//!     }
//! });
//! let settings = Arc::new(settings);
//!
//! // Per connection:
//! let mut upgrader = Upgrader::new(settings.clone());
//! // upgrader.upgrade(&request, None, &mut response_writer)?;
//! // ... then route every transport chunk to upgrader.on_read(chunk).
//! # let _ = &mut upgrader;
//! ```
//!
//! The host-facing contracts — [`Transport`], [`Executor`],
//! [`ResponseWriter`], [`Session`], [`Engine`] — live in [`runtime`].

pub mod close;
pub mod compression;
pub mod frame;
pub mod handshake;
pub mod headers;
pub mod pool;
pub mod runtime;
pub mod settings;
pub mod upgrader;

mod codec;
#[doc(hidden)]
pub mod mask;

use thiserror::Error as ThisError;

pub use crate::{
    close::{CloseCode, valid_close_code},
    frame::{FrameHeader, MAX_CONTROL_PAYLOAD, MessageType},
    handshake::accept_key,
    pool::{Allocator, BucketPool},
    runtime::{Conn, Engine, Executor, InlineExecutor, ResponseWriter, Session, Transport},
    settings::Settings,
    upgrader::Upgrader,
};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the handshake and the frame engine.
#[derive(ThisError, Debug)]
pub enum Error {
    /// An `Upgrader` serves one connection; this one was used already.
    #[error("upgrader instance already used")]
    UpgraderReused,

    /// `Connection: upgrade` or `Upgrade: websocket` token missing.
    #[error("upgrade token not found in request headers")]
    UpgradeTokenNotFound,

    /// The upgrade request must be a GET.
    #[error("websocket upgrade requires a GET request")]
    MethodNotGet,

    /// `Sec-WebSocket-Version` must contain 13.
    #[error("Sec-WebSocket-Version must be 13")]
    InvalidWebsocketVersion,

    /// The caller preset `Sec-WebSocket-Extensions`; extension negotiation
    /// belongs to the engine.
    #[error("Sec-WebSocket-Extensions must not be preset in response headers")]
    UnsupportedExtensions,

    /// The origin check rejected the request.
    #[error("request origin not allowed")]
    OriginNotAllowed,

    /// `Sec-WebSocket-Key` header missing or empty.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingWebsocketKey,

    /// The response writer cannot surrender the raw transport.
    #[error("connection does not support hijacking")]
    NotHijackable,

    /// RSV bits set without a negotiated extension.
    #[error("reserved frame header bits are set")]
    ReservedBitSet,

    /// Opcode in a range reserved by RFC 6455.
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),

    /// A control frame arrived without FIN.
    #[error("control frame must not be fragmented")]
    FragmentedControlFrame,

    /// A control frame payload exceeded 125 bytes.
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// A continuation frame arrived with no message in progress.
    #[error("continuation frame without a message in progress")]
    InvalidContinuation,

    /// A text or binary frame arrived in the middle of a fragmented message.
    #[error("expected a continuation frame during fragmentation")]
    ExpectedContinuation,

    /// A message outgrew `message_length_limit`.
    #[error("message exceeds the configured length limit")]
    MessageTooLarge,

    /// Buffered unparsed bytes outgrew `read_limit`.
    #[error("read buffer exceeds the configured read limit")]
    ReadLimitExceeded,

    /// Transport write failure or corrupt compressed payload.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The HTTP status a failed handshake reports, or `None` for errors
    /// past the handshake.
    pub fn http_status(&self) -> Option<http::StatusCode> {
        use http::StatusCode;
        match self {
            Self::UpgraderReused | Self::UnsupportedExtensions | Self::NotHijackable => {
                Some(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::UpgradeTokenNotFound
            | Self::InvalidWebsocketVersion
            | Self::MissingWebsocketKey => Some(StatusCode::BAD_REQUEST),
            Self::MethodNotGet => Some(StatusCode::METHOD_NOT_ALLOWED),
            Self::OriginNotAllowed => Some(StatusCode::FORBIDDEN),
            _ => None,
        }
    }

    /// Returns `true` for errors detected during the upgrade handshake.
    pub fn is_handshake_error(&self) -> bool {
        self.http_status().is_some()
    }

    /// Returns `true` for RFC 6455 violations in the frame stream.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::ReservedBitSet
                | Self::ReservedOpcode(_)
                | Self::FragmentedControlFrame
                | Self::ControlFrameTooLarge
                | Self::InvalidContinuation
                | Self::ExpectedContinuation
        )
    }

    /// Returns `true` for configured-limit violations.
    pub fn is_size_error(&self) -> bool {
        matches!(self, Self::MessageTooLarge | Self::ReadLimitExceeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_errors_map_to_statuses() {
        use http::StatusCode;
        assert_eq!(
            Error::UpgraderReused.http_status(),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );
        assert_eq!(
            Error::UpgradeTokenNotFound.http_status(),
            Some(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            Error::MethodNotGet.http_status(),
            Some(StatusCode::METHOD_NOT_ALLOWED)
        );
        assert_eq!(
            Error::OriginNotAllowed.http_status(),
            Some(StatusCode::FORBIDDEN)
        );
        assert_eq!(Error::ReservedBitSet.http_status(), None);
        assert_eq!(Error::MessageTooLarge.http_status(), None);
    }

    #[test]
    fn error_classification() {
        assert!(Error::MissingWebsocketKey.is_handshake_error());
        assert!(!Error::MissingWebsocketKey.is_protocol_error());
        assert!(Error::ReservedOpcode(0x3).is_protocol_error());
        assert!(Error::ExpectedContinuation.is_protocol_error());
        assert!(Error::ReadLimitExceeded.is_size_error());
        assert!(Error::MessageTooLarge.is_size_error());
        assert!(!Error::MessageTooLarge.is_protocol_error());
    }
}
