//! Close status codes (RFC 6455 §7.4).

use self::CloseCode::*;

/// Status codes carried in the first two bytes of a Close frame payload.
///
/// The named variants cover the codes registered by RFC 6455 and its
/// successors; the catch-all variants keep the numeric value for ranges that
/// are reserved, IANA-assigned, or free for applications.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// 1000: the purpose of the connection has been fulfilled.
    Normal,
    /// 1001: the endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: a protocol error was detected.
    Protocol,
    /// 1003: a data type the endpoint cannot accept was received.
    Unsupported,
    /// 1005: no status code was present. Must not appear on the wire.
    Status,
    /// 1006: the connection dropped without a close frame. Must not appear on
    /// the wire.
    Abnormal,
    /// 1007: message data was inconsistent with its type (e.g. bad UTF-8).
    Invalid,
    /// 1008: a policy was violated.
    Policy,
    /// 1009: a message was too large to process.
    Size,
    /// 1010: the client expected an extension the server did not negotiate.
    Extension,
    /// 1011: the server hit an unexpected condition.
    Error,
    /// 1012: the server is restarting.
    Restart,
    /// 1013: the server is overloaded; try again later.
    Again,
    /// 1014: a gateway received an invalid response upstream.
    BadGateway,
    #[doc(hidden)]
    /// 1015: TLS handshake failure. Must not appear on the wire.
    Tls,
    #[doc(hidden)]
    /// Reserved codes (1016-2999) kept for protocol revisions.
    Reserved(u16),
    #[doc(hidden)]
    /// IANA-registered codes (3000-3999).
    Iana(u16),
    #[doc(hidden)]
    /// Application codes (4000-4999).
    Library(u16),
    #[doc(hidden)]
    /// Codes outside every acceptable range.
    Bad(u16),
}

/// Reports whether a close code received on the wire is acceptable.
///
/// The acceptable set is 1000-1003 and 1007-1015 plus the registered and
/// application ranges 3000-4999. The codes 1004, 1005 and 1006 are reserved
/// for local signalling and must never be sent.
pub fn valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1015 | 3000..=4999)
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => Normal,
            1001 => Away,
            1002 => Protocol,
            1003 => Unsupported,
            1005 => Status,
            1006 => Abnormal,
            1007 => Invalid,
            1008 => Policy,
            1009 => Size,
            1010 => Extension,
            1011 => Error,
            1012 => Restart,
            1013 => Again,
            1014 => BadGateway,
            1015 => Tls,
            1016..=2999 => Reserved(code),
            3000..=3999 => Iana(code),
            4000..=4999 => Library(code),
            _ => Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            Normal => 1000,
            Away => 1001,
            Protocol => 1002,
            Unsupported => 1003,
            Status => 1005,
            Abnormal => 1006,
            Invalid => 1007,
            Policy => 1008,
            Size => 1009,
            Extension => 1010,
            Error => 1011,
            Restart => 1012,
            Again => 1013,
            BadGateway => 1014,
            Tls => 1015,
            Reserved(code) => code,
            Iana(code) => code,
            Library(code) => code,
            Bad(code) => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_codes_roundtrip() {
        for code in [
            1000, 1001, 1002, 1003, 1005, 1006, 1007, 1008, 1009, 1010, 1011, 1012, 1013, 1014,
            1015, 1500, 3000, 3999, 4000, 4999, 5000,
        ] {
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
    }

    #[test]
    fn wire_validity_matches_registered_set() {
        for code in 1000..=1003 {
            assert!(valid_close_code(code), "{code}");
        }
        for code in [1004, 1005, 1006] {
            assert!(!valid_close_code(code), "{code}");
        }
        for code in 1007..=1015 {
            assert!(valid_close_code(code), "{code}");
        }
        for code in [0, 999, 1016, 2999, 5000, u16::MAX] {
            assert!(!valid_close_code(code), "{code}");
        }
        for code in 3000..=4999 {
            assert!(valid_close_code(code), "{code}");
        }
    }
}
