//! Handshake helpers: accept key, origin check, subprotocol selection and
//! 101 response assembly.

use base64::prelude::*;
use bytes::BytesMut;
use http::{HeaderMap, Request, header};
use sha1::{Digest, Sha1};
use url::{Position, Url};

use crate::{headers::equal_ascii_fold, pool::Allocator, settings::Settings};

/// GUID from RFC 6455 §1.3, concatenated to the challenge key.
const KEY_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub(crate) const EXTENSION_PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Computes the `Sec-WebSocket-Accept` value for a challenge key.
pub fn accept_key(challenge: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(challenge.as_bytes());
    sha1.update(KEY_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Default origin policy: absent `Origin` is fine, otherwise its host must
/// equal the request host, ASCII-case-insensitively.
pub(crate) fn check_same_origin(request: &Request<()>) -> bool {
    let Some(origin) = request.headers().get(header::ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let Ok(origin_url) = Url::parse(origin) else {
        return false;
    };
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()));
    let Some(host) = host else {
        return false;
    };
    equal_ascii_fold(&origin_url[Position::BeforeHost..Position::AfterPort], host)
}

/// Subprotocols offered by the client, in request order.
fn client_subprotocols(request: &Request<()>) -> Vec<&str> {
    let Some(value) = request
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|h| h.to_str().ok())
    else {
        return Vec::new();
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Picks the subprotocol for the 101 response.
///
/// When the server configures subprotocols, the first server-preferred
/// protocol the client offered wins. Otherwise the caller-supplied response
/// header is echoed, if any.
pub(crate) fn select_subprotocol(
    settings: &Settings,
    request: &Request<()>,
    response_header: Option<&HeaderMap>,
) -> Option<String> {
    if !settings.subprotocols.is_empty() {
        let offered = client_subprotocols(request);
        for server_protocol in &settings.subprotocols {
            for client_protocol in &offered {
                if client_protocol == server_protocol {
                    return Some((*client_protocol).to_owned());
                }
            }
        }
        return None;
    }
    response_header?
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|h| h.to_str().ok())
        .map(str::to_owned)
}

/// Assembles the 101 response bytes.
///
/// Caller-provided headers are appended last, minus
/// `Sec-WebSocket-Protocol`; any control byte in their values is replaced
/// with a space so a header value cannot smuggle a CRLF into the response.
pub(crate) fn build_response(
    alloc: &dyn Allocator,
    accept: &str,
    subprotocol: Option<&str>,
    compress: bool,
    response_header: Option<&HeaderMap>,
) -> BytesMut {
    let mut buf = alloc.malloc(1024);
    buf.extend_from_slice(
        b"HTTP/1.1 101 Switching Protocols\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Accept: ",
    );
    buf.extend_from_slice(accept.as_bytes());
    buf.extend_from_slice(b"\r\n");

    if let Some(subprotocol) = subprotocol {
        buf.extend_from_slice(b"Sec-WebSocket-Protocol: ");
        buf.extend_from_slice(subprotocol.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if compress {
        buf.extend_from_slice(
            b"Sec-WebSocket-Extensions: permessage-deflate; \
              server_no_context_takeover; client_no_context_takeover\r\n",
        );
    }

    if let Some(extra) = response_header {
        for (name, value) in extra {
            if name == header::SEC_WEBSOCKET_PROTOCOL {
                continue;
            }
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            for &b in value.as_bytes() {
                buf.extend_from_slice(&[if b <= 31 { b' ' } else { b }]);
            }
            buf.extend_from_slice(b"\r\n");
        }
    }

    buf.extend_from_slice(b"\r\n");
    buf
}

#[cfg(test)]
mod tests {
    use http::{HeaderValue, Method};

    use super::*;
    use crate::pool::BucketPool;

    fn request(pairs: &[(&'static str, &str)]) -> Request<()> {
        let mut builder = Request::builder().method(Method::GET).uri("/chat");
        for (name, value) in pairs {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn accept_key_matches_rfc_sample() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn same_origin_accepts_absent_origin() {
        assert!(check_same_origin(&request(&[("host", "example.com")])));
    }

    #[test]
    fn same_origin_folds_ascii_case() {
        let req = request(&[("host", "Example.COM"), ("origin", "https://example.com")]);
        assert!(check_same_origin(&req));
    }

    #[test]
    fn same_origin_compares_ports() {
        let req = request(&[("host", "example.com:8080"), ("origin", "https://example.com:8080")]);
        assert!(check_same_origin(&req));

        let req = request(&[("host", "example.com:8080"), ("origin", "https://example.com:9090")]);
        assert!(!check_same_origin(&req));
    }

    #[test]
    fn cross_origin_is_rejected() {
        let req = request(&[("host", "example.com"), ("origin", "https://evil.test")]);
        assert!(!check_same_origin(&req));

        let req = request(&[("host", "example.com"), ("origin", "not a url")]);
        assert!(!check_same_origin(&req));
    }

    #[test]
    fn server_preference_order_wins() {
        let mut settings = Settings::new();
        settings.subprotocols = vec!["graphql-ws".into(), "chat".into()];
        let req = request(&[("sec-websocket-protocol", "chat, graphql-ws")]);
        assert_eq!(
            select_subprotocol(&settings, &req, None).as_deref(),
            Some("graphql-ws")
        );
    }

    #[test]
    fn no_overlap_selects_nothing() {
        let mut settings = Settings::new();
        settings.subprotocols = vec!["chat".into()];
        let req = request(&[("sec-websocket-protocol", "soap")]);
        assert_eq!(select_subprotocol(&settings, &req, None), None);
    }

    #[test]
    fn caller_header_echoed_without_server_list() {
        let settings = Settings::new();
        let req = request(&[("sec-websocket-protocol", "chat")]);
        let mut response_header = HeaderMap::new();
        response_header.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("chat"),
        );
        assert_eq!(
            select_subprotocol(&settings, &req, Some(&response_header)).as_deref(),
            Some("chat")
        );
        assert_eq!(select_subprotocol(&settings, &req, None), None);
    }

    #[test]
    fn response_contains_accept_and_negotiated_headers() {
        let pool = BucketPool::new();
        let response = build_response(
            &pool,
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
            Some("chat"),
            true,
            None,
        );
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.contains(
            "Sec-WebSocket-Extensions: permessage-deflate; \
             server_no_context_takeover; client_no_context_takeover\r\n"
        ));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn caller_headers_are_sanitized_and_filtered() {
        let pool = BucketPool::new();
        let mut extra = HeaderMap::new();
        extra.insert("x-powered-by", HeaderValue::from_static("nbws"));
        extra.insert("x-tricky", HeaderValue::from_bytes(b"a\tb").unwrap());
        extra.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("sneaky"),
        );
        let response = build_response(&pool, "k", None, false, Some(&extra));
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.contains("x-powered-by: nbws\r\n"));
        assert!(text.contains("x-tricky: a b\r\n"));
        assert!(!text.contains("sneaky"));
    }
}
