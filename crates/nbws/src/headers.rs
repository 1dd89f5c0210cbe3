//! HTTP header lexing for the upgrade handshake.
//!
//! Implements the small slice of RFC 7230 grammar the handshake needs:
//! token lexing, quoted strings with backslash escapes, case-insensitive
//! token membership in comma-separated header values, and the
//! `Sec-WebSocket-Extensions` parameter list (RFC 6455 §9.1).

use std::{borrow::Cow, collections::HashMap};

use http::HeaderMap;
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{anychar, char},
    combinator::map,
    multi::fold_many0,
    sequence::{delimited, preceded},
};

/// RFC 7230 `tchar`.
fn is_token_octet(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

/// Skips leading spaces and horizontal tabs.
pub fn skip_space(s: &str) -> &str {
    s.trim_start_matches([' ', '\t'])
}

/// Splits the longest token prefix off `s`.
///
/// Returns the (possibly empty) token and the rest of the input.
pub fn next_token(s: &str) -> (&str, &str) {
    let end = s
        .bytes()
        .position(|b| !is_token_octet(b))
        .unwrap_or(s.len());
    s.split_at(end)
}

enum Piece<'a> {
    Chunk(&'a str),
    Escaped(char),
}

/// `"..."` with backslash escaping any following character.
fn quoted(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        fold_many0(
            alt((
                map(take_while1(|c: char| c != '"' && c != '\\'), Piece::Chunk),
                map(preceded(char('\\'), anychar), Piece::Escaped),
            )),
            String::new,
            |mut acc, piece| {
                match piece {
                    Piece::Chunk(chunk) => acc.push_str(chunk),
                    Piece::Escaped(c) => acc.push(c),
                }
                acc
            },
        ),
        char('"'),
    )
    .parse(input)
}

/// Splits a token or quoted string off `s`.
///
/// Quoted values have their escapes resolved. An unterminated quote yields
/// the empty value and empty rest.
pub fn next_token_or_quoted(s: &str) -> (Cow<'_, str>, &str) {
    if !s.starts_with('"') {
        let (token, rest) = next_token(s);
        return (Cow::Borrowed(token), rest);
    }
    match quoted(s) {
        Ok((rest, value)) => (Cow::Owned(value), rest),
        Err(_) => (Cow::Borrowed(""), ""),
    }
}

/// Compares two strings, folding only ASCII `A`-`Z`.
///
/// Non-ASCII characters are compared verbatim: Unicode case folding does not
/// apply to HTTP tokens.
pub fn equal_ascii_fold(a: &str, b: &str) -> bool {
    let mut a = a.chars();
    let mut b = b.chars();
    loop {
        match (a.next(), b.next()) {
            (None, None) => return true,
            (Some(x), Some(y)) => {
                if x.to_ascii_lowercase() != y.to_ascii_lowercase() {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Reports whether any `name` header value contains `value` as one of its
/// comma-separated tokens, compared case-insensitively.
pub fn header_contains(headers: &HeaderMap, name: &str, value: &str) -> bool {
    'values: for header in headers.get_all(name) {
        let Ok(mut s) = header.to_str() else {
            continue;
        };
        loop {
            let (token, rest) = next_token(skip_space(s));
            if token.is_empty() {
                continue 'values;
            }
            s = skip_space(rest);
            if !s.is_empty() && !s.starts_with(',') {
                continue 'values;
            }
            if equal_ascii_fold(token, value) {
                return true;
            }
            if s.is_empty() {
                continue 'values;
            }
            s = &s[1..];
        }
    }
    false
}

/// Parses every `Sec-WebSocket-Extensions` header value into a list of
/// parameter maps.
///
/// Each map holds the extension's parameters; the extension name itself is
/// stored under the empty-string key. Parameter values may be tokens or
/// quoted strings; a parameter without `=` maps to the empty string.
/// Malformed entries abort the rest of that header value, matching the
/// forgiving recovery clients get from common server implementations.
pub fn parse_extensions(headers: &HeaderMap) -> Vec<HashMap<String, String>> {
    let mut result = Vec::new();
    'values: for header in headers.get_all(http::header::SEC_WEBSOCKET_EXTENSIONS) {
        let Ok(mut s) = header.to_str() else {
            continue;
        };
        loop {
            let (name, rest) = next_token(skip_space(s));
            if name.is_empty() {
                continue 'values;
            }
            s = rest;

            let mut ext = HashMap::from([(String::new(), name.to_owned())]);
            loop {
                s = skip_space(s);
                if !s.starts_with(';') {
                    break;
                }
                let (key, rest) = next_token(skip_space(&s[1..]));
                if key.is_empty() {
                    continue 'values;
                }
                s = skip_space(rest);
                let mut value = Cow::Borrowed("");
                if s.starts_with('=') {
                    let (parsed, rest) = next_token_or_quoted(skip_space(&s[1..]));
                    value = parsed;
                    s = skip_space(rest);
                }
                if !s.is_empty() && !s.starts_with(',') && !s.starts_with(';') {
                    continue 'values;
                }
                ext.insert(key.to_owned(), value.into_owned());
            }

            if !s.is_empty() && !s.starts_with(',') {
                continue 'values;
            }
            result.push(ext);
            if s.is_empty() {
                continue 'values;
            }
            s = &s[1..];
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, HeaderValue};

    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn token_lexing() {
        assert_eq!(next_token("websocket, keep-alive"), ("websocket", ", keep-alive"));
        assert_eq!(next_token(" leading"), ("", " leading"));
        assert_eq!(next_token(""), ("", ""));
        assert_eq!(skip_space(" \t x "), "x ");
    }

    #[test]
    fn quoted_values() {
        let (value, rest) = next_token_or_quoted(r#""hello world", next"#);
        assert_eq!(value, "hello world");
        assert_eq!(rest, ", next");

        let (value, rest) = next_token_or_quoted(r#""a\"b\\c"x"#);
        assert_eq!(value, r#"a"b\c"#);
        assert_eq!(rest, "x");

        let (value, rest) = next_token_or_quoted(r#""""#);
        assert_eq!(value, "");
        assert_eq!(rest, "");
    }

    #[test]
    fn unterminated_quote_yields_empty() {
        let (value, rest) = next_token_or_quoted(r#""never closed"#);
        assert_eq!(value, "");
        assert_eq!(rest, "");

        let (value, rest) = next_token_or_quoted(r#""trailing escape\"#);
        assert_eq!(value, "");
        assert_eq!(rest, "");
    }

    #[test]
    fn ascii_fold_comparison() {
        assert!(equal_ascii_fold("WebSocket", "websocket"));
        assert!(equal_ascii_fold("UPGRADE", "upgrade"));
        assert!(!equal_ascii_fold("websocket", "websockets"));
        // Only ASCII letters fold; 'K' (Kelvin sign) is not 'k'.
        assert!(!equal_ascii_fold("\u{212A}", "k"));
        assert!(equal_ascii_fold("caf\u{E9}", "caf\u{E9}"));
        assert!(!equal_ascii_fold("caf\u{E9}", "caf\u{C9}"));
    }

    #[test]
    fn contains_walks_comma_separated_values() {
        let map = headers(&[("connection", "keep-alive, Upgrade")]);
        assert!(header_contains(&map, "connection", "upgrade"));
        assert!(header_contains(&map, "connection", "keep-alive"));
        assert!(!header_contains(&map, "connection", "close"));
    }

    #[test]
    fn contains_spans_repeated_headers() {
        let map = headers(&[("upgrade", "h2c"), ("upgrade", "WebSocket")]);
        assert!(header_contains(&map, "upgrade", "websocket"));
    }

    #[test]
    fn contains_ignores_values_with_parameters() {
        // "upgrade;q=1" is not a bare token and must not match.
        let map = headers(&[("connection", "upgrade;q=1")]);
        assert!(!header_contains(&map, "connection", "upgrade"));
    }

    #[test]
    fn contains_handles_trailing_comma() {
        let map = headers(&[("connection", "upgrade,")]);
        assert!(header_contains(&map, "connection", "upgrade"));
    }

    #[test]
    fn extensions_name_under_empty_key() {
        let map = headers(&[(
            "sec-websocket-extensions",
            "permessage-deflate; client_max_window_bits",
        )]);
        let exts = parse_extensions(&map);
        assert_eq!(exts.len(), 1);
        assert_eq!(exts[0][""], "permessage-deflate");
        assert_eq!(exts[0]["client_max_window_bits"], "");
    }

    #[test]
    fn extensions_with_values_and_quoting() {
        let map = headers(&[(
            "sec-websocket-extensions",
            r#"permessage-deflate; server_max_window_bits=10; foo="qu\"oted", x-custom"#,
        )]);
        let exts = parse_extensions(&map);
        assert_eq!(exts.len(), 2);
        assert_eq!(exts[0][""], "permessage-deflate");
        assert_eq!(exts[0]["server_max_window_bits"], "10");
        assert_eq!(exts[0]["foo"], "qu\"oted");
        assert_eq!(exts[1][""], "x-custom");
    }

    #[test]
    fn extensions_across_repeated_headers() {
        let map = headers(&[
            ("sec-websocket-extensions", "permessage-deflate"),
            ("sec-websocket-extensions", "x-other; a=1"),
        ]);
        let exts = parse_extensions(&map);
        assert_eq!(exts.len(), 2);
        assert_eq!(exts[0][""], "permessage-deflate");
        assert_eq!(exts[1][""], "x-other");
        assert_eq!(exts[1]["a"], "1");
    }

    #[test]
    fn malformed_extension_entry_is_dropped() {
        let map = headers(&[("sec-websocket-extensions", "permessage-deflate; =broken")]);
        assert!(parse_extensions(&map).is_empty());
    }
}
