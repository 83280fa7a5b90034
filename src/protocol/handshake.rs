//! Connection handshakes.
//!
//! A socket opens with either the 24-byte native header or an HTTP upgrade
//! request. Both carry the connection UUID and the number of sockets the
//! connecting side intends to open.
//!
//! # Native Header
//!
//! | Offset | Size | Content |
//! |--------|------|---------|
//! | 0 | 6 | ASCII `SSTTCP` |
//! | 6 | 2 | Socket count, ASCII decimal |
//! | 8 | 16 | Connection UUID |
//!
//! # WebSocket Upgrade
//!
//! The request target is `/<uuid>?sockets=N`. `Sec-WebSocket-Version` selects
//! the flavour:
//!
//! | Version | Flavour | Reply token |
//! |---------|---------|-------------|
//! | absent | hixie-76 | `MD5(key1 ++ key2 ++ 8 trailing bytes)` |
//! | `>= 13` | RFC6455 | `base64(SHA1(key ++ GUID))` |

// ============================================================================
// Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::Md5;
use sha1::{Digest, Sha1};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::ConnectionUuid;
use crate::options::MAX_PARALLEL_SOCKETS;
use crate::protocol::frame::FramingStyle;

// ============================================================================
// Constants
// ============================================================================

/// ASCII tag opening every native header.
pub const NATIVE_TAG: &[u8; 6] = b"SSTTCP";

/// Size of the native header.
pub const NATIVE_HEADER_LEN: usize = 24;

/// Trailing key bytes following a hixie-76 request.
pub const HIXIE_KEY3_LEN: usize = 8;

/// GUID appended to the client key by RFC6455.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const MIN_RFC6455_VERSION: u32 = 13;

// ============================================================================
// NativeHeader
// ============================================================================

/// The fixed header exchanged on every native socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeHeader {
    /// Sockets in the connection.
    pub sockets: usize,
    /// Connection the socket belongs to.
    pub uuid: ConnectionUuid,
}

impl NativeHeader {
    /// Creates a header.
    #[inline]
    #[must_use]
    pub const fn new(sockets: usize, uuid: ConnectionUuid) -> Self {
        Self { sockets, uuid }
    }

    /// Serialises the header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the socket count does not fit two digits.
    pub fn encode(&self) -> Result<[u8; NATIVE_HEADER_LEN]> {
        if self.sockets == 0 || self.sockets > MAX_PARALLEL_SOCKETS {
            return Err(Error::handshake(format!(
                "Socket count {} does not fit the header",
                self.sockets
            )));
        }

        let mut out = [0u8; NATIVE_HEADER_LEN];
        out[..6].copy_from_slice(NATIVE_TAG);
        out[6] = b'0' + (self.sockets / 10) as u8;
        out[7] = b'0' + (self.sockets % 10) as u8;
        out[8..].copy_from_slice(self.uuid.as_bytes());
        Ok(out)
    }

    /// Parses a header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] on a wrong tag, non-digit count or a
    /// count of zero.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NATIVE_HEADER_LEN {
            return Err(Error::handshake("Native header truncated"));
        }
        if !is_native(bytes) {
            return Err(Error::handshake("Native header tag mismatch"));
        }

        let (tens, ones) = (bytes[6], bytes[7]);
        if !tens.is_ascii_digit() || !ones.is_ascii_digit() {
            return Err(Error::handshake("Native header socket count is not decimal"));
        }
        let sockets = usize::from(tens - b'0') * 10 + usize::from(ones - b'0');
        if sockets == 0 {
            return Err(Error::handshake("Native header announces zero sockets"));
        }

        let mut uuid = [0u8; ConnectionUuid::WIRE_SIZE];
        uuid.copy_from_slice(&bytes[8..NATIVE_HEADER_LEN]);

        Ok(Self {
            sockets,
            uuid: ConnectionUuid::from_bytes(uuid),
        })
    }
}

/// Returns `true` if `prefix` opens a native handshake.
#[inline]
#[must_use]
pub fn is_native(prefix: &[u8]) -> bool {
    prefix.starts_with(NATIVE_TAG)
}

/// Returns `true` if `prefix` opens an HTTP upgrade request.
#[inline]
#[must_use]
pub fn is_http(prefix: &[u8]) -> bool {
    prefix.starts_with(b"GET ")
}

/// Returns the length of the HTTP head including its blank line, if complete.
#[must_use]
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

// ============================================================================
// UpgradeRequest
// ============================================================================

/// Flavour of a WebSocket upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketFlavor {
    /// RFC6455 with its client key.
    Rfc6455 {
        /// `Sec-WebSocket-Key`.
        key: String,
    },
    /// Legacy hixie-76 with its two numeric keys.
    Hixie76 {
        /// `Sec-WebSocket-Key1`.
        key1: String,
        /// `Sec-WebSocket-Key2`.
        key2: String,
    },
}

/// A parsed WebSocket upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Raw request target.
    pub path: String,
    /// Connection the socket belongs to.
    pub uuid: ConnectionUuid,
    /// Sockets the client intends to open.
    pub sockets: usize,
    /// `Host` header.
    pub host: Option<String>,
    /// `Origin` (or `Sec-WebSocket-Origin`) header.
    pub origin: Option<String>,
    /// `Sec-WebSocket-Protocol` header.
    pub protocol: Option<String>,
    /// Handshake flavour.
    pub flavor: WebSocketFlavor,
}

impl UpgradeRequest {
    /// Parses an HTTP request head ending in a blank line.
    ///
    /// A target without a UUID is accepted only for a single-socket
    /// connection and receives a fresh UUID.
    ///
    /// # Errors
    ///
    /// - [`Error::Handshake`] if the request is not a usable upgrade
    /// - [`Error::Url`] if the request target cannot be parsed
    pub fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head)
            .map_err(|_| Error::handshake("Upgrade request is not UTF-8"))?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (Some("GET"), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::handshake(format!(
                "Malformed request line '{request_line}'"
            )));
        };
        if !version.starts_with("HTTP/") {
            return Err(Error::handshake(format!("Unsupported protocol '{version}'")));
        }

        let headers: Vec<(&str, &str)> = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            // hixie-76 keys count spaces, so only the separator space is removed.
            .map(|(name, value)| (name.trim(), value.strip_prefix(' ').unwrap_or(value)))
            .collect();
        let header = |name: &str| {
            headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| (*value).to_string())
        };

        let flavor = match header("Sec-WebSocket-Version") {
            None => WebSocketFlavor::Hixie76 {
                key1: header("Sec-WebSocket-Key1")
                    .ok_or_else(|| Error::handshake("Missing Sec-WebSocket-Key1"))?,
                key2: header("Sec-WebSocket-Key2")
                    .ok_or_else(|| Error::handshake("Missing Sec-WebSocket-Key2"))?,
            },
            Some(raw) => {
                let version: u32 = raw
                    .trim()
                    .parse()
                    .map_err(|_| Error::handshake(format!("Invalid WebSocket version '{raw}'")))?;
                if version < MIN_RFC6455_VERSION {
                    return Err(Error::handshake(format!(
                        "Unsupported WebSocket version {version}"
                    )));
                }
                WebSocketFlavor::Rfc6455 {
                    key: header("Sec-WebSocket-Key")
                        .ok_or_else(|| Error::handshake("Missing Sec-WebSocket-Key"))?,
                }
            }
        };

        let (uuid, sockets) = parse_target(path)?;

        Ok(Self {
            path: path.to_string(),
            uuid,
            sockets,
            host: header("Host"),
            origin: header("Origin").or_else(|| header("Sec-WebSocket-Origin")),
            protocol: header("Sec-WebSocket-Protocol"),
            flavor,
        })
    }

    /// Framing the connection will use after this handshake.
    #[inline]
    #[must_use]
    pub const fn framing_style(&self) -> FramingStyle {
        match self.flavor {
            WebSocketFlavor::Rfc6455 { .. } => FramingStyle::WebSocket,
            WebSocketFlavor::Hixie76 { .. } => FramingStyle::ZeroDelimited,
        }
    }

    /// Returns `true` if 8 key bytes follow the request head.
    #[inline]
    #[must_use]
    pub const fn expects_key3(&self) -> bool {
        matches!(self.flavor, WebSocketFlavor::Hixie76 { .. })
    }

    /// Builds the `101` reply.
    ///
    /// `key3` holds the bytes following a hixie-76 head and is ignored for
    /// RFC6455.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if a hixie-76 key is malformed.
    pub fn response(&self, key3: &[u8; HIXIE_KEY3_LEN]) -> Result<Vec<u8>> {
        let mut reply = String::from("HTTP/1.1 101 ");

        let challenge = match &self.flavor {
            WebSocketFlavor::Rfc6455 { key } => {
                reply.push_str("Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n");
                reply.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", websocket_accept(key)));
                None
            }
            WebSocketFlavor::Hixie76 { key1, key2 } => {
                let challenge = hixie76_challenge(key1, key2, key3)?;
                reply.push_str(
                    "WebSocket Protocol Handshake\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n",
                );
                if let Some(origin) = &self.origin {
                    reply.push_str(&format!("Sec-WebSocket-Origin: {origin}\r\n"));
                }
                let host = self.host.as_deref().unwrap_or("localhost");
                reply.push_str(&format!("Sec-WebSocket-Location: ws://{host}{}\r\n", self.path));
                Some(challenge)
            }
        };

        if let Some(protocol) = &self.protocol {
            reply.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
        }
        reply.push_str("\r\n");

        let mut bytes = reply.into_bytes();
        if let Some(challenge) = challenge {
            bytes.extend_from_slice(&challenge);
        }
        Ok(bytes)
    }
}

/// Extracts the UUID and socket count from `/<uuid>?sockets=N`.
fn parse_target(path: &str) -> Result<(ConnectionUuid, usize)> {
    let url = Url::parse("http://localhost/")?.join(path)?;

    let sockets = match url.query_pairs().find(|(key, _)| key == "sockets") {
        Some((_, value)) => value
            .parse::<usize>()
            .ok()
            .filter(|count| (1..=MAX_PARALLEL_SOCKETS).contains(count))
            .ok_or_else(|| Error::handshake(format!("Invalid socket count '{value}'")))?,
        None => 1,
    };

    let segment = url.path().trim_start_matches('/');
    match ConnectionUuid::parse(segment) {
        Some(uuid) => Ok((uuid, sockets)),
        None if sockets == 1 => Ok((ConnectionUuid::generate(), 1)),
        None => Err(Error::handshake(format!(
            "Multi-socket request without connection UUID: '{path}'"
        ))),
    }
}

// ============================================================================
// Accept Tokens
// ============================================================================

/// Computes the RFC6455 `Sec-WebSocket-Accept` value.
#[must_use]
pub fn websocket_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Computes the hixie-76 challenge response.
///
/// Each key's digits form a number that is divided by the key's space count.
///
/// # Errors
///
/// Returns [`Error::Handshake`] if a key has no spaces, no digits, or a
/// number that is not a multiple of its space count.
pub fn hixie76_challenge(key1: &str, key2: &str, key3: &[u8; HIXIE_KEY3_LEN]) -> Result<[u8; 16]> {
    let mut hasher = Md5::new();
    hasher.update(hixie76_key_number(key1)?.to_be_bytes());
    hasher.update(hixie76_key_number(key2)?.to_be_bytes());
    hasher.update(key3);

    let mut challenge = [0u8; 16];
    challenge.copy_from_slice(&hasher.finalize());
    Ok(challenge)
}

fn hixie76_key_number(key: &str) -> Result<u32> {
    let spaces = key.bytes().filter(|&b| b == b' ').count() as u64;
    if spaces == 0 {
        return Err(Error::handshake("hixie-76 key contains no spaces"));
    }

    let digits: String = key.chars().filter(char::is_ascii_digit).collect();
    let number: u64 = digits
        .parse()
        .map_err(|_| Error::handshake("hixie-76 key contains no usable number"))?;

    if number % spaces != 0 {
        return Err(Error::handshake("hixie-76 key is not a multiple of its spaces"));
    }
    u32::try_from(number / spaces).map_err(|_| Error::handshake("hixie-76 key out of range"))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_header_layout() {
        let uuid = ConnectionUuid::generate();
        let bytes = NativeHeader::new(3, uuid).encode().expect("encode");

        assert_eq!(&bytes[..8], b"SSTTCP03");
        assert_eq!(&bytes[8..], uuid.as_bytes());
        assert_eq!(NativeHeader::parse(&bytes).expect("parse"), NativeHeader::new(3, uuid));
    }

    #[test]
    fn test_native_header_rejects() {
        let uuid = ConnectionUuid::generate();
        assert!(NativeHeader::new(0, uuid).encode().is_err());
        assert!(NativeHeader::new(100, uuid).encode().is_err());

        let mut bytes = NativeHeader::new(2, uuid).encode().expect("encode");
        assert!(NativeHeader::parse(&bytes[..20]).is_err());
        bytes[6] = b'x';
        assert!(NativeHeader::parse(&bytes).is_err());
        bytes[0] = b'X';
        assert!(NativeHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_prefix_classification() {
        assert!(is_native(b"SSTTCP01................"));
        assert!(is_http(b"GET /abc HTTP/1.1\r\n"));
        assert!(!is_http(b"POST / HTTP/1.1"));
    }

    #[test]
    fn test_rfc6455_accept_vector() {
        assert_eq!(
            websocket_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_hixie76_challenge_vector() {
        let challenge = hixie76_challenge("4 @1  46546xW%0l 1 5", "12998 5 Y3 1  .P00", b"^n:ds[4U")
            .expect("valid keys");
        assert_eq!(&challenge, b"8jKS'y:G*Co,Wxa-");
    }

    #[test]
    fn test_hixie76_bad_keys() {
        assert!(hixie76_challenge("nospaces123", "1 2", b"12345678").is_err());
        assert!(hixie76_challenge("1 2", "  ", b"12345678").is_err());
        assert!(hixie76_challenge("3 ", "1 2", b"12345678").is_ok());
        assert!(hixie76_challenge("3  ", "1 2", b"12345678").is_err());
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nrest"), Some(27));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
    }

    #[test]
    fn test_parse_rfc6455_request() {
        let uuid = ConnectionUuid::generate();
        let head = format!(
            "GET /{uuid}?sockets=2 HTTP/1.1\r\n\
             Host: example.com:80\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );

        let request = UpgradeRequest::parse(head.as_bytes()).expect("parse");
        assert_eq!(request.uuid, uuid);
        assert_eq!(request.sockets, 2);
        assert_eq!(request.framing_style(), FramingStyle::WebSocket);
        assert!(!request.expects_key3());

        let reply = String::from_utf8(request.response(&[0; 8]).expect("reply")).expect("utf8");
        assert!(reply.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(reply.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(reply.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_hixie76_request() {
        let uuid = ConnectionUuid::generate();
        let head = format!(
            "GET /{} HTTP/1.1\r\n\
             Host: example.com\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\
             Upgrade: WebSocket\r\n\
             Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\n\
             Origin: http://example.com\r\n\r\n",
            uuid.as_uuid().simple()
        );

        let request = UpgradeRequest::parse(head.as_bytes()).expect("parse");
        assert_eq!(request.uuid, uuid);
        assert_eq!(request.sockets, 1);
        assert_eq!(request.framing_style(), FramingStyle::ZeroDelimited);
        assert!(request.expects_key3());

        let reply = request.response(b"^n:ds[4U").expect("reply");
        assert!(reply.ends_with(b"\r\n\r\n8jKS'y:G*Co,Wxa-"));
        let text = String::from_utf8_lossy(&reply);
        assert!(text.contains("Sec-WebSocket-Origin: http://example.com\r\n"));
        assert!(text.contains(&format!(
            "Sec-WebSocket-Location: ws://example.com/{}\r\n",
            uuid.as_uuid().simple()
        )));
    }

    #[test]
    fn test_parse_rejects_old_version() {
        let head = b"GET / HTTP/1.1\r\nSec-WebSocket-Version: 8\r\nSec-WebSocket-Key: x\r\n\r\n";
        assert!(UpgradeRequest::parse(head).is_err());
    }

    #[test]
    fn test_target_without_uuid() {
        let (_, sockets) = parse_target("/").expect("single socket");
        assert_eq!(sockets, 1);
        assert!(parse_target("/?sockets=2").is_err());
        assert!(parse_target("/?sockets=0").is_err());
    }
}
