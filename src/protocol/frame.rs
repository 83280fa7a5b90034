//! Frame encoding and decoding for the three wire styles.
//!
//! Every connection speaks exactly one [`FramingStyle`], fixed by the
//! handshake that produced it. The byte stream is never sniffed.
//!
//! | Style | Layout |
//! |-------|--------|
//! | `Native` | `{varint len}{varint stream}{payload}` |
//! | `WebSocket` | RFC6455 header, body `{varint stream}{payload}` |
//! | `ZeroDelimited` | `0x00 {hex stream} '%' {base64 payload} 0xFF` |
//!
//! Decoding is split in two steps so that the receive path can switch to
//! reading a large body straight into its own buffer: [`FrameDecoder::decode`]
//! reports either a complete frame or a [`FrameHeader`] whose body has not
//! fully arrived, and [`FrameDecoder::finish`] turns an assembled body into a
//! [`Frame`].

// ============================================================================
// Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{Error, Result};
use crate::identifiers::StreamId;
use crate::protocol::varint::{
    MAX_VARINT, MAX_VARINT_LEN, decode_len, decode_stream_id, encode_len, encode_stream_id,
    varint_size,
};

// ============================================================================
// Constants
// ============================================================================

/// Longest frame header any style produces, stream ID included.
pub const MAX_FRAME_HEADER_LEN: usize = 14 + MAX_VARINT_LEN;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD_LEN: usize = MAX_VARINT as usize - MAX_VARINT_LEN;

/// Largest zero-delimited frame buffered while searching for its terminator.
pub const MAX_DELIMITED_FRAME_LEN: usize = 2 * MAX_VARINT as usize;

/// WebSocket opcodes.
pub mod opcode {
    /// Continuation of a fragmented message.
    pub const CONTINUATION: u8 = 0x0;
    /// Text message.
    pub const TEXT: u8 = 0x1;
    /// Binary message.
    pub const BINARY: u8 = 0x2;
    /// Connection close.
    pub const CLOSE: u8 = 0x8;
    /// Ping.
    pub const PING: u8 = 0x9;
    /// Pong.
    pub const PONG: u8 = 0xA;
}

const FIN: u8 = 0x80;
const RSV_MASK: u8 = 0x70;
const MASKED: u8 = 0x80;
const MAX_CONTROL_PAYLOAD: usize = 125;

const DELIMITED_START: u8 = 0x00;
const DELIMITED_END: u8 = 0xFF;
const DELIMITED_SEPARATOR: u8 = b'%';

// ============================================================================
// FramingStyle
// ============================================================================

/// Wire framing used by one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramingStyle {
    /// Varint length-prefixed frames after the native header.
    Native,
    /// RFC6455 binary frames.
    WebSocket,
    /// Legacy hixie-76 sentinel-delimited text frames.
    ZeroDelimited,
}

// ============================================================================
// MaskState
// ============================================================================

/// Rolling XOR mask of one WebSocket frame.
///
/// The offset survives between calls so a body unmasked in several pieces
/// yields the same bytes as one that is unmasked whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskState {
    key: [u8; 4],
    offset: usize,
}

impl MaskState {
    /// Creates a mask positioned at the start of a frame body.
    #[inline]
    #[must_use]
    pub const fn new(key: [u8; 4]) -> Self {
        Self { key, offset: 0 }
    }

    /// XORs `data` in place and advances the rotation.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            *byte ^= self.key[self.offset & 3];
            self.offset += 1;
        }
    }
}

// ============================================================================
// Frame Types
// ============================================================================

/// What a frame body carries once assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `{varint stream}{payload}`.
    Data,
    /// WebSocket ping.
    Ping,
    /// WebSocket pong.
    Pong,
    /// WebSocket or legacy close.
    Close,
    /// Frame with no meaning to the transport.
    Skip,
}

/// Parsed header of a frame whose body length is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Bytes occupied by the header.
    pub header_len: usize,
    /// Bytes occupied by the body.
    pub body_len: usize,
    /// Body interpretation.
    pub kind: FrameKind,
    /// Mask to apply to the body, if the sender masked it.
    pub mask: Option<MaskState>,
}

impl FrameHeader {
    /// Total frame size on the wire.
    #[inline]
    #[must_use]
    pub const fn total_len(&self) -> usize {
        self.header_len + self.body_len
    }
}

/// A fully decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Stream payload.
    Data {
        /// Destination stream.
        stream_id: StreamId,
        /// Payload bytes.
        payload: Vec<u8>,
    },
    /// Ping with its application data.
    Ping(Vec<u8>),
    /// Pong.
    Pong,
    /// Peer closed this socket.
    Close,
    /// Frame consumed without effect.
    Skipped,
}

/// Outcome of one [`FrameDecoder::decode`] call.
#[derive(Debug)]
pub enum Decoded {
    /// The header itself is incomplete.
    NeedMore,
    /// The header is complete but the body is not.
    Partial(FrameHeader),
    /// A complete frame.
    Frame {
        /// The frame.
        frame: Frame,
        /// Bytes consumed from the buffer.
        consumed: usize,
    },
    /// A complete frame whose body could not be parsed.
    Corrupt {
        /// Why the body was rejected.
        error: Error,
        /// Bytes to skip.
        consumed: usize,
    },
}

// ============================================================================
// FrameDecoder
// ============================================================================

/// Per-socket frame decoder.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    style: FramingStyle,
}

impl FrameDecoder {
    /// Creates a decoder for `style`.
    #[inline]
    #[must_use]
    pub const fn new(style: FramingStyle) -> Self {
        Self { style }
    }

    /// Returns the framing style.
    #[inline]
    #[must_use]
    pub const fn style(&self) -> FramingStyle {
        self.style
    }

    /// Decodes the next frame at the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if a frame header is malformed. The
    /// stream cannot be resynchronised after such an error.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Decoded> {
        if self.style == FramingStyle::ZeroDelimited {
            return self.decode_delimited(buf);
        }

        let Some(header) = self.decode_header(buf)? else {
            return Ok(Decoded::NeedMore);
        };

        if buf.len() < header.total_len() {
            return Ok(Decoded::Partial(header));
        }

        let mut body = buf[header.header_len..header.total_len()].to_vec();
        if let Some(mut mask) = header.mask {
            mask.apply(&mut body);
        }

        Ok(match self.finish(header.kind, body) {
            Ok(frame) => Decoded::Frame {
                frame,
                consumed: header.total_len(),
            },
            Err(error) => Decoded::Corrupt {
                error,
                consumed: header.total_len(),
            },
        })
    }

    /// Parses a length-delimited frame header.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on malformed headers.
    pub fn decode_header(&self, buf: &[u8]) -> Result<Option<FrameHeader>> {
        match self.style {
            FramingStyle::Native => Ok(decode_len(buf)?.map(|(body_len, header_len)| {
                FrameHeader {
                    header_len,
                    body_len,
                    kind: FrameKind::Data,
                    mask: None,
                }
            })),
            FramingStyle::WebSocket => decode_websocket_header(buf),
            FramingStyle::ZeroDelimited => decode_delimited_header(buf),
        }
    }

    /// Interprets an assembled and unmasked frame body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if a data body lacks a valid stream ID.
    pub fn finish(&self, kind: FrameKind, mut body: Vec<u8>) -> Result<Frame> {
        match kind {
            FrameKind::Data => {
                let (stream_id, used) = decode_stream_id(&body)?
                    .ok_or_else(|| Error::protocol("Frame too short for stream ID"))?;
                body.drain(..used);
                Ok(Frame::Data {
                    stream_id,
                    payload: body,
                })
            }
            FrameKind::Ping => Ok(Frame::Ping(body)),
            FrameKind::Pong => Ok(Frame::Pong),
            FrameKind::Close => Ok(Frame::Close),
            FrameKind::Skip => Ok(Frame::Skipped),
        }
    }

    fn decode_delimited(&mut self, buf: &[u8]) -> Result<Decoded> {
        let Some(&kind) = buf.first() else {
            return Ok(Decoded::NeedMore);
        };

        if kind & 0x80 != 0 {
            let Some(header) = decode_delimited_header(buf)? else {
                return Ok(Decoded::NeedMore);
            };
            if buf.len() < header.total_len() {
                return Ok(Decoded::Partial(header));
            }
            let frame = if header.kind == FrameKind::Close {
                Frame::Close
            } else {
                Frame::Skipped
            };
            return Ok(Decoded::Frame {
                frame,
                consumed: header.total_len(),
            });
        }

        let Some(end) = buf[1..].iter().position(|&b| b == DELIMITED_END) else {
            if buf.len() > MAX_DELIMITED_FRAME_LEN {
                return Err(Error::protocol("Unterminated zero-delimited frame"));
            }
            return Ok(Decoded::NeedMore);
        };
        let consumed = end + 2;

        if kind != DELIMITED_START {
            return Ok(Decoded::Frame {
                frame: Frame::Skipped,
                consumed,
            });
        }

        Ok(match parse_delimited_body(&buf[1..=end]) {
            Ok((stream_id, payload)) => Decoded::Frame {
                frame: Frame::Data { stream_id, payload },
                consumed,
            },
            Err(error) => Decoded::Corrupt { error, consumed },
        })
    }
}

// ============================================================================
// Header Parsing
// ============================================================================

fn decode_websocket_header(buf: &[u8]) -> Result<Option<FrameHeader>> {
    let [first, second, ..] = *buf else {
        return Ok(None);
    };

    if first & RSV_MASK != 0 {
        return Err(Error::protocol("WebSocket frame uses reserved bits"));
    }

    let code = first & 0x0F;
    let masked = second & MASKED != 0;
    let short_len = second & 0x7F;

    let (body_len, mut header_len) = match short_len {
        126 => {
            let Some(bytes) = buf.get(2..4) else {
                return Ok(None);
            };
            (usize::from(u16::from_be_bytes([bytes[0], bytes[1]])), 4)
        }
        127 => {
            let Some(bytes) = buf.get(2..10) else {
                return Ok(None);
            };
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            let len = u64::from_be_bytes(raw);
            if len > (MAX_VARINT as u64) + MAX_VARINT_LEN as u64 {
                return Err(Error::protocol(format!("WebSocket frame of {len} bytes")));
            }
            (len as usize, 10)
        }
        len => (usize::from(len), 2),
    };

    let mask = if masked {
        let Some(bytes) = buf.get(header_len..header_len + 4) else {
            return Ok(None);
        };
        header_len += 4;
        Some(MaskState::new([bytes[0], bytes[1], bytes[2], bytes[3]]))
    } else {
        None
    };

    let kind = match code {
        opcode::CONTINUATION | opcode::TEXT | opcode::BINARY => FrameKind::Data,
        opcode::CLOSE => FrameKind::Close,
        opcode::PING => FrameKind::Ping,
        opcode::PONG => FrameKind::Pong,
        _ => FrameKind::Skip,
    };

    if code >= opcode::CLOSE && body_len > MAX_CONTROL_PAYLOAD {
        return Err(Error::protocol("WebSocket control frame too long"));
    }

    Ok(Some(FrameHeader {
        header_len,
        body_len,
        kind,
        mask,
    }))
}

/// Parses a legacy `{type >= 0x80}{big-endian base-128 length}` header.
fn decode_delimited_header(buf: &[u8]) -> Result<Option<FrameHeader>> {
    let Some(&kind) = buf.first() else {
        return Ok(None);
    };
    if kind & 0x80 == 0 {
        return Err(Error::protocol("Sentinel frame has no length header"));
    }

    let mut body_len: usize = 0;
    for (index, &byte) in buf.iter().enumerate().skip(1) {
        if index > MAX_VARINT_LEN {
            return Err(Error::protocol("Legacy frame length too long"));
        }
        body_len = (body_len << 7) | usize::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            let frame_kind = if kind == 0xFF && body_len == 0 {
                FrameKind::Close
            } else {
                FrameKind::Skip
            };
            return Ok(Some(FrameHeader {
                header_len: index + 1,
                body_len,
                kind: frame_kind,
                mask: None,
            }));
        }
    }
    Ok(None)
}

fn parse_delimited_body(text: &[u8]) -> Result<(StreamId, Vec<u8>)> {
    let split = text
        .iter()
        .position(|&b| b == DELIMITED_SEPARATOR)
        .ok_or_else(|| Error::protocol("Zero-delimited frame lacks stream separator"))?;

    let hex = std::str::from_utf8(&text[..split])
        .map_err(|_| Error::protocol("Zero-delimited stream ID is not ASCII"))?;
    let raw = u32::from_str_radix(hex, 16)
        .map_err(|_| Error::protocol(format!("Invalid zero-delimited stream ID '{hex}'")))?;
    if raw > StreamId::MAX {
        return Err(Error::protocol(format!("Stream ID {raw} out of range")));
    }

    let payload = BASE64
        .decode(&text[split + 1..])
        .map_err(|e| Error::protocol(format!("Invalid base64 payload: {e}")))?;

    Ok((StreamId::new(raw), payload))
}

// ============================================================================
// Encoding
// ============================================================================

/// Appends a data frame for `stream_id` to `out`.
///
/// WebSocket frames are written unmasked, as a server does.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the payload exceeds [`MAX_PAYLOAD_LEN`] or
/// the stream ID is out of range.
pub fn encode_frame(
    style: FramingStyle,
    stream_id: StreamId,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::protocol(format!(
            "Payload of {} bytes exceeds {MAX_PAYLOAD_LEN}",
            payload.len()
        )));
    }
    if stream_id.as_u32() > StreamId::MAX {
        return Err(Error::protocol(format!("Stream ID {stream_id} out of range")));
    }

    let body_len = varint_size(stream_id.as_u32()) + payload.len();

    match style {
        FramingStyle::Native => {
            out.reserve(MAX_VARINT_LEN + body_len);
            encode_len(body_len, out)?;
            encode_stream_id(stream_id, out)?;
            out.extend_from_slice(payload);
        }
        FramingStyle::WebSocket => {
            out.reserve(14 + body_len);
            encode_websocket_header(opcode::BINARY, body_len, None, out);
            encode_stream_id(stream_id, out)?;
            out.extend_from_slice(payload);
        }
        FramingStyle::ZeroDelimited => {
            out.reserve(12 + payload.len().div_ceil(3) * 4);
            out.push(DELIMITED_START);
            out.extend_from_slice(format!("{:x}", stream_id.as_u32()).as_bytes());
            out.push(DELIMITED_SEPARATOR);
            out.extend_from_slice(BASE64.encode(payload).as_bytes());
            out.push(DELIMITED_END);
        }
    }
    Ok(())
}

/// Appends a complete WebSocket frame to `out`, masking it when `mask` is set.
pub fn encode_websocket_frame(code: u8, payload: &[u8], mask: Option<[u8; 4]>, out: &mut Vec<u8>) {
    encode_websocket_header(code, payload.len(), mask, out);
    let start = out.len();
    out.extend_from_slice(payload);
    if let Some(key) = mask {
        MaskState::new(key).apply(&mut out[start..]);
    }
}

/// Appends the legacy closing frame.
#[inline]
pub fn encode_delimited_close(out: &mut Vec<u8>) {
    out.extend_from_slice(&[0xFF, 0x00]);
}

fn encode_websocket_header(code: u8, len: usize, mask: Option<[u8; 4]>, out: &mut Vec<u8>) {
    out.push(FIN | code);
    let mask_bit = if mask.is_some() { MASKED } else { 0 };

    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        out.push(mask_bit | 126);
        out.extend_from_slice(&short.to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    if let Some(key) = mask {
        out.extend_from_slice(&key);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder, mut buf: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        while !buf.is_empty() {
            match decoder.decode(buf).expect("valid header") {
                Decoded::Frame { frame, consumed } => {
                    frames.push(frame);
                    buf = &buf[consumed..];
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        frames
    }

    #[test]
    fn test_native_roundtrip() {
        let mut wire = Vec::new();
        encode_frame(FramingStyle::Native, StreamId::new(3), b"hello", &mut wire).expect("encode");
        encode_frame(FramingStyle::Native, StreamId::new(300), b"", &mut wire).expect("encode");

        assert_eq!(&wire[..3], &[6, 3, b'h']);

        let mut decoder = FrameDecoder::new(FramingStyle::Native);
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(
            frames,
            vec![
                Frame::Data {
                    stream_id: StreamId::new(3),
                    payload: b"hello".to_vec()
                },
                Frame::Data {
                    stream_id: StreamId::new(300),
                    payload: Vec::new()
                },
            ]
        );
    }

    #[test]
    fn test_native_truncation() {
        let mut wire = Vec::new();
        encode_frame(FramingStyle::Native, StreamId::new(1), &[7u8; 200], &mut wire)
            .expect("encode");
        let mut decoder = FrameDecoder::new(FramingStyle::Native);

        assert!(matches!(decoder.decode(&wire[..1]).expect("ok"), Decoded::NeedMore));
        match decoder.decode(&wire[..10]).expect("ok") {
            Decoded::Partial(header) => {
                assert_eq!(header.header_len, 2);
                assert_eq!(header.body_len, 201);
                assert_eq!(header.total_len(), wire.len());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_native_empty_body_is_corrupt() {
        let mut decoder = FrameDecoder::new(FramingStyle::Native);
        match decoder.decode(&[0x00, 0x05]).expect("ok") {
            Decoded::Corrupt { error, consumed } => {
                assert!(error.is_protocol_error());
                assert_eq!(consumed, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_websocket_rfc_masked_sample() {
        // RFC6455 5.7: masked "Hello"; 'H' doubles as stream 72.
        let wire = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let mut decoder = FrameDecoder::new(FramingStyle::WebSocket);
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(
            frames,
            vec![Frame::Data {
                stream_id: StreamId::new(72),
                payload: b"ello".to_vec()
            }]
        );
    }

    #[test]
    fn test_websocket_server_frame_roundtrip() {
        let payload = vec![0xA5u8; 70_000];
        let mut wire = Vec::new();
        encode_frame(FramingStyle::WebSocket, StreamId::new(5), &payload, &mut wire)
            .expect("encode");
        assert_eq!(wire[0], 0x82);
        assert_eq!(wire[1], 127);

        let mut decoder = FrameDecoder::new(FramingStyle::WebSocket);
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(
            frames,
            vec![Frame::Data {
                stream_id: StreamId::new(5),
                payload
            }]
        );
    }

    #[test]
    fn test_websocket_medium_length() {
        let mut wire = Vec::new();
        encode_websocket_frame(opcode::BINARY, &[1u8; 300], Some([1, 2, 3, 4]), &mut wire);
        assert_eq!(wire[1], 0x80 | 126);
        assert_eq!(u16::from_be_bytes([wire[2], wire[3]]), 300);

        let decoder = FrameDecoder::new(FramingStyle::WebSocket);
        let header = decoder.decode_header(&wire).expect("ok").expect("complete");
        assert_eq!(header.header_len, 8);
        assert_eq!(header.body_len, 300);
    }

    #[test]
    fn test_mask_rotation_across_splits() {
        let key = [0x11, 0x22, 0x33, 0x44];
        let original: Vec<u8> = (0..=250).collect();

        let mut whole = original.clone();
        MaskState::new(key).apply(&mut whole);

        let mut pieces = original.clone();
        let mut mask = MaskState::new(key);
        let (a, rest) = pieces.split_at_mut(3);
        let (b, c) = rest.split_at_mut(101);
        mask.apply(a);
        mask.apply(b);
        mask.apply(c);

        assert_eq!(pieces, whole);
        MaskState::new(key).apply(&mut pieces);
        assert_eq!(pieces, original);
    }

    #[test]
    fn test_websocket_control_frames() {
        let mut wire = Vec::new();
        encode_websocket_frame(opcode::PING, b"hi", Some([9, 9, 9, 9]), &mut wire);
        encode_websocket_frame(opcode::PONG, b"", None, &mut wire);
        encode_websocket_frame(opcode::CLOSE, &[0x03, 0xE8], None, &mut wire);
        encode_websocket_frame(0x3, b"??", None, &mut wire);

        let mut decoder = FrameDecoder::new(FramingStyle::WebSocket);
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(
            frames,
            vec![
                Frame::Ping(b"hi".to_vec()),
                Frame::Pong,
                Frame::Close,
                Frame::Skipped
            ]
        );
    }

    #[test]
    fn test_websocket_reserved_bits_rejected() {
        let decoder = FrameDecoder::new(FramingStyle::WebSocket);
        assert!(decoder.decode_header(&[0xC2, 0x00]).is_err());
    }

    #[test]
    fn test_zero_delimited_roundtrip() {
        let mut wire = Vec::new();
        encode_frame(FramingStyle::ZeroDelimited, StreamId::new(26), b"\x00\xFFbin", &mut wire)
            .expect("encode");
        assert_eq!(wire[0], 0x00);
        assert_eq!(&wire[1..4], b"1a%");
        assert_eq!(*wire.last().expect("non-empty"), 0xFF);

        let mut decoder = FrameDecoder::new(FramingStyle::ZeroDelimited);
        assert!(matches!(
            decoder.decode(&wire[..wire.len() - 1]).expect("ok"),
            Decoded::NeedMore
        ));
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(
            frames,
            vec![Frame::Data {
                stream_id: StreamId::new(26),
                payload: b"\x00\xFFbin".to_vec()
            }]
        );
    }

    #[test]
    fn test_zero_delimited_corrupt_body() {
        let mut decoder = FrameDecoder::new(FramingStyle::ZeroDelimited);
        match decoder.decode(b"\x00zz%AAAA\xFF").expect("ok") {
            Decoded::Corrupt { consumed, .. } => assert_eq!(consumed, 9),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_zero_delimited_length_frames() {
        let mut wire = vec![0x80, 0x81, 0x00];
        wire.extend_from_slice(&[0u8; 128]);
        encode_delimited_close(&mut wire);

        let mut decoder = FrameDecoder::new(FramingStyle::ZeroDelimited);
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(frames, vec![Frame::Skipped, Frame::Close]);
    }
}
