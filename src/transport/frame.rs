//! WebSocket frame codec (RFC 6455 §5).
//!
//! Encodes client frames and incrementally decodes server frames.
//!
//! # Wire Format
//!
//! ```text
//! byte0: FIN(1) RSV(3) OPCODE(4)
//! byte1: MASK(1) LEN7(7)
//!   LEN7 == 126 -> 16-bit big-endian length follows
//!   LEN7 == 127 -> 64-bit big-endian length follows
//!   MASK == 1   -> 4-byte mask key follows
//! payload (XORed with the mask key when MASK == 1)
//! ```
//!
//! # Reassembly
//!
//! [`FrameCodec::decode`] appends input to an internal buffer and returns at
//! most one frame per call. Incomplete frames stay buffered untouched; only
//! the bytes of a returned frame are consumed, so several frames delivered by
//! one read are drained by calling `decode(&[])` again.

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Largest payload that fits in the 7-bit length field.
const MAX_SHORT_LEN: usize = 125;

/// `LEN7` marker for a 16-bit extended length.
const LEN_16: u8 = 126;

/// `LEN7` marker for a 64-bit extended length.
const LEN_64: u8 = 127;

/// Default upper bound on a single frame payload (64 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Normal closure status code.
pub const CLOSE_NORMAL: u16 = 1000;

/// Protocol error status code.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

// ============================================================================
// OpCode
// ============================================================================

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// UTF-8 text data.
    Text = 0x1,
    /// Binary data.
    Binary = 0x2,
    /// Connection close.
    Close = 0x8,
    /// Ping.
    Ping = 0x9,
    /// Pong.
    Pong = 0xA,
}

impl OpCode {
    /// Parses a 4-bit opcode, returning `None` for reserved values.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Returns the wire value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns `true` for close, ping and pong.
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        is_control(self as u8)
    }
}

/// Returns `true` if the raw opcode denotes a control frame (0x8, 0x9, 0xA).
#[inline]
#[must_use]
pub const fn is_control(opcode: u8) -> bool {
    matches!(opcode, 0x8..=0xA)
}

// ============================================================================
// Frame
// ============================================================================

/// A single complete WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message.
    pub fin: bool,
    /// Frame type.
    pub opcode: OpCode,
    /// Unmasked payload.
    pub payload: Vec<u8>,
    /// Whether the frame arrived masked.
    pub masked: bool,
}

impl Frame {
    /// Creates a final, unmasked frame.
    #[must_use]
    pub fn new(opcode: OpCode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
            masked: false,
        }
    }

    /// Creates a text frame.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, text.into().into_bytes())
    }

    /// Creates a close frame carrying a status code and reason.
    #[must_use]
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload)
    }

    /// Returns the status code of a close frame, if present.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match (self.opcode, self.payload.as_slice()) {
            (OpCode::Close, [hi, lo, ..]) => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    /// Encodes this frame for sending from the client side (always masked).
    #[must_use]
    pub fn to_client_bytes(&self) -> Vec<u8> {
        FrameCodec::encode(&self.payload, self.opcode, self.fin, true)
    }
}

// ============================================================================
// FrameCodec
// ============================================================================

/// Stateless encoder plus buffering decoder.
#[derive(Debug)]
pub struct FrameCodec {
    /// Bytes received but not yet consumed by a complete frame.
    buffer: Vec<u8>,
    /// Largest accepted payload.
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Creates a codec with an empty buffer and the default payload limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Creates a codec that rejects payloads larger than `max_payload`.
    #[must_use]
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_payload,
        }
    }

    /// Number of buffered bytes not yet consumed.
    #[inline]
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Appends bytes to the buffer without decoding.
    ///
    /// Used for bytes that arrived together with the handshake response.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Encodes one frame.
    ///
    /// When `mask` is set a fresh random 4-byte key is used. Client frames
    /// must always be masked.
    #[must_use]
    pub fn encode(payload: &[u8], opcode: OpCode, fin: bool, mask: bool) -> Vec<u8> {
        let key = mask.then(rand::random::<[u8; 4]>);
        Self::encode_with_key(payload, opcode, fin, key)
    }

    /// Encodes one frame with an explicit mask key (or unmasked with `None`).
    #[must_use]
    pub fn encode_with_key(
        payload: &[u8],
        opcode: OpCode,
        fin: bool,
        key: Option<[u8; 4]>,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 14);

        out.push((u8::from(fin) << 7) | opcode.as_u8());

        let mask_bit = if key.is_some() { 0x80 } else { 0x00 };
        let len = payload.len();
        if len <= MAX_SHORT_LEN {
            out.push(mask_bit | len as u8);
        } else if let Ok(len16) = u16::try_from(len) {
            out.push(mask_bit | LEN_16);
            out.extend_from_slice(&len16.to_be_bytes());
        } else {
            out.push(mask_bit | LEN_64);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match key {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.extend_from_slice(payload),
        }

        out
    }

    /// Appends `input` to the buffer and tries to parse one frame.
    ///
    /// Returns `Ok(None)` while the buffered bytes do not yet hold a complete
    /// frame. Pass an empty slice to drain frames already buffered.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] for reserved bits, unknown opcodes, invalid
    /// control frames or payloads above the configured limit.
    pub fn decode(&mut self, input: &[u8]) -> Result<Option<Frame>> {
        self.buffer.extend_from_slice(input);

        let Some(header) = self.parse_header()? else {
            return Ok(None);
        };

        let total = header.header_len + header.payload_len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let mut payload: Vec<u8> = self.buffer[header.header_len..total].to_vec();
        self.buffer.drain(..total);

        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin: header.fin,
            opcode: header.opcode,
            payload,
            masked: header.mask.is_some(),
        }))
    }

    /// Parses the header at the front of the buffer without consuming it.
    fn parse_header(&self) -> Result<Option<Header>> {
        let buf = &self.buffer;
        if buf.len() < 2 {
            return Ok(None);
        }

        let fin = buf[0] & 0x80 != 0;
        if buf[0] & 0x70 != 0 {
            return Err(Error::protocol(format!(
                "reserved bits set in frame header: {:#04x}",
                buf[0]
            )));
        }

        let raw_opcode = buf[0] & 0x0F;
        let opcode = OpCode::from_u8(raw_opcode)
            .ok_or_else(|| Error::protocol(format!("unknown opcode {raw_opcode:#x}")))?;

        let masked = buf[1] & 0x80 != 0;
        let len7 = buf[1] & 0x7F;

        let (payload_len, mut offset) = match len7 {
            LEN_16 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (usize::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
            }
            LEN_64 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(Error::protocol("64-bit frame length has MSB set"));
                }
                let len = usize::try_from(len)
                    .map_err(|_| Error::protocol(format!("frame length {len} exceeds address space")))?;
                (len, 10)
            }
            short => (usize::from(short), 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(Error::protocol(format!("fragmented control frame {opcode:?}")));
            }
            if payload_len > MAX_SHORT_LEN {
                return Err(Error::protocol(format!(
                    "control frame {opcode:?} payload of {payload_len} bytes exceeds 125"
                )));
            }
        }

        if payload_len > self.max_payload {
            return Err(Error::protocol(format!(
                "frame payload of {payload_len} bytes exceeds limit of {}",
                self.max_payload
            )));
        }

        let mask = if masked {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some(Header {
            fin,
            opcode,
            mask,
            payload_len,
            header_len: offset,
        }))
    }
}

/// Parsed frame header.
struct Header {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
    header_len: usize,
}

/// XORs `data` with `key`, cycling every 4 bytes. Applying twice restores the input.
#[inline]
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

// ============================================================================
// Tests
// ============================================================================
