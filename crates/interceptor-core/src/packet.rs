//! Length-prefixed frames and the positional buffer handlers work against.
//!
//! Wire layout (network order):
//!
//! ```text
//! u32 total_length | u16 header | payload[total_length - 2]
//! ```

use std::fmt;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::catalog::MessageInfo;
use crate::fields::{FieldError, FieldKind};

/// Bytes preceding the payload on the wire: `u32` total length + `u16` header.
pub const FRAME_PREFIX_LEN: usize = 6;

/// Largest payload accepted before a length prefix is treated as a desync.
pub const MAX_PAYLOAD_LENGTH: usize = 100_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The length prefix cannot belong to a real frame; the stream is misaligned.
    #[error("frame desync at offset {offset}: payload length {declared} outside 0..={max}")]
    Desync {
        offset: usize,
        declared: i64,
        max: usize,
    },
}

/// Result of [`Packet::parse`] over a buffer of zero or more frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFrames {
    pub packets: Vec<Packet>,
    /// Offset of the first byte that was not part of a whole frame.
    pub consumed: usize,
    /// A partial header or body remained after the last whole frame.
    pub incomplete: bool,
}

/// Fixed-size big-endian value readable from / writable to a packet payload.
pub trait WireValue: Sized {
    const SIZE: usize;

    /// `bytes.len() == Self::SIZE`.
    fn decode(bytes: &[u8]) -> Self;

    /// `out.len() == Self::SIZE`.
    fn encode(&self, out: &mut [u8]);
}

impl WireValue for u8 {
    const SIZE: usize = 1;
    fn decode(bytes: &[u8]) -> Self {
        bytes[0]
    }
    fn encode(&self, out: &mut [u8]) {
        out[0] = *self;
    }
}

impl WireValue for i8 {
    const SIZE: usize = 1;
    fn decode(bytes: &[u8]) -> Self {
        bytes[0] as i8
    }
    fn encode(&self, out: &mut [u8]) {
        out[0] = *self as u8;
    }
}

impl WireValue for bool {
    const SIZE: usize = 1;
    fn decode(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
    fn encode(&self, out: &mut [u8]) {
        out[0] = u8::from(*self);
    }
}

macro_rules! wire_value_be {
    ($($ty:ty => $read:ident, $write:ident;)*) => {
        $(
            impl WireValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();
                fn decode(bytes: &[u8]) -> Self {
                    BigEndian::$read(bytes)
                }
                fn encode(&self, out: &mut [u8]) {
                    BigEndian::$write(out, *self)
                }
            }
        )*
    };
}

wire_value_be! {
    i16 => read_i16, write_i16;
    u16 => read_u16, write_u16;
    i32 => read_i32, write_i32;
    u32 => read_u32, write_u32;
    i64 => read_i64, write_i64;
    u64 => read_u64, write_u64;
    f64 => read_f64, write_f64;
}

/// One protocol message: header, payload and a read/write cursor.
///
/// Explicit-position accessors (`*_at`) never move the cursor; the cursor-based
/// ones advance it by the number of bytes consumed or produced. Reads that would
/// run past the end return `None`; writes past the end grow the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    header: u16,
    length: i32,
    payload: Vec<u8>,
    position: usize,
    blocked: bool,
    identity_hash: Option<Arc<str>>,
    field_layout: Option<Arc<[FieldKind]>>,
}

impl Packet {
    pub fn new(header: u16) -> Self {
        Self::with_payload(header, Vec::new())
    }

    pub fn with_payload(header: u16, payload: Vec<u8>) -> Self {
        Self {
            header,
            length: len_i32(payload.len()),
            payload,
            position: 0,
            blocked: false,
            identity_hash: None,
            field_layout: None,
        }
    }

    /// Builds a packet from a frame body read off a socket (`header + payload`)
    /// whose prefix declared `total_length`. A body that does not match the
    /// declared size yields a packet that reports `is_valid() == false`.
    pub fn from_frame_body(total_length: i32, body: &[u8]) -> Self {
        if body.len() < 2 {
            let mut packet = Self::new(0);
            packet.length = -1;
            return packet;
        }

        let mut packet = Self::with_payload(BigEndian::read_u16(&body[..2]), body[2..].to_vec());
        packet.length = total_length.saturating_sub(2);
        packet
    }

    /// Parses every whole frame in `buf`, stopping quietly at a partial tail.
    pub fn parse(buf: &[u8]) -> Result<ParsedFrames, FrameError> {
        Self::parse_with_limit(buf, MAX_PAYLOAD_LENGTH)
    }

    /// Like [`Packet::parse`], with an explicit payload length bound. Any length
    /// prefix outside `0..=max_payload` fails the whole call.
    pub fn parse_with_limit(buf: &[u8], max_payload: usize) -> Result<ParsedFrames, FrameError> {
        let mut parsed = ParsedFrames::default();
        let mut offset = 0usize;

        loop {
            let rest = &buf[offset..];
            if rest.len() < FRAME_PREFIX_LEN {
                parsed.incomplete = !rest.is_empty();
                break;
            }

            let declared = i64::from(BigEndian::read_i32(&rest[..4])) - 2;
            let length = match usize::try_from(declared) {
                Ok(length) if length <= max_payload => length,
                _ => {
                    return Err(FrameError::Desync {
                        offset,
                        declared,
                        max: max_payload,
                    });
                }
            };

            let frame_len = FRAME_PREFIX_LEN + length;
            if rest.len() < frame_len {
                parsed.incomplete = true;
                break;
            }

            let header = BigEndian::read_u16(&rest[4..6]);
            parsed
                .packets
                .push(Packet::with_payload(header, rest[FRAME_PREFIX_LEN..frame_len].to_vec()));
            offset += frame_len;
        }

        parsed.consumed = offset;
        Ok(parsed)
    }

    pub fn to_frame(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + self.payload.len());
        self.write_frame_to(&mut out);
        out
    }

    pub fn write_frame_to(&self, out: &mut Vec<u8>) {
        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        BigEndian::write_u32(&mut prefix[..4], (self.payload.len() + 2) as u32);
        BigEndian::write_u16(&mut prefix[4..], self.header);
        out.extend_from_slice(&prefix);
        out.extend_from_slice(&self.payload);
    }

    pub fn header(&self) -> u16 {
        self.header
    }

    pub fn set_header(&mut self, header: u16) {
        self.header = header;
    }

    /// Payload length as tracked alongside the buffer (excludes the frame prefix).
    pub fn length(&self) -> i32 {
        self.length
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_valid(&self) -> bool {
        usize::try_from(self.length).is_ok_and(|length| length == self.payload.len())
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Suppresses forwarding of this packet once handlers return.
    pub fn block(&mut self) {
        self.blocked = true;
    }

    pub fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }

    pub fn identity_hash(&self) -> Option<&str> {
        self.identity_hash.as_deref()
    }

    pub fn field_layout(&self) -> Option<&[FieldKind]> {
        self.field_layout.as_deref()
    }

    /// Attaches the catalog's identity hash and field layout.
    pub fn tag(&mut self, info: &MessageInfo) {
        self.identity_hash = Some(info.hash.clone());
        self.field_layout = info.layout.clone();
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position.min(self.payload.len());
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.position
    }

    pub fn read<T: WireValue>(&mut self) -> Option<T> {
        let value = self.read_at(self.position)?;
        self.position += T::SIZE;
        Some(value)
    }

    pub fn read_at<T: WireValue>(&self, pos: usize) -> Option<T> {
        self.slice_at(pos, T::SIZE).map(T::decode)
    }

    pub fn write<T: WireValue>(&mut self, value: T) {
        let pos = self.position;
        self.write_at(pos, value);
        self.position = pos.min(self.payload.len()) + T::SIZE;
    }

    pub fn write_at<T: WireValue>(&mut self, pos: usize, value: T) {
        let mut buf = vec![0u8; T::SIZE];
        value.encode(&mut buf);
        self.write_bytes_at(pos, &buf);
    }

    /// Inserts `value` at `pos`, shifting the following bytes right.
    pub fn insert_at<T: WireValue>(&mut self, pos: usize, value: T) {
        let mut buf = vec![0u8; T::SIZE];
        value.encode(&mut buf);
        self.insert_bytes_at(pos, &buf);
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<Vec<u8>> {
        let bytes = self.read_bytes_at(self.position, len)?;
        self.position += len;
        Some(bytes)
    }

    pub fn read_bytes_at(&self, pos: usize, len: usize) -> Option<Vec<u8>> {
        self.slice_at(pos, len).map(<[u8]>::to_vec)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let pos = self.position;
        self.write_bytes_at(pos, bytes);
        self.position = pos.min(self.payload.len()) + bytes.len();
    }

    /// Overwrites from `pos`, growing the payload when the write runs past the end.
    pub fn write_bytes_at(&mut self, pos: usize, bytes: &[u8]) {
        let before = self.payload.len();
        let start = pos.min(before);
        let end = start + bytes.len();
        if end > before {
            self.payload.resize(end, 0);
        }
        self.payload[start..end].copy_from_slice(bytes);
        self.adjust_length(before);
    }

    pub fn insert_bytes_at(&mut self, pos: usize, bytes: &[u8]) {
        let before = self.payload.len();
        let start = pos.min(before);
        self.payload.splice(start..start, bytes.iter().copied());
        self.adjust_length(before);
    }

    /// Removes up to `len` bytes at `pos`, shifting the tail left.
    pub fn remove_at(&mut self, pos: usize, len: usize) -> Vec<u8> {
        let before = self.payload.len();
        let start = pos.min(before);
        let end = start.saturating_add(len).min(before);
        let removed = self.payload.drain(start..end).collect();
        self.adjust_length(before);
        self.position = self.position.min(self.payload.len());
        removed
    }

    pub fn read_string(&mut self) -> Option<String> {
        let (value, consumed) = self.string_at(self.position)?;
        self.position += consumed;
        Some(value)
    }

    pub fn read_string_at(&self, pos: usize) -> Option<String> {
        self.string_at(pos).map(|(value, _)| value)
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), FieldError> {
        let encoded = encode_string(value)?;
        self.write_bytes(&encoded);
        Ok(())
    }

    pub fn write_string_at(&mut self, pos: usize, value: &str) -> Result<(), FieldError> {
        let encoded = encode_string(value)?;
        self.write_bytes_at(pos, &encoded);
        Ok(())
    }

    /// Replaces the string at the cursor and advances past the new value.
    pub fn replace_string(&mut self, value: &str) -> Result<bool, FieldError> {
        let pos = self.position;
        let replaced = self.replace_string_at(pos, value)?;
        if replaced {
            self.position = pos + 2 + value.len();
        }
        Ok(replaced)
    }

    /// Swaps the length-prefixed string stored at `pos` for `value`, moving every
    /// following byte by the length difference. Returns `false` (and leaves the
    /// payload untouched) when no complete string is stored at `pos`.
    pub fn replace_string_at(&mut self, pos: usize, value: &str) -> Result<bool, FieldError> {
        let encoded = encode_string(value)?;
        let Some((_, old_len)) = self.string_at(pos) else {
            return Ok(false);
        };

        let before = self.payload.len();
        let start = pos.min(before);
        self.payload.splice(start..start + old_len, encoded);
        self.adjust_length(before);
        self.position = self.position.min(self.payload.len());
        Ok(true)
    }

    /// Swaps the whole payload, keeping `length` in step with the size change.
    pub fn replace_payload(&mut self, payload: Vec<u8>) {
        let before = self.payload.len();
        self.payload = payload;
        self.adjust_length(before);
        self.position = self.position.min(self.payload.len());
    }

    fn slice_at(&self, pos: usize, len: usize) -> Option<&[u8]> {
        let start = pos.min(self.payload.len());
        self.payload.get(start..start.checked_add(len)?)
    }

    /// Decoded string plus the number of bytes it occupies, prefix included.
    fn string_at(&self, pos: usize) -> Option<(String, usize)> {
        let len = usize::from(self.read_at::<u16>(pos)?);
        let bytes = self.slice_at(pos.min(self.payload.len()) + 2, len)?;
        Some((String::from_utf8_lossy(bytes).into_owned(), len + 2))
    }

    fn adjust_length(&mut self, before: usize) {
        let after = self.payload.len();
        let delta = if after >= before {
            len_i32(after - before)
        } else {
            -len_i32(before - after)
        };
        self.length = self.length.saturating_add(delta);
    }
}

pub(crate) fn encode_string(value: &str) -> Result<Vec<u8>, FieldError> {
    let len = u16::try_from(value.len()).map_err(|_| FieldError::StringTooLong(value.len()))?;
    let mut out = Vec::with_capacity(2 + value.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(out)
}

fn len_i32(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(hash) = &self.identity_hash {
            write!(f, "[{hash}]")?;
        }
        write!(f, "{{l:{}}}{{h:{}}}: ", self.length, self.header)?;

        let mut pos = 0usize;
        if let Some(layout) = &self.field_layout {
            for kind in layout.iter() {
                match crate::fields::read_field(self, *kind, pos) {
                    Some((value, next)) => {
                        write!(f, "{{{value}}}")?;
                        pos = next;
                    }
                    None => break,
                }
            }
        }

        for &byte in &self.payload[pos..] {
            if byte <= 13 {
                write!(f, "[{byte}]")?;
            } else {
                write!(f, "{}", byte as char)?;
            }
        }
        Ok(())
    }
}
