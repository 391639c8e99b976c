//! Length-delimited frames
//!
//! Each telemetry frame is written as a base-128 varint length followed by the
//! opaque payload, the same framing protobuf uses for delimited streams.

use crate::error::{Result, StorageError};

/// Size of the buffer a frame is encoded into before it is written
pub const ENCODE_BUFFER_LEN: usize = 512;

/// Longest varint prefix for a `u32` length
pub const MAX_VARINT_LEN: usize = 5;

pub fn varint_len(mut value: usize) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Bytes needed to encode a payload of `payload_len` bytes.
pub fn encoded_len(payload_len: usize) -> usize {
    varint_len(payload_len) + payload_len
}

/// Encode `payload` with its length prefix into `out`.
pub fn encode_into(payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    if payload.is_empty() {
        return Err(StorageError::Data("empty frame".into()));
    }
    if encoded_len(payload.len()) > ENCODE_BUFFER_LEN {
        return Err(StorageError::Data(format!(
            "frame of {} bytes exceeds encode buffer",
            payload.len()
        )));
    }
    let mut value = payload.len();
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
    out.extend_from_slice(payload);
    Ok(())
}

pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded_len(payload.len()));
    encode_into(payload, &mut out)?;
    Ok(out)
}

/// Decode one varint from the front of `bytes`: `(value, bytes consumed)`.
pub fn decode_varint(bytes: &[u8]) -> Option<(usize, usize)> {
    let mut value = 0usize;
    for (i, &byte) in bytes.iter().enumerate().take(MAX_VARINT_LEN) {
        value |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Iterator over the frames of a stream file body (after the header).
///
/// Stops at the first truncated frame, which is what a torn final write
/// leaves behind.
pub struct FrameReader<'a> {
    bytes: &'a [u8],
}

impl<'a> FrameReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        FrameReader { bytes }
    }

    /// Bytes not consumed as whole frames.
    pub fn remainder(&self) -> &'a [u8] {
        self.bytes
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let (len, used) = decode_varint(self.bytes)?;
        if len == 0 {
            return None;
        }
        let end = used.checked_add(len)?;
        if end > self.bytes.len() {
            return None;
        }
        let frame = &self.bytes[used..end];
        self.bytes = &self.bytes[end..];
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_lengths() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(encoded_len(300), 302);
    }

    #[test]
    fn test_encode_two_byte_prefix() {
        let payload = vec![0xAB; 300];
        let encoded = encode(&payload).unwrap();
        assert_eq!(&encoded[..2], &[0xAC, 0x02]);
        assert_eq!(decode_varint(&encoded), Some((300, 2)));
    }

    #[test]
    fn test_reader_splits_frames_and_stops_at_torn_tail() {
        let mut body = Vec::new();
        encode_into(b"one", &mut body).unwrap();
        encode_into(b"three", &mut body).unwrap();
        body.extend_from_slice(&[10, 1, 2]);

        let mut reader = FrameReader::new(&body);
        assert_eq!(reader.next(), Some(&b"one"[..]));
        assert_eq!(reader.next(), Some(&b"three"[..]));
        assert_eq!(reader.next(), None);
        assert_eq!(reader.remainder(), &[10, 1, 2]);
    }

    #[test]
    fn test_rejects_empty_and_oversized() {
        assert!(matches!(encode(&[]), Err(StorageError::Data(_))));
        assert!(matches!(
            encode(&vec![0; ENCODE_BUFFER_LEN]),
            Err(StorageError::Data(_))
        ));
        assert!(encode(&vec![0; ENCODE_BUFFER_LEN - 2]).is_ok());
    }
}
