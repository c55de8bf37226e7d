//! RFC 6455 frame codec.
//!
//! Client frames are always masked with a fresh key. The decoder accepts
//! masked and unmasked frames so the same routine serves both directions.

use std::io::{self, Read};

use rand::RngCore;

use crate::error::{AdapterError, AdapterErrorKind, AdapterResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    pub fn from_u8(raw: u8) -> Self {
        match raw & 0x0F {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(raw) => raw & 0x0F,
        }
    }

    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub len: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

pub fn new_mask() -> [u8; 4] {
    let mut key = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Serialise one frame. `mask` must be `Some` for client-to-server traffic.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 14);
    out.push(0x80 | opcode.as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(
                payload
                    .iter()
                    .enumerate()
                    .map(|(idx, byte)| byte ^ key[idx % 4]),
            );
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Masked FIN text frame, as sent by a client.
pub fn encode_text(payload: &str) -> Vec<u8> {
    encode_frame(Opcode::Text, payload.as_bytes(), Some(new_mask()))
}

pub fn encode_pong(payload: &[u8]) -> Vec<u8> {
    encode_frame(Opcode::Pong, payload, Some(new_mask()))
}

pub fn encode_close() -> Vec<u8> {
    // 1000 = normal closure
    encode_frame(Opcode::Close, &1000u16.to_be_bytes(), Some(new_mask()))
}

pub fn read_header<R: Read>(reader: &mut R) -> AdapterResult<FrameHeader> {
    let mut base = [0u8; 2];
    reader.read_exact(&mut base).map_err(map_read_error)?;

    let fin = base[0] & 0x80 != 0;
    let opcode = Opcode::from_u8(base[0]);
    let masked = base[1] & 0x80 != 0;
    let len = match base[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).map_err(map_read_error)?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).map_err(map_read_error)?;
            u64::from_be_bytes(ext)
        }
        short => short as u64,
    };

    let mask = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).map_err(map_read_error)?;
        Some(key)
    } else {
        None
    };

    Ok(FrameHeader {
        fin,
        opcode,
        mask,
        len,
    })
}

/// Read the payload announced by `header`, refusing anything above `max_len`.
pub fn read_payload<R: Read>(
    reader: &mut R,
    header: &FrameHeader,
    max_len: usize,
) -> AdapterResult<Vec<u8>> {
    if header.len > max_len as u64 {
        return Err(AdapterError::new(AdapterErrorKind::PayloadTooLarge)
            .with_hint(format!(
                "frame payload of {} bytes exceeds limit of {} bytes",
                header.len, max_len
            ))
            .with_data(serde_json::json!({ "len": header.len, "max": max_len })));
    }

    let mut payload = vec![0u8; header.len as usize];
    reader.read_exact(&mut payload).map_err(map_read_error)?;
    if let Some(key) = header.mask {
        for (idx, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[idx % 4];
        }
    }
    Ok(payload)
}

/// Consume the payload of a frame that was rejected, keeping the stream aligned.
pub fn skip_payload<R: Read>(reader: &mut R, header: &FrameHeader) -> AdapterResult<()> {
    let mut remaining = (&mut *reader).take(header.len);
    let copied = io::copy(&mut remaining, &mut io::sink()).map_err(map_read_error)?;
    if copied < header.len {
        return Err(AdapterError::new(AdapterErrorKind::ConnectionClosed)
            .with_hint("stream ended inside an oversized frame"));
    }
    Ok(())
}

pub fn decode_frame<R: Read>(reader: &mut R, max_len: usize) -> AdapterResult<Frame> {
    let header = read_header(reader)?;
    let payload = read_payload(reader, &header, max_len)?;
    Ok(Frame {
        fin: header.fin,
        opcode: header.opcode,
        payload,
    })
}

fn map_read_error(err: io::Error) -> AdapterError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => AdapterError::io(AdapterErrorKind::ConnectionClosed, &err),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            // a stall in the middle of a frame leaves the stream unusable
            AdapterError::io(AdapterErrorKind::ProtocolViolation, &err)
                .with_hint("timed out inside a frame")
        }
        _ => AdapterError::io(AdapterErrorKind::ConnectionClosed, &err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn text_round_trip_across_length_encodings() {
        for size in [0usize, 1, 125, 126, 65_535, 65_536] {
            let payload = "x".repeat(size);
            let encoded = encode_text(&payload);
            let frame = decode_frame(&mut Cursor::new(encoded), 1 << 20).expect("decode");
            assert!(frame.fin);
            assert_eq!(frame.opcode, Opcode::Text);
            assert_eq!(frame.payload.len(), size);
            assert_eq!(frame.payload, payload.as_bytes());
        }
    }

    #[test]
    fn length_prefix_selects_extended_forms() {
        let short = encode_frame(Opcode::Text, &[0u8; 125], None);
        assert_eq!(short[1], 125);

        let medium = encode_frame(Opcode::Text, &[0u8; 126], None);
        assert_eq!(medium[1], 126);
        assert_eq!(&medium[2..4], &126u16.to_be_bytes());

        let long = encode_frame(Opcode::Text, &vec![0u8; 65_536], None);
        assert_eq!(long[1], 127);
        assert_eq!(&long[2..10], &65_536u64.to_be_bytes());
    }

    #[test]
    fn client_frames_are_masked() {
        let encoded = encode_text("hello");
        assert_eq!(encoded[0], 0x81);
        assert_eq!(encoded[1] & 0x80, 0x80);
        let key = [encoded[2], encoded[3], encoded[4], encoded[5]];
        let unmasked: Vec<u8> = encoded[6..]
            .iter()
            .enumerate()
            .map(|(idx, byte)| byte ^ key[idx % 4])
            .collect();
        assert_eq!(unmasked, b"hello");
    }

    #[test]
    fn oversized_payload_is_rejected_before_reading() {
        let encoded = encode_frame(Opcode::Text, &[b'a'; 300], None);
        let err = decode_frame(&mut Cursor::new(encoded), 200).unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::PayloadTooLarge);
    }

    #[test]
    fn skip_payload_keeps_stream_aligned() {
        let mut bytes = encode_frame(Opcode::Text, &[b'a'; 300], None);
        bytes.extend(encode_frame(Opcode::Text, b"next", None));
        let mut cursor = Cursor::new(bytes);

        let header = read_header(&mut cursor).unwrap();
        assert!(read_payload(&mut cursor, &header, 200).is_err());
        skip_payload(&mut cursor, &header).unwrap();

        let frame = decode_frame(&mut cursor, 200).unwrap();
        assert_eq!(frame.payload, b"next");
    }

    #[test]
    fn control_opcodes_are_recognised() {
        let ping = encode_frame(Opcode::Ping, b"hb", None);
        let frame = decode_frame(&mut Cursor::new(ping), 16).unwrap();
        assert_eq!(frame.opcode, Opcode::Ping);
        assert!(frame.opcode.is_control());
        assert!(Opcode::Close.is_control());
        assert!(!Opcode::Text.is_control());
    }

    #[test]
    fn truncated_stream_is_a_closed_connection() {
        let mut encoded = encode_frame(Opcode::Text, b"truncated", None);
        encoded.truncate(5);
        let err = decode_frame(&mut Cursor::new(encoded), 64).unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::ConnectionClosed);
    }
}
