//! Wire framing
//!
//! Every message travels in one frame:
//!
//! ```text
//! [4-byte magic][u32 big-endian payload length][payload]
//! ```
//!
//! The payload is a one-byte message tag followed by the bincode body, see
//! `network::message`.

use crate::error::{LedgerError, Result};
use crate::network::message::Message;
use crate::utils::MAX_DECODE_LEN;
use std::io::{ErrorKind, Read, Write};

pub const MAGIC: [u8; 4] = [0xD0, 0xC5, 0x16, 0x7E];
pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PAYLOAD_LEN: usize = MAX_DECODE_LEN;
/// Blocks per `ChainResponse`.
pub const DEFAULT_CHUNK_SIZE: usize = 50;
/// Upper bound on blocks accepted in one `ChainResponse`.
pub const MAX_BLOCKS_PER_RESPONSE: usize = 1000;

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(LedgerError::Protocol(format!(
            "Payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }

    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend(MAGIC);
    frame.extend((payload.len() as u32).to_be_bytes());
    frame.extend(payload);
    writer.write_all(&frame).map_err(network_error)?;
    writer.flush().map_err(network_error)
}

pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).map_err(network_error)?;

    if header[..4] != MAGIC {
        return Err(LedgerError::Protocol(format!(
            "Bad magic {:02x?}",
            &header[..4]
        )));
    }

    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(LedgerError::Protocol(format!(
            "Frame length {len} exceeds the {MAX_PAYLOAD_LEN} byte limit"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(network_error)?;
    Ok(payload)
}

pub fn send_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    write_frame(writer, &message.encode()?)
}

pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
    Message::decode(&read_frame(reader)?)
}

fn network_error(err: std::io::Error) -> LedgerError {
    match err.kind() {
        ErrorKind::UnexpectedEof => LedgerError::Network("Connection closed by peer".to_string()),
        ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            LedgerError::Network("Connection timed out".to_string())
        }
        _ => LedgerError::Network(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abc").unwrap();
        assert_eq!(&buf[..4], &MAGIC);
        assert_eq!(&buf[4..8], &3u32.to_be_bytes());
        assert_eq!(&buf[8..], b"abc");

        let payload = read_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn test_bad_magic_is_protocol_error() {
        let mut buf = vec![0xDE, 0xAD, 0xBE, 0xEF];
        buf.extend(1u32.to_be_bytes());
        buf.push(0);
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_oversized_length_is_rejected_before_reading() {
        let mut buf = MAGIC.to_vec();
        buf.extend(((MAX_PAYLOAD_LEN + 1) as u32).to_be_bytes());
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(err.is_protocol());

        let too_big = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(write_frame(&mut Vec::new(), &too_big).unwrap_err().is_protocol());
    }

    #[test]
    fn test_truncated_frame_is_network_error() {
        let mut buf = MAGIC.to_vec();
        buf.extend(10u32.to_be_bytes());
        buf.extend(b"short");
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, LedgerError::Network(_)));
    }

    #[test]
    fn test_message_over_the_wire() {
        let mut buf = Vec::new();
        send_message(&mut buf, &Message::ChainRequest { from_index: 12 }).unwrap();
        send_message(&mut buf, &Message::ChainHeightQuery).unwrap();

        let mut reader = Cursor::new(buf);
        assert_eq!(
            read_message(&mut reader).unwrap(),
            Message::ChainRequest { from_index: 12 }
        );
        assert_eq!(read_message(&mut reader).unwrap(), Message::ChainHeightQuery);
    }
}
