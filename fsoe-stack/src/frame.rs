//! Safety PDU frame layout, assembly and parsing.
//!
//! A Safety PDU carries a command byte, the safe data split into 2-byte
//! slots each followed by its own 16-bit CRC, and the connection ID:
//!
//! ```text
//! +-----+---------+-------+-----+---------+-------+----------+----------+
//! | Cmd | Data0,1 | CRC_0 | ... | DataN-2,N-1 | CRC_n | ConnId_lo | ConnId_hi |
//! +-----+---------+-------+-----+---------+-------+----------+----------+
//! ```
//!
//! Frame size is `max(3 + 2 * data_size, 6)` bytes and fixed per direction
//! by configuration. A 1-byte payload occupies a single slot whose second
//! byte exists only as zero padding inside the CRC computation, giving the
//! minimum 6-byte frame. All multi-byte fields are little-endian.
//!
//! The codec is stateless. Session binding enters through [`CrcContext`]
//! and the CRCs are recomputed in full on every decode; the final slot's
//! CRC transitively covers the whole frame and is what the state machines
//! carry forward as `LastCrc`.

use strum::FromRepr;
use thiserror::Error;

use crate::crc::{CrcContext, crc0_first_pair, crc0_next_pair};

/// Maximum number of safe data bytes per direction.
pub const PROCESS_DATA_MAX_SIZE: usize = 126;

/// Number of bytes in a frame carrying `data_size` safe data bytes.
pub const fn frame_size(data_size: usize) -> usize {
    if data_size == 1 { 6 } else { 2 * data_size + 3 }
}

/// Largest possible frame.
pub const FRAME_MAX_SIZE: usize = frame_size(PROCESS_DATA_MAX_SIZE);

/// Safety PDU command byte.
///
/// Discriminants are the wire values from the ETG.5100 command table.
/// Which commands are acceptable depends on the receiver's connection
/// state; that check belongs to the state machines, not the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum Command {
    /// Connection reset; the first data byte carries the reset reason.
    Reset = 0x08,
    /// Session ID transfer.
    Session = 0x4E,
    /// Connection ID and slave address transfer.
    Connection = 0x64,
    /// Communication and application parameter transfer.
    Parameter = 0x52,
    /// Data state, payload is fail-safe (all zeros).
    FailSafeData = 0x2A,
    /// Data state, payload is live process data.
    ProcessData = 0x36,
}

impl Command {
    /// Parse a wire byte into a command.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::from_repr(byte)
    }

    /// True for the two commands valid in Data state.
    pub fn is_data(self) -> bool {
        matches!(self, Command::FailSafeData | Command::ProcessData)
    }
}

/// A Safety PDU frame in wire form.
///
/// Fixed-capacity buffer so instances are statically allocatable; the
/// in-use length is set once from the configured data size.
#[derive(Clone, Copy)]
pub struct Frame {
    len: usize,
    bytes: [u8; FRAME_MAX_SIZE],
}

impl Frame {
    /// An all-zero frame of the size required for `data_size` data bytes.
    pub fn zeroed(data_size: usize) -> Self {
        Self {
            len: frame_size(data_size),
            bytes: [0; FRAME_MAX_SIZE],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Frame {}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame({:02x?})", self.as_slice())
    }
}

/// Parse failures, classified the way the state machines report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame is {got} bytes, layout requires {expected}")]
    WrongLength { expected: usize, got: usize },

    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),

    #[error("CRC mismatch in data slot {slot}")]
    InvalidCrc { slot: usize },

    #[error("connection ID {got:#06x} does not match expected {expected:#06x}")]
    ConnIdMismatch { expected: u16, got: u16 },
}

/// A successfully parsed frame.
#[derive(Debug, Clone, Copy)]
pub struct DecodedFrame {
    pub command: Command,
    pub conn_id: u16,
    /// CRC of the final data slot; becomes `LastCrc` when the frame is
    /// accepted.
    pub final_crc: u16,
    data: [u8; PROCESS_DATA_MAX_SIZE],
    data_len: usize,
}

impl DecodedFrame {
    pub fn data(&self) -> &[u8] {
        &self.data[..self.data_len]
    }
}

fn pair_count(data_size: usize) -> usize {
    if data_size == 1 { 1 } else { data_size / 2 }
}

/// Assemble a frame.
///
/// `data` must be exactly the configured data size (1 or even, at most
/// [`PROCESS_DATA_MAX_SIZE`]); the state machines guarantee this. Returns
/// the frame and the final slot's CRC.
pub fn encode(cmd: Command, data: &[u8], ctx: &CrcContext) -> (Frame, u16) {
    debug_assert!(data.len() == 1 || (data.len() % 2 == 0 && !data.is_empty()));
    debug_assert!(data.len() <= PROCESS_DATA_MAX_SIZE);

    let mut frame = Frame::zeroed(data.len());
    let bytes = frame.as_mut_slice();
    bytes[0] = cmd as u8;

    let mut crc = 0u16;
    let mut offset = 1;
    for slot in 0..pair_count(data.len()) {
        let pair = pair_bytes(data, slot);
        // A 1-byte payload puts only the real byte on the wire; the pad
        // byte exists solely inside the CRC input.
        let wire_bytes = if data.len() == 1 { 1 } else { 2 };
        bytes[offset..offset + wire_bytes].copy_from_slice(&pair[..wire_bytes]);
        offset += wire_bytes;

        crc = if slot == 0 {
            crc0_first_pair(cmd as u8, ctx, pair)
        } else {
            crc0_next_pair(crc, pair)
        };
        bytes[offset..offset + 2].copy_from_slice(&crc.to_le_bytes());
        offset += 2;
    }

    bytes[offset..offset + 2].copy_from_slice(&ctx.conn_id.to_le_bytes());
    (frame, crc)
}

/// Parse and verify a frame.
///
/// All slot CRCs are recomputed against `ctx`, feeding the connection ID
/// actually carried in the trailer; a corrupted trailer therefore surfaces
/// as [`FrameError::InvalidCrc`], while [`FrameError::ConnIdMismatch`] is
/// reserved for intact frames that belong to a different connection.
/// `expected_conn_id` is `None` while the receiver does not yet know the
/// connection ID (before the Connection state completes).
pub fn decode(
    raw: &[u8],
    data_size: usize,
    ctx: &CrcContext,
    expected_conn_id: Option<u16>,
) -> Result<DecodedFrame, FrameError> {
    let expected_len = frame_size(data_size);
    if raw.len() != expected_len {
        return Err(FrameError::WrongLength {
            expected: expected_len,
            got: raw.len(),
        });
    }

    let command = Command::from_byte(raw[0]).ok_or(FrameError::UnknownCommand(raw[0]))?;
    let conn_id = u16::from_le_bytes([raw[expected_len - 2], raw[expected_len - 1]]);

    let crc_ctx = CrcContext { conn_id, ..*ctx };
    let mut data = [0u8; PROCESS_DATA_MAX_SIZE];
    let mut crc = 0u16;
    let mut offset = 1;
    for slot in 0..pair_count(data_size) {
        let wire_bytes = if data_size == 1 { 1 } else { 2 };
        let mut pair = [0u8; 2];
        pair[..wire_bytes].copy_from_slice(&raw[offset..offset + wire_bytes]);
        data[slot * 2..slot * 2 + wire_bytes].copy_from_slice(&pair[..wire_bytes]);
        offset += wire_bytes;

        crc = if slot == 0 {
            crc0_first_pair(command as u8, &crc_ctx, pair)
        } else {
            crc0_next_pair(crc, pair)
        };
        let carried = u16::from_le_bytes([raw[offset], raw[offset + 1]]);
        if carried != crc {
            return Err(FrameError::InvalidCrc { slot });
        }
        offset += 2;
    }

    if let Some(expected) = expected_conn_id
        && conn_id != expected
    {
        return Err(FrameError::ConnIdMismatch {
            expected,
            got: conn_id,
        });
    }

    Ok(DecodedFrame {
        command,
        conn_id,
        final_crc: crc,
        data,
        data_len: data_size,
    })
}

fn pair_bytes(data: &[u8], slot: usize) -> [u8; 2] {
    if data.len() == 1 {
        [data[0], 0]
    } else {
        [data[slot * 2], data[slot * 2 + 1]]
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn ctx() -> CrcContext {
        CrcContext {
            last_crc: 0x55AA,
            old_crc: 0xC0DE,
            seq_no: 3,
            conn_id: 0x0008,
            peer_session_id: 0x1234,
        }
    }

    #[test_case(1, 6; "one byte pads to minimum")]
    #[test_case(2, 7; "two bytes")]
    #[test_case(4, 11; "four bytes")]
    #[test_case(6, 15; "six bytes")]
    #[test_case(126, 255; "maximum")]
    fn frame_size_formula(data_size: usize, expected: usize) {
        assert_eq!(frame_size(data_size), expected);
        let (frame, _) = encode(Command::ProcessData, &vec![0xA5; data_size], &ctx());
        assert_eq!(frame.len(), expected);
    }

    #[test_case(&[0x12][..]; "single byte")]
    #[test_case(&[0x12, 0x34][..]; "one slot")]
    #[test_case(&[0x12, 0x34, 0x56, 0x78][..]; "two slots")]
    fn decode_inverts_encode(data: &[u8]) {
        let ctx = ctx();
        let (frame, final_crc) = encode(Command::ProcessData, data, &ctx);
        let decoded = decode(frame.as_slice(), data.len(), &ctx, Some(0x0008)).unwrap();

        assert_eq!(decoded.command, Command::ProcessData);
        assert_eq!(decoded.conn_id, 0x0008);
        assert_eq!(decoded.final_crc, final_crc);
        assert_eq!(decoded.data(), data);
    }

    #[test]
    fn single_byte_payload_yields_minimum_frame() {
        let (frame, _) = encode(Command::Session, &[0x7F], &ctx());
        assert_eq!(frame.len(), 6);
        // Cmd, data byte, CRC lo, CRC hi, ConnId lo, ConnId hi.
        assert_eq!(frame.as_slice()[0], Command::Session as u8);
        assert_eq!(frame.as_slice()[1], 0x7F);
        assert_eq!(&frame.as_slice()[4..6], &[0x08, 0x00]);
    }

    #[test]
    fn unknown_command_byte_is_rejected() {
        let ctx = ctx();
        let (mut frame, _) = encode(Command::ProcessData, &[1, 2], &ctx);
        frame.as_mut_slice()[0] = 0xFF;
        let err = decode(frame.as_slice(), 2, &ctx, Some(0x0008)).unwrap_err();
        assert_eq!(err, FrameError::UnknownCommand(0xFF));
    }

    #[test]
    fn corrupted_data_byte_fails_crc() {
        let ctx = ctx();
        let (mut frame, _) = encode(Command::ProcessData, &[1, 2, 3, 4], &ctx);
        frame.as_mut_slice()[5] = 0xEE; // second slot, first data byte
        let err = decode(frame.as_slice(), 4, &ctx, Some(0x0008)).unwrap_err();
        assert_eq!(err, FrameError::InvalidCrc { slot: 1 });
    }

    #[test]
    fn corrupted_trailer_fails_crc_not_connid() {
        let ctx = ctx();
        let (mut frame, _) = encode(Command::ProcessData, &[1, 2], &ctx);
        let last = frame.len() - 1;
        frame.as_mut_slice()[last] ^= 0x01;
        let err = decode(frame.as_slice(), 2, &ctx, Some(0x0008)).unwrap_err();
        assert_eq!(err, FrameError::InvalidCrc { slot: 0 });
    }

    #[test]
    fn foreign_connection_id_is_flagged() {
        // A frame legitimately encoded for connection 9 is intact but does
        // not belong to connection 8.
        let mut other = ctx();
        other.conn_id = 0x0009;
        let (frame, _) = encode(Command::ProcessData, &[1, 2], &other);
        let err = decode(frame.as_slice(), 2, &other, Some(0x0008)).unwrap_err();
        assert_eq!(
            err,
            FrameError::ConnIdMismatch {
                expected: 0x0008,
                got: 0x0009
            }
        );
    }

    #[test]
    fn connid_check_skipped_while_unknown() {
        let ctx = ctx();
        let (frame, _) = encode(Command::Connection, &[8, 0], &ctx);
        assert!(decode(frame.as_slice(), 2, &ctx, None).is_ok());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let ctx = ctx();
        let (frame, _) = encode(Command::ProcessData, &[1, 2], &ctx);
        let err = decode(&frame.as_slice()[..5], 2, &ctx, None).unwrap_err();
        assert_eq!(err, FrameError::WrongLength { expected: 7, got: 5 });
    }

    #[test]
    fn decode_is_sensitive_to_context() {
        let ctx = ctx();
        let (frame, _) = encode(Command::ProcessData, &[1, 2], &ctx);

        let stale_seq = CrcContext { seq_no: 4, ..ctx };
        assert!(matches!(
            decode(frame.as_slice(), 2, &stale_seq, Some(0x0008)),
            Err(FrameError::InvalidCrc { .. })
        ));

        let stale_chain = CrcContext { last_crc: 0, ..ctx };
        assert!(matches!(
            decode(frame.as_slice(), 2, &stale_chain, Some(0x0008)),
            Err(FrameError::InvalidCrc { .. })
        ));
    }
}
