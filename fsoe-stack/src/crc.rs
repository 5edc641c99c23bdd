//! CRC engines for Safety PDU frames and application parameters.
//!
//! Two independent checksums are used by the stack. CRC_0 is the 16-bit
//! safety CRC computed once per 2-byte data slot of a frame; its input
//! stream chains the connection context (sequence number, connection ID,
//! the peer's session ID and the previous frame's CRC), which is what binds
//! every frame of a dialogue to the random session IDs exchanged at startup.
//! The SRA CRC is an optional 32-bit checksum over application parameters;
//! it is a plain running CRC with a caller-held register so that partial
//! updates over a split buffer equal one update over the whole buffer.

use crc_all::CrcAlgo;

/// Context feeding the CRC of the first data pair of a frame.
///
/// The codec is stateless; all per-session state enters through this
/// struct. Frames outside an established session (Reset frames) use
/// [`CrcContext::detached`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CrcContext {
    /// Final CRC of the previous frame in either direction, 0 at session
    /// start.
    pub last_crc: u16,
    /// Final CRC of the sender's own previous frame, 0 at session start.
    pub old_crc: u16,
    /// Sender's sequence number for this frame.
    pub seq_no: u16,
    /// Connection ID carried in the frame trailer.
    pub conn_id: u16,
    /// Session ID generated by the other side, 0 while still unknown.
    pub peer_session_id: u16,
}

impl CrcContext {
    /// Context for frames that are not bound to a session (Reset frames).
    pub fn detached(conn_id: u16) -> Self {
        Self {
            conn_id,
            ..Self::default()
        }
    }
}

/// CRC of the first data pair of a frame.
///
/// The input stream is the command byte, the connection ID, the sender's
/// sequence number, the peer's session ID, the sender's previous CRC and
/// the previous frame's CRC (all little-endian), followed by the two data
/// bytes.
pub fn crc0_first_pair(cmd: u8, ctx: &CrcContext, pair: [u8; 2]) -> u16 {
    let mut reg = CRC0_INIT;
    CRC0.update_crc(&mut reg, &[cmd]);
    CRC0.update_crc(&mut reg, &ctx.conn_id.to_le_bytes());
    CRC0.update_crc(&mut reg, &ctx.seq_no.to_le_bytes());
    CRC0.update_crc(&mut reg, &ctx.peer_session_id.to_le_bytes());
    CRC0.update_crc(&mut reg, &ctx.old_crc.to_le_bytes());
    CRC0.update_crc(&mut reg, &ctx.last_crc.to_le_bytes());
    CRC0.update_crc(&mut reg, &pair);
    CRC0.finish_crc(&reg)
}

/// CRC of a subsequent data pair, chained on the previous pair's CRC.
pub fn crc0_next_pair(prev_crc: u16, pair: [u8; 2]) -> u16 {
    let mut reg = CRC0_INIT;
    CRC0.update_crc(&mut reg, &prev_crc.to_le_bytes());
    CRC0.update_crc(&mut reg, &pair);
    CRC0.finish_crc(&reg)
}

/// Next value of a frame sequence number: increments, wrapping past
/// 0xFFFF back to 1 (0 is reserved for session-independent Reset frames
/// and never recurs within a session).
pub(crate) fn next_seq_no(seq: u16) -> u16 {
    match seq.wrapping_add(1) {
        0 => 1,
        n => n,
    }
}

const CRC0_INIT: u16 = 0x0000;

const CRC0: CrcAlgo<u16> = CrcAlgo::<u16>::new(
    0x1021,    // polynomial
    16,        // width
    CRC0_INIT, // init
    0,         // xorout
    false,     // reflect
);

/// Update an SRA CRC value in place.
///
/// Set `crc` to zero before the first call; pass the previous result back in
/// for subsequent calls. Splitting a buffer across calls yields the same
/// value as one call over the concatenation. Empty input leaves `crc`
/// unmodified.
///
/// See ETG.5120 ch. 6.3 "SRA CRC Calculation". If used, the result goes
/// first in the application parameter block, little-endian.
pub fn update_sra_crc(crc: &mut u32, data: &[u8]) {
    SRA_CRC.update_crc(crc, data);
}

const SRA_CRC: CrcAlgo<u32> = CrcAlgo::<u32>::new(
    0x04C11DB7, // polynomial
    32,         // width
    0,          // init (register is caller-held)
    0,          // xorout
    true,       // reflect
);
