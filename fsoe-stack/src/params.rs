//! Safe data blocks transferred during connection establishment.
//!
//! The Connection state carries the 4-byte address block (connection ID and
//! slave address), the Parameter state carries the `SafePara` block
//! (communication parameters followed by optional application parameters).
//! Both are serialized little-endian and streamed through the data slots of
//! as many frames as the configured payload size requires.

use thiserror::Error;

/// Maximum size of the application parameter area, in bytes.
pub const APP_PARAMETERS_MAX_SIZE: usize = 256;

/// Wire size of the Connection-state address block.
pub const CONN_DATA_SIZE: usize = 4;

/// Wire size of the SafePara block header (watchdog size, watchdog value,
/// application parameter size).
pub const SAFE_PARA_HEADER_SIZE: usize = 6;

/// The only legal value of the communication-parameter size field; the
/// watchdog timeout is the sole communication parameter and is two bytes.
const WATCHDOG_FIELD_SIZE: u16 = 2;

/// Address block exchanged in the Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionData {
    pub conn_id: u16,
    pub slave_address: u16,
}

impl ConnectionData {
    pub fn to_bytes(self) -> [u8; CONN_DATA_SIZE] {
        let mut bytes = [0; CONN_DATA_SIZE];
        bytes[..2].copy_from_slice(&self.conn_id.to_le_bytes());
        bytes[2..].copy_from_slice(&self.slave_address.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; CONN_DATA_SIZE]) -> Self {
        Self {
            conn_id: u16::from_le_bytes([bytes[0], bytes[1]]),
            slave_address: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }
}

/// Rejections while parsing a received SafePara block.
///
/// Each variant corresponds to one of the communication error codes the
/// slave sends in its Reset frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SafeParaError {
    /// Communication-parameter size field is not 2 (error code 8).
    #[error("communication parameter size field is {0}, must be 2")]
    CommParamSize(u16),

    /// Application-parameter size field disagrees with the configured
    /// expectation (error code 10).
    #[error("application parameter size {got} does not match expected {expected}")]
    AppParamSize { expected: u16, got: u16 },
}

/// The `SafePara` block of the Parameter state.
///
/// Layout: `watchdog_size (=2) | watchdog_ms | app_param_size |
/// app_params[..]`, all little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeParameters {
    pub watchdog_timeout_ms: u16,
    app: [u8; APP_PARAMETERS_MAX_SIZE],
    app_len: usize,
}

impl SafeParameters {
    /// Build the block sent by a master. `app_params` length must already
    /// be validated against [`APP_PARAMETERS_MAX_SIZE`].
    pub fn new(watchdog_timeout_ms: u16, app_params: &[u8]) -> Self {
        debug_assert!(app_params.len() <= APP_PARAMETERS_MAX_SIZE);
        let mut app = [0; APP_PARAMETERS_MAX_SIZE];
        app[..app_params.len()].copy_from_slice(app_params);
        Self {
            watchdog_timeout_ms,
            app,
            app_len: app_params.len(),
        }
    }

    pub fn app_parameters(&self) -> &[u8] {
        &self.app[..self.app_len]
    }

    /// Total serialized size.
    pub fn encoded_len(&self) -> usize {
        SAFE_PARA_HEADER_SIZE + self.app_len
    }

    /// Serialize into `out`, which must hold [`Self::encoded_len`] bytes.
    pub fn write(&self, out: &mut [u8]) {
        out[..2].copy_from_slice(&WATCHDOG_FIELD_SIZE.to_le_bytes());
        out[2..4].copy_from_slice(&self.watchdog_timeout_ms.to_le_bytes());
        out[4..6].copy_from_slice(&(self.app_len as u16).to_le_bytes());
        out[SAFE_PARA_HEADER_SIZE..SAFE_PARA_HEADER_SIZE + self.app_len]
            .copy_from_slice(&self.app[..self.app_len]);
    }

    /// Parse a fully received block.
    ///
    /// `bytes` is exactly the accumulated stream, whose total length the
    /// slave derived from its configured application parameter size; the
    /// embedded size fields are validated against it.
    pub fn parse(bytes: &[u8], expected_app_len: usize) -> Result<Self, SafeParaError> {
        debug_assert_eq!(bytes.len(), SAFE_PARA_HEADER_SIZE + expected_app_len);

        let watchdog_field = u16::from_le_bytes([bytes[0], bytes[1]]);
        if watchdog_field != WATCHDOG_FIELD_SIZE {
            return Err(SafeParaError::CommParamSize(watchdog_field));
        }

        let app_size = u16::from_le_bytes([bytes[4], bytes[5]]);
        if app_size as usize != expected_app_len {
            return Err(SafeParaError::AppParamSize {
                expected: expected_app_len as u16,
                got: app_size,
            });
        }

        let mut app = [0; APP_PARAMETERS_MAX_SIZE];
        app[..expected_app_len].copy_from_slice(&bytes[SAFE_PARA_HEADER_SIZE..]);
        Ok(Self {
            watchdog_timeout_ms: u16::from_le_bytes([bytes[2], bytes[3]]),
            app,
            app_len: expected_app_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_data_roundtrip() {
        let data = ConnectionData {
            conn_id: 0x0008,
            slave_address: 0x0304,
        };
        let bytes = data.to_bytes();
        assert_eq!(bytes, [0x08, 0x00, 0x04, 0x03]);
        assert_eq!(ConnectionData::from_bytes(bytes), data);
    }

    #[test]
    fn safe_parameters_roundtrip() {
        let para = SafeParameters::new(100, &[0xDE, 0xAD]);
        let mut wire = [0u8; SAFE_PARA_HEADER_SIZE + 2];
        para.write(&mut wire);
        assert_eq!(wire, [2, 0, 100, 0, 2, 0, 0xDE, 0xAD]);

        let parsed = SafeParameters::parse(&wire, 2).unwrap();
        assert_eq!(parsed.watchdog_timeout_ms, 100);
        assert_eq!(parsed.app_parameters(), &[0xDE, 0xAD]);
    }

    #[test]
    fn empty_app_parameters_is_header_only() {
        let para = SafeParameters::new(100, &[]);
        assert_eq!(para.encoded_len(), SAFE_PARA_HEADER_SIZE);
        let mut wire = [0u8; SAFE_PARA_HEADER_SIZE];
        para.write(&mut wire);
        assert_eq!(wire, [2, 0, 100, 0, 0, 0]);
    }

    #[test]
    fn bad_watchdog_field_size_is_code_8_material() {
        let wire = [3, 0, 100, 0, 0, 0];
        assert_eq!(
            SafeParameters::parse(&wire, 0),
            Err(SafeParaError::CommParamSize(3))
        );
    }

    #[test]
    fn app_size_disagreement_is_code_10_material() {
        let wire = [2, 0, 100, 0, 4, 0, 0xAA, 0xBB];
        assert_eq!(
            SafeParameters::parse(&wire, 2),
            Err(SafeParaError::AppParamSize { expected: 2, got: 4 })
        );
    }
}
