//! Connection states, reset signalling and the per-cycle sync status.

use strum::Display;

/// Connection state of a master or slave state machine.
///
/// After power-on a machine is in Reset. Process data is interchanged only
/// in Data state; the intermediate states carry the configuration handshake.
///
/// ```text
///                     --------------
///                     |   Reset    |<---\
///                     --------------    | Communication error OR
///                           |           | application requested
///                           v           | connection reset.
///                     --------------    |
///                /--->|  Session   |--->|
/// Peer reported  |    --------------    |
/// communication  |          |           |
/// error          |          v           |
///                |    --------------    |
///                |<---| Connection |--->|
///                |    --------------    |
///                |          |           |
///                |          v           |
///                |    --------------    |
///                |<---| Parameter  |--->|
///                |    --------------    |
///                |          |           |
///                |          v           |
///                |    --------------    |
///                \<---|    Data    |--->/
///                     --------------
/// ```
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    /// Connection is reset.
    Reset,
    /// The session IDs are being transferred.
    Session,
    /// The connection ID and slave address are being transferred.
    Connection,
    /// The parameters are being transferred.
    Parameter,
    /// Process or fail-safe data is being transferred.
    Data,
}

impl ConnState {
    /// Static description of the state.
    pub fn description(self) -> &'static str {
        match self {
            ConnState::Reset => "Reset",
            ConnState::Session => "Session",
            ConnState::Connection => "Connection",
            ConnState::Parameter => "Parameter",
            ConnState::Data => "Data",
        }
    }
}

/// Which side initiated a connection reset, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetEvent {
    /// No reset occurred in this cycle.
    #[default]
    None,
    /// Reset initiated by the master application or state machine; a Reset
    /// frame carrying the reason was sent to (or by) the master.
    ByMaster,
    /// Reset initiated by the slave application or state machine.
    BySlave,
}

/// Why a connection was reset.
///
/// These codes travel in Reset frames (ETG.5100 ch. 8.3 table 28,
/// "FSoE communication error codes"). All codes except [`Self::LocalReset`]
/// indicate a detected error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// Application requested the reset; also sent by the master at startup.
    LocalReset,
    /// A frame's command was not valid for the receiver's current state.
    InvalidCmd,
    /// A frame carried an unrecognized command byte.
    UnknownCmd,
    /// A frame carried an unexpected connection ID.
    InvalidConnId,
    /// A frame failed CRC verification.
    InvalidCrc,
    /// The watchdog expired while waiting for a frame.
    WdExpired,
    /// Slave only: the Connection frame addressed a different slave.
    InvalidAddress,
    /// Master only: the slave's echo differed from the data sent to it.
    InvalidData,
    /// Slave only: communication-parameter block had the wrong size.
    InvalidCommParamLength,
    /// Slave only: the watchdog timeout is not acceptable to the device.
    InvalidCommParam,
    /// Slave only: application-parameter area had the wrong length.
    InvalidAppParamLength,
    /// Slave only: an application parameter was rejected, generic code.
    InvalidAppParam,
    /// Slave only: an application parameter was rejected with a
    /// device-specific code in 0x80..=0xFF.
    Device(u8),
    /// A code outside the ranges defined by the standard.
    Undefined(u8),
}

impl ResetReason {
    /// The wire code carried in Reset frames.
    pub fn code(self) -> u8 {
        match self {
            ResetReason::LocalReset => 0,
            ResetReason::InvalidCmd => 1,
            ResetReason::UnknownCmd => 2,
            ResetReason::InvalidConnId => 3,
            ResetReason::InvalidCrc => 4,
            ResetReason::WdExpired => 5,
            ResetReason::InvalidAddress => 6,
            ResetReason::InvalidData => 7,
            ResetReason::InvalidCommParamLength => 8,
            ResetReason::InvalidCommParam => 9,
            ResetReason::InvalidAppParamLength => 10,
            ResetReason::InvalidAppParam => 11,
            ResetReason::Device(code) => code,
            ResetReason::Undefined(code) => code,
        }
    }

    /// Classify a wire code.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => ResetReason::LocalReset,
            1 => ResetReason::InvalidCmd,
            2 => ResetReason::UnknownCmd,
            3 => ResetReason::InvalidConnId,
            4 => ResetReason::InvalidCrc,
            5 => ResetReason::WdExpired,
            6 => ResetReason::InvalidAddress,
            7 => ResetReason::InvalidData,
            8 => ResetReason::InvalidCommParamLength,
            9 => ResetReason::InvalidCommParam,
            10 => ResetReason::InvalidAppParamLength,
            11 => ResetReason::InvalidAppParam,
            0x80..=0xFF => ResetReason::Device(code),
            _ => ResetReason::Undefined(code),
        }
    }

    /// Static description of the reason, e.g. `"local reset"` or
    /// `"INVALID_CRC"`; `"invalid error code"` for undefined codes.
    pub fn description(self) -> &'static str {
        match self {
            ResetReason::LocalReset => "local reset",
            ResetReason::InvalidCmd => "INVALID_CMD",
            ResetReason::UnknownCmd => "UNKNOWN_CMD",
            ResetReason::InvalidConnId => "INVALID_CONNID",
            ResetReason::InvalidCrc => "INVALID_CRC",
            ResetReason::WdExpired => "WD_EXPIRED",
            ResetReason::InvalidAddress => "INVALID_ADDRESS",
            ResetReason::InvalidData => "INVALID_DATA",
            ResetReason::InvalidCommParamLength => "INVALID_COMPARALEN",
            ResetReason::InvalidCommParam => "INVALID_COMPARA",
            ResetReason::InvalidAppParamLength => "INVALID_USERPARALEN",
            ResetReason::InvalidAppParam => "INVALID_USERPARA",
            ResetReason::Device(_) => "application-specific error",
            ResetReason::Undefined(_) => "invalid error code",
        }
    }
}

impl std::fmt::Display for ResetReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// Outcome of one `sync` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    /// True when valid process data is held in the receive buffer. The
    /// data may have arrived in an earlier cycle; it stays valid until a
    /// communication error, a reset or fail-safe data replaces it.
    pub is_process_data_received: bool,

    /// Reset event of this cycle, if any.
    pub reset_event: ResetEvent,

    /// Code sent or received in the Reset frame. Only meaningful when
    /// `reset_event` is not [`ResetEvent::None`].
    pub reset_reason: ResetReason,

    /// State after the cycle.
    pub current_state: ConnState,
}

impl SyncStatus {
    pub(crate) fn quiet(state: ConnState, process_data: bool) -> Self {
        Self {
            is_process_data_received: process_data,
            reset_event: ResetEvent::None,
            reset_reason: ResetReason::LocalReset,
            current_state: state,
        }
    }
}
