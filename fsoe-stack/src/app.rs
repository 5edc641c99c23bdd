//! Callback boundary between the stack and the host application.
//!
//! The stack never touches a transport, a clock or an entropy source
//! directly; everything ambient comes in through [`FsoeApp`], implemented
//! by the host. A master application needs `send`, `recv`,
//! `generate_session_id` and `now_ms`; a slave application additionally
//! implements `verify_parameters`. Callbacks are invoked synchronously
//! from within a `sync` call and must not block or re-enter the stack for
//! the same instance.

use thiserror::Error;

use crate::config::ConfigError;

/// Host-implemented callbacks.
pub trait FsoeApp {
    /// Transmit one complete Safety PDU frame. Must not block; a frame
    /// that cannot be sent is simply lost (the peer's watchdog recovers).
    fn send(&mut self, frame: &[u8]);

    /// Try to receive one complete frame into `frame`.
    ///
    /// Returns the number of bytes written: the full frame size when a
    /// frame is available, or 0 when none is. Returning the previously
    /// delivered frame again is allowed; the stack detects and ignores
    /// duplicates.
    fn recv(&mut self, frame: &mut [u8]) -> usize;

    /// Produce a random 16-bit Session ID.
    ///
    /// Called on every session start. The source must be seeded so that a
    /// different sequence results after each power cycle; a fixed-seed
    /// PRNG is not sufficient (ETG.5100 ch. 8.1.3.7).
    fn generate_session_id(&mut self) -> u16;

    /// Current value of a monotonic millisecond tick.
    fn now_ms(&mut self) -> u32;

    /// Judge a fully received parameter block. Slave side only; the
    /// default accepts everything.
    fn verify_parameters(&mut self, watchdog_timeout_ms: u16, app_params: &[u8]) -> ParameterVerdict {
        let _ = (watchdog_timeout_ms, app_params);
        ParameterVerdict::Accepted
    }

    /// Called when the host violates an API precondition, immediately
    /// before the violated operation returns an error.
    fn handle_user_error(&mut self, error: UserError) {
        tracing::error!(%error, "FSoE API misuse");
    }
}

/// Result of [`FsoeApp::verify_parameters`].
///
/// Rejections carry the communication error code the slave will send to
/// the master in its Reset frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterVerdict {
    /// All parameters are acceptable.
    Accepted,
    /// The watchdog timeout is outside the device's supported range
    /// (error code 9).
    BadWatchdog,
    /// The application parameter area has the wrong length for this
    /// device (error code 10).
    BadAppParamLength,
    /// An application parameter is invalid, no further detail
    /// (error code 11).
    BadAppParam,
    /// An application parameter is invalid, device-specific detail code
    /// in the range 0x80..=0xFF.
    DeviceSpecific(u8),
}

/// Ways a host can call the API incorrectly.
///
/// The original C stack also reported null and uninitialized instance
/// pointers; those cannot be expressed against this API (instances only
/// exist after a successful `new`), leaving the kinds below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UserError {
    /// An accessor was called in a connection state where its value does
    /// not exist yet.
    #[error("operation not valid in the current connection state")]
    WrongInstanceState,

    /// A process data buffer does not match the configured size.
    #[error("process data buffer size does not match configuration")]
    BufferSizeMismatch,

    /// The configuration given to `new` failed validation.
    #[error("invalid configuration")]
    BadConfiguration,
}

/// Error returned by API operations whose preconditions were violated.
///
/// Always preceded by a [`FsoeApp::handle_user_error`] callback. Protocol
/// faults never surface here; they are reported through the sync status
/// and recovered by resetting the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("operation requires a connection state that has not been reached")]
    WrongState,

    #[error("buffer size does not match the configured process data size")]
    BufferSize,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
