//! State machine configuration.
//!
//! Masters and slaves must agree out-of-band on the process data sizes in
//! both directions; everything else the master pushes to the slave during
//! connection establishment. Validation happens once, in `new`; a
//! constructed machine never revisits its configuration.

use thiserror::Error;

use crate::frame::PROCESS_DATA_MAX_SIZE;
use crate::params::APP_PARAMETERS_MAX_SIZE;

/// Configuration rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Process data sizes must be 1 or an even value up to 126.
    #[error("{field} is {size}; must be 1 or an even value in 2..=126")]
    InvalidProcessDataSize { field: &'static str, size: usize },

    /// The connection ID identifies the master and must be non-zero.
    #[error("connection_id must be non-zero")]
    ZeroConnectionId,

    /// The watchdog timeout must be at least one millisecond.
    #[error("watchdog_timeout_ms must be non-zero")]
    ZeroWatchdogTimeout,

    /// Application parameters exceed the compile-time maximum.
    #[error("application parameters are {0} bytes, maximum is {APP_PARAMETERS_MAX_SIZE}")]
    AppParametersTooLarge(usize),
}

fn check_process_data_size(field: &'static str, size: usize) -> Result<(), ConfigError> {
    let valid = size == 1 || (size >= 2 && size <= PROCESS_DATA_MAX_SIZE && size % 2 == 0);
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidProcessDataSize { field, size })
    }
}

/// Configuration of a master state machine.
#[derive(Debug, Clone, Copy)]
pub struct MasterConfig<'a> {
    /// Address of the slave this master connects to; sent in the
    /// Connection state and verified by the slave.
    pub slave_address: u16,

    /// Non-zero ID uniquely identifying this master on the communication
    /// system; sent in the Connection state and carried in every frame
    /// trailer from then on.
    pub connection_id: u16,

    /// Watchdog timeout pushed to the slave in the Parameter state.
    /// The slave refuses the connection if the value is outside its
    /// supported range.
    pub watchdog_timeout_ms: u16,

    /// Device-specific parameters pushed to the slave in the Parameter
    /// state; may be empty. Copied into the machine at construction.
    pub application_parameters: &'a [u8],

    /// Safe data bytes sent to the slave per cycle.
    pub outputs_size: usize,

    /// Safe data bytes received from the slave per cycle.
    pub inputs_size: usize,
}

impl MasterConfig<'_> {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_process_data_size("outputs_size", self.outputs_size)?;
        check_process_data_size("inputs_size", self.inputs_size)?;
        if self.connection_id == 0 {
            return Err(ConfigError::ZeroConnectionId);
        }
        if self.watchdog_timeout_ms == 0 {
            return Err(ConfigError::ZeroWatchdogTimeout);
        }
        if self.application_parameters.len() > APP_PARAMETERS_MAX_SIZE {
            return Err(ConfigError::AppParametersTooLarge(
                self.application_parameters.len(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a slave state machine.
///
/// The slave receives the connection ID, watchdog timeout and application
/// parameter values from its master; only the expectations are configured.
#[derive(Debug, Clone, Copy)]
pub struct SlaveConfig {
    /// This slave's own address; Connection frames naming a different
    /// address are refused.
    pub slave_address: u16,

    /// Expected size of the application parameter area; a Parameter block
    /// with any other size is refused.
    pub application_parameters_size: usize,

    /// Safe data bytes sent to the master per cycle.
    pub inputs_size: usize,

    /// Safe data bytes received from the master per cycle.
    pub outputs_size: usize,
}

impl SlaveConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_process_data_size("inputs_size", self.inputs_size)?;
        check_process_data_size("outputs_size", self.outputs_size)?;
        if self.application_parameters_size > APP_PARAMETERS_MAX_SIZE {
            return Err(ConfigError::AppParametersTooLarge(
                self.application_parameters_size,
            ));
        }
        Ok(())
    }
}
