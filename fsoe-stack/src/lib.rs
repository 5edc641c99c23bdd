//! Fail-Safe over EtherCAT (FSoE) protocol stack.
//!
//! This crate implements the ETG.5100 safety layer: a master and a slave
//! state machine exchanging fixed-size Safety PDU frames over an
//! unreliable "black channel". The transport underneath is the host's
//! business — EtherCAT, a serial line, shared memory — the stack only
//! requires non-blocking send and receive callbacks.
//!
//! ```text
//!     ----------            ---------
//!     |        |  outputs   |       |   Arrows denote
//!     | FSoE   | ---------> | FSoE  |   safe data flow
//!     | master |            | slave |
//!     |        | <--------- |       |
//!     ----------   inputs   ---------
//! ```
//!
//! After power-on the master repeatedly tries to establish a connection:
//! session IDs are exchanged and every later frame's CRC chains on them,
//! the addressing and parameter blocks are pushed to the slave and echoed
//! back, then both sides cycle process data. Outputs and inputs carry
//! fail-safe zeros until the respective host explicitly enables live
//! process data, and fall back to zeros on any detected fault: wrong
//! command, bad CRC, foreign connection ID, watchdog expiry or refused
//! parameters all reset the connection and restart the handshake.
//!
//! The core is sans-io and single-threaded: the host owns each machine,
//! drives it by calling `sync` at a cadence of at most half the watchdog
//! timeout, and implements the [`FsoeApp`] callbacks (transport access,
//! monotonic tick, session ID entropy, parameter verification). Instances
//! hold only fixed-capacity buffers and may be placed anywhere, including
//! static storage.
//!
//! # Example
//!
//! ```no_run
//! use fsoe_stack::{FsoeApp, Master, MasterConfig};
//!
//! # struct Transport;
//! # impl FsoeApp for Transport {
//! #     fn send(&mut self, _frame: &[u8]) {}
//! #     fn recv(&mut self, _frame: &mut [u8]) -> usize { 0 }
//! #     fn generate_session_id(&mut self) -> u16 { 4 }
//! #     fn now_ms(&mut self) -> u32 { 0 }
//! # }
//! let cfg = MasterConfig {
//!     slave_address: 0x0304,
//!     connection_id: 8,
//!     watchdog_timeout_ms: 100,
//!     application_parameters: &[],
//!     outputs_size: 2,
//!     inputs_size: 2,
//! };
//! let mut master = Master::new(cfg, Transport).expect("valid configuration");
//! let mut inputs = [0u8; 2];
//! loop {
//!     let status = master
//!         .sync_with_slave(&[0x12, 0x34], &mut inputs)
//!         .expect("buffers match configuration");
//!     if status.is_process_data_received {
//!         // inputs now holds live data from the slave
//!     }
//! }
//! ```

pub mod app;
pub mod channel;
pub mod config;
pub mod crc;
pub mod frame;
pub mod master;
pub mod params;
pub mod slave;
pub mod status;
pub mod watchdog;

pub use app::{ApiError, FsoeApp, ParameterVerdict, UserError};
pub use config::{ConfigError, MasterConfig, SlaveConfig};
pub use crc::update_sra_crc;
pub use frame::{Command, FRAME_MAX_SIZE, PROCESS_DATA_MAX_SIZE, frame_size};
pub use master::Master;
pub use params::APP_PARAMETERS_MAX_SIZE;
pub use slave::Slave;
pub use status::{ConnState, ResetEvent, ResetReason, SyncStatus};
