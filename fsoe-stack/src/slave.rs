//! FSoE slave state machine.
//!
//! The slave is the responding side of a connection: it never initiates a
//! phase, it answers every accepted master frame with exactly one frame of
//! its own. During connection establishment it collects the master's
//! session ID, addressing block and parameter block, echoing the safe data
//! back so the master can verify the transfer, and judges the received
//! parameters through the host's verify callback. Any detected fault makes
//! the slave send a Reset frame carrying the communication error code and
//! fall back to the Reset state on its own.
//!
//! The host calls [`Slave::sync_with_master`] periodically; `inputs` is
//! the process data offered to the master, `outputs` receives the
//! master's process data (zeros unless live data is held).

use tracing::{debug, warn};

use crate::app::{ApiError, FsoeApp, ParameterVerdict, UserError};
use crate::channel::BlackChannel;
use crate::config::SlaveConfig;
use crate::crc::{CrcContext, next_seq_no};
use crate::frame::{self, Command, Frame, PROCESS_DATA_MAX_SIZE};
use crate::params::{
    APP_PARAMETERS_MAX_SIZE, CONN_DATA_SIZE, ConnectionData, SAFE_PARA_HEADER_SIZE, SafeParaError,
    SafeParameters,
};
use crate::status::{ConnState, ResetEvent, ResetReason, SyncStatus};
use crate::watchdog::Watchdog;

const META_MAX: usize = SAFE_PARA_HEADER_SIZE + APP_PARAMETERS_MAX_SIZE;

const SESSION_ID_SIZE: usize = 2;

/// FSoE slave state machine.
pub struct Slave<A> {
    // Fixed at construction.
    slave_address: u16,
    expected_app_len: usize,
    inputs_size: usize,
    outputs_size: usize,

    state: ConnState,

    // Session binding (ETG.5100 table 32 variables).
    session_id: u16,
    master_session_id: u16,
    master_session_rx: [u8; SESSION_ID_SIZE],
    session_rx: usize,
    session_tx: usize,
    conn_id: u16,
    last_crc: u16,
    old_master_crc: u16,
    old_slave_crc: u16,
    master_seq_no: u16,
    slave_seq_no: u16,

    // Incoming metadata stream of the current handshake phase, echoed back
    // chunk by chunk.
    meta: [u8; META_MAX],
    meta_len: usize,
    meta_recv: usize,
    meta_echoed: usize,

    /// Watchdog timeout accepted in the Parameter phase; 0 while the
    /// connection has not been parameterized.
    watchdog_timeout_ms: u16,

    process_data_enabled: bool,
    reset_requested: bool,
    process_data_received: bool,
    safe_outputs: [u8; PROCESS_DATA_MAX_SIZE],

    watchdog: Watchdog,
    channel: BlackChannel<A>,
}

impl<A: FsoeApp> Slave<A> {
    /// Build a slave from a validated configuration.
    ///
    /// The machine starts in Reset and stays there silently until a master
    /// opens a session.
    pub fn new(cfg: SlaveConfig, mut app: A) -> Result<Self, ApiError> {
        if let Err(err) = cfg.validate() {
            app.handle_user_error(UserError::BadConfiguration);
            return Err(err.into());
        }

        Ok(Self {
            slave_address: cfg.slave_address,
            expected_app_len: cfg.application_parameters_size,
            inputs_size: cfg.inputs_size,
            outputs_size: cfg.outputs_size,
            state: ConnState::Reset,
            session_id: 0,
            master_session_id: 0,
            master_session_rx: [0; SESSION_ID_SIZE],
            session_rx: 0,
            session_tx: 0,
            conn_id: 0,
            last_crc: 0,
            old_master_crc: 0,
            old_slave_crc: 0,
            master_seq_no: 0,
            slave_seq_no: 0,
            meta: [0; META_MAX],
            meta_len: 0,
            meta_recv: 0,
            meta_echoed: 0,
            watchdog_timeout_ms: 0,
            process_data_enabled: false,
            reset_requested: false,
            process_data_received: false,
            safe_outputs: [0; PROCESS_DATA_MAX_SIZE],
            watchdog: Watchdog::new(),
            channel: BlackChannel::new(app, cfg.outputs_size),
        })
    }

    /// Run one protocol cycle.
    pub fn sync_with_master(
        &mut self,
        inputs: &[u8],
        outputs: &mut [u8],
    ) -> Result<SyncStatus, ApiError> {
        if inputs.len() != self.inputs_size || outputs.len() != self.outputs_size {
            self.channel
                .app_mut()
                .handle_user_error(UserError::BufferSizeMismatch);
            return Err(ApiError::BufferSize);
        }

        let mut status = SyncStatus::quiet(self.state, false);

        if self.reset_requested {
            self.reset_requested = false;
            debug!("local reset requested");
            self.send_reset_frame(ResetReason::LocalReset);
            self.enter_reset(&mut status, ResetEvent::BySlave, ResetReason::LocalReset);
        } else if let Some(received) = self.channel.poll() {
            self.handle_frame(&received, inputs, &mut status);
        } else {
            let now = self.channel.app_mut().now_ms();
            if self.watchdog.is_expired(now) {
                warn!("watchdog expired waiting for master");
                self.send_reset_frame(ResetReason::WdExpired);
                self.enter_reset(&mut status, ResetEvent::BySlave, ResetReason::WdExpired);
            }
        }

        outputs.copy_from_slice(&self.safe_outputs[..self.outputs_size]);
        status.is_process_data_received = self.process_data_received;
        status.current_state = self.state;
        Ok(status)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Session ID generated by this slave, available from Session state.
    pub fn slave_session_id(&mut self) -> Result<u16, ApiError> {
        if self.state < ConnState::Session {
            self.channel
                .app_mut()
                .handle_user_error(UserError::WrongInstanceState);
            return Err(ApiError::WrongState);
        }
        Ok(self.session_id)
    }

    /// Session ID received from the master, available from Connection
    /// state.
    pub fn master_session_id(&mut self) -> Result<u16, ApiError> {
        if self.state < ConnState::Connection {
            self.channel
                .app_mut()
                .handle_user_error(UserError::WrongInstanceState);
            return Err(ApiError::WrongState);
        }
        Ok(self.master_session_id)
    }

    /// Connection ID learned from the master, available once the
    /// addressing block has been received in full.
    pub fn connection_id(&mut self) -> Result<u16, ApiError> {
        if self.state < ConnState::Parameter {
            self.channel
                .app_mut()
                .handle_user_error(UserError::WrongInstanceState);
            return Err(ApiError::WrongState);
        }
        Ok(self.conn_id)
    }

    /// Whether the host currently allows live process data inputs.
    pub fn process_data_sending_enabled(&self) -> bool {
        self.process_data_enabled
    }

    /// Allow live process data inputs once Data state is reached. Cleared
    /// again by any reset event.
    pub fn enable_process_data_sending(&mut self) {
        self.process_data_enabled = true;
    }

    /// Fall back to fail-safe inputs (all zeros).
    pub fn disable_process_data_sending(&mut self) {
        self.process_data_enabled = false;
    }

    /// Request a connection reset; the next `sync` sends
    /// `Reset(local reset)` and returns to Reset state.
    pub fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    /// Milliseconds until the watchdog expires, `u32::MAX` while stopped.
    pub fn time_until_timeout_ms(&mut self) -> u32 {
        let now = self.channel.app_mut().now_ms();
        self.watchdog.remaining_ms(now)
    }

    pub fn app(&self) -> &A {
        self.channel.app()
    }

    pub fn app_mut(&mut self) -> &mut A {
        self.channel.app_mut()
    }

    fn handle_frame(&mut self, received: &Frame, inputs: &[u8], status: &mut SyncStatus) {
        let Some(cmd) = Command::from_byte(received.as_slice()[0]) else {
            self.protocol_fault(ResetReason::UnknownCmd, status);
            return;
        };

        if cmd == Command::Reset {
            match frame::decode(received.as_slice(), self.outputs_size, &CrcContext::default(), None)
            {
                Ok(decoded) => {
                    let reason = ResetReason::from_code(decoded.data()[0]);
                    warn!(%reason, "connection reset by master");
                    self.enter_reset(status, ResetEvent::ByMaster, reason);
                }
                Err(_) => self.protocol_fault(ResetReason::InvalidCrc, status),
            }
            return;
        }

        // A session opens from Reset on the first Session frame; the
        // binding state must exist before the frame can be verified.
        if self.state == ConnState::Reset {
            if cmd != Command::Session {
                self.protocol_fault(ResetReason::InvalidCmd, status);
                return;
            }
            self.init_session();
        }

        let allowed = match self.state {
            ConnState::Reset => false,
            ConnState::Session => matches!(cmd, Command::Session | Command::Connection),
            ConnState::Connection => matches!(cmd, Command::Connection | Command::Parameter),
            ConnState::Parameter => cmd == Command::Parameter || cmd.is_data(),
            ConnState::Data => cmd.is_data(),
        };
        if !allowed {
            warn!(?cmd, state = %self.state, "command not valid in current state");
            self.protocol_fault(ResetReason::InvalidCmd, status);
            return;
        }

        // Phase transitions ride on the first frame of the next phase and
        // are only legal once the current phase has fully completed.
        let transition_ok = match (self.state, cmd) {
            (ConnState::Session, Command::Connection) => {
                if self.session_rx == SESSION_ID_SIZE && self.session_tx == SESSION_ID_SIZE {
                    self.master_session_id = u16::from_le_bytes(self.master_session_rx);
                    self.set_state(ConnState::Connection);
                    self.load_meta_expectation(CONN_DATA_SIZE);
                    true
                } else {
                    false
                }
            }
            (ConnState::Connection, Command::Parameter) => {
                if self.meta_recv == self.meta_len && self.meta_echoed == self.meta_len {
                    self.set_state(ConnState::Parameter);
                    self.load_meta_expectation(SAFE_PARA_HEADER_SIZE + self.expected_app_len);
                    true
                } else {
                    false
                }
            }
            (ConnState::Parameter, Command::FailSafeData | Command::ProcessData) => {
                if self.meta_recv == self.meta_len
                    && self.meta_echoed == self.meta_len
                    && self.watchdog_timeout_ms != 0
                {
                    self.set_state(ConnState::Data);
                    true
                } else {
                    false
                }
            }
            _ => true,
        };
        if !transition_ok {
            warn!(?cmd, state = %self.state, "phase advanced before completion");
            self.protocol_fault(ResetReason::InvalidCmd, status);
            return;
        }

        let ctx = CrcContext {
            last_crc: self.last_crc,
            old_crc: self.old_master_crc,
            seq_no: self.master_seq_no,
            conn_id: 0, // decode substitutes the received trailer
            peer_session_id: self.rx_peer_session_id(cmd),
        };
        let expected_conn = (self.conn_id != 0).then_some(self.conn_id);
        let decoded =
            match frame::decode(received.as_slice(), self.outputs_size, &ctx, expected_conn) {
                Ok(decoded) => decoded,
                Err(frame::FrameError::ConnIdMismatch { expected, got }) => {
                    warn!(expected, got, "unexpected connection ID from master");
                    self.protocol_fault(ResetReason::InvalidConnId, status);
                    return;
                }
                Err(err) => {
                    warn!(%err, "frame rejected");
                    self.protocol_fault(ResetReason::InvalidCrc, status);
                    return;
                }
            };

        // Frame accepted; advance the chain before acting on the content.
        self.last_crc = decoded.final_crc;
        self.old_master_crc = decoded.final_crc;
        self.master_seq_no = next_seq_no(self.master_seq_no);

        match cmd {
            Command::Session => self.continue_session(&decoded),
            Command::Connection | Command::Parameter => {
                self.continue_meta_phase(cmd, &decoded, status)
            }
            _ => self.continue_data(&decoded, inputs),
        }
    }

    fn load_meta_expectation(&mut self, len: usize) {
        self.meta_len = len;
        self.meta_recv = 0;
        self.meta_echoed = 0;
    }

    fn init_session(&mut self) {
        self.session_id = self.channel.app_mut().generate_session_id();
        self.master_session_id = 0;
        self.master_session_rx = [0; SESSION_ID_SIZE];
        self.session_rx = 0;
        self.session_tx = 0;
        self.conn_id = 0;
        self.watchdog_timeout_ms = 0;
        self.last_crc = 0;
        self.old_master_crc = 0;
        self.old_slave_crc = 0;
        self.master_seq_no = 1;
        self.slave_seq_no = 1;
        self.meta_len = 0;
        self.meta_recv = 0;
        self.meta_echoed = 0;
        self.set_state(ConnState::Session);
    }

    /// Session phase: collect the master's session ID and answer each
    /// frame with the next chunk of our own.
    fn continue_session(&mut self, decoded: &frame::DecodedFrame) {
        let wanted = SESSION_ID_SIZE - self.session_rx;
        let chunk = wanted.min(self.outputs_size);
        self.master_session_rx[self.session_rx..self.session_rx + chunk]
            .copy_from_slice(&decoded.data()[..chunk]);
        self.session_rx += chunk;

        let id_bytes = self.session_id.to_le_bytes();
        let offset = if self.session_tx < SESSION_ID_SIZE {
            self.session_tx
        } else {
            // The master is prompting for bytes it already has; repeat the
            // final chunk.
            SESSION_ID_SIZE.saturating_sub(self.inputs_size)
        };
        let chunk = (SESSION_ID_SIZE - offset).min(self.inputs_size);
        let mut payload = [0u8; PROCESS_DATA_MAX_SIZE];
        payload[..chunk].copy_from_slice(&id_bytes[offset..offset + chunk]);
        self.session_tx = (offset + chunk).max(self.session_tx);
        self.transmit(Command::Session, &payload[..self.inputs_size]);
    }

    /// Connection and Parameter phases: accumulate the master's stream and
    /// echo it back chunk by chunk.
    fn continue_meta_phase(
        &mut self,
        cmd: Command,
        decoded: &frame::DecodedFrame,
        status: &mut SyncStatus,
    ) {
        let wanted = self.meta_len - self.meta_recv;
        let chunk = wanted.min(self.outputs_size);
        self.meta[self.meta_recv..self.meta_recv + chunk]
            .copy_from_slice(&decoded.data()[..chunk]);
        self.meta_recv += chunk;

        if cmd == Command::Connection && self.conn_id == 0 && self.meta_recv >= 2 {
            self.conn_id = u16::from_le_bytes([self.meta[0], self.meta[1]]);
        }

        // Validation happens once the stream is complete, before the final
        // echo goes out: a refused block is answered with Reset instead.
        if chunk > 0 && self.meta_recv == self.meta_len {
            let accepted = match cmd {
                Command::Connection => self.check_connection_data(status),
                _ => self.check_parameters(status),
            };
            if !accepted {
                return;
            }
        }

        let echo = (self.meta_recv - self.meta_echoed).min(self.inputs_size);
        let mut payload = [0u8; PROCESS_DATA_MAX_SIZE];
        payload[..echo].copy_from_slice(&self.meta[self.meta_echoed..self.meta_echoed + echo]);
        self.meta_echoed += echo;
        self.transmit(cmd, &payload[..self.inputs_size]);
    }

    fn check_connection_data(&mut self, status: &mut SyncStatus) -> bool {
        let mut block = [0u8; CONN_DATA_SIZE];
        block.copy_from_slice(&self.meta[..CONN_DATA_SIZE]);
        let conn_data = ConnectionData::from_bytes(block);
        if conn_data.slave_address != self.slave_address {
            warn!(
                got = conn_data.slave_address,
                own = self.slave_address,
                "connection frame addresses a different slave"
            );
            self.protocol_fault(ResetReason::InvalidAddress, status);
            return false;
        }
        true
    }

    fn check_parameters(&mut self, status: &mut SyncStatus) -> bool {
        let para = match SafeParameters::parse(&self.meta[..self.meta_len], self.expected_app_len) {
            Ok(para) => para,
            Err(SafeParaError::CommParamSize(_)) => {
                self.protocol_fault(ResetReason::InvalidCommParamLength, status);
                return false;
            }
            Err(SafeParaError::AppParamSize { .. }) => {
                self.protocol_fault(ResetReason::InvalidAppParamLength, status);
                return false;
            }
        };

        if para.watchdog_timeout_ms == 0 {
            self.protocol_fault(ResetReason::InvalidCommParam, status);
            return false;
        }

        let verdict = self
            .channel
            .app_mut()
            .verify_parameters(para.watchdog_timeout_ms, para.app_parameters());
        let rejection = match verdict {
            ParameterVerdict::Accepted => None,
            ParameterVerdict::BadWatchdog => Some(ResetReason::InvalidCommParam),
            ParameterVerdict::BadAppParamLength => Some(ResetReason::InvalidAppParamLength),
            ParameterVerdict::BadAppParam => Some(ResetReason::InvalidAppParam),
            ParameterVerdict::DeviceSpecific(code @ 0x80..=0xFF) => {
                Some(ResetReason::Device(code))
            }
            ParameterVerdict::DeviceSpecific(code) => {
                warn!(code, "device-specific code outside 0x80..=0xFF, using generic");
                Some(ResetReason::InvalidAppParam)
            }
        };
        if let Some(reason) = rejection {
            warn!(%reason, "parameters refused");
            self.protocol_fault(reason, status);
            return false;
        }

        self.watchdog_timeout_ms = para.watchdog_timeout_ms;
        let now = self.channel.app_mut().now_ms();
        self.watchdog.start(self.watchdog_timeout_ms, now);
        debug!(
            watchdog_ms = self.watchdog_timeout_ms,
            "parameters accepted"
        );
        true
    }

    /// Data phase: take over the master's outputs and answer with our own
    /// inputs frame.
    fn continue_data(&mut self, decoded: &frame::DecodedFrame, inputs: &[u8]) {
        if decoded.command == Command::ProcessData {
            self.safe_outputs[..self.outputs_size].copy_from_slice(decoded.data());
            self.process_data_received = true;
        } else {
            self.safe_outputs = [0; PROCESS_DATA_MAX_SIZE];
            self.process_data_received = false;
        }

        let mut payload = [0u8; PROCESS_DATA_MAX_SIZE];
        let cmd = if self.process_data_enabled {
            payload[..self.inputs_size].copy_from_slice(inputs);
            Command::ProcessData
        } else {
            Command::FailSafeData
        };
        self.transmit(cmd, &payload[..self.inputs_size]);
    }

    fn transmit(&mut self, cmd: Command, payload: &[u8]) {
        let ctx = CrcContext {
            last_crc: self.last_crc,
            old_crc: self.old_slave_crc,
            seq_no: self.slave_seq_no,
            conn_id: self.tx_conn_id(cmd),
            peer_session_id: self.tx_peer_session_id(cmd),
        };
        let (frame, final_crc) = frame::encode(cmd, payload, &ctx);
        self.channel.send_frame(&frame);
        self.last_crc = final_crc;
        self.old_slave_crc = final_crc;
        self.slave_seq_no = next_seq_no(self.slave_seq_no);
        let now = self.channel.app_mut().now_ms();
        self.watchdog.kick(now);
    }

    fn tx_conn_id(&self, cmd: Command) -> u16 {
        match cmd {
            Command::Session => 0,
            _ => self.conn_id,
        }
    }

    fn tx_peer_session_id(&self, cmd: Command) -> u16 {
        match cmd {
            Command::Session => 0,
            _ => self.master_session_id,
        }
    }

    fn rx_peer_session_id(&self, cmd: Command) -> u16 {
        match cmd {
            Command::Session => 0,
            _ => self.session_id,
        }
    }

    fn send_reset_frame(&mut self, reason: ResetReason) {
        let mut payload = [0u8; PROCESS_DATA_MAX_SIZE];
        payload[0] = reason.code();
        let ctx = CrcContext {
            conn_id: self.conn_id,
            ..CrcContext::default()
        };
        let (frame, _) = frame::encode(Command::Reset, &payload[..self.inputs_size], &ctx);
        self.channel.send_frame(&frame);
    }

    fn protocol_fault(&mut self, reason: ResetReason, status: &mut SyncStatus) {
        warn!(%reason, "protocol fault, resetting connection");
        self.send_reset_frame(reason);
        self.enter_reset(status, ResetEvent::BySlave, reason);
    }

    fn enter_reset(&mut self, status: &mut SyncStatus, event: ResetEvent, reason: ResetReason) {
        self.set_state(ConnState::Reset);
        self.watchdog.stop();
        self.process_data_enabled = false;
        self.process_data_received = false;
        self.safe_outputs = [0; PROCESS_DATA_MAX_SIZE];
        self.channel.clear_history();
        status.reset_event = event;
        status.reset_reason = reason;
    }

    fn set_state(&mut self, state: ConnState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "state transition");
            self.state = state;
        }
    }
}
