//! FSoE master state machine.
//!
//! A master drives the connection with a single slave: it resets the link,
//! exchanges session IDs, pushes the connection addressing and the
//! parameter block, verifies the slave's echoes, and then cycles process
//! data. One instance handles one slave; multiple instances with distinct
//! connection IDs may coexist, each owning its black channel.
//!
//! The host calls [`Master::sync_with_slave`] periodically (no slower than
//! half the watchdog timeout). Each call receives at most one frame,
//! advances the state machine and transmits at most one frame. Outputs
//! carry live process data only while the host has enabled sending and no
//! fault is pending; otherwise fail-safe zeros are sent.

use tracing::{debug, warn};

use crate::app::{ApiError, FsoeApp, UserError};
use crate::channel::BlackChannel;
use crate::config::MasterConfig;
use crate::crc::{CrcContext, next_seq_no};
use crate::frame::{self, Command, Frame, PROCESS_DATA_MAX_SIZE};
use crate::params::{
    APP_PARAMETERS_MAX_SIZE, ConnectionData, SAFE_PARA_HEADER_SIZE, SafeParameters,
};
use crate::status::{ConnState, ResetEvent, ResetReason, SyncStatus};
use crate::watchdog::Watchdog;

const META_MAX: usize = SAFE_PARA_HEADER_SIZE + APP_PARAMETERS_MAX_SIZE;

/// Session ID length on the wire.
const SESSION_ID_SIZE: usize = 2;

/// FSoE master state machine.
pub struct Master<A> {
    // Fixed at construction.
    conn_id: u16,
    slave_address: u16,
    outputs_size: usize,
    inputs_size: usize,
    watchdog_timeout_ms: u16,
    safe_para: SafeParameters,

    state: ConnState,

    // Session binding (ETG.5100 table 32 variables).
    session_id: u16,
    slave_session_id: u16,
    slave_session_rx: [u8; SESSION_ID_SIZE],
    last_crc: u16,
    old_master_crc: u16,
    old_slave_crc: u16,
    master_seq_no: u16,
    slave_seq_no: u16,

    // Outgoing metadata stream of the current handshake phase. In the
    // Session phase `acked` counts received slave session ID bytes; in the
    // echo phases it counts verified echo bytes.
    meta: [u8; META_MAX],
    meta_len: usize,
    meta_sent: usize,
    meta_acked: usize,
    last_chunk_start: usize,

    process_data_enabled: bool,
    reset_requested: bool,
    process_data_received: bool,
    safe_inputs: [u8; PROCESS_DATA_MAX_SIZE],

    watchdog: Watchdog,
    channel: BlackChannel<A>,
}

impl<A: FsoeApp> Master<A> {
    /// Build a master from a validated configuration.
    ///
    /// The machine starts in Reset with a pending local reset: the first
    /// `sync` sends `Reset(local reset)` to the slave and reports it, the
    /// second begins the session handshake.
    pub fn new(cfg: MasterConfig<'_>, mut app: A) -> Result<Self, ApiError> {
        if let Err(err) = cfg.validate() {
            app.handle_user_error(UserError::BadConfiguration);
            return Err(err.into());
        }

        Ok(Self {
            conn_id: cfg.connection_id,
            slave_address: cfg.slave_address,
            outputs_size: cfg.outputs_size,
            inputs_size: cfg.inputs_size,
            watchdog_timeout_ms: cfg.watchdog_timeout_ms,
            safe_para: SafeParameters::new(cfg.watchdog_timeout_ms, cfg.application_parameters),
            state: ConnState::Reset,
            session_id: 0,
            slave_session_id: 0,
            slave_session_rx: [0; SESSION_ID_SIZE],
            last_crc: 0,
            old_master_crc: 0,
            old_slave_crc: 0,
            master_seq_no: 0,
            slave_seq_no: 0,
            meta: [0; META_MAX],
            meta_len: 0,
            meta_sent: 0,
            meta_acked: 0,
            last_chunk_start: 0,
            process_data_enabled: false,
            reset_requested: true,
            process_data_received: false,
            safe_inputs: [0; PROCESS_DATA_MAX_SIZE],
            watchdog: Watchdog::new(),
            channel: BlackChannel::new(app, cfg.inputs_size),
        })
    }

    /// Run one protocol cycle.
    ///
    /// `outputs` is the process data to offer the slave this cycle (sent
    /// only while sending is enabled and the connection is in Data state);
    /// `inputs` receives the slave's process data, or zeros while no valid
    /// process data is held. Both must match the configured sizes.
    pub fn sync_with_slave(
        &mut self,
        outputs: &[u8],
        inputs: &mut [u8],
    ) -> Result<SyncStatus, ApiError> {
        if outputs.len() != self.outputs_size || inputs.len() != self.inputs_size {
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
            self.enter_reset(&mut status, ResetEvent::ByMaster, ResetReason::LocalReset);
        } else if self.state == ConnState::Reset {
            self.begin_session();
        } else if let Some(received) = self.channel.poll() {
            self.handle_frame(&received, outputs, &mut status);
        } else {
            let now = self.channel.app_mut().now_ms();
            if self.watchdog.is_expired(now) {
                warn!("watchdog expired waiting for slave");
                self.send_reset_frame(ResetReason::WdExpired);
                self.enter_reset(&mut status, ResetEvent::ByMaster, ResetReason::WdExpired);
            }
        }

        inputs.copy_from_slice(&self.safe_inputs[..self.inputs_size]);
        status.is_process_data_received = self.process_data_received;
        status.current_state = self.state;
        Ok(status)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Session ID generated by this master, available from Session state.
    pub fn master_session_id(&mut self) -> Result<u16, ApiError> {
        if self.state < ConnState::Session {
            self.channel
                .app_mut()
                .handle_user_error(UserError::WrongInstanceState);
            return Err(ApiError::WrongState);
        }
        Ok(self.session_id)
    }

    /// Session ID received from the slave, available from Connection state.
    pub fn slave_session_id(&mut self) -> Result<u16, ApiError> {
        if self.state < ConnState::Connection {
            self.channel
                .app_mut()
                .handle_user_error(UserError::WrongInstanceState);
            return Err(ApiError::WrongState);
        }
        Ok(self.slave_session_id)
    }

    /// Whether the host currently allows live process data outputs.
    pub fn process_data_sending_enabled(&self) -> bool {
        self.process_data_enabled
    }

    /// Allow live process data outputs once Data state is reached.
    ///
    /// Any reset event clears the flag again; re-enabling after a fault is
    /// the host's explicit decision.
    pub fn enable_process_data_sending(&mut self) {
        self.process_data_enabled = true;
    }

    /// Fall back to fail-safe outputs (all zeros).
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

    fn begin_session(&mut self) {
        self.session_id = self.channel.app_mut().generate_session_id();
        self.slave_session_id = 0;
        self.slave_session_rx = [0; SESSION_ID_SIZE];
        self.last_crc = 0;
        self.old_master_crc = 0;
        self.old_slave_crc = 0;
        self.master_seq_no = 1;
        self.slave_seq_no = 1;
        self.channel.clear_history();
        self.set_state(ConnState::Session);

        let id_bytes = self.session_id.to_le_bytes();
        self.load_meta(&id_bytes);
        self.send_meta_chunk(Command::Session);
    }

    fn handle_frame(&mut self, received: &Frame, outputs: &[u8], status: &mut SyncStatus) {
        let Some(cmd) = Command::from_byte(received.as_slice()[0]) else {
            self.protocol_fault(ResetReason::UnknownCmd, status);
            return;
        };

        if cmd == Command::Reset {
            match frame::decode(received.as_slice(), self.inputs_size, &CrcContext::default(), None)
            {
                Ok(decoded) => {
                    let reason = ResetReason::from_code(decoded.data()[0]);
                    warn!(%reason, "connection reset by slave");
                    self.enter_reset(status, ResetEvent::BySlave, reason);
                }
                Err(_) => self.protocol_fault(ResetReason::InvalidCrc, status),
            }
            return;
        }

        let allowed = match self.state {
            ConnState::Reset => false,
            ConnState::Session => cmd == Command::Session,
            ConnState::Connection => cmd == Command::Connection,
            ConnState::Parameter => cmd == Command::Parameter,
            ConnState::Data => cmd.is_data(),
        };
        if !allowed {
            warn!(?cmd, state = %self.state, "command not valid in current state");
            self.protocol_fault(ResetReason::InvalidCmd, status);
            return;
        }

        let ctx = CrcContext {
            last_crc: self.last_crc,
            old_crc: self.old_slave_crc,
            seq_no: self.slave_seq_no,
            conn_id: 0, // decode substitutes the received trailer
            peer_session_id: self.rx_peer_session_id(cmd),
        };
        let decoded =
            match frame::decode(received.as_slice(), self.inputs_size, &ctx, self.expected_conn_id())
            {
                Ok(decoded) => decoded,
                Err(frame::FrameError::ConnIdMismatch { expected, got }) => {
                    warn!(expected, got, "unexpected connection ID from slave");
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
        self.old_slave_crc = decoded.final_crc;
        self.slave_seq_no = next_seq_no(self.slave_seq_no);

        match cmd {
            Command::Session => self.continue_session(&decoded),
            Command::Connection | Command::Parameter => {
                self.continue_echo_phase(cmd, &decoded, outputs, status)
            }
            _ => self.continue_data(&decoded, outputs),
        }
    }

    /// Session phase: collect the slave's session ID while transmitting
    /// our own, then move on to the Connection phase.
    fn continue_session(&mut self, decoded: &frame::DecodedFrame) {
        let wanted = SESSION_ID_SIZE - self.meta_acked;
        let chunk = wanted.min(self.inputs_size);
        self.slave_session_rx[self.meta_acked..self.meta_acked + chunk]
            .copy_from_slice(&decoded.data()[..chunk]);
        self.meta_acked += chunk;

        if self.meta_sent < self.meta_len {
            self.send_meta_chunk(Command::Session);
        } else if self.meta_acked < SESSION_ID_SIZE {
            self.resend_last_chunk(Command::Session);
        } else {
            self.slave_session_id = u16::from_le_bytes(self.slave_session_rx);
            self.set_state(ConnState::Connection);
            let conn_data = ConnectionData {
                conn_id: self.conn_id,
                slave_address: self.slave_address,
            }
            .to_bytes();
            self.load_meta(&conn_data);
            self.send_meta_chunk(Command::Connection);
        }
    }

    /// Connection and Parameter phases: the slave must echo every byte we
    /// sent; a divergent echo is a fault, a complete echo advances the
    /// phase.
    fn continue_echo_phase(
        &mut self,
        cmd: Command,
        decoded: &frame::DecodedFrame,
        outputs: &[u8],
        status: &mut SyncStatus,
    ) {
        let owed = self.meta_sent - self.meta_acked;
        let chunk = owed.min(self.inputs_size);
        if decoded.data()[..chunk] != self.meta[self.meta_acked..self.meta_acked + chunk] {
            warn!(state = %self.state, "slave echo differs from sent data");
            self.protocol_fault(ResetReason::InvalidData, status);
            return;
        }
        self.meta_acked += chunk;

        if self.meta_sent < self.meta_len {
            self.send_meta_chunk(cmd);
        } else if self.meta_acked < self.meta_len {
            self.resend_last_chunk(cmd);
        } else if self.state == ConnState::Connection {
            self.set_state(ConnState::Parameter);
            let mut block = [0u8; META_MAX];
            let len = self.safe_para.encoded_len();
            self.safe_para.write(&mut block[..len]);
            self.load_meta(&block[..len]);
            self.send_meta_chunk(Command::Parameter);
        } else {
            self.set_state(ConnState::Data);
            self.send_data_frame(outputs);
        }
    }

    /// Data phase: every slave frame both delivers inputs and triggers the
    /// next outputs frame.
    fn continue_data(&mut self, decoded: &frame::DecodedFrame, outputs: &[u8]) {
        if decoded.command == Command::ProcessData {
            self.safe_inputs[..self.inputs_size].copy_from_slice(decoded.data());
            self.process_data_received = true;
        } else {
            self.safe_inputs = [0; PROCESS_DATA_MAX_SIZE];
            self.process_data_received = false;
        }
        self.send_data_frame(outputs);
    }

    fn send_data_frame(&mut self, outputs: &[u8]) {
        let mut payload = [0u8; PROCESS_DATA_MAX_SIZE];
        let cmd = if self.process_data_enabled {
            payload[..self.outputs_size].copy_from_slice(outputs);
            Command::ProcessData
        } else {
            Command::FailSafeData
        };
        self.transmit(cmd, &payload[..self.outputs_size]);
    }

    fn load_meta(&mut self, stream: &[u8]) {
        self.meta[..stream.len()].copy_from_slice(stream);
        self.meta_len = stream.len();
        self.meta_sent = 0;
        self.meta_acked = 0;
        self.last_chunk_start = 0;
    }

    fn send_meta_chunk(&mut self, cmd: Command) {
        let chunk = (self.meta_len - self.meta_sent).min(self.outputs_size);
        let mut payload = [0u8; PROCESS_DATA_MAX_SIZE];
        payload[..chunk].copy_from_slice(&self.meta[self.meta_sent..self.meta_sent + chunk]);
        self.last_chunk_start = self.meta_sent;
        self.meta_sent += chunk;
        self.transmit(cmd, &payload[..self.outputs_size]);
    }

    /// Re-transmit the previous chunk to prompt the slave for outstanding
    /// session or echo bytes; needed when the slave's frames carry fewer
    /// data bytes than ours.
    fn resend_last_chunk(&mut self, cmd: Command) {
        let chunk = (self.meta_len - self.last_chunk_start).min(self.outputs_size);
        let mut payload = [0u8; PROCESS_DATA_MAX_SIZE];
        payload[..chunk]
            .copy_from_slice(&self.meta[self.last_chunk_start..self.last_chunk_start + chunk]);
        self.transmit(cmd, &payload[..self.outputs_size]);
    }

    fn transmit(&mut self, cmd: Command, payload: &[u8]) {
        let ctx = CrcContext {
            last_crc: self.last_crc,
            old_crc: self.old_master_crc,
            seq_no: self.master_seq_no,
            conn_id: self.tx_conn_id(cmd),
            peer_session_id: self.tx_peer_session_id(cmd),
        };
        let (frame, final_crc) = frame::encode(cmd, payload, &ctx);
        self.channel.send_frame(&frame);
        self.last_crc = final_crc;
        self.old_master_crc = final_crc;
        self.master_seq_no = next_seq_no(self.master_seq_no);
        let now = self.channel.app_mut().now_ms();
        self.watchdog.start(self.watchdog_timeout_ms, now);
    }

    /// Connection ID carried in outgoing trailers: zero until the
    /// Connection phase makes the ID known to the slave.
    fn tx_conn_id(&self, cmd: Command) -> u16 {
        match cmd {
            Command::Session => 0,
            Command::Reset if self.state < ConnState::Connection => 0,
            _ => self.conn_id,
        }
    }

    /// Session frames travel before either side knows both IDs, so they
    /// are computed with a zero peer session ID on both sides; the random
    /// IDs still bind them through the data bytes and the CRC chain.
    fn tx_peer_session_id(&self, cmd: Command) -> u16 {
        match cmd {
            Command::Session => 0,
            _ => self.slave_session_id,
        }
    }

    fn rx_peer_session_id(&self, cmd: Command) -> u16 {
        match cmd {
            Command::Session => 0,
            _ => self.session_id,
        }
    }

    /// Expected trailer of slave frames: enforced once the slave has had
    /// the chance to learn the connection ID (both ID bytes delivered).
    fn expected_conn_id(&self) -> Option<u16> {
        match self.state {
            ConnState::Reset | ConnState::Session => None,
            ConnState::Connection if self.meta_sent < 2 => None,
            _ => Some(self.conn_id),
        }
    }

    fn send_reset_frame(&mut self, reason: ResetReason) {
        let mut payload = [0u8; PROCESS_DATA_MAX_SIZE];
        payload[0] = reason.code();
        let ctx = CrcContext {
            conn_id: self.tx_conn_id(Command::Reset),
            ..CrcContext::default()
        };
        let (frame, _) = frame::encode(Command::Reset, &payload[..self.outputs_size], &ctx);
        self.channel.send_frame(&frame);
    }

    fn protocol_fault(&mut self, reason: ResetReason, status: &mut SyncStatus) {
        warn!(%reason, "protocol fault, resetting connection");
        self.send_reset_frame(reason);
        self.enter_reset(status, ResetEvent::ByMaster, reason);
    }

    fn enter_reset(&mut self, status: &mut SyncStatus, event: ResetEvent, reason: ResetReason) {
        self.set_state(ConnState::Reset);
        self.watchdog.stop();
        self.process_data_enabled = false;
        self.process_data_received = false;
        self.safe_inputs = [0; PROCESS_DATA_MAX_SIZE];
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
