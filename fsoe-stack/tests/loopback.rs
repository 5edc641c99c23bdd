//! End-to-end scenarios driving a real master and slave over an in-memory
//! black channel with a manually advanced clock.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use fsoe_stack::{
    ConnState, FsoeApp, Master, MasterConfig, ParameterVerdict, ResetEvent, ResetReason, Slave,
    SlaveConfig, SyncStatus,
};

/// Shared in-memory wire: one queue per direction plus the test clock.
#[derive(Default)]
struct Wire {
    master_to_slave: VecDeque<Vec<u8>>,
    slave_to_master: VecDeque<Vec<u8>>,
    now_ms: u32,
}

type SharedWire = Rc<RefCell<Wire>>;

struct MasterApp {
    wire: SharedWire,
    next_session_id: u16,
}

impl FsoeApp for MasterApp {
    fn send(&mut self, frame: &[u8]) {
        self.wire
            .borrow_mut()
            .master_to_slave
            .push_back(frame.to_vec());
    }

    fn recv(&mut self, frame: &mut [u8]) -> usize {
        match self.wire.borrow_mut().slave_to_master.pop_front() {
            Some(bytes) => {
                frame[..bytes.len()].copy_from_slice(&bytes);
                bytes.len()
            }
            None => 0,
        }
    }

    fn generate_session_id(&mut self) -> u16 {
        self.next_session_id = self.next_session_id.wrapping_mul(31421).wrapping_add(6927);
        self.next_session_id
    }

    fn now_ms(&mut self) -> u32 {
        self.wire.borrow().now_ms
    }
}

struct SlaveApp {
    wire: SharedWire,
    next_session_id: u16,
    verdict: ParameterVerdict,
    verified: Vec<(u16, Vec<u8>)>,
}

impl FsoeApp for SlaveApp {
    fn send(&mut self, frame: &[u8]) {
        self.wire
            .borrow_mut()
            .slave_to_master
            .push_back(frame.to_vec());
    }

    fn recv(&mut self, frame: &mut [u8]) -> usize {
        match self.wire.borrow_mut().master_to_slave.pop_front() {
            Some(bytes) => {
                frame[..bytes.len()].copy_from_slice(&bytes);
                bytes.len()
            }
            None => 0,
        }
    }

    fn generate_session_id(&mut self) -> u16 {
        self.next_session_id = self.next_session_id.wrapping_mul(48271).wrapping_add(557);
        self.next_session_id
    }

    fn now_ms(&mut self) -> u32 {
        self.wire.borrow().now_ms
    }

    fn verify_parameters(&mut self, watchdog_timeout_ms: u16, app_params: &[u8]) -> ParameterVerdict {
        self.verified.push((watchdog_timeout_ms, app_params.to_vec()));
        self.verdict
    }
}

struct Link {
    wire: SharedWire,
    master: Master<MasterApp>,
    slave: Slave<SlaveApp>,
    data_size: usize,
}

impl Link {
    fn new(data_size: usize) -> Self {
        Self::with_slave_address(data_size, 0x0304)
    }

    fn with_slave_address(data_size: usize, slave_address: u16) -> Self {
        let wire = SharedWire::default();
        let master = Master::new(
            MasterConfig {
                slave_address: 0x0304,
                connection_id: 0x0008,
                watchdog_timeout_ms: 100,
                application_parameters: &[],
                outputs_size: data_size,
                inputs_size: data_size,
            },
            MasterApp {
                wire: wire.clone(),
                next_session_id: 1,
            },
        )
        .unwrap();
        let slave = Slave::new(
            SlaveConfig {
                slave_address,
                application_parameters_size: 0,
                inputs_size: data_size,
                outputs_size: data_size,
            },
            SlaveApp {
                wire: wire.clone(),
                next_session_id: 2,
                verdict: ParameterVerdict::Accepted,
                verified: Vec::new(),
            },
        )
        .unwrap();
        Self {
            wire,
            master,
            slave,
            data_size,
        }
    }

    /// One lockstep cycle: master first, then slave, 10 ms apart in time.
    fn cycle(&mut self, outputs: &[u8], inputs_from_slave: &[u8]) -> (SyncStatus, SyncStatus) {
        self.wire.borrow_mut().now_ms += 10;
        let mut inputs = vec![0u8; self.data_size];
        let mut slave_outputs = vec![0u8; self.data_size];
        let master_status = self.master.sync_with_slave(outputs, &mut inputs).unwrap();
        let slave_status = self
            .slave
            .sync_with_master(inputs_from_slave, &mut slave_outputs)
            .unwrap();
        (master_status, slave_status)
    }

    /// Drive both sides with zero payloads until both reach Data state.
    /// Panics if `limit` cycles pass first.
    fn establish(&mut self, limit: usize) -> usize {
        let zeros = vec![0u8; self.data_size];
        for cycle in 1..=limit {
            self.cycle(&zeros, &zeros);
            if self.master.state() == ConnState::Data && self.slave.state() == ConnState::Data {
                return cycle;
            }
        }
        panic!(
            "no Data state within {limit} cycles (master {:?}, slave {:?})",
            self.master.state(),
            self.slave.state()
        );
    }
}

#[test]
fn cold_startup_reaches_data_within_twelve_cycles() {
    let mut link = Link::new(2);
    let zeros = [0u8; 2];
    let mut master_resets = Vec::new();

    let mut reached = None;
    for cycle in 1..=12 {
        let (master_status, _) = link.cycle(&zeros, &zeros);
        if master_status.reset_event != ResetEvent::None {
            master_resets.push((cycle, master_status.reset_event, master_status.reset_reason));
        }
        if link.master.state() == ConnState::Data && link.slave.state() == ConnState::Data {
            reached = Some(cycle);
            break;
        }
    }

    assert!(reached.is_some(), "both sides must reach Data within 12 cycles");
    assert_eq!(
        master_resets,
        vec![(1, ResetEvent::ByMaster, ResetReason::LocalReset)],
        "exactly one startup reset, reason 0"
    );

    // Subsequent cycles are quiet.
    for _ in 0..5 {
        let (master_status, slave_status) = link.cycle(&zeros, &zeros);
        assert_eq!(master_status.reset_event, ResetEvent::None);
        assert_eq!(slave_status.reset_event, ResetEvent::None);
        assert_eq!(master_status.current_state, ConnState::Data);
        assert_eq!(slave_status.current_state, ConnState::Data);
    }
}

#[test]
fn single_byte_payload_needs_two_session_frames_but_connects() {
    let mut link = Link::new(1);
    let cycles = link.establish(30);
    assert!(cycles <= 27, "liveness bound exceeded: {cycles} cycles");
}

#[test]
fn wide_payload_connects_quickly() {
    // All handshake blocks fit into single frames at 8 bytes per direction.
    let mut link = Link::new(8);
    link.establish(12);
}

#[test]
fn process_data_flows_after_enabling() {
    let mut link = Link::new(2);
    link.establish(12);

    link.master.enable_process_data_sending();
    let outputs = [0x12, 0x34];
    let zeros = [0u8; 2];

    // Master emits ProcessData on its next turn; the slave takes it over.
    let (_, slave_status) = link.cycle(&outputs, &zeros);
    assert!(slave_status.is_process_data_received);

    let mut slave_outputs = [0u8; 2];
    let mut master_inputs = [0u8; 2];
    link.wire.borrow_mut().now_ms += 10;
    link.master
        .sync_with_slave(&outputs, &mut master_inputs)
        .unwrap();
    let status = link
        .slave
        .sync_with_master(&zeros, &mut slave_outputs)
        .unwrap();
    assert!(status.is_process_data_received);
    assert_eq!(slave_outputs, outputs);
}

#[test]
fn inputs_flow_when_slave_enables_sending() {
    let mut link = Link::new(2);
    link.establish(12);
    link.slave.enable_process_data_sending();

    let zeros = [0u8; 2];
    let slave_inputs = [0xAB, 0xCD];

    // Slave answers the next master frame with ProcessData.
    link.cycle(&zeros, &slave_inputs);
    let (master_status, _) = link.cycle(&zeros, &slave_inputs);
    assert!(master_status.is_process_data_received);

    let mut master_inputs = [0u8; 2];
    link.wire.borrow_mut().now_ms += 10;
    link.master
        .sync_with_slave(&zeros, &mut master_inputs)
        .unwrap();
    assert_eq!(master_inputs, slave_inputs);
}

#[test]
fn corrupted_frame_resets_with_invalid_crc() {
    let mut link = Link::new(2);
    link.establish(12);
    link.master.enable_process_data_sending();

    let outputs = [0x12, 0x34];
    let zeros = [0u8; 2];

    // Corrupt bit 0 of byte 3 (the first CRC byte) of the in-flight
    // master frame.
    link.wire.borrow_mut().now_ms += 10;
    let mut master_inputs = [0u8; 2];
    link.master
        .sync_with_slave(&outputs, &mut master_inputs)
        .unwrap();
    {
        let mut wire = link.wire.borrow_mut();
        let frame = wire.master_to_slave.back_mut().expect("frame in flight");
        frame[3] ^= 0x01;
    }

    let mut slave_outputs = [0u8; 2];
    let status = link
        .slave
        .sync_with_master(&zeros, &mut slave_outputs)
        .unwrap();
    assert_eq!(status.reset_event, ResetEvent::BySlave);
    assert_eq!(status.reset_reason, ResetReason::InvalidCrc);
    assert_eq!(slave_outputs, [0, 0], "outputs fall back to fail-safe zeros");
    assert!(!status.is_process_data_received);
}

#[test]
fn every_reset_clears_the_sending_flags() {
    let mut link = Link::new(2);
    link.establish(12);
    link.master.enable_process_data_sending();
    link.slave.enable_process_data_sending();

    // Corrupt a data byte of the next master frame.
    let zeros = [0u8; 2];
    link.wire.borrow_mut().now_ms += 10;
    let mut master_inputs = [0u8; 2];
    link.master
        .sync_with_slave(&[1, 2], &mut master_inputs)
        .unwrap();
    link.wire
        .borrow_mut()
        .master_to_slave
        .back_mut()
        .unwrap()[1] ^= 0x80;

    let mut slave_outputs = [0u8; 2];
    link.slave
        .sync_with_master(&zeros, &mut slave_outputs)
        .unwrap();
    assert!(!link.slave.process_data_sending_enabled());

    // The slave's Reset frame reaches the master in the next cycle.
    let (master_status, _) = link.cycle(&zeros, &zeros);
    assert_eq!(master_status.reset_event, ResetEvent::BySlave);
    assert!(!link.master.process_data_sending_enabled());
}

#[test]
fn withheld_frames_expire_the_slave_watchdog() {
    let mut link = Link::new(2);
    link.establish(12);

    // The master goes silent; the slave keeps being driven.
    let zeros = [0u8; 2];
    let mut slave_outputs = [0u8; 2];
    link.wire.borrow_mut().now_ms += 150;
    let status = link
        .slave
        .sync_with_master(&zeros, &mut slave_outputs)
        .unwrap();

    assert_eq!(status.reset_event, ResetEvent::BySlave);
    assert_eq!(status.reset_reason, ResetReason::WdExpired);
    assert_eq!(status.current_state, ConnState::Reset);
}

#[test]
fn rejected_parameters_reset_with_the_verdict_code() {
    let mut link = Link::new(2);
    link.slave.app_mut().verdict = ParameterVerdict::BadWatchdog;

    let zeros = [0u8; 2];
    let mut saw_slave_reject = false;
    let mut saw_master_report = false;
    for _ in 0..12 {
        let (master_status, slave_status) = link.cycle(&zeros, &zeros);
        if slave_status.reset_event == ResetEvent::BySlave
            && slave_status.reset_reason == ResetReason::InvalidCommParam
        {
            saw_slave_reject = true;
        }
        if master_status.reset_event == ResetEvent::BySlave
            && master_status.reset_reason == ResetReason::InvalidCommParam
        {
            saw_master_report = true;
            break;
        }
    }
    assert!(saw_slave_reject, "slave must refuse the watchdog value");
    assert!(saw_master_report, "master must report the slave's code 9");
    assert_eq!(link.slave.app().verified, vec![(100, vec![])]);

    // The master starts over with a new session.
    let (master_status, _) = link.cycle(&zeros, &zeros);
    assert_eq!(master_status.current_state, ConnState::Session);
}

#[test]
fn wrong_slave_address_never_reaches_data() {
    let mut link = Link::with_slave_address(2, 0x0305);
    let zeros = [0u8; 2];

    let mut saw_address_reject = false;
    for _ in 0..24 {
        let (master_status, slave_status) = link.cycle(&zeros, &zeros);
        if slave_status.reset_reason == ResetReason::InvalidAddress
            && slave_status.reset_event == ResetEvent::BySlave
        {
            saw_address_reject = true;
        }
        if master_status.reset_event == ResetEvent::BySlave {
            assert_eq!(master_status.reset_reason, ResetReason::InvalidAddress);
        }
        assert_ne!(link.master.state(), ConnState::Data);
        assert_ne!(link.slave.state(), ConnState::Data);
    }
    assert!(saw_address_reject);
}

#[test]
fn host_reset_request_restarts_the_connection() {
    let mut link = Link::new(2);
    link.establish(12);
    link.master.enable_process_data_sending();

    link.master.request_reset();
    let zeros = [0u8; 2];
    let (master_status, slave_status) = link.cycle(&zeros, &zeros);
    assert_eq!(master_status.reset_event, ResetEvent::ByMaster);
    assert_eq!(master_status.reset_reason, ResetReason::LocalReset);
    assert_eq!(master_status.current_state, ConnState::Reset);
    assert_eq!(slave_status.reset_event, ResetEvent::ByMaster);
    assert!(!link.master.process_data_sending_enabled());

    // And the link comes back on its own.
    link.establish(12);
}

#[test]
fn duplicate_delivery_does_not_advance_the_master() {
    let mut link = Link::new(2);
    link.establish(12);

    let zeros = [0u8; 2];
    link.cycle(&zeros, &zeros);

    // Re-present the slave's last frame a second time.
    let duplicate = {
        let wire = link.wire.borrow();
        wire.slave_to_master.back().cloned()
    };
    if let Some(frame) = duplicate {
        link.wire.borrow_mut().slave_to_master.push_back(frame);
    }

    let before = link.wire.borrow().master_to_slave.len();
    let (status, _) = link.cycle(&zeros, &zeros);
    let after = link.wire.borrow().master_to_slave.len();

    assert_eq!(status.reset_event, ResetEvent::None, "duplicates are ignored");
    // One frame for the fresh delivery, none for the duplicate.
    assert!(after - before <= 1);

    // The link shrugs the duplicate off and keeps cycling.
    for _ in 0..4 {
        let (master_status, slave_status) = link.cycle(&zeros, &zeros);
        assert_eq!(master_status.reset_event, ResetEvent::None);
        assert_eq!(slave_status.reset_event, ResetEvent::None);
    }
    assert_eq!(link.master.state(), ConnState::Data);
    assert_eq!(link.slave.state(), ConnState::Data);
}

#[test]
fn session_ids_are_exposed_once_negotiated() {
    let mut link = Link::new(2);
    link.establish(12);

    let master_id = link.master.master_session_id().unwrap();
    let slave_view = link.slave.master_session_id().unwrap();
    assert_eq!(master_id, slave_view);

    let slave_id = link.slave.slave_session_id().unwrap();
    let master_view = link.master.slave_session_id().unwrap();
    assert_eq!(slave_id, master_view);

    assert_eq!(link.slave.connection_id().unwrap(), 0x0008);
}
