//! Loopback demo: an FSoE master and slave wired back-to-back in memory.
//!
//! Runs the full connection establishment, enables process data once both
//! sides reach Data state, exercises a host-requested reset and shows the
//! automatic recovery. Frame traffic is visible at trace level:
//!
//! ```text
//! RUST_LOG=fsoe_stack=trace cargo run --bin fsoe-loopback
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fsoe_stack::{
    ConnState, FsoeApp, Master, MasterConfig, ParameterVerdict, ResetEvent, Slave, SlaveConfig,
};

/// Queues standing in for the black channel, one per direction.
#[derive(Default)]
struct Wire {
    master_to_slave: VecDeque<Vec<u8>>,
    slave_to_master: VecDeque<Vec<u8>>,
}

struct Endpoint {
    wire: Rc<RefCell<Wire>>,
    is_master: bool,
    started: Instant,
    seed: u32,
}

impl Endpoint {
    fn new(wire: Rc<RefCell<Wire>>, is_master: bool) -> Self {
        // Seeded from the wall clock so session IDs differ across runs;
        // xorshift must not start from zero.
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.subsec_nanos())
            .unwrap_or(0x9E37_79B9)
            ^ std::process::id();
        Self {
            wire,
            is_master,
            started: Instant::now(),
            seed: seed | 1,
        }
    }
}

impl FsoeApp for Endpoint {
    fn send(&mut self, frame: &[u8]) {
        let mut wire = self.wire.borrow_mut();
        let queue = if self.is_master {
            &mut wire.master_to_slave
        } else {
            &mut wire.slave_to_master
        };
        queue.push_back(frame.to_vec());
    }

    fn recv(&mut self, frame: &mut [u8]) -> usize {
        let mut wire = self.wire.borrow_mut();
        let queue = if self.is_master {
            &mut wire.slave_to_master
        } else {
            &mut wire.master_to_slave
        };
        match queue.pop_front() {
            Some(bytes) => {
                frame[..bytes.len()].copy_from_slice(&bytes);
                bytes.len()
            }
            None => 0,
        }
    }

    fn generate_session_id(&mut self) -> u16 {
        // xorshift over a wall-clock seed; good enough for a demo, a real
        // device needs a properly reseeded source.
        self.seed ^= self.seed << 13;
        self.seed ^= self.seed >> 17;
        self.seed ^= self.seed << 5;
        self.seed as u16
    }

    fn now_ms(&mut self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    fn verify_parameters(&mut self, watchdog_timeout_ms: u16, app_params: &[u8]) -> ParameterVerdict {
        info!(
            watchdog_timeout_ms,
            app_params_len = app_params.len(),
            "slave verifying parameters"
        );
        ParameterVerdict::Accepted
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let wire = Rc::new(RefCell::new(Wire::default()));

    let mut master = Master::new(
        MasterConfig {
            slave_address: 0x0304,
            connection_id: 0x0008,
            watchdog_timeout_ms: 100,
            application_parameters: &[],
            outputs_size: 2,
            inputs_size: 2,
        },
        Endpoint::new(wire.clone(), true),
    )
    .expect("master configuration is valid");

    let mut slave = Slave::new(
        SlaveConfig {
            slave_address: 0x0304,
            application_parameters_size: 0,
            inputs_size: 2,
            outputs_size: 2,
        },
        Endpoint::new(wire.clone(), false),
    )
    .expect("slave configuration is valid");

    let slave_inputs: [u8; 2] = [0xBE, 0xEF];
    let mut master_inputs = [0u8; 2];
    let mut slave_outputs = [0u8; 2];

    let mut enabled = false;
    for cycle in 1..=40u32 {
        let outputs = [cycle as u8, 0x40];

        let master_status = master
            .sync_with_slave(&outputs, &mut master_inputs)
            .expect("buffers match configuration");
        let slave_status = slave
            .sync_with_master(&slave_inputs, &mut slave_outputs)
            .expect("buffers match configuration");

        if master_status.reset_event != ResetEvent::None {
            info!(
                cycle,
                event = ?master_status.reset_event,
                reason = %master_status.reset_reason,
                "master observed a connection reset"
            );
        }

        if !enabled
            && master_status.current_state == ConnState::Data
            && slave_status.current_state == ConnState::Data
        {
            info!(cycle, "both sides in Data state, enabling process data");
            master.enable_process_data_sending();
            slave.enable_process_data_sending();
            enabled = true;
        }

        if slave_status.is_process_data_received {
            info!(cycle, outputs = ?slave_outputs, "slave received outputs");
        }
        if master_status.is_process_data_received {
            info!(cycle, inputs = ?master_inputs, "master received inputs");
        }

        // Demonstrate a host-requested reset and the automatic recovery.
        if cycle == 25 {
            info!("requesting a local reset from the master");
            master.request_reset();
            enabled = false;
        }
    }

    info!(
        master_state = %master.state(),
        slave_state = %slave.state(),
        "demo finished"
    );
    Ok(())
}
