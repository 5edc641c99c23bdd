//! Black channel adapter.
//!
//! The safety layer makes no assumptions about the transport underneath it;
//! frames go out and come in through the host's [`FsoeApp::send`] and
//! [`FsoeApp::recv`] callbacks and everything in between is opaque. The
//! adapter owns the application reference and keeps copies of the frames
//! in flight: the last frame sent, and the last frame delivered, which is
//! how duplicate deliveries (a transport re-presenting the previous frame)
//! are told apart from fresh traffic.

use tracing::{trace, warn};

use crate::app::FsoeApp;
use crate::frame::Frame;

/// Frame transfer through the host transport callbacks.
#[derive(Debug)]
pub struct BlackChannel<A> {
    app: A,
    recv_data_size: usize,
    recv_frame_size: usize,
    last_received: Frame,
    has_received: bool,
    last_sent: Frame,
    has_sent: bool,
}

impl<A: FsoeApp> BlackChannel<A> {
    /// Wrap the application. `recv_data_size` is the fixed safe data size
    /// of frames arriving from the peer.
    pub fn new(app: A, recv_data_size: usize) -> Self {
        Self {
            app,
            recv_data_size,
            recv_frame_size: crate::frame::frame_size(recv_data_size),
            last_received: Frame::zeroed(1),
            has_received: false,
            last_sent: Frame::zeroed(1),
            has_sent: false,
        }
    }

    /// Transmit one frame and remember it.
    pub fn send_frame(&mut self, frame: &Frame) {
        trace!(frame = ?frame, "tx");
        self.app.send(frame.as_slice());
        self.last_sent = *frame;
        self.has_sent = true;
    }

    /// Ask the transport for a frame.
    ///
    /// Returns `None` when the transport has nothing, re-delivers the
    /// previous frame, or delivers a size that violates the recv contract
    /// (that last case is a host bug and is logged, not treated as a wire
    /// fault).
    pub fn poll(&mut self) -> Option<Frame> {
        let mut buffer = [0u8; crate::frame::FRAME_MAX_SIZE];
        let size = self.app.recv(&mut buffer[..self.recv_frame_size]);
        if size == 0 {
            return None;
        }
        if size != self.recv_frame_size {
            warn!(
                size,
                expected = self.recv_frame_size,
                "transport delivered a malformed frame size; ignoring"
            );
            return None;
        }

        let mut frame = Frame::zeroed(self.recv_data_size);
        frame.as_mut_slice().copy_from_slice(&buffer[..self.recv_frame_size]);

        if self.has_received && frame == self.last_received {
            trace!("rx duplicate, ignoring");
            return None;
        }

        trace!(frame = ?frame, "rx");
        self.last_received = frame;
        self.has_received = true;
        Some(frame)
    }

    /// Forget the duplicate-detection history; called on connection reset
    /// so stale frames from a previous session cannot shadow new ones.
    pub fn clear_history(&mut self) {
        self.has_received = false;
        self.has_sent = false;
    }

    /// The most recently sent frame, if any.
    pub fn last_sent(&self) -> Option<&Frame> {
        self.has_sent.then_some(&self.last_sent)
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }
}
