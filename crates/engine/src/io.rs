//! Packet I/O traits (spec §1: "the core consumes frames-in/frames-out").
//! The real harness that drives a `PacketHandler` in production — NIC
//! queues, DPDK rings, whatever — lives entirely outside this crate;
//! these traits are the seam, and `MockIo` is the in-memory test double
//! the integration suite drives against.

use std::collections::VecDeque;

use bytes::Bytes;

/// A source of raw Ethernet frames for one worker queue.
pub trait PacketSource {
    fn recv(&mut self) -> Option<Bytes>;
}

/// A sink for raw Ethernet frames a worker has produced.
pub trait PacketSink {
    fn send(&mut self, frame: Bytes);
}

/// An in-memory `PacketSource`/`PacketSink` pair used by tests: frames
/// pushed with [`MockIo::push`] are handed to a worker one at a time,
/// and whatever a worker sends lands in [`MockIo::outbound`].
#[derive(Default)]
pub struct MockIo {
    inbound: VecDeque<Bytes>,
    pub outbound: Vec<Bytes>,
}

impl MockIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Bytes) {
        self.inbound.push_back(frame);
    }

    pub fn drain_outbound(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbound)
    }
}

impl PacketSource for MockIo {
    fn recv(&mut self) -> Option<Bytes> {
        self.inbound.pop_front()
    }
}

impl PacketSink for MockIo {
    fn send(&mut self, frame: Bytes) {
        self.outbound.push(frame);
    }
}
