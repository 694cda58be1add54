//! Per-session UDP encoder/decoder contract and the 32-bit coding
//! parameter word carried on every datagram and piggybacked in acks.

pub mod direct_pass;

use std::sync::atomic::{AtomicU32, Ordering};

use crate::minion::Minion;

/// Four tuning bytes packed little-endian as `T | B<<8 | N<<16 |
/// counter<<24`; `counter` is a monotonic per-packet sequence within a
/// session that wraps modulo 256.
#[derive(Default)]
pub struct CodingParameters {
    params: AtomicU32,
}

impl CodingParameters {
    pub fn new(t: u8, b: u8, n: u8, counter: u8) -> Self {
        CodingParameters {
            params: AtomicU32::new(Self::encode(t, b, n, counter)),
        }
    }

    pub fn encode(t: u8, b: u8, n: u8, counter: u8) -> u32 {
        (t as u32) | ((b as u32) << 8) | ((n as u32) << 16) | ((counter as u32) << 24)
    }

    pub fn decode(encoded: u32) -> (u8, u8, u8, u8) {
        (
            (encoded & 0xFF) as u8,
            ((encoded >> 8) & 0xFF) as u8,
            ((encoded >> 16) & 0xFF) as u8,
            ((encoded >> 24) & 0xFF) as u8,
        )
    }

    pub fn read_encoded(&self) -> u32 {
        self.params.load(Ordering::Acquire)
    }

    /// Returns the value as it was before the counter increment, matching
    /// the fetch-then-bump semantics the sender relies on to stamp each
    /// outgoing packet with a distinct counter.
    pub fn read_encoded_and_increment(&self) -> u32 {
        self.params.fetch_add(1 << 24, Ordering::AcqRel)
    }

    pub fn increment_counter(&self) {
        self.params.fetch_add(1 << 24, Ordering::AcqRel);
    }

    /// Hint from the peer decoder, carried in an ack: resets the counter
    /// but preserves the `{T, B, N}` tuning unless `reset_counter` is set.
    pub fn set(&self, params: u32, reset_counter: bool) {
        let stored = if reset_counter { params & 0x00FF_FFFF } else { params };
        self.params.store(stored, Ordering::Release);
    }
}

pub trait UdpEncoder: Send + Sync {
    /// Returns true iff at least one output message will be transmitted.
    /// Must stamp `header.coding_parameters` on every output it produces.
    fn encode(&self, minion: &mut Minion) -> bool;

    fn set_parameters(&self, params: u32) {
        self.parameters().set(params, true);
    }

    fn parameters(&self) -> &CodingParameters;
}

pub trait UdpDecoder: Send + Sync {
    /// Returns true iff the minion now carries a delivered message.
    fn decode(&self, minion: &mut Minion) -> bool;

    fn encoded_parameters(&self) -> u32 {
        self.parameters().read_encoded()
    }

    fn parameters(&self) -> &CodingParameters;
}
