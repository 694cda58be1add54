//! The trivial identity coder: passes the message through unchanged,
//! stamping and observing the coding-parameters word. This is the one
//! concrete coder the core ships (used by the loopback end-to-end
//! fixture); real coding algorithms are out of scope.

use super::{CodingParameters, UdpDecoder, UdpEncoder};
use crate::minion::Minion;

pub struct DirectPassEncoder {
    params: CodingParameters,
}

impl Default for DirectPassEncoder {
    fn default() -> Self {
        DirectPassEncoder {
            params: CodingParameters::new(0, 0, 0, 0),
        }
    }
}

impl UdpEncoder for DirectPassEncoder {
    fn encode(&self, minion: &mut Minion) -> bool {
        let stamped = self.params.read_encoded_and_increment();
        minion.message.header_mut().coding_parameters = stamped;
        true
    }

    fn parameters(&self) -> &CodingParameters {
        &self.params
    }
}

pub struct DirectPassDecoder {
    params: CodingParameters,
}

impl Default for DirectPassDecoder {
    fn default() -> Self {
        DirectPassDecoder {
            params: CodingParameters::new(0, 0, 0, 0),
        }
    }
}

impl UdpDecoder for DirectPassDecoder {
    fn decode(&self, minion: &mut Minion) -> bool {
        let params = minion.message.header().coding_parameters;
        self.params.set(params, false);
        true
    }

    fn parameters(&self) -> &CodingParameters {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minion_with_payload(bytes: &[u8]) -> Minion {
        let mut m = Minion::new(1024);
        let buf = m.message.allocate_buffer();
        buf.extend_from_slice(bytes);
        let len = bytes.len();
        m.message.reset_payload(true, (0, len));
        m
    }

    #[test]
    fn encode_stamps_parameters_and_leaves_payload_untouched() {
        let encoder = DirectPassEncoder::default();
        let mut minion = minion_with_payload(b"hello");
        assert!(encoder.encode(&mut minion));
        assert_eq!(minion.message.payload(), b"hello");
    }

    #[test]
    fn decode_adopts_the_header_parameters() {
        let decoder = DirectPassDecoder::default();
        let mut minion = minion_with_payload(b"hello");
        minion.message.header_mut().coding_parameters = CodingParameters::encode(1, 2, 3, 4);
        assert!(decoder.decode(&mut minion));
        assert_eq!(decoder.encoded_parameters(), CodingParameters::encode(1, 2, 3, 4));
    }
}
