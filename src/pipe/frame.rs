//! Wire framing (spec §4.D.1, §6): every message is prefixed by an 8-byte
//! big-endian unsigned length, with no per-message type byte. Grounded on
//! the teacher's `multiplexer::SegmentBuffer`/`Header`, generalized from an
//! 8-byte *mux* header (protocol id + timestamp + 16-bit length) down to
//! this spec's 8-byte *pure length* header, since this engine doesn't
//! multiplex multiple logical streams over one pipe (spec §1 Non-goals).

use byteorder::{BigEndian, ByteOrder};

pub const HEADER_LEN: usize = 8;

pub fn encode_length(len: u64) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    BigEndian::write_u64(&mut buf, len);
    buf
}

pub fn decode_length(buf: &[u8]) -> u64 {
    BigEndian::read_u64(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_round_trips() {
        for len in [0u64, 1, 255, 65536, u32::MAX as u64, u64::MAX / 2] {
            let encoded = encode_length(len);
            assert_eq!(decode_length(&encoded), len);
        }
    }
}
