//! Wire-format definitions for data fragments and acknowledgements.
//!
//! Two datagram kinds travel between the peers, each on its own endpoint:
//! - [`DataPacket`] on the data endpoint, sender → reader: one fragment of a
//!   frame.
//! - [`AckPacket`] on the control endpoint, reader → sender: a 128-bit map of
//!   the fragments received so far for one frame.
//!
//! This module only turns packets into bytes and back.  No I/O happens here.
//!
//! # Data fragment
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Frame Number          |     Flags     | Fragment Index|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Frag. Count   |        Payload Length         |   Checksum    :
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! :   (cont.)     |               Payload ...                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Header size: [`DATA_HEADER_LEN`] = 9 bytes.
//!
//! # Ack
//!
//! ```text
//! +---------------+-------------------------------+---------------+
//! | Frame Number  |   Ack Bits (128, bit i = i)   |   Checksum    |
//! |   (2 bytes)   |          (16 bytes)           |   (2 bytes)   |
//! +---------------+-------------------------------+---------------+
//! ```
//!
//! Packet size: [`ACK_PACKET_LEN`] = 20 bytes.
//!
//! Both kinds carry an Internet checksum (RFC 1071) computed over the whole
//! packet with the checksum field zeroed.

use thiserror::Error;

/// Bit-flag constants for the data header `flags` field.
pub mod flags {
    /// The frame was enqueued with `flush = true`.
    pub const FLUSH: u8 = 0b0000_0001;
}

/// Upper bound on fragments per frame (one bit each in the ack map).
pub const MAX_FRAGMENTS_PER_FRAME: usize = 128;

/// Largest fragment payload that still fits a single UDP datagram.
pub const MAX_FRAGMENT_SIZE: usize = 65_507 - DATA_HEADER_LEN;

/// Byte length of the data-fragment header.
pub const DATA_HEADER_LEN: usize = 9;

/// Byte length of an ack packet.
pub const ACK_PACKET_LEN: usize = 20;

// Data header field offsets.
const OFF_FRAME: usize = 0;
const OFF_FLAGS: usize = 2;
const OFF_INDEX: usize = 3;
const OFF_COUNT: usize = 4;
const OFF_PAYLOAD_LEN: usize = 5;
const OFF_CHECKSUM: usize = 7;

// Ack field offsets.
const OFF_ACK_FRAME: usize = 0;
const OFF_ACK_BITS: usize = 2;
const OFF_ACK_CHECKSUM: usize = 18;

// ---------------------------------------------------------------------------
// Frame numbers
// ---------------------------------------------------------------------------

/// Returns `true` when frame number `a` comes strictly before `b`,
/// accounting for `u16` wrap-around (half-range comparison).
pub fn frame_before(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) <= u16::MAX / 2
}

// ---------------------------------------------------------------------------
// AckBitfield
// ---------------------------------------------------------------------------

/// Set of received fragment indices for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckBitfield(u128);

impl AckBitfield {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u128) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u128 {
        self.0
    }

    /// Mark fragment `index`; returns `true` if it was not set before.
    ///
    /// Indices past [`MAX_FRAGMENTS_PER_FRAME`] are ignored.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= MAX_FRAGMENTS_PER_FRAME {
            return false;
        }
        let mask = 1u128 << index;
        let fresh = self.0 & mask == 0;
        self.0 |= mask;
        fresh
    }

    pub fn is_set(self, index: usize) -> bool {
        index < MAX_FRAGMENTS_PER_FRAME && self.0 & (1u128 << index) != 0
    }

    /// Whether fragments `0..count` are all marked.
    pub fn all_set(self, count: usize) -> bool {
        let mask = Self::mask(count);
        self.0 & mask == mask
    }

    pub fn count_set(self) -> u32 {
        self.0.count_ones()
    }

    /// Union with another map of the same frame.
    pub fn merge(&mut self, other: AckBitfield) {
        self.0 |= other.0;
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }

    fn mask(count: usize) -> u128 {
        match count {
            0 => 0,
            n if n >= MAX_FRAGMENTS_PER_FRAME => u128::MAX,
            n => (1u128 << n) - 1,
        }
    }
}

// ---------------------------------------------------------------------------
// DataPacket
// ---------------------------------------------------------------------------

/// Fixed-size header of a data fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub frame_number: u16,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    pub fragment_index: u8,
    pub fragments_per_frame: u8,
}

impl DataHeader {
    pub fn is_flush(&self) -> bool {
        self.flags & flags::FLUSH != 0
    }
}

/// One fragment of a frame, borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPacket<'a> {
    pub header: DataHeader,
    pub payload: &'a [u8],
}

impl<'a> DataPacket<'a> {
    /// Serialise into a newly allocated datagram.
    ///
    /// Payload length and checksum are computed here.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len =
            u16::try_from(self.payload.len()).map_err(|_| PacketError::PayloadTooLarge)?;
        let mut buf = vec![0u8; DATA_HEADER_LEN + self.payload.len()];

        buf[OFF_FRAME..OFF_FRAME + 2].copy_from_slice(&self.header.frame_number.to_be_bytes());
        buf[OFF_FLAGS] = self.header.flags;
        buf[OFF_INDEX] = self.header.fragment_index;
        buf[OFF_COUNT] = self.header.fragments_per_frame;
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2].copy_from_slice(&payload_len.to_be_bytes());
        buf[DATA_HEADER_LEN..].copy_from_slice(self.payload);

        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());
        Ok(buf)
    }

    /// Parse a data fragment out of `buf`.
    ///
    /// Only the layout is checked here; whether the fragment makes sense for
    /// the frame being reassembled is the reader's call.
    pub fn decode(buf: &'a [u8]) -> Result<Self, PacketError> {
        if buf.len() < DATA_HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }
        let payload_len = read_u16(buf, OFF_PAYLOAD_LEN) as usize;
        if buf.len() != DATA_HEADER_LEN + payload_len {
            return Err(PacketError::LengthMismatch);
        }
        verify_checksum(buf, OFF_CHECKSUM)?;

        Ok(DataPacket {
            header: DataHeader {
                frame_number: read_u16(buf, OFF_FRAME),
                flags: buf[OFF_FLAGS],
                fragment_index: buf[OFF_INDEX],
                fragments_per_frame: buf[OFF_COUNT],
            },
            payload: &buf[DATA_HEADER_LEN..],
        })
    }
}

// ---------------------------------------------------------------------------
// AckPacket
// ---------------------------------------------------------------------------

/// Reader's view of one frame, sent back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPacket {
    pub frame_number: u16,
    pub received: AckBitfield,
}

impl AckPacket {
    pub fn encode(&self) -> [u8; ACK_PACKET_LEN] {
        let mut buf = [0u8; ACK_PACKET_LEN];
        buf[OFF_ACK_FRAME..OFF_ACK_FRAME + 2].copy_from_slice(&self.frame_number.to_be_bytes());
        buf[OFF_ACK_BITS..OFF_ACK_CHECKSUM].copy_from_slice(&self.received.bits().to_be_bytes());
        let csum = internet_checksum(&buf);
        buf[OFF_ACK_CHECKSUM..].copy_from_slice(&csum.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < ACK_PACKET_LEN {
            return Err(PacketError::BufferTooShort);
        }
        if buf.len() != ACK_PACKET_LEN {
            return Err(PacketError::LengthMismatch);
        }
        verify_checksum(buf, OFF_ACK_CHECKSUM)?;

        let mut bits = [0u8; 16];
        bits.copy_from_slice(&buf[OFF_ACK_BITS..OFF_ACK_CHECKSUM]);
        Ok(AckPacket {
            frame_number: read_u16(buf, OFF_ACK_FRAME),
            received: AckBitfield::from_bits(u128::from_be_bytes(bits)),
        })
    }
}

// ---------------------------------------------------------------------------
// Errors and helpers
// ---------------------------------------------------------------------------

/// Errors that can arise when encoding or parsing a raw datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("length field does not match the datagram size")]
    LengthMismatch,
    #[error("checksum verification failed")]
    ChecksumFailed,
    #[error("payload does not fit the 16-bit length field")]
    PayloadTooLarge,
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn verify_checksum(buf: &[u8], off: usize) -> Result<(), PacketError> {
    let stored = read_u16(buf, off);
    let mut scratch = buf.to_vec();
    scratch[off..off + 2].fill(0);
    if internet_checksum(&scratch) != stored {
        return Err(PacketError::ChecksumFailed);
    }
    Ok(())
}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// The caller must zero any checksum field within `data` first.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    // Odd trailing byte is padded with zero on the right.
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(frame: u16, index: u8, count: u8, payload: &[u8]) -> DataPacket<'_> {
        DataPacket {
            header: DataHeader {
                frame_number: frame,
                flags: 0,
                fragment_index: index,
                fragments_per_frame: count,
            },
            payload,
        }
    }

    #[test]
    fn data_roundtrip_borrows_payload() {
        let pkt = fragment(7, 2, 4, b"frame bytes");
        let bytes = pkt.encode().unwrap();
        assert_eq!(bytes.len(), DATA_HEADER_LEN + 11);
        let decoded = DataPacket::decode(&bytes).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn flush_flag_survives_the_wire() {
        let mut pkt = fragment(1, 0, 1, b"x");
        pkt.header.flags = flags::FLUSH;
        let bytes = pkt.encode().unwrap();
        assert_eq!(bytes[OFF_FLAGS], flags::FLUSH);
        assert!(DataPacket::decode(&bytes).unwrap().header.is_flush());
    }

    #[test]
    fn data_fields_big_endian() {
        let bytes = fragment(0x0102, 3, 9, b"").encode().unwrap();
        assert_eq!(&bytes[OFF_FRAME..OFF_FRAME + 2], &[0x01, 0x02]);
        assert_eq!(bytes[OFF_INDEX], 3);
        assert_eq!(bytes[OFF_COUNT], 9);
    }

    #[test]
    fn data_decode_short_buffer() {
        assert_eq!(DataPacket::decode(&[]), Err(PacketError::BufferTooShort));
        assert_eq!(
            DataPacket::decode(&[0u8; DATA_HEADER_LEN - 1]),
            Err(PacketError::BufferTooShort)
        );
    }

    #[test]
    fn data_decode_truncated_payload() {
        let mut bytes = fragment(1, 0, 1, b"data").encode().unwrap();
        bytes.pop();
        assert_eq!(DataPacket::decode(&bytes), Err(PacketError::LengthMismatch));
    }

    #[test]
    fn data_decode_corrupt_byte() {
        let mut bytes = fragment(99, 0, 2, b"test").encode().unwrap();
        bytes[DATA_HEADER_LEN] ^= 0xff;
        assert_eq!(DataPacket::decode(&bytes), Err(PacketError::ChecksumFailed));
    }

    #[test]
    fn data_payload_over_u16_rejected() {
        let big = vec![0u8; u16::MAX as usize + 1];
        assert_eq!(
            fragment(1, 0, 1, &big).encode(),
            Err(PacketError::PayloadTooLarge)
        );
    }

    #[test]
    fn ack_roundtrip_high_bits() {
        let mut received = AckBitfield::new();
        received.set(0);
        received.set(127);
        let ack = AckPacket {
            frame_number: 65535,
            received,
        };
        let decoded = AckPacket::decode(&ack.encode()).unwrap();
        assert_eq!(decoded, ack);
        assert!(decoded.received.is_set(127));
        assert!(!decoded.received.is_set(1));
    }

    #[test]
    fn ack_decode_rejects_bad_length_and_checksum() {
        let bytes = AckPacket {
            frame_number: 3,
            received: AckBitfield::from_bits(0b1011),
        }
        .encode();
        assert_eq!(
            AckPacket::decode(&bytes[..ACK_PACKET_LEN - 1]),
            Err(PacketError::BufferTooShort)
        );
        let mut long = bytes.to_vec();
        long.push(0);
        assert_eq!(AckPacket::decode(&long), Err(PacketError::LengthMismatch));
        let mut corrupt = bytes;
        corrupt[5] ^= 0x10;
        assert_eq!(AckPacket::decode(&corrupt), Err(PacketError::ChecksumFailed));
    }

    #[test]
    fn bitfield_tracks_fresh_bits() {
        let mut bits = AckBitfield::new();
        assert!(bits.set(3));
        assert!(!bits.set(3));
        assert!(!bits.set(128));
        assert_eq!(bits.count_set(), 1);
        assert!(!bits.all_set(4));
        for i in 0..3 {
            bits.set(i);
        }
        assert!(bits.all_set(4));
        assert!(bits.all_set(0));
        bits.reset();
        assert_eq!(bits.bits(), 0);
    }

    #[test]
    fn bitfield_full_frame() {
        let mut bits = AckBitfield::new();
        for i in 0..MAX_FRAGMENTS_PER_FRAME {
            bits.set(i);
        }
        assert!(bits.all_set(MAX_FRAGMENTS_PER_FRAME));
        let mut other = AckBitfield::from_bits(0b10);
        other.merge(AckBitfield::from_bits(0b01));
        assert_eq!(other.bits(), 0b11);
    }

    #[test]
    fn frame_numbers_wrap() {
        assert!(frame_before(1, 2));
        assert!(!frame_before(2, 1));
        assert!(!frame_before(5, 5));
        assert!(frame_before(65535, 0));
        assert!(frame_before(65000, 10));
        assert!(!frame_before(10, 65000));
    }

    #[test]
    fn checksum_odd_length() {
        // 0x0100 + 0x0200 → !0x0300
        assert_eq!(internet_checksum(&[0x01, 0x00, 0x02]), !0x0300);
    }
}
