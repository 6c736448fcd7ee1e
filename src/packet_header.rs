use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum PacketType {
    /// carries an application payload plus piggy-backed ack fields
    Payload = 0,
    /// carries only the ack fields - sent when there was no outbound payload to piggy-back on
    Ack = 1,
}

/// Packet header (inside a UDP datagram) - all numbers little-endian:
/// ```ascii
/// 0:  packet type (u16): 0 = payload, 1 = ack
/// 2:  processing time (u16): ms the peer spent between receiving the packet acked below
///      and emitting this packet; clipped to 65535
/// 4:  sequence id (u16): this packet's sequence number (set but ignored for ack packets)
/// 6:  acked sequence id (u16): anchor of the ack bitmap
/// 8:  ack mask (u32 or u64): bit `i` set means 'acked sequence id - i' was received;
///      bit 0 is the anchor itself
/// ```
///
/// The wire size is 12 bytes for windows of 32 or less (the top 4 mask bytes can never be
///  set and are not transmitted) and 16 bytes otherwise. In memory the header is always
///  held in its full form; only serialisation is truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub processing_time: u16,
    pub sequence_id: u16,
    pub acked_sequence_id: u16,
    pub ack_mask: u64,
}

impl PacketHeader {
    /// In-memory capacity reserved for a header in every ring slot, independent of the
    ///  wire size - keeps slot offsets the same for all window sizes.
    pub const CAPACITY: usize = 16;

    pub fn wire_len(window_size: u16) -> usize {
        if window_size <= 32 { 12 } else { 16 }
    }

    pub fn ser(&self, buf: &mut impl BufMut, window_size: u16) {
        buf.put_u16_le(self.packet_type.into());
        buf.put_u16_le(self.processing_time);
        buf.put_u16_le(self.sequence_id);
        buf.put_u16_le(self.acked_sequence_id);
        if window_size <= 32 {
            buf.put_u32_le(self.ack_mask as u32);
        }
        else {
            buf.put_u64_le(self.ack_mask);
        }
    }

    pub fn deser(buf: &mut impl Buf, window_size: u16) -> anyhow::Result<PacketHeader> {
        let packet_type = PacketType::try_from(buf.try_get_u16_le()?)?;
        let processing_time = buf.try_get_u16_le()?;
        let sequence_id = buf.try_get_u16_le()?;
        let acked_sequence_id = buf.try_get_u16_le()?;
        let ack_mask = if window_size <= 32 {
            buf.try_get_u32_le()? as u64
        }
        else {
            buf.try_get_u64_le()?
        };

        Ok(PacketHeader {
            packet_type,
            processing_time,
            sequence_id,
            acked_sequence_id,
            ack_mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::small_window(4, 12)]
    #[case::default_window(32, 12)]
    #[case::just_above_truncation(33, 16)]
    #[case::biggest_window(64, 16)]
    fn test_ser_roundtrip(#[case] window_size: u16, #[case] expected_wire_len: usize) {
        let original = PacketHeader {
            packet_type: PacketType::Payload,
            processing_time: 3,
            sequence_id: 0xFFFE,
            acked_sequence_id: 17,
            ack_mask: 0b1011,
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf, window_size);
        assert_eq!(buf.len(), expected_wire_len);
        assert_eq!(PacketHeader::wire_len(window_size), expected_wire_len);

        let mut b: &[u8] = &buf;
        let deser = PacketHeader::deser(&mut b, window_size).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_wide_mask_truncated_for_small_window() {
        // mask bits above 31 cannot be set for windows <= 32, so truncating is lossless
        //  in practice; this pins the truncation itself
        let header = PacketHeader {
            packet_type: PacketType::Ack,
            processing_time: 0,
            sequence_id: 0,
            acked_sequence_id: 0,
            ack_mask: 0xFFFF_FFFF_0000_0001,
        };
        let mut buf = BytesMut::new();
        header.ser(&mut buf, 32);
        let mut b: &[u8] = &buf;
        let deser = PacketHeader::deser(&mut b, 32).unwrap();
        assert_eq!(deser.ack_mask, 0x0000_0001);
    }

    #[test]
    fn test_le_byte_layout() {
        let header = PacketHeader {
            packet_type: PacketType::Ack,
            processing_time: 0x0102,
            sequence_id: 0x0304,
            acked_sequence_id: 0x0506,
            ack_mask: 0x0708_090A,
        };
        let mut buf = BytesMut::new();
        header.ser(&mut buf, 4);
        assert_eq!(buf.as_ref(), &[1,0, 2,1, 4,3, 6,5, 0x0A,9,8,7]);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_after_type(vec![0,0, 0,0])]
    #[case::truncated_mask(vec![0,0, 0,0, 0,0, 0,0, 1,0])]
    fn test_deser_truncated(#[case] bytes: Vec<u8>) {
        let mut b: &[u8] = &bytes;
        assert!(PacketHeader::deser(&mut b, 32).is_err());
    }

    #[test]
    fn test_deser_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(7);
        buf.extend_from_slice(&[0u8; 10]);
        let mut b: &[u8] = &buf;
        assert!(PacketHeader::deser(&mut b, 32).is_err());
    }
}
