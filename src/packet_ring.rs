use bytes::BufMut;
use tracing::debug;
use crate::buffers::fixed_buf::FixedBuf;
use crate::packet_header::PacketHeader;
use crate::sequence::NULL_ENTRY;

/// A single ring slot. On the send side it holds the complete serialised datagram (header
///  plus payload) so a resend can go straight to the socket after the header's ack fields
///  are refreshed; on the receive side it holds a bare payload awaiting in-order delivery.
#[derive(Debug)]
pub struct PacketSlot {
    sequence_id: i32,
    send_time: i64,
    header_len: usize,
    payload_len: usize,
    buffer: FixedBuf,
}

impl PacketSlot {
    fn new(capacity: usize) -> PacketSlot {
        PacketSlot {
            sequence_id: NULL_ENTRY,
            send_time: -1,
            header_len: 0,
            payload_len: 0,
            buffer: FixedBuf::new(capacity),
        }
    }

    pub fn sequence_id(&self) -> i32 {
        self.sequence_id
    }

    pub fn send_time(&self) -> i64 {
        self.send_time
    }

    /// the full wire form (send side)
    pub fn datagram(&self) -> &[u8] {
        self.buffer.as_ref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[self.header_len..self.header_len + self.payload_len]
    }
}

/// A fixed-capacity, sequence-indexed slot array. Slot index is `seq % window_size`, so a
///  slot with sequence id `s` is reachable only under `s` - insertion, lookup and release
///  are all O(1).
///
/// NB: The ring does not know which sequence numbers are 'current'; staking out slots and
///      keeping at most `window_size` packets in flight is the caller's business.
#[derive(Debug)]
pub struct PacketRing {
    window_size: u16,
    slots: Vec<PacketSlot>,
}

impl PacketRing {
    /// deterministic size in bytes of one ring for a given window and slot capacity
    pub fn capacity_needed(window_size: u16, slot_capacity: usize) -> usize {
        window_size as usize * (size_of::<PacketSlot>() + slot_capacity)
    }

    pub fn new(window_size: u16, slot_capacity: usize) -> PacketRing {
        PacketRing {
            window_size,
            slots: (0..window_size).map(|_| PacketSlot::new(slot_capacity)).collect(),
        }
    }

    fn index(&self, seq: u16) -> usize {
        (seq % self.window_size) as usize
    }

    /// Stake out the slot for `seq`. Succeeds iff the slot is currently free; on success
    ///  the slot belongs to `seq` until it is released.
    pub fn try_acquire(&mut self, seq: u16) -> bool {
        let index = self.index(seq);
        if self.slots[index].sequence_id != NULL_ENTRY {
            return false;
        }
        self.slots[index].sequence_id = seq as i32;
        true
    }

    /// Serialise `header` followed by `payload` into the slot previously acquired for
    ///  `seq` and stamp the send time (send side).
    pub fn set_header_and_packet(&mut self, seq: u16, header: &PacketHeader, payload: &[u8], send_time: i64) {
        let window_size = self.window_size;
        let header_len = PacketHeader::wire_len(window_size);
        let index = self.index(seq);
        let slot = &mut self.slots[index];
        assert_eq!(slot.sequence_id, seq as i32, "slot for #{} was not acquired", seq);
        assert!(header_len + payload.len() <= slot.buffer.capacity(),
                "packet for #{} exceeds the slot capacity of {} bytes - the upper layer must clamp payloads to the configured MTU",
                seq, slot.buffer.capacity());

        slot.buffer.clear();
        header.ser(&mut slot.buffer, window_size);
        slot.buffer.put_slice(payload);
        slot.header_len = header_len;
        slot.payload_len = payload.len();
        slot.send_time = send_time;
    }

    /// Store a bare payload for `seq` (receive side). The slot is staked to `seq`
    ///  unconditionally: an entry under the same index can only be evicted by a peer that
    ///  violates the window contract, and a wedged slot would be worse than a lost packet.
    pub fn set_packet(&mut self, seq: u16, payload: &[u8]) {
        let index = self.index(seq);
        let slot = &mut self.slots[index];
        if slot.sequence_id != NULL_ENTRY && slot.sequence_id != seq as i32 {
            debug!("slot for #{} evicts undelivered #{} - peer ignored the receive window", seq, slot.sequence_id);
        }
        assert!(payload.len() <= slot.buffer.capacity(),
                "packet for #{} exceeds the slot capacity of {} bytes - the upper layer must clamp payloads to the configured MTU",
                seq, slot.buffer.capacity());

        slot.sequence_id = seq as i32;
        slot.buffer.clear();
        slot.buffer.put_slice(payload);
        slot.header_len = 0;
        slot.payload_len = payload.len();
    }

    /// Refresh the header bytes in place, leaving the payload untouched (resend path).
    pub fn rewrite_header(&mut self, seq: u16, header: &PacketHeader, send_time: i64) {
        let window_size = self.window_size;
        let index = self.index(seq);
        let slot = &mut self.slots[index];
        assert_eq!(slot.sequence_id, seq as i32, "slot for #{} is not occupied", seq);

        let mut header_buf = &mut slot.buffer.as_mut()[..slot.header_len];
        header.ser(&mut header_buf, window_size);
        slot.send_time = send_time;
    }

    /// The slot for `seq`, if it currently holds exactly that sequence id.
    pub fn get(&self, seq: u16) -> Option<&PacketSlot> {
        let slot = &self.slots[self.index(seq)];
        if slot.sequence_id == seq as i32 {
            Some(slot)
        }
        else {
            None
        }
    }

    pub fn is_buffered(&self, seq: u16) -> bool {
        self.get(seq).is_some()
    }

    /// Free the slot for `seq`. Releasing an already-free slot is a no-op.
    pub fn release(&mut self, seq: u16) {
        let index = self.index(seq);
        self.slots[index].sequence_id = NULL_ENTRY;
        self.slots[index].send_time = -1;
    }

    pub fn release_range(&mut self, seq_start: u16, count: u16) {
        for offset in 0..count.min(self.window_size) {
            self.release(seq_start.wrapping_add(offset));
        }
    }

    pub fn occupied(&self) -> impl Iterator<Item = &PacketSlot> {
        self.slots.iter().filter(|s| s.sequence_id != NULL_ENTRY)
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_header::PacketType;
    use rstest::rstest;

    fn payload_header(seq: u16) -> PacketHeader {
        PacketHeader {
            packet_type: PacketType::Payload,
            processing_time: 0,
            sequence_id: seq,
            acked_sequence_id: 0,
            ack_mask: 1,
        }
    }

    #[rstest]
    #[case(0, 0)]
    #[case(3, 3)]
    #[case(4, 0)]
    #[case(0xFFFE, 2)]
    fn test_slot_index(#[case] seq: u16, #[case] expected: usize) {
        let ring = PacketRing::new(4, 64);
        assert_eq!(ring.index(seq), expected);
    }

    #[test]
    fn test_acquire_and_release() {
        let mut ring = PacketRing::new(4, 64);
        assert!(ring.try_acquire(5));
        assert!(!ring.try_acquire(5), "same slot cannot be staked twice");
        assert!(!ring.try_acquire(1), "seq 1 shares slot index with seq 5");
        assert!(ring.try_acquire(6));
        assert_eq!(ring.occupied_count(), 2);

        ring.release(5);
        assert_eq!(ring.occupied_count(), 1);
        assert!(ring.try_acquire(1));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut ring = PacketRing::new(4, 64);
        assert!(ring.try_acquire(2));
        ring.release(2);
        ring.release(2);
        ring.release(6); // same slot, never acquired under this id
        assert_eq!(ring.occupied_count(), 0);
        assert!(ring.try_acquire(2));
    }

    #[test]
    fn test_release_range() {
        let mut ring = PacketRing::new(4, 64);
        for seq in [0xFFFEu16, 0xFFFF, 0] {
            assert!(ring.try_acquire(seq));
        }
        ring.release_range(0xFFFE, 3);
        assert_eq!(ring.occupied_count(), 0);
    }

    #[test]
    fn test_send_slot_holds_wire_form() {
        let mut ring = PacketRing::new(4, 64);
        assert!(ring.try_acquire(1));
        ring.set_header_and_packet(1, &payload_header(1), &[10, 20, 30], 17);

        let slot = ring.get(1).unwrap();
        assert_eq!(slot.send_time(), 17);
        assert_eq!(slot.payload(), &[10, 20, 30]);
        assert_eq!(slot.datagram().len(), PacketHeader::wire_len(4) + 3);

        let mut wire: &[u8] = slot.datagram();
        let header = PacketHeader::deser(&mut wire, 4).unwrap();
        assert_eq!(header.sequence_id, 1);
        assert_eq!(wire, &[10, 20, 30]);
    }

    #[test]
    fn test_rewrite_header_keeps_payload() {
        let mut ring = PacketRing::new(4, 64);
        assert!(ring.try_acquire(1));
        ring.set_header_and_packet(1, &payload_header(1), &[10, 20, 30], 17);

        let mut refreshed = payload_header(1);
        refreshed.acked_sequence_id = 9;
        refreshed.ack_mask = 0b111;
        ring.rewrite_header(1, &refreshed, 42);

        let slot = ring.get(1).unwrap();
        assert_eq!(slot.send_time(), 42);
        let mut wire: &[u8] = slot.datagram();
        let header = PacketHeader::deser(&mut wire, 4).unwrap();
        assert_eq!(header, refreshed);
        assert_eq!(wire, &[10, 20, 30]);
    }

    #[test]
    fn test_receive_slot_holds_bare_payload() {
        let mut ring = PacketRing::new(4, 64);
        ring.set_packet(7, &[1, 2]);
        assert!(ring.is_buffered(7));
        assert!(!ring.is_buffered(3), "different seq under the same index is not a hit");
        assert_eq!(ring.get(7).unwrap().payload(), &[1, 2]);
    }

    #[test]
    #[should_panic]
    fn test_oversized_payload_is_rejected() {
        let mut ring = PacketRing::new(4, 16);
        assert!(ring.try_acquire(0));
        ring.set_header_and_packet(0, &payload_header(0), &[0u8; 16], 0);
    }
}
