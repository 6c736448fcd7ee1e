//! Acknowledgement bookkeeping for the reliable-sequenced stage.
//!
//! Two sequence-buffer contexts track the conversation: `sent` mirrors what the peer has
//!  acknowledged of our packets, `received` tracks what we have seen of the peer's packets
//!  and what we have told the peer about it. Acks travel as a 16-bit anchor plus a bitmap
//!  where bit `i` covers `anchor - i`, piggy-backed on every outbound packet.

use crate::packet_ring::PacketRing;
use crate::sequence::{self, NULL_ENTRY};

/// Counters for everything the stage absorbs silently. `packets_duplicated` counts both
///  true network duplicates and peer resends whose ack got lost - the wire format carries
///  no per-packet identity that could tell them apart.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub packets_out_of_order: u64,
    pub packets_duplicated: u64,
    pub packets_stale: u64,
    pub packets_resent: u64,
}

/// One direction's sequence bookkeeping. The stored values are `i32` so that
///  [`NULL_ENTRY`] can coexist with the full u16 range; all wire arithmetic casts down.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SequenceBufferContext {
    /// sent: the next sequence id to assign. received: the highest sequence id seen.
    pub sequence: i32,
    /// sent: the last of our packets the remote acknowledged. received: the last sequence
    ///  id for which *we* have emitted an ack.
    pub acked: i32,
    /// bit `i` set means `acked - i` is acknowledged (sent) / `sequence - i` was
    ///  received (received); bit 0 is the anchor itself
    pub ack_mask: u64,
    /// the receive-side mask at the time we last informed the peer - detects mask changes
    ///  with no sequence advance (an out-of-order arrival filling a gap)
    pub last_ack_mask: u64,
}

impl SequenceBufferContext {
    fn for_sent() -> SequenceBufferContext {
        SequenceBufferContext { sequence: 0, acked: NULL_ENTRY, ack_mask: 0, last_ack_mask: 0 }
    }

    fn for_received() -> SequenceBufferContext {
        SequenceBufferContext { sequence: NULL_ENTRY, acked: NULL_ENTRY, ack_mask: 0, last_ack_mask: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Classification {
    /// not seen before - the caller delivers or buffers it
    Fresh,
    /// predates the receive window
    Stale,
    /// already covered by the ack mask
    Duplicate,
}

#[derive(Debug)]
pub(crate) struct AckState {
    window_size: u16,
    pub sent: SequenceBufferContext,
    pub received: SequenceBufferContext,
    pub duplicates_since_last_ack: u32,
    pub stats: Statistics,
}

impl AckState {
    pub fn new(window_size: u16) -> AckState {
        AckState {
            window_size,
            sent: SequenceBufferContext::for_sent(),
            received: SequenceBufferContext::for_received(),
            duplicates_since_last_ack: 0,
            stats: Statistics::default(),
        }
    }

    /// Classify an inbound sequence id and fold it into the receive-side context.
    ///
    /// The order matters: staleness is decided against the *highest seen* sequence id
    ///  (plus one), then a genuinely newer packet shifts the mask forward, and everything
    ///  else is an in-window older packet that either fills a mask gap or is a duplicate.
    pub fn classify_inbound(&mut self, seq: u16) -> Classification {
        let expected = (self.received.sequence as u16).wrapping_add(1);
        if sequence::is_stale(seq, expected, self.window_size) {
            self.stats.packets_stale += 1;
            return Classification::Stale;
        }

        let window = self.window_size as i32 - 1;
        if sequence::greater_than(seq, self.received.sequence as u16) {
            let distance = sequence::abs_distance(seq, self.received.sequence as u16);

            if distance > window {
                // the whole previous mask fell out of the window
                self.stats.packets_dropped += (distance - 1) as u64;
                self.received.ack_mask = 1;
            }
            else {
                self.received.ack_mask <<= distance;
                self.received.ack_mask |= 1;

                for i in 0..distance.min(window) {
                    if self.received.ack_mask & (1u64 << i) == 0 {
                        self.stats.packets_dropped += 1;
                    }
                }
            }
            self.received.sequence = seq as i32;
            Classification::Fresh
        }
        else {
            let mut distance = sequence::abs_distance(seq, self.received.sequence as u16);
            if distance >= 0xFFFF - self.window_size as i32 {
                // an in-window older packet comes out of abs_distance as almost a full
                //  lap forward; recover the backward distance. The difference can go
                //  negative across the wrap, which the 6-bit shift mask absorbs.
                distance = self.received.sequence - seq as i32;
            }
            let ack_bit = 1u64 << (distance as u64 & 63);

            if ack_bit & self.received.ack_mask != 0 {
                self.stats.packets_duplicated += 1;
                self.duplicates_since_last_ack += 1;
                return Classification::Duplicate;
            }
            self.stats.packets_out_of_order += 1;
            self.received.ack_mask |= ack_bit;
            Classification::Fresh
        }
    }

    /// Fold the peer's ack report (anchor + mask) into the sent-side context. A report
    ///  can never un-ack: a stale anchor is ignored outright, an equal anchor only adds
    ///  mask bits, and a newer anchor replaces both fields.
    pub fn fold_remote_ack(&mut self, acked_seq: u16, ack_mask: u64) {
        if sequence::greater_than(self.sent.acked as u16, acked_seq) {
            return;
        }
        if self.sent.acked as u16 == acked_seq {
            self.sent.ack_mask |= ack_mask;
        }
        else {
            self.sent.acked = acked_seq as i32;
            self.sent.ack_mask = ack_mask;
        }
    }

    /// Free every send-ring slot the peer's current report covers. Safe to call any number
    ///  of times - releasing a free slot is a no-op.
    pub fn release_acked_packets(&self, send_ring: &mut PacketRing) {
        if self.sent.acked == NULL_ENTRY {
            return;
        }
        let acked = self.sent.acked;

        let mut released = [0u16; 64];
        let mut count = 0;
        for slot in send_ring.occupied() {
            let slot_seq = slot.sequence_id() as u16;
            let distance = sequence::abs_distance(acked as u16, slot_seq);
            let ack_bit = 1u64 << ((acked as i64 - slot_seq as i64) as u64 & 63);
            if distance < self.window_size as i32 && ack_bit & self.sent.ack_mask != 0 {
                released[count] = slot_seq;
                count += 1;
            }
        }
        for &seq in &released[..count] {
            send_ring.release(seq);
        }
    }

    /// Record that an outbound packet (payload, resend or bare ack) just carried the
    ///  current receive-side state to the peer.
    pub fn mark_ack_sent(&mut self) {
        self.received.acked = self.received.sequence;
        self.received.last_ack_mask = self.received.ack_mask;
        self.duplicates_since_last_ack = 0;
    }

    /// A standalone ack goes out when nothing was sent for a full tick AND the peer is
    ///  missing information: new data to ack, a mask change without a sequence advance,
    ///  or enough duplicates that our previous ack was probably lost.
    pub fn should_send_ack(&self, last_sent_time: i64, previous_timestamp: i64) -> bool {
        last_sent_time < previous_timestamp
            && (self.received.acked < self.received.sequence
                || self.received.ack_mask != self.received.last_ack_mask
                || self.duplicates_since_last_ack >= 3)
    }
}
