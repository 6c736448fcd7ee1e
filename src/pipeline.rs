//! The per-connection driver of the reliable-sequenced stage: the state machine that runs
//!  at every send, every receive and every idle tick.
//!
//! The stage is purely reactive and single-threaded per connection. It performs no I/O
//!  and never reads a clock - every entry point takes the current monotonic millisecond
//!  timestamp from the caller, and produced datagrams are handed back for the caller to
//!  put on the wire. If `update` is never called, no resend ever fires.

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::ack::{AckState, Classification, Statistics};
use crate::config::ReliableConfig;
use crate::errors::PipelineError;
use crate::packet_header::{PacketHeader, PacketType};
use crate::packet_ring::PacketRing;
use crate::sequence::{self, NULL_ENTRY};
use crate::timers::{RttInfo, TimerTables};

/// What one entry-point invocation produced.
///
/// `needs_resume` asks the caller to invoke the stage again immediately, without new
///  input: `resume_receive` after a receive that unblocked buffered deliveries, `update`
///  again while overdue resends remain.
#[derive(Debug, Default)]
pub struct StageEffect {
    /// a datagram to put on the wire
    pub outbound: Option<BytesMut>,
    /// an application payload to hand to the upper layer, in order and exactly once
    pub delivery: Option<Vec<u8>>,
    pub needs_resume: bool,
}

#[derive(Debug)]
pub struct ReliableStage {
    window_size: u16,
    minimum_resend_time: i64,
    max_payload_len: usize,

    ack: AckState,
    timers: TimerTables,
    rtt: RttInfo,
    send_ring: PacketRing,
    receive_ring: PacketRing,

    /// the last sequence id handed to the upper layer
    delivered: i32,
    /// the next buffered sequence id a `resume_receive` call should deliver
    resume: i32,

    last_sent_time: i64,
    /// timestamp of the previous update tick; the bare-ack decision compares against this
    ///  before it is advanced
    previous_timestamp: i64,
}

impl ReliableStage {
    /// Deterministic size in bytes of the shared per-connection state (contexts, RTT
    ///  info, timer tables) for a given configuration.
    pub fn shared_capacity_needed(config: &ReliableConfig) -> usize {
        size_of::<AckState>() + size_of::<RttInfo>() + TimerTables::capacity_needed(config.window_size)
    }

    /// Deterministic size in bytes of one direction's packet store for a given
    ///  configuration.
    pub fn process_capacity_needed(config: &ReliableConfig) -> usize {
        PacketRing::capacity_needed(config.window_size, PacketHeader::CAPACITY + config.max_payload_len)
    }

    /// Set up a stage from zeroed state. The three capacities are what the caller has
    ///  reserved for the shared state and the two packet stores; initialisation fails with
    ///  [`PipelineError::InsufficientMemory`] if any of them is below the deterministic
    ///  minimum for `config`.
    pub fn initialise(
        config: &ReliableConfig,
        shared_capacity: usize,
        send_capacity: usize,
        receive_capacity: usize,
    ) -> anyhow::Result<ReliableStage> {
        config.validate()?;

        if shared_capacity < Self::shared_capacity_needed(config)
            || send_capacity < Self::process_capacity_needed(config)
            || receive_capacity < Self::process_capacity_needed(config)
        {
            return Err(PipelineError::InsufficientMemory.into());
        }

        let slot_capacity = PacketHeader::CAPACITY + config.max_payload_len;
        Ok(ReliableStage {
            window_size: config.window_size,
            minimum_resend_time: config.minimum_resend_time,
            max_payload_len: config.max_payload_len,
            ack: AckState::new(config.window_size),
            timers: TimerTables::new(config.window_size),
            rtt: RttInfo::new(),
            send_ring: PacketRing::new(config.window_size, slot_capacity),
            receive_ring: PacketRing::new(config.window_size, slot_capacity),
            delivered: NULL_ENTRY,
            resume: NULL_ENTRY,
            last_sent_time: 0,
            previous_timestamp: 0,
        })
    }

    /// Set up a stage with buffers sized exactly to the configuration.
    pub fn new(config: &ReliableConfig) -> anyhow::Result<ReliableStage> {
        Self::initialise(
            config,
            Self::shared_capacity_needed(config),
            Self::process_capacity_needed(config),
            Self::process_capacity_needed(config),
        )
    }

    /// Accept a fresh outbound payload: assign the next sequence id, store the serialised
    ///  packet for potential resends, stamp the send time and piggy-back the current
    ///  receive-side ack state.
    ///
    /// Fails with [`PipelineError::OutgoingQueueIsFull`] while `window_size` packets are
    ///  unacknowledged - transient, retry after an ack came in. Once accepted, the packet
    ///  is resent until the peer acknowledges it.
    pub fn send(&mut self, now: i64, payload: &[u8]) -> Result<StageEffect, PipelineError> {
        let seq = self.ack.sent.sequence as u16;
        if !self.send_ring.try_acquire(seq) {
            trace!("send window is full at #{}", seq);
            return Err(PipelineError::OutgoingQueueIsFull);
        }

        let header = self.outbound_header(PacketType::Payload, seq, now);
        self.send_ring.set_header_and_packet(seq, &header, payload, now);
        self.ack.sent.sequence = seq.wrapping_add(1) as i32;
        self.timers.store_sent(seq, now);
        self.ack.mark_ack_sent();
        self.ack.stats.packets_sent += 1;
        self.last_sent_time = now;

        trace!("sending #{} with {} payload bytes, acking #{}", seq, payload.len(), header.acked_sequence_id);

        Ok(StageEffect {
            outbound: Some(BytesMut::from(self.send_ring.get(seq).expect("slot was just stored").datagram())),
            ..StageEffect::default()
        })
    }

    /// Process an inbound datagram: classify it, consume its piggy-backed ack, and either
    ///  deliver it, buffer it for later in-order delivery, or drop it.
    ///
    /// Returns an error only for datagrams that do not parse; stale and duplicated
    ///  packets are counted and absorbed.
    pub fn receive(&mut self, now: i64, datagram: &[u8]) -> anyhow::Result<StageEffect> {
        let mut buf = datagram;
        let header = PacketHeader::deser(&mut buf, self.window_size)?;
        let mut effect = StageEffect::default();

        if header.packet_type == PacketType::Ack {
            trace!("received bare ack for #{}", header.acked_sequence_id);
            self.read_ack(now, &header);
            return Ok(effect);
        }

        self.ack.stats.packets_received += 1;
        match self.ack.classify_inbound(header.sequence_id) {
            Classification::Stale => {
                debug!("received stale packet #{} - dropping", header.sequence_id);
            }
            Classification::Duplicate => {
                // a duplicate is dropped, but its ack fields are as good as any
                debug!("received duplicate packet #{} - dropping", header.sequence_id);
                self.read_ack(now, &header);
            }
            Classification::Fresh => {
                self.timers.store_remote_received(header.sequence_id, now);
                self.read_ack(now, &header);

                let next_expected = (self.delivered as u16).wrapping_add(1);
                if header.sequence_id == next_expected {
                    self.delivered = header.sequence_id as i32;
                    effect.delivery = Some(buf.to_vec());

                    let follow_up = header.sequence_id.wrapping_add(1);
                    if self.receive_ring.is_buffered(follow_up) {
                        self.resume = follow_up as i32;
                        effect.needs_resume = true;
                    }
                }
                else {
                    trace!("buffering out-of-order packet #{} while waiting for #{}", header.sequence_id, next_expected);
                    self.receive_ring.set_packet(header.sequence_id, buf);
                    self.ack.stats.packets_out_of_order += 1;
                }
            }
        }

        Ok(effect)
    }

    /// Deliver the next buffered packet after an in-order receive unblocked it. Requests
    ///  another invocation while the following sequence id is buffered as well.
    pub fn resume_receive(&mut self, _now: i64) -> StageEffect {
        let mut effect = StageEffect::default();
        if self.resume == NULL_ENTRY {
            return effect;
        }

        let seq = self.resume as u16;
        if let Some(slot) = self.receive_ring.get(seq) {
            trace!("resuming delivery of buffered packet #{}", seq);
            effect.delivery = Some(slot.payload().to_vec());
            self.receive_ring.release(seq);
            self.delivered = seq as i32;

            let follow_up = seq.wrapping_add(1);
            if !sequence::greater_than(follow_up, self.ack.received.sequence as u16)
                && self.receive_ring.is_buffered(follow_up)
            {
                self.resume = follow_up as i32;
                effect.needs_resume = true;
            }
            else {
                self.resume = NULL_ENTRY;
            }
        }
        else {
            self.resume = NULL_ENTRY;
        }
        effect
    }

    /// The idle tick: resend the oldest packet whose ack is overdue, or emit a standalone
    ///  ack if the peer is owed one. Requests another invocation while more resend
    ///  candidates remain.
    pub fn update(&mut self, now: i64) -> StageEffect {
        let mut effect = StageEffect::default();

        if let Some(seq) = self.oldest_resend_candidate(now) {
            let overdue_since = self.send_ring.get(seq).expect("candidate is occupied").send_time();
            debug!("resending #{}, unacked since {} ms (now {} ms)", seq, overdue_since, now);

            // the payload bytes are reused as stored; only the ack fields are refreshed
            let header = self.outbound_header(PacketType::Payload, seq, now);
            self.send_ring.rewrite_header(seq, &header, now);
            effect.outbound = Some(BytesMut::from(self.send_ring.get(seq).expect("candidate is occupied").datagram()));

            self.ack.stats.packets_resent += 1;
            self.ack.mark_ack_sent();
            self.last_sent_time = now;

            effect.needs_resume = self.oldest_resend_candidate(now).is_some();
        }
        else if self.ack.should_send_ack(self.last_sent_time, self.previous_timestamp) {
            let header = self.outbound_header(PacketType::Ack, self.ack.sent.sequence as u16, now);
            trace!("sending bare ack for #{}", header.acked_sequence_id);

            let mut buf = BytesMut::with_capacity(PacketHeader::CAPACITY);
            header.ser(&mut buf, self.window_size);
            effect.outbound = Some(buf);

            self.ack.mark_ack_sent();
            self.last_sent_time = now;
        }

        self.previous_timestamp = now;
        effect
    }

    pub fn statistics(&self) -> Statistics {
        self.ack.stats
    }

    pub fn rtt(&self) -> RttInfo {
        self.rtt
    }

    /// the number of unacknowledged packets currently held for resending
    pub fn in_flight_count(&self) -> usize {
        self.send_ring.occupied_count()
    }

    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }

    pub fn set_minimum_resend_time(&mut self, ms: i64) {
        self.minimum_resend_time = ms;
    }

    pub fn current_resend_time(&self) -> i64 {
        self.rtt.current_resend_time(self.minimum_resend_time)
    }

    /// fold the piggy-backed ack report into the sent-side state, feed the RTT estimator,
    ///  and free every slot the report covers
    fn read_ack(&mut self, now: i64, header: &PacketHeader) {
        self.ack.fold_remote_ack(header.acked_sequence_id, header.ack_mask);
        self.timers.on_ack(header.acked_sequence_id, now, header.processing_time, &mut self.rtt);
        self.ack.release_acked_packets(&mut self.send_ring);
    }

    fn outbound_header(&self, packet_type: PacketType, seq: u16, now: i64) -> PacketHeader {
        PacketHeader {
            packet_type,
            processing_time: self.reportable_processing_time(now),
            sequence_id: seq,
            acked_sequence_id: self.ack.received.sequence as u16,
            ack_mask: self.ack.received.ack_mask,
        }
    }

    /// ms between receiving the packet our ack anchors on and emitting this packet,
    ///  clipped to the 16-bit wire field
    fn reportable_processing_time(&self, now: i64) -> u16 {
        if self.ack.received.sequence == NULL_ENTRY {
            return 0;
        }
        match self.timers.remote_receive_time(self.ack.received.sequence as u16) {
            Some(received_at) => (now - received_at).clamp(0, u16::MAX as i64) as u16,
            None => 0,
        }
    }

    fn oldest_resend_candidate(&self, now: i64) -> Option<u16> {
        let resend_time = self.current_resend_time();
        let mut oldest: Option<u16> = None;
        for slot in self.send_ring.occupied() {
            if now > slot.send_time() + resend_time {
                let seq = slot.sequence_id() as u16;
                if oldest.map_or(true, |cur| sequence::less_than(seq, cur)) {
                    oldest = Some(seq);
                }
            }
        }
        oldest
    }
}
