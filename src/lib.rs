//! This is the reliable-sequenced core of a low-latency UDP transport: it takes an
//!  unreliable, unordered, possibly-duplicating datagram channel and presents the upper
//!  layer with an in-order, exactly-once stream of messages, bounded by a fixed sliding
//!  window and driven by an adaptive retransmission timer.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data as
//!   opposed to streams of bytes)
//! * Prioritise low latency over throughput: a fixed in-flight window, no congestion
//!   control, no Nagle-style coalescing - this is built for game state and similar
//!   high-frequency, small-payload traffic
//! * Acknowledgements cost (almost) nothing: every outbound packet piggy-backs the full
//!   receive-side ack state, and a dedicated ack datagram is only sent when the
//!   connection goes quiet while the peer is owed information
//! * Buffer incoming data if packets are missing, delaying delivery to the application
//!   until gaps are filled
//! * Retransmission is timer-driven from smoothed round-trip measurements, with the
//!   peer's processing delay factored out of every sample
//! * The protocol does not require an explicit handshake: peers sync on the place in
//!   the packet stream 'on the go', and per-connection state is created on first contact
//! * No encryption and no checksums at this layer - the datagram substrate is trusted to
//!   hand up intact packets, and confidentiality is a concern for the layer above
//!
//! ## Header
//!
//! Packet header (inside a UDP datagram) - all numbers little-endian:
//!
//! ```ascii
//! 0:  packet type (u16): 0 = payload, 1 = ack
//! 2:  processing time (u16): ms between the peer receiving the packet acked below and
//!      emitting this packet
//! 4:  sequence id (u16): this packet's sequence number, wrapping at FFFF
//! 6:  acked sequence id (u16): anchor of the ack bitmap
//! 8:  ack mask (u32 for windows <= 32, u64 above): bit i set means 'acked sequence
//!      id - i' was received
//! ```
//!
//! The wire header is 12 or 16 bytes depending on the window size; in memory it is
//!  always kept in the full 16-byte form.
//!
//! ## Delivery guarantees
//!
//! A send either returns an error immediately (window full, transient) or is delivered
//!  to the peer's upper layer exactly once, in send order, as long as the connection
//!  stays live and both sides keep ticking. There is no delivery-failure callback and no
//!  per-message cancellation; giving up is done by tearing down the connection.
//!
//! ## Related
//!
//! * TCP provides the same ordering guarantee but couples it with stream semantics,
//!    congestion control and head-of-line blocking on the socket level
//! * QUIC is connection-based with enforced encryption and stream multiplexing - a far
//!    bigger machine than a game loop needs per tick
//! * The ack-bitmap idea is the classic game-networking approach: a 16-bit sequence
//!    number plus a bitfield of recent receipts in every header

mod ack;
mod buffers;
mod config;
mod end_point;
mod errors;
mod packet_header;
mod packet_ring;
mod pipeline;
mod sequence;
mod timers;

pub use ack::Statistics;
pub use buffers::fixed_buf::FixedBuf;
pub use buffers::pool::BufferPool;
pub use config::{ReliableConfig, MAXIMUM_RESEND_TIME};
pub use end_point::{DatagramSink, EndPoint, MessageDispatcher};
pub use errors::PipelineError;
pub use packet_header::{PacketHeader, PacketType};
pub use pipeline::{ReliableStage, StageEffect};
pub use timers::RttInfo;
