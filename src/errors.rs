use thiserror::Error;

/// Error codes surfaced by the reliable-sequenced pipeline stage.
///
/// The classification outcomes (`StalePacket`, `DuplicatedPacket`) are absorbed inside the
///  stage - they are counted in the statistics and the packet is dropped, the caller never
///  sees them as errors. `OutgoingQueueIsFull` is the only error crossing the send call, and
///  `InsufficientMemory` is returned from initialisation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The inbound packet's sequence id is older than the receive window - nothing to do
    ///  with it but drop it.
    #[error("packet is older than the receive window")]
    StalePacket,

    /// The inbound packet was seen before, either as a network duplicate or as a resend of
    ///  a packet whose ack got lost. The two are indistinguishable on the wire.
    #[error("packet was already received")]
    DuplicatedPacket,

    /// The send window is saturated: there are `WindowSize` unacked packets in flight.
    ///  This is transient - the caller should retry after the next update tick.
    #[error("send window is full")]
    OutgoingQueueIsFull,

    /// A scratch buffer handed to initialisation is smaller than the deterministic minimum
    ///  for the given configuration. Fatal for this pipeline instance.
    #[error("provided buffer is too small for the configured window")]
    InsufficientMemory,
}

impl PipelineError {
    /// The wire-level error code, for callers that log or compare against the protocol's
    ///  numeric convention.
    pub fn code(&self) -> i32 {
        match self {
            PipelineError::StalePacket => -1,
            PipelineError::DuplicatedPacket => -2,
            PipelineError::OutgoingQueueIsFull => -7,
            PipelineError::InsufficientMemory => -8,
        }
    }
}
