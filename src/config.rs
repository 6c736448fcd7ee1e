use std::time::Duration;
use anyhow::bail;

/// The resend timeout is never allowed above this, regardless of what the RTT estimator
///  reports. A peer that stops acking for longer than this is better served by frequent
///  probing than by exponential patience - the protocol is built for low latency, not for
///  long-haul links.
pub const MAXIMUM_RESEND_TIME: i64 = 200;

#[derive(Debug, Clone)]
pub struct ReliableConfig {
    /// The maximum number of unacknowledged packets in flight per direction, and at the
    ///  same time the capacity of every ring and timer buffer. Must be in `[1, 64]`: the
    ///  ack bitmap on the wire has at most 64 bits, so a bigger window could not be
    ///  acknowledged compactly.
    ///
    /// Windows of 32 or less use the truncated 12-byte header (4-byte ack mask on the
    ///  wire); bigger windows pay for the full 8-byte mask.
    pub window_size: u16,

    /// Milliseconds below which the adaptive resend timeout is clamped. Runtime-settable
    ///  per stage; choosing this too small causes spurious resends on jittery links.
    pub minimum_resend_time: i64,

    /// This is the maximum application payload per packet. The protocol enforces
    ///  non-fragmentation of datagrams, so this (plus the header) must fit the smallest
    ///  MTU on all routes between the peers.
    ///
    /// In an ideal world we would discover the MTU, but discovery does not work reliably
    ///  across surprising network hardware, so the responsibility stays with the
    ///  application. With full Ethernet frames and no optional IP headers the UDP payload
    ///  is `1500 - 20 - 8 = 1472` for IPV4, leaving 1456 bytes after the 16-byte header.
    pub max_payload_len: usize,

    /// Interval of the endpoint's update tick, which drives resend scans and standalone
    ///  ack emission. The stage itself never advances time - if no update is called, no
    ///  resend fires.
    pub update_interval: Duration,

    /// This is the number of scratch buffers pooled by the endpoint - buffers in excess
    ///  of this number are discarded when they are returned.
    pub buffer_pool_size: usize,
}

impl ReliableConfig {
    pub fn default_ipv4() -> ReliableConfig {
        ReliableConfig {
            window_size: 32,
            minimum_resend_time: 64,
            max_payload_len: 1456,
            update_interval: Duration::from_millis(10),
            buffer_pool_size: 256,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_size < 1 || self.window_size > 64 {
            bail!("window size must be in [1, 64], was {}", self.window_size);
        }
        if self.minimum_resend_time < 1 || self.minimum_resend_time > MAXIMUM_RESEND_TIME {
            bail!("minimum resend time must be in [1, {}] ms, was {}", MAXIMUM_RESEND_TIME, self.minimum_resend_time);
        }
        if self.max_payload_len == 0 {
            bail!("max payload length must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::default_window(32, 64, 1456, true)]
    #[case::smallest_window(1, 64, 1456, true)]
    #[case::biggest_window(64, 64, 1456, true)]
    #[case::window_too_big(65, 64, 1456, false)]
    #[case::window_zero(0, 64, 1456, false)]
    #[case::resend_zero(32, 0, 1456, false)]
    #[case::resend_above_max(32, 201, 1456, false)]
    #[case::no_payload(32, 64, 0, false)]
    fn test_validate(#[case] window_size: u16, #[case] minimum_resend_time: i64, #[case] max_payload_len: usize, #[case] valid: bool) {
        let config = ReliableConfig {
            window_size,
            minimum_resend_time,
            max_payload_len,
            ..ReliableConfig::default_ipv4()
        };
        assert_eq!(config.validate().is_ok(), valid);
    }
}
