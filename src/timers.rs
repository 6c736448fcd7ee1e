use crate::config::MAXIMUM_RESEND_TIME;
use crate::sequence::NULL_ENTRY;

/// Timing data for a packet we sent, used to compute the round-trip time once the peer's
///  ack for it comes back.
#[derive(Debug, Clone, Copy)]
struct LocalTimerEntry {
    sequence_id: i32,
    sent_time: i64,
    receive_time: i64,
    processing_time: u16,
}

/// Receive timestamp for a packet the peer sent, used to report the processing delay back
///  to the peer so it can subtract our think time from its RTT samples.
#[derive(Debug, Clone, Copy)]
struct RemoteTimerEntry {
    sequence_id: i32,
    receive_time: i64,
}

/// Two parallel tables of size `window_size`, keyed by `seq % window_size`. Entries are
///  overwritten when their slot comes around again, never freed - they live independently
///  of ring slot occupancy.
#[derive(Debug)]
pub struct TimerTables {
    window_size: u16,
    local: Vec<LocalTimerEntry>,
    remote: Vec<RemoteTimerEntry>,
}

impl TimerTables {
    /// deterministic size in bytes of the two tables for a given window
    pub fn capacity_needed(window_size: u16) -> usize {
        window_size as usize * (size_of::<LocalTimerEntry>() + size_of::<RemoteTimerEntry>())
    }

    pub fn new(window_size: u16) -> TimerTables {
        TimerTables {
            window_size,
            local: vec![LocalTimerEntry { sequence_id: NULL_ENTRY, sent_time: 0, receive_time: 0, processing_time: 0 }; window_size as usize],
            remote: vec![RemoteTimerEntry { sequence_id: NULL_ENTRY, receive_time: 0 }; window_size as usize],
        }
    }

    fn index(&self, seq: u16) -> usize {
        (seq % self.window_size) as usize
    }

    /// record the send timestamp for one of our own packets
    pub fn store_sent(&mut self, seq: u16, now: i64) {
        let index = self.index(seq);
        self.local[index] = LocalTimerEntry {
            sequence_id: seq as i32,
            sent_time: now,
            receive_time: 0,
            processing_time: 0,
        };
    }

    /// record the receive timestamp for a packet the peer sent
    pub fn store_remote_received(&mut self, seq: u16, now: i64) {
        let index = self.index(seq);
        self.remote[index] = RemoteTimerEntry {
            sequence_id: seq as i32,
            receive_time: now,
        };
    }

    pub fn remote_receive_time(&self, seq: u16) -> Option<i64> {
        let entry = &self.remote[self.index(seq)];
        if entry.sequence_id == seq as i32 {
            Some(entry.receive_time)
        }
        else {
            None
        }
    }

    /// Feed an ack for `acked_seq` into the RTT estimator. Only the first ack for a given
    ///  sequence id contributes a sample: a resent packet's second ack would attribute the
    ///  full resend interval to the network and bias the estimate upward.
    pub fn on_ack(&mut self, acked_seq: u16, now: i64, processing_time: u16, rtt: &mut RttInfo) {
        let index = self.index(acked_seq);
        let entry = &mut self.local[index];
        if entry.sequence_id != acked_seq as i32 || entry.receive_time != 0 {
            return;
        }
        entry.receive_time = now;
        entry.processing_time = processing_time;

        rtt.update((now - entry.sent_time - processing_time as i64).max(1));
    }
}

/// Smoothed round-trip state, updated per the classic Jacobson recurrences with fixed
///  gains 1/8 (mean) and 1/4 (variance), as in RFC 6298.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttInfo {
    pub last_rtt: i64,
    pub smoothed_rtt: f64,
    pub smoothed_variance: f64,
    pub resend_timeout: i64,
}

impl RttInfo {
    pub fn new() -> RttInfo {
        RttInfo {
            last_rtt: 50,
            smoothed_rtt: 50.0,
            smoothed_variance: 5.0,
            resend_timeout: 50,
        }
    }

    pub fn update(&mut self, sample_ms: i64) {
        self.last_rtt = sample_ms;
        let delta = sample_ms as f64 - self.smoothed_rtt;
        self.smoothed_rtt += delta / 8.0;
        self.smoothed_variance += (delta.abs() - self.smoothed_variance) / 4.0;
        self.resend_timeout = (self.smoothed_rtt + 4.0 * self.smoothed_variance).round() as i64;
    }

    /// the effective resend timeout, clamped to the configured floor and the protocol's
    ///  fixed ceiling
    pub fn current_resend_time(&self, minimum_resend_time: i64) -> i64 {
        self.resend_timeout.clamp(minimum_resend_time, MAXIMUM_RESEND_TIME)
    }
}

impl Default for RttInfo {
    fn default() -> Self {
        RttInfo::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_initial_values() {
        let rtt = RttInfo::new();
        assert_eq!(rtt.last_rtt, 50);
        assert_eq!(rtt.smoothed_rtt, 50.0);
        assert_eq!(rtt.smoothed_variance, 5.0);
        assert_eq!(rtt.resend_timeout, 50);
    }

    #[test]
    fn test_single_sample() {
        let mut rtt = RttInfo::new();
        rtt.update(90);
        assert_eq!(rtt.last_rtt, 90);
        assert_eq!(rtt.smoothed_rtt, 55.0);
        assert_eq!(rtt.smoothed_variance, 13.75);
        assert_eq!(rtt.resend_timeout, 110);
    }

    /// with a constant true RTT and no loss, the smoothed estimate converges to the true
    ///  value within 20 samples
    #[rstest]
    #[case(60)]
    #[case(40)]
    #[case(55)]
    fn test_convergence(#[case] true_rtt: i64) {
        let mut rtt = RttInfo::new();
        for _ in 0..20 {
            rtt.update(true_rtt);
        }
        assert!((rtt.smoothed_rtt - true_rtt as f64).abs() <= 1.0,
                "smoothed rtt {} did not converge to {}", rtt.smoothed_rtt, true_rtt);
    }

    #[rstest]
    #[case::below_floor(10, 64, 64)]
    #[case::between(100, 64, 100)]
    #[case::above_ceiling(1000, 64, 200)]
    #[case::custom_floor(10, 10, 10)]
    fn test_clamping(#[case] resend_timeout: i64, #[case] minimum: i64, #[case] expected: i64) {
        let rtt = RttInfo { resend_timeout, ..RttInfo::new() };
        assert_eq!(rtt.current_resend_time(minimum), expected);
    }

    #[test]
    fn test_rtt_sample_floor_is_one() {
        let mut tables = TimerTables::new(4);
        let mut rtt = RttInfo::new();
        tables.store_sent(0, 100);
        // peer reports more processing time than the interval - the sample floors at 1
        tables.on_ack(0, 103, 10, &mut rtt);
        assert_eq!(rtt.last_rtt, 1);
    }

    #[test]
    fn test_duplicate_ack_is_ignored() {
        let mut tables = TimerTables::new(4);
        let mut rtt = RttInfo::new();
        tables.store_sent(3, 0);
        tables.on_ack(3, 80, 0, &mut rtt);
        let after_first = rtt;

        tables.on_ack(3, 300, 0, &mut rtt);
        assert_eq!(rtt, after_first, "a second ack for the same seq must not bias the estimate");
    }

    #[test]
    fn test_ack_for_recycled_slot_is_ignored() {
        let mut tables = TimerTables::new(4);
        let mut rtt = RttInfo::new();
        tables.store_sent(1, 0);
        tables.store_sent(5, 10); // overwrites slot 1
        tables.on_ack(1, 80, 0, &mut rtt);
        assert_eq!(rtt.last_rtt, 50, "ack for an overwritten entry contributes no sample");
    }

    #[test]
    fn test_remote_receive_time() {
        let mut tables = TimerTables::new(4);
        tables.store_remote_received(2, 42);
        assert_eq!(tables.remote_receive_time(2), Some(42));
        assert_eq!(tables.remote_receive_time(6), None, "same slot, different seq");
    }
}
