//! Wraparound-safe arithmetic on 16-bit packet sequence numbers.
//!
//! Sequence numbers wrap at 2^16, so plain integer comparison is meaningless once a
//!  connection has been running for a while. All comparisons use the half-range
//!  convention: a sequence number is 'greater' than another if it is at most 0x7FFF
//!  steps ahead of it going forward.

/// Sentinel for 'no sequence number' in the shared contexts and slot bookkeeping. The
///  stored values are `i32` so that this sentinel coexists with the full u16 value range.
pub const NULL_ENTRY: i32 = -1;

/// Half-range comparison: true iff `lhs` is ahead of `rhs` by at most half the sequence
///  space, taking wraparound into account.
pub fn greater_than(lhs: u16, rhs: u16) -> bool {
    (lhs > rhs && lhs - rhs <= 0x7FFF) || (lhs < rhs && rhs - lhs > 0x7FFF)
}

pub fn less_than(lhs: u16, rhs: u16) -> bool {
    greater_than(rhs, lhs)
}

/// Forward distance from `rhs` to `lhs`, i.e. the number of increments that take `rhs`
///  to `lhs` modulo 2^16. Always in `[0, 0xFFFF]`.
pub fn abs_distance(lhs: u16, rhs: u16) -> i32 {
    if lhs < rhs {
        lhs as i32 + 0x10000 - rhs as i32
    }
    else {
        lhs as i32 - rhs as i32
    }
}

/// A packet is stale if its sequence id predates the receive window, i.e. it is more than
///  `window` steps behind the next expected sequence id.
pub fn is_stale(seq: u16, expected: u16, window: u16) -> bool {
    less_than(seq, expected.wrapping_sub(window))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 0, true)]
    #[case(0, 1, false)]
    #[case(0, 0, false)]
    #[case(0x7FFF, 0, true)]
    #[case(0x8000, 0, false)]
    #[case(0, 0xFFFF, true)]
    #[case(0xFFFF, 0, false)]
    #[case(0x0003, 0xFFFE, true)]
    #[case(0xFFFE, 0x0003, false)]
    fn test_greater_than(#[case] lhs: u16, #[case] rhs: u16, #[case] expected: bool) {
        assert_eq!(greater_than(lhs, rhs), expected);
        if lhs != rhs {
            assert_eq!(less_than(rhs, lhs), expected);
        }
    }

    #[rstest]
    #[case(5, 5, 0)]
    #[case(6, 5, 1)]
    #[case(5, 6, 0xFFFF)]
    #[case(0x0000, 0xFFFF, 1)]
    #[case(0x0003, 0xFFFE, 5)]
    #[case(0xFFFF, 0x0000, 0xFFFF)]
    fn test_abs_distance(#[case] lhs: u16, #[case] rhs: u16, #[case] expected: i32) {
        assert_eq!(abs_distance(lhs, rhs), expected);
    }

    #[rstest]
    #[case(0, 1, 4, false)]
    #[case(5, 10, 4, true)]
    #[case(6, 10, 4, false)]
    #[case(0xFFFE, 0x0002, 4, false)]
    #[case(0xFFFD, 0x0002, 4, true)]
    #[case(0xFFFF, 0, 4, false)]
    fn test_is_stale(#[case] seq: u16, #[case] expected_seq: u16, #[case] window: u16, #[case] stale: bool) {
        assert_eq!(is_stale(seq, expected_seq, window), stale);
    }

    /// comparisons and distances must be invariant under an additive shift of all
    ///  sequence numbers
    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(0x7FFF)]
    #[case(0x8000)]
    #[case(0xFFFE)]
    fn test_shift_invariance(#[case] shift: u16) {
        let pairs = [(0u16, 0u16), (1, 0), (0, 1), (10, 3), (3, 10), (0x7FFF, 0), (0x8000, 1)];
        for (a, b) in pairs {
            let (sa, sb) = (a.wrapping_add(shift), b.wrapping_add(shift));
            assert_eq!(greater_than(sa, sb), greater_than(a, b), "greater_than({a},{b}) shifted by {shift}");
            assert_eq!(abs_distance(sa, sb), abs_distance(a, b), "abs_distance({a},{b}) shifted by {shift}");
        }
    }
}
