//! Deep-audit schedule for the circuit breaker.
//!
//! Every `interval` rounds the reviewer is additionally asked whether the
//! session is still converging on its goal. Only on those rounds is a `STOP`
//! answer expected, though one seen off-cycle is still honored.

/// Default number of rounds between deep audits.
pub const DEFAULT_AUDIT_INTERVAL: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreaker {
    interval: u32,
}

impl CircuitBreaker {
    /// An interval of 0 disables deep audits.
    pub fn new(interval: u32) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Rounds `K-1`, `2K-1`, ... are deep-audit rounds.
    pub fn is_audit_round(&self, round: u32) -> bool {
        if self.interval == 0 {
            return false;
        }
        round % self.interval == self.interval - 1
    }

    /// Next audit round at or after `round`; `None` when audits are off or
    /// the next one lies past `u32::MAX`.
    pub fn next_audit_round(&self, round: u32) -> Option<u32> {
        if self.interval == 0 {
            return None;
        }
        let k = self.interval;
        ((round / k) * k).checked_add(k - 1)
    }

    /// Whether a stagnation signal arrived on a round where none was expected.
    pub fn is_off_cycle(&self, round: u32) -> bool {
        !self.is_audit_round(round)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_rounds_fall_one_before_each_multiple() {
        let breaker = CircuitBreaker::default();
        let audits: Vec<u32> = (0..15).filter(|r| breaker.is_audit_round(*r)).collect();
        assert_eq!(audits, vec![4, 9, 14]);
    }

    #[test]
    fn zero_interval_disables_audits() {
        let breaker = CircuitBreaker::new(0);
        assert!(!(0..20).any(|r| breaker.is_audit_round(r)));
        assert_eq!(breaker.next_audit_round(3), None);
        assert!(breaker.is_off_cycle(4));
    }

    #[test]
    fn next_audit_round_is_inclusive() {
        let breaker = CircuitBreaker::new(3);
        assert_eq!(breaker.next_audit_round(0), Some(2));
        assert_eq!(breaker.next_audit_round(2), Some(2));
        assert_eq!(breaker.next_audit_round(3), Some(5));
    }

    #[test]
    fn schedule_holds_at_the_top_of_the_range() {
        let breaker = CircuitBreaker::new(5);
        assert!(!breaker.is_audit_round(u32::MAX));
        assert!(breaker.is_audit_round(u32::MAX - 1));
        assert_eq!(breaker.next_audit_round(u32::MAX - 1), Some(u32::MAX - 1));
        assert_eq!(breaker.next_audit_round(u32::MAX), None);
        assert!(CircuitBreaker::new(1).is_audit_round(u32::MAX));
    }

    #[test]
    fn interval_of_one_audits_every_round() {
        let breaker = CircuitBreaker::new(1);
        assert!((0..5).all(|r| breaker.is_audit_round(r)));
    }
}
