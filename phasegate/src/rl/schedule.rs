// src/rl/schedule.rs
//
// Linear epsilon decay for epsilon-greedy exploration.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpsilonSchedule {
    pub start: f64,
    pub end: f64,
    pub decay_steps: u64,
}

impl EpsilonSchedule {
    pub fn new(start: f64, end: f64, decay_steps: u64) -> Self {
        Self {
            start: start.clamp(0.0, 1.0),
            end: end.clamp(0.0, 1.0),
            decay_steps,
        }
    }

    /// Epsilon after `step` global steps: `start` at 0, `end` from
    /// `decay_steps` on.
    pub fn value(&self, step: u64) -> f64 {
        if self.decay_steps == 0 || step >= self.decay_steps {
            return self.end;
        }
        let frac = step as f64 / self.decay_steps as f64;
        self.start + (self.end - self.start) * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decays_linearly_then_holds() {
        let s = EpsilonSchedule::new(1.0, 0.05, 10_000);
        assert_eq!(s.value(0), 1.0);
        assert!((s.value(5_000) - 0.525).abs() < 1e-12);
        assert_eq!(s.value(10_000), 0.05);
        assert_eq!(s.value(1_000_000), 0.05);
    }

    #[test]
    fn zero_decay_is_constant_end() {
        let s = EpsilonSchedule::new(1.0, 0.1, 0);
        assert_eq!(s.value(0), 0.1);
    }
}
