//! One-pole low-pass filter for the raw temperature series.

/// First-order low-pass with a configurable time constant.
///
/// The first sample passes through unfiltered so the loop does not spend
/// its first time constant climbing up from zero.
#[derive(Debug, Clone, Copy)]
pub struct LowPass {
    /// Time constant [s]; ≤ 0 disables the filter.
    tau_s: f64,
    prev: Option<f64>,
}

impl LowPass {
    pub const fn new(tau_s: f64) -> Self {
        Self { tau_s, prev: None }
    }

    /// Feed one sample taken `dt` seconds after the previous one.
    pub fn apply(&mut self, input: f64, dt: f64) -> f64 {
        if self.tau_s <= 0.0 || dt <= 0.0 {
            self.prev = Some(input);
            return input;
        }
        let output = match self.prev {
            None => input,
            Some(prev) => {
                let alpha = dt / (self.tau_s + dt);
                prev + alpha * (input - prev)
            }
        };
        self.prev = Some(output);
        output
    }

    /// Most recent output, if any sample has been seen.
    #[inline]
    pub const fn value(&self) -> Option<f64> {
        self.prev
    }

    /// Drop history; the next sample passes through unfiltered.
    #[inline]
    pub fn reset(&mut self) {
        self.prev = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_passes_through() {
        let mut f = LowPass::new(3.0);
        assert_eq!(f.apply(25.0, 0.1), 25.0);
    }

    #[test]
    fn smooths_step_input() {
        let mut f = LowPass::new(3.0);
        f.apply(25.0, 0.1);
        let stepped = f.apply(100.0, 0.1);
        assert!(stepped > 25.0 && stepped < 30.0, "{stepped}");
        // Converges to the new level after many time constants.
        let mut last = stepped;
        for _ in 0..1000 {
            last = f.apply(100.0, 0.1);
        }
        assert!((last - 100.0).abs() < 0.1);
    }

    #[test]
    fn zero_time_constant_disables() {
        let mut f = LowPass::new(0.0);
        f.apply(25.0, 0.1);
        assert_eq!(f.apply(100.0, 0.1), 100.0);
    }

    #[test]
    fn reset_forgets_history() {
        let mut f = LowPass::new(3.0);
        f.apply(25.0, 0.1);
        f.reset();
        assert_eq!(f.apply(80.0, 0.1), 80.0);
    }
}
