use std::time::Duration;

/// Reconnect delay schedule.
///
/// The first retry waits `initial`; each further retry multiplies the delay
/// by `multiplier` up to `max`. A successful open resets the schedule.
/// `jitter_ratio` spreads each delay by up to that fraction in either
/// direction.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter_ratio: f64,
    current: Duration,
}

impl ReconnectPolicy {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter_ratio: f64) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self {
            initial,
            max,
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
            jitter_ratio: if jitter_ratio.is_finite() {
                jitter_ratio.clamp(0.0, 1.0)
            } else {
                0.0
            },
            current: initial,
        }
    }

    /// Fixed delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1.0, 0.0)
    }

    /// Delay before the next attempt. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = base.mul_f64(self.multiplier).min(self.max);
        apply_jitter(base, self.jitter_ratio)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Un-jittered delay the next call to [`Self::next_delay`] is based on.
    pub fn peek(&self) -> Duration {
        self.current
    }
}

fn apply_jitter(base: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 {
        return base;
    }
    // Uniform in [-1.0, 1.0].
    let unit = (rand::random::<u32>() as f64 / u32::MAX as f64) * 2.0 - 1.0;
    let factor = 1.0 + unit * ratio;
    base.mul_f64(factor.max(0.0))
}
