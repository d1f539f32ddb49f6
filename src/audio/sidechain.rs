//! Sidechain ducking: a one-pole envelope follower on a key signal that
//! turns into gain reduction for the track it is attached to.

/// Smoothing coefficient of a one-pole follower with time constant `secs`.
/// Zero or negative times give an instant (coefficient 0) follower.
#[inline]
pub fn one_pole_coefficient(secs: f32, sample_rate: f32) -> f32 {
    if secs <= 0.0 || sample_rate <= 0.0 {
        return 0.0;
    }
    (-1.0 / (secs * sample_rate)).exp()
}

#[derive(Debug, Clone)]
pub struct SidechainProcessor {
    sample_rate: f32,
    attack_secs: f32,
    release_secs: f32,
    attack_coeff: f32,
    release_coeff: f32,
    depth: f32,
    enabled: bool,
    envelope: f32,
}

impl SidechainProcessor {
    pub fn new(sample_rate: f32) -> Self {
        let mut sc = Self {
            sample_rate,
            attack_secs: 0.005,
            release_secs: 0.15,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            depth: 0.6,
            enabled: false,
            envelope: 0.0,
        };
        sc.update_coefficients();
        sc
    }

    fn update_coefficients(&mut self) {
        self.attack_coeff = one_pole_coefficient(self.attack_secs, self.sample_rate);
        self.release_coeff = one_pole_coefficient(self.release_secs, self.sample_rate);
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.update_coefficients();
        }
    }

    pub fn set_times(&mut self, attack_secs: f32, release_secs: f32) {
        if attack_secs != self.attack_secs || release_secs != self.release_secs {
            self.attack_secs = attack_secs;
            self.release_secs = release_secs;
            self.update_coefficients();
        }
    }

    pub fn set_depth(&mut self, depth: f32) {
        self.depth = depth.clamp(0.0, 1.0);
    }

    // Disabling drops the envelope so gain is back at unity immediately.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.envelope = 0.0;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn envelope(&self) -> f32 {
        self.envelope
    }

    /// Follow `key_level` for one frame and return the gain to apply, in [0, 1].
    #[inline]
    pub fn process(&mut self, key_level: f32) -> f32 {
        if !self.enabled {
            return 1.0;
        }
        let target = key_level.abs();
        let coeff = if target > self.envelope {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.envelope = target + coeff * (self.envelope - target);
        (1.0 - self.depth * self.envelope).clamp(0.0, 1.0)
    }

    pub fn reset(&mut self) {
        self.envelope = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_processor_is_transparent() {
        let mut sc = SidechainProcessor::new(44100.0);
        assert_eq!(sc.process(1.0), 1.0);
        assert_eq!(sc.envelope(), 0.0);
    }

    #[test]
    fn loud_key_ducks_then_recovers() {
        let mut sc = SidechainProcessor::new(1000.0);
        sc.set_enabled(true);
        sc.set_depth(1.0);
        sc.set_times(0.001, 0.01);
        let mut gain = 1.0;
        for _ in 0..50 {
            gain = sc.process(1.0);
        }
        assert!(gain < 0.01, "gain {gain}");
        for _ in 0..200 {
            gain = sc.process(0.0);
        }
        assert!(gain > 0.99, "gain {gain}");
    }

    #[test]
    fn gain_never_leaves_unit_range() {
        let mut sc = SidechainProcessor::new(1000.0);
        sc.set_enabled(true);
        sc.set_depth(1.0);
        sc.set_times(0.0, 0.0);
        assert_eq!(sc.process(-3.0), 0.0);
    }

    #[test]
    fn disabling_resets_the_envelope() {
        let mut sc = SidechainProcessor::new(1000.0);
        sc.set_enabled(true);
        sc.process(1.0);
        assert!(sc.envelope() > 0.0);
        sc.set_enabled(false);
        assert_eq!(sc.envelope(), 0.0);
        sc.set_enabled(true);
        assert_eq!(sc.process(0.0), 1.0);
    }

    #[test]
    fn coefficient_follows_the_time_constant() {
        let c = one_pole_coefficient(0.01, 1000.0);
        assert!((c - (-0.1f32).exp()).abs() < 1e-6);
        assert_eq!(one_pole_coefficient(0.0, 1000.0), 0.0);
    }
}
