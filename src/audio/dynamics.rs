//! Per-track tone and level shaping: a three band EQ and a feed-forward compressor.

use std::f32::consts::TAU;

use super::frame::StereoFrame;
use super::sidechain::one_pole_coefficient;

const LOW_CROSSOVER_HZ: f32 = 250.0;
const HIGH_CROSSOVER_HZ: f32 = 4000.0;

#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 1e-6 { -120.0 } else { 20.0 * linear.log10() }
}

fn lowpass_alpha(cutoff: f32, sample_rate: f32) -> f32 {
    1.0 - (-TAU * cutoff / sample_rate.max(1.0)).exp()
}

/// Low/mid/high gain split with two one-pole lowpasses. The three bands sum
/// back to the input exactly, so 0 dB everywhere is a true bypass.
#[derive(Debug, Clone)]
pub struct ThreeBandEq {
    sample_rate: f32,
    low_alpha: f32,
    high_alpha: f32,
    low_state: StereoFrame,
    high_state: StereoFrame,
    gains_db: [f32; 3],
    gains: [f32; 3],
}

impl ThreeBandEq {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            low_alpha: lowpass_alpha(LOW_CROSSOVER_HZ, sample_rate),
            high_alpha: lowpass_alpha(HIGH_CROSSOVER_HZ, sample_rate),
            low_state: StereoFrame::zero(),
            high_state: StereoFrame::zero(),
            gains_db: [0.0; 3],
            gains: [1.0; 3],
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        if sample_rate != self.sample_rate {
            *self = Self { gains_db: self.gains_db, gains: self.gains, ..Self::new(sample_rate) };
        }
    }

    pub fn set_gains_db(&mut self, low: f32, mid: f32, high: f32) {
        let db = [low, mid, high];
        if db != self.gains_db {
            self.gains_db = db;
            self.gains = db.map(db_to_linear);
        }
    }

    pub fn is_flat(&self) -> bool {
        self.gains_db == [0.0; 3]
    }

    #[inline]
    pub fn process(&mut self, input: StereoFrame) -> StereoFrame {
        self.low_state.left += self.low_alpha * (input.left - self.low_state.left);
        self.low_state.right += self.low_alpha * (input.right - self.low_state.right);
        self.high_state.left += self.high_alpha * (input.left - self.high_state.left);
        self.high_state.right += self.high_alpha * (input.right - self.high_state.right);

        let [gl, gm, gh] = self.gains;
        let band = |x: f32, lo: f32, below_high: f32| {
            lo * gl + (below_high - lo) * gm + (x - below_high) * gh
        };
        StereoFrame {
            left: band(input.left, self.low_state.left, self.high_state.left),
            right: band(input.right, self.low_state.right, self.high_state.right),
        }
    }

    pub fn reset(&mut self) {
        self.low_state = StereoFrame::zero();
        self.high_state = StereoFrame::zero();
    }
}

/// Peak-sensing compressor. Envelope smoothing uses the same one-pole law
/// as the sidechain follower.
#[derive(Debug, Clone)]
pub struct Compressor {
    sample_rate: f32,
    threshold_db: f32,
    ratio: f32,
    attack_secs: f32,
    release_secs: f32,
    attack_coeff: f32,
    release_coeff: f32,
    envelope: f32,
}

impl Compressor {
    pub fn new(sample_rate: f32) -> Self {
        let mut c = Self {
            sample_rate,
            threshold_db: -12.0,
            ratio: 4.0,
            attack_secs: 0.01,
            release_secs: 0.12,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            envelope: 0.0,
        };
        c.update_coefficients();
        c
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

    pub fn set_params(&mut self, threshold_db: f32, ratio: f32, attack_secs: f32, release_secs: f32) {
        self.threshold_db = threshold_db.min(0.0);
        self.ratio = ratio.max(1.0);
        if attack_secs != self.attack_secs || release_secs != self.release_secs {
            self.attack_secs = attack_secs;
            self.release_secs = release_secs;
            self.update_coefficients();
        }
    }

    /// Gain (linear) the current envelope calls for.
    #[inline]
    pub fn gain(&self) -> f32 {
        let env_db = linear_to_db(self.envelope);
        if env_db <= self.threshold_db {
            return 1.0;
        }
        let reduction_db = (self.threshold_db - env_db) * (1.0 - 1.0 / self.ratio);
        db_to_linear(reduction_db)
    }

    #[inline]
    pub fn process(&mut self, input: StereoFrame) -> StereoFrame {
        let level = input.peak();
        let coeff = if level > self.envelope { self.attack_coeff } else { self.release_coeff };
        self.envelope = level + coeff * (self.envelope - level);
        input.scaled(self.gain())
    }

    pub fn reset(&mut self) {
        self.envelope = 0.0;
    }
}
