use serde::{Deserialize, Serialize};

use super::delay::DelayEffect;
use super::dynamics::{Compressor, ThreeBandEq};
use super::frame::StereoFrame;

// Built-in master inserts, described as plain data so the control thread can
// build one and ship it to the render thread inside an AudioCommand.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectSpec {
    Delay { time_secs: f32, feedback: f32, mix: f32 },
    Compressor { threshold_db: f32, ratio: f32, attack_secs: f32, release_secs: f32 },
    Eq { low_db: f32, mid_db: f32, high_db: f32 },
}

impl EffectSpec {
    pub fn to_effect(&self, sample_rate: f32) -> Box<dyn Effect> {
        match *self {
            EffectSpec::Delay { time_secs, feedback, mix } => {
                Box::new(DelayEffect::with_params(sample_rate, time_secs, feedback, mix))
            }
            EffectSpec::Compressor { threshold_db, ratio, attack_secs, release_secs } => {
                let mut c = Compressor::new(sample_rate);
                c.set_params(threshold_db, ratio, attack_secs, release_secs);
                Box::new(c)
            }
            EffectSpec::Eq { low_db, mid_db, high_db } => {
                let mut eq = ThreeBandEq::new(sample_rate);
                eq.set_gains_db(low_db, mid_db, high_db);
                Box::new(eq)
            }
        }
    }

    pub fn label(&self) -> String {
        match self {
            EffectSpec::Delay { time_secs, .. } => format!("Delay({time_secs}s)"),
            EffectSpec::Compressor { ratio, .. } => format!("Compressor({ratio}:1)"),
            EffectSpec::Eq { low_db, mid_db, high_db } => format!("Eq({low_db}/{mid_db}/{high_db})"),
        }
    }
}

/// A stereo, in-place block transform on the master bus.
pub trait Effect: Send {
    fn process(&mut self, buf: &mut [StereoFrame]);

    // Drop any internal tails (delay lines, envelopes).
    fn reset(&mut self) {}
}

impl Effect for DelayEffect {
    fn process(&mut self, buf: &mut [StereoFrame]) {
        for f in buf.iter_mut() {
            *f = DelayEffect::process(self, *f);
        }
    }

    fn reset(&mut self) {
        self.clear();
    }
}

impl Effect for Compressor {
    fn process(&mut self, buf: &mut [StereoFrame]) {
        for f in buf.iter_mut() {
            *f = Compressor::process(self, *f);
        }
    }

    fn reset(&mut self) {
        Compressor::reset(self);
    }
}

impl Effect for ThreeBandEq {
    fn process(&mut self, buf: &mut [StereoFrame]) {
        for f in buf.iter_mut() {
            *f = ThreeBandEq::process(self, *f);
        }
    }

    fn reset(&mut self) {
        ThreeBandEq::reset(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_insert_delays_the_block() {
        let spec = EffectSpec::Delay { time_secs: 0.002, feedback: 0.0, mix: 1.0 };
        let mut fx = spec.to_effect(1000.0); // 2 frames
        let mut buf = [StereoFrame::mono(1.0), StereoFrame::zero(), StereoFrame::zero(), StereoFrame::zero()];
        fx.process(&mut buf);
        assert_eq!(buf[0], StereoFrame::zero());
        assert_eq!(buf[2], StereoFrame::mono(1.0));

        fx.reset();
        let mut silent = [StereoFrame::zero(); 4];
        fx.process(&mut silent);
        assert!(silent.iter().all(|f| *f == StereoFrame::zero()));
    }

    #[test]
    fn flat_eq_is_transparent() {
        let mut fx = EffectSpec::Eq { low_db: 0.0, mid_db: 0.0, high_db: 0.0 }.to_effect(48000.0);
        let mut buf = [StereoFrame::new(0.25, -0.5); 8];
        fx.process(&mut buf);
        for f in buf {
            assert!((f.left - 0.25).abs() < 1e-4);
            assert!((f.right + 0.5).abs() < 1e-4);
        }
    }

    #[test]
    fn labels_name_the_effect() {
        assert!(EffectSpec::Compressor { threshold_db: -10.0, ratio: 4.0, attack_secs: 0.01, release_secs: 0.1 }
            .label()
            .starts_with("Compressor"));
    }
}
