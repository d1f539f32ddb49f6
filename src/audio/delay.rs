//! Feedback delay line.

use super::frame::StereoFrame;

/// Longest delay the line is sized for up front.
pub const MAX_DELAY_SECONDS: f32 = 2.0;

/// A stereo circular-buffer delay with feedback and dry/wet mix.
///
/// The buffers are allocated for [`MAX_DELAY_SECONDS`] at the current sample
/// rate, so moving the delay time around inside that range never allocates.
/// A sample-rate change, or a delay longer than the current capacity, resizes
/// the line and resets the write position; the resulting click is accepted.
#[derive(Debug, Clone)]
pub struct DelayEffect {
    buffer_l: Vec<f32>,
    buffer_r: Vec<f32>,
    write_pos: usize,
    sample_rate: f32,
    delay_samples: usize,
    feedback: f32,
    mix: f32,
}

impl DelayEffect {
    pub fn new(sample_rate: f32) -> Self {
        let sample_rate = sample_rate.max(1.0);
        let capacity = capacity_for(MAX_DELAY_SECONDS, sample_rate);
        Self {
            buffer_l: vec![0.0; capacity],
            buffer_r: vec![0.0; capacity],
            write_pos: 0,
            sample_rate,
            delay_samples: (0.25 * sample_rate) as usize,
            feedback: 0.35,
            mix: 0.3,
        }
    }

    pub fn with_params(sample_rate: f32, delay_secs: f32, feedback: f32, mix: f32) -> Self {
        let mut d = Self::new(sample_rate);
        d.set_delay_time(delay_secs);
        d.set_feedback(feedback);
        d.set_mix(mix);
        d
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn capacity(&self) -> usize {
        self.buffer_l.len()
    }

    pub fn delay_samples(&self) -> usize {
        self.delay_samples
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        let sample_rate = sample_rate.max(1.0);
        if sample_rate == self.sample_rate {
            return;
        }
        let secs = self.delay_samples as f32 / self.sample_rate;
        self.sample_rate = sample_rate;
        let capacity = capacity_for(MAX_DELAY_SECONDS.max(secs), sample_rate);
        self.resize(capacity);
        self.delay_samples = ((secs * sample_rate) as usize).clamp(1, capacity - 1);
    }

    pub fn set_delay_time(&mut self, secs: f32) {
        // at least one sample, otherwise the read would land on the slot about to be written
        let wanted = ((secs.max(0.0) * self.sample_rate).round() as usize).max(1);
        if wanted >= self.capacity() {
            self.resize(wanted + 1);
        }
        self.delay_samples = wanted;
    }

    pub fn set_feedback(&mut self, feedback: f32) {
        self.feedback = feedback.clamp(0.0, 0.99);
    }

    pub fn set_mix(&mut self, mix: f32) {
        self.mix = mix.clamp(0.0, 1.0);
    }

    fn resize(&mut self, capacity: usize) {
        self.buffer_l = vec![0.0; capacity];
        self.buffer_r = vec![0.0; capacity];
        self.write_pos = 0;
    }

    #[inline]
    pub fn process(&mut self, input: StereoFrame) -> StereoFrame {
        let len = self.buffer_l.len();
        let read_pos = (self.write_pos + len - self.delay_samples) % len;
        let delayed_l = self.buffer_l[read_pos];
        let delayed_r = self.buffer_r[read_pos];

        self.buffer_l[self.write_pos] = input.left + self.feedback * delayed_l;
        self.buffer_r[self.write_pos] = input.right + self.feedback * delayed_r;
        self.write_pos = (self.write_pos + 1) % len;

        let dry = 1.0 - self.mix;
        StereoFrame {
            left: input.left * dry + delayed_l * self.mix,
            right: input.right * dry + delayed_r * self.mix,
        }
    }

    pub fn clear(&mut self) {
        self.buffer_l.fill(0.0);
        self.buffer_r.fill(0.0);
        self.write_pos = 0;
    }
}

fn capacity_for(secs: f32, sample_rate: f32) -> usize {
    (secs * sample_rate).ceil() as usize + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_delay_without_feedback() {
        let mut delay = DelayEffect::with_params(1000.0, 0.01, 0.0, 1.0);
        assert_eq!(delay.delay_samples(), 10);
        let input: Vec<f32> = (0..50).map(|i| (i as f32 * 0.37).sin()).collect();
        for (t, x) in input.iter().enumerate() {
            let out = delay.process(StereoFrame::mono(*x));
            let expected = if t >= 10 { input[t - 10] } else { 0.0 };
            assert!((out.left - expected).abs() < 1e-6, "t={t}");
            assert!((out.right - expected).abs() < 1e-6, "t={t}");
        }
    }

    #[test]
    fn dry_mix_passes_input_through() {
        let mut delay = DelayEffect::with_params(44100.0, 0.5, 0.5, 0.0);
        let out = delay.process(StereoFrame::new(0.5, -0.5));
        assert_eq!(out, StereoFrame::new(0.5, -0.5));
    }

    #[test]
    fn feedback_attenuates_each_echo() {
        let mut delay = DelayEffect::with_params(1000.0, 0.01, 0.5, 1.0);
        delay.process(StereoFrame::mono(1.0));
        for _ in 1..10 {
            delay.process(StereoFrame::zero());
        }
        assert!((delay.process(StereoFrame::zero()).left - 1.0).abs() < 1e-6);
        for _ in 1..10 {
            delay.process(StereoFrame::zero());
        }
        assert!((delay.process(StereoFrame::zero()).left - 0.5).abs() < 1e-6);
    }

    #[test]
    fn long_delay_grows_the_line() {
        let mut delay = DelayEffect::new(100.0);
        let before = delay.capacity();
        delay.set_delay_time(5.0);
        assert!(delay.capacity() > before);
        assert_eq!(delay.delay_samples(), 500);
    }

    #[test]
    fn sample_rate_change_keeps_delay_time() {
        let mut delay = DelayEffect::with_params(1000.0, 0.1, 0.0, 1.0);
        delay.set_sample_rate(2000.0);
        assert_eq!(delay.delay_samples(), 200);
        assert!(delay.capacity() >= 4000);
    }
}
