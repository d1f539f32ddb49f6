use super::frame::StereoFrame;

/// Decoded PCM audio: interleaved 16-bit samples plus channel/rate metadata.
///
/// Immutable once built. The registry and the render thread share it through
/// an `Arc`, so swapping a track's buffer never invalidates one that a render
/// cycle is still reading.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBuffer {
    channels: u16,
    sample_rate: u32,
    samples: Vec<i16>, // interleaved
}

impl SampleBuffer {
    // A zero channel count is treated as mono rather than dividing by zero later.
    pub fn new(channels: u16, sample_rate: u32, samples: Vec<i16>) -> Self {
        Self {
            channels: channels.max(1),
            sample_rate: sample_rate.max(1),
            samples,
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    pub fn duration_secs(&self) -> f64 {
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Frame `index` as floats in [-1, 1]. Mono is duplicated to both sides,
    /// channels past the second are ignored, out of range reads are silent.
    #[inline]
    pub fn frame(&self, index: usize) -> StereoFrame {
        let ch = self.channels as usize;
        let base = index * ch;
        if index >= self.frame_count() {
            return StereoFrame::zero();
        }
        let left = to_f32(self.samples[base]);
        if ch == 1 {
            StereoFrame::mono(left)
        } else {
            StereoFrame::new(left, to_f32(self.samples[base + 1]))
        }
    }
}

#[inline]
fn to_f32(s: i16) -> f32 {
    s as f32 / 32768.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_is_derived_from_channels() {
        let buf = SampleBuffer::new(2, 48000, vec![0; 10]);
        assert_eq!(buf.frame_count(), 5);
        let odd = SampleBuffer::new(2, 48000, vec![0; 11]);
        assert_eq!(odd.frame_count(), 5);
        let zero = SampleBuffer::new(0, 48000, vec![0; 4]);
        assert_eq!(zero.channels(), 1);
        assert_eq!(zero.frame_count(), 4);
        assert_eq!(SampleBuffer::new(2, 1000, vec![0; 1000]).duration_secs(), 0.5);
    }

    #[test]
    fn mono_frames_are_duplicated() {
        let buf = SampleBuffer::new(1, 44100, vec![16384, -32768]);
        assert_eq!(buf.frame(0), StereoFrame::mono(0.5));
        assert_eq!(buf.frame(1), StereoFrame::mono(-1.0));
        assert_eq!(buf.frame(2), StereoFrame::zero());
    }

    #[test]
    fn stereo_frames_keep_sides_apart() {
        let buf = SampleBuffer::new(2, 44100, vec![16384, -16384]);
        assert_eq!(buf.frame(0), StereoFrame::new(0.5, -0.5));
    }
}
