use std::f32::consts::{FRAC_PI_4, TAU};
use std::sync::Arc;

use crate::pipeline::params::Param;
use crate::pipeline::registry::TrackData;
use crate::pipeline::steps::StepNote;
use crate::shared::{TrackId, TrackType};

use super::delay::DelayEffect;
use super::dynamics::{Compressor, ThreeBandEq};
use super::frame::StereoFrame;
use super::sample_buffer::SampleBuffer;
use super::sidechain::SidechainProcessor;

/// Level a held synth gate settles at.
pub const GATED_LEVEL: f32 = 0.8;
/// Level a trigger jumps the envelope to before it settles.
pub const TRIGGER_LEVEL: f32 = 1.0;
/// Per-frame multiplier applied to every envelope while the transport is stopped.
pub const STOP_DECAY: f32 = 0.999;
const SILENCE_FLOOR: f32 = 1.0e-5;

#[inline]
pub fn midi_to_hz(note: f32) -> f32 {
    440.0 * 2.0_f32.powf((note - 69.0) / 12.0)
}

#[inline]
fn semitones_to_ratio(semis: f32) -> f64 {
    2.0_f64.powf(semis as f64 / 12.0)
}

// Linear per-frame step that covers a full 0..1 swing in `secs`.
fn ramp_step(secs: f32, sample_rate: f32) -> f32 {
    let frames = secs * sample_rate;
    if frames <= 1.0 { 1.0 } else { 1.0 / frames }
}

/// Constant-power pan. `pan` is -1 (hard left) ..= 1 (hard right).
#[inline]
pub fn pan_frame(frame: StereoFrame, pan: f32) -> StereoFrame {
    let angle = (pan.clamp(-1.0, 1.0) + 1.0) * FRAC_PI_4;
    StereoFrame::new(frame.left * angle.cos(), frame.right * angle.sin())
}

// ── Envelope ──────────────────────────────────────────────────────

/// Attack/release ramp with fixed per-frame increments. A trigger jumps to
/// [`TRIGGER_LEVEL`]; after that the level walks toward [`GATED_LEVEL`] while
/// the gate is held and toward zero once it drops.
#[derive(Clone, Debug)]
pub struct Envelope {
    level: f32,
    rise: f32,
    fall: f32,
}

impl Envelope {
    pub fn new(attack_secs: f32, release_secs: f32, sample_rate: f32) -> Self {
        let mut env = Self { level: 0.0, rise: 1.0, fall: 1.0 };
        env.set_times(attack_secs, release_secs, sample_rate);
        env
    }

    pub fn set_times(&mut self, attack_secs: f32, release_secs: f32, sample_rate: f32) {
        self.rise = ramp_step(attack_secs, sample_rate);
        self.fall = ramp_step(release_secs, sample_rate);
    }

    #[inline]
    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn trigger(&mut self) {
        self.level = TRIGGER_LEVEL;
    }

    #[inline]
    pub fn update(&mut self, gated: bool) -> f32 {
        let target = if gated { GATED_LEVEL } else { 0.0 };
        if self.level < target {
            self.level = (self.level + self.rise).min(target);
        } else if self.level > target {
            self.level = (self.level - self.fall).max(target);
        }
        self.level
    }

    // transport stopped: exponential fade, no gate involved
    #[inline]
    pub fn decay(&mut self) {
        self.level *= STOP_DECAY;
        if self.level < SILENCE_FLOOR {
            self.level = 0.0;
        }
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}

// ── Oscillator ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default)]
struct Oscillator {
    phase: f32,
    phase_inc: f32, // radians per frame
}

impl Oscillator {
    fn set_frequency(&mut self, hz: f32, sample_rate: f32) {
        self.phase_inc = TAU * hz / sample_rate;
    }

    #[inline]
    fn next(&mut self) -> f32 {
        let out = self.phase.sin();
        self.phase += self.phase_inc;
        if self.phase > TAU {
            self.phase -= TAU;
        }
        out
    }
}

// ── Sample playback ───────────────────────────────────────────────

/// One-shot playback of a track's sample buffer at the device rate.
#[derive(Clone, Debug)]
pub struct SamplePlayer {
    buffer: Option<Arc<SampleBuffer>>,
    position: f64, // in source frames
    rate_ratio: f64,
    increment: f64,
    playing: bool,
    elapsed: f32, // output frames since the trigger
    attack_frames: f32,
    release_frames: f32,
}

impl SamplePlayer {
    pub fn new() -> Self {
        Self {
            buffer: None,
            position: 0.0,
            rate_ratio: 1.0,
            increment: 1.0,
            playing: false,
            elapsed: 0.0,
            attack_frames: 0.0,
            release_frames: 0.0,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn increment(&self) -> f64 {
        self.increment
    }

    pub fn set_fades(&mut self, attack_secs: f32, release_secs: f32, sample_rate: f32) {
        self.attack_frames = (attack_secs * sample_rate).max(0.0);
        self.release_frames = (release_secs * sample_rate).max(0.0);
    }

    /// Adopt `incoming` if it is a different buffer than the cached one.
    /// Returns true on a swap; the position restarts and the rate increment
    /// is recomputed for the new buffer.
    pub fn sync_buffer(&mut self, incoming: Option<Arc<SampleBuffer>>, device_rate: f32) -> bool {
        let same = match (&self.buffer, &incoming) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if same {
            return false;
        }
        self.rate_ratio = match &incoming {
            Some(buf) => buf.sample_rate() as f64 / device_rate as f64,
            None => 1.0,
        };
        self.increment = self.rate_ratio;
        self.position = 0.0;
        self.elapsed = 0.0;
        self.playing = self.playing && incoming.as_ref().is_some_and(|b| !b.is_empty());
        self.buffer = incoming;
        true
    }

    // Device renegotiated its rate: keep the source rate and the current pitch.
    pub fn set_device_rate(&mut self, device_rate: f32) {
        let Some(buf) = &self.buffer else {
            return;
        };
        let pitch = self.increment / self.rate_ratio;
        self.rate_ratio = buf.sample_rate() as f64 / device_rate as f64;
        self.increment = self.rate_ratio * pitch;
    }

    /// Restart from the top. Without a loaded, non-empty buffer this is a no-op
    /// and the player stays silent.
    pub fn trigger(&mut self, pitch_semitones: f32) {
        match &self.buffer {
            Some(buf) if !buf.is_empty() => {
                self.position = 0.0;
                self.elapsed = 0.0;
                self.increment = self.rate_ratio * semitones_to_ratio(pitch_semitones);
                self.playing = true;
            }
            _ => self.playing = false,
        }
    }

    pub fn halt(&mut self) {
        self.playing = false;
    }

    pub fn reset(&mut self) {
        self.playing = false;
        self.position = 0.0;
        self.elapsed = 0.0;
    }

    #[inline]
    pub fn next(&mut self) -> StereoFrame {
        if !self.playing {
            return StereoFrame::zero();
        }
        let Some(buf) = &self.buffer else {
            self.playing = false;
            return StereoFrame::zero();
        };
        let frames = buf.frame_count();
        let index = self.position.floor() as usize;
        if index >= frames {
            self.playing = false;
            return StereoFrame::zero();
        }

        let mut gain = 1.0f32;
        if self.attack_frames > 0.0 && self.elapsed < self.attack_frames {
            gain = self.elapsed / self.attack_frames;
        }
        if self.release_frames > 0.0 {
            let remaining = ((frames as f64 - self.position) / self.increment) as f32;
            if remaining < self.release_frames {
                gain = gain.min(remaining / self.release_frames);
            }
        }
        let out = buf.frame(index).scaled(gain);

        self.position += self.increment;
        self.elapsed += 1.0;
        if self.position >= frames as f64 {
            self.playing = false;
        }
        out
    }
}

impl Default for SamplePlayer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Per-track playback state ──────────────────────────────────────

/// Everything the render loop keeps for one track between frames. Parameters
/// are pulled from the track's atomics once per cycle in [`configure`]; the
/// per-frame path only touches this struct.
///
/// [`configure`]: PlaybackState::configure
pub(crate) struct PlaybackState {
    id: TrackId,
    kind: TrackType,
    sample_rate: f32,

    envelope: Envelope,
    osc: Oscillator,
    pub(crate) player: SamplePlayer,

    eq: ThreeBandEq,
    compressor: Compressor,
    compressor_on: bool,
    delay: DelayEffect,
    delay_on: bool,
    sidechain: SidechainProcessor,
    sidechain_source: TrackId,
    pub(crate) key_slot: Option<usize>, // cache index of the sidechain source

    lfo_phase: f32,
    lfo_inc: f32,
    lfo_depth: f32,
    lfo_on: bool,

    volume: f32,
    pan: f32,
    muted: bool,
    hit_gain: f32,
    hit_pan: f32,

    level: f32, // output peak of the last rendered frame
}

impl PlaybackState {
    pub(crate) fn new(id: TrackId, sample_rate: f32) -> Self {
        let attack = Param::SynthAttack.spec().default / 1000.0;
        let release = Param::SynthRelease.spec().default / 1000.0;
        Self {
            id,
            kind: TrackType::default(),
            sample_rate,
            envelope: Envelope::new(attack, release, sample_rate),
            osc: Oscillator::default(),
            player: SamplePlayer::new(),
            eq: ThreeBandEq::new(sample_rate),
            compressor: Compressor::new(sample_rate),
            compressor_on: false,
            delay: DelayEffect::new(sample_rate),
            delay_on: false,
            sidechain: SidechainProcessor::new(sample_rate),
            sidechain_source: TrackId::NONE,
            key_slot: None,
            lfo_phase: 0.0,
            lfo_inc: 0.0,
            lfo_depth: 0.0,
            lfo_on: false,
            volume: Param::Volume.spec().default,
            pan: 0.0,
            muted: false,
            hit_gain: 1.0,
            hit_pan: 0.0,
            level: 0.0,
        }
    }

    pub(crate) fn id(&self) -> TrackId {
        self.id
    }

    pub(crate) fn sidechain_source(&self) -> TrackId {
        self.sidechain_source
    }

    pub(crate) fn level(&self) -> f32 {
        self.level
    }

    pub(crate) fn envelope(&self) -> f32 {
        self.envelope.level()
    }

    /// Pull this cycle's parameters from the track and pick up a swapped
    /// sample buffer.
    pub(crate) fn configure(&mut self, track: &TrackData, sample_rate: f32) {
        let p = &track.params;
        self.kind = track.track_type();
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.eq.set_sample_rate(sample_rate);
            self.compressor.set_sample_rate(sample_rate);
            self.delay.set_sample_rate(sample_rate);
            self.sidechain.set_sample_rate(sample_rate);
            self.player.set_device_rate(sample_rate);
        }

        self.volume = p.get(Param::Volume);
        self.pan = p.get(Param::Pan);
        self.muted = p.get_bool(Param::Mute);

        self.eq.set_gains_db(p.get(Param::EqLow), p.get(Param::EqMid), p.get(Param::EqHigh));

        self.compressor_on = p.get_bool(Param::CompressorEnabled);
        self.compressor.set_params(
            p.get(Param::CompressorThreshold),
            p.get(Param::CompressorRatio),
            p.get(Param::CompressorAttack) / 1000.0,
            p.get(Param::CompressorRelease) / 1000.0,
        );

        self.delay_on = p.get_bool(Param::DelayEnabled);
        self.delay.set_delay_time(p.get(Param::DelayTime));
        self.delay.set_feedback(p.get(Param::DelayFeedback));
        self.delay.set_mix(p.get(Param::DelayMix));

        self.sidechain.set_enabled(p.get_bool(Param::SidechainEnabled));
        self.sidechain.set_depth(p.get(Param::SidechainDepth));
        self.sidechain.set_times(
            p.get(Param::SidechainAttack) / 1000.0,
            p.get(Param::SidechainRelease) / 1000.0,
        );
        self.sidechain_source = TrackId(p.get(Param::SidechainSource) as u32);

        self.envelope.set_times(
            p.get(Param::SynthAttack) / 1000.0,
            p.get(Param::SynthRelease) / 1000.0,
            sample_rate,
        );
        self.player.set_fades(
            p.get(Param::SampleAttack) / 1000.0,
            p.get(Param::SampleRelease) / 1000.0,
            sample_rate,
        );

        self.lfo_on = p.get_bool(Param::LfoEnabled);
        self.lfo_inc = TAU * p.get(Param::LfoRate) / sample_rate;
        self.lfo_depth = p.get(Param::LfoDepth);

        if self.kind == TrackType::Sample {
            // an editor holding the slot just means we look again next cycle
            if let Some(incoming) = track.try_sample() {
                if self.player.sync_buffer(incoming, sample_rate) {
                    log::debug!("track {}: sample buffer swapped", self.id);
                }
            }
        }
    }

    // Hand a pooled state to a new track. configure() fills in the parameters.
    pub(crate) fn rebind(&mut self, id: TrackId) {
        self.id = id;
        self.kind = TrackType::default();
        self.sidechain_source = TrackId::NONE;
        self.key_slot = None;
        self.hit_gain = 1.0;
        self.hit_pan = 0.0;
        self.reset();
    }

    // Back to the pool; let go of the old track's sample.
    pub(crate) fn retire(&mut self) {
        self.player.sync_buffer(None, self.sample_rate);
        self.id = TrackId::NONE;
    }

    /// Sequencer reset: zero the envelope, rewind playback, flush effect tails.
    pub(crate) fn reset(&mut self) {
        self.envelope.reset();
        self.osc.phase = 0.0;
        self.player.reset();
        self.eq.reset();
        self.compressor.reset();
        self.delay.clear();
        self.sidechain.reset();
        self.lfo_phase = 0.0;
        self.level = 0.0;
    }

    // Transport stopped: let the synth ring out silently and stop samples.
    pub(crate) fn idle(&mut self) {
        self.envelope.decay();
        self.player.halt();
        self.level = 0.0;
    }

    /// Render one frame. `trigger` carries the note of a step that fired on
    /// this frame; `key_level` is the sidechain source's previous-frame peak.
    pub(crate) fn render(&mut self, gate: bool, trigger: Option<StepNote>, key_level: f32) -> StereoFrame {
        if let Some(note) = trigger {
            self.hit_gain = note.gain();
            self.hit_pan = note.pan;
        }

        let source = match self.kind {
            TrackType::Synth => {
                if let Some(note) = trigger {
                    self.envelope.trigger();
                    self.osc.set_frequency(midi_to_hz(note.note as f32 + note.pitch), self.sample_rate);
                }
                let env = self.envelope.update(gate);
                StereoFrame::mono(self.osc.next() * env)
            }
            TrackType::Sample => {
                if let Some(note) = trigger {
                    self.player.trigger(note.pitch);
                }
                self.player.next()
            }
            TrackType::MidiOut | TrackType::Vst => StereoFrame::zero(),
        };

        let mut frame = source.scaled(self.hit_gain);
        if !self.eq.is_flat() {
            frame = self.eq.process(frame);
        }
        if self.compressor_on {
            frame = self.compressor.process(frame);
        }
        if self.delay_on {
            frame = self.delay.process(frame);
        }
        frame = frame.scaled(self.sidechain.process(key_level));

        let mut gain = if self.muted { 0.0 } else { self.volume };
        if self.lfo_on {
            // tremolo dips from unity down to 1 - depth
            gain *= 1.0 - self.lfo_depth * 0.5 * (1.0 - self.lfo_phase.cos());
            self.lfo_phase += self.lfo_inc;
            if self.lfo_phase > TAU {
                self.lfo_phase -= TAU;
            }
        }

        let out = pan_frame(frame.scaled(gain), self.pan + self.hit_pan);
        self.level = out.peak();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_converges_without_overshoot() {
        let mut env = Envelope::new(0.01, 0.05, 1000.0); // 10-frame attack
        let mut prev = env.level();
        let mut frames = 0;
        while env.level() < GATED_LEVEL {
            let level = env.update(true);
            assert!((0.0..=GATED_LEVEL).contains(&level));
            assert!(level >= prev);
            prev = level;
            frames += 1;
            assert!(frames <= 10, "attack should finish within its time");
        }
        // held gate stays put
        for _ in 0..100 {
            assert_eq!(env.update(true), GATED_LEVEL);
        }
    }

    #[test]
    fn trigger_jumps_then_settles_and_release_reaches_zero() {
        let mut env = Envelope::new(0.01, 0.01, 1000.0);
        env.trigger();
        assert_eq!(env.level(), TRIGGER_LEVEL);
        for _ in 0..20 {
            env.update(true);
        }
        assert_eq!(env.level(), GATED_LEVEL);
        for _ in 0..20 {
            env.update(false);
        }
        assert_eq!(env.level(), 0.0);
    }

    #[test]
    fn stopped_envelope_decays_to_silence() {
        let mut env = Envelope::new(0.001, 0.001, 48000.0);
        env.trigger();
        for _ in 0..20_000 {
            env.decay();
        }
        assert_eq!(env.level(), 0.0);
    }

    #[test]
    fn player_without_buffer_stays_silent() {
        let mut p = SamplePlayer::new();
        p.trigger(0.0);
        assert!(!p.is_playing());
        assert_eq!(p.next(), StereoFrame::zero());
    }

    #[test]
    fn player_converts_rate_and_stops_past_the_end() {
        let buf = Arc::new(SampleBuffer::new(1, 22050, vec![16384; 4]));
        let mut p = SamplePlayer::new();
        assert!(p.sync_buffer(Some(buf.clone()), 44100.0));
        assert!(!p.sync_buffer(Some(buf), 44100.0));
        p.trigger(0.0);
        assert_eq!(p.increment(), 0.5);

        let mut rendered = 0;
        while p.is_playing() {
            assert_eq!(p.next().left, 0.5);
            rendered += 1;
        }
        assert_eq!(rendered, 8);
        assert_eq!(p.next(), StereoFrame::zero());
    }

    #[test]
    fn pitch_scales_the_increment() {
        let buf = Arc::new(SampleBuffer::new(1, 44100, vec![1; 64]));
        let mut p = SamplePlayer::new();
        p.sync_buffer(Some(buf), 44100.0);
        p.trigger(12.0);
        assert!((p.increment() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn swapping_buffers_rewinds() {
        let a = Arc::new(SampleBuffer::new(1, 44100, vec![1; 64]));
        let b = Arc::new(SampleBuffer::new(1, 48000, vec![1; 64]));
        let mut p = SamplePlayer::new();
        p.sync_buffer(Some(a), 48000.0);
        p.trigger(0.0);
        for _ in 0..10 {
            p.next();
        }
        assert!(p.position() > 0.0);
        assert!(p.sync_buffer(Some(b), 48000.0));
        assert_eq!(p.position(), 0.0);
        assert_eq!(p.increment(), 1.0);
        assert!(p.sync_buffer(None, 48000.0));
        assert!(!p.is_playing());
    }

    #[test]
    fn device_rate_change_keeps_source_rate_and_pitch() {
        let buf = Arc::new(SampleBuffer::new(1, 1000, vec![1; 64]));
        let mut p = SamplePlayer::new();
        p.sync_buffer(Some(buf), 1000.0);
        p.trigger(12.0);
        assert!((p.increment() - 2.0).abs() < 1e-9);
        p.set_device_rate(2000.0);
        assert!((p.increment() - 1.0).abs() < 1e-9);
        p.trigger(0.0);
        assert!((p.increment() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn attack_fade_starts_from_silence() {
        let buf = Arc::new(SampleBuffer::new(1, 1000, vec![i16::MAX; 100]));
        let mut p = SamplePlayer::new();
        p.set_fades(0.01, 0.0, 1000.0);
        p.sync_buffer(Some(buf), 1000.0);
        p.trigger(0.0);
        assert_eq!(p.next().left, 0.0);
        assert!(p.next().left > 0.0);
    }

    #[test]
    fn constant_power_pan() {
        let centre = pan_frame(StereoFrame::mono(1.0), 0.0);
        assert!((centre.left - centre.right).abs() < 1e-6);
        assert!((centre.left * centre.left + centre.right * centre.right - 1.0).abs() < 1e-5);
        let left = pan_frame(StereoFrame::mono(1.0), -1.0);
        assert!((left.left - 1.0).abs() < 1e-6 && left.right.abs() < 1e-6);
    }
}
