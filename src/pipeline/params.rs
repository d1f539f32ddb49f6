// Every numeric track parameter, its documented range, and the lock-free cell it lives in.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::shared::{DEFAULT_STEP_COUNT, MAX_SEQUENCER_STEPS};

/// An `f32` stored as raw bits in an `AtomicU32`.
///
/// Parameters are independent scalars, so relaxed ordering is enough: a
/// write only has to become visible eventually, never in step with another
/// field.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    Continuous,
    Integer, // rounded to the nearest whole number on write
    Toggle,  // stored as 0.0 / 1.0
}

#[derive(Clone, Copy, Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    pub kind: ParamKind,
}

impl ParamSpec {
    const fn continuous(name: &'static str, min: f32, max: f32, default: f32) -> Self {
        Self { name, min, max, default, kind: ParamKind::Continuous }
    }

    const fn integer(name: &'static str, min: f32, max: f32, default: f32) -> Self {
        Self { name, min, max, default, kind: ParamKind::Integer }
    }

    const fn toggle(name: &'static str, default: bool) -> Self {
        Self {
            name,
            min: 0.0,
            max: 1.0,
            default: if default { 1.0 } else { 0.0 },
            kind: ParamKind::Toggle,
        }
    }

    /// Clamp (and round, for integer and toggle parameters) a raw value into range.
    /// NaN saturates to the default.
    pub fn clamp(&self, value: f32) -> f32 {
        if value.is_nan() {
            return self.default;
        }
        let v = value.clamp(self.min, self.max);
        match self.kind {
            ParamKind::Continuous => v,
            ParamKind::Integer => v.round(),
            ParamKind::Toggle => {
                if v >= 0.5 { 1.0 } else { 0.0 }
            }
        }
    }

    pub fn range(&self) -> f32 {
        self.max - self.min
    }
}

/// Addressable track parameters. The discriminant order is the modulation
/// target index used by [`crate::pipeline::mod_matrix::ModMatrix`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Param {
    Volume,
    Pan,
    Mute,
    EqLow,
    EqMid,
    EqHigh,
    DelayEnabled,
    DelayTime,
    DelayFeedback,
    DelayMix,
    CompressorEnabled,
    CompressorThreshold,
    CompressorRatio,
    CompressorAttack,
    CompressorRelease,
    SidechainEnabled,
    SidechainSource,
    SidechainDepth,
    SidechainAttack,
    SidechainRelease,
    SynthAttack,
    SynthRelease,
    SampleAttack,
    SampleRelease,
    LfoEnabled,
    LfoRate,
    LfoDepth,
    MidiNote,
    MidiChannel,
    MidiDevice,
    StepCount,
}

impl Param {
    pub const COUNT: usize = 31;

    pub const ALL: [Param; Param::COUNT] = [
        Param::Volume,
        Param::Pan,
        Param::Mute,
        Param::EqLow,
        Param::EqMid,
        Param::EqHigh,
        Param::DelayEnabled,
        Param::DelayTime,
        Param::DelayFeedback,
        Param::DelayMix,
        Param::CompressorEnabled,
        Param::CompressorThreshold,
        Param::CompressorRatio,
        Param::CompressorAttack,
        Param::CompressorRelease,
        Param::SidechainEnabled,
        Param::SidechainSource,
        Param::SidechainDepth,
        Param::SidechainAttack,
        Param::SidechainRelease,
        Param::SynthAttack,
        Param::SynthRelease,
        Param::SampleAttack,
        Param::SampleRelease,
        Param::LfoEnabled,
        Param::LfoRate,
        Param::LfoDepth,
        Param::MidiNote,
        Param::MidiChannel,
        Param::MidiDevice,
        Param::StepCount,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Param> {
        Param::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn spec(self) -> ParamSpec {
        match self {
            Param::Volume => ParamSpec::continuous("Volume", 0.0, 1.0, 0.8),
            Param::Pan => ParamSpec::continuous("Pan", -1.0, 1.0, 0.0),
            Param::Mute => ParamSpec::toggle("Mute", false),
            // EQ gains in dB
            Param::EqLow => ParamSpec::continuous("EQ Low", -24.0, 24.0, 0.0),
            Param::EqMid => ParamSpec::continuous("EQ Mid", -24.0, 24.0, 0.0),
            Param::EqHigh => ParamSpec::continuous("EQ High", -24.0, 24.0, 0.0),
            Param::DelayEnabled => ParamSpec::toggle("Delay", false),
            // seconds
            Param::DelayTime => ParamSpec::continuous("Delay Time", 0.01, 2.0, 0.25),
            Param::DelayFeedback => ParamSpec::continuous("Delay Feedback", 0.0, 0.95, 0.35),
            Param::DelayMix => ParamSpec::continuous("Delay Mix", 0.0, 1.0, 0.3),
            Param::CompressorEnabled => ParamSpec::toggle("Compressor", false),
            Param::CompressorThreshold => ParamSpec::continuous("Comp Threshold", -60.0, 0.0, -12.0),
            Param::CompressorRatio => ParamSpec::continuous("Comp Ratio", 1.0, 20.0, 4.0),
            // attack/release times below are all milliseconds
            Param::CompressorAttack => ParamSpec::continuous("Comp Attack", 0.1, 200.0, 10.0),
            Param::CompressorRelease => ParamSpec::continuous("Comp Release", 5.0, 2000.0, 120.0),
            Param::SidechainEnabled => ParamSpec::toggle("Sidechain", false),
            // a track id; 0 = no source. f32 holds ids exactly up to 2^24.
            Param::SidechainSource => ParamSpec::integer("Sidechain Source", 0.0, 16_777_215.0, 0.0),
            Param::SidechainDepth => ParamSpec::continuous("Sidechain Depth", 0.0, 1.0, 0.6),
            Param::SidechainAttack => ParamSpec::continuous("Sidechain Attack", 0.1, 200.0, 5.0),
            Param::SidechainRelease => ParamSpec::continuous("Sidechain Release", 5.0, 2000.0, 150.0),
            Param::SynthAttack => ParamSpec::continuous("Synth Attack", 0.1, 2000.0, 2.5),
            Param::SynthRelease => ParamSpec::continuous("Synth Release", 1.0, 5000.0, 45.0),
            Param::SampleAttack => ParamSpec::continuous("Sample Attack", 0.0, 2000.0, 0.0),
            Param::SampleRelease => ParamSpec::continuous("Sample Release", 0.0, 2000.0, 0.0),
            Param::LfoEnabled => ParamSpec::toggle("LFO", false),
            Param::LfoRate => ParamSpec::continuous("LFO Rate", 0.05, 20.0, 2.0),
            Param::LfoDepth => ParamSpec::continuous("LFO Depth", 0.0, 1.0, 0.5),
            Param::MidiNote => ParamSpec::integer("MIDI Note", 0.0, 127.0, 60.0),
            Param::MidiChannel => ParamSpec::integer("MIDI Channel", 0.0, 15.0, 0.0),
            // -1 = no output device
            Param::MidiDevice => ParamSpec::integer("MIDI Device", -1.0, 255.0, -1.0),
            Param::StepCount => ParamSpec::integer(
                "Step Count",
                1.0,
                MAX_SEQUENCER_STEPS as f32,
                DEFAULT_STEP_COUNT as f32,
            ),
        }
    }

    pub fn clamp(self, value: f32) -> f32 {
        self.spec().clamp(value)
    }
}

/// One atomic cell per [`Param`], initialised to each parameter's default.
#[derive(Debug)]
pub struct ParamCells {
    cells: [AtomicF32; Param::COUNT],
}

impl ParamCells {
    pub fn new() -> Self {
        Self {
            cells: std::array::from_fn(|i| AtomicF32::new(Param::ALL[i].spec().default)),
        }
    }

    #[inline]
    pub fn get(&self, param: Param) -> f32 {
        self.cells[param.index()].load()
    }

    #[inline]
    pub fn get_bool(&self, param: Param) -> bool {
        self.get(param) >= 0.5
    }

    /// Clamp and store; returns the value actually stored.
    pub fn set(&self, param: Param, value: f32) -> f32 {
        let v = param.clamp(value);
        self.cells[param.index()].store(v);
        v
    }

    pub fn values(&self) -> Vec<f32> {
        Param::ALL.iter().map(|p| self.get(*p)).collect()
    }
}

impl Default for ParamCells {
    fn default() -> Self {
        Self::new()
    }
}
