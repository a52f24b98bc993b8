//! Declarative Parameter Model
//!
//! Every effect mode exposes four knob parameters (P1..P4) whose
//! real-world meaning is mode-dependent: a rate in Hz here, a crystal size
//! in milliseconds there. Rather than hard-coding the mappings per mode,
//! each mode publishes a [`ParamSpec`] table that both the DSP code and
//! any UI/MIDI layer consult, so a normalized 0..1 value always maps to
//! the same real units on both sides of the boundary.

use libm::Libm;
use serde::{Deserialize, Serialize};

/// Real-world unit tag for a parameter, for display purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    Percent,
    Hertz,
    Milliseconds,
    Semitones,
}

impl Unit {
    /// Short display suffix.
    pub fn suffix(&self) -> &'static str {
        match self {
            Unit::Percent => "%",
            Unit::Hertz => "Hz",
            Unit::Milliseconds => "ms",
            Unit::Semitones => "st",
        }
    }
}

/// Mapping curve from normalized 0..1 to real units and back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamRange {
    /// Straight-line mapping from normalized (0..1) to (min, max).
    Linear { min: f32, max: f32 },

    /// Exponential mapping, for frequency/time controls. A non-positive
    /// `min` degrades to linear scaling of `max`.
    Exponential { min: f32, max: f32 },
}

impl ParamRange {
    /// Map a normalized 0..1 value to real units.
    pub fn apply(&self, normalized: f32) -> f32 {
        let t = normalized.clamp(0.0, 1.0);
        match *self {
            ParamRange::Linear { min, max } => min + t * (max - min),
            ParamRange::Exponential { min, max } => {
                if min <= 0.0 {
                    t * max
                } else {
                    min * Libm::<f32>::pow(max / min, t)
                }
            }
        }
    }

    /// Inverse of [`apply`](ParamRange::apply): real units back to
    /// normalized 0..1.
    pub fn normalize(&self, value: f32) -> f32 {
        match *self {
            ParamRange::Linear { min, max } => {
                if (max - min).abs() < f32::EPSILON {
                    0.0
                } else {
                    ((value - min) / (max - min)).clamp(0.0, 1.0)
                }
            }
            ParamRange::Exponential { min, max } => {
                if min <= 0.0 {
                    if max.abs() < f32::EPSILON {
                        0.0
                    } else {
                        (value / max).clamp(0.0, 1.0)
                    }
                } else {
                    let ratio = (value / min).max(1e-12);
                    let range = (max / min).max(1.0 + 1e-6);
                    (Libm::<f32>::log(ratio) / Libm::<f32>::log(range)).clamp(0.0, 1.0)
                }
            }
        }
    }
}

/// Declarative description of one mode parameter.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ParamSpec {
    pub label: &'static str,
    pub range: ParamRange,
    pub unit: Unit,
    /// Suggested default, in real units.
    pub default: f32,
}

impl ParamSpec {
    const fn new(label: &'static str, range: ParamRange, unit: Unit, default: f32) -> Self {
        Self {
            label,
            range,
            unit,
            default,
        }
    }
}

const fn lin(min: f32, max: f32) -> ParamRange {
    ParamRange::Linear { min, max }
}

const fn exp(min: f32, max: f32) -> ParamRange {
    ParamRange::Exponential { min, max }
}

/// The signal-processing algorithm currently driving the wet path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectMode {
    Basic,
    PingPong,
    Unlinked,
    Resonator,
    Chorus,
    Knuth,
    Granular,
    GranularOctave,
    GranularTexture,
    GranularShimmer,
    GranularCrystals,
    Fluid,
}

impl EffectMode {
    pub const COUNT: usize = 12;

    /// All modes, in dispatch order.
    pub const ALL: [EffectMode; Self::COUNT] = [
        EffectMode::Basic,
        EffectMode::PingPong,
        EffectMode::Unlinked,
        EffectMode::Resonator,
        EffectMode::Chorus,
        EffectMode::Knuth,
        EffectMode::Granular,
        EffectMode::GranularOctave,
        EffectMode::GranularTexture,
        EffectMode::GranularShimmer,
        EffectMode::GranularCrystals,
        EffectMode::Fluid,
    ];

    /// Mode from a raw index, clamped into range.
    pub fn from_index(index: usize) -> Self {
        Self::ALL[index.min(Self::COUNT - 1)]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            EffectMode::Basic => "Basic",
            EffectMode::PingPong => "PingPong",
            EffectMode::Unlinked => "Unlinked",
            EffectMode::Resonator => "Resonator",
            EffectMode::Chorus => "Chorus",
            EffectMode::Knuth => "Knuth",
            EffectMode::Granular => "Granular",
            EffectMode::GranularOctave => "GranOctave",
            EffectMode::GranularTexture => "GranTexture",
            EffectMode::GranularShimmer => "GranShimmer",
            EffectMode::GranularCrystals => "GranCrystals",
            EffectMode::Fluid => "Fluid",
        }
    }

    /// True for the accumulator-based granular family.
    pub fn is_granular(self) -> bool {
        matches!(
            self,
            EffectMode::Granular
                | EffectMode::GranularOctave
                | EffectMode::GranularTexture
                | EffectMode::GranularShimmer
                | EffectMode::GranularCrystals
        )
    }

    /// The P1..P4 spec table for this mode.
    pub fn param_specs(self) -> &'static [ParamSpec; 4] {
        match self {
            EffectMode::Basic => &BASIC_PARAMS,
            EffectMode::PingPong => &BASIC_PARAMS,
            EffectMode::Unlinked => &BASIC_PARAMS,
            EffectMode::Resonator => &RESONATOR_PARAMS,
            EffectMode::Chorus => &CHORUS_PARAMS,
            EffectMode::Knuth => &KNUTH_PARAMS,
            EffectMode::Granular => &GRANULAR_PARAMS,
            EffectMode::GranularOctave => &GRANULAR_OCTAVE_PARAMS,
            EffectMode::GranularTexture => &GRANULAR_TEXTURE_PARAMS,
            EffectMode::GranularShimmer => &GRANULAR_SHIMMER_PARAMS,
            EffectMode::GranularCrystals => &GRANULAR_CRYSTALS_PARAMS,
            EffectMode::Fluid => &FLUID_PARAMS,
        }
    }

    /// Label for one parameter slot (0..3).
    pub fn param_label(self, slot: usize) -> &'static str {
        if slot < 4 {
            self.param_specs()[slot].label
        } else {
            "P?"
        }
    }

    /// Map a normalized 0..1 value for one slot into real units.
    pub fn param_value(self, slot: usize, normalized: f32) -> f32 {
        let spec = &self.param_specs()[slot.min(3)];
        spec.range.apply(normalized)
    }

    /// Normalize a real-unit value for one slot back to 0..1.
    pub fn param_normalized(self, slot: usize, value: f32) -> f32 {
        let spec = &self.param_specs()[slot.min(3)];
        spec.range.normalize(value)
    }
}

static BASIC_PARAMS: [ParamSpec; 4] = [
    ParamSpec::new("P1", lin(0.0, 2.0), Unit::Percent, 1.0),
    ParamSpec::new("P2", lin(0.0, 2.0), Unit::Percent, 1.0),
    ParamSpec::new("P3", lin(0.0, 2.0), Unit::Percent, 1.0),
    ParamSpec::new("P4", lin(0.0, 2.0), Unit::Percent, 1.0),
];

static RESONATOR_PARAMS: [ParamSpec; 4] = [
    ParamSpec::new("Rate", exp(0.1, 5.0), Unit::Hertz, 1.0),
    ParamSpec::new("Dpth", lin(0.0, 1.0), Unit::Percent, 0.25),
    ParamSpec::new("Damp", lin(0.0, 1.0), Unit::Percent, 0.25),
    ParamSpec::new("Mix", lin(0.0, 1.0), Unit::Percent, 0.5),
];

static CHORUS_PARAMS: [ParamSpec; 4] = [
    ParamSpec::new("Rate", exp(0.1, 5.0), Unit::Hertz, 0.5),
    ParamSpec::new("Dpth", lin(0.05, 1.0), Unit::Percent, 0.25),
    ParamSpec::new("Stro", lin(0.0, 1.0), Unit::Percent, 0.5),
    ParamSpec::new("Colr", lin(0.0, 1.0), Unit::Percent, 0.5),
];

static KNUTH_PARAMS: [ParamSpec; 4] = [
    ParamSpec::new("MRate", exp(0.01, 0.1), Unit::Hertz, 0.02),
    ParamSpec::new("MDpth", exp(0.01, 0.1), Unit::Percent, 0.02),
    ParamSpec::new("Colr", lin(0.0, 1.0), Unit::Percent, 0.25),
    ParamSpec::new("Smth", lin(0.0, 1.0), Unit::Percent, 0.25),
];

static GRANULAR_PARAMS: [ParamSpec; 4] = [
    ParamSpec::new("MRate", exp(0.0, 0.1), Unit::Hertz, 0.02),
    ParamSpec::new("MDpth", lin(0.0, 1.0), Unit::Percent, 0.2),
    ParamSpec::new("Ptch", lin(-12.0, 12.0), Unit::Semitones, 0.0),
    ParamSpec::new("Smth", lin(0.0, 1.0), Unit::Percent, 0.1),
];

static GRANULAR_OCTAVE_PARAMS: [ParamSpec; 4] = [
    ParamSpec::new("MRate", exp(0.0, 0.1), Unit::Hertz, 0.02),
    ParamSpec::new("MDpth", lin(0.0, 1.0), Unit::Percent, 0.2),
    ParamSpec::new("Ptch", lin(-2.0, 2.0), Unit::Semitones, 0.0),
    ParamSpec::new("Smth", lin(0.0, 1.0), Unit::Percent, 0.1),
];

static GRANULAR_TEXTURE_PARAMS: [ParamSpec; 4] = [
    ParamSpec::new("MRate", exp(0.0, 0.05), Unit::Hertz, 0.01),
    ParamSpec::new("MDpth", lin(0.1, 0.4), Unit::Percent, 0.2),
    ParamSpec::new("Colr", lin(0.0, 1.0), Unit::Percent, 0.2),
    ParamSpec::new("Blnd", lin(0.0, 0.2), Unit::Percent, 0.1),
];

static GRANULAR_SHIMMER_PARAMS: [ParamSpec; 4] = [
    ParamSpec::new("MRate", exp(0.05, 0.2), Unit::Hertz, 0.08),
    ParamSpec::new("MDpth", lin(0.3, 0.8), Unit::Percent, 0.45),
    ParamSpec::new("Colr", lin(0.0, 1.0), Unit::Percent, 0.2),
    ParamSpec::new("Blnd", lin(0.1, 0.3), Unit::Percent, 0.2),
];

static GRANULAR_CRYSTALS_PARAMS: [ParamSpec; 4] = [
    ParamSpec::new("Rate", exp(1.0, 32.0), Unit::Hertz, 2.0),
    ParamSpec::new("Size", exp(4.0, 64.0), Unit::Milliseconds, 12.0),
    ParamSpec::new("Colr", lin(0.0, 1.0), Unit::Percent, 0.1),
    ParamSpec::new("Edge", lin(0.0, 0.1), Unit::Percent, 0.09),
];

static FLUID_PARAMS: [ParamSpec; 4] = [
    ParamSpec::new("Flow", exp(0.02, 2.5), Unit::Hertz, 0.2),
    ParamSpec::new("Visc", exp(10.0, 2000.0), Unit::Milliseconds, 100.0),
    ParamSpec::new("Coup", lin(0.0, 1.0), Unit::Percent, 0.2),
    ParamSpec::new("Turb", lin(0.0, 1.0), Unit::Percent, 0.2),
];
