//! # Lagoon: Delay Instrument Audio Core
//!
//! `lagoon` is the real-time audio core of a hardware delay/effects
//! instrument: it turns a stream of input samples into a stream of output
//! samples by reading and writing interpolated circular delay buffers,
//! modulating read positions with oscillating phase generators, and
//! synchronizing all timing to an internal clock, an external pulse
//! input, or a MIDI-style clock.
//!
//! ## Architecture
//!
//! The crate is organized in three layers:
//!
//! - **Primitives**: delay lines, phasors, waveshaping, grains, the
//!   vortex field, and a seedable RNG ([`delay`], [`phasor`], [`shape`],
//!   [`grain`], [`fluid`], [`rng`])
//! - **Timing**: the mode-switched clock engine with external tempo
//!   recovery and musical delay-range scaling ([`clock`])
//! - **Engine**: the twelve-mode effect dispatcher and the top-level
//!   audio engine that owns everything ([`modes`], [`engine`]), with the
//!   declarative per-mode parameter model in [`params`]
//!
//! ## Real-time discipline
//!
//! One audio thread drives the whole core. Construction allocates every
//! buffer up front; the per-sample path never allocates, never locks, and
//! never raises errors. Corrupted samples are scrubbed, implausible
//! clock pulses are rejected, and degraded-but-running always wins over
//! a crash.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lagoon::prelude::*;
//!
//! // Build the core once at startup.
//! let mut engine = AudioEngine::new(EngineConfig::default()).unwrap();
//! engine.set_mode(EffectMode::Granular);
//! engine.set_delay_targets(24000.0, 18000.0);
//!
//! // Then once per sample from the audio callback:
//! let frame = EngineFrame {
//!     input: (0.0, 0.0),
//!     trigger: false,
//!     time_knobs: [0.5, 0.5],
//!     meta: 0.5,
//!     meta2: 0.0,
//!     params: [0.0; 4],
//!     mix: 0.5,
//!     feedback: 0.4,
//! };
//! let (left, right) = engine.process(&frame);
//! ```

pub mod clock;
pub mod delay;
pub mod engine;
pub mod fluid;
pub mod grain;
pub mod modes;
pub mod params;
pub mod phasor;
pub mod rng;
pub mod shape;

/// Prelude module for convenient imports
pub mod prelude {
    // Primitives
    pub use crate::delay::DelayLine;
    pub use crate::fluid::{FluidField, FluidParams};
    pub use crate::grain::{Grain, GrainPlayer, MAX_GRAINS};
    pub use crate::phasor::{DelayPhasor, TriLfo};
    pub use crate::rng::Rng;
    pub use crate::shape::{
        apply_distortion, guard_finite, kill_denormal, AllpassPair, Distortion, DistortionTarget,
        OnePole,
    };

    // Timing
    pub use crate::clock::{ClockEngine, ClockMode, DelayRangePreset, MIDI_PPQN};

    // Parameters
    pub use crate::params::{EffectMode, ParamRange, ParamSpec, Unit};

    // Engine
    pub use crate::engine::{
        AudioEngine, DelayRangeTracker, EngineConfig, EngineError, EngineFrame,
    };
    pub use crate::modes::{FrameInput, FrameOutput, ModeEngine, MIN_DELAY};
}

// Re-export key types at crate root for convenience
pub use prelude::*;
