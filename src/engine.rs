//! Top-Level Audio Engine
//!
//! The ownership root of the instrument core: one clock, four delay
//! lines, four modulation phasors, and the effect-mode engine, assembled
//! into a single struct that is constructed once at startup and driven
//! sample-by-sample from the audio callback.
//!
//! Everything here runs on the audio thread. Control-side setters write
//! plain scalar fields and are tolerated one block stale; there are no
//! locks and no allocation after construction.
//!
//! Signal flow per frame: clock tick, delay-target slide, input
//! conditioning, optional dry distortion, effect-mode processing,
//! optional wet distortion, dry/wet crossfade to the outputs, then
//! feedback assembly (with ping-pong cross-feed when selected),
//! denormal/NaN scrubbing, and the delay-line writes that feed the next
//! frame.

use serde::{Deserialize, Serialize};

use crate::clock::{ClockEngine, ClockMode, DelayRangePreset};
use crate::delay::DelayLine;
use crate::modes::{FrameInput, ModeEngine, MIN_DELAY};
use crate::params::EffectMode;
use crate::phasor::DelayPhasor;
use crate::shape::{
    apply_distortion, guard_finite, kill_denormal, map_exp, Distortion, DistortionTarget, OnePole,
};

/// Static configuration fixed at construction time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineConfig {
    pub sample_rate: f32,
    pub block_size: usize,
    /// Delay line capacity per channel, in samples.
    pub max_delay: usize,
    /// Internal clock PPQN.
    pub internal_ppqn: i32,
    /// True: discrete left/right inputs. False: mono-summed input on all
    /// channels.
    pub stereo_input: bool,
    /// Enable the allpass post stage on the wet pair.
    pub allpass: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            block_size: 48,
            max_delay: 480_000,
            internal_ppqn: 4,
            stereo_input: true,
            allpass: false,
        }
    }
}

/// Construction-time validation failures. The running engine itself
/// never errors; it degrades.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidSampleRate,
    InvalidCapacity,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidSampleRate => write!(f, "sample rate must be positive"),
            EngineError::InvalidCapacity => {
                write!(f, "delay capacity must hold at least one millisecond")
            }
        }
    }
}

impl std::error::Error for EngineError {}

/// Per-frame input from the surrounding application.
#[derive(Debug, Clone, Copy)]
pub struct EngineFrame {
    pub input: (f32, f32),
    /// External clock trigger level for this sample.
    pub trigger: bool,
    /// Raw time-knob positions in [0, 1] (left, right).
    pub time_knobs: [f32; 2],
    /// Smoothed meta knobs in [0, 1].
    pub meta: f32,
    pub meta2: f32,
    /// P1..P4 in real units per the active mode's param specs.
    pub params: [f32; 4],
    /// Dry/wet mix in [0, 1].
    pub mix: f32,
    /// Feedback amount in [0, 1].
    pub feedback: f32,
}

/// Tracks the musically-useful delay range from the (possibly external)
/// tempo, heavily smoothed so tempo-detection jitter never modulates the
/// delay times audibly.
#[derive(Debug, Clone, Copy)]
pub struct DelayRangeTracker {
    preset: DelayRangePreset,
    smoothed_samples_per_beat: f32,
    min: f32,
    max: f32,
    hard_min: f32,
    hard_max: f32,
}

impl DelayRangeTracker {
    pub fn new(hard_max: f32) -> Self {
        Self {
            preset: DelayRangePreset::default(),
            smoothed_samples_per_beat: 24000.0,
            min: 12.0,
            max: hard_max,
            hard_min: 12.0,
            hard_max,
        }
    }

    pub fn set_preset(&mut self, preset: DelayRangePreset) {
        self.preset = preset;
    }

    pub fn preset(&self) -> DelayRangePreset {
        self.preset
    }

    /// One smoothing step. Only external sync narrows the range; internal
    /// mode keeps the full hardware span.
    pub fn update(&mut self, samples_per_beat: f32, externally_synced: bool) {
        if !externally_synced {
            self.min = self.hard_min;
            self.max = self.hard_max;
            return;
        }

        let spb = if samples_per_beat > 0.0 {
            samples_per_beat
        } else {
            24000.0
        };
        self.smoothed_samples_per_beat += (spb - self.smoothed_samples_per_beat) * 0.002;

        let (min_div, max_div) = self.preset.divisions();
        let target_min = (self.smoothed_samples_per_beat * min_div).clamp(self.hard_min, self.hard_max);
        let target_max = (self.smoothed_samples_per_beat * max_div).clamp(target_min, self.hard_max);

        self.min += (target_min - self.min) * 0.005;
        self.max += (target_max - self.max) * 0.005;
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }
}

/// The complete audio core: construct once, call
/// [`process`](AudioEngine::process) per sample from the audio callback.
pub struct AudioEngine {
    config: EngineConfig,
    clock: ClockEngine,
    delays: [DelayLine; 4],
    phasors: [DelayPhasor; 4],
    modes: ModeEngine,
    range: DelayRangeTracker,

    delay_targets: [f32; 2],
    delay_slides: [OnePole; 2],
    delay_times: [f32; 4],

    freeze: bool,
    feedback_toggle: [bool; 4],
    distortion: Distortion,
    distortion_target: DistortionTarget,
    distortion_amount: f32,
}

impl AudioEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        if !(config.sample_rate > 0.0) {
            return Err(EngineError::InvalidSampleRate);
        }
        if (config.max_delay as f32) < config.sample_rate / 1000.0 {
            return Err(EngineError::InvalidCapacity);
        }

        let mut clock = ClockEngine::new(config.sample_rate);
        clock.init(
            config.sample_rate,
            config.block_size,
            config.internal_ppqn,
            0,
            ClockMode::Internal,
        );

        let mut delay_slides = [
            OnePole::new(config.sample_rate, 15.0),
            OnePole::new(config.sample_rate, 15.0),
        ];
        let initial_target = config.sample_rate * 0.25;
        for slide in delay_slides.iter_mut() {
            slide.set(initial_target);
        }

        Ok(Self {
            clock,
            delays: std::array::from_fn(|_| DelayLine::new(config.max_delay)),
            phasors: std::array::from_fn(|_| DelayPhasor::new(config.sample_rate)),
            modes: ModeEngine::new(config.sample_rate),
            range: DelayRangeTracker::new(config.max_delay as f32 - MIN_DELAY),
            delay_targets: [initial_target; 2],
            delay_slides,
            delay_times: [initial_target, initial_target, initial_target * 0.5, initial_target * 0.5],
            freeze: false,
            feedback_toggle: [true; 4],
            distortion: Distortion::Tanh,
            distortion_target: DistortionTarget::Off,
            distortion_amount: 0.0,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &ClockEngine {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut ClockEngine {
        &mut self.clock
    }

    pub fn range(&self) -> &DelayRangeTracker {
        &self.range
    }

    pub fn mode(&self) -> EffectMode {
        self.modes.mode()
    }

    pub fn set_mode(&mut self, mode: EffectMode) {
        self.modes.set_mode(mode);
    }

    pub fn set_clock_mode(&mut self, mode: ClockMode) {
        self.clock.set_mode(mode);
    }

    pub fn set_range_preset(&mut self, preset: DelayRangePreset) {
        self.range.set_preset(preset);
    }

    /// Freeze holds the delay buffers: writes stop, wet is muted in the
    /// output mix, and the frozen content keeps circulating for the modes
    /// that scrub it. Processing never stops.
    pub fn set_freeze(&mut self, freeze: bool) {
        self.freeze = freeze;
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze
    }

    pub fn set_feedback_toggle(&mut self, channel: usize, enabled: bool) {
        if channel < 4 {
            self.feedback_toggle[channel] = enabled;
        }
    }

    pub fn set_distortion(&mut self, algo: Distortion, target: DistortionTarget, amount: f32) {
        self.distortion = algo;
        self.distortion_target = target;
        self.distortion_amount = amount.clamp(0.0, 100.0);
    }

    /// Set left/right delay targets in samples; channels 2/3 follow at
    /// half length. Values are clamped into the current working range.
    pub fn set_delay_targets(&mut self, left: f32, right: f32) {
        let lo = self.range.min().max(MIN_DELAY);
        let hi = self.range.max();
        self.delay_targets[0] = left.clamp(lo, hi);
        self.delay_targets[1] = right.clamp(lo, hi);
    }

    /// Map a 0..1 delay knob into the current musical range.
    pub fn delay_target_from_knob(&self, knob: f32) -> f32 {
        map_exp(knob, self.range.min().max(MIN_DELAY), self.range.max())
    }

    pub fn delay_times(&self) -> [f32; 4] {
        self.delay_times
    }

    /// Process one frame. Returns the stereo output pair.
    pub fn process(&mut self, frame: &EngineFrame) -> (f32, f32) {
        let _gate_edge = self.clock.tick(frame.trigger);

        self.range.update(
            self.clock.samples_per_beat(),
            self.clock.mode() != ClockMode::Internal,
        );

        // Delay-time slides; frozen targets bypass the slide so the held
        // buffer does not re-pitch.
        for side in 0..2 {
            self.delay_times[side] = if self.freeze {
                self.delay_targets[side]
            } else {
                self.delay_slides[side].next(self.delay_targets[side])
            };
        }
        self.delay_times[2] = self.delay_times[0] * 0.5;
        self.delay_times[3] = self.delay_times[1] * 0.5;

        // Input conditioning.
        let (in_l, in_r) = frame.input;
        let mut dry = if self.config.stereo_input {
            [in_l, in_r, in_l, in_r]
        } else {
            let mono = (in_l + in_r) * 0.5;
            [mono; 4]
        };

        if matches!(
            self.distortion_target,
            DistortionTarget::Dry | DistortionTarget::Both
        ) {
            apply_distortion(&mut dry, self.distortion, self.distortion_amount);
        }

        let mut input = FrameInput {
            dry,
            delay_times: self.delay_times,
            meta: frame.meta,
            meta2: frame.meta2,
            params: frame.params,
            time_knobs: frame.time_knobs,
            freeze: self.freeze,
            allpass: self.config.allpass,
            feedback: frame.feedback,
            max_delay_working: self.range.max().min(self.config.max_delay as f32 - MIN_DELAY),
            delays: &self.delays,
            phasors: &mut self.phasors,
        };
        let out = self.modes.process(&mut input);

        let mut wet = out.wet;
        if matches!(
            self.distortion_target,
            DistortionTarget::Wet | DistortionTarget::Both
        ) {
            apply_distortion(&mut wet, self.distortion, self.distortion_amount);
        }

        // Output mix: linear dry/wet crossfade; frozen wet is muted so
        // the held buffer only re-enters via an explicit unfreeze.
        let mix = frame.mix.clamp(0.0, 1.0);
        let (wet_l, wet_r) = if self.freeze {
            (0.0, 0.0)
        } else {
            (wet[0], wet[1])
        };
        let out_l = dry[0] * (1.0 - mix) + wet_l * mix;
        let out_r = dry[1] * (1.0 - mix) + wet_r * mix;

        // Feedback assembly. Ping-pong cross-feeds the stereo pair ahead
        // of the delay writes; everything else feeds back in place.
        let feedback = frame.feedback.clamp(0.0, 0.98);
        let mut fb = [0.0f32; 4];
        if self.modes.mode() == EffectMode::PingPong {
            let mono = (dry[0] + dry[1]) * 0.5;
            fb[0] = mono + wet[1] * feedback * toggle(self.feedback_toggle[0]);
            fb[1] = wet[0] * feedback * toggle(self.feedback_toggle[1]);
            fb[2] = fb[0];
            fb[3] = fb[1];
        } else {
            for channel in 0..4 {
                fb[channel] = dry[channel]
                    + wet[channel] * feedback * toggle(self.feedback_toggle[channel]);
            }
        }

        for value in fb.iter_mut() {
            *value = kill_denormal(guard_finite(*value));
        }

        if !self.freeze {
            for (line, value) in self.delays.iter_mut().zip(fb.iter()) {
                line.write(*value);
            }
        }

        (out_l, out_r)
    }

    /// Clear all audio history (delay lines, mode state, phasors).
    pub fn reset(&mut self) {
        for line in self.delays.iter_mut() {
            line.reset();
        }
        for phasor in self.phasors.iter_mut() {
            phasor.reset();
        }
        self.modes.reset();
    }
}

#[inline]
fn toggle(enabled: bool) -> f32 {
    if enabled {
        1.0
    } else {
        0.0
    }
}
