//! Effect-Mode Engine
//!
//! The dispatch hub of the instrument: given the current frame's dry
//! samples, delay targets, and control values, produce four wet samples by
//! running one of the twelve effect algorithms over the shared delay
//! lines.
//!
//! Mode-specific persistent state lives in a tagged [`ModeState`] selected
//! by the active mode, so switching modes cannot leak one algorithm's
//! accumulators into another. The seam-crossfade bookkeeping, chorus LFO
//! pair, and meta2 slice quantization are shared infrastructure used
//! across mode families.
//!
//! All read positions are clamped before touching a delay line; all wet
//! outputs pass a NaN/Inf guard before leaving the engine.

use crate::delay::DelayLine;
use crate::fluid::{FluidField, FluidParams};
use crate::grain::{GrainPlayer, MAX_GRAIN_SIZE, MIN_GRAIN_SIZE};
use crate::params::EffectMode;
use crate::phasor::{DelayPhasor, TriLfo};
use crate::rng::Rng;
use crate::shape::{guard_finite, map_exp, map_linear, ms_to_coeff, one_pole, AllpassPair};

/// Shortest permitted read position, in samples.
pub const MIN_DELAY: f32 = 4.0;

/// Length of the loop-seam linear crossfade (~0.5 ms at 48 kHz).
const SEAM_XFADE_LEN: i32 = 24;

/// Slices for meta2 divisor quantization in the delay family.
const META2_SLICES: f32 = 24.0;

/// Read-position jump threshold: larger movements get a crossfade
/// instead of a snap.
#[inline]
fn jump_threshold(base_delay: f32) -> f32 {
    (0.45 * base_delay).max(64.0)
}

#[inline]
fn mtof(note: f32) -> f32 {
    440.0 * ((note - 69.0) / 12.0).exp2()
}

#[inline]
fn semitones_to_ratio(semitones: f32) -> f32 {
    (semitones / 12.0).exp2()
}

/// Per-frame input to the engine.
///
/// The surrounding application owns the delay lines and phasors; the
/// engine only reads the lines (writes happen in the feedback stage) but
/// advances the phasors.
pub struct FrameInput<'a> {
    pub dry: [f32; 4],
    /// Target delay length per channel, in samples.
    pub delay_times: [f32; 4],
    /// Smoothed meta knob values in [0, 1].
    pub meta: f32,
    pub meta2: f32,
    /// P1..P4 in real units per the active mode's param specs.
    pub params: [f32; 4],
    /// Raw time-knob positions in [0, 1]; the resonator derives its
    /// tuning from these rather than from `delay_times`.
    pub time_knobs: [f32; 2],
    pub freeze: bool,
    pub allpass: bool,
    /// Feedback knob in [0, 1], used for the allpass coefficient.
    pub feedback: f32,
    /// Upper bound for read positions this frame.
    pub max_delay_working: f32,
    pub delays: &'a [DelayLine; 4],
    pub phasors: &'a mut [DelayPhasor; 4],
}

/// Wet output plus the samples routed back into the feedback path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameOutput {
    pub wet: [f32; 4],
    /// Feedback-source samples; may differ from `wet` in future routings.
    pub whichout: [f32; 4],
}

/// Loop-seam crossfade bookkeeping shared by all modes.
///
/// Tracks the previous read position per channel; when a caller reports a
/// new position that jumped past the threshold, the next
/// [`SEAM_XFADE_LEN`] samples linearly fade from the last emitted output
/// to the new read instead of snapping.
#[derive(Debug, Clone, Copy)]
struct SeamState {
    read_pos: [f32; 4],
    remaining: [i32; 4],
    prev_out: [f32; 4],
    last_output: [f32; 4],
}

impl SeamState {
    fn new() -> Self {
        Self {
            read_pos: [0.0; 4],
            remaining: [0; 4],
            prev_out: [0.0; 4],
            last_output: [0.0; 4],
        }
    }

    /// Register a new read position; arms the crossfade on a jump.
    fn begin(&mut self, channel: usize, new_pos: f32, base_delay: f32) {
        let delta = (new_pos - self.read_pos[channel]).abs();
        if delta > jump_threshold(base_delay) {
            self.prev_out[channel] = self.last_output[channel];
            self.remaining[channel] = SEAM_XFADE_LEN;
        }
        self.read_pos[channel] = new_pos;
    }

    /// Force the crossfade regardless of position movement (used on
    /// divisor slice changes).
    fn force(&mut self, channel: usize) {
        self.prev_out[channel] = self.last_output[channel];
        self.remaining[channel] = SEAM_XFADE_LEN;
    }

    /// Mix a freshly-read sample through any active crossfade.
    fn mix(&mut self, channel: usize, new_sample: f32) -> f32 {
        if self.remaining[channel] > 0 {
            let t = 1.0 - self.remaining[channel] as f32 / SEAM_XFADE_LEN as f32;
            self.remaining[channel] -= 1;
            self.prev_out[channel] * (1.0 - t) + new_sample * t
        } else {
            new_sample
        }
    }

    /// Position-smoothed helper for modes that slew instead of snap.
    fn smooth_to(&mut self, channel: usize, target: f32, coeff: f32) -> f32 {
        let mut pos = self.read_pos[channel];
        one_pole(&mut pos, target, coeff);
        self.read_pos[channel] = pos;
        pos
    }

    fn note_output(&mut self, channel: usize, value: f32) {
        self.last_output[channel] = value;
    }
}

/// Which granular flavor is running; selects pitch mapping, accumulator
/// gain, wrap bounds, and modulation presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GranFlavor {
    Plain,
    Octave,
    Texture,
    Shimmer,
}

/// Per-channel crystal block state.
#[derive(Debug, Clone, Copy, Default)]
struct CrystalChannel {
    initialized: bool,
    hold_pos: f32,
    target_pos: f32,
    step_timer: f32,
    lp_state: f32,
    block_base: f32,
    block_size: f32,
    subdivisions: i32,
    steps_done: i32,
    pitch_state: f32,
}

/// Mode-specific persistent state, selected by the active mode tag.
enum ModeState {
    /// Basic family (basic, ping-pong, unlinked, resonator, chorus,
    /// Knuth): freeze-scrub phase per channel.
    Delay { freeze_phase: [f32; 4] },
    /// Accumulator-based granular family, plus the grain pool used while
    /// frozen.
    Granular {
        rate_accum: [f32; 4],
        scrub: [GrainPlayer; 2],
    },
    Crystals { channels: [CrystalChannel; 4] },
    Fluid { field: FluidField },
}

impl ModeState {
    fn for_mode(mode: EffectMode, sample_rate: f32) -> Self {
        match mode {
            EffectMode::GranularCrystals => ModeState::Crystals {
                channels: [CrystalChannel::default(); 4],
            },
            EffectMode::Fluid => ModeState::Fluid {
                field: FluidField::new(sample_rate),
            },
            m if m.is_granular() => ModeState::Granular {
                rate_accum: [0.0; 4],
                scrub: [GrainPlayer::new(), GrainPlayer::new()],
            },
            _ => ModeState::Delay {
                freeze_phase: [0.0; 4],
            },
        }
    }
}

/// The effect-mode engine. One instance per instrument.
pub struct ModeEngine {
    sample_rate: f32,
    sample_interval: f32,
    mode: EffectMode,
    state: ModeState,

    chorus: [TriLfo; 2],
    seam: SeamState,
    allpass: AllpassPair,
    rng: Rng,

    // meta2 divisor slice tracking (delay family).
    quantized_meta2: i32,
    last_quantized_meta2: i32,
    meta2_primed: bool,
}

impl ModeEngine {
    pub fn new(sample_rate: f32) -> Self {
        let sample_rate = if sample_rate > 0.0 { sample_rate } else { 48000.0 };
        let mut chorus = [TriLfo::new(sample_rate), TriLfo::new(sample_rate)];
        for lfo in chorus.iter_mut() {
            lfo.set_freq(2.0);
            lfo.set_amp(1.0);
        }
        Self {
            sample_rate,
            sample_interval: 1.0 / sample_rate,
            mode: EffectMode::Basic,
            state: ModeState::for_mode(EffectMode::Basic, sample_rate),
            chorus,
            seam: SeamState::new(),
            allpass: AllpassPair::new(),
            rng: Rng::from_seed(0x6c61_676f),
            quantized_meta2: 0,
            last_quantized_meta2: 0,
            meta2_primed: false,
        }
    }

    /// Reset all persistent state to defaults, keeping the active mode.
    pub fn reset(&mut self) {
        self.state = ModeState::for_mode(self.mode, self.sample_rate);
        self.seam = SeamState::new();
        self.allpass.reset();
        for lfo in self.chorus.iter_mut() {
            lfo.reset();
        }
        self.quantized_meta2 = 0;
        self.last_quantized_meta2 = 0;
        self.meta2_primed = false;
    }

    pub fn mode(&self) -> EffectMode {
        self.mode
    }

    /// Switch effect mode; the outgoing mode's state is dropped and the
    /// incoming mode starts from defaults.
    pub fn set_mode(&mut self, mode: EffectMode) {
        if self.mode != mode {
            log::debug!("effect mode {} -> {}", self.mode.name(), mode.name());
            self.mode = mode;
            self.state = ModeState::for_mode(mode, self.sample_rate);
        }
    }

    /// Produce one frame of wet output.
    pub fn process(&mut self, s: &mut FrameInput) -> FrameOutput {
        // A degenerate working range would invert the position clamps.
        s.max_delay_working = s.max_delay_working.max(MIN_DELAY * 2.0);

        // Chorus LFO pair runs every frame; several modes tap it as a
        // modulation source. In Chorus mode P1/P2 carry real units.
        let (rate_hz, depth) = if self.mode == EffectMode::Chorus {
            (s.params[0].clamp(0.01, 20.0), s.params[1].clamp(0.0, 1.0))
        } else {
            (
                map_exp(s.meta, 0.1, 5.0),
                map_linear(s.meta2, 0.05, 1.0),
            )
        };
        for lfo in self.chorus.iter_mut() {
            lfo.set_freq(rate_hz);
            lfo.set_amp(depth);
            lfo.process();
        }

        let mut out = FrameOutput::default();

        match self.mode {
            EffectMode::Basic
            | EffectMode::PingPong
            | EffectMode::Unlinked
            | EffectMode::Resonator
            | EffectMode::Chorus
            | EffectMode::Knuth => self.process_delay_family(s, &mut out),
            EffectMode::Granular => self.process_granular(s, &mut out, GranFlavor::Plain),
            EffectMode::GranularOctave => self.process_granular(s, &mut out, GranFlavor::Octave),
            EffectMode::GranularTexture => self.process_granular(s, &mut out, GranFlavor::Texture),
            EffectMode::GranularShimmer => self.process_granular(s, &mut out, GranFlavor::Shimmer),
            EffectMode::GranularCrystals => self.process_crystals(s, &mut out),
            EffectMode::Fluid => self.process_fluid(s, &mut out),
        }

        // Shared guards: a single corrupted sample must not poison the
        // feedback loop.
        for w in out.wet.iter_mut() {
            *w = guard_finite(*w);
        }

        if s.allpass {
            let c = map_linear(s.feedback, 0.001, 0.08);
            let (mut l, mut r) = (out.wet[0], out.wet[1]);
            self.allpass.process(&mut l, &mut r, c);
            out.wet[0] = l;
            out.wet[1] = r;
        }

        for channel in 0..4 {
            out.whichout[channel] = out.wet[channel];
            self.seam.note_output(channel, out.wet[channel]);
        }
        out
    }

    /// Basic, ping-pong, unlinked, resonator, chorus, and Knuth modes.
    /// Ping-pong differs only in the feedback routing, which lives with
    /// the caller.
    fn process_delay_family(&mut self, s: &mut FrameInput, out: &mut FrameOutput) {
        let ModeState::Delay { freeze_phase } = &mut self.state else {
            return;
        };

        let chr = [self.chorus[0].last_unscaled, self.chorus[1].last_unscaled];

        let mut delay_times = s.delay_times;
        if self.mode == EffectMode::Resonator {
            // Knob position picks a key; the delay line becomes a tuned
            // comb resonator at that note's period.
            let note_l = ((s.time_knobs[0] * 88.0).floor() - 88.88).abs();
            let note_r = ((s.time_knobs[1] * 88.0).floor() - 88.0).abs();
            delay_times[0] = self.sample_rate / mtof(note_l).floor().max(1.0);
            delay_times[1] = self.sample_rate / mtof(note_r).floor().max(1.0);
            delay_times[2] = delay_times[0];
            delay_times[3] = delay_times[1];
        }

        // Divisor slice quantization: step changes arm the shared seam
        // crossfade so a slice boundary never clicks.
        self.quantized_meta2 = (s.meta2 * META2_SLICES).floor() as i32;
        let slice = self.quantized_meta2 as f32 / META2_SLICES;
        if !self.meta2_primed {
            self.last_quantized_meta2 = self.quantized_meta2;
            self.meta2_primed = true;
        }
        if self.quantized_meta2 != self.last_quantized_meta2 {
            for channel in 0..4 {
                self.seam.force(channel);
            }
            self.last_quantized_meta2 = self.quantized_meta2;
        }

        // Freeze-scrub phase per channel, rate coupled to the delay
        // length and the quantized divisor.
        let mut phase_now = [0.0f32; 4];
        for channel in 0..4 {
            let freq_base = self.sample_rate / delay_times[channel].max(1.0);
            let inc = freq_base * slice / self.sample_rate;
            freeze_phase[channel] = (freeze_phase[channel] + inc).fract();
            phase_now[channel] = freeze_phase[channel];
        }

        if s.freeze {
            // Scrub the frozen buffer directly; smoothing is bypassed so
            // the quantized jumps stay rhythmic.
            let step = 10.0;
            let quant_l = phase_now[0] + (((s.meta + 1.0) * step).floor() + 1.0) / step;
            let quant_r = phase_now[1] + ((s.meta + 1.0) * step).floor() / step;

            let max_pos = (s.max_delay_working - MIN_DELAY).max(MIN_DELAY);
            let pos_l = ((quant_l.fract() * delay_times[0]) % delay_times[0].max(1.0)
                * (s.meta * 8.0))
                .clamp(MIN_DELAY, max_pos);
            let pos_r = ((quant_r.fract() * delay_times[1]) % delay_times[1].max(1.0)
                * (s.meta * 8.0))
                .clamp(MIN_DELAY, max_pos);

            out.wet[0] = self.seam.mix(0, s.delays[0].read_hermite(pos_l));
            out.wet[1] = self.seam.mix(1, s.delays[1].read_hermite(pos_r));
            out.wet[2] = out.wet[0];
            out.wet[3] = out.wet[1];
            return;
        }

        match self.mode {
            EffectMode::Chorus => {
                // Two reads per channel: the still tap plus a tap pushed
                // out by up to ~20% of the base delay under the LFO.
                for pair in 0..2 {
                    let j = pair * 2;
                    let depth_l = 0.02 + 0.18 * chr[0].abs();
                    let depth_r = 0.02 + 0.18 * chr[1].abs();
                    let max_pos = s.max_delay_working;

                    let l1 = delay_times[j];
                    let l2 = (delay_times[j] * (1.0 + depth_l)).clamp(MIN_DELAY, max_pos);
                    let r1 = delay_times[j + 1];
                    let r2 = (delay_times[j + 1] * (1.0 + depth_r)).clamp(MIN_DELAY, max_pos);

                    out.wet[j] =
                        0.5 * (s.delays[j].read_hermite(l1) + s.delays[j].read_hermite(l2));
                    out.wet[j + 1] = 0.5
                        * (s.delays[j + 1].read_hermite(r1) + s.delays[j + 1].read_hermite(r2));
                }
            }
            EffectMode::Knuth => {
                // Slow phasor sweep pulled back toward the loop start;
                // the 5 ms position slew is the character of the mode.
                let specs = self.mode.param_specs();
                let p1 = specs[0].range.normalize(s.params[0]);
                let p2 = specs[1].range.normalize(s.params[1]);
                let coeff = ms_to_coeff(5.0, self.sample_rate);

                for channel in 0..4 {
                    let ph = &mut s.phasors[channel];
                    ph.set_delay_samples(delay_times[channel]);
                    ph.set_mod_freq_ratio(0.01 + 0.09 * p1);
                    ph.set_mod_depth(0.01 + 0.09 * p2);
                    ph.set_write_ptr(s.delays[channel].write_pos());
                    ph.process();

                    let target = delay_times[channel] - ph.delay_position();
                    let pos = self
                        .seam
                        .smooth_to(channel, target, coeff)
                        .clamp(MIN_DELAY, s.max_delay_working);
                    out.wet[channel] = s.delays[channel].read_hermite(pos);
                }
            }
            _ => {
                for channel in 0..4 {
                    out.wet[channel] = self.seam.mix(
                        channel,
                        s.delays[channel].read_hermite(delay_times[channel]),
                    );
                }
            }
        }
    }

    /// Accumulator-based granular family: plain, octave, texture,
    /// shimmer.
    fn process_granular(&mut self, s: &mut FrameInput, out: &mut FrameOutput, flavor: GranFlavor) {
        let ModeState::Granular { rate_accum, scrub } = &mut self.state else {
            return;
        };

        if s.freeze {
            // Frozen: scrub the held buffer with the windowed grain pool
            // instead of the rate accumulator.
            let spread = s.meta.clamp(0.0, 1.0);
            let grain_size = MIN_GRAIN_SIZE + (MAX_GRAIN_SIZE - MIN_GRAIN_SIZE) * spread;
            let spacing = grain_size * map_linear(s.meta2, 0.25, 0.75);

            for pair in 0..2 {
                let wet = scrub[pair].process_scrub(
                    &s.delays[pair],
                    s.delay_times[pair],
                    spread,
                    spacing,
                    &mut self.rng,
                );
                out.wet[pair] = wet;
                out.wet[pair + 2] = wet;
            }
            return;
        }

        let shimmer_mod = 0.02 * self.chorus[0].last_unscaled;

        // Meta1 -> playback rate. Plain/texture keep a small deadband at
        // center so "straight" stays exactly 1.0x.
        let deadband = 0.05;
        let playback_rate = match flavor {
            GranFlavor::Plain => {
                let mut rate = 1.0;
                if s.meta < 0.5 - deadband {
                    rate = map_exp(s.meta / (0.5 - deadband), 0.25, 1.0);
                } else if s.meta > 0.5 + deadband {
                    let n = (s.meta - (0.5 + deadband)) / (0.5 - deadband);
                    rate = map_exp(n, 1.0, 4.0);
                }
                rate * semitones_to_ratio(s.params[2])
            }
            GranFlavor::Octave => {
                semitones_to_ratio((s.meta - 0.5) * 24.0) * semitones_to_ratio(s.params[2])
            }
            GranFlavor::Texture => {
                if s.meta < 0.5 - deadband {
                    map_exp(s.meta / (0.5 - deadband), 0.94, 1.0)
                } else if s.meta > 0.5 + deadband {
                    let n = (s.meta - (0.5 + deadband)) / (0.5 - deadband);
                    map_exp(n, 1.0, 1.06)
                } else {
                    1.0
                }
            }
            GranFlavor::Shimmer => {
                // Upward bias plus a whisper of chorus cross-modulation.
                semitones_to_ratio(s.meta * 7.0) * (1.0 + shimmer_mod * 0.01)
            }
        };

        let specs = self.mode.param_specs();
        let p1 = specs[0].range.normalize(s.params[0]);
        let p2 = specs[1].range.normalize(s.params[1]);
        let p4 = specs[3].range.normalize(s.params[3]);

        let (mod_ratio, mod_depth, depth_scale) = match flavor {
            GranFlavor::Plain | GranFlavor::Octave => {
                let ratio = if p1 > 0.01 { p1 * 0.1 } else { 0.0 };
                let depth = if p2 > 0.01 { p2 } else { 0.0 };
                (ratio, depth, 0.5)
            }
            GranFlavor::Texture => (0.005 + p1 * 0.02, 0.1 + p2 * 0.3, 0.5),
            GranFlavor::Shimmer => (0.05 + p1 * 0.15, 0.3 + p2 * 0.5, 0.7),
        };

        let time_division = match flavor {
            GranFlavor::Plain | GranFlavor::Octave => {
                if s.meta2 > 0.05 {
                    map_exp(s.meta2, 1.0, 16.0)
                } else {
                    1.0
                }
            }
            GranFlavor::Texture => {
                if s.meta2 > 0.05 {
                    map_exp(s.meta2, 1.0, 8.0)
                } else {
                    1.0
                }
            }
            GranFlavor::Shimmer => {
                if s.meta2 > 0.05 {
                    map_exp(s.meta2, 2.0, 32.0)
                } else {
                    1.0
                }
            }
        };

        let crossfade_amount = match flavor {
            GranFlavor::Plain | GranFlavor::Octave => p4 * 0.1,
            GranFlavor::Texture => 0.05 + p4 * 0.15,
            GranFlavor::Shimmer => 0.1 + p4 * 0.2,
        };

        let pitching = match flavor {
            GranFlavor::Plain => (playback_rate - 1.0).abs() > 0.01,
            GranFlavor::Octave => (playback_rate - 1.0).abs() > 1e-4,
            GranFlavor::Texture => (playback_rate - 1.0).abs() > 0.005,
            GranFlavor::Shimmer => true,
        };

        for channel in 0..4 {
            let base = s.delay_times[channel];
            let mut read_pos = base;

            // Phasor wobble around the base position.
            if mod_ratio > 0.0 || mod_depth > 0.0 {
                let ph = &mut s.phasors[channel];
                ph.set_delay_samples(base);
                ph.set_mod_freq_ratio(mod_ratio);
                ph.set_mod_depth(mod_depth * depth_scale);
                ph.set_write_ptr(s.delays[channel].write_pos());
                ph.process();
                read_pos = base - ph.delay_position();
            }

            // Rate-driven position drift, wrapped inside a bounded window
            // so pitch shifting never walks off the buffer.
            if pitching {
                let accum = &mut rate_accum[channel];
                match flavor {
                    GranFlavor::Plain => {
                        *accum += (playback_rate - 1.0) * 0.1;
                        if *accum > base * 0.5 {
                            *accum -= base;
                        }
                        if *accum < -base * 0.5 {
                            *accum += base;
                        }
                    }
                    GranFlavor::Octave => {
                        let scale = (base * 0.002).clamp(12.0, 512.0);
                        *accum += (playback_rate - 1.0) * scale;
                        if *accum > base {
                            *accum -= base;
                        }
                        if *accum < -base {
                            *accum += base;
                        }
                    }
                    GranFlavor::Texture => {
                        *accum += (playback_rate - 1.0) * 0.05;
                        if *accum > base * 0.3 {
                            *accum -= base * 0.6;
                        }
                        if *accum < -base * 0.3 {
                            *accum += base * 0.6;
                        }
                    }
                    GranFlavor::Shimmer => {
                        *accum += (playback_rate - 1.0) * 0.08;
                        if *accum > base * 0.4 {
                            *accum -= base * 0.8;
                        }
                        if *accum < -base * 0.4 {
                            *accum += base * 0.8;
                        }
                    }
                }
                read_pos += *accum;
            }

            // Meta2 quantizes the position to a time grid, blended in by
            // the P4 crossfade amount.
            if time_division > 1.01 {
                let quantized = (read_pos / time_division).floor() * time_division;
                read_pos += crossfade_amount * (quantized - read_pos);
            }

            let read_pos = read_pos.clamp(MIN_DELAY, s.max_delay_working - MIN_DELAY);

            self.seam.begin(channel, read_pos, base);
            let new_sample = s.delays[channel].read_hermite(read_pos);
            let mut wet = self.seam.mix(channel, new_sample);

            wet *= match flavor {
                GranFlavor::Plain | GranFlavor::Octave => {
                    if pitching {
                        0.95
                    } else {
                        1.0
                    }
                }
                GranFlavor::Texture => 0.98,
                GranFlavor::Shimmer => 0.9 + 0.1 * (shimmer_mod * 0.1).abs(),
            };
            out.wet[channel] = wet;
        }
    }

    /// Crystals: the phasor ramp is frozen into fixed-size rhythmic
    /// blocks, cycled through sub-steps, pitch-nudged, and tone-tilted.
    fn process_crystals(&mut self, s: &mut FrameInput, out: &mut FrameOutput) {
        let ModeState::Crystals { channels } = &mut self.state else {
            return;
        };

        let step_rate_hz =
            (if s.params[0] > 0.0 { s.params[0] } else { 1.0 }).clamp(1.0, 128.0);
        let step_period = (self.sample_rate / step_rate_hz).max(1.0);

        let crystal_ms =
            (if s.params[1] > 0.0 { s.params[1] } else { 12.0 }).clamp(2.0, 1024.0);
        let crystal_unit = (crystal_ms * 0.001 * self.sample_rate).max(1.0);

        let specs = self.mode.param_specs();
        let color = specs[2].range.normalize(s.params[2]);
        let edge = specs[3].range.normalize(s.params[3]);
        let crossfade_amount = (0.01 + (1.0 - edge) * 0.09).clamp(0.005, 0.1);
        let tone_pole =
            (-2.0 * std::f32::consts::PI * 2000.0 * self.sample_interval).exp().clamp(0.0, 0.9999);

        let pitch_semitones =
            map_linear(s.meta.clamp(0.0, 1.0), -12.0, 12.0).round();
        let playback_rate = semitones_to_ratio(pitch_semitones);

        let desired_subdiv =
            (1 + (s.meta2.clamp(0.0, 1.0) * 7.0).round() as i32).clamp(1, 8);

        let max_pos = s.max_delay_working - MIN_DELAY;

        for channel in 0..4 {
            let c = &mut channels[channel];
            let base_delay = s.delay_times[channel].clamp(MIN_DELAY, max_pos);

            let ph = &mut s.phasors[channel];
            ph.set_delay_samples(base_delay);
            ph.set_mod_freq_ratio(0.0);
            ph.set_mod_depth(0.0);
            ph.set_write_ptr(s.delays[channel].write_pos());
            ph.process();
            let base_pos = ph.delay_position();

            let max_quant = (base_delay - MIN_DELAY).max(MIN_DELAY);
            let mut quant_unit = crystal_unit.clamp(MIN_DELAY, max_quant);
            if base_delay <= 8.0 {
                quant_unit = (base_delay * 0.5).max(MIN_DELAY);
            }

            c.step_timer -= 1.0;
            if c.initialized && desired_subdiv != c.subdivisions && c.steps_done < c.subdivisions {
                // Subdivision count changed mid-block: finish the block
                // early rather than mixing grids.
                c.steps_done = c.subdivisions;
            }

            let trigger = c.step_timer <= 0.0 || !c.initialized;
            if trigger {
                let need_new_block = !c.initialized || c.steps_done >= c.subdivisions;
                if need_new_block {
                    let quantized = (base_pos / quant_unit).floor() * quant_unit;
                    let block_span = quant_unit.max(1.0);
                    let max_base = (base_delay - block_span).max(0.0);
                    c.block_base = quantized.clamp(0.0, max_base);
                    c.block_size = block_span;
                    c.subdivisions = desired_subdiv;
                    c.steps_done = 0;
                    c.pitch_state = 0.0;
                }

                let active = c.subdivisions.max(1);
                let sub_size = (c.block_size / active as f32).max(1.0);
                let sub_center = (c.steps_done as f32 + 0.5) * sub_size;
                let block_target =
                    (c.block_base + sub_center).clamp(0.0, base_delay - MIN_DELAY);
                c.target_pos = (base_delay - block_target).clamp(MIN_DELAY, max_pos);

                c.steps_done += 1;
                c.step_timer += (step_period / c.subdivisions.max(1) as f32).max(1.0);
                c.initialized = true;
            }

            c.hold_pos += crossfade_amount * (c.target_pos - c.hold_pos);
            let held = c.hold_pos.clamp(MIN_DELAY, max_pos);

            let active = c.subdivisions.max(1);
            let active_sub_size = if c.block_size > 0.0 {
                (c.block_size / active as f32).max(1.0)
            } else {
                quant_unit.max(1.0)
            };
            let pitch_delta = playback_rate - 1.0;
            if pitch_delta.abs() > 1e-5 {
                c.pitch_state += pitch_delta;
                let limit = active_sub_size * 0.5;
                c.pitch_state = c.pitch_state.clamp(-limit, limit);
            } else {
                c.pitch_state = 0.0;
            }

            let edge_slew_ms = 1.0 + (1.0 - edge) * 6.0;
            let prev = self.seam.read_pos[channel];
            let mut smoothed = prev;
            one_pole(
                &mut smoothed,
                held,
                ms_to_coeff(edge_slew_ms, self.sample_rate),
            );
            let pitched = (smoothed - c.pitch_state).clamp(MIN_DELAY, max_pos);

            if (pitched - prev).abs() > jump_threshold(s.delay_times[channel]) {
                self.seam.force(channel);
            }
            self.seam.read_pos[channel] = pitched;

            let sample = s.delays[channel].read_hermite(pitched);
            one_pole(&mut c.lp_state, sample, tone_pole);
            let colored = c.lp_state + (sample - c.lp_state) * color;

            out.wet[channel] = self.seam.mix(channel, colored);
        }
    }

    /// Fluid: vortex-field particles wander the read positions.
    fn process_fluid(&mut self, s: &mut FrameInput, out: &mut FrameOutput) {
        let ModeState::Fluid { field } = &mut self.state else {
            return;
        };

        let params = FluidParams {
            flow_hz: s.params[0].max(0.0),
            viscosity_ms: s.params[1].max(0.0001),
            couple: s.params[2].clamp(0.0, 1.0),
            turbulence: s.params[3].clamp(0.0, 1.0),
            meta: s.meta,
            meta2: s.meta2,
        };

        field.step(&params);

        let coeff = ms_to_coeff(6.0, self.sample_rate);
        for channel in 0..4 {
            let base = s.delay_times[channel];
            let target = (base + field.offset(channel, &params, base))
                .clamp(MIN_DELAY, s.max_delay_working - MIN_DELAY);

            let pos = self.seam.smooth_to(channel, target, coeff);
            let x = s.delays[channel].read_hermite(pos);
            out.wet[channel] = (x * 0.98).tanh();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::EffectMode;

    const SR: f32 = 48000.0;
    const CAP: usize = 48000;

    struct Rig {
        engine: ModeEngine,
        delays: [DelayLine; 4],
        phasors: [DelayPhasor; 4],
    }

    impl Rig {
        fn new(mode: EffectMode) -> Self {
            let mut engine = ModeEngine::new(SR);
            engine.set_mode(mode);
            Self {
                engine,
                delays: std::array::from_fn(|_| DelayLine::new(CAP)),
                phasors: std::array::from_fn(|_| DelayPhasor::new(SR)),
            }
        }

        fn fill_noise(&mut self) {
            let mut rng = Rng::from_seed(1234);
            for _ in 0..CAP {
                let x = rng.next_f32_bipolar() * 0.5;
                for d in self.delays.iter_mut() {
                    d.write(x);
                }
            }
        }

        #[allow(clippy::too_many_arguments)]
        fn frame(
            &mut self,
            dry: f32,
            delay: f32,
            meta: f32,
            meta2: f32,
            params: [f32; 4],
            freeze: bool,
        ) -> FrameOutput {
            let mut input = FrameInput {
                dry: [dry; 4],
                delay_times: [delay, delay, delay * 0.5, delay * 0.5],
                meta,
                meta2,
                params,
                time_knobs: [0.5, 0.5],
                freeze,
                allpass: false,
                feedback: 0.3,
                max_delay_working: CAP as f32,
                delays: &self.delays,
                phasors: &mut self.phasors,
            };
            self.engine.process(&mut input)
        }
    }

    fn default_params(mode: EffectMode) -> [f32; 4] {
        let specs = mode.param_specs();
        [
            specs[0].default,
            specs[1].default,
            specs[2].default,
            specs[3].default,
        ]
    }

    #[test]
    fn test_all_modes_produce_finite_output() {
        // No NaN/Inf leakage: every mode, knobs swept across their range,
        // freeze toggling, always finite wet output.
        for mode in EffectMode::ALL {
            let mut rig = Rig::new(mode);
            rig.fill_noise();
            let params = default_params(mode);

            for i in 0..4000 {
                let meta = (i % 100) as f32 / 99.0;
                let meta2 = (i % 37) as f32 / 36.0;
                let freeze = (i / 1000) % 2 == 1;
                let out = rig.frame(0.25, 9600.0, meta, meta2, params, freeze);
                for (channel, w) in out.wet.iter().enumerate() {
                    assert!(
                        w.is_finite(),
                        "{:?} ch{} frame {} produced {}",
                        mode,
                        channel,
                        i,
                        w
                    );
                }
            }
        }
    }

    #[test]
    fn test_all_modes_extreme_params_finite() {
        for mode in EffectMode::ALL {
            let mut rig = Rig::new(mode);
            rig.fill_noise();
            let specs = mode.param_specs();
            let params = std::array::from_fn(|i| specs[i].range.apply(1.0));

            for i in 0..2000 {
                let out = rig.frame(0.9, 200.0, 1.0, 1.0, params, i % 2 == 0);
                for w in out.wet.iter() {
                    assert!(w.is_finite(), "{:?} produced {}", mode, w);
                }
            }
        }
    }

    #[test]
    fn test_basic_mode_is_plain_delay() {
        let mut rig = Rig::new(EffectMode::Basic);
        rig.fill_noise();

        let delay = 1000.0;
        let expected = rig.delays[0].read_hermite(delay);
        let out = rig.frame(0.0, delay, 0.2, 0.2, default_params(EffectMode::Basic), false);
        assert!((out.wet[0] - expected).abs() < 1e-6);
        assert_eq!(out.wet[0], out.whichout[0]);
    }

    #[test]
    fn test_granular_at_center_matches_basic() {
        // At the pitch deadband center with modulation off, the granular
        // mode degenerates to a plain delay read.
        let mut rig = Rig::new(EffectMode::Granular);
        rig.fill_noise();

        let delay = 2000.0;
        let expected = rig.delays[0].read_hermite(delay);
        // The very first frames ride the initial seam crossfade; after it
        // expires the output is a plain delayed read.
        let mut out = FrameOutput::default();
        for _ in 0..SEAM_XFADE_LEN + 2 {
            out = rig.frame(0.0, delay, 0.5, 0.0, [0.0, 0.0, 0.0, 0.0], false);
        }
        assert!(
            (out.wet[0] - expected).abs() < 1e-5,
            "expected {}, got {}",
            expected,
            out.wet[0]
        );
    }

    #[test]
    fn test_seam_crossfade_bounds_discontinuity() {
        // Build a buffer whose halves sit at +1 and -1 DC; drive the
        // granular accumulator until it wraps (a seam jump between the
        // halves) and verify the output never steps harder than a
        // 24-sample linear crossfade of the two levels.
        let mut rig = Rig::new(EffectMode::Granular);
        for i in 0..CAP {
            let v = if i < CAP - 12000 { 1.0 } else { -1.0 };
            for d in rig.delays.iter_mut() {
                d.write(v);
            }
        }

        let delay = 12000.0;
        let mut last = None;
        let mut max_delta = 0.0f32;
        // meta = 1.0 -> 4x rate -> accumulator gains 0.3/frame; the wrap
        // lands near frame 20000.
        for _ in 0..20100 {
            let out = rig.frame(0.0, delay, 1.0, 0.0, [0.0, 0.0, 0.0, 0.0], false);
            if let Some(prev) = last {
                max_delta = max_delta.max((out.wet[0] - prev as f32).abs());
            }
            last = Some(out.wet[0]);
        }

        // Two DC levels 1.9 apart (after 0.95 level compensation) over a
        // 24-sample fade: per-sample step stays well under a direct snap.
        assert!(
            max_delta < 0.15,
            "seam produced a {} step; crossfade failed",
            max_delta
        );
    }

    #[test]
    fn test_chorus_two_tap_average_stays_bounded() {
        let mut rig = Rig::new(EffectMode::Chorus);
        for _ in 0..CAP {
            for d in rig.delays.iter_mut() {
                d.write(1.0);
            }
        }

        // A DC buffer averaged over two taps must stay at DC.
        for _ in 0..5000 {
            let out = rig.frame(0.0, 4800.0, 0.5, 0.5, [2.0, 0.8, 0.5, 0.5], false);
            for w in out.wet.iter().take(2) {
                assert!((w - 1.0).abs() < 1e-3, "chorus DC drifted: {}", w);
            }
        }
    }

    #[test]
    fn test_resonator_ignores_delay_targets() {
        // The resonator tunes from the time knobs, so two very different
        // delay targets read at the same (knob-derived) position.
        let mut rig = Rig::new(EffectMode::Resonator);
        rig.fill_noise();
        let params = default_params(EffectMode::Resonator);

        let a = rig.frame(0.0, 3000.0, 0.5, 0.5, params, false);
        let b = rig.frame(0.0, 30000.0, 0.5, 0.5, params, false);
        // Consecutive frames of a static buffer at the same position read
        // the same sample.
        assert!((a.wet[0] - b.wet[0]).abs() < 1e-6);
    }

    #[test]
    fn test_crystals_steps_advance() {
        let mut rig = Rig::new(EffectMode::GranularCrystals);
        rig.fill_noise();
        let params = default_params(EffectMode::GranularCrystals);

        let mut distinct = std::collections::BTreeSet::new();
        for _ in 0..48000 {
            let out = rig.frame(0.1, 9600.0, 0.5, 0.8, params, false);
            distinct.insert((out.wet[0] * 1e4) as i64);
        }
        // Block stepping must actually visit multiple read regions.
        assert!(distinct.len() > 10, "crystals output too static");
    }

    #[test]
    fn test_fluid_mode_wanders_but_stays_soft_clipped() {
        let mut rig = Rig::new(EffectMode::Fluid);
        rig.fill_noise();
        let params = default_params(EffectMode::Fluid);

        for i in 0..48000 {
            let meta = 0.5 + 0.4 * ((i as f32) * 1e-4).sin();
            let out = rig.frame(0.2, 9600.0, meta, 0.4, params, false);
            for w in out.wet.iter() {
                assert!(w.abs() <= 1.0, "fluid exceeded soft clip: {}", w);
            }
        }
    }

    #[test]
    fn test_freeze_scrub_uses_grains() {
        let mut rig = Rig::new(EffectMode::Granular);
        rig.fill_noise();

        let mut nonzero = false;
        for _ in 0..20000 {
            let out = rig.frame(0.0, 9600.0, 0.6, 0.5, [0.0, 0.0, 0.0, 0.0], true);
            assert!(out.wet[0].is_finite());
            assert_eq!(out.wet[0], out.wet[2]);
            if out.wet[0].abs() > 1e-6 {
                nonzero = true;
            }
        }
        assert!(nonzero, "frozen scrub never produced audio");
    }

    #[test]
    fn test_mode_switch_resets_state() {
        let mut rig = Rig::new(EffectMode::Granular);
        rig.fill_noise();

        // Push the accumulator far from zero.
        for _ in 0..5000 {
            rig.frame(0.0, 9600.0, 1.0, 0.0, [0.0, 0.0, 0.0, 0.0], false);
        }
        rig.engine.set_mode(EffectMode::Fluid);
        rig.engine.set_mode(EffectMode::Granular);

        // Fresh accumulator: center pitch reads the base position again.
        let expected = rig.delays[0].read_hermite(2000.0);
        let mut out = FrameOutput::default();
        for _ in 0..SEAM_XFADE_LEN + 2 {
            out = rig.frame(0.0, 2000.0, 0.5, 0.0, [0.0, 0.0, 0.0, 0.0], false);
        }
        assert!((out.wet[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_allpass_stage_applies_to_stereo_pair() {
        let mut rig = Rig::new(EffectMode::Basic);
        rig.fill_noise();

        let mut input = FrameInput {
            dry: [0.0; 4],
            delay_times: [1000.0; 4],
            meta: 0.2,
            meta2: 0.2,
            params: default_params(EffectMode::Basic),
            time_knobs: [0.5, 0.5],
            freeze: false,
            allpass: true,
            feedback: 0.5,
            max_delay_working: CAP as f32,
            delays: &rig.delays,
            phasors: &mut rig.phasors,
        };
        let out = rig.engine.process(&mut input);
        for w in out.wet.iter() {
            assert!(w.is_finite());
        }
    }

    #[test]
    fn test_nan_in_buffer_is_scrubbed() {
        let mut rig = Rig::new(EffectMode::Basic);
        rig.fill_noise();
        // Poison the read region.
        for d in rig.delays.iter_mut() {
            for _ in 0..2000 {
                d.write(f32::NAN);
            }
        }
        let out = rig.frame(0.1, 1000.0, 0.2, 0.2, default_params(EffectMode::Basic), false);
        for w in out.wet.iter() {
            assert!(w.is_finite(), "NaN escaped the guard: {}", w);
        }
    }
}
