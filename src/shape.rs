//! Waveshaping, Guards, and Smoothing Primitives
//!
//! Stateless nonlinear transfer functions used by the distortion post
//! stage, plus the defensive-degradation helpers every mode funnels
//! through: NaN/Inf replacement, denormal killing, and one-pole smoothing.
//!
//! Nothing here allocates or branches unboundedly; all of it is safe to
//! call once per sample.

use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

/// Foldback distortion: signal exceeding the threshold reflects back
/// into range instead of clipping.
pub fn foldback(x: f32, threshold: f32) -> f32 {
    if x > threshold || x < -threshold {
        ((x - threshold).rem_euclid(threshold * 4.0).abs() - threshold * 2.0).abs() - threshold
    } else {
        x
    }
}

/// Diode-style clipper: smooth compression with a knee set by `factor`.
pub fn diode(x: f32, factor: f32) -> f32 {
    x / (factor + x.abs())
}

/// Bit-crush style quantizer. `a` in (0, 1] selects the step count out of
/// a 4096-step full-scale grid; `b` is an output gain in [0, 1].
pub fn quantize(x: f32, a: f32, b: f32) -> f32 {
    let steps = (4096.0 * a.clamp(0.0001, 1.0)).max(1.0);
    (x * steps).floor() / steps * b * 2.0
}

/// Wrapped-phase shaper: modulo into [0, 1) then tanh drive.
pub fn modulo_shape(x: f32, a: f32, b: f32) -> f32 {
    ((x * a * 10.0).rem_euclid(1.0) * b * 2.0).tanh()
}

/// Plain tanh saturation.
pub fn tanh_drive(x: f32, gain: f32) -> f32 {
    (x * gain).tanh()
}

/// Soft clip with drive-dependent knee.
pub fn soft_clip(x: f32, amount: f32) -> f32 {
    x / (1.0 + (x * amount).abs())
}

/// Hard clip into [-limit, limit].
pub fn hard_clip(x: f32, limit: f32) -> f32 {
    x.clamp(-limit, limit)
}

/// Asymmetric clipper: tanh on the positive half-cycle, linear attenuation
/// on the negative. Generates even harmonics.
pub fn asym_clip(x: f32, pos_drive: f32, neg_gain: f32) -> f32 {
    if x > 0.0 {
        (x * pos_drive).tanh()
    } else {
        x * neg_gain
    }
}

/// Sine waveshaper; overdriving the argument folds the transfer curve.
pub fn sine_shape(x: f32, drive: f32) -> f32 {
    (x * drive).sin() * 0.25
}

/// Distortion algorithm selector for the post stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distortion {
    Sine,
    Foldback,
    Tanh,
    Quantizer,
    Diode,
    Modulo,
    HardClip,
    SoftClip,
    Asymmetric,
}

/// Where the distortion stage is patched in the signal flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistortionTarget {
    #[default]
    Off,
    Dry,
    Wet,
    Both,
}

/// Apply a distortion algorithm in place to a four-channel frame.
///
/// `amount` is 0..100; zero or negative is a no-op.
pub fn apply_distortion(frame: &mut [f32; 4], algo: Distortion, amount: f32) {
    if amount <= 0.0 {
        return;
    }

    let a = 1.0 + amount * TAU * 0.01;
    let b = amount * 0.01;

    for x in frame.iter_mut() {
        *x = match algo {
            Distortion::Sine => sine_shape(*x, a),
            Distortion::Foldback => {
                let gain = map_exp(b, 1.0, 3.0);
                let threshold = map_linear(b, 8.0, 1.0);
                foldback(*x * gain, threshold)
            }
            Distortion::Tanh => tanh_drive(*x, amount),
            Distortion::Quantizer => {
                let resolution = map_exp(b, 1.0, 0.002);
                quantize(*x, resolution, 0.5)
            }
            Distortion::Diode => {
                let gain = map_exp(b, 1.0, 2.0);
                let factor = map_linear(b, 0.05, 0.5);
                diode(*x * gain, factor)
            }
            Distortion::Modulo => modulo_shape(*x, a, b),
            Distortion::HardClip => hard_clip(*x, b),
            Distortion::SoftClip => soft_clip(*x, amount * 0.01),
            Distortion::Asymmetric => asym_clip(*x, a, b),
        };
    }
}

/// Linear map of `t` in [0, 1] onto [min, max] (inverted ranges allowed).
#[inline]
pub fn map_linear(t: f32, min: f32, max: f32) -> f32 {
    min + t.clamp(0.0, 1.0) * (max - min)
}

/// Exponential map of `t` in [0, 1] onto [min, max]; both bounds must be
/// positive for a meaningful curve, a non-positive min degrades to linear
/// scaling of max.
#[inline]
pub fn map_exp(t: f32, min: f32, max: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    if min <= 0.0 {
        t * max
    } else {
        min * libm::Libm::<f32>::pow(max / min, t)
    }
}

/// Replace NaN or infinite samples with silence.
#[inline]
pub fn guard_finite(x: f32) -> f32 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

/// Flush a near-zero float out of denormal range by adding and
/// subtracting a tiny constant.
#[inline]
pub fn kill_denormal(x: f32) -> f32 {
    const ANTI_DENORMAL: f32 = 1e-18;
    let y = x + ANTI_DENORMAL;
    y - ANTI_DENORMAL
}

/// One-pole smoothing step: move `state` toward `target` by `coeff`.
#[inline]
pub fn one_pole(state: &mut f32, target: f32, coeff: f32) {
    *state += coeff * (target - *state);
}

/// Convert a smoothing time in milliseconds to a one-pole coefficient.
#[inline]
pub fn ms_to_coeff(ms: f32, sample_rate: f32) -> f32 {
    let ms = if ms <= 0.0 { 10.0 } else { ms };
    1.0 / (ms * 0.01 * sample_rate)
}

/// Owned one-pole smoother for control-rate slews.
#[derive(Debug, Clone, Copy)]
pub struct OnePole {
    y: f32,
    coeff: f32,
}

impl OnePole {
    pub fn new(sample_rate: f32, ms: f32) -> Self {
        Self {
            y: 0.0,
            coeff: ms_to_coeff(ms, sample_rate),
        }
    }

    /// Seed the smoother so the first `next` call does not sweep from zero.
    pub fn set(&mut self, value: f32) {
        self.y = value;
    }

    pub fn set_time(&mut self, sample_rate: f32, ms: f32) {
        self.coeff = ms_to_coeff(ms, sample_rate);
    }

    #[inline]
    pub fn next(&mut self, target: f32) -> f32 {
        self.y += self.coeff * (target - self.y);
        self.y
    }

    pub fn value(&self) -> f32 {
        self.y
    }
}

/// Two single-sample allpass filters for the optional wet post stage.
///
/// The coefficient comes from the feedback knob (mapped 0.001..0.08 by the
/// caller); both channels are denormal-killed on the way in.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllpassPair {
    old_x: [f32; 2],
    old_y: [f32; 2],
}

impl AllpassPair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.old_x = [0.0; 2];
        self.old_y = [0.0; 2];
    }

    pub fn process(&mut self, wet_l: &mut f32, wet_r: &mut f32, c: f32) {
        let mut l = kill_denormal(*wet_l);
        let mut r = kill_denormal(*wet_r);

        self.old_x[0] = l;
        l = -c * l + self.old_x[0] + c * self.old_y[0];
        self.old_x[1] = r;
        r = -c * r + self.old_x[1] + c * self.old_y[1];
        self.old_y[0] = l;
        self.old_y[1] = r;

        *wet_l = (l + self.old_x[0]) * 0.5;
        *wet_r = (r + self.old_x[1]) * 0.5;
    }
}
