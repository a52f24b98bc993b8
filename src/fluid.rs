//! Vortex-Field Modulation
//!
//! A lightweight fluid simulation that wanders four particles around a
//! unit square under the influence of two orbiting vortex point sources.
//! Each particle's position maps to a small offset around that channel's
//! base delay time, giving organically drifting modulation that never
//! repeats the way a periodic LFO does.
//!
//! The velocity field is a simplified Biot-Savart form: for each vortex,
//! the tangent direction divided by squared distance (plus a small
//! epsilon so a particle crossing a vortex center stays finite).
//! Integration is semi-implicit Euler with viscosity damping, plus a
//! smoothed random turbulence term per channel.

use crate::rng::Rng;
use crate::shape::{map_linear, ms_to_coeff, one_pole};
use std::f32::consts::TAU;

/// Per-frame control inputs for the field, in real units.
#[derive(Debug, Clone, Copy)]
pub struct FluidParams {
    /// Flow rate in Hz (orbit speed of the vortex centers).
    pub flow_hz: f32,
    /// Viscosity time constant in ms (larger = runnier, slower damping).
    pub viscosity_ms: f32,
    /// Coupling depth 0..1 (how far particles push the read position).
    pub couple: f32,
    /// Turbulence amount 0..1.
    pub turbulence: f32,
    /// Vorticity control 0..1 (0.5 = still, ends = opposite spins).
    pub meta: f32,
    /// Weight of the second vortex 0..1.
    pub meta2: f32,
}

/// Two-vortex field with four advected particles.
#[derive(Debug, Clone)]
pub struct FluidField {
    sample_rate: f32,
    sample_interval: f32,
    pos: [[f32; 2]; 4],
    vel: [[f32; 2]; 4],
    theta1: f32,
    theta2: f32,
    noise: [[f32; 2]; 4],
    rng: Rng,
}

impl FluidField {
    pub fn new(sample_rate: f32) -> Self {
        let sample_rate = if sample_rate > 0.0 { sample_rate } else { 48000.0 };
        let mut field = Self {
            sample_rate,
            sample_interval: 1.0 / sample_rate,
            pos: [[0.0; 2]; 4],
            vel: [[0.0; 2]; 4],
            theta1: 0.0,
            theta2: TAU * 0.25,
            noise: [[0.0; 2]; 4],
            rng: Rng::from_seed(0x1f1d),
        };
        field.reset();
        field
    }

    /// Scatter particles into the middle of the domain and still all
    /// motion.
    pub fn reset(&mut self) {
        for channel in 0..4 {
            self.pos[channel] = [
                0.1 + 0.8 * self.rng.next_f32(),
                0.1 + 0.8 * self.rng.next_f32(),
            ];
            self.vel[channel] = [0.0, 0.0];
            self.noise[channel] = [0.0, 0.0];
        }
        self.theta1 = 0.0;
        self.theta2 = TAU * 0.25;
    }

    pub fn position(&self, channel: usize) -> (f32, f32) {
        let p = self.pos[channel & 3];
        (p[0], p[1])
    }

    /// Advance the field one sample.
    pub fn step(&mut self, params: &FluidParams) {
        let dt = self.sample_interval;
        let step = TAU * params.flow_hz.max(0.0) * dt;

        let tau_s = (params.viscosity_ms.max(0.0001) * 0.001).max(1e-6);
        let visc = 1.0 - (-dt / tau_s).exp();

        let turb_amt = 0.12 * params.turbulence.clamp(0.0, 1.0).powi(2);
        let vort = (params.meta - 0.5) * 2.0;
        let w2 = params.meta2.clamp(0.0, 1.0);

        // Vortex centers orbit in opposite directions, slightly detuned.
        let spin = if vort >= 0.0 { 1.0 } else { -1.0 };
        self.theta1 += step * (0.8 + 0.2 * spin);
        self.theta2 -= step * (0.6 + 0.2 * spin);
        if self.theta1 > TAU {
            self.theta1 -= TAU;
        }
        if self.theta2 < 0.0 {
            self.theta2 += TAU;
        }
        let c1 = [
            0.5 + 0.25 * self.theta1.cos(),
            0.5 + 0.25 * self.theta1.sin(),
        ];
        let c2 = [
            0.5 + 0.33 * (self.theta2 + 1.3).cos(),
            0.5 + 0.33 * (self.theta2 + 0.7).sin(),
        ];

        let noise_tc_ms = map_linear(params.turbulence, 10.0, 200.0);
        let noise_coeff = ms_to_coeff(noise_tc_ms, self.sample_rate);

        for channel in 0..4 {
            let [px, py] = self.pos[channel];

            // Tangential velocity around each vortex, 1/r^2 falloff.
            let (r1x, r1y) = (px - c1[0], py - c1[1]);
            let d1 = r1x * r1x + r1y * r1y + 1e-4;
            let (v1x, v1y) = (-r1y / d1, r1x / d1);

            let (r2x, r2y) = (px - c2[0], py - c2[1]);
            let d2 = r2x * r2x + r2y * r2y + 1e-4;
            let (v2x, v2y) = (-r2y / d2, r2x / d2);

            let mut vx = vort * (v1x * (1.0 - w2) + v2x * w2);
            let mut vy = vort * (v1y * (1.0 - w2) + v2y * w2);

            // Smoothed random turbulence; raw noise would zipper.
            let tx = self.rng.next_f32_bipolar();
            let ty = self.rng.next_f32_bipolar();
            one_pole(&mut self.noise[channel][0], tx, noise_coeff);
            one_pole(&mut self.noise[channel][1], ty, noise_coeff);
            vx += turb_amt * self.noise[channel][0];
            vy += turb_amt * self.noise[channel][1];

            // Semi-implicit Euler with viscosity damping. The velocity is
            // capped so a pass near a vortex center cannot fling a
            // particle across the domain in one sample.
            self.vel[channel][0] =
                ((1.0 - visc) * (self.vel[channel][0] + step * vx)).clamp(-0.25, 0.25);
            self.vel[channel][1] =
                ((1.0 - visc) * (self.vel[channel][1] + step * vy)).clamp(-0.25, 0.25);

            // Wrap into the unit square.
            let nx = (px + self.vel[channel][0]).rem_euclid(1.0);
            let ny = (py + self.vel[channel][1]).rem_euclid(1.0);

            self.pos[channel] = [nx, ny];
        }
    }

    /// Map a channel's particle position to a read-position offset in
    /// samples around `base_delay`.
    pub fn offset(&self, channel: usize, params: &FluidParams, base_delay: f32) -> f32 {
        let [px, py] = self.pos[channel & 3];
        let scalar = ((px - 0.5) + (py - 0.5)) * 0.5;
        let couple = 0.0005 + 0.10 * params.couple.clamp(0.0, 1.0).powi(2);
        scalar * couple * base_delay
    }
}
