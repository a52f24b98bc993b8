//! Windowed Grain Pool
//!
//! Short, enveloped fragments of buffered audio used by the granular
//! modes' frozen-scrub path. A grain is triggered at a pseudo-random
//! position around a base delay target, advances at its own playback
//! rate, and fades in and out under a raised-cosine window until its
//! window phase completes.

use crate::delay::DelayLine;
use crate::rng::Rng;
use std::f32::consts::TAU;

/// Grains per stereo channel.
pub const MAX_GRAINS: usize = 4;

/// Shortest grain, in samples (~8 ms at 48 kHz).
pub const MIN_GRAIN_SIZE: f32 = 400.0;

/// Longest grain, in samples (~100 ms at 48 kHz).
pub const MAX_GRAIN_SIZE: f32 = 4800.0;

/// One windowed playback fragment.
#[derive(Debug, Clone, Copy)]
pub struct Grain {
    pub active: bool,
    /// Fractional read position, as a delay behind the write cursor.
    pub pos: f32,
    /// Per-sample playback-rate increment applied to `pos`.
    pub increment: f32,
    pub amp: f32,
    /// Length in samples.
    pub size: f32,
    /// Raised-cosine window phase in [0, 1].
    pub window_phase: f32,
}

impl Default for Grain {
    fn default() -> Self {
        Self {
            active: false,
            pos: 0.0,
            increment: 1.0,
            amp: 0.0,
            size: MIN_GRAIN_SIZE,
            window_phase: 0.0,
        }
    }
}

impl Grain {
    /// Advance one sample: read, window, and deactivate at window end.
    #[inline]
    pub fn process(&mut self, delay: &DelayLine) -> f32 {
        if !self.active {
            return 0.0;
        }

        let out = delay.read_hermite(self.pos);
        self.pos += self.increment;

        self.window_phase += 1.0 / self.size.max(1.0);
        let window = 0.5 * (1.0 - (TAU * self.window_phase).cos());

        if self.window_phase >= 1.0 {
            self.active = false;
        }

        out * window * self.amp
    }
}

/// Round-robin pool of grains for one stereo channel.
#[derive(Debug, Clone)]
pub struct GrainPlayer {
    grains: [Grain; MAX_GRAINS],
    next: usize,
    /// Accumulates write-cursor travel between automatic triggers.
    spacing_accumulator: f32,
}

impl Default for GrainPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl GrainPlayer {
    pub fn new() -> Self {
        Self {
            grains: [Grain::default(); MAX_GRAINS],
            next: 0,
            spacing_accumulator: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.grains = [Grain::default(); MAX_GRAINS];
        self.next = 0;
        self.spacing_accumulator = 0.0;
    }

    pub fn active_count(&self) -> usize {
        self.grains.iter().filter(|g| g.active).count()
    }

    /// Launch the next grain in the pool around `base_delay` samples.
    ///
    /// `spread` in [0, 1] widens the position jitter window (up to 50% of
    /// the base delay), lengthens the grain, and adds up to ±2% playback
    /// rate jitter. `capacity` bounds the landing position.
    pub fn trigger(&mut self, base_delay: f32, spread: f32, capacity: f32, rng: &mut Rng) {
        let g = &mut self.grains[self.next];
        g.active = true;

        let max_spread = base_delay * (0.05 + spread * 0.45);
        let offset = rng.next_f32_bipolar() * max_spread;
        let ceiling = (capacity - 8.0).max(MIN_GRAIN_SIZE);
        let upper_limit = (base_delay * 2.0).clamp(2000.0_f32.min(ceiling), ceiling);
        g.pos = (base_delay + offset).clamp(MIN_GRAIN_SIZE.min(upper_limit), upper_limit);

        g.size = MIN_GRAIN_SIZE + (MAX_GRAIN_SIZE - MIN_GRAIN_SIZE) * spread;

        let rate_jitter = 0.02 * spread;
        g.increment = 1.0 + rng.next_f32_bipolar() * rate_jitter;
        g.amp = 1.0;
        g.window_phase = 0.0;

        self.next = (self.next + 1) % MAX_GRAINS;
    }

    /// Automatic retriggering: spawn a new grain each time `spacing`
    /// samples of input have passed, then mix all active grains,
    /// normalized by the active count.
    pub fn process_scrub(
        &mut self,
        delay: &DelayLine,
        base_delay: f32,
        spread: f32,
        spacing: f32,
        rng: &mut Rng,
    ) -> f32 {
        self.spacing_accumulator += 1.0;
        if self.spacing_accumulator >= spacing.max(1.0) {
            self.spacing_accumulator = 0.0;
            self.trigger(base_delay, spread, delay.capacity() as f32, rng);
        }

        let mut mix = 0.0;
        let mut active = 0;
        for g in self.grains.iter_mut() {
            if g.active {
                mix += g.process(delay);
                active += 1;
            }
        }
        if active > 0 {
            mix / active as f32
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_delay(capacity: usize) -> DelayLine {
        let mut dl = DelayLine::new(capacity);
        for i in 0..capacity {
            dl.write((i as f32 * 0.01).sin());
        }
        dl
    }

    #[test]
    fn test_grain_lifecycle() {
        let dl = filled_delay(8192);
        let mut g = Grain {
            active: true,
            pos: 2000.0,
            increment: 1.0,
            amp: 1.0,
            size: 128.0,
            window_phase: 0.0,
        };

        let mut samples = 0;
        while g.active && samples < 1000 {
            g.process(&dl);
            samples += 1;
        }
        // A 128-sample grain dies after exactly 128 samples (1/128 is
        // exact in binary, so the window phase accumulates cleanly).
        assert_eq!(samples, 128);
        assert!(!g.active);
    }

    #[test]
    fn test_inactive_grain_is_silent() {
        let dl = filled_delay(1024);
        let mut g = Grain::default();
        assert_eq!(g.process(&dl), 0.0);
    }

    #[test]
    fn test_window_fades_in_and_out() {
        let dl = filled_delay(8192);
        let mut g = Grain {
            active: true,
            pos: 2000.0,
            increment: 0.0, // hold position so only the window changes
            amp: 1.0,
            size: 200.0,
            window_phase: 0.0,
        };
        let raw = dl.read_hermite(2000.0);

        let first = g.process(&dl);
        assert!(first.abs() < raw.abs().max(1e-3) * 0.1, "window should start near zero");

        // Mid-grain the window approaches unity.
        let mut peak = 0.0f32;
        for _ in 0..199 {
            peak = peak.max(g.process(&dl).abs());
        }
        assert!(peak > raw.abs() * 0.9);
    }

    #[test]
    fn test_trigger_respects_bounds() {
        let mut player = GrainPlayer::new();
        let mut rng = Rng::from_seed(7);

        for _ in 0..64 {
            player.trigger(10000.0, 1.0, 48000.0, &mut rng);
        }
        for g in player.grains.iter() {
            assert!(g.pos >= MIN_GRAIN_SIZE.min(20000.0));
            assert!(g.pos <= 20000.0, "pos {} beyond 2x base", g.pos);
            assert!((0.98..=1.02).contains(&g.increment));
            assert!((MIN_GRAIN_SIZE..=MAX_GRAIN_SIZE).contains(&g.size));
        }
    }

    #[test]
    fn test_pool_round_robin() {
        let mut player = GrainPlayer::new();
        let mut rng = Rng::from_seed(3);

        for _ in 0..MAX_GRAINS {
            player.trigger(5000.0, 0.5, 48000.0, &mut rng);
        }
        assert_eq!(player.active_count(), MAX_GRAINS);
    }

    #[test]
    fn test_scrub_output_finite_and_bounded() {
        let dl = filled_delay(48000);
        let mut player = GrainPlayer::new();
        let mut rng = Rng::from_seed(99);

        for _ in 0..10000 {
            let y = player.process_scrub(&dl, 12000.0, 0.5, 600.0, &mut rng);
            assert!(y.is_finite());
            assert!(y.abs() <= 2.0, "scrub output {} out of bounds", y);
        }
        assert!(player.active_count() > 0);
    }
}
