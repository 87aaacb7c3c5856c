//! Coherence and resonance: learning-rate modulation in Q16.16.
//!
//! The target CPU has no FPU, so the one non-integer computation in the
//! system runs on `fixed::I16F16`. Coherence is the product of thermal
//! stability, neighbor density, and lighting steadiness, in [0, 1]. The
//! resonance curve amplifies learning when the environment is calm enough
//! for the gradient signal to be trustworthy, peaking at the golden ratio,
//! and dampens it under stress.

use fixed::types::I16F16;

/// Golden ratio, the resonance ceiling (1.6180339887...).
pub const PHI: I16F16 = I16F16::from_bits(106_040);

const ONE: I16F16 = I16F16::from_bits(1 << 16);
const HALF: I16F16 = I16F16::from_bits(1 << 15);

// Piecewise breakpoints. 0.2 and 0.3 are not exactly representable in
// Q16.16; nearest-bit values keep the curve continuous.
const C_HIGH: I16F16 = I16F16::from_bits(52_429); // 0.8
const C_MID: I16F16 = HALF; // 0.5
const C_LOW: I16F16 = I16F16::from_bits(13_107); // 0.2
const RAMP_SPAN: I16F16 = I16F16::from_bits(19_661); // 0.3

/// Environmental inputs to the coherence product.
#[derive(Debug, Clone, Copy)]
pub struct CoherenceInputs {
    /// Scheduler thermal throttle, 0-100.
    pub throttle_percent: u8,
    pub neighbor_count: u8,
    pub max_neighbors: u8,
    pub light_transitioning: bool,
}

/// `stability * mesh_health * light_stable`, each factor in [0, 1].
pub fn coherence(inputs: CoherenceInputs) -> I16F16 {
    let throttle = inputs.throttle_percent.min(100);
    let stability = I16F16::from_num(100 - throttle as i32) / I16F16::from_num(100);

    let max = inputs.max_neighbors.max(1);
    let mesh_health =
        I16F16::from_num(inputs.neighbor_count.min(max) as i32) / I16F16::from_num(max as i32);

    let light_stable = if inputs.light_transitioning { HALF } else { ONE };

    stability * mesh_health * light_stable
}

/// The resonance curve:
///
/// - `c > 0.8`       -> phi (full amplification)
/// - `0.5 < c <= 0.8` -> linear ramp from 1 to phi
/// - `0.2 < c <= 0.5` -> 1 (neutral)
/// - `c <= 0.2`       -> `0.5 + c` (dampened)
pub fn resonance(c: I16F16) -> I16F16 {
    if c > C_HIGH {
        PHI
    } else if c > C_MID {
        let t = (c - C_MID) / RAMP_SPAN;
        ONE + t * (PHI - ONE)
    } else if c > C_LOW {
        ONE
    } else {
        HALF + c
    }
}

/// Day phase in 0..=255 from wall-clock-ish seconds.
pub fn circadian_phase(seconds: u32) -> u8 {
    ((seconds % 86_400) * 256 / 86_400) as u8
}

/// Triangle-wave approximation of a sine over one day phase: 0 at phase 0,
/// peak +126 at a quarter, 0 at half, trough -126 at three quarters. Smooth
/// (steps of at most 2), bounded, periodic. Nothing downstream needs more.
pub fn circadian_wave(phase: u8) -> i8 {
    let p = phase as i16;
    let v = if p < 64 {
        2 * p
    } else if p < 128 {
        254 - 2 * p
    } else if p < 192 {
        -(2 * (p - 128))
    } else {
        2 * p - 510
    };
    v.clamp(-128, 127) as i8
}
