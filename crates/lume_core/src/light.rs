//! Lighting state machine: the bulb's first job.
//!
//! `set_target` latches a command in constant time (at most one immediate
//! PWM update); `tick` runs at 50 Hz and walks the current state linearly to
//! the target. Nothing here can fail, block, or observe the learning side:
//! a command is either applied immediately or latched as a transition.
//!
//! Scene detection, power estimation, and brightness velocity are read-only
//! views consumed as training features.

use crate::hal::{LedPwm, PwmChannel};

/// Steps are taken at the 50 Hz main-loop cadence, 20 ms apiece.
pub const TICK_MS: u16 = 20;

/// Scales `brightness * temp` (max 255 * 100) onto the 16-bit PWM range.
const PWM_SCALE: u32 = 257;

/// Lighting scene, thresholded from current state. Used as a training
/// feature and for predicting user behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Scene {
    Off = 0,
    DimWarm,
    Cozy,
    BrightWarm,
    Daylight,
    Reading,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightState {
    pub brightness: u8,
    pub color_temp: u8,
    pub target_brightness: u8,
    pub target_temp: u8,
    pub transition_steps: u16,
    pub on: bool,
}

pub struct LightController {
    state: LightState,
}

impl Default for LightController {
    fn default() -> Self {
        Self::new()
    }
}

impl LightController {
    pub fn new() -> Self {
        LightController {
            state: LightState {
                brightness: 100,
                color_temp: 50,
                target_brightness: 100,
                target_temp: 50,
                transition_steps: 0,
                on: true,
            },
        }
    }

    /// Latch a light command. Bounded constant time; the only side effect is
    /// an immediate PWM write when `transition_ms == 0`.
    pub fn set_target<P: LedPwm>(
        &mut self,
        pwm: &mut P,
        brightness: u8,
        temp: u8,
        transition_ms: u16,
    ) {
        self.state.target_brightness = brightness;
        self.state.target_temp = temp;
        self.state.on = brightness > 0;

        if transition_ms == 0 {
            self.state.brightness = brightness;
            self.state.color_temp = temp;
            self.state.transition_steps = 0;
            self.apply_pwm(pwm);
        } else {
            self.state.transition_steps = (transition_ms / TICK_MS).max(1);
        }
    }

    /// 50 Hz transition step: linear interpolation toward the target,
    /// snapping exactly onto it on the final step.
    pub fn tick<P: LedPwm>(&mut self, pwm: &mut P) {
        if self.state.transition_steps == 0 {
            return;
        }

        let steps = self.state.transition_steps as i16;
        let bright_delta = self.state.target_brightness as i16 - self.state.brightness as i16;
        let temp_delta = self.state.target_temp as i16 - self.state.color_temp as i16;

        self.state.brightness = (self.state.brightness as i16 + bright_delta / steps) as u8;
        self.state.color_temp = (self.state.color_temp as i16 + temp_delta / steps) as u8;
        self.state.transition_steps -= 1;

        if self.state.transition_steps == 0 {
            self.state.brightness = self.state.target_brightness;
            self.state.color_temp = self.state.target_temp;
        }

        self.apply_pwm(pwm);
    }

    /// Dual-channel mix: warm gets `brightness * temp`, cool the remainder.
    fn apply_pwm<P: LedPwm>(&self, pwm: &mut P) {
        if !self.state.on {
            pwm.set_duty(PwmChannel::Warm, 0);
            pwm.set_duty(PwmChannel::Cool, 0);
            return;
        }

        let b = self.state.brightness as u32;
        let t = self.state.color_temp as u32;
        let warm = (b * t * PWM_SCALE / 100) as u16;
        let cool = (b * (100 - t.min(100)) * PWM_SCALE / 100) as u16;
        pwm.set_duty(PwmChannel::Warm, warm);
        pwm.set_duty(PwmChannel::Cool, cool);
    }

    /// Electrical power estimate on a 0-100 scale. Warm LEDs run at roughly
    /// 90 % of the cool channel's efficiency-adjusted draw.
    pub fn power_estimate(&self) -> u8 {
        if !self.state.on {
            return 0;
        }
        let b = self.state.brightness as u32;
        let t = self.state.color_temp.min(100) as u32;
        let warm = b * t;
        let cool = b * (100 - t);
        ((warm * 90 + cool * 100) / 25_500).min(100) as u8
    }

    /// Signed distance to the brightness target while transitioning, 0 at
    /// rest. Useful for predicting user behavior.
    pub fn brightness_velocity(&self) -> i8 {
        if self.state.transition_steps == 0 {
            return 0;
        }
        (self.state.target_brightness as i16 - self.state.brightness as i16).clamp(-128, 127) as i8
    }

    /// Threshold the current state into a scene.
    pub fn detect_scene(&self) -> Scene {
        if !self.state.on || self.state.brightness < 5 {
            return Scene::Off;
        }

        let is_warm = self.state.color_temp < 40;
        let is_cool = self.state.color_temp > 60;
        let is_dim = self.state.brightness < 75;
        let is_bright = self.state.brightness > 150;

        if is_dim && is_warm {
            Scene::DimWarm
        } else if !is_bright && is_warm {
            Scene::Cozy
        } else if is_bright && is_warm {
            Scene::BrightWarm
        } else if is_bright && is_cool {
            Scene::Daylight
        } else if is_bright {
            Scene::Reading
        } else {
            Scene::Unknown
        }
    }

    pub fn is_on(&self) -> bool {
        self.state.on
    }

    pub fn is_transitioning(&self) -> bool {
        self.state.transition_steps > 0
    }

    pub fn brightness(&self) -> u8 {
        self.state.brightness
    }

    pub fn color_temp(&self) -> u8 {
        self.state.color_temp
    }

    pub fn state(&self) -> &LightState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimPlatform;

    #[test]
    fn immediate_command_writes_pwm_once_per_channel() {
        let mut pwm = SimPlatform::new();
        let mut light = LightController::new();

        light.set_target(&mut pwm, 200, 30, 0);
        assert_eq!(pwm.pwm_writes.len(), 2);
        assert_eq!(light.brightness(), 200);
        assert_eq!(light.color_temp(), 30);
        assert!(!light.is_transitioning());

        // At rest, tick is a no-op.
        light.tick(&mut pwm);
        assert_eq!(pwm.pwm_writes.len(), 2);
    }

    #[test]
    fn transition_defers_pwm_to_ticks() {
        let mut pwm = SimPlatform::new();
        let mut light = LightController::new();

        light.set_target(&mut pwm, 0, 50, 100);
        assert!(pwm.pwm_writes.is_empty());
        assert_eq!(light.state().transition_steps, 5);

        for _ in 0..5 {
            let before = pwm.pwm_writes.len();
            light.tick(&mut pwm);
            // Never more than one write per channel per tick.
            assert!(pwm.pwm_writes.len() - before <= 2);
        }
        assert_eq!(light.brightness(), 0);
        assert!(!light.is_transitioning());
    }

    #[test]
    fn sub_tick_transition_clamps_to_one_step() {
        let mut pwm = SimPlatform::new();
        let mut light = LightController::new();
        light.set_target(&mut pwm, 10, 10, 19);
        assert_eq!(light.state().transition_steps, 1);
        light.tick(&mut pwm);
        assert_eq!(light.brightness(), 10);
        assert_eq!(light.color_temp(), 10);
    }

    #[test]
    fn transition_snaps_exactly_onto_target() {
        let mut pwm = SimPlatform::new();
        let mut light = LightController::new();
        // 100 -> 37 over 7 steps does not divide evenly.
        light.set_target(&mut pwm, 37, 83, 140);
        for _ in 0..7 {
            light.tick(&mut pwm);
        }
        assert_eq!(light.brightness(), 37);
        assert_eq!(light.color_temp(), 83);
        assert_eq!(light.state().transition_steps, 0);
    }

    #[test]
    fn off_command_zeroes_both_channels() {
        let mut pwm = SimPlatform::new();
        let mut light = LightController::new();
        light.set_target(&mut pwm, 0, 50, 0);
        assert!(!light.is_on());
        assert_eq!(pwm.warm_duty, 0);
        assert_eq!(pwm.cool_duty, 0);
        assert_eq!(light.power_estimate(), 0);
    }

    #[test]
    fn pwm_mix_splits_by_temperature() {
        let mut pwm = SimPlatform::new();
        let mut light = LightController::new();

        light.set_target(&mut pwm, 255, 100, 0);
        assert_eq!(pwm.warm_duty, 65535);
        assert_eq!(pwm.cool_duty, 0);

        light.set_target(&mut pwm, 255, 0, 0);
        assert_eq!(pwm.warm_duty, 0);
        assert_eq!(pwm.cool_duty, 65535);
    }

    #[test]
    fn power_estimate_stays_in_range() {
        let mut pwm = SimPlatform::new();
        let mut light = LightController::new();
        light.set_target(&mut pwm, 255, 0, 0);
        assert_eq!(light.power_estimate(), 100);
        light.set_target(&mut pwm, 255, 100, 0);
        assert_eq!(light.power_estimate(), 90);
        light.set_target(&mut pwm, 128, 50, 0);
        let mid = light.power_estimate();
        assert!(mid > 40 && mid < 60, "mid = {mid}");
    }

    #[test]
    fn velocity_tracks_transition_only() {
        let mut pwm = SimPlatform::new();
        let mut light = LightController::new();
        assert_eq!(light.brightness_velocity(), 0);

        light.set_target(&mut pwm, 250, 50, 1000);
        assert_eq!(light.brightness_velocity(), 127); // clamped from 150
        light.set_target(&mut pwm, 20, 50, 1000);
        assert_eq!(light.brightness_velocity(), -80);
    }

    #[test]
    fn scene_thresholds() {
        let mut pwm = SimPlatform::new();
        let mut light = LightController::new();

        let cases = [
            (0u8, 50u8, Scene::Off),
            (40, 20, Scene::DimWarm),
            (100, 20, Scene::Cozy),
            (200, 20, Scene::BrightWarm),
            (200, 80, Scene::Daylight),
            (200, 50, Scene::Reading),
            (100, 50, Scene::Unknown),
        ];
        for (b, t, want) in cases {
            light.set_target(&mut pwm, b, t, 0);
            assert_eq!(light.detect_scene(), want, "b={b} t={t}");
        }
    }
}
