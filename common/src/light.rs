use log::info;

use crate::{
    config::{DeviceConfig, DimmerConfig, HUE_STEPS, WARMTH_MAX, WARMTH_MIN},
    link::LinkAction,
    packet::Command,
    types::LightMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainChannel {
    pub brightness: u8,
    pub warmth: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingChannel {
    pub brightness: u8,
    pub hue: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightState {
    pub is_on: bool,
    pub mode: LightMode,
    pub main: MainChannel,
    pub ring: RingChannel,
}

impl LightState {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            is_on: config.is_on,
            mode: config.light_mode,
            main: MainChannel {
                brightness: config.main_brightness,
                warmth: config.main_warmth,
            },
            ring: RingChannel {
                brightness: config.ring_brightness,
                hue: config.ring_hue,
            },
        }
    }

    pub fn apply_to(&self, config: &mut DeviceConfig) {
        config.is_on = self.is_on;
        config.light_mode = self.mode;
        config.main_brightness = self.main.brightness;
        config.main_warmth = self.main.warmth;
        config.ring_brightness = self.ring.brightness;
        config.ring_hue = self.ring.hue;
    }

    /// Brightness of the channel the current mode drives.
    pub fn active_brightness(&self) -> u8 {
        match self.mode {
            LightMode::Main => self.main.brightness,
            LightMode::RgbRing => self.ring.brightness,
        }
    }

    fn active_brightness_mut(&mut self) -> &mut u8 {
        match self.mode {
            LightMode::Main => &mut self.main.brightness,
            LightMode::RgbRing => &mut self.ring.brightness,
        }
    }

    fn clamped(mut self) -> Self {
        let (lo, hi) = LightMode::Main.brightness_range();
        self.main.brightness = self.main.brightness.clamp(lo, hi);
        self.main.warmth = self.main.warmth.clamp(WARMTH_MIN, WARMTH_MAX);
        self.ring.hue %= HUE_STEPS;
        self
    }
}

/// In-memory light state of the bound fixture. Every mutator returns the
/// link actions needed to mirror the change; an empty list means nothing
/// changed.
#[derive(Debug, Clone)]
pub struct LightController {
    state: LightState,
    warmth_step: i16,
    mode_resend_delay_ms: u64,
}

impl LightController {
    pub fn new(config: &DimmerConfig) -> Self {
        Self {
            state: LightState::from_config(&DeviceConfig::new(Default::default())),
            warmth_step: i16::from(config.warmth_step),
            mode_resend_delay_ms: config.mode_resend_delay_ms,
        }
    }

    pub fn state(&self) -> &LightState {
        &self.state
    }

    /// Adopts a stored record without talking to the fixture.
    pub fn load(&mut self, config: &DeviceConfig) {
        self.state = LightState::from_config(config).clamped();
        self.warmth_step = self.warmth_step.abs();
    }

    pub fn turn_on(&mut self) -> Vec<LinkAction> {
        self.set_power(true)
    }

    pub fn turn_off(&mut self) -> Vec<LinkAction> {
        self.set_power(false)
    }

    pub fn toggle(&mut self) -> Vec<LinkAction> {
        self.set_power(!self.state.is_on)
    }

    pub fn set_power(&mut self, on: bool) -> Vec<LinkAction> {
        if self.state.is_on == on {
            return Vec::new();
        }
        self.state.is_on = on;
        info!("light {}", if on { "on" } else { "off" });
        vec![LinkAction::Send(Command::Power(on))]
    }

    pub fn set_brightness(&mut self, value: i32, force: bool) -> Vec<LinkAction> {
        let (lo, hi) = self.state.mode.brightness_range();
        let target = value.clamp(i32::from(lo), i32::from(hi)) as u8;
        let slot = self.state.active_brightness_mut();
        if *slot == target && !force {
            return Vec::new();
        }
        *slot = target;
        vec![self.brightness_action()]
    }

    pub fn increase_brightness(&mut self) -> Vec<LinkAction> {
        self.step_brightness(1)
    }

    pub fn decrease_brightness(&mut self) -> Vec<LinkAction> {
        self.step_brightness(-1)
    }

    pub fn set_warmth(&mut self, value: i32, force: bool) -> Vec<LinkAction> {
        let target = value.clamp(i32::from(WARMTH_MIN), i32::from(WARMTH_MAX)) as u8;
        if self.state.main.warmth == target && !force {
            return Vec::new();
        }
        self.state.main.warmth = target;
        vec![LinkAction::Send(Command::Warmth(target))]
    }

    /// One step of the long-press warmth sweep. Bounces off either end.
    pub fn change_warmth(&mut self) -> Vec<LinkAction> {
        if !self.state.is_on || self.state.mode != LightMode::Main {
            return Vec::new();
        }

        let mut next = i16::from(self.state.main.warmth) + self.warmth_step;
        if next >= i16::from(WARMTH_MAX) {
            next = i16::from(WARMTH_MAX);
            self.warmth_step = -self.warmth_step.abs();
        } else if next <= i16::from(WARMTH_MIN) {
            next = i16::from(WARMTH_MIN);
            self.warmth_step = self.warmth_step.abs();
        }
        self.set_warmth(i32::from(next), false)
    }

    pub fn set_hue(&mut self, value: i32, force: bool) -> Vec<LinkAction> {
        let target = value.rem_euclid(i32::from(HUE_STEPS)) as u8;
        if self.state.ring.hue == target && !force {
            return Vec::new();
        }
        self.state.ring.hue = target;
        vec![self.ring_action()]
    }

    pub fn rotate_hue(&mut self) -> Vec<LinkAction> {
        if !self.state.is_on || self.state.mode != LightMode::RgbRing {
            return Vec::new();
        }
        self.set_hue(i32::from(self.state.ring.hue) + 1, false)
    }

    /// Flips between main light and ring, sending the new channel's full
    /// state twice with a short gap.
    pub fn switch_mode(&mut self) -> Vec<LinkAction> {
        self.state.mode = self.state.mode.toggled();
        info!("light mode -> {}", self.state.mode.as_str());

        let mut actions = self.state_actions();
        actions.push(LinkAction::Delay(self.mode_resend_delay_ms));
        actions.extend(self.state_actions());
        actions
    }

    pub fn set_mode(&mut self, mode: LightMode) -> Vec<LinkAction> {
        if self.state.mode == mode {
            return Vec::new();
        }
        self.switch_mode()
    }

    /// Moves to `target` in one go, sending only what changed.
    pub fn set_all(&mut self, target: &LightState) -> Vec<LinkAction> {
        let target = target.clamped();
        let mut actions = self.set_power(target.is_on);

        let levels_changed = target.main != self.state.main || target.ring != self.state.ring;
        self.state.main = target.main;
        self.state.ring = target.ring;

        if target.mode != self.state.mode {
            actions.extend(self.set_mode(target.mode));
        } else if levels_changed {
            actions.extend(self.state_actions());
        }
        actions
    }

    /// Full state of the active channel.
    pub fn state_actions(&self) -> Vec<LinkAction> {
        match self.state.mode {
            LightMode::Main => vec![
                LinkAction::Send(Command::Intensity(self.state.main.brightness)),
                LinkAction::Send(Command::Warmth(self.state.main.warmth)),
            ],
            LightMode::RgbRing => vec![self.ring_action()],
        }
    }

    fn step_brightness(&mut self, delta: i32) -> Vec<LinkAction> {
        if !self.state.is_on {
            return Vec::new();
        }
        self.set_brightness(i32::from(self.state.active_brightness()) + delta, false)
    }

    fn brightness_action(&self) -> LinkAction {
        match self.state.mode {
            LightMode::Main => LinkAction::Send(Command::Intensity(self.state.main.brightness)),
            LightMode::RgbRing => self.ring_action(),
        }
    }

    fn ring_action(&self) -> LinkAction {
        LinkAction::Send(Command::ring_color(
            self.state.ring.hue,
            self.state.ring.brightness,
        ))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn controller() -> LightController {
        LightController::new(&DimmerConfig::default())
    }

    fn lit(mode: LightMode) -> LightController {
        let mut light = controller();
        light.turn_on();
        light.state.mode = mode;
        light
    }

    #[test]
    fn brightness_clamps_to_main_range() {
        let mut light = lit(LightMode::Main);
        light.state.main.brightness = 16;

        assert_eq!(light.set_brightness(20, false), Vec::new());
        assert_eq!(light.state().main.brightness, 16);

        assert_eq!(
            light.set_brightness(0, false),
            vec![LinkAction::Send(Command::Intensity(1))]
        );
    }

    #[test]
    fn forced_brightness_resends_unchanged_value() {
        let mut light = lit(LightMode::Main);
        assert_eq!(
            light.set_brightness(8, true),
            vec![LinkAction::Send(Command::Intensity(8))]
        );
    }

    #[test]
    fn brightness_steps_target_active_channel() {
        let mut light = lit(LightMode::RgbRing);
        light.state.ring.brightness = 254;

        assert_eq!(light.increase_brightness().len(), 1);
        assert_eq!(light.state().ring.brightness, 255);
        assert!(light.increase_brightness().is_empty());
        assert_eq!(light.state().main.brightness, 8);
    }

    #[test]
    fn brightness_steps_are_ignored_while_off() {
        let mut light = controller();
        assert!(light.increase_brightness().is_empty());
        assert!(light.decrease_brightness().is_empty());
        assert_eq!(light.state().main.brightness, 8);
    }

    #[test]
    fn toggle_alternates_power_frames() {
        let mut light = controller();
        assert_eq!(light.toggle(), vec![LinkAction::Send(Command::Power(true))]);
        assert_eq!(light.toggle(), vec![LinkAction::Send(Command::Power(false))]);
        assert!(light.turn_off().is_empty());
    }

    #[test]
    fn warmth_sweep_bounces_at_limits() {
        let mut light = lit(LightMode::Main);
        light.state.main.warmth = 230;

        let mut observed = Vec::new();
        for _ in 0..4 {
            light.change_warmth();
            observed.push(light.state().main.warmth);
        }
        assert_eq!(observed, vec![240, 250, 240, 230]);

        light.state.main.warmth = 10;
        light.change_warmth();
        assert_eq!(light.state().main.warmth, 0);
        light.change_warmth();
        assert_eq!(light.state().main.warmth, 10);
    }

    #[test]
    fn warmth_sweep_needs_main_mode_and_power() {
        let mut light = lit(LightMode::RgbRing);
        assert!(light.change_warmth().is_empty());
        let mut light = controller();
        assert!(light.change_warmth().is_empty());
    }

    #[test]
    fn hue_rotation_wraps() {
        let mut light = lit(LightMode::RgbRing);
        light.state.ring.hue = 99;
        assert_eq!(light.rotate_hue().len(), 1);
        assert_eq!(light.state().ring.hue, 0);
        assert_eq!(light.set_hue(-1, false).len(), 1);
        assert_eq!(light.state().ring.hue, 99);
    }

    #[test]
    fn hue_rotation_needs_ring_mode() {
        let mut light = lit(LightMode::Main);
        assert!(light.rotate_hue().is_empty());
    }

    #[test]
    fn switch_mode_sends_full_state_twice() {
        let mut light = lit(LightMode::Main);
        light.state.ring = RingChannel {
            brightness: 128,
            hue: 0,
        };

        let ring = LinkAction::Send(Command::ring_color(0, 128));
        assert_eq!(
            light.switch_mode(),
            vec![ring, LinkAction::Delay(10), ring]
        );
        assert_eq!(light.state().mode, LightMode::RgbRing);

        let actions = light.switch_mode();
        assert_eq!(
            actions,
            vec![
                LinkAction::Send(Command::Intensity(8)),
                LinkAction::Send(Command::Warmth(150)),
                LinkAction::Delay(10),
                LinkAction::Send(Command::Intensity(8)),
                LinkAction::Send(Command::Warmth(150)),
            ]
        );
    }

    #[test]
    fn set_all_only_sends_differences() {
        let mut light = lit(LightMode::Main);
        let mut target = *light.state();
        assert!(light.set_all(&target).is_empty());

        target.main.warmth = 90;
        assert_eq!(
            light.set_all(&target),
            vec![
                LinkAction::Send(Command::Intensity(8)),
                LinkAction::Send(Command::Warmth(90)),
            ]
        );

        target.is_on = false;
        assert_eq!(
            light.set_all(&target),
            vec![LinkAction::Send(Command::Power(false))]
        );
    }

    #[test]
    fn load_adopts_record_silently() {
        let mut light = controller();
        let mut config = DeviceConfig::new(Default::default());
        config.is_on = true;
        config.light_mode = LightMode::RgbRing;
        config.ring_hue = 42;
        light.load(&config);

        assert_eq!(light.state().mode, LightMode::RgbRing);
        assert_eq!(light.state().ring.hue, 42);
        assert!(light.state().is_on);
    }
}
