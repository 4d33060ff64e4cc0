use log::info;

use crate::{config::DeviceConfig, link::LinkAction, packet::Command, types::FanSpeed};

#[derive(Debug, Clone, Default)]
pub struct FanController {
    speed: FanSpeed,
}

impl FanController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn speed(&self) -> FanSpeed {
        self.speed
    }

    pub fn load(&mut self, config: &DeviceConfig) {
        self.speed = config.fan_speed;
    }

    pub fn set_speed(&mut self, level: i32, force: bool) -> Vec<LinkAction> {
        let target = FanSpeed::from_level(level);
        if target == self.speed && !force {
            return Vec::new();
        }
        self.speed = target;
        info!("fan -> {}", target.as_str());
        vec![LinkAction::Send(Command::FanSpeed(target))]
    }

    pub fn increase_speed(&mut self) -> Vec<LinkAction> {
        self.set_speed(i32::from(self.speed.level()) + 1, false)
    }

    pub fn decrease_speed(&mut self) -> Vec<LinkAction> {
        self.set_speed(i32::from(self.speed.level()) - 1, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_move_one_level_and_stop_at_ends() {
        let mut fan = FanController::new();
        assert!(fan.decrease_speed().is_empty());

        let mut observed = Vec::new();
        for _ in 0..4 {
            fan.increase_speed();
            observed.push(fan.speed());
        }
        assert_eq!(
            observed,
            vec![FanSpeed::Low, FanSpeed::Medium, FanSpeed::High, FanSpeed::High]
        );
    }

    #[test]
    fn unchanged_speed_sends_nothing_unless_forced() {
        let mut fan = FanController::new();
        assert_eq!(
            fan.set_speed(7, false),
            vec![LinkAction::Send(Command::FanSpeed(FanSpeed::High))]
        );
        assert!(fan.set_speed(3, false).is_empty());
        assert_eq!(fan.set_speed(3, true).len(), 1);
    }
}
