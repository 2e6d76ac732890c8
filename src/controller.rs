//! Decision engine: map a CO2/PM2.5 reading onto a purifier command.
//!
//! Ranges are scanned in configured order and the first one whose CO2 *or*
//! PM2.5 threshold is reached wins, so the config lists the most severe tier
//! first. A command is only issued when the live device state differs from
//! the target in a field the action controls; repeating a cycle with the same
//! reading and state therefore never re-sends anything.

use serde_json::{Value, json};
use tracing::{error, info};

use crate::config::{Action, AirQualityRange, ModeCodes};
use crate::miio::{DeviceState, Property, PurifierDevice};
use crate::notify::Notify;

/// A state change sent to the purifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    PowerOff,
    Sleep { mode: i64 },
    Favorite { mode: i64 },
    Manual { mode: i64, speed: i64 },
}

impl Command {
    pub fn properties(&self) -> Vec<(Property, Value)> {
        match *self {
            Command::PowerOff => vec![(Property::POWER, json!(false))],
            Command::Sleep { mode } | Command::Favorite { mode } => vec![
                (Property::POWER, json!(true)),
                (Property::MODE, json!(mode)),
            ],
            Command::Manual { mode, speed } => vec![
                (Property::POWER, json!(true)),
                (Property::MODE, json!(mode)),
                (Property::SPEED, json!(speed)),
            ],
        }
    }

    /// Action text used in notifications.
    pub fn describe(&self) -> String {
        match self {
            Command::PowerOff => "关闭设备".to_string(),
            Command::Sleep { .. } => "切换到睡眠模式".to_string(),
            Command::Favorite { .. } => "切换到最爱模式".to_string(),
            Command::Manual { speed, .. } => format!("切换到手动{speed} + 1档"),
        }
    }

    /// Full notification text for this command at the given reading.
    pub fn message(&self, co2: i64, pm25: i64) -> String {
        match self {
            Command::PowerOff => {
                format!("当前二氧化碳: {co2}，PM2.5: {pm25}，{}", self.describe())
            }
            _ => format!("当前二氧化碳浓度: {co2}，PM2.5: {pm25}，{}", self.describe()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No range matched the reading.
    NoMatch,
    /// A range matched but the device is already in its target state.
    Unchanged,
    Issue(Command),
}

/// Pick the first matching range and compare it with the device state.
pub fn plan(
    ranges: &[AirQualityRange],
    modes: &ModeCodes,
    state: &DeviceState,
    co2: i64,
    pm25: i64,
) -> Decision {
    let Some(range) = ranges.iter().find(|r| r.matches(co2, pm25)) else {
        return Decision::NoMatch;
    };

    let command = match range.action {
        Action::Off if state.power => Command::PowerOff,
        Action::Sleep if !state.power || state.mode != modes.sleep => Command::Sleep {
            mode: modes.sleep,
        },
        Action::Favorite if !state.power || state.mode != modes.favorite => Command::Favorite {
            mode: modes.favorite,
        },
        Action::Manual => match range.speed {
            Some(speed) if !state.power || state.mode != modes.none || state.speed != speed => {
                Command::Manual {
                    mode: modes.none,
                    speed,
                }
            }
            _ => return Decision::Unchanged,
        },
        _ => return Decision::Unchanged,
    };
    Decision::Issue(command)
}

/// Runs one decision cycle per call against a live device.
pub struct Controller<D, N> {
    device: D,
    notifier: N,
    ranges: Vec<AirQualityRange>,
    modes: ModeCodes,
}

impl<D: PurifierDevice, N: Notify> Controller<D, N> {
    pub fn new(device: D, notifier: N, ranges: Vec<AirQualityRange>, modes: ModeCodes) -> Self {
        Self {
            device,
            notifier,
            ranges,
            modes,
        }
    }

    /// Fetch state, decide, and apply. Returns the command that was sent, if any.
    ///
    /// Device failures abort the cycle and are only logged; the next reading
    /// retries naturally.
    pub async fn decide(&self, co2: i64, pm25: i64) -> Option<Command> {
        let state = match DeviceState::fetch(&self.device).await {
            Ok(state) => state,
            Err(e) => {
                error!("Failed to read purifier state: {}", e);
                return None;
            }
        };

        let command = match plan(&self.ranges, &self.modes, &state, co2, pm25) {
            Decision::NoMatch => {
                info!(co2, pm25, "No matching air quality range");
                return None;
            }
            Decision::Unchanged => {
                info!(co2, pm25, ?state, "Purifier already in target state");
                return None;
            }
            Decision::Issue(command) => command,
        };

        if let Err(e) = self.device.set_properties(&command.properties()).await {
            error!("Failed to send {:?} to purifier: {}", command, e);
            return None;
        }

        let message = command.message(co2, pm25);
        info!(?command, "{}", message);
        self.notifier.notify(&message).await;
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miio::fake::FakeDevice;
    use crate::notify::recording::RecordingNotifier;

    const MODES: ModeCodes = ModeCodes {
        sleep: 1,
        favorite: 2,
        none: 3,
    };

    fn range(co2: i64, pm25: i64, action: Action, speed: Option<i64>) -> AirQualityRange {
        AirQualityRange {
            co2_threshold: co2,
            pm25_threshold: pm25,
            action,
            speed,
        }
    }

    fn ranges() -> Vec<AirQualityRange> {
        vec![
            range(1200, 75, Action::Manual, Some(2)),
            range(800, 35, Action::Favorite, None),
            range(500, 15, Action::Sleep, None),
            range(250, 500, Action::Off, None),
        ]
    }

    fn off() -> DeviceState {
        DeviceState {
            power: false,
            mode: 0,
            speed: 0,
        }
    }

    fn controller(
        state: DeviceState,
    ) -> (
        Controller<FakeDevice, RecordingNotifier>,
        FakeDevice,
        RecordingNotifier,
    ) {
        let device = FakeDevice::new(state);
        let notifier = RecordingNotifier::default();
        let controller = Controller::new(device.clone(), notifier.clone(), ranges(), MODES);
        (controller, device, notifier)
    }

    #[test]
    fn below_all_thresholds_matches_nothing() {
        let ranges = vec![
            range(1200, 75, Action::Manual, Some(2)),
            range(800, 35, Action::Sleep, None),
        ];
        assert_eq!(plan(&ranges, &MODES, &off(), 400, 10), Decision::NoMatch);
    }

    #[test]
    fn first_matching_range_wins() {
        // 1500 ppm satisfies every range; only the first applies
        assert_eq!(
            plan(&ranges(), &MODES, &off(), 1500, 100),
            Decision::Issue(Command::Manual { mode: 3, speed: 2 })
        );
        // pm25 alone can select a range
        assert_eq!(
            plan(&ranges(), &MODES, &off(), 300, 40),
            Decision::Issue(Command::Favorite { mode: 2 })
        );
    }

    #[test]
    fn sleep_guard_checks_power_and_mode() {
        let sleeping = DeviceState {
            power: true,
            mode: 1,
            speed: 0,
        };
        assert_eq!(plan(&ranges(), &MODES, &sleeping, 600, 0), Decision::Unchanged);
        assert_eq!(
            plan(&ranges(), &MODES, &DeviceState { power: false, ..sleeping }, 600, 0),
            Decision::Issue(Command::Sleep { mode: 1 })
        );
        assert_eq!(
            plan(&ranges(), &MODES, &DeviceState { mode: 2, ..sleeping }, 600, 0),
            Decision::Issue(Command::Sleep { mode: 1 })
        );
    }

    #[test]
    fn favorite_guard_ignores_speed() {
        let favorite = DeviceState {
            power: true,
            mode: 2,
            speed: 7,
        };
        assert_eq!(plan(&ranges(), &MODES, &favorite, 900, 0), Decision::Unchanged);
    }

    #[test]
    fn manual_guard_checks_speed() {
        let manual = DeviceState {
            power: true,
            mode: 3,
            speed: 1,
        };
        assert_eq!(
            plan(&ranges(), &MODES, &manual, 1300, 0),
            Decision::Issue(Command::Manual { mode: 3, speed: 2 })
        );
    }

    #[test]
    fn off_when_already_off_is_unchanged() {
        assert_eq!(plan(&ranges(), &MODES, &off(), 300, 5), Decision::Unchanged);
    }

    #[test]
    fn manual_message_names_speed() {
        let cmd = Command::Manual { mode: 3, speed: 2 };
        assert_eq!(
            cmd.message(1500, 20),
            "当前二氧化碳浓度: 1500，PM2.5: 20，切换到手动2 + 1档"
        );
    }

    #[tokio::test]
    async fn manual_range_turns_device_on() {
        let (controller, device, notifier) = controller(off());

        let issued = controller.decide(1500, 20).await;

        assert_eq!(issued, Some(Command::Manual { mode: 3, speed: 2 }));
        let writes = device.writes.lock().unwrap().clone();
        assert_eq!(
            writes,
            vec![vec![
                (Property::POWER, json!(true)),
                (Property::MODE, json!(3)),
                (Property::SPEED, json!(2)),
            ]]
        );
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("手动2"));
    }

    #[tokio::test]
    async fn already_in_manual_target_issues_nothing() {
        let (controller, device, notifier) = controller(DeviceState {
            power: true,
            mode: 3,
            speed: 2,
        });

        assert_eq!(controller.decide(1500, 20).await, None);
        assert_eq!(device.write_count(), 0);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn off_range_powers_down_running_device() {
        let (controller, device, notifier) = controller(DeviceState {
            power: true,
            mode: 1,
            speed: 0,
        });

        assert_eq!(controller.decide(300, 5).await, Some(Command::PowerOff));
        assert_eq!(
            device.writes.lock().unwrap()[0],
            vec![(Property::POWER, json!(false))]
        );
        assert_eq!(
            notifier.sent(),
            vec!["当前二氧化碳: 300，PM2.5: 5，关闭设备".to_string()]
        );
    }

    #[tokio::test]
    async fn repeated_cycle_is_idempotent() {
        let (controller, device, notifier) = controller(off());

        assert!(controller.decide(900, 10).await.is_some());
        assert!(controller.decide(900, 10).await.is_none());
        assert_eq!(device.write_count(), 1);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn no_match_issues_nothing() {
        let (controller, device, notifier) = controller(DeviceState {
            power: true,
            mode: 1,
            speed: 0,
        });

        assert_eq!(controller.decide(100, 0).await, None);
        assert_eq!(device.write_count(), 0);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn unreadable_device_aborts_cycle() {
        let mut device = FakeDevice::new(off());
        device.fail_reads = true;
        let notifier = RecordingNotifier::default();
        let controller = Controller::new(device.clone(), notifier.clone(), ranges(), MODES);

        assert_eq!(controller.decide(1500, 20).await, None);
        assert_eq!(device.write_count(), 0);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn rejected_command_sends_no_notification() {
        let mut device = FakeDevice::new(off());
        device.fail_writes = true;
        let notifier = RecordingNotifier::default();
        let controller = Controller::new(device.clone(), notifier.clone(), ranges(), MODES);

        assert_eq!(controller.decide(1500, 20).await, None);
        assert_eq!(device.write_count(), 0);
        assert!(notifier.sent().is_empty());
    }
}
