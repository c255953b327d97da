use std::{collections::BTreeMap, time::SystemTime};

use serde::Serialize;

use crate::{
    config_manager::{GroupConfig, GroupSource},
    fan_curve::{DUTY_MAX, DUTY_MIN, Trend, hysteresis_curve::HysteresisCurve},
    platform::FanDirection,
};

// One temperature sample, immutable once taken
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub sensor: String,
    // Millidegrees Celsius
    pub value: i32,
    pub taken_at: SystemTime,
}

// The readings of one sampling cycle.
// Sensors that failed to read have no entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorSnapshot {
    readings: BTreeMap<String, SensorReading>,
}

impl SensorSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reading: SensorReading) {
        self.readings.insert(reading.sensor.clone(), reading);
    }

    pub fn value(&self, sensor: &str) -> Option<i32> {
        self.readings.get(sensor).map(|r| r.value)
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorSelector {
    Fixed(String),
    ByDirection { intake: String, exhaust: String },
}

// A set of sensors sharing one hysteresis curve
#[derive(Debug, Clone)]
pub struct SensorGroup {
    pub name: String,
    pub selector: SensorSelector,
    pub curve: HysteresisCurve,
}

// What a single group asked for during a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupDemand {
    pub group: String,
    pub sensor: String,
    pub temp: Option<i32>,
    pub trend: Option<Trend>,
    pub duty: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThermalDemand {
    // Highest demand over all groups
    pub duty: u8,
    pub groups: Vec<GroupDemand>,
}

#[derive(Debug, Clone)]
pub struct ThermalPolicy {
    groups: Vec<SensorGroup>,
}

impl ThermalPolicy {
    pub fn from_config(groups: &[GroupConfig]) -> Self {
        let groups = groups
            .iter()
            .map(|group| SensorGroup {
                name: group.name.clone(),
                selector: match &group.source {
                    GroupSource::Sensor { sensor } => SensorSelector::Fixed(sensor.clone()),
                    GroupSource::ByDirection { intake, exhaust } => SensorSelector::ByDirection {
                        intake: intake.clone(),
                        exhaust: exhaust.clone(),
                    },
                },
                curve: HysteresisCurve::new(
                    (group.rising.low, group.rising.high),
                    (group.falling.low, group.falling.high),
                ),
            })
            .collect();

        Self { groups }
    }

    // Every sensor the groups may look at. Both sides of a
    // direction group are listed so their trend stays current.
    pub fn sensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();

        for group in &self.groups {
            let candidates = match &group.selector {
                SensorSelector::Fixed(sensor) => vec![sensor],
                SensorSelector::ByDirection { intake, exhaust } => vec![intake, exhaust],
            };

            for name in candidates {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }

        names
    }

    // Compute the duty each group asks for and the overall maximum.
    // Without a known fan direction a direction group takes the
    // hotter demand of both its sensors.
    pub fn demand(
        &self,
        current: &SensorSnapshot,
        previous: Option<&SensorSnapshot>,
        direction: Option<FanDirection>,
    ) -> ThermalDemand {
        let groups: Vec<GroupDemand> = self
            .groups
            .iter()
            .map(|group| {
                let candidates = match (&group.selector, direction) {
                    (SensorSelector::Fixed(sensor), _) => vec![sensor],
                    (SensorSelector::ByDirection { intake, .. }, Some(FanDirection::Intake)) => {
                        vec![intake]
                    }
                    (SensorSelector::ByDirection { exhaust, .. }, Some(FanDirection::Exhaust)) => {
                        vec![exhaust]
                    }
                    (SensorSelector::ByDirection { intake, exhaust }, None) => {
                        vec![intake, exhaust]
                    }
                };

                candidates
                    .into_iter()
                    .map(|sensor| sensor_demand(group, sensor, current, previous))
                    .max_by_key(|demand| demand.duty)
                    .unwrap_or_else(|| GroupDemand {
                        group: group.name.clone(),
                        sensor: String::new(),
                        temp: None,
                        trend: None,
                        duty: DUTY_MAX,
                    })
            })
            .collect();

        let duty = groups.iter().map(|g| g.duty).max().unwrap_or(DUTY_MIN);

        ThermalDemand { duty, groups }
    }
}

fn sensor_demand(
    group: &SensorGroup,
    sensor: &str,
    current: &SensorSnapshot,
    previous: Option<&SensorSnapshot>,
) -> GroupDemand {
    let Some(temp) = current.value(sensor) else {
        // Unreadable sensor, assume the worst
        return GroupDemand {
            group: group.name.clone(),
            sensor: sensor.to_string(),
            temp: None,
            trend: None,
            duty: DUTY_MAX,
        };
    };

    let last = previous.and_then(|snapshot| snapshot.value(sensor));
    let trend = Trend::from_readings(last, temp);

    GroupDemand {
        group: group.name.clone(),
        sensor: sensor.to_string(),
        temp: Some(temp),
        trend: Some(trend),
        duty: group.curve.get_speed(temp, trend),
    }
}
