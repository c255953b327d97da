use serde::{Deserialize, Serialize};

pub mod hysteresis_curve;
pub mod linear_curve;

// Minimum airflow, the controller never commands less than this
pub const DUTY_MIN: u8 = 40;
pub const DUTY_MAX: u8 = 100;

pub trait FanCurve {
    // Add a point to the fan curve
    fn add_point(&mut self, point: (i32, u8));

    // Return the fan speed for the given temperature (millidegrees)
    fn get_speed(&self, temp: i32) -> u8;
}

// Direction a sensor moved since the previous sampling cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Falling,
}

impl Trend {
    // A missing previous value counts as rising
    pub fn from_readings(previous: Option<i32>, current: i32) -> Trend {
        match previous {
            Some(prev) if current < prev => Trend::Falling,
            _ => Trend::Rising,
        }
    }
}

// Clamp a duty request to the range the fans are allowed to run at
pub fn clamp_duty(duty: u8) -> u8 {
    duty.clamp(DUTY_MIN, DUTY_MAX)
}
