use crate::fan_curve::{DUTY_MAX, DUTY_MIN, FanCurve, Trend, linear_curve::LinearCurve};

#[derive(Debug, Clone)]
pub struct HysteresisCurve<T: FanCurve = LinearCurve> {
    // Curve followed while the temperature goes up
    rising: T,

    // Curve followed while the temperature goes down,
    // shifted to lower temperatures than the rising one
    falling: T,
}

impl<T: FanCurve> HysteresisCurve<T> {
    // Return the fan speed for the given temperature and trend
    pub fn get_speed(&self, temp: i32, trend: Trend) -> u8 {
        match trend {
            Trend::Rising => self.rising.get_speed(temp),
            Trend::Falling => self.falling.get_speed(temp),
        }
    }
}

impl HysteresisCurve<LinearCurve> {
    // Create a hysteresis curve from the two threshold pairs,
    // both ramping from the duty floor up to full speed
    pub fn new(rising: (i32, i32), falling: (i32, i32)) -> HysteresisCurve<LinearCurve> {
        HysteresisCurve {
            rising: LinearCurve::band(rising.0, rising.1, DUTY_MIN, DUTY_MAX),
            falling: LinearCurve::band(falling.0, falling.1, DUTY_MIN, DUTY_MAX),
        }
    }
}
