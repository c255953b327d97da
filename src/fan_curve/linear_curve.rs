use std::collections::BTreeMap;

use crate::fan_curve::{DUTY_MAX, FanCurve};

// Piecewise-linear curve over (millidegree, duty) points.
// Below the first point and above the last one the
// curve is flat at that point's duty.
#[derive(Debug, Clone)]
pub struct LinearCurve {
    points: BTreeMap<i32, u8>,
}

impl LinearCurve {
    pub fn new(points: &[(i32, u8)]) -> LinearCurve {
        let mut curve = Self {
            points: BTreeMap::new(),
        };

        // Add the provided points to the curve
        for p in points {
            curve.add_point(*p);
        }

        curve
    }

    // Build a two point band: `floor` at or below `low`,
    // `ceiling` at or above `high`
    pub fn band(low: i32, high: i32, floor: u8, ceiling: u8) -> LinearCurve {
        LinearCurve::new(&[(low, floor), (high, ceiling)])
    }
}

impl FanCurve for LinearCurve {
    fn get_speed(&self, temp: i32) -> u8 {
        // Check if temperature is the map, in that case return
        // the corresponding fan speed
        if let Some(speed) = self.points.get(&temp) {
            return *speed;
        }

        // Find the 2 points of the temperature interval
        let preceding = self.points.range(..temp).next_back();
        let succeeding = self.points.range(temp..).next();

        match (preceding, succeeding) {
            (Some(pre), Some(suc)) => linear_interpolation(pre, suc, temp),
            (Some(pre), None) => *pre.1,
            (None, Some(suc)) => *suc.1,
            // If no element was in the map return max for safety
            (None, None) => DUTY_MAX,
        }
    }

    fn add_point(&mut self, point: (i32, u8)) {
        // Clamp the fan speed
        self.points.insert(point.0, point.1.min(DUTY_MAX));
    }
}

// Integer interpolation between two points, truncated toward zero
fn linear_interpolation(pre: (&i32, &u8), suc: (&i32, &u8), temp: i32) -> u8 {
    let (x1, y1) = (i64::from(*pre.0), i64::from(*pre.1));
    let (x2, y2) = (i64::from(*suc.0), i64::from(*suc.1));
    let x = i64::from(temp);

    let y = y1 + (y2 - y1) * (x - x1) / (x2 - x1);

    y.clamp(0, i64::from(DUTY_MAX)) as u8
}
