use serde::{Deserialize, Serialize};
use std::fmt;

use super::thresholds::Thresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Good,
    Bad,
}

impl Quality {
    /// Dataset label: 0 = Good, 1 = Bad
    pub fn label(self) -> u8 {
        match self {
            Quality::Good => 0,
            Quality::Bad => 1,
        }
    }

    pub fn is_good(self) -> bool {
        self == Quality::Good
    }
}

impl From<bool> for Quality {
    fn from(good: bool) -> Self {
        if good {
            Quality::Good
        } else {
            Quality::Bad
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Good => f.write_str("Good"),
            Quality::Bad => f.write_str("Bad"),
        }
    }
}

/// The four channels the classifier consumes
///
/// Also serves as the measurement screen's display buffer, where a channel
/// is `None` until the first sample carrying it arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub turbidity: Option<f64>,
    pub r: Option<f64>,
    pub g: Option<f64>,
    pub b: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub quality: Quality,
    pub result_analyze: bool,
    pub r_ratio: f64,
}

pub fn classify(reading: &SensorReading, thresholds: &Thresholds) -> Classification {
    let value = |channel: Option<f64>| channel.filter(|v| v.is_finite()).unwrap_or(0.0);
    let (r, g, b) = (value(reading.r), value(reading.g), value(reading.b));
    let turbidity = value(reading.turbidity);

    let r_ratio = r / (r + g + b).max(f64::EPSILON);
    let bad = turbidity < thresholds.turbidity_min_good_v || r_ratio < thresholds.r_ratio_min;
    let quality = Quality::from(!bad);

    Classification {
        quality,
        result_analyze: quality.is_good(),
        r_ratio,
    }
}
