//! Simulated environment sensor
//!
//! Follows a smooth day curve: temperature peaks mid-afternoon while humidity
//! bottoms out, which is enough to exercise threshold conditions without hardware.

use chrono::Timelike;
use relay_engine::{
    Clock, EngineError, SensorPort, SensorSample, SystemClock, HUMIDITY, TEMPERATURE,
};
use std::f64::consts::PI;
use std::sync::Arc;

const MEAN_TEMPERATURE: f64 = 22.0;
const TEMPERATURE_SWING: f64 = 6.0;
const MEAN_HUMIDITY: f64 = 55.0;
const HUMIDITY_SWING: f64 = 15.0;
/// Hour of the day at which temperature peaks
const PEAK_HOUR: f64 = 15.0;

pub struct SimulatedSensor {
    clock: Arc<dyn Clock>,
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

/// Reading for a fractional hour of the day
pub fn reading_at(hour: f64) -> SensorSample {
    let phase = (2.0 * PI * (hour - PEAK_HOUR) / 24.0).cos();
    SensorSample::new()
        .with(TEMPERATURE, MEAN_TEMPERATURE + TEMPERATURE_SWING * phase)
        .with(HUMIDITY, MEAN_HUMIDITY - HUMIDITY_SWING * phase)
}

impl SensorPort for SimulatedSensor {
    fn sample(&self) -> Result<SensorSample, EngineError> {
        let now = self.clock.now();
        let hour = f64::from(now.num_seconds_from_midnight()) / 3600.0;
        let sample = reading_at(hour);
        tracing::trace!("Simulated sample at {}: {:?}", now, sample);
        Ok(sample)
    }
}
