/// Simulated Sense HAT for running without hardware
///
/// Values are random but stay within the limits of the real sensors.
use rand::Rng;

use crate::sensors::{SensorError, SensorSource};

const MIN_TEMP: f64 = 0.0; // °C
const MAX_TEMP: f64 = 65.0;
const MIN_PRESS: f64 = 260.0; // hPa
const MAX_PRESS: f64 = 1260.0;
const MIN_HUMID: f64 = 0.0; // %
const MAX_HUMID: f64 = 100.0;
const MIN_CPU_TEMP: f64 = 40.0;
const MAX_CPU_TEMP: f64 = 70.0;

#[derive(Debug, Default)]
pub struct FakeSensors;

impl FakeSensors {
    pub fn new() -> Self {
        Self
    }
}

/// Random value in range with one decimal place, like the real sensors
fn random_reading(min: f64, max: f64) -> f64 {
    let tenths = rand::rng().random_range((min * 10.0) as i64..=(max * 10.0) as i64);
    tenths as f64 / 10.0
}

impl SensorSource for FakeSensors {
    fn read_temperature(&mut self) -> Result<f64, SensorError> {
        Ok(random_reading(MIN_TEMP, MAX_TEMP))
    }

    fn read_pressure(&mut self) -> Result<f64, SensorError> {
        Ok(random_reading(MIN_PRESS, MAX_PRESS))
    }

    fn read_humidity(&mut self) -> Result<f64, SensorError> {
        Ok(random_reading(MIN_HUMID, MAX_HUMID))
    }

    fn read_cpu_proxy_temperature(&mut self) -> Result<f64, SensorError> {
        Ok(random_reading(MIN_CPU_TEMP, MAX_CPU_TEMP))
    }
}
