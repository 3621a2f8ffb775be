pub mod fake;
pub mod sensehat;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub use fake::FakeSensors;
pub use sensehat::SenseHat;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unexpected value in {path}: '{value}'")]
    Parse { path: PathBuf, value: String },

    #[error("sensor device '{0}' not found")]
    NotFound(String),
}

/// Raw readings from the sensor board
pub trait SensorSource {
    /// Ambient temperature in °C
    fn read_temperature(&mut self) -> Result<f64, SensorError>;
    /// Barometric pressure in hPa
    fn read_pressure(&mut self) -> Result<f64, SensorError>;
    /// Relative humidity in %
    fn read_humidity(&mut self) -> Result<f64, SensorError>;
    /// Temperature near the processor in °C, used only for compensation
    fn read_cpu_proxy_temperature(&mut self) -> Result<f64, SensorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    SenseHat,
    Fake,
}

impl FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sensehat" | "sense-hat" => Ok(SensorKind::SenseHat),
            "fake" => Ok(SensorKind::Fake),
            other => Err(format!("unknown sensor source '{}'", other)),
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::SenseHat => f.write_str("sensehat"),
            SensorKind::Fake => f.write_str("fake"),
        }
    }
}

/// Open the configured sensor source
pub fn open(kind: SensorKind) -> Result<Box<dyn SensorSource + Send>, SensorError> {
    match kind {
        SensorKind::SenseHat => Ok(Box::new(SenseHat::open()?)),
        SensorKind::Fake => Ok(Box::new(FakeSensors::new())),
    }
}
