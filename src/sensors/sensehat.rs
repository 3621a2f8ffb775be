/// Sense HAT environment sensors via the Linux IIO subsystem
///
/// With the `rpi-sense` overlay loaded the kernel exposes the board's
/// sensors under `/sys/bus/iio/devices/iio:deviceN`:
/// - HTS221: relative humidity and ambient temperature
/// - LPS25H: barometric pressure
///
/// Each channel is reported as `in_<channel>_raw` plus optional `_offset` and
/// `_scale` files, and the processed value is `(raw + offset) * scale` in IIO
/// units (milli-degrees, milli-percent, kPa).
///
/// The CPU temperature comes from the SoC thermal zone.
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

use crate::sensors::{SensorError, SensorSource};

const IIO_DEVICES: &str = "/sys/bus/iio/devices";
const CPU_THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

const HUMIDITY_DEVICE: &str = "hts221";
const PRESSURE_DEVICE: &str = "lps25h";

const MILLI: f64 = 1000.0;
const KPA_TO_HPA: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct SenseHat {
    humidity_dev: PathBuf,
    pressure_dev: PathBuf,
    cpu_temp: PathBuf,
}

impl SenseHat {
    pub fn open() -> Result<Self, SensorError> {
        Self::with_paths(Path::new(IIO_DEVICES), Path::new(CPU_THERMAL_ZONE))
    }

    /// Locate the sensors under an arbitrary IIO root and thermal zone file
    pub fn with_paths(iio_root: &Path, cpu_temp: &Path) -> Result<Self, SensorError> {
        let humidity_dev = find_device(iio_root, HUMIDITY_DEVICE)?;
        let pressure_dev = find_device(iio_root, PRESSURE_DEVICE)?;

        debug!(
            "Sense HAT sensors: humidity={} pressure={}",
            humidity_dev.display(),
            pressure_dev.display()
        );

        Ok(Self {
            humidity_dev,
            pressure_dev,
            cpu_temp: cpu_temp.to_path_buf(),
        })
    }
}

/// Find the IIO device directory whose `name` matches
fn find_device(iio_root: &Path, name: &str) -> Result<PathBuf, SensorError> {
    let entries = fs::read_dir(iio_root).map_err(|e| SensorError::Io {
        path: iio_root.to_path_buf(),
        source: e,
    })?;

    for entry in entries.flatten() {
        let dir = entry.path();
        match fs::read_to_string(dir.join("name")) {
            Ok(device_name) if device_name.trim() == name => return Ok(dir),
            _ => continue,
        }
    }

    Err(SensorError::NotFound(name.to_string()))
}

fn read_number(path: &Path) -> Result<f64, SensorError> {
    let text = fs::read_to_string(path).map_err(|e| SensorError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    text.trim().parse().map_err(|_| SensorError::Parse {
        path: path.to_path_buf(),
        value: text.trim().to_string(),
    })
}

fn read_optional(path: &Path, default: f64) -> Result<f64, SensorError> {
    if path.exists() {
        read_number(path)
    } else {
        Ok(default)
    }
}

/// Processed value of one IIO channel in IIO base units
fn read_channel(device: &Path, channel: &str) -> Result<f64, SensorError> {
    let raw = read_number(&device.join(format!("in_{}_raw", channel)))?;
    let offset = read_optional(&device.join(format!("in_{}_offset", channel)), 0.0)?;
    let scale = read_optional(&device.join(format!("in_{}_scale", channel)), 1.0)?;
    Ok((raw + offset) * scale)
}

impl SensorSource for SenseHat {
    fn read_temperature(&mut self) -> Result<f64, SensorError> {
        Ok(read_channel(&self.humidity_dev, "temp")? / MILLI)
    }

    fn read_pressure(&mut self) -> Result<f64, SensorError> {
        Ok(read_channel(&self.pressure_dev, "pressure")? * KPA_TO_HPA)
    }

    fn read_humidity(&mut self) -> Result<f64, SensorError> {
        Ok(read_channel(&self.humidity_dev, "humidityrelative")? / MILLI)
    }

    fn read_cpu_proxy_temperature(&mut self) -> Result<f64, SensorError> {
        Ok(read_number(&self.cpu_temp)? / MILLI)
    }
}
