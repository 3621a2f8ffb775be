use log::LevelFilter;
use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::compensation::{DEFAULT_COMP_FACTOR, DEFAULT_WINDOW_CAPACITY};
use crate::display::led::{LedMode, DEFAULT_LED_DEVICE, DEFAULT_LED_SLEEP_SECS};
use crate::scheduler::{DEFAULT_FIRST_DELAY_SECS, DEFAULT_FREQUENCY_SECS, DEFAULT_THROTTLE_SECS};
use crate::sensors::SensorKind;
use crate::upload::FeedKeys;

pub const DEFAULT_WAIT_SECS: f64 = 1.0;
pub const MIN_WAIT_SECS: f64 = 1.0;
pub const DEFAULT_ROUNDING: u32 = 2;
pub const MAX_ROUNDING: u32 = 10;
pub const DEFAULT_AIO_URL: &str = "https://io.adafruit.com";

// Recognised configuration keys
pub const KWD_FREQ: &str = "FREQ";
pub const KWD_DELAY: &str = "DELAY";
pub const KWD_WAIT: &str = "WAIT";
pub const KWD_THROTTLE: &str = "THROTTLE";
pub const KWD_ROUNDING: &str = "ROUNDING";
pub const KWD_UPLOADS: &str = "UPLOADS";
pub const KWD_TEMP_COMP: &str = "TEMP_COMP";
pub const KWD_CPU_TEMPS: &str = "CPU_TEMPS";
pub const KWD_LOG_LEVEL: &str = "LOGLVL";
pub const KWD_AIO_URL: &str = "AIO_URL";
pub const KWD_AIO_USER: &str = "AIO_USERNAME";
pub const KWD_AIO_KEY: &str = "AIO_KEY";
pub const KWD_FEED_TEMPS: &str = "FEED_TEMPS";
pub const KWD_FEED_PRESS: &str = "FEED_PRESS";
pub const KWD_FEED_HUMID: &str = "FEED_HUMID";
pub const KWD_LED_DEVICE: &str = "LED_DEVICE";
pub const KWD_LED_MODE: &str = "LED_MODE";
pub const KWD_LED_SLEEP: &str = "LED_SLEEP";
pub const KWD_PROGRESS: &str = "PROGRESS";
pub const KWD_SENSORS: &str = "SENSORS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load {path}: {reason}")]
    File { path: PathBuf, reason: String },

    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Credentials and feeds for the telemetry service
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub base_url: Url,
    pub username: String,
    pub key: String,
    pub feeds: FeedKeys,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub freq: f64,
    pub delay: f64,
    pub wait: Duration,
    pub throttle: f64,
    pub rounding: u32,
    pub max_uploads: Option<u32>,
    pub temp_comp: f64,
    pub cpu_temps: usize,
    pub log_level: Option<LevelFilter>,
    pub aio_url: Url,
    pub aio_username: Option<String>,
    pub aio_key: Option<String>,
    pub feed_temps: Option<String>,
    pub feed_press: Option<String>,
    pub feed_humid: Option<String>,
    pub led_device: PathBuf,
    pub display_mode: LedMode,
    /// Blank the LED matrix after this long; `None` keeps it on
    pub led_sleep: Option<Duration>,
    pub progress: bool,
    pub sensors: SensorKind,
}

impl AppConfig {
    /// Load configuration from the process environment.
    ///
    /// An explicit env-style file must exist; otherwise a `.env` file in the
    /// working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                dotenv::from_path(path).map_err(|e| ConfigError::File {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            }
            None => {
                dotenv::dotenv().ok();
            }
        }

        let settings: HashMap<String, String> = env::vars().collect();
        Self::from_map(&settings)
    }

    /// Build a validated configuration from a flat key/value mapping
    pub fn from_map(settings: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let freq = parse_finite(settings, KWD_FREQ, DEFAULT_FREQUENCY_SECS)?;
        if freq <= 0.0 {
            return Err(invalid(KWD_FREQ, freq, "must be greater than zero"));
        }

        let delay = parse_finite(settings, KWD_DELAY, DEFAULT_FIRST_DELAY_SECS)?;
        if delay < 0.0 {
            return Err(invalid(KWD_DELAY, delay, "must not be negative"));
        }

        let wait = parse_finite(settings, KWD_WAIT, DEFAULT_WAIT_SECS)?;
        let wait = Duration::try_from_secs_f64(wait.max(MIN_WAIT_SECS))
            .map_err(|e| invalid(KWD_WAIT, wait, e))?;

        let throttle = parse_finite(settings, KWD_THROTTLE, DEFAULT_THROTTLE_SECS)?;
        if throttle < 0.0 {
            return Err(invalid(KWD_THROTTLE, throttle, "must not be negative"));
        }

        let rounding: u32 = parse_or(settings, KWD_ROUNDING, DEFAULT_ROUNDING)?;
        if rounding > MAX_ROUNDING {
            return Err(invalid(KWD_ROUNDING, rounding, "too many decimal places"));
        }

        // Zero or negative means no limit
        let uploads: i64 = parse_or(settings, KWD_UPLOADS, -1)?;
        let max_uploads = max_uploads_from(uploads);

        let temp_comp = parse_finite(settings, KWD_TEMP_COMP, DEFAULT_COMP_FACTOR)?;

        let cpu_temps: usize = parse_or(settings, KWD_CPU_TEMPS, DEFAULT_WINDOW_CAPACITY)?;
        if cpu_temps == 0 {
            return Err(invalid(KWD_CPU_TEMPS, cpu_temps, "must be at least 1"));
        }

        let log_level = lookup(settings, KWD_LOG_LEVEL)
            .map(|value| parse_value::<LevelFilter>(KWD_LOG_LEVEL, value))
            .transpose()?;

        let aio_url = lookup(settings, KWD_AIO_URL).unwrap_or(DEFAULT_AIO_URL);
        let aio_url = Url::parse(aio_url).map_err(|e| invalid(KWD_AIO_URL, aio_url, e))?;
        if aio_url.scheme() != "http" && aio_url.scheme() != "https" {
            return Err(invalid(KWD_AIO_URL, &aio_url, "must be an http(s) URL"));
        }

        let led_sleep = parse_finite(settings, KWD_LED_SLEEP, DEFAULT_LED_SLEEP_SECS)?;
        if led_sleep < 0.0 {
            return Err(invalid(KWD_LED_SLEEP, led_sleep, "must not be negative"));
        }
        // Zero keeps the display on
        let led_sleep = if led_sleep == 0.0 {
            None
        } else {
            let timeout = Duration::try_from_secs_f64(led_sleep)
                .map_err(|e| invalid(KWD_LED_SLEEP, led_sleep, e))?;
            Some(timeout)
        };

        let progress = match lookup(settings, KWD_PROGRESS) {
            Some(value) => parse_bool(value)
                .ok_or_else(|| invalid(KWD_PROGRESS, value, "expected on/off"))?,
            None => false,
        };

        Ok(AppConfig {
            freq,
            delay,
            wait,
            throttle,
            rounding,
            max_uploads,
            temp_comp,
            cpu_temps,
            log_level,
            aio_url,
            aio_username: lookup(settings, KWD_AIO_USER).map(str::to_string),
            aio_key: lookup(settings, KWD_AIO_KEY).map(str::to_string),
            feed_temps: lookup(settings, KWD_FEED_TEMPS).map(str::to_string),
            feed_press: lookup(settings, KWD_FEED_PRESS).map(str::to_string),
            feed_humid: lookup(settings, KWD_FEED_HUMID).map(str::to_string),
            led_device: lookup(settings, KWD_LED_DEVICE)
                .unwrap_or(DEFAULT_LED_DEVICE)
                .into(),
            display_mode: parse_or(settings, KWD_LED_MODE, LedMode::Temperature)?,
            led_sleep,
            progress,
            sensors: parse_or(settings, KWD_SENSORS, SensorKind::SenseHat)?,
        })
    }

    /// Credentials and feed keys, required for live uploads
    pub fn upload_settings(&self) -> Result<UploadSettings, ConfigError> {
        let required = |value: &Option<String>, key: &'static str| {
            value.clone().ok_or(ConfigError::Missing(key))
        };

        Ok(UploadSettings {
            base_url: self.aio_url.clone(),
            username: required(&self.aio_username, KWD_AIO_USER)?,
            key: required(&self.aio_key, KWD_AIO_KEY)?,
            feeds: FeedKeys {
                temperature: required(&self.feed_temps, KWD_FEED_TEMPS)?,
                pressure: required(&self.feed_press, KWD_FEED_PRESS)?,
                humidity: required(&self.feed_humid, KWD_FEED_HUMID)?,
            },
        })
    }
}

/// Map an upload count from config or CLI onto an optional limit
pub fn max_uploads_from(count: i64) -> Option<u32> {
    if count > 0 {
        Some(u32::try_from(count).unwrap_or(u32::MAX))
    } else {
        None
    }
}

fn lookup<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn parse_or<T>(
    settings: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(settings, key) {
        Some(value) => parse_value(key, value),
        None => Ok(default),
    }
}

/// Numeric setting that must be a finite number (no NaN or infinity)
fn parse_finite(
    settings: &HashMap<String, String>,
    key: &'static str,
    default: f64,
) -> Result<f64, ConfigError> {
    let value: f64 = parse_or(settings, key, default)?;
    if !value.is_finite() {
        return Err(invalid(key, value, "must be a finite number"));
    }
    Ok(value)
}

fn parse_value<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse().map_err(|e| invalid(key, value, e))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn invalid(key: &'static str, value: impl Display, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
