use std::fmt;

/// Upload channel, one per reading type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Temperature,
    Pressure,
    Humidity,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Temperature, Channel::Pressure, Channel::Humidity];

    pub fn label(&self) -> &'static str {
        match self {
            Channel::Temperature => "temperature",
            Channel::Pressure => "pressure",
            Channel::Humidity => "humidity",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Channel::Temperature => "°C",
            Channel::Pressure => "hPa",
            Channel::Humidity => "%",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One sensor observation, temperature already compensated
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadingSample {
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl ReadingSample {
    pub fn value(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Temperature => self.temperature,
            Channel::Pressure => self.pressure,
            Channel::Humidity => self.humidity,
        }
    }
}

/// Result of a single upload attempt as reported by the upload client
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Success,
    RateLimited,
    Fatal(String),
}

impl UploadOutcome {
    /// Combine the outcomes of a fan-out. Fatal wins over rate limiting,
    /// which wins over success.
    pub fn merge(self, other: UploadOutcome) -> UploadOutcome {
        match (self, other) {
            (UploadOutcome::Fatal(a), UploadOutcome::Fatal(b)) => {
                UploadOutcome::Fatal(format!("{}; {}", a, b))
            }
            (UploadOutcome::Fatal(reason), _) | (_, UploadOutcome::Fatal(reason)) => {
                UploadOutcome::Fatal(reason)
            }
            (UploadOutcome::RateLimited, _) | (_, UploadOutcome::RateLimited) => {
                UploadOutcome::RateLimited
            }
            (UploadOutcome::Success, UploadOutcome::Success) => UploadOutcome::Success,
        }
    }
}
