/// Upload a full reading to the three telemetry feeds
use futures_util::future::join3;

use crate::models::{Channel, ReadingSample, UploadOutcome};
use crate::upload::client::UploadClient;
use crate::utils::round_to;

/// Feed key for each upload channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedKeys {
    pub temperature: String,
    pub pressure: String,
    pub humidity: String,
}

impl FeedKeys {
    pub fn key(&self, channel: Channel) -> &str {
        match channel {
            Channel::Temperature => &self.temperature,
            Channel::Pressure => &self.pressure,
            Channel::Humidity => &self.humidity,
        }
    }
}

impl Default for FeedKeys {
    fn default() -> Self {
        Self {
            temperature: Channel::Temperature.label().to_string(),
            pressure: Channel::Pressure.label().to_string(),
            humidity: Channel::Humidity.label().to_string(),
        }
    }
}

/// Send temperature, pressure and humidity concurrently.
///
/// All three sends are always driven to completion before this returns, so a
/// shutdown request never leaves a reading half-uploaded.
pub async fn upload_reading(
    client: &dyn UploadClient,
    feeds: &FeedKeys,
    sample: &ReadingSample,
    rounding: u32,
) -> UploadOutcome {
    let (temperature, pressure, humidity) = join3(
        client.send(&feeds.temperature, round_to(sample.temperature, rounding)),
        client.send(&feeds.pressure, round_to(sample.pressure, rounding)),
        client.send(&feeds.humidity, round_to(sample.humidity, rounding)),
    )
    .await;

    temperature.merge(pressure).merge(humidity)
}

/// Upload client bundled with its feeds and rounding
pub struct Uploader {
    client: Box<dyn UploadClient>,
    feeds: FeedKeys,
    rounding: u32,
}

impl Uploader {
    pub fn new(client: Box<dyn UploadClient>, feeds: FeedKeys, rounding: u32) -> Self {
        Self {
            client,
            feeds,
            rounding,
        }
    }

    pub fn rounding(&self) -> u32 {
        self.rounding
    }

    pub async fn upload(&self, sample: &ReadingSample) -> UploadOutcome {
        upload_reading(self.client.as_ref(), &self.feeds, sample, self.rounding).await
    }
}
