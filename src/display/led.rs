/// Sense HAT 8x8 LED matrix
///
/// The board's LEDs show up as a small RGB565 framebuffer (`/dev/fb1` on a
/// stock Raspberry Pi OS install). We draw the most recent values of one
/// channel as a column graph and optionally use the bottom row as a progress
/// bar towards the next upload. After the sleep timeout the matrix is blanked
/// and left dark for the rest of the session.
use log::{info, warn};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;
use std::str::FromStr;
use tokio::time::{Duration, Instant};

use crate::display::{DisplaySink, ReadingHistory};
use crate::models::Channel;
use crate::scheduler::UploadScheduleState;
use crate::utils::num_to_range;

pub const DEFAULT_LED_DEVICE: &str = "/dev/fb1";
pub const DEFAULT_LED_SLEEP_SECS: f64 = 600.0;
pub const LED_ROWS: usize = 8;
pub const LED_COLS: usize = 8;

pub type Rgb = (u8, u8, u8);
pub type Frame = [[Rgb; LED_COLS]; LED_ROWS];

const BLACK: Rgb = (0, 0, 0);
const PROGRESS: Rgb = (127, 0, 255);
const GRADIENT: [Rgb; 4] = [(0, 0, 255), (0, 255, 0), (255, 255, 0), (255, 0, 0)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedMode {
    Temperature,
    Pressure,
    Humidity,
    Off,
}

impl LedMode {
    pub fn channel(&self) -> Option<Channel> {
        match self {
            LedMode::Temperature => Some(Channel::Temperature),
            LedMode::Pressure => Some(Channel::Pressure),
            LedMode::Humidity => Some(Channel::Humidity),
            LedMode::Off => None,
        }
    }
}

impl FromStr for LedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "temperature" | "temp" => Ok(LedMode::Temperature),
            "pressure" | "press" => Ok(LedMode::Pressure),
            "humidity" | "humid" => Ok(LedMode::Humidity),
            "off" | "blank" => Ok(LedMode::Off),
            other => Err(format!("unknown display mode '{}'", other)),
        }
    }
}

impl fmt::Display for LedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel() {
            Some(channel) => write!(f, "{}", channel),
            None => f.write_str("off"),
        }
    }
}

/// Interpolate a color along the blue-green-yellow-red gradient
pub fn gradient_color(value: f64, min: f64, max: f64) -> Rgb {
    let position = num_to_range(value, min, max, 0.0, (GRADIENT.len() - 1) as f64)
        .clamp(0.0, (GRADIENT.len() - 1) as f64);
    let idx = position.floor() as usize;
    let frac = position - idx as f64;

    if idx >= GRADIENT.len() - 1 || frac < f64::EPSILON {
        return GRADIENT[idx.min(GRADIENT.len() - 1)];
    }

    let (r1, g1, b1) = GRADIENT[idx];
    let (r2, g2, b2) = GRADIENT[idx + 1];
    let mix = |a: u8, b: u8| (a as f64 + frac * (b as f64 - a as f64)) as u8;
    (mix(r1, r2), mix(g1, g2), mix(b1, b2))
}

/// Column graph of the last values, scaled against `min..max`
pub fn render_frame(values: &[f64], min: f64, max: f64, progress: Option<f64>) -> Frame {
    let mut frame = [[BLACK; LED_COLS]; LED_ROWS];
    let start = values.len().saturating_sub(LED_COLS);

    for (col, &value) in values[start..].iter().enumerate() {
        let height = if max - min < f64::EPSILON {
            LED_ROWS / 2
        } else {
            num_to_range(value, min, max, 0.0, LED_ROWS as f64)
                .round()
                .clamp(0.0, LED_ROWS as f64) as usize
        };
        let color = gradient_color(value, min, max);
        for row in (LED_ROWS - height)..LED_ROWS {
            frame[row][col] = color;
        }
    }

    if let Some(progress) = progress {
        let lit = (progress.clamp(0.0, 1.0) * LED_COLS as f64) as usize;
        for pixel in frame[LED_ROWS - 1].iter_mut().take(lit) {
            *pixel = PROGRESS;
        }
    }

    frame
}

/// Framebuffer bytes: row-major little-endian RGB565
pub fn encode_rgb565(frame: &Frame) -> Vec<u8> {
    frame
        .iter()
        .flatten()
        .flat_map(|&(r, g, b)| {
            let pixel = (((r as u16) >> 3) << 11) | (((g as u16) >> 2) << 5) | ((b as u16) >> 3);
            pixel.to_le_bytes()
        })
        .collect()
}

pub struct LedMatrix<D: Write + Seek> {
    device: D,
    mode: LedMode,
    progress: bool,
    failed: bool,
    sleep_after: Option<Duration>,
    awake_since: Instant,
    asleep: bool,
}

impl LedMatrix<File> {
    pub fn open(path: &Path, mode: LedMode, progress: bool) -> io::Result<Self> {
        let device = OpenOptions::new().write(true).open(path)?;
        Ok(Self::new(device, mode, progress))
    }
}

impl<D: Write + Seek> LedMatrix<D> {
    pub fn new(device: D, mode: LedMode, progress: bool) -> Self {
        Self {
            device,
            mode,
            progress,
            failed: false,
            sleep_after: None,
            awake_since: Instant::now(),
            asleep: false,
        }
    }

    /// Blank the display once `timeout` has passed; `None` never sleeps
    pub fn with_sleep(mut self, timeout: Option<Duration>) -> Self {
        self.sleep_after = timeout;
        self.awake_since = Instant::now();
        self
    }

    pub fn is_asleep(&self) -> bool {
        self.asleep
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    fn write_frame(&mut self, frame: &Frame) {
        if self.failed {
            return;
        }
        let result = self
            .device
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.device.write_all(&encode_rgb565(frame)))
            .and_then(|_| self.device.flush());
        if let Err(e) = result {
            warn!("LED display disabled: {}", e);
            self.failed = true;
        }
    }
}

impl<D: Write + Seek> DisplaySink for LedMatrix<D> {
    fn render(&mut self, history: &ReadingHistory, schedule: &UploadScheduleState) {
        if self.asleep {
            return;
        }
        if matches!(self.sleep_after, Some(timeout) if self.awake_since.elapsed() >= timeout) {
            info!("LED display going to sleep");
            self.asleep = true;
            self.write_frame(&[[BLACK; LED_COLS]; LED_ROWS]);
            return;
        }

        let progress = self.progress.then(|| schedule.progress());
        let frame = match self.mode.channel() {
            Some(channel) => {
                let values = history.values(channel);
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                render_frame(&values, min, max, progress)
            }
            None => render_frame(&[], 0.0, 0.0, progress),
        };
        self.write_frame(&frame);
    }

    fn close(&mut self) {
        self.write_frame(&[[BLACK; LED_COLS]; LED_ROWS]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReadingSample;
    use std::io::Cursor;

    #[test]
    fn test_led_mode_from_str() {
        assert_eq!("temperature".parse::<LedMode>(), Ok(LedMode::Temperature));
        assert_eq!("PRESS".parse::<LedMode>(), Ok(LedMode::Pressure));
        assert_eq!("humidity".parse::<LedMode>(), Ok(LedMode::Humidity));
        assert_eq!("off".parse::<LedMode>(), Ok(LedMode::Off));
        assert!("sparkle".parse::<LedMode>().is_err());
    }

    #[test]
    fn test_gradient_endpoints() {
        assert_eq!(gradient_color(0.0, 0.0, 3.0), (0, 0, 255));
        assert_eq!(gradient_color(1.0, 0.0, 3.0), (0, 255, 0));
        assert_eq!(gradient_color(3.0, 0.0, 3.0), (255, 0, 0));
        assert_eq!(gradient_color(0.5, 0.0, 3.0), (0, 127, 127));
    }

    #[test]
    fn test_column_heights() {
        let frame = render_frame(&[0.0, 8.0, 4.0], 0.0, 8.0, None);
        // Lowest value draws nothing
        assert!((0..LED_ROWS).all(|row| frame[row][0] == BLACK));
        // Highest value fills the column
        assert!((0..LED_ROWS).all(|row| frame[row][1] != BLACK));
        // Midpoint fills the bottom half
        assert!((0..4).all(|row| frame[row][2] == BLACK));
        assert!((4..LED_ROWS).all(|row| frame[row][2] != BLACK));
        assert!((0..LED_ROWS).all(|row| frame[row][3] == BLACK));
    }

    #[test]
    fn test_only_last_eight_values_drawn() {
        let values: Vec<f64> = (0..12).map(|v| v as f64).collect();
        let frame = render_frame(&values, 0.0, 11.0, None);
        // Column 7 holds the newest (max) value
        assert!((0..LED_ROWS).all(|row| frame[row][7] != BLACK));
    }

    #[test]
    fn test_progress_bar() {
        let frame = render_frame(&[], 0.0, 0.0, Some(0.5));
        let bottom = frame[LED_ROWS - 1];
        assert!(bottom[..4].iter().all(|&p| p == PROGRESS));
        assert!(bottom[4..].iter().all(|&p| p == BLACK));
    }

    #[test]
    fn test_encode_rgb565() {
        let mut frame = [[BLACK; LED_COLS]; LED_ROWS];
        frame[0][0] = (255, 0, 0);
        frame[0][1] = (0, 255, 0);
        frame[0][2] = (0, 0, 255);
        let bytes = encode_rgb565(&frame);
        assert_eq!(bytes.len(), LED_ROWS * LED_COLS * 2);
        assert_eq!(&bytes[0..6], &[0x00, 0xF8, 0xE0, 0x07, 0x1F, 0x00]);
    }

    fn history() -> ReadingHistory {
        let mut history = ReadingHistory::default();
        for i in 0..3 {
            history.push(ReadingSample {
                temperature: 20.0 + i as f64,
                pressure: 1000.0,
                humidity: 40.0,
                timestamp: i as f64,
            });
        }
        history
    }

    fn schedule() -> UploadScheduleState {
        UploadScheduleState {
            target_interval: 600.0,
            elapsed_since_last: 0.0,
            uploads_completed: 0,
            max_uploads: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_blanks_after_sleep_timeout() {
        let mut led = LedMatrix::new(Cursor::new(Vec::new()), LedMode::Temperature, false)
            .with_sleep(Some(Duration::from_secs(10)));

        led.render(&history(), &schedule());
        assert!(!led.is_asleep());
        assert!(led.device.get_ref().iter().any(|&b| b != 0));

        tokio::time::advance(Duration::from_secs(10)).await;
        led.render(&history(), &schedule());
        assert!(led.is_asleep());
        assert!(led.device.get_ref().iter().all(|&b| b == 0));

        // Stays dark on later ticks
        led.render(&history(), &schedule());
        let frame = led.into_inner().into_inner();
        assert_eq!(frame.len(), 128);
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sleep_without_timeout() {
        let mut led = LedMatrix::new(Cursor::new(Vec::new()), LedMode::Temperature, false)
            .with_sleep(None);

        tokio::time::advance(Duration::from_secs(86_400)).await;
        led.render(&history(), &schedule());
        assert!(!led.is_asleep());
        assert!(led.device.get_ref().iter().any(|&b| b != 0));
    }

    #[test]
    fn test_render_and_close() {
        let mut led = LedMatrix::new(Cursor::new(Vec::new()), LedMode::Temperature, false);
        led.render(&history(), &schedule());
        let drawn = led.device.get_ref().clone();
        assert_eq!(drawn.len(), 128);
        assert!(drawn.iter().any(|&b| b != 0));

        led.close();
        let cleared = led.into_inner().into_inner();
        assert_eq!(cleared.len(), 128);
        assert!(cleared.iter().all(|&b| b == 0));
    }
}
