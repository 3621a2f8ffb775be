/// Main sampling loop: read, compensate, display, upload
use log::{debug, error, info, warn};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};

use crate::compensation::CompensationFilter;
use crate::display::{DisplaySink, ReadingHistory};
use crate::models::{ReadingSample, UploadOutcome};
use crate::scheduler::{SchedulePhase, ScheduleSettings, UploadScheduleState, UploadScheduler};
use crate::sensors::{SensorError, SensorSource};
use crate::upload::Uploader;
use crate::utils::{epoch_seconds, now_local, round_to};

/// Longest the displays go without a redraw while waiting between ticks
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("fatal upload error: {0}")]
    FatalUpload(String),
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Sleep between ticks
    pub wait: Duration,
    /// Compensation damping factor, `<= 0` disables
    pub comp_factor: f64,
    /// Number of CPU readings averaged for compensation
    pub cpu_window: usize,
    pub schedule: ScheduleSettings,
}

/// What happened during one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickReport {
    /// Sensors could not be read; nothing was recorded
    Skipped,
    Sampled {
        sample: ReadingSample,
        upload: Option<UploadOutcome>,
    },
}

/// End-of-session statistics
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub started: OffsetDateTime,
    pub finished: OffsetDateTime,
    pub ticks: u64,
    pub uploads: u32,
}

pub struct Monitor {
    sensors: Box<dyn SensorSource + Send>,
    uploader: Uploader,
    sinks: Vec<Box<dyn DisplaySink + Send>>,
    filter: CompensationFilter,
    scheduler: UploadScheduler,
    history: ReadingHistory,
    wait: Duration,
    clock_start: Instant,
    started: OffsetDateTime,
    ticks: u64,
}

impl Monitor {
    pub fn new(
        sensors: Box<dyn SensorSource + Send>,
        uploader: Uploader,
        sinks: Vec<Box<dyn DisplaySink + Send>>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            sensors,
            uploader,
            sinks,
            filter: CompensationFilter::new(settings.comp_factor, settings.cpu_window),
            scheduler: UploadScheduler::new(settings.schedule),
            history: ReadingHistory::default(),
            wait: settings.wait,
            clock_start: Instant::now(),
            started: now_local(),
            ticks: 0,
        }
    }

    pub fn schedule(&self) -> &UploadScheduleState {
        self.scheduler.state()
    }

    pub fn phase(&self) -> SchedulePhase {
        self.scheduler.phase()
    }

    pub fn history(&self) -> &ReadingHistory {
        &self.history
    }

    /// Seconds on the monotonic clock since the monitor was created
    fn clock(&self) -> f64 {
        self.clock_start.elapsed().as_secs_f64()
    }

    /// Read every sensor, then compensate.
    ///
    /// A failed read leaves the compensation window untouched.
    fn read_sample(&mut self) -> Result<ReadingSample, SensorError> {
        let ambient = self.sensors.read_temperature()?;
        let cpu = if self.filter.is_enabled() {
            Some(self.sensors.read_cpu_proxy_temperature()?)
        } else {
            None
        };
        let pressure = self.sensors.read_pressure()?;
        let humidity = self.sensors.read_humidity()?;

        let temperature = match cpu {
            Some(cpu) => self.filter.apply(ambient, cpu),
            None => ambient,
        };

        Ok(ReadingSample {
            temperature,
            pressure,
            humidity,
            timestamp: epoch_seconds(),
        })
    }

    fn render_sinks(&mut self) {
        for sink in self.sinks.iter_mut() {
            sink.render(&self.history, self.scheduler.state());
        }
    }

    /// Redraw with the current countdown between ticks
    fn refresh(&mut self) {
        let now = self.clock();
        self.scheduler.observe(now);
        self.render_sinks();
    }

    /// Run one iteration of the loop.
    ///
    /// The sample is recorded and rendered before the upload decision is made.
    /// Only a fatal upload error is returned as an error; everything else is
    /// absorbed into the scheduler state.
    pub async fn tick(&mut self) -> Result<TickReport, MonitorError> {
        let now = self.clock();
        self.ticks += 1;
        self.scheduler.observe(now);

        let sample = match self.read_sample() {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Sensor read failed, skipping tick: {}", e);
                return Ok(TickReport::Skipped);
            }
        };
        debug!(
            "Sample: temp={:.2}°C, pressure={:.2} hPa, humidity={:.2}%",
            sample.temperature, sample.pressure, sample.humidity
        );

        self.history.push(sample);
        self.render_sinks();

        if !self.scheduler.begin_upload() {
            return Ok(TickReport::Sampled {
                sample,
                upload: None,
            });
        }

        let outcome = self.uploader.upload(&sample).await;
        self.scheduler.apply_outcome(&outcome, now);

        match &outcome {
            UploadOutcome::Success => {
                let rounding = self.uploader.rounding();
                info!(
                    "Uploaded: TEMP: {} - PRESS: {} - HUMID: {}",
                    round_to(sample.temperature, rounding),
                    round_to(sample.pressure, rounding),
                    round_to(sample.humidity, rounding)
                );
            }
            UploadOutcome::RateLimited => {
                info!(
                    "Upload throttled, next attempt in {:.0} seconds",
                    self.scheduler.state().target_interval
                );
            }
            UploadOutcome::Fatal(reason) => {
                error!("Upload failed: {}", reason);
                return Err(MonitorError::FatalUpload(reason.clone()));
            }
        }

        Ok(TickReport::Sampled {
            sample,
            upload: Some(outcome),
        })
    }

    /// Sleep until the next tick, redrawing the displays at least once a second.
    ///
    /// Returns early when a stop is requested.
    async fn pause(&mut self, stop: &mut watch::Receiver<bool>) {
        let deadline = Instant::now() + self.wait;
        let mut stop_closed = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }

            tokio::select! {
                _ = sleep(remaining.min(REFRESH_INTERVAL)) => {}
                changed = stop.changed(), if !stop_closed => {
                    match changed {
                        Ok(()) if *stop.borrow() => return,
                        Ok(()) => continue,
                        // Sender gone: nobody can ask us to stop any more
                        Err(_) => {
                            stop_closed = true;
                            continue;
                        }
                    }
                }
            }

            if Instant::now() < deadline {
                self.refresh();
            }
        }
    }

    async fn main_loop(&mut self, stop: &mut watch::Receiver<bool>) -> Result<(), MonitorError> {
        loop {
            if *stop.borrow() {
                info!("Stop requested");
                self.scheduler.stop();
                return Ok(());
            }

            self.tick().await?;

            if self.scheduler.is_stopped() {
                info!(
                    "Upload limit reached after {} uploads",
                    self.scheduler.state().uploads_completed
                );
                return Ok(());
            }
            if *stop.borrow() {
                continue;
            }

            self.pause(stop).await;
        }
    }

    /// Run until stopped, the upload limit is reached, or a fatal error.
    ///
    /// Display sinks are closed on every exit path.
    pub async fn run(
        &mut self,
        mut stop: watch::Receiver<bool>,
    ) -> Result<RunSummary, MonitorError> {
        info!("-- START Data Logging --");
        let result = self.main_loop(&mut stop).await;
        info!("-- END Data Logging --");

        for sink in self.sinks.iter_mut() {
            sink.close();
        }

        result.map(|_| self.summary())
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            started: self.started,
            finished: now_local(),
            ticks: self.ticks,
            uploads: self.scheduler.state().uploads_completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::{FeedKeys, UploadClient};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Constant readings with a number of scripted failures
    struct FixedSensors {
        ambient: f64,
        cpu: f64,
        temperature_failures: usize,
        pressure_failures: usize,
    }

    impl FixedSensors {
        fn new(ambient: f64, cpu: f64) -> Self {
            Self {
                ambient,
                cpu,
                temperature_failures: 0,
                pressure_failures: 0,
            }
        }

        fn boxed(ambient: f64, cpu: f64) -> Box<dyn SensorSource + Send> {
            Box::new(Self::new(ambient, cpu))
        }
    }

    impl SensorSource for FixedSensors {
        fn read_temperature(&mut self) -> Result<f64, SensorError> {
            if self.temperature_failures > 0 {
                self.temperature_failures -= 1;
                return Err(SensorError::NotFound("hts221".into()));
            }
            Ok(self.ambient)
        }

        fn read_pressure(&mut self) -> Result<f64, SensorError> {
            if self.pressure_failures > 0 {
                self.pressure_failures -= 1;
                return Err(SensorError::NotFound("lps25h".into()));
            }
            Ok(1013.25)
        }

        fn read_humidity(&mut self) -> Result<f64, SensorError> {
            Ok(45.0)
        }

        fn read_cpu_proxy_temperature(&mut self) -> Result<f64, SensorError> {
            Ok(self.cpu)
        }
    }

    /// Plays back scripted outcomes per send, then succeeds
    #[derive(Clone, Default)]
    struct ScriptedClient {
        outcomes: Arc<Mutex<VecDeque<UploadOutcome>>>,
        calls: Arc<Mutex<Vec<(String, f64)>>>,
    }

    impl ScriptedClient {
        fn with_outcomes(outcomes: Vec<UploadOutcome>) -> Self {
            Self {
                outcomes: Arc::new(Mutex::new(outcomes.into())),
                calls: Arc::default(),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl UploadClient for ScriptedClient {
        async fn send(&self, channel_key: &str, value: f64) -> UploadOutcome {
            self.calls.lock().unwrap().push((channel_key.to_string(), value));
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(UploadOutcome::Success)
        }
    }

    /// Sends the stop signal from inside the upload
    struct StoppingClient {
        stop: watch::Sender<bool>,
        calls: Arc<Mutex<Vec<(String, f64)>>>,
    }

    #[async_trait]
    impl UploadClient for StoppingClient {
        async fn send(&self, channel_key: &str, value: f64) -> UploadOutcome {
            self.stop.send_replace(true);
            tokio::task::yield_now().await;
            self.calls.lock().unwrap().push((channel_key.to_string(), value));
            UploadOutcome::Success
        }
    }

    /// Records the elapsed time shown on every render, and whether it was closed
    #[derive(Clone, Default)]
    struct CountingSink {
        renders: Arc<Mutex<Vec<f64>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl DisplaySink for CountingSink {
        fn render(&mut self, _history: &ReadingHistory, schedule: &UploadScheduleState) {
            self.renders.lock().unwrap().push(schedule.elapsed_since_last);
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn settings(first_delay: f64, max_uploads: Option<u32>) -> MonitorSettings {
        MonitorSettings {
            wait: Duration::from_secs(1),
            comp_factor: 2.25,
            cpu_window: 5,
            schedule: ScheduleSettings {
                base_frequency: 600.0,
                first_delay,
                throttle_penalty: 120.0,
                max_uploads,
            },
        }
    }

    fn monitor(client: &ScriptedClient, settings: MonitorSettings) -> Monitor {
        let uploader = Uploader::new(Box::new(client.clone()), FeedKeys::default(), 2);
        Monitor::new(FixedSensors::boxed(20.0, 40.0), uploader, Vec::new(), settings)
    }

    #[tokio::test(start_paused = true)]
    async fn test_compensated_sample_recorded() {
        let client = ScriptedClient::default();
        let mut monitor = monitor(&client, settings(300.0, None));

        for _ in 0..3 {
            match monitor.tick().await.unwrap() {
                TickReport::Sampled { sample, upload } => {
                    assert!((sample.temperature - (20.0 - 20.0 / 2.25)).abs() < 1e-9);
                    assert_eq!(upload, None);
                }
                TickReport::Skipped => panic!("tick should not be skipped"),
            }
        }
        assert_eq!(monitor.history().len(), 3);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_when_due() {
        let client = ScriptedClient::default();
        let mut monitor = monitor(&client, settings(300.0, None));

        monitor.tick().await.unwrap();
        tokio::time::advance(Duration::from_secs(300)).await;
        let report = monitor.tick().await.unwrap();

        assert!(matches!(
            report,
            TickReport::Sampled {
                upload: Some(UploadOutcome::Success),
                ..
            }
        ));
        assert_eq!(monitor.schedule().uploads_completed, 1);
        assert_eq!(monitor.schedule().target_interval, 600.0);

        let calls = client.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls.contains(&("temperature".to_string(), 11.11)));
        assert!(calls.contains(&("pressure".to_string(), 1013.25)));
        assert!(calls.contains(&("humidity".to_string(), 45.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backs_off() {
        let client = ScriptedClient::with_outcomes(vec![UploadOutcome::RateLimited]);
        let mut monitor = monitor(&client, settings(0.0, None));

        monitor.tick().await.unwrap();
        assert_eq!(monitor.schedule().target_interval, 120.0);
        assert_eq!(monitor.schedule().uploads_completed, 0);

        // Not retried on the next tick
        tokio::time::advance(Duration::from_secs(1)).await;
        monitor.tick().await.unwrap();
        assert_eq!(client.call_count(), 3);

        tokio::time::advance(Duration::from_secs(119)).await;
        monitor.tick().await.unwrap();
        assert_eq!(client.call_count(), 6);
        assert_eq!(monitor.schedule().uploads_completed, 1);
        assert_eq!(monitor.schedule().target_interval, 600.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_upload_stops_run() {
        let fatal = UploadOutcome::Fatal("HTTP 401: bad key".into());
        let client = ScriptedClient::with_outcomes(vec![fatal]);
        let mut monitor = monitor(&client, settings(0.0, None));
        let (_tx, rx) = watch::channel(false);

        match monitor.run(rx).await {
            Err(MonitorError::FatalUpload(reason)) => assert_eq!(reason, "HTTP 401: bad key"),
            other => panic!("expected fatal error, got {:?}", other),
        }
        assert_eq!(monitor.phase(), SchedulePhase::Stopped);
        assert_eq!(monitor.schedule().uploads_completed, 0);
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_at_max_uploads() {
        let client = ScriptedClient::default();
        let mut settings = settings(0.0, Some(3));
        settings.schedule.base_frequency = 5.0;
        let mut monitor = monitor(&client, settings);
        let (_tx, rx) = watch::channel(false);

        let summary = monitor.run(rx).await.unwrap();
        assert_eq!(summary.uploads, 3);
        assert_eq!(client.call_count(), 9);
        // Uploads at t=0, 5 and 10 with one tick per second
        assert_eq!(summary.ticks, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_before_start() {
        let client = ScriptedClient::default();
        let mut monitor = monitor(&client, settings(0.0, None));
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let summary = monitor.run(rx).await.unwrap();
        assert_eq!(summary.ticks, 0);
        assert_eq!(client.call_count(), 0);
        assert_eq!(monitor.phase(), SchedulePhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_interrupts_sleep() {
        let client = ScriptedClient::default();
        let mut settings = settings(300.0, None);
        settings.wait = Duration::from_secs(3600);
        let mut monitor = monitor(&client, settings);
        let (tx, rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            sleep(Duration::from_secs(10)).await;
            tx.send(true).unwrap();
        });

        let summary = monitor.run(rx).await.unwrap();
        stopper.await.unwrap();
        assert_eq!(summary.ticks, 1);
        assert_eq!(summary.uploads, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_failure_skips_tick() {
        let client = ScriptedClient::default();
        let uploader = Uploader::new(Box::new(client.clone()), FeedKeys::default(), 2);
        let mut sensors = FixedSensors::new(20.0, 40.0);
        sensors.temperature_failures = 1;
        let sensors = Box::new(sensors);
        let mut monitor = Monitor::new(sensors, uploader, Vec::new(), settings(0.0, None));

        assert_eq!(monitor.tick().await.unwrap(), TickReport::Skipped);
        assert!(monitor.history().is_empty());
        assert_eq!(client.call_count(), 0);

        // Upload still due on the next good tick
        monitor.tick().await.unwrap();
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compensation_disabled() {
        let client = ScriptedClient::default();
        let mut settings = settings(300.0, None);
        settings.comp_factor = 0.0;
        let mut monitor = monitor(&client, settings);

        monitor.tick().await.unwrap();
        assert_eq!(monitor.history().latest().unwrap().temperature, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sinks_rendered_and_closed() {
        let client = ScriptedClient::default();
        let sink = CountingSink::default();
        let uploader = Uploader::new(Box::new(client.clone()), FeedKeys::default(), 2);
        let mut monitor = Monitor::new(
            FixedSensors::boxed(20.0, 40.0),
            uploader,
            vec![Box::new(sink.clone())],
            settings(0.0, Some(1)),
        );
        let (_tx, rx) = watch::channel(false);

        monitor.run(rx).await.unwrap();
        assert_eq!(sink.renders.lock().unwrap().len(), 1);
        assert!(*sink.closed.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_leaves_window_untouched() {
        let client = ScriptedClient::default();
        let uploader = Uploader::new(Box::new(client.clone()), FeedKeys::default(), 2);
        let mut settings = settings(300.0, None);
        settings.comp_factor = 1.0;
        settings.cpu_window = 2;
        let mut monitor =
            Monitor::new(FixedSensors::boxed(20.0, 40.0), uploader, Vec::new(), settings);
        let window = |monitor: &Monitor| -> Vec<f64> {
            monitor.filter.window().unwrap().iter().copied().collect()
        };

        monitor.tick().await.unwrap();
        assert_eq!(window(&monitor), vec![40.0, 40.0]);

        let mut failing = FixedSensors::new(20.0, 140.0);
        failing.pressure_failures = 1;
        monitor.sensors = Box::new(failing);
        assert_eq!(monitor.tick().await.unwrap(), TickReport::Skipped);
        assert_eq!(window(&monitor), vec![40.0, 40.0]);
        assert_eq!(monitor.history().len(), 1);

        // Next good tick takes the CPU reading exactly once
        monitor.tick().await.unwrap();
        assert_eq!(window(&monitor), vec![40.0, 140.0]);
        assert_eq!(monitor.history().latest().unwrap().temperature, -50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_displays_refresh_during_long_wait() {
        let client = ScriptedClient::default();
        let sink = CountingSink::default();
        let uploader = Uploader::new(Box::new(client.clone()), FeedKeys::default(), 2);
        let mut settings = settings(300.0, None);
        settings.wait = Duration::from_secs(60);
        let mut monitor = Monitor::new(
            FixedSensors::boxed(20.0, 40.0),
            uploader,
            vec![Box::new(sink.clone())],
            settings,
        );
        let (tx, rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            sleep(Duration::from_millis(30_500)).await;
            tx.send(true).unwrap();
        });

        let summary = monitor.run(rx).await.unwrap();
        stopper.await.unwrap();
        assert_eq!(summary.ticks, 1);

        // One render from the tick, then one per second while waiting
        let renders = sink.renders.lock().unwrap().clone();
        assert_eq!(renders.len(), 31);
        assert_eq!(renders[0], 0.0);
        assert!((renders[30] - 30.0).abs() < 0.1);
        assert!(renders.windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_upload_finishes_reading() {
        let (tx, rx) = watch::channel(false);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let client = StoppingClient {
            stop: tx,
            calls: calls.clone(),
        };
        let uploader = Uploader::new(Box::new(client), FeedKeys::default(), 2);
        let mut monitor = Monitor::new(
            FixedSensors::boxed(20.0, 40.0),
            uploader,
            Vec::new(),
            settings(0.0, None),
        );

        let summary = monitor.run(rx).await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 3);
        assert_eq!(summary.uploads, 1);
        assert_eq!(summary.ticks, 1);
        assert_eq!(monitor.schedule().uploads_completed, 1);
        assert_eq!(monitor.phase(), SchedulePhase::Stopped);
    }
}
