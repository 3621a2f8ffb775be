/// Upload cadence and rate-limit recovery
///
/// The scheduler is a small state machine driven by the monitor loop:
///
/// ```text
/// Idle --elapsed >= target--> Due --begin_upload--> Uploading
/// Uploading --Success------> Idle (target = base frequency, count + 1)
/// Uploading --RateLimited--> Idle (target += throttle penalty)
/// Uploading --Fatal--------> Stopped
/// any       --stop---------> Stopped
/// ```
///
/// Time is passed in as seconds on a monotonic clock so the machine itself
/// stays free of any clock source.
use log::debug;

use crate::models::UploadOutcome;

pub const DEFAULT_FREQUENCY_SECS: f64 = 600.0;
pub const DEFAULT_FIRST_DELAY_SECS: f64 = 300.0;
pub const DEFAULT_THROTTLE_SECS: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePhase {
    Idle,
    Due,
    Uploading,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleSettings {
    /// Interval between uploads after a success
    pub base_frequency: f64,
    /// Interval before the very first upload
    pub first_delay: f64,
    /// Added to the interval on every rate-limit response
    pub throttle_penalty: f64,
    /// `None` uploads forever
    pub max_uploads: Option<u32>,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            base_frequency: DEFAULT_FREQUENCY_SECS,
            first_delay: DEFAULT_FIRST_DELAY_SECS,
            throttle_penalty: DEFAULT_THROTTLE_SECS,
            max_uploads: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadScheduleState {
    pub target_interval: f64,
    pub elapsed_since_last: f64,
    pub uploads_completed: u32,
    pub max_uploads: Option<u32>,
}

impl UploadScheduleState {
    /// Seconds until the next upload is due
    pub fn remaining(&self) -> f64 {
        (self.target_interval - self.elapsed_since_last).max(0.0)
    }

    /// Fraction of the current interval that has passed, in `0.0..=1.0`
    pub fn progress(&self) -> f64 {
        if self.target_interval <= 0.0 {
            return 1.0;
        }
        (self.elapsed_since_last / self.target_interval).clamp(0.0, 1.0)
    }

    fn limit_reached(&self) -> bool {
        matches!(self.max_uploads, Some(max) if max > 0 && self.uploads_completed >= max)
    }
}

#[derive(Debug, Clone)]
pub struct UploadScheduler {
    settings: ScheduleSettings,
    state: UploadScheduleState,
    phase: SchedulePhase,
    // Clock reading of the last upload attempt
    anchor: f64,
}

impl UploadScheduler {
    pub fn new(settings: ScheduleSettings) -> Self {
        Self::starting_at(settings, 0.0)
    }

    pub fn starting_at(settings: ScheduleSettings, now: f64) -> Self {
        let state = UploadScheduleState {
            target_interval: settings.first_delay,
            elapsed_since_last: 0.0,
            uploads_completed: 0,
            max_uploads: settings.max_uploads,
        };
        Self {
            settings,
            state,
            phase: SchedulePhase::Idle,
            anchor: now,
        }
    }

    pub fn state(&self) -> &UploadScheduleState {
        &self.state
    }

    pub fn phase(&self) -> SchedulePhase {
        self.phase
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == SchedulePhase::Stopped
    }

    /// Clock reading at which the next upload becomes due
    pub fn next_due(&self) -> f64 {
        self.anchor + self.state.target_interval
    }

    /// Update elapsed time and move `Idle -> Due` once the interval has passed
    pub fn observe(&mut self, now: f64) -> SchedulePhase {
        if self.phase == SchedulePhase::Stopped {
            return self.phase;
        }

        self.state.elapsed_since_last = (now - self.anchor).max(0.0);
        if self.phase == SchedulePhase::Idle
            && self.state.elapsed_since_last >= self.state.target_interval
        {
            self.phase = SchedulePhase::Due;
        }
        self.phase
    }

    /// `Due -> Uploading`. Returns false when no upload is due.
    pub fn begin_upload(&mut self) -> bool {
        if self.phase != SchedulePhase::Due {
            return false;
        }
        self.phase = SchedulePhase::Uploading;
        true
    }

    /// Apply the result of the in-flight upload.
    ///
    /// `now` is the clock reading of the tick that started the upload; the
    /// next interval is measured from there.
    pub fn apply_outcome(&mut self, outcome: &UploadOutcome, now: f64) -> SchedulePhase {
        if self.phase != SchedulePhase::Uploading {
            debug!("Ignoring upload outcome in phase {:?}", self.phase);
            return self.phase;
        }

        match outcome {
            UploadOutcome::Success => {
                self.state.uploads_completed += 1;
                self.state.target_interval = self.settings.base_frequency;
                self.restart_interval(now);
                self.phase = if self.state.limit_reached() {
                    SchedulePhase::Stopped
                } else {
                    SchedulePhase::Idle
                };
            }
            UploadOutcome::RateLimited => {
                // No ceiling: keep backing off for as long as the service asks
                self.state.target_interval += self.settings.throttle_penalty;
                self.restart_interval(now);
                self.phase = SchedulePhase::Idle;
            }
            UploadOutcome::Fatal(_) => {
                self.phase = SchedulePhase::Stopped;
            }
        }
        self.phase
    }

    /// External cancellation
    pub fn stop(&mut self) {
        self.phase = SchedulePhase::Stopped;
    }

    fn restart_interval(&mut self, now: f64) {
        self.anchor = now;
        self.state.elapsed_since_last = 0.0;
    }
}
