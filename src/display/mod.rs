pub mod led;
pub mod terminal;

use std::collections::VecDeque;

use crate::models::{Channel, ReadingSample};
use crate::scheduler::UploadScheduleState;

pub use led::LedMatrix;
pub use terminal::TerminalDashboard;

/// Number of samples kept for graphs
pub const HISTORY_CAPACITY: usize = 120;

/// Bounded history of recent samples, oldest evicted first
#[derive(Debug, Clone)]
pub struct ReadingHistory {
    samples: VecDeque<ReadingSample>,
    capacity: usize,
}

impl ReadingHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: ReadingSample) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&ReadingSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadingSample> {
        self.samples.iter()
    }

    /// Values of one channel, oldest first
    pub fn values(&self, channel: Channel) -> Vec<f64> {
        self.samples.iter().map(|s| s.value(channel)).collect()
    }
}

impl Default for ReadingHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

/// Something that shows live data, called once per tick
pub trait DisplaySink {
    fn render(&mut self, history: &ReadingHistory, schedule: &UploadScheduleState);

    /// Release the output device on shutdown
    fn close(&mut self) {}
}
