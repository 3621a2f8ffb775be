/// CPU heat compensation for the ambient temperature sensor
///
/// The Sense HAT sits directly above the Pi's processor, so its temperature
/// sensors read high. We keep a short rolling window of CPU temperatures and
/// pull the ambient reading down in proportion to how far the CPU average is
/// above it:
///
/// `compensated = ambient - ((cpu_average - ambient) / factor)`
///
/// A larger factor gives a gentler correction. A factor of zero or less
/// disables compensation entirely.
use std::collections::VecDeque;

pub const DEFAULT_COMP_FACTOR: f64 = 2.25;
pub const DEFAULT_WINDOW_CAPACITY: usize = 5;

/// Fixed-capacity FIFO of recent CPU temperatures
#[derive(Debug, Clone)]
pub struct CompensationWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl CompensationWindow {
    /// Create a window filled with `capacity` copies of the first reading so
    /// the very first average is not dragged towards zero.
    pub fn primed(capacity: usize, first: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: std::iter::repeat(first).take(capacity).collect(),
            capacity,
        }
    }

    /// Append a reading, returning the evicted oldest entry
    pub fn push(&mut self, value: f64) -> Option<f64> {
        let evicted = if self.samples.len() >= self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(value);
        evicted
    }

    pub fn average(&self) -> f64 {
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.samples.iter()
    }
}

/// First-order correction of the ambient reading against the CPU average
pub fn compensate(ambient: f64, cpu_average: f64, factor: f64) -> f64 {
    if factor <= 0.0 {
        return ambient;
    }
    ambient - ((cpu_average - ambient) / factor)
}

/// Stateful compensation filter owned by the monitor loop
#[derive(Debug, Clone)]
pub struct CompensationFilter {
    factor: f64,
    capacity: usize,
    window: Option<CompensationWindow>,
}

impl CompensationFilter {
    pub fn new(factor: f64, capacity: usize) -> Self {
        Self {
            factor,
            capacity,
            window: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.factor > 0.0
    }

    /// Window of CPU readings, `None` until the first reading or when disabled
    pub fn window(&self) -> Option<&CompensationWindow> {
        self.window.as_ref()
    }

    /// Feed one tick of readings and return the compensated temperature.
    ///
    /// The CPU reading joins the window before the average is taken, so the
    /// current tick always influences its own correction.
    pub fn apply(&mut self, ambient: f64, cpu: f64) -> f64 {
        if !self.is_enabled() {
            return ambient;
        }

        let capacity = self.capacity;
        let window = self
            .window
            .get_or_insert_with(|| CompensationWindow::primed(capacity, cpu));
        window.push(cpu);

        compensate(ambient, window.average(), self.factor)
    }
}
