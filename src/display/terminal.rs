/// Plain terminal dashboard with sparklines
use log::warn;
use std::io::{self, Stdout, Write};

use crate::display::{DisplaySink, ReadingHistory};
use crate::models::Channel;
use crate::scheduler::UploadScheduleState;

const SPARK_CHARS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
const SPARK_WIDTH: usize = 40;
/// Changes within this fraction of the previous value count as flat
const DELTA_FACTOR: f64 = 0.02;
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Render values as a single-line sparkline scaled to their own min/max
pub fn sparkline(values: &[f64]) -> String {
    let finite = values.iter().copied().filter(|v| v.is_finite());
    let (min, max) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });

    values
        .iter()
        .map(|&v| {
            if !v.is_finite() {
                ' '
            } else if max - min < f64::EPSILON {
                SPARK_CHARS[SPARK_CHARS.len() / 2]
            } else {
                let idx = ((v - min) / (max - min) * (SPARK_CHARS.len() - 1) as f64).round();
                SPARK_CHARS[idx as usize]
            }
        })
        .collect()
}

/// Trend arrow between the two most recent values
pub fn trend(previous: Option<f64>, current: f64) -> char {
    match previous {
        Some(prev) if (current - prev).abs() > prev.abs() * DELTA_FACTOR => {
            if current > prev {
                '↑'
            } else {
                '↓'
            }
        }
        _ => '→',
    }
}

pub struct TerminalDashboard<W: Write> {
    out: W,
    clear: bool,
    failed: bool,
}

impl TerminalDashboard<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout(), true)
    }
}

impl<W: Write> TerminalDashboard<W> {
    pub fn new(out: W, clear: bool) -> Self {
        Self {
            out,
            clear,
            failed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn draw(&mut self, history: &ReadingHistory, schedule: &UploadScheduleState) -> io::Result<()> {
        if self.clear {
            write!(self.out, "{}", CLEAR_SCREEN)?;
        }
        writeln!(self.out, "sensemon v{}", env!("CARGO_PKG_VERSION"))?;

        for channel in Channel::ALL {
            let values = history.values(channel);
            let Some(&current) = values.last() else {
                writeln!(self.out, "{:<12} {:>10}", channel.label(), "--")?;
                continue;
            };
            let previous = values.len().checked_sub(2).map(|i| values[i]);
            let start = values.len().saturating_sub(SPARK_WIDTH);

            writeln!(
                self.out,
                "{:<12} {:>10.2} {:<4} {} {}",
                channel.label(),
                current,
                channel.unit(),
                trend(previous, current),
                sparkline(&values[start..])
            )?;
        }

        let limit = match schedule.max_uploads {
            Some(max) => max.to_string(),
            None => "∞".to_string(),
        };
        writeln!(
            self.out,
            "uploads: {} / {}   next upload in {:.0}s",
            schedule.uploads_completed,
            limit,
            schedule.remaining()
        )?;
        self.out.flush()
    }
}

impl<W: Write> DisplaySink for TerminalDashboard<W> {
    fn render(&mut self, history: &ReadingHistory, schedule: &UploadScheduleState) {
        if self.failed {
            return;
        }
        if let Err(e) = self.draw(history, schedule) {
            warn!("Terminal dashboard disabled: {}", e);
            self.failed = true;
        }
    }
}
