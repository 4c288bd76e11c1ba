//! CPU-side frame timing.

use std::time::{Duration, Instant};

use log::{debug, log_enabled, trace, warn, Level};
use serde::{Deserialize, Serialize};

const TARGET: &str = "penumbra::timing";

/// Times a named section. Traces on drop and, when given a sink, adds the elapsed
/// time to it.
pub struct SectionTimer<'a> {
    label: &'static str,
    start: Instant,
    sink: Option<&'a mut Duration>,
}

impl<'a> SectionTimer<'a> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            start: Instant::now(),
            sink: None,
        }
    }

    pub fn accumulate(label: &'static str, sink: &'a mut Duration) -> Self {
        Self {
            label,
            start: Instant::now(),
            sink: Some(sink),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for SectionTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        if let Some(sink) = self.sink.as_deref_mut() {
            *sink += elapsed;
        }
        if log_enabled!(target: TARGET, Level::Trace) {
            trace!(target: TARGET, "{} took {} µs", self.label, elapsed.as_micros());
        }
    }
}

/// Where the CPU time of the last presented frame went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameTimings {
    /// Image acquisition plus the wait on that image's fence.
    pub acquire: Duration,
    /// Command recording, shadows and main pass included.
    pub record: Duration,
    pub submit: Duration,
    pub present: Duration,
    pub total: Duration,
}

impl FrameTimings {
    pub fn log_summary(&self, frame: u64) {
        if !log_enabled!(target: TARGET, Level::Debug) {
            return;
        }
        let ms = |d: Duration| d.as_secs_f32() * 1000.0;
        debug!(
            target: TARGET,
            "frame {frame}: {:.2} ms (acquire {:.2}, record {:.2}, submit {:.2}, present {:.2})",
            ms(self.total),
            ms(self.acquire),
            ms(self.record),
            ms(self.submit),
            ms(self.present)
        );
    }
}

/// CPU time allowed per frame before a warning is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBudget {
    budget: Duration,
}

impl FrameBudget {
    pub fn from_millis(budget_ms: f32) -> Self {
        let budget =
            Duration::try_from_secs_f32(budget_ms.max(0.0) / 1000.0).unwrap_or(Duration::MAX);
        Self { budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Warns and returns `true` when `elapsed` is over budget.
    pub fn check(&self, elapsed: Duration) -> bool {
        if elapsed <= self.budget {
            return false;
        }
        warn!(
            "[FrameBudget] frame took {:.2} ms, budget is {:.2} ms",
            elapsed.as_secs_f32() * 1000.0,
            self.budget.as_secs_f32() * 1000.0
        );
        true
    }
}
