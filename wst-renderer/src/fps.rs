//! Frame-rate telemetry.

use std::time::{Duration, Instant};

use tracing::info;

/// Reporting period.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Counts presented frames and logs the rate once per [`REPORT_INTERVAL`].
#[derive(Debug)]
pub struct FpsCounter {
    label: &'static str,
    enabled: bool,
    frames: u64,
    window_start: Option<Instant>,
}

impl FpsCounter {
    pub fn new(label: &'static str, enabled: bool) -> Self {
        Self {
            label,
            enabled,
            frames: 0,
            window_start: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Records a frame at the current time.
    pub fn tick(&mut self) -> Option<f64> {
        self.tick_at(Instant::now())
    }

    /// Records a frame at `now`. Returns the rate when a report was due.
    pub fn tick_at(&mut self, now: Instant) -> Option<f64> {
        if !self.enabled {
            return None;
        }
        let start = *self.window_start.get_or_insert(now);
        self.frames += 1;
        let elapsed = now.saturating_duration_since(start);
        if elapsed < REPORT_INTERVAL {
            return None;
        }
        let fps = self.frames as f64 / elapsed.as_secs_f64();
        info!("{}: {:.2} fps", self.label, fps);
        self.frames = 0;
        self.window_start = Some(now);
        Some(fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_after_interval() {
        let mut counter = FpsCounter::new("test", true);
        let start = Instant::now();
        for i in 0..299 {
            assert_eq!(counter.tick_at(start + Duration::from_millis(i * 16)), None);
        }
        let fps = counter.tick_at(start + REPORT_INTERVAL).unwrap();
        assert!((fps - 60.0).abs() < 0.01, "unexpected rate {fps}");
    }

    #[test]
    fn test_disabled_counter_is_silent() {
        let mut counter = FpsCounter::new("test", false);
        let start = Instant::now();
        assert_eq!(counter.tick_at(start), None);
        assert_eq!(counter.tick_at(start + REPORT_INTERVAL * 2), None);
    }
}
