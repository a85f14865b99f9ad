use std::time::{Duration, Instant};

/// Rendered frames and failed reads over one reporting interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateReport {
    pub fps: f32,
    pub failed_reads: u32,
}

/// Tracks frames per second and read failures for periodic logging.
pub struct RateMeter {
    frame_count: u32,
    failed_reads: u32,
    last_time: Instant,
    interval: Duration,
}

impl RateMeter {
    /// Create a meter reporting every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            frame_count: 0,
            failed_reads: 0,
            last_time: Instant::now(),
            interval,
        }
    }

    pub fn record_frame(&mut self) {
        self.frame_count += 1;
    }

    pub fn record_failure(&mut self) {
        self.failed_reads += 1;
    }

    /// Returns a report and resets the counters once the interval has passed.
    pub fn poll(&mut self) -> Option<RateReport> {
        let elapsed = self.last_time.elapsed();
        if elapsed < self.interval {
            return None;
        }

        let secs = elapsed.as_secs_f32();
        let fps = if secs > 0.0 {
            self.frame_count as f32 / secs
        } else {
            0.0
        };
        let report = RateReport {
            fps,
            failed_reads: self.failed_reads,
        };
        self.frame_count = 0;
        self.failed_reads = 0;
        self.last_time = Instant::now();
        Some(report)
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_report_before_interval() {
        let mut meter = RateMeter::new(Duration::from_secs(3600));
        meter.record_frame();
        assert!(meter.poll().is_none());
    }

    #[test]
    fn test_report_resets_counters() {
        let mut meter = RateMeter::new(Duration::ZERO);
        meter.record_frame();
        meter.record_failure();
        meter.record_failure();

        let report = meter.poll().unwrap();
        assert_eq!(report.failed_reads, 2);

        let report = meter.poll().unwrap();
        assert_eq!(report.failed_reads, 0);
        assert_eq!(report.fps, 0.0);
    }
}
