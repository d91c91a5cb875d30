/// Timing and logging helpers
///
/// Transactions time themselves with [`OperationTimer`]; listeners fold
/// request handling times into [`LatencyStats`].

use log::{debug, warn};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Running latency figures for handled requests
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
}

impl LatencyStats {
    pub fn record(&mut self, duration: Duration) {
        self.samples += 1;
        self.total += duration;
        self.min = Some(self.min.map_or(duration, |min| min.min(duration)));
        self.max = Some(self.max.map_or(duration, |max| max.max(duration)));
    }

    pub fn average(&self) -> Duration {
        if self.samples == 0 {
            return Duration::ZERO;
        }
        self.total / u32::try_from(self.samples).unwrap_or(u32::MAX)
    }
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: &'static str,
}

impl OperationTimer {
    pub fn start(operation_name: &'static str) -> Self {
        debug!("Starting operation: {}", operation_name);
        Self {
            start: Instant::now(),
            operation_name,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("Operation '{}' completed in {:?}", self.operation_name, duration);
        duration
    }

    /// Stop the timer, logging a failure at warn level
    pub fn stop_and_log(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        if success {
            debug!("Operation '{}' succeeded in {:?}", self.operation_name, duration);
        } else {
            warn!("Operation '{}' failed after {:?}", self.operation_name, duration);
        }
        duration
    }
}

/// Logging utilities
pub mod logging {
    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_stats() {
        let mut stats = LatencyStats::default();
        assert_eq!(stats.average(), Duration::ZERO);

        stats.record(Duration::from_millis(100));
        stats.record(Duration::from_millis(300));
        stats.record(Duration::from_millis(200));

        assert_eq!(stats.samples, 3);
        assert_eq!(stats.min, Some(Duration::from_millis(100)));
        assert_eq!(stats.max, Some(Duration::from_millis(300)));
        assert_eq!(stats.average(), Duration::from_millis(200));
    }

    #[test]
    fn test_timer_measures_elapsed() {
        let timer = OperationTimer::start("sleep");
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
        assert!(timer.stop_and_log(true) >= Duration::from_millis(5));
    }
}
