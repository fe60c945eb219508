//! Rate-limited transfer progress reports.
//!
//! The throttle is deliberately coarse so the send loop is never stalled
//! by UI work: a report is suppressed unless at least half a second has
//! passed since the last one AND the integer percentage moved.

use crate::core::config::PROGRESS_MIN_INTERVAL;
use std::fmt;
use std::time::Instant;

/// One emitted progress snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub transferred: u64,
    pub total: u64,
    /// `round(100 · transferred / total)`; 100 for an empty file.
    pub percent: u8,
    pub bytes_per_sec: f64,
    pub eta_secs: u64,
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mibps = self.bytes_per_sec / (1024.0 * 1024.0);
        write!(
            f,
            "{}% • {:.2} MB/s • ETA {}",
            self.percent,
            mibps,
            format_eta(self.eta_secs)
        )
    }
}

/// Rounded ETA: seconds under a minute, minutes under an hour, else hours.
fn format_eta(eta_secs: u64) -> String {
    if eta_secs < 60 {
        format!("{eta_secs}s")
    } else if eta_secs < 3600 {
        format!("{}m", (eta_secs + 30) / 60)
    } else {
        format!("{}h", (eta_secs + 1800) / 3600)
    }
}

/// Converts byte counters into throttled [`ProgressReport`]s.
#[derive(Debug)]
pub struct ProgressThrottle {
    start: Instant,
    last_emit: Option<Instant>,
    last_percent: Option<u8>,
}

impl ProgressThrottle {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            last_emit: None,
            last_percent: None,
        }
    }

    /// Feed the current counters; `Some` when a report should surface.
    pub fn update(&mut self, transferred: u64, total: u64, now: Instant) -> Option<ProgressReport> {
        let percent = percent_of(transferred, total);

        if let Some(last) = self.last_emit {
            if now.duration_since(last) < PROGRESS_MIN_INTERVAL {
                return None;
            }
        }
        if self.last_percent == Some(percent) {
            return None;
        }

        let elapsed = now.duration_since(self.start).as_secs_f64();
        let bytes_per_sec = if elapsed > 0.0 {
            transferred as f64 / elapsed
        } else {
            0.0
        };
        let eta_secs = if bytes_per_sec > 0.0 {
            ((total.saturating_sub(transferred)) as f64 / bytes_per_sec).round() as u64
        } else {
            0
        };

        self.last_emit = Some(now);
        self.last_percent = Some(percent);
        Some(ProgressReport {
            transferred,
            total,
            percent,
            bytes_per_sec,
            eta_secs,
        })
    }
}

fn percent_of(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((transferred as f64 / total as f64) * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_update_emits() {
        let t0 = Instant::now();
        let mut p = ProgressThrottle::new(t0);
        let report = p.update(50, 100, t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(report.percent, 50);
        assert_eq!(report.bytes_per_sec, 50.0);
        assert_eq!(report.eta_secs, 1);
    }

    #[test]
    fn test_suppressed_within_interval() {
        let t0 = Instant::now();
        let mut p = ProgressThrottle::new(t0);
        assert!(p.update(10, 100, t0 + Duration::from_secs(1)).is_some());
        // Percent moved but not enough time passed.
        assert!(p
            .update(20, 100, t0 + Duration::from_millis(1200))
            .is_none());
        assert!(p.update(20, 100, t0 + Duration::from_secs(2)).is_some());
    }

    #[test]
    fn test_suppressed_without_percent_change() {
        let t0 = Instant::now();
        let mut p = ProgressThrottle::new(t0);
        assert!(p.update(500, 100_000, t0 + Duration::from_secs(1)).is_some());
        // Two seconds later the integer percent is still 1.
        assert!(p.update(800, 100_000, t0 + Duration::from_secs(3)).is_none());
        assert!(p
            .update(2_000, 100_000, t0 + Duration::from_secs(5))
            .is_some());
    }

    #[test]
    fn test_display_format() {
        let report = ProgressReport {
            transferred: 0,
            total: 0,
            percent: 42,
            bytes_per_sec: 3.5 * 1024.0 * 1024.0,
            eta_secs: 12,
        };
        assert_eq!(report.to_string(), "42% • 3.50 MB/s • ETA 12s");
    }

    #[test]
    fn test_eta_units() {
        assert_eq!(format_eta(0), "0s");
        assert_eq!(format_eta(59), "59s");
        assert_eq!(format_eta(60), "1m");
        assert_eq!(format_eta(90), "2m");
        assert_eq!(format_eta(3599), "60m");
        assert_eq!(format_eta(3600), "1h");
        assert_eq!(format_eta(5400), "2h");
    }

    #[test]
    fn test_zero_total_is_complete() {
        let t0 = Instant::now();
        let mut p = ProgressThrottle::new(t0);
        let report = p.update(0, 0, t0 + Duration::from_millis(1)).unwrap();
        assert_eq!(report.percent, 100);
    }
}
