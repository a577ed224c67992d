//! Sliding-window throughput sampling.
//!
//! Hash and copy loops feed byte counts in; the status endpoint reads a MB/s
//! figure out. Samples older than ten seconds are dropped on every touch, and
//! the reported rate uses only the last three seconds so the number tracks
//! what the disk is doing right now rather than the whole run's average.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const KEEP_WINDOW: Duration = Duration::from_secs(10);
const RATE_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes: u64,
}

#[derive(Default)]
pub struct RateSampler {
    samples: Mutex<VecDeque<Sample>>,
}

impl RateSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.samples.lock().unwrap().clear();
    }

    pub fn record(&self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn current_mbps(&self) -> f64 {
        self.mbps_at(Instant::now())
    }

    fn record_at(&self, now: Instant, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut samples = self.samples.lock().unwrap();
        samples.push_back(Sample { at: now, bytes });
        Self::prune(&mut samples, now);
    }

    fn mbps_at(&self, now: Instant) -> f64 {
        let mut samples = self.samples.lock().unwrap();
        Self::prune(&mut samples, now);

        let cutoff = now.checked_sub(RATE_WINDOW);
        let mut bytes = 0u64;
        let mut first: Option<Instant> = None;
        for s in samples.iter() {
            if let Some(cutoff) = cutoff {
                if s.at < cutoff {
                    continue;
                }
            }
            if first.is_none() {
                first = Some(s.at);
            }
            bytes += s.bytes;
        }
        if bytes == 0 {
            return 0.0;
        }
        let elapsed = first
            .map(|f| now.saturating_duration_since(f).as_secs_f64())
            .unwrap_or(0.0)
            .max(0.001);
        (bytes as f64 / elapsed) / (1024.0 * 1024.0)
    }

    fn prune(samples: &mut VecDeque<Sample>, now: Instant) {
        let Some(cutoff) = now.checked_sub(KEEP_WINDOW) else {
            return;
        };
        while let Some(front) = samples.front() {
            if front.at < cutoff {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sampler_reports_zero() {
        let sampler = RateSampler::new();
        assert_eq!(sampler.current_mbps(), 0.0);
    }

    #[test]
    fn recent_samples_produce_a_rate() {
        let sampler = RateSampler::new();
        let t0 = Instant::now();
        sampler.record_at(t0, 1024 * 1024);
        sampler.record_at(t0 + Duration::from_millis(500), 1024 * 1024);

        let mbps = sampler.mbps_at(t0 + Duration::from_secs(1));
        // 2 MiB over one second.
        assert!((mbps - 2.0).abs() < 0.1, "got {mbps}");
    }

    #[test]
    fn samples_older_than_rate_window_are_ignored() {
        let sampler = RateSampler::new();
        let t0 = Instant::now();
        sampler.record_at(t0, 100 * 1024 * 1024);
        sampler.record_at(t0 + Duration::from_secs(5), 1024 * 1024);

        // Only the recent 1 MiB sample is inside the 3 s window; including the
        // old 100 MiB burst would average it over 5 s and crater the figure.
        let mbps = sampler.mbps_at(t0 + Duration::from_secs(5));
        assert!(mbps > 500.0, "old burst must not dilute the rate, got {mbps}");
    }

    #[test]
    fn samples_older_than_keep_window_are_pruned() {
        let sampler = RateSampler::new();
        let t0 = Instant::now();
        sampler.record_at(t0, 1024);
        sampler.record_at(t0 + Duration::from_secs(11), 2048);
        assert_eq!(sampler.samples.lock().unwrap().len(), 1);
    }

    #[test]
    fn zero_byte_samples_are_dropped() {
        let sampler = RateSampler::new();
        sampler.record(0);
        assert!(sampler.samples.lock().unwrap().is_empty());
    }

    #[test]
    fn reset_clears_history() {
        let sampler = RateSampler::new();
        sampler.record(4096);
        sampler.reset();
        assert_eq!(sampler.current_mbps(), 0.0);
    }
}
