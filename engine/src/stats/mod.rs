// Engine statistics and state

use std::fmt;
use std::time::{Duration, Instant};

use arachne_core::stats::StatsSnapshot;
use serde::{Deserialize, Serialize};

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Paused => "paused",
            EngineState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Summary of a crawl
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    /// Number of requests handed to a transport
    pub request_count: u64,

    /// Number of responses received
    pub response_count: u64,

    /// Number of items that passed every pipeline
    pub item_count: u64,

    /// Number of items dropped by a pipeline
    pub item_dropped_count: u64,

    /// Number of spider errors, all kinds
    pub error_count: u64,

    /// Every counter and value recorded during the crawl
    pub counters: StatsSnapshot,

    /// Start time of the crawl
    #[serde(skip)]
    pub start_time: Option<Instant>,

    /// End time of the crawl
    #[serde(skip)]
    pub end_time: Option<Instant>,
}

impl EngineStats {
    /// Summarize a stats snapshot
    pub fn from_snapshot(
        counters: StatsSnapshot,
        start_time: Option<Instant>,
        end_time: Option<Instant>,
    ) -> Self {
        let counter = |key: &str| counters.counters.get(key).copied().unwrap_or(0);
        let error_count = counters
            .counters
            .iter()
            .filter(|(key, _)| key.starts_with("SpiderError/"))
            .map(|(_, count)| *count)
            .sum();

        Self {
            request_count: counter("fetcher/request_count"),
            response_count: counter("response_received_count"),
            item_count: counter("item_scraped_count"),
            item_dropped_count: counter("item_dropped_count"),
            error_count,
            start_time,
            end_time,
            counters,
        }
    }

    /// Calculate the duration of the crawl
    pub fn duration(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            (Some(start), None) => Some(Instant::now().duration_since(start)),
            _ => None,
        }
    }

    /// Calculate the requests per second
    pub fn requests_per_second(&self) -> Option<f64> {
        self.duration().map(|duration| {
            let seconds = duration.as_secs_f64();
            if seconds > 0.0 {
                self.request_count as f64 / seconds
            } else {
                0.0
            }
        })
    }
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requests, {} responses, {} items, {} dropped, {} errors",
            self.request_count,
            self.response_count,
            self.item_count,
            self.item_dropped_count,
            self.error_count
        )?;
        if let Some(duration) = self.duration() {
            write!(
                f,
                ", {:.2} req/s, {:.2}s elapsed",
                self.requests_per_second().unwrap_or(0.0),
                duration.as_secs_f64()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arachne_core::stats::Stats;

    #[test]
    fn test_summary_from_snapshot() {
        let stats = Stats::new();
        stats.inc_by("fetcher/request_count", 4);
        stats.inc_by("response_received_count", 3);
        stats.inc("item_scraped_count");
        stats.inc("SpiderError/Transport");
        stats.inc_by("SpiderError/Parse", 2);

        let start = Instant::now();
        let summary = EngineStats::from_snapshot(
            stats.snapshot(),
            Some(start),
            Some(start + Duration::from_secs(2)),
        );

        assert_eq!(summary.request_count, 4);
        assert_eq!(summary.response_count, 3);
        assert_eq!(summary.item_count, 1);
        assert_eq!(summary.error_count, 3);
        assert_eq!(summary.duration(), Some(Duration::from_secs(2)));
        assert_eq!(summary.requests_per_second(), Some(2.0));
    }
}
