//! Metrics module for the ingest daemon
//!
//! Provides the pipeline metrics snapshot shared between the scheduler, the workers and
//! the metrics server, with JSON serialization support.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// The job currently occupying one lane
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaneMetrics {
    pub lane: String,
    pub job_id: String,
    /// Entry path relative to the incoming root
    pub entry: String,
    /// Stage of the file currently being worked on
    pub stage: String,
    pub started_unix_ms: i64,
}

/// Snapshot of the pipeline state
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineMetrics {
    /// Time of the last scheduler tick
    pub timestamp_unix_ms: i64,
    pub lanes: Vec<LaneMetrics>,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub published_files: u64,
    /// External invocations that needed more than one attempt, counted per extra attempt
    pub retried_invocations: u64,
}

impl PipelineMetrics {
    pub fn lane_started(&mut self, lane: &str, job_id: &str, entry: &str) {
        self.lanes.retain(|l| l.lane != lane);
        self.lanes.push(LaneMetrics {
            lane: lane.to_string(),
            job_id: job_id.to_string(),
            entry: entry.to_string(),
            stage: "incoming".to_string(),
            started_unix_ms: timestamp_ms(),
        });
    }

    pub fn set_stage(&mut self, job_id: &str, stage: &str) {
        if let Some(lane) = self.lanes.iter_mut().find(|l| l.job_id == job_id) {
            lane.stage = stage.to_string();
        }
    }

    /// Free the lane held by `job_id` and count the outcome.
    pub fn job_finished(&mut self, job_id: &str, succeeded: bool) {
        self.lanes.retain(|l| l.job_id != job_id);
        if succeeded {
            self.completed_jobs += 1;
        } else {
            self.failed_jobs += 1;
        }
    }
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<PipelineMetrics>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(PipelineMetrics::default()))
}

/// Current time in milliseconds since the Unix epoch
pub fn timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_lane_lifecycle() {
        let mut metrics = PipelineMetrics::default();
        metrics.lane_started("fast", "job-1", "movies/A.mkv");
        metrics.lane_started("long", "job-2", "tv/Show");
        metrics.set_stage("job-2", "converting");

        assert_eq!(metrics.lanes.len(), 2);
        assert_eq!(metrics.lanes[1].stage, "converting");

        metrics.job_finished("job-2", false);
        metrics.job_finished("job-1", true);
        assert!(metrics.lanes.is_empty());
        assert_eq!(metrics.completed_jobs, 1);
        assert_eq!(metrics.failed_jobs, 1);
    }

    #[test]
    fn test_lane_restart_replaces_entry() {
        let mut metrics = PipelineMetrics::default();
        metrics.lane_started("fast", "job-1", "movies/A.mkv");
        metrics.lane_started("fast", "job-3", "movies/B.mkv");
        assert_eq!(metrics.lanes.len(), 1);
        assert_eq!(metrics.lanes[0].job_id, "job-3");
    }

    #[test]
    fn test_timestamp_ms() {
        // After Jan 1, 2020
        assert!(timestamp_ms() > 1577836800000);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]
        #[test]
        fn prop_metrics_snapshot_round_trip(
            timestamp in any::<i64>(),
            completed_jobs in any::<u64>(),
            failed_jobs in any::<u64>(),
            published_files in any::<u64>(),
            retried_invocations in any::<u64>(),
            lane_count in 0usize..3,
        ) {
            let lanes: Vec<LaneMetrics> = (0..lane_count).map(|i| LaneMetrics {
                lane: if i == 0 { "fast".to_string() } else { "long".to_string() },
                job_id: format!("job-{}", i),
                entry: format!("movies/Film {}", i),
                stage: "converting".to_string(),
                started_unix_ms: timestamp,
            }).collect();

            let snapshot = PipelineMetrics {
                timestamp_unix_ms: timestamp,
                lanes,
                completed_jobs,
                failed_jobs,
                published_files,
                retried_invocations,
            };

            let json = serde_json::to_string(&snapshot).expect("serialization should succeed");
            let deserialized: PipelineMetrics = serde_json::from_str(&json)
                .expect("deserialization should succeed");

            prop_assert_eq!(snapshot, deserialized);
        }
    }
}
