//! Live metrics for the TUI visualizer.
//!
//! The simulator writes a JSON snapshot to METRICS_PATH after every CPU
//! tick. The viz binary polls this file and re-renders the dashboard.
//! Writes are atomic (write to .tmp then rename) to avoid torn reads.
use serde::{Deserialize, Serialize};

pub const METRICS_PATH: &str = "/tmp/infersim_live.json";

/// Per-app occupancy snapshot: how much of the GPU and VRAM an
/// application currently holds, and how far its task queue has drained.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct AppSnapshot {
    pub app_id: i32,
    pub model_type: String,
    pub sm_count: usize,
    pub running_models: usize,
    pub waiting_models: usize,
    pub queued_tasks: usize,
    pub vram_pages_used: u64,
    pub vram_pages_capacity: u64,
    pub finished: bool,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct LiveMetrics {
    pub cycle: u64,
    pub scheduler_mode: String,
    /// One entry per SM, in id order, `true` while it has a block bound.
    pub sm_active: Vec<bool>,
    pub finished_kernels: usize,
    pub apps_finished: usize,
    pub apps_total: usize,
    pub apps: Vec<AppSnapshot>,
    /// Unix timestamp in ms when this snapshot was written
    pub timestamp_ms: u64,
}

/// Atomically write metrics to METRICS_PATH.
/// Uses a .tmp intermediate file + rename to avoid torn reads by the viz.
pub fn write_metrics(metrics: &LiveMetrics) {
    if let Ok(json) = serde_json::to_string(metrics) {
        let tmp = format!("{}.tmp", METRICS_PATH);
        if std::fs::write(&tmp, &json).is_ok() {
            let _ = std::fs::rename(&tmp, METRICS_PATH);
        }
    }
}

/// Read the latest metrics snapshot. Returns None if the file doesn't exist
/// or can't be parsed (e.g. no simulation has run yet).
pub fn read_metrics() -> Option<LiveMetrics> {
    let data = std::fs::read_to_string(METRICS_PATH).ok()?;
    serde_json::from_str(&data).ok()
}

/// Returns current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_round_trip_through_json() {
        let m = LiveMetrics {
            cycle: 42,
            scheduler_mode: "Barm".to_string(),
            sm_active: vec![true, false, true],
            finished_kernels: 3,
            apps_finished: 1,
            apps_total: 2,
            apps: vec![AppSnapshot {
                app_id: 0,
                model_type: "LeNet".to_string(),
                sm_count: 2,
                running_models: 1,
                waiting_models: 0,
                queued_tasks: 4,
                vram_pages_used: 10,
                vram_pages_capacity: 20,
                finished: false,
            }],
            timestamp_ms: 1000,
        };
        let json = serde_json::to_string(&m).expect("serialize");
        let back: LiveMetrics = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.cycle, 42);
        assert_eq!(back.apps.len(), 1);
    }
}
