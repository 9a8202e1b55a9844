//! Execution profiler backing the `/profiling/*` endpoints

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::views::{ExecutionSample, ProfilingStats};

/// Samples kept for percentile computation
const DEFAULT_WINDOW: usize = 1024;

struct ProfilerState {
    samples: VecDeque<ExecutionSample>,
    total_executions: u64,
    failures: u64,
}

/// Bounded ring buffer of strategy execution timings
pub struct ExecutionProfiler {
    window: usize,
    state: Mutex<ProfilerState>,
}

impl Default for ExecutionProfiler {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl ExecutionProfiler {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            state: Mutex::new(ProfilerState {
                samples: VecDeque::with_capacity(window),
                total_executions: 0,
                failures: 0,
            }),
        }
    }

    pub fn record(&self, name: &str, duration: Duration, success: bool) {
        let sample = ExecutionSample {
            name: name.to_string(),
            started_at: Some(
                Utc::now()
                    - chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero()),
            ),
            duration_us: duration.as_micros().min(u64::MAX as u128) as u64,
            success,
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.total_executions += 1;
        if !success {
            state.failures += 1;
        }
        if state.samples.len() == self.window {
            state.samples.pop_front();
        }
        state.samples.push_back(sample);
    }

    /// Time `f` and record it under `name`; `Err` results count as failures
    pub fn time<T, E>(&self, name: &str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let start = Instant::now();
        let result = f();
        self.record(name, start.elapsed(), result.is_ok());
        result
    }

    /// Most recent samples, newest first
    pub fn recent(&self, limit: usize) -> Vec<ExecutionSample> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.samples.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> Option<ProfilingStats> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.samples.is_empty() {
            return None;
        }

        let mut durations: Vec<u64> = state.samples.iter().map(|s| s.duration_us).collect();
        durations.sort_unstable();
        let sum: u128 = durations.iter().map(|&d| d as u128).sum();

        Some(ProfilingStats {
            total_executions: state.total_executions,
            window_size: durations.len(),
            failures: state.failures,
            mean_us: (sum / durations.len() as u128) as u64,
            min_us: durations[0],
            max_us: durations[durations.len() - 1],
            p50_us: percentile(&durations, 50),
            p95_us: percentile(&durations, 95),
            p99_us: percentile(&durations, 99),
        })
    }
}

/// Nearest-rank percentile over sorted input
fn percentile(sorted: &[u64], pct: usize) -> u64 {
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}
