use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Cancelled,
    Completed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Cancelled => write!(f, "Cancelled"),
            RunStatus::Completed => write!(f, "Completed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: u64,
    pub waves_completed: u64,
}

/// Shared handle for observing and cancelling a run. Cancellation is polled
/// by the wave loop between waves.
#[derive(Debug)]
pub struct RunController {
    cancelled: AtomicBool,
    completed: AtomicBool,
    started_at: DateTime<Utc>,
    waves_completed: AtomicU64,
}

impl RunController {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            started_at: Utc::now(),
            waves_completed: AtomicU64::new(0),
        }
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            info!("Run cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    pub fn record_wave(&self) {
        self.waves_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn waves_completed(&self) -> u64 {
        self.waves_completed.load(Ordering::Relaxed)
    }

    pub fn get_state(&self) -> RunState {
        let status = if self.is_cancelled() {
            RunStatus::Cancelled
        } else if self.completed.load(Ordering::Acquire) {
            RunStatus::Completed
        } else {
            RunStatus::Running
        };

        RunState {
            status,
            started_at: self.started_at,
            elapsed_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            waves_completed: self.waves_completed(),
        }
    }
}

impl Default for RunController {
    fn default() -> Self {
        Self::new()
    }
}
