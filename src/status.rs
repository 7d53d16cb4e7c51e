use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// Shared view of what the execution loop is doing. Cloning shares state.
#[derive(Clone, Default)]
pub struct ExecutorStatus {
    inner: Arc<Mutex<ExecutorStatusData>>,
}

#[derive(Default)]
struct ExecutorStatusData {
    phase: String,
    entry_cycles: u64,
    monitor_cycles: u64,
    orders_sent: u64,
    orders_failed: u64,
    last_cycle_at: Option<DateTime<Utc>>,
    halt_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorStatusSnapshot {
    pub phase: String,
    pub entry_cycles: u64,
    pub monitor_cycles: u64,
    pub orders_sent: u64,
    pub orders_failed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub halt_reason: Option<String>,
}

impl ExecutorStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ExecutorStatusData {
                phase: "Initializing".to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn set_phase<S: Into<String>>(&self, phase: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
        }
    }

    pub fn entry_cycle_finished(&self, at: DateTime<Utc>) -> u64 {
        if let Ok(mut data) = self.inner.lock() {
            data.entry_cycles += 1;
            data.last_cycle_at = Some(at);
            data.entry_cycles
        } else {
            0
        }
    }

    pub fn monitor_cycle_finished(&self, at: DateTime<Utc>) {
        if let Ok(mut data) = self.inner.lock() {
            data.monitor_cycles += 1;
            data.last_cycle_at = Some(at);
        }
    }

    pub fn order_sent(&self) {
        if let Ok(mut data) = self.inner.lock() {
            data.orders_sent += 1;
        }
    }

    pub fn order_failed(&self) {
        if let Ok(mut data) = self.inner.lock() {
            data.orders_failed += 1;
        }
    }

    /// Records the current halt. Returns true when the reason changed.
    pub fn set_halt_reason(&self, reason: Option<String>) -> bool {
        if let Ok(mut data) = self.inner.lock() {
            if data.halt_reason == reason {
                return false;
            }
            data.halt_reason = reason;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> ExecutorStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            ExecutorStatusSnapshot {
                phase: data.phase.clone(),
                entry_cycles: data.entry_cycles,
                monitor_cycles: data.monitor_cycles,
                orders_sent: data.orders_sent,
                orders_failed: data.orders_failed,
                last_cycle_at: data.last_cycle_at,
                halt_reason: data.halt_reason.clone(),
            }
        } else {
            ExecutorStatusSnapshot {
                phase: "Status unavailable".to_string(),
                entry_cycles: 0,
                monitor_cycles: 0,
                orders_sent: 0,
                orders_failed: 0,
                last_cycle_at: None,
                halt_reason: None,
            }
        }
    }
}
