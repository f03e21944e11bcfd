//! Host resource pressure.
//!
//! CPU and memory usage are compared against thresholds each sweep. There
//! is no recovery action; crossing a threshold raises one alert, staying
//! above it raises nothing more until usage has dropped back below. A
//! crossing only counts as reported once [`ResourceGuard::confirm`] is
//! called for its alert; until then every check raises it again.

use sysinfo::System;
use tracing::{info, warn};

use conduit_state::PendingAlert;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Source of resource usage samples.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> ResourceUsage;
}

/// Host usage via `sysinfo`.
pub struct SysinfoProbe {
    sys: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        // CPU usage is a delta between refreshes; prime the first one.
        sys.refresh_cpu_usage();
        Self { sys }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self) -> ResourceUsage {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        let total = self.sys.total_memory() as f32;
        let used = self.sys.used_memory() as f32;
        ResourceUsage {
            cpu_percent: self.sys.global_cpu_info().cpu_usage(),
            memory_percent: if total > 0.0 { used / total * 100.0 } else { 0.0 },
        }
    }
}

/// Threshold-crossing detector over a [`ResourceProbe`].
pub struct ResourceGuard {
    probe: Box<dyn ResourceProbe>,
    cpu_breached: bool,
    memory_breached: bool,
}

impl ResourceGuard {
    pub fn new(probe: Box<dyn ResourceProbe>) -> Self {
        Self {
            probe,
            cpu_breached: false,
            memory_breached: false,
        }
    }

    /// Sample usage and return alerts for thresholds crossed and not yet
    /// confirmed.
    pub fn check(&mut self, cpu_threshold: f32, memory_threshold: f32, now: u64) -> Vec<PendingAlert> {
        let usage = self.probe.sample();
        let mut alerts = Vec::new();
        if let Some(alert) = crossing(
            "cpu",
            "CPU",
            usage.cpu_percent,
            cpu_threshold,
            &mut self.cpu_breached,
            now,
        ) {
            alerts.push(alert);
        }
        if let Some(alert) = crossing(
            "memory",
            "Memory",
            usage.memory_percent,
            memory_threshold,
            &mut self.memory_breached,
            now,
        ) {
            alerts.push(alert);
        }
        alerts
    }

    /// Mark the crossing behind `alert` as delivered to the outbox.
    pub fn confirm(&mut self, alert: &PendingAlert) {
        match alert.condition.as_str() {
            "resource:cpu" => self.cpu_breached = true,
            "resource:memory" => self.memory_breached = true,
            other => warn!(condition = other, "not a resource alert"),
        }
    }
}

fn crossing(
    key: &str,
    label: &str,
    value: f32,
    threshold: f32,
    breached: &mut bool,
    now: u64,
) -> Option<PendingAlert> {
    let above = value >= threshold;
    if above == *breached {
        return None;
    }
    if !above {
        *breached = false;
        info!(resource = key, usage = value, threshold, "resource usage back below threshold");
        return None;
    }
    warn!(resource = key, usage = value, threshold, "resource usage above threshold");
    Some(PendingAlert {
        condition: format!("resource:{key}"),
        message: format!("{label} usage is {value:.1}% (threshold {threshold:.0}%)"),
        raised_at: now,
    })
}
