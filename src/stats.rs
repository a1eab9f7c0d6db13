//! # Statistics Records
//!
//! A full reload may persist one stat record: live object counts per type and
//! namespace, the engine metrics, and a resource sample of the host and of
//! this process. Records are rate-limited by `stat_interval_secs`.
//!
//! ```text
//! StatBody
//! ├── counts     [(type, namespace, count)]
//! ├── engine     EngineMetrics
//! └── resources  cpu / memory (system) + cpu / memory (process)
//! ```

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::engine::EngineMetrics;

/// Live objects of one type in one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCount {
    pub type_name: String,
    pub namespace: String,
    pub count: usize,
}

/// Host and process resource sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_count: usize,
    /// Global CPU usage; the first sample of a process reads as zero.
    pub cpu_usage_percent: f32,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_available_bytes: u64,
    pub process_id: u32,
    /// Resident memory of this process, if the OS reported it.
    pub process_memory_bytes: Option<u64>,
    pub process_cpu_percent: Option<f32>,
}

/// JSON body of a persisted [`StatRecord`](crate::StatRecord).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatBody {
    pub counts: Vec<TypeCount>,
    pub engine: EngineMetrics,
    pub resources: ResourceMetrics,
}

/// Samples CPU and memory for the host and this process.
///
/// Blocking: enumerates processes. Call it off the async runtime.
pub fn collect_resource_metrics() -> ResourceMetrics {
    let mut system = System::new_all();
    system.refresh_all();

    let process_id = std::process::id();
    let process = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| system.process(pid));

    ResourceMetrics {
        cpu_count: system.cpus().len(),
        cpu_usage_percent: system.global_cpu_usage(),
        memory_total_bytes: system.total_memory(),
        memory_used_bytes: system.used_memory(),
        memory_available_bytes: system.available_memory(),
        process_id,
        process_memory_bytes: process.map(|p| p.memory()),
        process_cpu_percent: process.map(|p| p.cpu_usage()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_this_process() {
        let metrics = collect_resource_metrics();
        assert_eq!(metrics.process_id, std::process::id());
        assert!(metrics.memory_total_bytes > 0);
        assert!(metrics.memory_used_bytes <= metrics.memory_total_bytes);
        assert!(metrics.process_memory_bytes.map_or(true, |m| m > 0));
    }
}
