//! Memory and reader-count observability line.

use crate::context::SupervisorContext;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// A point-in-time resource snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub supervisor_mb: Option<f64>,
    pub workload_mb: Option<f64>,
    pub active_readers: usize,
}

fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

/// Sample resident memory of the supervisor and (if given) the workload leader.
pub fn sample(ctx: &SupervisorContext, workload_pid: Option<u32>) -> Usage {
    let own = sysinfo::get_current_pid().ok();
    let workload = workload_pid.map(Pid::from_u32);
    let pids: Vec<Pid> = own.into_iter().chain(workload).collect();

    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&pids),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    let rss = |pid: Option<Pid>| {
        pid.and_then(|p| system.process(p))
            .map(|p| to_mb(p.memory()))
    };

    Usage {
        supervisor_mb: rss(own),
        workload_mb: rss(workload),
        active_readers: ctx.active_readers(),
    }
}

/// Sample and log usage at `info`.
pub fn log_usage(ctx: &SupervisorContext, workload_pid: Option<u32>) -> Usage {
    let usage = sample(ctx, workload_pid);
    match usage.supervisor_mb {
        Some(mb) => tracing::info!(
            supervisor_mb = mb,
            workload_mb = ?usage.workload_mb,
            active_readers = usage.active_readers,
            "memory usage: {mb:.2} MB, active readers: {}",
            usage.active_readers
        ),
        None => tracing::warn!(
            active_readers = usage.active_readers,
            "could not read supervisor memory usage"
        ),
    }
    usage
}
