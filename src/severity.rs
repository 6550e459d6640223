//! Log severity bridging between the node and the worker runtime.
//!
//! The node has an extra `notice` level that collapses onto the runtime's
//! `info`; the reverse direction is an identity embedding. Both conversions
//! are total so a record is never dropped on the floor for lack of a level.

use tracing::level_filters::LevelFilter;

use crate::runtime::WorkerLogger;

/// Node-side severities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeLevel {
    Debug,
    Notice,
    Info,
    Warning,
    Error,
}

/// Worker-runtime severities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerLevel {
    Debug,
    Info,
    Warning,
    Error,
}

pub fn worker_level(level: NodeLevel) -> WorkerLevel {
    match level {
        NodeLevel::Debug => WorkerLevel::Debug,
        NodeLevel::Notice | NodeLevel::Info => WorkerLevel::Info,
        NodeLevel::Warning => WorkerLevel::Warning,
        NodeLevel::Error => WorkerLevel::Error,
    }
}

pub fn node_level(level: WorkerLevel) -> NodeLevel {
    match level {
        WorkerLevel::Debug => NodeLevel::Debug,
        WorkerLevel::Info => NodeLevel::Info,
        WorkerLevel::Warning => NodeLevel::Warning,
        WorkerLevel::Error => NodeLevel::Error,
    }
}

/// Routes worker-side log records into the node's tracing pipeline.
///
/// Every record is tagged `source = "srw"` and carries the app name; emission
/// never fails back into the runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerLogBridge;

impl WorkerLogger for WorkerLogBridge {
    fn verbosity(&self) -> WorkerLevel {
        let current = LevelFilter::current();
        if current >= LevelFilter::DEBUG {
            WorkerLevel::Debug
        } else if current >= LevelFilter::INFO {
            WorkerLevel::Info
        } else if current >= LevelFilter::WARN {
            WorkerLevel::Warning
        } else {
            WorkerLevel::Error
        }
    }

    fn emit(&self, level: WorkerLevel, app: &str, message: &str) {
        match node_level(level) {
            NodeLevel::Debug => tracing::debug!(source = "srw", app, "{message}"),
            NodeLevel::Notice | NodeLevel::Info => {
                tracing::info!(source = "srw", app, "{message}");
            }
            NodeLevel::Warning => tracing::warn!(source = "srw", app, "{message}"),
            NodeLevel::Error => tracing::error!(source = "srw", app, "{message}"),
        }
    }
}
