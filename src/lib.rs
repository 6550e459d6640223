#![forbid(unsafe_code)]

//! Exec dispatch bridge for a distributed key-value storage node.
//!
//! The node's wire protocol carries opaque `application@method` invocations;
//! this crate accepts them, drives a cohabiting worker-pool runtime through
//! the seams in [`runtime`], and threads streamed worker output back to the
//! originating client as a correlated reply stream.
//!
//! The pieces:
//! - [`sph`] — the ABI-fixed exec header and frame codec
//! - [`severity`] — log severity bridging between the node and the runtime
//! - [`upstream`] — the per-job reply channel with its one-way completion latch
//! - [`registry`] — started applications, pool sharding, per-event counters
//! - [`dispatch`] — the dispatcher itself: control verbs, routing, reply fan-in

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod node;
pub mod registry;
pub mod runtime;
pub mod severity;
pub mod sph;
pub mod telemetry;
pub mod upstream;

pub use config::SrwConfig;
pub use dispatch::{SrwCore, exec_raw};
pub use error::DispatchError;
pub use node::{Command, CommandFlags, ReplySink};
pub use registry::{AppEntry, EventCounters, IDLE_TIMEOUT_FLOOR_SECS};
pub use runtime::{
    AppHandle, RequestStream, ResponseStream, RuntimeError, WorkerLogger, WorkerRuntime,
};
pub use severity::{NodeLevel, WorkerLevel, WorkerLogBridge, node_level, worker_level};
pub use sph::{ADDR_SIZE, ExecFrame, ID_SIZE, SPH_SIZE, Sph, SphFlags};
pub use upstream::Upstream;

pub type Result<T> = std::result::Result<T, DispatchError>;
