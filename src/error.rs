//! Dispatch error taxonomy and the node's errno mapping.

use std::io;

use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::sph::SphError;

/// Failures surfaced to the node's command loop.
///
/// The node ABI is errno-valued: [`wire_code`](DispatchError::wire_code)
/// returns the negative errno the caller puts on the ack path. Nothing in
/// this crate panics across the node boundary.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Event name lacks `@`, or the frame itself is malformed.
    #[error("malformed event: {0}")]
    MalformedEvent(#[from] SphError),

    /// User event or `info` targeted at an app that is not started.
    #[error("app {app:?} is not started")]
    UnknownApp { app: String },

    /// Reply frame with no job-table entry.
    #[error("no job {job} to complete")]
    UnknownJob { job: i32 },

    /// `start-multiple-task` profile fails the idle floor.
    #[error("profile for {app:?} rejected: idle-timeout {idle}s is below the {floor}s floor")]
    BadProfile { app: String, idle: i64, floor: i64 },

    /// The runtime refused the enqueue or the request-stream write.
    #[error("queue {queue:?} rejected the request")]
    QueueReject {
        queue: String,
        #[source]
        source: RuntimeError,
    },

    /// Runtime failure outside the enqueue step (app construction, start,
    /// profile fetch).
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Reply transport failed while the dispatcher was emitting a frame.
    #[error("reply send failed")]
    Transport(#[from] io::Error),

    /// Registry state is unusable because a peer thread panicked mid-update.
    #[error("dispatch state poisoned")]
    Poisoned,
}

impl DispatchError {
    /// Negative errno for the node ack path.
    pub fn wire_code(&self) -> i32 {
        match self {
            DispatchError::MalformedEvent(_) => -libc::EINVAL,
            DispatchError::UnknownApp { .. } => -libc::ENOENT,
            DispatchError::UnknownJob { .. } => -libc::ENOENT,
            DispatchError::BadProfile { .. } => -libc::EINVAL,
            DispatchError::QueueReject { .. } => -libc::EXFULL,
            DispatchError::Runtime(_) => -libc::EINVAL,
            DispatchError::Transport(err) => -err.raw_os_error().unwrap_or(libc::EIO),
            DispatchError::Poisoned => -libc::EINVAL,
        }
    }
}
