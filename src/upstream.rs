//! Per-job reply channel from one worker invocation back to the client.
//!
//! Worker threads feed [`write`](ResponseStream::write) /
//! [`error`](ResponseStream::error) / [`close`](ResponseStream::close); each
//! valid chunk is reframed with the captured exec header and emitted as a
//! non-terminal reply frame. A one-way completion latch guarantees exactly
//! one terminal emission per block-mode job no matter how the worker ends:
//! clean close, runtime error, crash, or garbage output.

use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};
use tracing::{error, info};

use crate::codec;
use crate::node::{Command, CommandFlags, ReplySink};
use crate::runtime::ResponseStream;
use crate::sph::{SPH_SIZE, Sph};

pub type Deleter = Box<dyn Fn() + Send + Sync>;

/// Reply sink for one exec transaction.
pub struct Upstream {
    conn: Arc<dyn ReplySink>,
    sph: Sph,
    event: String,
    deleter: Deleter,
    state: Mutex<State>,
}

struct State {
    completed: bool,
    error: i32,
    cmd: Command,
}

impl Upstream {
    /// `sph` is the inbound header after the dispatcher's `src_key`/`src`
    /// rewrite; `cmd` is a by-value copy of the originating command.
    pub fn new(
        conn: Arc<dyn ReplySink>,
        cmd: Command,
        sph: Sph,
        event: String,
        deleter: Deleter,
    ) -> Self {
        Self {
            conn,
            sph,
            event,
            deleter,
            state: Mutex::new(State {
                completed: false,
                error: 0,
                cmd,
            }),
        }
    }

    /// Emit one frame under the completion latch.
    ///
    /// Once latched, everything that arrives afterwards is absorbed, so each
    /// block-mode job produces exactly one terminal emission. Empty payloads
    /// on non-block requests produce no client-visible output at all; their
    /// ack duty stays with the node's outer loop.
    pub fn reply(&self, completed: bool, payload: &[u8]) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.completed {
            return;
        }
        state.completed = completed;

        if !self.sph.flags.src_block() && payload.is_empty() {
            return;
        }

        if !payload.is_empty() {
            if completed {
                state.cmd.flags.remove(CommandFlags::NEED_ACK);
            }
            if let Err(err) = self.conn.send_reply(&state.cmd, payload, !completed) {
                error!(source = "srw", app = %self.event, %err, "reply send failed");
            }
        } else if completed {
            state.cmd.flags.insert(CommandFlags::NEED_ACK);
            if let Err(err) = self.conn.send_ack(&state.cmd, state.error) {
                error!(source = "srw", app = %self.event, %err, "ack send failed");
            }
        }
    }

    /// Latch without emitting anything. Used when the enqueue step fails
    /// after the job-table insert: the standard ack path still owns this
    /// command and will carry the error exactly once.
    pub(crate) fn abandon(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.completed = true;
        }
    }

    fn record_error(&self, code: i32) {
        if let Ok(mut state) = self.state.lock() {
            state.error = -code;
        }
    }
}

impl ResponseStream for Upstream {
    /// Decode the worker chunk, reframe it with the captured header, and
    /// emit a non-terminal reply. Undecodable or non-string output latches
    /// the job with a terminal `EINVAL` ack.
    fn write(&self, chunk: &[u8]) {
        let payload = match codec::decode_chunk(chunk) {
            Ok(payload) => payload,
            Err(err) => {
                error!(source = "srw", app = %self.event, %err, "unable to unpack worker response");
                self.record_error(libc::EINVAL);
                self.reply(true, &[]);
                return;
            }
        };

        let mut sph = self.sph;
        sph.event_size = self.event.len() as u64;
        sph.data_size = payload.len() as u64;

        let mut buf = BytesMut::with_capacity(SPH_SIZE + self.event.len() + payload.len());
        sph.encode_into(&mut buf);
        buf.put_slice(self.event.as_bytes());
        buf.put_slice(&payload);

        self.reply(false, &buf);
    }

    /// Normal end of the worker stream: the terminal ack carries the last
    /// recorded error code (0 on a clean run), then the job-table entry goes.
    fn close(&self) {
        info!(source = "srw", app = %self.event, "job completed");
        self.reply(true, &[]);
        (self.deleter)();
    }

    /// Failures do not terminate the stream by themselves; the code rides
    /// along in the ack the subsequent `close` emits.
    fn error(&self, code: i32, message: &str) {
        self.record_error(code);
        error!(source = "srw", app = %self.event, code, "{message}");
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        // Shutdown path: whoever dropped the last reference still owes the
        // client its terminal ack. Absorbed by the latch in the usual case.
        self.reply(true, &[]);
    }
}
