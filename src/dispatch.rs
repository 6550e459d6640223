//! Exec dispatch: event parsing, control verbs, worker routing, reply fan-in.
//!
//! A single coarse lock covers the app map and the job table so insert,
//! lookup, erase, and app removal cannot race each other. The lock is never
//! held across a call into the runtime or a network send; the runtime has
//! locks of its own and the ordering between the two must stay one-way.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tracing::{debug, error, info};

use crate::config::SrwConfig;
use crate::error::DispatchError;
use crate::node::{Command, CommandFlags, ReplySink};
use crate::registry::{AppEntry, IDLE_TIMEOUT_FLOOR_SECS, PoolProfile};
use crate::runtime::{ResponseStream, RuntimeError, WorkerRuntime};
use crate::sph::{self, ExecFrame, Sph};
use crate::upstream::Upstream;

const START_TASK: &str = "start-task";
const START_MULTIPLE_TASK: &str = "start-multiple-task";
const STOP_TASK: &str = "stop-task";
const INFO: &str = "info";

struct CoreState {
    apps: BTreeMap<String, Arc<AppEntry>>,
    jobs: BTreeMap<i32, Arc<Upstream>>,
}

/// Node-singleton dispatch state: the app registry, the job table, and the
/// monotonic `src_key` allocator. Owned by the node as a plain value; every
/// entry point takes it by reference.
pub struct SrwCore {
    config: SrwConfig,
    runtime: Arc<dyn WorkerRuntime>,
    state: Arc<Mutex<CoreState>>,
    next_src_key: AtomicI32,
}

impl SrwCore {
    pub fn new(config: SrwConfig, runtime: Arc<dyn WorkerRuntime>) -> Self {
        Self {
            config,
            runtime,
            state: Arc::new(Mutex::new(CoreState {
                apps: BTreeMap::new(),
                jobs: BTreeMap::new(),
            })),
            next_src_key: AtomicI32::new(1),
        }
    }

    /// Handle one inbound exec frame arriving on `conn`.
    ///
    /// Control verbs mutate the registry, reply frames fan back into their
    /// job's upstream, and anything else is routed into the app's worker
    /// pool. On success with `SRC_BLOCK` set the command's `NEED_ACK` flag
    /// is cleared: the upstream's terminal frame takes over ack duty.
    pub fn process(
        &self,
        conn: &Arc<dyn ReplySink>,
        cmd: &mut Command,
        raw: &[u8],
    ) -> Result<(), DispatchError> {
        let mut frame = ExecFrame::parse(raw)?;
        let (app, method) = match sph::split_event(&frame.event) {
            Ok((app, method)) => (app.to_string(), method.to_string()),
            Err(err) => {
                error!(
                    source = "srw",
                    id = %sph::short_id(&cmd.id),
                    src = %sph::short_id(&frame.sph.src),
                    event = %frame.event,
                    "invalid event name: must be application@event or application@start-task"
                );
                return Err(err.into());
            }
        };

        match method.as_str() {
            START_TASK => self.start_app(cmd, &frame, &app, false),
            START_MULTIPLE_TASK => self.start_app(cmd, &frame, &app, true),
            STOP_TASK => self.stop_app(cmd, &app),
            INFO => self.app_info(conn, cmd, &frame, &app),
            _ if frame.sph.flags.is_reply_or_finish() => {
                self.fan_reply(cmd, &mut frame, &app, &method)
            }
            _ => self.route(conn, cmd, frame, &app, &method),
        }
    }

    /// Jobs currently waiting for worker output.
    pub fn inflight_jobs(&self) -> usize {
        self.lock_state().map(|state| state.jobs.len()).unwrap_or(0)
    }

    /// Whether `app` is present in the registry (and therefore started).
    pub fn is_started(&self, app: &str) -> bool {
        self.lock_state()
            .map(|state| state.apps.contains_key(app))
            .unwrap_or(false)
    }

    fn start_app(
        &self,
        cmd: &Command,
        frame: &ExecFrame,
        app: &str,
        multiple: bool,
    ) -> Result<(), DispatchError> {
        let id = sph::short_id(&cmd.id);

        {
            let state = self.lock_state()?;
            if state.apps.contains_key(app) {
                info!(source = "srw", %id, app, event = %frame.event, "was already started");
                return Ok(());
            }
        }

        // Runtime calls run without the registry lock: app construction and
        // the profile fetch both block on the runtime's own machinery.
        let handle = self.runtime.app(app, app)?;
        let mut entry = AppEntry::new(app, handle);

        if multiple {
            let profile = self.runtime.profile(app)?;
            let pool = PoolProfile::from_value(&profile);
            info!(
                source = "srw",
                %id,
                app,
                event = %frame.event,
                idle = pool.idle_timeout,
                floor = IDLE_TIMEOUT_FLOOR_SECS,
                workers = pool.pool_limit,
                "multiple start"
            );

            if !pool.idle_acceptable() {
                error!(
                    source = "srw",
                    %id,
                    app,
                    event = %frame.event,
                    idle = pool.idle_timeout,
                    floor = IDLE_TIMEOUT_FLOOR_SECS,
                    "multiple start: idle must be at least the floor"
                );
                return Err(DispatchError::BadProfile {
                    app: app.to_string(),
                    idle: pool.idle_timeout,
                    floor: IDLE_TIMEOUT_FLOOR_SECS,
                });
            }

            let task_id =
                (!frame.data.is_empty()).then(|| String::from_utf8_lossy(&frame.data).into_owned());
            entry = entry.with_pool(pool.pool_limit, task_id);
        }

        entry.handle().start()?;
        let entry = Arc::new(entry);

        let mut state = self.lock_state()?;
        if state.apps.contains_key(app) {
            // A concurrent start won the race; our entry stops on drop.
            info!(source = "srw", %id, app, event = %frame.event, "was already started");
            return Ok(());
        }
        state.apps.insert(app.to_string(), entry);
        drop(state);

        info!(source = "srw", %id, app, event = %frame.event, "started");
        Ok(())
    }

    fn stop_app(&self, cmd: &Command, app: &str) -> Result<(), DispatchError> {
        let removed = {
            let mut state = self.lock_state()?;
            state.apps.remove(app)
        };
        // The entry's drop stops the handle, outside the registry lock.
        drop(removed);

        info!(source = "srw", id = %sph::short_id(&cmd.id), app, "stopped");
        Ok(())
    }

    fn app_info(
        &self,
        conn: &Arc<dyn ReplySink>,
        cmd: &Command,
        frame: &ExecFrame,
        app: &str,
    ) -> Result<(), DispatchError> {
        let id = sph::short_id(&cmd.id);

        let entry = {
            let state = self.lock_state()?;
            state.apps.get(app).cloned()
        };
        let Some(entry) = entry else {
            error!(source = "srw", %id, app, event = %frame.event, "no task");
            return Err(DispatchError::UnknownApp {
                app: app.to_string(),
            });
        };

        let mut document = entry.handle().info();
        let counters = entry.counters_value();
        if let serde_json::Value::Object(map) = &mut document {
            map.insert("counters".to_string(), counters);
        } else {
            document = serde_json::json!({ "info": document, "counters": counters });
        }
        let text = document.to_string();

        let mut reply_sph = Sph::zeroed();
        reply_sph.addr = self.config.local_addr;
        let reply = ExecFrame {
            sph: reply_sph,
            event: frame.event.clone(),
            data: Bytes::from(text.into_bytes()),
        }
        .encode();

        conn.send_reply(cmd, &reply, false)?;
        info!(source = "srw", %id, app, event = %frame.event, "info request complete");
        Ok(())
    }

    fn fan_reply(
        &self,
        cmd: &Command,
        frame: &mut ExecFrame,
        app: &str,
        method: &str,
    ) -> Result<(), DispatchError> {
        let terminal = frame.sph.flags.finish();
        let job = frame.sph.src_key;
        let id = sph::short_id(&cmd.id);
        let src = sph::short_id(&frame.sph.src);

        let upstream = {
            let mut state = self.lock_state()?;
            let Some(upstream) = state.jobs.get(&job).cloned() else {
                error!(
                    source = "srw",
                    %id,
                    %src,
                    event = %frame.event,
                    job,
                    "no job to complete"
                );
                return Err(DispatchError::UnknownJob { job });
            };
            if terminal {
                state.jobs.remove(&job);
            }
            if let Some(entry) = state.apps.get(app) {
                entry.update(method, frame.sph.flags);
            }
            upstream
        };

        frame.sph.addr = self.config.local_addr;
        upstream.reply(terminal, &frame.encode());

        info!(
            source = "srw",
            %id,
            %src,
            event = %frame.event,
            job,
            total_size = frame.event.len() + frame.data.len(),
            finish = terminal,
            "completed"
        );
        Ok(())
    }

    fn route(
        &self,
        conn: &Arc<dyn ReplySink>,
        cmd: &mut Command,
        mut frame: ExecFrame,
        app: &str,
        method: &str,
    ) -> Result<(), DispatchError> {
        let id = sph::short_id(&cmd.id);
        let src = sph::short_id(&frame.sph.src);
        let block = frame.sph.flags.src_block();

        // src_key doubles as the shard-affinity seed; capture the caller's
        // value before the job id overwrite.
        let orig_src_key = frame.sph.src_key;

        if block {
            frame.sph.src_key = self.next_src_key.fetch_add(1, Ordering::Relaxed);
            frame.sph.src = cmd.id;
        }
        let job = frame.sph.src_key;

        let (entry, upstream) = {
            let mut state = self.lock_state()?;
            let Some(entry) = state.apps.get(app).cloned() else {
                error!(source = "srw", %id, %src, event = %frame.event, "no task");
                return Err(DispatchError::UnknownApp {
                    app: app.to_string(),
                });
            };
            entry.update(method, frame.sph.flags);

            let upstream = self.make_upstream(conn, cmd, &frame, block);
            if block {
                // Inserted before enqueue so a reply racing back finds it.
                state.jobs.insert(job, Arc::clone(&upstream));
            }
            (entry, upstream)
        };

        let index = entry.shard_index(orig_src_key);
        let queue = (index != -1).then(|| entry.queue_name(index));
        let queue_label = queue.as_deref().unwrap_or(app);

        let outcome = (|| -> Result<(), RuntimeError> {
            let response: Arc<dyn ResponseStream> = upstream.clone();
            let mut request = entry.handle().enqueue(method, response, queue.as_deref())?;
            request.write(&frame.encode())?;
            // Closed right away so the worker sees end-of-input.
            request.close()
        })();

        if let Err(err) = outcome {
            error!(
                source = "srw",
                %id,
                %src,
                event = %frame.event,
                queue = queue_label,
                src_key_orig = orig_src_key,
                job,
                block,
                %err,
                "enqueue failed"
            );
            if block {
                if let Ok(mut state) = self.state.lock() {
                    state.jobs.remove(&job);
                }
                // NEED_ACK was never cleared; the standard ack path carries
                // the error, so the upstream must not emit a second one.
                upstream.abandon();
            }
            return Err(DispatchError::QueueReject {
                queue: queue_label.to_string(),
                source: err,
            });
        }

        info!(
            source = "srw",
            %id,
            %src,
            event = %frame.event,
            queue = queue_label,
            src_key_orig = orig_src_key,
            job,
            total_size = frame.event.len() + frame.data.len(),
            block,
            "started"
        );

        if block {
            cmd.flags.remove(CommandFlags::NEED_ACK);
        }
        Ok(())
    }

    fn make_upstream(
        &self,
        conn: &Arc<dyn ReplySink>,
        cmd: &Command,
        frame: &ExecFrame,
        block: bool,
    ) -> Arc<Upstream> {
        let conn = Arc::clone(conn);
        let cmd = *cmd;
        let sph = frame.sph;
        let event = frame.event.clone();

        if !block {
            // Never in the job table, nothing to delete.
            return Arc::new(Upstream::new(conn, cmd, sph, event, Box::new(|| {})));
        }

        let state = Arc::downgrade(&self.state);
        let job = sph.src_key;
        let src = sph.src;
        Arc::new_cyclic(|weak: &Weak<Upstream>| {
            let weak = weak.clone();
            let deleter = Box::new(move || {
                let Some(state) = state.upgrade() else {
                    return;
                };
                let Ok(mut state) = state.lock() else {
                    return;
                };
                let ours = state
                    .jobs
                    .get(&job)
                    .map(|entry| Weak::as_ptr(&weak) == Arc::as_ptr(entry));
                match ours {
                    Some(true) => {
                        state.jobs.remove(&job);
                    }
                    // Some other job took the slot after a FINISH erase.
                    Some(false) => {}
                    None => {
                        debug!(
                            source = "srw",
                            src = %sph::short_id(&src),
                            job,
                            "no job to complete"
                        );
                    }
                }
            });
            Upstream::new(conn, cmd, sph, event, deleter)
        })
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, CoreState>, DispatchError> {
        self.state.lock().map_err(|_| DispatchError::Poisoned)
    }
}

/// Node-facing entry point, converting every failure to the node's negative
/// errno convention. `core` is `None` before init or on builds without a
/// worker runtime.
pub fn exec_raw(
    core: Option<&SrwCore>,
    conn: &Arc<dyn ReplySink>,
    cmd: &mut Command,
    raw: &[u8],
) -> i32 {
    let Some(core) = core else {
        return -libc::ENOTSUP;
    };
    match core.process(conn, cmd, raw) {
        Ok(()) => 0,
        Err(err) => {
            error!(
                source = "srw",
                id = %sph::short_id(&cmd.id),
                %err,
                "exec processing failed"
            );
            err.wire_code()
        }
    }
}
