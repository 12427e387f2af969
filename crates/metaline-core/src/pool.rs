//! Bounded-queue worker pool over framed channels.
//!
//! A pool owns a set of long-lived worker threads, each connected to the
//! parent through a [`Channel`]. Requests and replies are JSON values; on the
//! wire a request is the serialized value and a reply is wrapped as
//! `{"r": <value>}`. The parent is single-threaded with respect to pool
//! state: submission, dispatch, and result collection all happen on the
//! caller's thread. Results are not returned in submit order; a slower
//! worker may reply after a later-submitted request.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{Value, json};

use crate::channel::{Channel, ChannelError};

/// Default bound on the pending request queue.
pub const DEFAULT_MAX_QUEUE: usize = 8;

/// Sleep between dispatch cycles while waiting for workers.
const POLL_WAIT: Duration = Duration::from_millis(10);

/// Readiness-wait while draining; sub-second so shutdown stays responsive.
const SELECT_WAIT: Duration = Duration::from_millis(200);

/// Job function executed by workers.
pub type RunFn = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;

/// Optional per-worker initializer, executed once before the request loop.
pub type InitFn = Arc<dyn Fn() + Send + Sync>;

/// Error a job function can return to terminate its worker with a specific
/// exit code, mirroring a child process calling `exit(code)`.
#[derive(Debug)]
pub struct WorkerExit(pub i32);

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker requested exit with code {}", self.0)
    }
}

impl std::error::Error for WorkerExit {}

/// Fatal pool error.
#[derive(Debug)]
pub enum PoolError {
    /// A pool-owned worker terminated abnormally.
    WorkerDied { worker: u32, code: i32 },
    /// The parent side of a channel failed.
    Channel(ChannelError),
    /// A request or reply did not serialize/deserialize.
    Codec(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkerDied { worker, code } => {
                write!(f, "worker {worker} died with exit code {code}")
            }
            Self::Channel(e) => write!(f, "pool channel failure: {e}"),
            Self::Codec(msg) => write!(f, "pool codec failure: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Process-wide table of worker id → exit code.
///
/// Workers record their termination here before their channel closes, so the
/// parent's next dispatch cycle sees the code no matter which side it
/// observes first. Entries for workers not owned by the consulting pool are
/// left in place as recoverable metadata.
fn exit_table() -> &'static Mutex<HashMap<u32, i32>> {
    static TABLE: LazyLock<Mutex<HashMap<u32, i32>>> =
        LazyLock::new(|| Mutex::new(HashMap::new()));
    &TABLE
}

/// Record a worker termination.
pub fn record_exit(worker: u32, code: i32) {
    exit_table().lock().unwrap().insert(worker, code);
}

/// Look up a recorded exit code without consuming it.
pub fn recorded_exit(worker: u32) -> Option<i32> {
    exit_table().lock().unwrap().get(&worker).copied()
}

fn take_recorded_exit(worker: u32) -> Option<i32> {
    exit_table().lock().unwrap().remove(&worker)
}

static NEXT_WORKER_ID: AtomicU32 = AtomicU32::new(1);

struct WorkerSlot {
    id: u32,
    channel: Channel,
    active: bool,
    handle: Option<JoinHandle<()>>,
}

/// Parallel dispatcher fanning requests out to worker threads.
pub struct WorkerPool {
    id: String,
    slots: Vec<WorkerSlot>,
    pending: VecDeque<Value>,
    results: Vec<Value>,
    max_queue: usize,
    run: RunFn,
}

impl WorkerPool {
    /// Spawn `workers` threads, each running `init` once (when given) and
    /// then the request loop. With `workers == 0` the pool is degenerate:
    /// requests execute synchronously on the submitter, in submit order.
    pub fn new(
        id: impl Into<String>,
        workers: usize,
        max_queue: usize,
        run: RunFn,
        init: Option<InitFn>,
    ) -> io::Result<Self> {
        let id = id.into();
        let mut slots = Vec::with_capacity(workers);
        for _ in 0..workers {
            let wid = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
            let (parent, child) = Channel::pair()?;
            let run = run.clone();
            let init = init.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{id}-worker-{wid}"))
                .spawn(move || worker_main(wid, child, run, init))?;
            slots.push(WorkerSlot {
                id: wid,
                channel: parent,
                active: false,
                handle: Some(handle),
            });
        }
        log::debug!("pool {id}: {workers} workers, queue bound {max_queue}");
        Ok(Self {
            id,
            slots,
            pending: VecDeque::new(),
            results: Vec::new(),
            max_queue,
            run,
        })
    }

    /// Submit a request, waiting while the pending queue is full.
    pub fn add_request(&mut self, request: Value) -> Result<(), PoolError> {
        if self.slots.is_empty() {
            let reply = (self.run)(request).map_err(|e| PoolError::WorkerDied {
                worker: 0,
                code: exit_code_of(&e),
            })?;
            self.results.push(reply);
            return Ok(());
        }

        while self.pending.len() >= self.max_queue {
            self.handle_requests()?;
            if self.pending.len() >= self.max_queue {
                std::thread::sleep(POLL_WAIT);
            }
        }
        self.pending.push_back(request);
        self.handle_requests()
    }

    /// One dispatch cycle: reap dead workers, hand pending requests to idle
    /// slots, poll active slots for replies.
    pub fn handle_requests(&mut self) -> Result<(), PoolError> {
        self.reap()?;

        while !self.pending.is_empty() {
            let Some(slot) = self.slots.iter_mut().find(|s| !s.active) else {
                break;
            };
            let request = self.pending.pop_front().expect("pending checked non-empty");
            let bytes =
                serde_json::to_vec(&request).map_err(|e| PoolError::Codec(e.to_string()))?;
            match slot.channel.send(&bytes) {
                Ok(()) => slot.active = true,
                Err(e) => {
                    // A failed write means the worker went away mid-queue.
                    let code = take_recorded_exit(slot.id).unwrap_or(1);
                    log::error!("pool {}: write to worker {} failed: {e}", self.id, slot.id);
                    return Err(PoolError::WorkerDied {
                        worker: slot.id,
                        code,
                    });
                }
            }
        }

        for slot in &mut self.slots {
            if !slot.active {
                continue;
            }
            match slot.channel.read_nonblocking() {
                Ok(Some(bytes)) => {
                    let reply = unwrap_reply(&bytes)?;
                    slot.active = false;
                    self.results.push(reply);
                }
                Ok(None) => {}
                Err(ChannelError::Closed) => {
                    let code = take_recorded_exit(slot.id).unwrap_or(1);
                    return Err(PoolError::WorkerDied {
                        worker: slot.id,
                        code,
                    });
                }
                Err(e) => return Err(PoolError::Channel(e)),
            }
        }
        Ok(())
    }

    /// Fail the pool if any owned worker has recorded an abnormal exit.
    fn reap(&mut self) -> Result<(), PoolError> {
        for slot in &self.slots {
            if let Some(code) = take_recorded_exit(slot.id) {
                return Err(PoolError::WorkerDied {
                    worker: slot.id,
                    code,
                });
            }
        }
        Ok(())
    }

    /// True iff any worker slot has a request in flight.
    pub fn requests_active(&self) -> bool {
        self.slots.iter().any(|s| s.active)
    }

    /// Number of requests queued but not yet dispatched.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Block until every submitted request has produced a result.
    pub fn wait_until_done(&mut self) -> Result<(), PoolError> {
        loop {
            self.handle_requests()?;
            if self.pending.is_empty() && !self.requests_active() {
                return Ok(());
            }
            // Wait on a busy channel instead of spinning; a timeout just
            // means another dispatch cycle.
            match self.slots.iter().find(|s| s.active) {
                Some(slot) => {
                    let _ = slot.channel.wait_readable(SELECT_WAIT);
                }
                None => std::thread::sleep(POLL_WAIT),
            }
        }
    }

    /// Take all collected results.
    pub fn drain_results(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.results)
    }

    /// Tear the pool down: drop pending requests, close channels (workers
    /// exit on the resulting EOF), and join the threads. Collected results
    /// persist until drained.
    pub fn shutdown(&mut self) {
        self.pending.clear();
        for mut slot in self.slots.drain(..) {
            drop(slot.channel);
            if let Some(handle) = slot.handle.take() {
                let _ = handle.join();
            }
            take_recorded_exit(slot.id);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn exit_code_of(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<WorkerExit>().map_or(1, |w| w.0)
}

fn unwrap_reply(bytes: &[u8]) -> Result<Value, PoolError> {
    let mut envelope: Value =
        serde_json::from_slice(bytes).map_err(|e| PoolError::Codec(e.to_string()))?;
    envelope
        .get_mut("r")
        .map(Value::take)
        .ok_or_else(|| PoolError::Codec("reply envelope without \"r\"".into()))
}

fn worker_main(id: u32, mut channel: Channel, run: RunFn, init: Option<InitFn>) {
    if let Some(init) = init {
        init();
    }
    loop {
        let bytes = match channel.read_blocking() {
            Ok(bytes) => bytes,
            // Parent closed its end: normal tear-down.
            Err(ChannelError::Closed) => return,
            Err(e) => {
                log::error!("worker {id}: channel read failed: {e}");
                record_exit(id, 1);
                return;
            }
        };
        let request: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                log::error!("worker {id}: bad request frame: {e}");
                record_exit(id, 1);
                return;
            }
        };
        match panic::catch_unwind(AssertUnwindSafe(|| run(request))) {
            Ok(Ok(reply)) => {
                let Ok(frame) = serde_json::to_vec(&json!({ "r": reply })) else {
                    record_exit(id, 1);
                    return;
                };
                if channel.send(&frame).is_err() {
                    // Parent gone; nothing left to report to.
                    return;
                }
            }
            Ok(Err(e)) => {
                let code = exit_code_of(&e);
                log::error!("worker {id}: job failed: {e:#}");
                record_exit(id, code);
                return;
            }
            Err(_) => {
                log::error!("worker {id}: job panicked");
                record_exit(id, 101);
                return;
            }
        }
    }
}
