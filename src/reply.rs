//! Reply tracking.
//!
//! Sending a method call creates a [`ReplyTracker`] that lives on the
//! *callee's* reply list until the reply is delivered, the deadline
//! elapses, the call is canceled, or either side disconnects. Synchronous
//! callers block on their own wait queue until the tracker is resolved; a
//! tracker left behind by an interrupted wait stays on the list, flagged,
//! so a restarted call with the same cookie can adopt it instead of
//! queueing a second copy.

use std::{
    sync::{
        atomic::Ordering,
        Arc, Weak,
    },
    thread,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    connection::Connection,
    error::{Error, Result},
    limits,
    message::{Msg, MsgFlags},
    queue::QueueEntry,
    time,
};

#[derive(Debug)]
pub(crate) struct ReplyState {
    /// A synchronous caller is parked on this tracker.
    pub(crate) waiting: bool,
    /// The caller's wait was interrupted; the tracker survives for
    /// re-adoption by a restarted call.
    pub(crate) interrupted: bool,
    pub(crate) deadline_ns: u64,
    /// Outcome handed to the synchronous waiter.
    pub(crate) err: Result<()>,
    /// For synchronous handoff, the reply record destined for the
    /// caller's pool, bypassing the queue.
    pub(crate) queue_entry: Option<QueueEntry>,
}

/// One outstanding method call awaiting its reply.
#[derive(Debug)]
pub(crate) struct ReplyTracker {
    /// The original caller; the reply will land there.
    reply_dst: Arc<Connection>,
    /// Cookie of the original call.
    cookie: u64,
    /// Id of the well-known name the call was addressed to, or 0.
    name_id: u64,
    sync: bool,
    pub(crate) inner: Mutex<ReplyState>,
}

impl ReplyTracker {
    /// Create a tracker charged against the caller's pending-request
    /// budget.
    pub(crate) fn new(
        reply_dst: &Arc<Connection>,
        msg: &Msg,
        name_id: u64,
    ) -> Result<Arc<Self>> {
        let pending = reply_dst.reply_count().fetch_add(1, Ordering::SeqCst) + 1;
        if pending > limits::CONN_MAX_REQUESTS_PENDING {
            reply_dst.reply_count().fetch_sub(1, Ordering::SeqCst);
            return Err(Error::TooManyLinks);
        }
        let sync = msg.flags.contains(MsgFlags::SyncReply);
        Ok(Arc::new(Self {
            reply_dst: reply_dst.clone(),
            cookie: msg.cookie,
            name_id,
            sync,
            inner: Mutex::new(ReplyState {
                waiting: sync,
                interrupted: false,
                deadline_ns: msg.timeout_ns,
                err: Ok(()),
                queue_entry: None,
            }),
        }))
    }

    pub(crate) fn reply_dst(&self) -> &Arc<Connection> {
        &self.reply_dst
    }

    pub(crate) fn cookie(&self) -> u64 {
        self.cookie
    }

    pub(crate) fn name_id(&self) -> u64 {
        self.name_id
    }

    pub(crate) fn is_sync(&self) -> bool {
        self.sync
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.inner.lock().waiting
    }

    /// Resolve the tracker and wake its synchronous waiter. The caller is
    /// responsible for unlinking it from the reply list.
    pub(crate) fn wake(&self, err: Result<()>) {
        {
            let mut inner = self.inner.lock();
            inner.waiting = false;
            inner.err = err;
        }
        self.reply_dst.wake();
    }
}

impl Drop for ReplyTracker {
    fn drop(&mut self) {
        self.reply_dst.reply_count().fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct WorkerState {
    deadline_ns: Option<u64>,
    stop: bool,
}

#[derive(Debug, Default)]
struct WorkerShared {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

/// The delayed worker scanning a connection's reply list for expired
/// deadlines. One per connection.
#[derive(Debug, Default)]
pub(crate) struct TimeoutWorker {
    shared: Arc<WorkerShared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimeoutWorker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawn the worker thread. Holding only a weak reference keeps the
    /// worker from pinning the connection alive.
    pub(crate) fn start(&self, conn: Weak<Connection>) {
        let shared = self.shared.clone();
        let handle = thread::spawn(move || loop {
            {
                let mut state = shared.state.lock();
                loop {
                    if state.stop {
                        return;
                    }
                    match state.deadline_ns {
                        None => shared.cond.wait(&mut state),
                        Some(ns) if ns <= time::monotonic_ns() => {
                            state.deadline_ns = None;
                            break;
                        }
                        Some(ns) => {
                            let _ = shared
                                .cond
                                .wait_until(&mut state, time::ns_to_instant(ns));
                        }
                    }
                }
            }
            match conn.upgrade() {
                Some(conn) => conn.reply_timeout_scan(),
                None => return,
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Arm (or tighten) the wakeup deadline.
    pub(crate) fn schedule(&self, at_ns: u64) {
        let mut state = self.shared.state.lock();
        state.deadline_ns = Some(match state.deadline_ns {
            Some(cur) => cur.min(at_ns),
            None => at_ns,
        });
        self.shared.cond.notify_one();
    }

    /// Run the scan as soon as possible.
    pub(crate) fn schedule_now(&self) {
        self.schedule(0);
    }

    /// Stop the worker and wait for it to exit.
    pub(crate) fn cancel_sync(&self) {
        self.cancel_async();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Stop the worker without waiting. Safe to call from the worker's
    /// own call stack.
    pub(crate) fn cancel_async(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
        }
        self.shared.cond.notify_one();
    }
}
