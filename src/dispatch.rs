//! The send path.
//!
//! Resolve the destination, check policy, attach metadata, enqueue, wake
//! the receiver; or, for a reply landing on a synchronous waiter, hand the
//! record straight into the waiter's tracker. Broadcasts fan out under the
//! bus connection map; monitors get a copy of every unicast.

use std::sync::Arc;

use tracing::trace;

use crate::{
    connection::Connection,
    endpoint::Endpoint,
    error::{Error, Result},
    limits,
    message::{Envelope, MsgFlags, DST_BROADCAST, DST_NAME},
    metadata::{AttachFlags, Metadata},
    names::NameLock,
    notify,
    queue::QueueEntry,
    reply::ReplyTracker,
    time,
    util::{lock_rank, LockRank},
};

use event_listener::Listener;

/// Outcome of a send; synchronous calls carry the pool offset of the
/// reply record.
#[derive(Debug, PartialEq)]
pub struct SendReply {
    pub reply_offset: Option<u64>,
}

/// Send `env` from `src` (or from the bus itself when `src` is `None`)
/// through `ep`.
pub(crate) fn send(
    ep: &Arc<Endpoint>,
    src: Option<&Arc<Connection>>,
    env: &mut Envelope,
) -> Result<SendReply> {
    let bus = ep.bus();
    debug_assert_eq!(env.seq, 0, "envelope reused");
    env.seq = bus.next_msg_seq();

    // Connections with impersonated credentials send exactly the frozen
    // snapshot; everything else starts from an empty buffer.
    if let Some(src_conn) = src {
        env.meta = Some(match src_conn.owner_meta() {
            Some(owner) => owner.dup(),
            None => Metadata::new(),
        });
    }

    if env.msg.dst_id == DST_BROADCAST {
        if env.fds > 0 {
            return Err(Error::InvalidArgument(
                "file descriptors are unicast-only",
            ));
        }
        if let Some(filter) = &env.bloom {
            if filter.len() * 8 != bus.bloom().size {
                return Err(Error::InvalidArgument(
                    "bloom filter does not match the bus parameters",
                ));
            }
        }
        broadcast(ep, src, env);
        return Ok(SendReply { reply_offset: None });
    }

    let sync = env.msg.flags.contains(MsgFlags::SyncReply);

    // Keep the registry entry pinned until the message is enqueued, so a
    // name cannot hand over mid-send.
    let mut name_lock: Option<NameLock<'_>> = None;
    let mut name_id = 0;
    let dst: Arc<Connection> = if let Some(name) = env.dst_name.clone() {
        let (lock, resolved) = bus
            .name_registry()
            .resolve_locked(&name)
            .ok_or(Error::NotFound)?;
        name_lock = Some(lock);
        // When both a name and an id are given, the id must match the
        // current owner; this catches sends to a stale id.
        if env.msg.dst_id != DST_NAME
            && resolved.owner.as_ref().map(|c| c.id()) != Some(env.msg.dst_id)
        {
            return Err(Error::ChangedIdentity);
        }
        let dst = match (&resolved.owner, &resolved.activator) {
            (Some(owner), _) => owner.clone(),
            (None, Some(activator)) => activator.clone(),
            (None, None) => return Err(Error::NotFound),
        };
        if env.msg.flags.contains(MsgFlags::NoAutoStart) && dst.is_activator() {
            return Err(Error::AddressNotAvailable);
        }
        name_id = resolved.name_id;
        dst
    } else {
        let dst = bus.find_conn(env.msg.dst_id).ok_or(Error::NotFound)?;
        // Special-purpose connections cannot be addressed by id.
        if !dst.is_ordinary() {
            return Err(Error::NotFound);
        }
        dst
    };
    env.dst_name_id = name_id;

    let mut reply_wait: Option<Arc<ReplyTracker>> = None;
    let mut reply_wake: Option<Arc<ReplyTracker>> = None;
    let mut readopted = false;

    if let Some(src_conn) = src {
        if sync {
            // A restarted call finds its interrupted tracker still queued
            // on the destination and goes back to waiting instead of
            // enqueueing the message a second time.
            let _rank = lock_rank(LockRank::Connection);
            let mut st = dst.state.lock();
            if let Some(pos) = st.find_reply(src_conn, env.msg.cookie) {
                let tracker = st.reply_list[pos].clone();
                let mut inner = tracker.inner.lock();
                if inner.interrupted {
                    inner.interrupted = false;
                    drop(inner);
                    reply_wait = Some(tracker);
                    readopted = true;
                }
            }
        }
        if !readopted {
            attach_metadata(env, src_conn, &dst);
            if env.msg.flags.contains(MsgFlags::ExpectReply) {
                check_access(ep, src_conn, &dst, env, None)?;
                reply_wait = Some(ReplyTracker::new(src_conn, &env.msg, name_id)?);
            } else {
                check_access(ep, src_conn, &dst, env, Some(&mut reply_wake))?;
            }
        }
    }

    if !readopted {
        if let Some(wake) = reply_wake {
            // The reply lands on a synchronous waiter: allocate the
            // record straight into its tracker. The queue never sees it.
            let result = {
                let _rank = lock_rank(LockRank::Connection);
                let _st = dst.state.lock();
                let mut inner = wake.inner.lock();
                let result = if inner.waiting && dst.is_active() {
                    QueueEntry::new(dst.pool(), env).map(|entry| {
                        inner.queue_entry = Some(entry);
                    })
                } else {
                    Err(Error::ConnectionReset)
                };
                inner.waiting = false;
                inner.err = result.clone();
                result
            };
            dst.wake();
            result?;
        } else {
            entry_insert(&dst, src, env, reply_wait.clone())?;
        }
        eavesdrop(ep, src, env);
    }

    drop(name_lock);

    if sync {
        let Some(src_conn) = src else {
            return Ok(SendReply { reply_offset: None });
        };
        let Some(tracker) = reply_wait else {
            return Ok(SendReply { reply_offset: None });
        };
        let reply_offset = wait_reply(src_conn, &dst, &tracker, env.msg.timeout_ns)?;
        return Ok(SendReply { reply_offset });
    }
    Ok(SendReply { reply_offset: None })
}

/// Enqueue a message into `conn`'s receive queue.
pub(crate) fn entry_insert(
    conn: &Arc<Connection>,
    src: Option<&Arc<Connection>>,
    env: &Envelope,
    reply: Option<Arc<ReplyTracker>>,
) -> Result<()> {
    let _rank = lock_rank(LockRank::Connection);
    let mut st = conn.state.lock();

    let src_privileged = src.map(|s| s.creds().privileged()).unwrap_or(true);
    if !src_privileged && st.queue.msg_count > limits::CONN_MAX_MSGS {
        return Err(Error::NoBufferSpace);
    }
    if !conn.is_active() {
        return Err(Error::ConnectionReset);
    }
    if env.fds > 0 && !conn.accepts_fds() {
        return Err(Error::CommunicationError);
    }

    let mut entry = QueueEntry::new(conn.pool(), env)?;
    if let Err(e) = st.queue.charge_user(src.map(|s| s.creds()), &mut entry) {
        conn.pool().free_any(entry.slice);
        return Err(e);
    }

    // Remember the tracker on the entry so an activator handoff can move
    // it along with the message.
    entry.reply = reply.clone();
    if let Some(tracker) = reply {
        let is_sync = tracker.is_sync();
        st.reply_list.push(tracker);
        if !is_sync {
            conn.work.schedule_now();
        }
    }
    st.queue.add(entry);
    drop(st);

    conn.wake();
    Ok(())
}

/// Authorize a send. A message whose `cookie_reply` consumes an
/// outstanding tracker is authorized by that tracker; everything else
/// asks the policy layers.
fn check_access(
    ep: &Arc<Endpoint>,
    src: &Arc<Connection>,
    dst: &Arc<Connection>,
    env: &Envelope,
    reply_wake: Option<&mut Option<Arc<ReplyTracker>>>,
) -> Result<()> {
    if let Some(wake_slot) = reply_wake {
        if env.msg.cookie_reply > 0 {
            let _rank = lock_rank(LockRank::Connection);
            let mut st = src.state.lock();
            if let Some(pos) = st.find_reply(dst, env.msg.cookie_reply) {
                let tracker = st.reply_list.remove(pos);
                if tracker.is_sync() {
                    *wake_slot = Some(tracker);
                }
                return Ok(());
            }
        }
    }
    ep.check_talk_access(src, dst)
}

fn attach_metadata(env: &mut Envelope, src: &Arc<Connection>, dst: &Connection) {
    let mut which = dst.attach_flags();
    // Impersonated identities are frozen; only names and the description
    // may ride along.
    if src.owner_meta().is_some() {
        which &= AttachFlags::Names | AttachFlags::Description;
    }
    let seq = env.seq;
    if let Some(meta) = env.meta.as_mut() {
        meta.append(src, seq, which);
    }
}

fn broadcast(ep: &Arc<Endpoint>, src: Option<&Arc<Connection>>, env: &mut Envelope) {
    let bus = ep.bus();
    let _map_rank = lock_rank(LockRank::ConnMap);
    let map = bus.connections.read();
    for dst in map.conns.values() {
        if dst.id() == env.msg.src_id {
            continue;
        }
        // Activators and policy holders see no broadcasts.
        if !dst.is_ordinary() && !dst.is_monitor() {
            continue;
        }
        if !dst.match_db().matches(src.map(|s| &**s), env) {
            continue;
        }
        if dst.ep().check_notification(dst, env).is_err() {
            continue;
        }
        if let Some(src_conn) = src {
            if dst.ep().check_broadcast(src_conn, dst).is_err() {
                continue;
            }
            if dst.ep().check_src_names(src_conn, dst).is_err() {
                continue;
            }
            // The first receiver asking for extra metadata makes the
            // message carry it; later receivers see it too.
            attach_metadata(env, src_conn, dst);
        }
        if let Err(e) = entry_insert(dst, src, env, None) {
            trace!(dst = dst.id(), error = %e, "skipping broadcast recipient");
        }
    }
}

/// Copy a unicast to every monitor. Delivery errors are swallowed.
fn eavesdrop(ep: &Arc<Endpoint>, src: Option<&Arc<Connection>>, env: &mut Envelope) {
    let bus = ep.bus();
    let _map_rank = lock_rank(LockRank::ConnMap);
    let map = bus.connections.read();
    for monitor in &map.monitors {
        if let Some(src_conn) = src {
            attach_metadata(env, src_conn, monitor);
        }
        if let Err(e) = entry_insert(monitor, None, env, None) {
            trace!(monitor = monitor.id(), error = %e, "monitor delivery failed");
        }
    }
}

/// Park the caller until its tracker resolves, its deadline passes, it is
/// interrupted, or either side dies.
fn wait_reply(
    src: &Arc<Connection>,
    dst: &Arc<Connection>,
    tracker: &Arc<ReplyTracker>,
    timeout_ns: u64,
) -> Result<Option<u64>> {
    let deadline = time::ns_to_instant(timeout_ns);
    let outcome: Result<()> = loop {
        if src.take_interrupt() {
            // Leave the tracker on the destination, flagged, so a
            // restarted call can adopt it; the destination's worker
            // reaps it if no restart arrives before the deadline.
            {
                let _rank = lock_rank(LockRank::Connection);
                let _st = dst.state.lock();
                tracker.inner.lock().interrupted = true;
            }
            dst.work.schedule_now();
            return Err(Error::Interrupted);
        }
        if !tracker.is_waiting() {
            break tracker.inner.lock().err.clone();
        }
        if !src.is_active() {
            break Err(Error::ConnectionReset);
        }
        let listener = src.wait_event().listen();
        if !tracker.is_waiting() || !src.is_active() || src.interrupt_pending() {
            continue;
        }
        if listener.wait_deadline(deadline).is_none() {
            break Err(Error::TimedOut);
        }
    };

    {
        let _rank = lock_rank(LockRank::Connection);
        let mut st = dst.state.lock();
        if let Some(pos) = st.reply_list.iter().position(|r| Arc::ptr_eq(r, tracker)) {
            st.reply_list.remove(pos);
        }
    }
    let entry = {
        let mut inner = tracker.inner.lock();
        inner.waiting = false;
        inner.queue_entry.take()
    };

    let mut outcome = outcome;
    if outcome == Err(Error::TimedOut) {
        notify::reply_timeout(src.bus(), src.id(), tracker.cookie());
        notify::flush(src.bus());
    }

    let mut reply_offset = None;
    if let Some(entry) = entry {
        match &outcome {
            Ok(()) => {
                outcome = entry.install(src.pool());
                reply_offset = Some(entry.slice);
            }
            Err(_) => {
                src.pool().free_any(entry.slice);
            }
        }
    }
    outcome.map(|()| reply_offset)
}
