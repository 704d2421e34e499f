//! Bus-originated notifications.
//!
//! Name transitions, connection arrivals/departures and reply failures
//! are announced as real messages from the synthetic source id
//! [`SRC_BUS`](crate::message::SRC_BUS). Producers queue them on the bus
//! while still holding their locks; [`flush`] dispatches the queue once
//! the locks are gone. Delivery failures are logged and swallowed.

use tracing::warn;

use crate::{
    bus::Bus,
    dispatch,
    message::{kind, put_item, Envelope, DST_BROADCAST},
};

/// The structured payload of a notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notify {
    NameAdd {
        name: String,
        old_id: u64,
        new_id: u64,
        flags: u64,
    },
    NameRemove {
        name: String,
        old_id: u64,
        new_id: u64,
        flags: u64,
    },
    NameChange {
        name: String,
        old_id: u64,
        new_id: u64,
        flags: u64,
    },
    IdAdd {
        id: u64,
        flags: u64,
    },
    IdRemove {
        id: u64,
        flags: u64,
    },
    /// A pending reply's deadline elapsed; unicast to the waiting caller.
    ReplyTimeout,
    /// A pending reply's counterpart disconnected; unicast to the caller.
    ReplyDead,
}

impl Notify {
    /// The well-known name this notification is about, if any. Custom
    /// endpoints gate delivery on the visibility of this name.
    pub(crate) fn subject_name(&self) -> Option<&str> {
        match self {
            Notify::NameAdd { name, .. }
            | Notify::NameRemove { name, .. }
            | Notify::NameChange { name, .. } => Some(name),
            _ => None,
        }
    }

    pub(crate) fn encode_item(&self, buf: &mut Vec<u8>) {
        match self {
            Notify::NameAdd {
                name,
                old_id,
                new_id,
                flags,
            }
            | Notify::NameRemove {
                name,
                old_id,
                new_id,
                flags,
            }
            | Notify::NameChange {
                name,
                old_id,
                new_id,
                flags,
            } => {
                let item_kind = match self {
                    Notify::NameAdd { .. } => kind::NAME_ADD,
                    Notify::NameRemove { .. } => kind::NAME_REMOVE,
                    _ => kind::NAME_CHANGE,
                };
                let mut payload = Vec::with_capacity(24 + name.len());
                for word in [*old_id, *new_id, *flags] {
                    payload.extend_from_slice(&word.to_le_bytes());
                }
                payload.extend_from_slice(name.as_bytes());
                put_item(buf, item_kind, &payload);
            }
            Notify::IdAdd { id, flags } | Notify::IdRemove { id, flags } => {
                let item_kind = if matches!(self, Notify::IdAdd { .. }) {
                    kind::ID_ADD
                } else {
                    kind::ID_REMOVE
                };
                let mut payload = Vec::with_capacity(16);
                payload.extend_from_slice(&id.to_le_bytes());
                payload.extend_from_slice(&flags.to_le_bytes());
                put_item(buf, item_kind, &payload);
            }
            Notify::ReplyTimeout => put_item(buf, kind::REPLY_TIMEOUT, &[]),
            Notify::ReplyDead => put_item(buf, kind::REPLY_DEAD, &[]),
        }
    }
}

/// Queue a name transition broadcast.
pub(crate) fn name_change(bus: &Bus, notify: Notify) {
    bus.queue_notification(Envelope::for_notify(DST_BROADCAST, 0, notify));
}

/// Queue a connection arrival or departure broadcast.
pub(crate) fn id_change(bus: &Bus, id: u64, flags: u64, add: bool) {
    let notify = if add {
        Notify::IdAdd { id, flags }
    } else {
        Notify::IdRemove { id, flags }
    };
    bus.queue_notification(Envelope::for_notify(DST_BROADCAST, 0, notify));
}

/// Queue a reply-timeout notification for the caller behind `dst_id`.
pub(crate) fn reply_timeout(bus: &Bus, dst_id: u64, cookie: u64) {
    bus.queue_notification(Envelope::for_notify(dst_id, cookie, Notify::ReplyTimeout));
}

/// Queue a reply-dead notification for the caller behind `dst_id`.
pub(crate) fn reply_dead(bus: &Bus, dst_id: u64, cookie: u64) {
    bus.queue_notification(Envelope::for_notify(dst_id, cookie, Notify::ReplyDead));
}

/// Dispatch all queued notifications.
///
/// Must be called without any ranked lock held; every operation that may
/// have queued notifications flushes on its way out.
pub(crate) fn flush(bus: &Bus) {
    let Some(ep) = bus.default_endpoint_opt() else {
        return;
    };
    let _serialize = bus.notify_flush_guard();
    while let Some(mut env) = bus.pop_notification() {
        if let Err(e) = dispatch::send(&ep, None, &mut env) {
            warn!(error = %e, "failed to deliver notification");
        }
    }
}
