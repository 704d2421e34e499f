//! Per-connection receive queue.
//!
//! Entries are ordered by priority (lower first) with FIFO tie-breaking.
//! Beyond a threshold the queue charges every further entry to its
//! sending user, so that no single user can fill a receiver's queue.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    error::{Error, Result},
    limits,
    message::Envelope,
    metadata::Creds,
    pool::Pool,
    reply::ReplyTracker,
};

/// One queued message, owning a slice of the receiver's pool.
#[derive(Debug)]
pub(crate) struct QueueEntry {
    /// Offset of the message record in the receiver's pool.
    pub(crate) slice: u64,
    pub(crate) src_id: u64,
    pub(crate) cookie: u64,
    /// The name id the message was addressed to, 0 for direct sends.
    pub(crate) dst_name_id: u64,
    pub(crate) priority: i64,
    /// Reply tracker expected to be answered by the receiver, if the
    /// message is a method call.
    pub(crate) reply: Option<Arc<ReplyTracker>>,
    /// The uid charged for this entry, when quota accounting was active.
    pub(crate) user: Option<u32>,
}

impl QueueEntry {
    /// Serialize `env` into a fresh private slice of `pool`.
    pub(crate) fn new(pool: &Pool, env: &Envelope) -> Result<Self> {
        let slice = pool.alloc(env.encode())?;
        Ok(Self {
            slice,
            src_id: env.msg.src_id,
            cookie: env.msg.cookie,
            dst_name_id: env.dst_name_id,
            priority: env.msg.priority,
            reply: None,
            user: None,
        })
    }

    /// Finalize delivery: install carried descriptors and publish the
    /// slice to the pool's owner.
    pub(crate) fn install(&self, pool: &Pool) -> Result<()> {
        pool.publish(self.slice)
    }
}

/// Priority-ordered message queue with per-user accounting.
#[derive(Debug, Default)]
pub(crate) struct Queue {
    entries: BTreeMap<(i64, u64), QueueEntry>,
    next_seq: u64,
    msg_users: BTreeMap<u32, u32>,
    pub(crate) msg_count: usize,
}

impl Queue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Charge the sending user for one more entry, once the queue has
    /// grown beyond the free threshold. Privileged senders and
    /// bus-originated messages are exempt.
    pub(crate) fn charge_user(
        &mut self,
        src: Option<&Creds>,
        entry: &mut QueueEntry,
    ) -> Result<()> {
        let Some(creds) = src else {
            return Ok(());
        };
        if creds.privileged() {
            return Ok(());
        }
        if self.msg_count < limits::CONN_MAX_MSGS_PER_USER {
            return Ok(());
        }
        let count = self.msg_users.entry(creds.uid).or_insert(0);
        if *count as usize >= limits::CONN_MAX_MSGS_PER_USER {
            return Err(Error::NoBufferSpace);
        }
        *count += 1;
        entry.user = Some(creds.uid);
        Ok(())
    }

    /// Link an entry, keyed by priority with FIFO tie-breaking.
    pub(crate) fn add(&mut self, entry: QueueEntry) {
        let key = (entry.priority, self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, entry);
        self.msg_count += 1;
    }

    /// The key of the next deliverable entry. With `use_priority`, only
    /// entries at or below `priority` qualify.
    pub(crate) fn peek(&self, priority: i64, use_priority: bool) -> Result<(i64, u64)> {
        let (&key, _) = self.entries.iter().next().ok_or(Error::WouldBlock)?;
        if use_priority && key.0 > priority {
            return Err(Error::NoMessage);
        }
        Ok(key)
    }

    pub(crate) fn get(&self, key: (i64, u64)) -> Option<&QueueEntry> {
        self.entries.get(&key)
    }

    /// Unlink an entry and release its user charge.
    pub(crate) fn remove(&mut self, key: (i64, u64)) -> Option<QueueEntry> {
        let entry = self.entries.remove(&key)?;
        self.msg_count -= 1;
        if let Some(uid) = entry.user {
            if let Some(count) = self.msg_users.get_mut(&uid) {
                *count = count.saturating_sub(1);
            }
        }
        Some(entry)
    }

    /// Unlink every entry, in delivery order.
    pub(crate) fn drain_all(&mut self) -> Vec<QueueEntry> {
        let keys: Vec<_> = self.entries.keys().copied().collect();
        keys.into_iter().filter_map(|k| self.remove(k)).collect()
    }

    /// Unlink the entries addressed to `name_id`, in delivery order.
    pub(crate) fn drain_for_name(&mut self, name_id: u64) -> Vec<QueueEntry> {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dst_name_id == name_id)
            .map(|(&k, _)| k)
            .collect();
        keys.into_iter().filter_map(|k| self.remove(k)).collect()
    }

    /// How many queued entries were charged to `uid`.
    #[cfg(test)]
    pub(crate) fn charged_to(&self, uid: u32) -> u32 {
        self.msg_users.get(&uid).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Item;

    fn entry(pool: &Pool, priority: i64, cookie: u64) -> QueueEntry {
        let mut env =
            Envelope::to_id(1, cookie, vec![Item::Payload(vec![0u8; 8])]).unwrap();
        env.msg.priority = priority;
        QueueEntry::new(pool, &env).unwrap()
    }

    #[test]
    fn priority_orders_delivery_fifo_within_level() {
        let pool = Pool::new(1 << 16).unwrap();
        let mut q = Queue::new();
        q.add(entry(&pool, 0, 1));
        q.add(entry(&pool, -10, 2));
        q.add(entry(&pool, 0, 3));
        q.add(entry(&pool, -10, 4));

        let mut cookies = Vec::new();
        while let Ok(key) = q.peek(0, false) {
            cookies.push(q.remove(key).unwrap().cookie);
        }
        assert_eq!(cookies, vec![2, 4, 1, 3]);
    }

    #[test]
    fn priority_bound_hides_low_priority_entries() {
        let pool = Pool::new(1 << 16).unwrap();
        let mut q = Queue::new();
        q.add(entry(&pool, 5, 1));
        assert_eq!(q.peek(0, true).unwrap_err(), Error::NoMessage);
        assert!(q.peek(5, true).is_ok());
        assert!(q.peek(0, false).is_ok());
    }

    #[test]
    fn empty_queue_would_block() {
        let q = Queue::new();
        assert_eq!(q.peek(0, false).unwrap_err(), Error::WouldBlock);
    }

    #[test]
    fn accounting_starts_beyond_the_free_threshold() {
        let pool = Pool::new(1 << 20).unwrap();
        let mut q = Queue::new();
        let creds = Creds::for_user(1000, 1000, 1);

        let mut send = |q: &mut Queue| -> Result<()> {
            let mut e = entry(&pool, 0, 1);
            q.charge_user(Some(&creds), &mut e)?;
            q.add(e);
            Ok(())
        };

        for _ in 0..limits::CONN_MAX_MSGS_PER_USER {
            send(&mut q).unwrap();
        }
        assert_eq!(q.charged_to(1000), 0);

        for _ in 0..limits::CONN_MAX_MSGS_PER_USER {
            send(&mut q).unwrap();
        }
        assert_eq!(q.charged_to(1000), limits::CONN_MAX_MSGS_PER_USER as u32);
        assert_eq!(send(&mut q).unwrap_err(), Error::NoBufferSpace);

        // Another user still gets its own share.
        let other = Creds::for_user(1001, 1001, 2);
        let mut e = entry(&pool, 0, 9);
        q.charge_user(Some(&other), &mut e).unwrap();
        q.add(e);

        // Draining releases the charge.
        while let Ok(key) = q.peek(0, false) {
            q.remove(key);
        }
        assert_eq!(q.charged_to(1000), 0);
        assert_eq!(q.charged_to(1001), 0);
    }

    #[test]
    fn privileged_senders_are_never_charged() {
        let pool = Pool::new(1 << 20).unwrap();
        let mut q = Queue::new();
        let mut root = Creds::for_user(0, 0, 1);
        root.caps = crate::metadata::Capability::IpcOwner.into();

        for _ in 0..3 * limits::CONN_MAX_MSGS_PER_USER {
            let mut e = entry(&pool, 0, 1);
            q.charge_user(Some(&root), &mut e).unwrap();
            q.add(e);
        }
        assert_eq!(q.charged_to(0), 0);
    }
}
