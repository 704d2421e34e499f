//! The well-known name registry.
//!
//! Names map to an owning connection, an optional activator standing in
//! for a yet-to-arrive implementor, and a FIFO of queued claimers. Every
//! ownership transition is announced on the bus, and handing a name
//! between an activator and an implementor migrates the messages queued
//! under that name.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use enumflags2::{bitflags, BitFlags};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::warn;

use crate::{
    connection::Connection,
    error::{Error, Result},
    limits,
    notify::{self, Notify},
    util::{lock_rank, LockRank},
};

/// Flags for name acquisition.
#[bitflags]
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameFlags {
    /// The owner tolerates being replaced by a willing requester.
    AllowReplacement = 1,
    /// Take the name over if the current owner allows it.
    ReplaceExisting = 1 << 1,
    /// Wait in line if the name is taken.
    Queue = 1 << 2,
    /// Hold the name as an activator. Only set internally during hello.
    Activator = 1 << 3,
}

/// Outcome of a successful acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireReply {
    /// The requester is now the primary owner.
    PrimaryOwner,
    /// The requester already owned the name; flags were updated.
    AlreadyOwner,
    /// The requester was appended to the pending queue.
    InQueue,
}

#[derive(Debug)]
struct QueuedOwner {
    conn: Arc<Connection>,
    flags: BitFlags<NameFlags>,
}

#[derive(Debug)]
struct NameEntry {
    name: String,
    flags: BitFlags<NameFlags>,
    name_id: u64,
    conn: Option<Arc<Connection>>,
    activator: Option<Arc<Connection>>,
    queue: VecDeque<QueuedOwner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    entries: HashMap<String, NameEntry>,
    name_seq_last: u64,
}

/// Holds the registry read-locked on behalf of a resolved lookup.
pub(crate) struct NameLock<'a> {
    _guard: RwLockReadGuard<'a, RegistryInner>,
    _rank: crate::util::RankToken,
}

/// Destination candidates a name resolves to.
#[derive(Debug)]
pub(crate) struct ResolvedName {
    pub(crate) name_id: u64,
    pub(crate) owner: Option<Arc<Connection>>,
    pub(crate) activator: Option<Arc<Connection>>,
}

/// One row of a name-list snapshot.
#[derive(Debug)]
pub(crate) struct NameListEntry {
    pub(crate) name: String,
    pub(crate) flags: u64,
    pub(crate) owner_id: Option<u64>,
    pub(crate) activator_id: Option<u64>,
    pub(crate) queued: Vec<(u64, u64)>,
}

/// Validity rules shared with the wire protocol: a dotted hierarchy of at
/// least two elements, each starting with a letter, underscore or dash.
pub fn is_valid_name(name: &str, allow_wildcard: bool) -> bool {
    if name.is_empty() || name.len() > limits::NAME_MAX_LEN {
        return false;
    }
    let name = if allow_wildcard {
        match name.strip_suffix(".*") {
            Some(prefix) => prefix,
            None => name,
        }
    } else {
        name
    };
    let mut elements = 0;
    for element in name.split('.') {
        let mut chars = element.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-' => {}
            _ => return false,
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

/// The bus-global registry of well-known names.
#[derive(Debug, Default)]
pub struct NameRegistry {
    inner: RwLock<RegistryInner>,
}

impl NameRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Current owner id of `name`, if any connection implements it.
    pub fn lookup(&self, name: &str) -> Option<u64> {
        let _rank = lock_rank(LockRank::NameRegistry);
        let reg = self.inner.read();
        reg.entries
            .get(name)
            .and_then(|e| e.conn.as_ref())
            .map(|c| c.id())
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<ResolvedName> {
        let _rank = lock_rank(LockRank::NameRegistry);
        let reg = self.inner.read();
        reg.entries.get(name).map(|e| ResolvedName {
            name_id: e.name_id,
            owner: e.conn.clone(),
            activator: e.activator.clone(),
        })
    }

    /// Resolve a name and keep the registry read-locked so the entry
    /// cannot change owners while the message is being enqueued. The
    /// caller must drop the handle before any blocking wait.
    pub(crate) fn resolve_locked(&self, name: &str) -> Option<(NameLock<'_>, ResolvedName)> {
        let rank = lock_rank(LockRank::NameRegistry);
        let guard = self.inner.read();
        let resolved = guard.entries.get(name).map(|e| ResolvedName {
            name_id: e.name_id,
            owner: e.conn.clone(),
            activator: e.activator.clone(),
        })?;
        Some((
            NameLock {
                _guard: guard,
                _rank: rank,
            },
            resolved,
        ))
    }

    pub(crate) fn snapshot(&self) -> Vec<NameListEntry> {
        let _rank = lock_rank(LockRank::NameRegistry);
        let reg = self.inner.read();
        reg.entries
            .values()
            .map(|e| NameListEntry {
                name: e.name.clone(),
                flags: e.flags.bits(),
                owner_id: e.conn.as_ref().map(|c| c.id()),
                activator_id: e.activator.as_ref().map(|c| c.id()),
                queued: e.queue.iter().map(|q| (q.conn.id(), q.flags.bits())).collect(),
            })
            .collect()
    }

    /// Acquire `name` for `conn`.
    pub(crate) fn acquire(
        &self,
        conn: &Arc<Connection>,
        name: &str,
        flags: BitFlags<NameFlags>,
    ) -> Result<AcquireReply> {
        if !is_valid_name(name, false) {
            return Err(Error::InvalidArgument("invalid well-known name"));
        }
        conn.ep().check_own_access(conn, name)?;

        let bus = conn.bus();
        let reply = {
            let _bus_rank = lock_rank(LockRank::Bus);
            let _bus = bus.state.lock();
            let _reg_rank = lock_rank(LockRank::NameRegistry);
            let mut reg = self.inner.write();
            Self::do_acquire(&mut reg, conn, name, flags)
        };
        notify::flush(bus);
        reply
    }

    fn do_acquire(
        reg: &mut RegistryInner,
        conn: &Arc<Connection>,
        name: &str,
        flags: BitFlags<NameFlags>,
    ) -> Result<AcquireReply> {
        let bus = conn.bus();
        let keep = NameFlags::AllowReplacement | NameFlags::Queue;

        let Some(entry) = reg.entries.get_mut(name) else {
            reg.name_seq_last += 1;
            let name_id = reg.name_seq_last;
            let activator = flags.contains(NameFlags::Activator);
            let entry = NameEntry {
                name: name.to_string(),
                flags: if activator {
                    NameFlags::Activator.into()
                } else {
                    flags & keep
                },
                name_id,
                conn: (!activator).then(|| conn.clone()),
                activator: activator.then(|| conn.clone()),
                queue: VecDeque::new(),
            };
            let entry_flags = entry.flags.bits();
            reg.entries.insert(name.to_string(), entry);
            if !activator {
                conn.names_add(name, name_id, entry_flags);
            }
            notify::name_change(
                bus,
                Notify::NameAdd {
                    name: name.to_string(),
                    old_id: 0,
                    new_id: conn.id(),
                    flags: entry_flags,
                },
            );
            return Ok(AcquireReply::PrimaryOwner);
        };

        if flags.contains(NameFlags::Activator) {
            if entry.activator.is_some() {
                return Err(Error::AlreadyExists);
            }
            entry.activator = Some(conn.clone());
            return Ok(AcquireReply::PrimaryOwner);
        }

        if entry.conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            entry.flags = flags & keep;
            return Ok(AcquireReply::AlreadyOwner);
        }

        if entry.conn.is_none() {
            // Held by an activator alone: the requester becomes the
            // implementor, and the messages the activator has been
            // keeping warm move over.
            entry.conn = Some(conn.clone());
            entry.flags = flags & keep;
            conn.names_add(name, entry.name_id, entry.flags.bits());
            let old_id = match &entry.activator {
                Some(act) => {
                    if let Err(e) = Connection::move_messages(conn, act, entry.name_id) {
                        warn!(name, error = %e, "queued message migration failed");
                    }
                    act.id()
                }
                None => 0,
            };
            notify::name_change(
                bus,
                Notify::NameChange {
                    name: name.to_string(),
                    old_id,
                    new_id: conn.id(),
                    flags: entry.flags.bits(),
                },
            );
            return Ok(AcquireReply::PrimaryOwner);
        }

        let owner_allows = entry.flags.contains(NameFlags::AllowReplacement);
        if flags.contains(NameFlags::ReplaceExisting) && owner_allows {
            let old = entry.conn.take().expect("checked above");
            old.names_remove(name);
            if entry.flags.contains(NameFlags::Queue) {
                entry.queue.push_front(QueuedOwner {
                    conn: old.clone(),
                    flags: entry.flags,
                });
            }
            entry.conn = Some(conn.clone());
            entry.flags = flags & keep;
            conn.names_add(name, entry.name_id, entry.flags.bits());
            notify::name_change(
                bus,
                Notify::NameChange {
                    name: name.to_string(),
                    old_id: old.id(),
                    new_id: conn.id(),
                    flags: entry.flags.bits(),
                },
            );
            return Ok(AcquireReply::PrimaryOwner);
        }

        if flags.contains(NameFlags::Queue) {
            if let Some(queued) = entry
                .queue
                .iter_mut()
                .find(|q| Arc::ptr_eq(&q.conn, conn))
            {
                queued.flags = flags & keep;
            } else {
                entry.queue.push_back(QueuedOwner {
                    conn: conn.clone(),
                    flags: flags & keep,
                });
            }
            return Ok(AcquireReply::InQueue);
        }

        Err(Error::AlreadyExists)
    }

    /// Release `name` held or queued for by `conn`.
    pub(crate) fn release(&self, conn: &Arc<Connection>, name: &str) -> Result<()> {
        if !is_valid_name(name, false) {
            return Err(Error::InvalidArgument("invalid well-known name"));
        }
        let bus = conn.bus();
        let res = {
            let _bus_rank = lock_rank(LockRank::Bus);
            let _bus = bus.state.lock();
            let _reg_rank = lock_rank(LockRank::NameRegistry);
            let mut reg = self.inner.write();

            let mut remove_entry = false;
            let res = match reg.entries.get_mut(name) {
                None => Err(Error::NotFound),
                Some(entry) => {
                    if entry.conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
                        remove_entry = Self::pass_ownership_on(entry);
                        Ok(())
                    } else if let Some(pos) =
                        entry.queue.iter().position(|q| Arc::ptr_eq(&q.conn, conn))
                    {
                        entry.queue.remove(pos);
                        Ok(())
                    } else if entry
                        .activator
                        .as_ref()
                        .is_some_and(|a| Arc::ptr_eq(a, conn))
                    {
                        entry.activator = None;
                        if entry.conn.is_none() && entry.queue.is_empty() {
                            notify::name_change(
                                conn.bus(),
                                Notify::NameRemove {
                                    name: name.to_string(),
                                    old_id: conn.id(),
                                    new_id: 0,
                                    flags: NameFlags::Activator as u64,
                                },
                            );
                            remove_entry = true;
                        }
                        Ok(())
                    } else {
                        Err(Error::PermissionDenied)
                    }
                }
            };
            if remove_entry {
                reg.entries.remove(name);
            }
            res
        };
        notify::flush(bus);
        res
    }

    /// Hand the entry to the next claimer, fall back to the activator, or
    /// report that the entry should be dropped. The current owner must be
    /// set; it is unlinked here.
    fn pass_ownership_on(entry: &mut NameEntry) -> bool {
        let old = entry.conn.take().expect("caller verified ownership");
        old.names_remove(&entry.name);
        let bus = old.bus();

        if let Some(next) = entry.queue.pop_front() {
            entry.flags = next.flags;
            entry.conn = Some(next.conn.clone());
            next.conn.names_add(&entry.name, entry.name_id, entry.flags.bits());
            notify::name_change(
                bus,
                Notify::NameChange {
                    name: entry.name.clone(),
                    old_id: old.id(),
                    new_id: next.conn.id(),
                    flags: entry.flags.bits(),
                },
            );
            false
        } else if let Some(act) = entry.activator.clone() {
            entry.flags = NameFlags::Activator.into();
            // In-flight messages for the name wait on the activator again.
            if let Err(e) = Connection::move_messages(&act, &old, entry.name_id) {
                warn!(name = %entry.name, error = %e, "queued message migration failed");
            }
            notify::name_change(
                bus,
                Notify::NameChange {
                    name: entry.name.clone(),
                    old_id: old.id(),
                    new_id: act.id(),
                    flags: entry.flags.bits(),
                },
            );
            false
        } else {
            notify::name_change(
                bus,
                Notify::NameRemove {
                    name: entry.name.clone(),
                    old_id: old.id(),
                    new_id: 0,
                    flags: entry.flags.bits(),
                },
            );
            true
        }
    }

    /// Drop every trace of `conn`: owned names pass on, queue positions
    /// vanish, activator slots clear. Runs during disconnect.
    pub(crate) fn remove_by_conn(&self, conn: &Arc<Connection>) {
        let bus = conn.bus();
        {
            let _bus_rank = lock_rank(LockRank::Bus);
            let _bus = bus.state.lock();
            let _reg_rank = lock_rank(LockRank::NameRegistry);
            let mut reg = self.inner.write();

            let names: Vec<String> = reg.entries.keys().cloned().collect();
            for name in names {
                let mut remove_entry = false;
                if let Some(entry) = reg.entries.get_mut(&name) {
                    entry.queue.retain(|q| !Arc::ptr_eq(&q.conn, conn));
                    if entry
                        .activator
                        .as_ref()
                        .is_some_and(|a| Arc::ptr_eq(a, conn))
                    {
                        entry.activator = None;
                        if entry.conn.is_none() && entry.queue.is_empty() {
                            notify::name_change(
                                bus,
                                Notify::NameRemove {
                                    name: name.clone(),
                                    old_id: conn.id(),
                                    new_id: 0,
                                    flags: NameFlags::Activator as u64,
                                },
                            );
                            remove_entry = true;
                        }
                    }
                    if entry.conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
                        remove_entry = Self::pass_ownership_on(entry);
                    }
                }
                if remove_entry {
                    reg.entries.remove(&name);
                }
            }
        }
        notify::flush(bus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validity() {
        assert!(is_valid_name("com.example.Service", false));
        assert!(is_valid_name("org._1.x-y", false));
        assert!(!is_valid_name("", false));
        assert!(!is_valid_name("single", false));
        assert!(!is_valid_name("com..example", false));
        assert!(!is_valid_name("com.1digit", false));
        assert!(!is_valid_name("com.exa mple", false));
        assert!(!is_valid_name(&"a.".repeat(200), false));
    }

    #[test]
    fn wildcards_only_where_allowed() {
        assert!(is_valid_name("com.example.*", true));
        assert!(!is_valid_name("com.example.*", false));
        assert!(!is_valid_name("com.*.example", true));
    }
}
