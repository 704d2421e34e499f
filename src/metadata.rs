//! Credential snapshots and per-message metadata.
//!
//! Every connection carries a [`Creds`] snapshot taken when it was created.
//! On each send, the dispatcher appends metadata items to the message
//! according to the *destination's* attach flags; a connection created with
//! impersonated credentials has those frozen in `owner_meta` and can only
//! gain name and description items on top.

use std::os::unix::fs::MetadataExt;

use enumflags2::{bitflags, BitFlags};
use nix::unistd;

use crate::{
    connection::Connection,
    message::{kind, put_item},
    time,
};

/// Which metadata items a connection wants to see on incoming messages.
#[bitflags]
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachFlags {
    Timestamp = 1,
    Creds = 1 << 1,
    Names = 1 << 2,
    Description = 1 << 3,
    Seclabel = 1 << 4,
}

/// Capabilities relevant to the bus.
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// Equivalent of `CAP_IPC_OWNER`: bypasses quotas and policy and may
    /// create privileged connection kinds.
    IpcOwner = 1,
}

/// A credential snapshot of the process behind a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Creds {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub tid: u32,
    /// Identity of the pid namespace the snapshot was taken in.
    pub pid_ns: u64,
    /// Identity of the user namespace the snapshot was taken in.
    pub user_ns: u64,
    pub caps: BitFlags<Capability>,
}

impl Creds {
    /// Snapshot the calling process.
    pub fn current() -> Self {
        let uid = unistd::getuid().as_raw();
        let pid = unistd::getpid().as_raw() as u32;
        Self {
            uid,
            gid: unistd::getgid().as_raw(),
            pid,
            tid: pid,
            pid_ns: ns_id("pid"),
            user_ns: ns_id("user"),
            caps: if uid == 0 {
                Capability::IpcOwner.into()
            } else {
                BitFlags::empty()
            },
        }
    }

    /// A snapshot for another identity, keeping the caller's namespaces.
    ///
    /// This is what a privileged creator hands in when it impersonates a
    /// different identity at hello time.
    pub fn for_user(uid: u32, gid: u32, pid: u32) -> Self {
        Self {
            uid,
            gid,
            pid,
            tid: pid,
            caps: BitFlags::empty(),
            ..Self::current()
        }
    }

    pub fn privileged(&self) -> bool {
        self.caps.contains(Capability::IpcOwner)
    }
}

fn ns_id(kind: &str) -> u64 {
    std::fs::metadata(format!("/proc/self/ns/{kind}"))
        .map(|m| m.ino())
        .unwrap_or(0)
}

#[derive(Clone, Debug)]
pub(crate) enum MetaItem {
    Timestamp {
        seq: u64,
        monotonic_ns: u64,
        realtime_ns: u64,
    },
    Creds {
        uid: u32,
        gid: u32,
        pid: u32,
        tid: u32,
    },
    OwnedName {
        flags: u64,
        name: String,
    },
    Description(String),
    Seclabel(String),
}

/// An append-only metadata buffer attached to a message or cached on a
/// connection or bus.
#[derive(Clone, Debug, Default)]
pub struct Metadata {
    attached: BitFlags<AttachFlags>,
    pid_ns: u64,
    user_ns: u64,
    items: Vec<MetaItem>,
}

impl Metadata {
    pub fn new() -> Self {
        let creds = Creds::current();
        Self {
            attached: BitFlags::empty(),
            pid_ns: creds.pid_ns,
            user_ns: creds.user_ns,
            items: Vec::new(),
        }
    }

    /// A buffer pre-filled with the given credentials.
    pub fn for_creds(creds: &Creds) -> Self {
        let mut meta = Self {
            attached: AttachFlags::Creds.into(),
            pid_ns: creds.pid_ns,
            user_ns: creds.user_ns,
            items: Vec::new(),
        };
        meta.items.push(MetaItem::Creds {
            uid: creds.uid,
            gid: creds.gid,
            pid: creds.pid,
            tid: creds.tid,
        });
        meta
    }

    pub(crate) fn push_seclabel(&mut self, label: &str) {
        self.attached |= AttachFlags::Seclabel;
        self.items.push(MetaItem::Seclabel(label.to_string()));
    }

    /// Append the items `which` asks for that are not attached yet,
    /// sourcing them from `conn`.
    pub(crate) fn append(&mut self, conn: &Connection, seq: u64, which: BitFlags<AttachFlags>) {
        let missing = which & !self.attached;
        for flag in missing.iter() {
            match flag {
                AttachFlags::Timestamp => self.items.push(MetaItem::Timestamp {
                    seq,
                    monotonic_ns: time::monotonic_ns(),
                    realtime_ns: time::realtime_ns(),
                }),
                AttachFlags::Creds => {
                    let creds = conn.creds();
                    self.items.push(MetaItem::Creds {
                        uid: creds.uid,
                        gid: creds.gid,
                        pid: creds.pid,
                        tid: creds.tid,
                    });
                }
                AttachFlags::Names => {
                    for (name, flags) in conn.names_snapshot() {
                        self.items.push(MetaItem::OwnedName { flags, name });
                    }
                }
                AttachFlags::Description => {
                    if let Some(desc) = conn.description() {
                        self.items.push(MetaItem::Description(desc.to_string()));
                    }
                }
                AttachFlags::Seclabel => {
                    // Labels only exist on impersonated connections, where
                    // they are already frozen into the buffer.
                }
            }
        }
        self.attached |= missing;
    }

    /// True when both buffers were captured in the same pid and user
    /// namespaces. Credentials must not cross this boundary.
    pub fn ns_eq(&self, other: &Metadata) -> bool {
        self.pid_ns == other.pid_ns && self.user_ns == other.user_ns
    }

    pub(crate) fn dup(&self) -> Metadata {
        self.clone()
    }

    pub(crate) fn encode_items(&self, buf: &mut Vec<u8>) {
        for item in &self.items {
            match item {
                MetaItem::Timestamp {
                    seq,
                    monotonic_ns,
                    realtime_ns,
                } => {
                    let mut payload = Vec::with_capacity(24);
                    for word in [*seq, *monotonic_ns, *realtime_ns] {
                        payload.extend_from_slice(&word.to_le_bytes());
                    }
                    put_item(buf, kind::TIMESTAMP, &payload);
                }
                MetaItem::Creds { uid, gid, pid, tid } => {
                    let mut payload = Vec::with_capacity(16);
                    for word in [*uid, *gid, *pid, *tid] {
                        payload.extend_from_slice(&word.to_le_bytes());
                    }
                    put_item(buf, kind::CREDS, &payload);
                }
                MetaItem::OwnedName { flags, name } => {
                    let mut payload = Vec::with_capacity(8 + name.len());
                    payload.extend_from_slice(&flags.to_le_bytes());
                    payload.extend_from_slice(name.as_bytes());
                    put_item(buf, kind::OWNED_NAME, &payload);
                }
                MetaItem::Description(desc) => {
                    put_item(buf, kind::DESCRIPTION, desc.as_bytes());
                }
                MetaItem::Seclabel(label) => {
                    put_item(buf, kind::SECLABEL, label.as_bytes());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ns_identity_matches_for_same_process() {
        let a = Metadata::new();
        let b = Metadata::for_creds(&Creds::current());
        assert!(a.ns_eq(&b));
    }

    #[test]
    fn foreign_namespace_does_not_match() {
        let mut a = Metadata::new();
        let b = Metadata::new();
        a.pid_ns = a.pid_ns.wrapping_add(1);
        assert!(!a.ns_eq(&b));
    }

    #[test]
    fn impersonated_creds_keep_caller_namespaces() {
        let real = Creds::current();
        let faked = Creds::for_user(1000, 1000, 4242);
        assert_eq!(faked.uid, 1000);
        assert_eq!(faked.pid_ns, real.pid_ns);
        assert!(!faked.privileged());
    }
}
