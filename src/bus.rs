//! The bus.
//!
//! A bus is a bounded namespace of connections sharing a name registry
//! and a policy database. It hands out unique connection ids, keeps the
//! id-to-connection map used by unicast and broadcast, tracks monitors,
//! and buffers bus-originated notifications until they can be flushed.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use enumflags2::{bitflags, BitFlags};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::info;

use crate::{
    connection::Connection,
    domain::{Domain, DomainUser},
    endpoint::Endpoint,
    error::{Error, Result},
    limits,
    message::{Envelope, InfoRecord},
    metadata::{Creds, Metadata},
    names::NameRegistry,
    policy::PolicyDb,
    util::{lock_rank, LockRank},
};

/// Flags at bus creation.
#[bitflags]
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusFlags {
    /// Grant the bus owner's group access to the device node.
    AccessGroup = 1,
    /// Grant everyone access to the device node.
    AccessWorld = 1 << 1,
}

/// The fixed broadcast-filter geometry of a bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BloomParameters {
    /// Filter size in bytes; 8-aligned, at most [`limits::BLOOM_MAX_SIZE`].
    pub size: usize,
    /// Number of hash functions senders apply.
    pub n_hash: usize,
}

impl Default for BloomParameters {
    fn default() -> Self {
        Self { size: 64, n_hash: 4 }
    }
}

/// Parameters for creating a bus.
#[derive(Debug)]
pub struct BusMake {
    /// Bus name; must start with `"<uid>-"` of the creator.
    pub name: String,
    pub bloom: BloomParameters,
    pub flags: BitFlags<BusFlags>,
    /// Access mode of the default endpoint's device node.
    pub mode: u32,
}

#[derive(Debug)]
pub(crate) struct BusState {
    pub(crate) disconnected: bool,
    pub(crate) endpoints: Vec<Arc<Endpoint>>,
    pub(crate) ep_seq_last: u64,
    default_endpoint: Option<Arc<Endpoint>>,
}

#[derive(Debug, Default)]
pub(crate) struct ConnMap {
    pub(crate) conns: HashMap<u64, Arc<Connection>>,
    pub(crate) monitors: Vec<Arc<Connection>>,
}

/// A message bus.
pub struct Bus {
    name: String,
    id: u64,
    id128: [u8; 16],
    flags: BitFlags<BusFlags>,
    uid_owner: u32,
    bloom: BloomParameters,
    /// Creator metadata, cached for creator-info queries.
    meta: Metadata,
    domain: Arc<Domain>,
    user: Arc<DomainUser>,
    accounted: bool,
    name_registry: NameRegistry,
    policy: PolicyDb,
    pub(crate) state: Mutex<BusState>,
    pub(crate) connections: RwLock<ConnMap>,
    conn_seq_last: AtomicU64,
    msg_seq_last: AtomicU64,
    notifications: Mutex<Vec<Envelope>>,
    notify_flush_lock: Mutex<()>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("uid_owner", &self.uid_owner)
            .finish_non_exhaustive()
    }
}

impl Bus {
    /// Create a bus on `domain` with the default `bus` endpoint.
    pub fn make(
        domain: &Arc<Domain>,
        make: BusMake,
        creds: Creds,
        policy: PolicyDb,
    ) -> Result<Arc<Bus>> {
        // The name carries the creator's uid as a prefix so that users
        // cannot squat each other's bus names.
        let prefix = format!("{}-", creds.uid);
        if !make.name.starts_with(&prefix) {
            return Err(Error::InvalidArgument("bus name must start with '<uid>-'"));
        }
        if !is_valid_bus_name(&make.name) {
            return Err(Error::InvalidArgument("invalid bus name"));
        }
        let bloom = make.bloom;
        if bloom.size < 8 || bloom.size > limits::BLOOM_MAX_SIZE || bloom.size % 8 != 0 {
            return Err(Error::InvalidArgument("invalid bloom filter size"));
        }
        if bloom.n_hash < 1 {
            return Err(Error::InvalidArgument("invalid bloom hash count"));
        }

        let mut id128 = [0u8; 16];
        id128[..8].copy_from_slice(&fastrand::u64(..).to_le_bytes());
        id128[8..].copy_from_slice(&fastrand::u64(..).to_le_bytes());

        let user = domain.get_user(creds.uid);
        let bus = {
            let _rank = lock_rank(LockRank::Domain);
            let mut domain_state = domain.state.lock();
            if domain_state.disconnected {
                return Err(Error::Shutdown);
            }
            if domain_state.buses.iter().any(|b| b.name == make.name) {
                return Err(Error::AlreadyExists);
            }
            let accounted = !creds.privileged();
            if accounted {
                if user.buses.fetch_add(1, Ordering::SeqCst) + 1 > limits::USER_MAX_BUSES {
                    user.buses.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::TooManyOpenFiles);
                }
            }
            domain_state.bus_seq_last += 1;
            let bus = Arc::new(Bus {
                name: make.name,
                id: domain_state.bus_seq_last,
                id128,
                flags: make.flags,
                uid_owner: creds.uid,
                bloom,
                meta: Metadata::for_creds(&creds),
                domain: domain.clone(),
                user: user.clone(),
                accounted,
                name_registry: NameRegistry::new(),
                policy,
                state: Mutex::new(BusState {
                    disconnected: false,
                    endpoints: Vec::new(),
                    ep_seq_last: 0,
                    default_endpoint: None,
                }),
                connections: RwLock::new(ConnMap::default()),
                conn_seq_last: AtomicU64::new(0),
                msg_seq_last: AtomicU64::new(0),
                notifications: Mutex::new(Vec::new()),
                notify_flush_lock: Mutex::new(()),
            });
            domain_state.buses.push(bus.clone());
            bus
        };

        let ep = Endpoint::make_default(&bus, make.mode, creds.uid, creds.gid)?;
        {
            let _rank = lock_rank(LockRank::Bus);
            bus.state.lock().default_endpoint = Some(ep);
        }
        info!(name = %bus.name, id = bus.id, "bus created");
        Ok(bus)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn id128(&self) -> [u8; 16] {
        self.id128
    }

    pub fn flags(&self) -> BitFlags<BusFlags> {
        self.flags
    }

    pub fn bloom(&self) -> BloomParameters {
        self.bloom
    }

    pub fn name_registry(&self) -> &NameRegistry {
        &self.name_registry
    }

    pub(crate) fn policy(&self) -> &PolicyDb {
        &self.policy
    }

    pub(crate) fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    /// The `bus` endpoint every ordinary client connects through.
    pub fn default_endpoint(&self) -> Option<Arc<Endpoint>> {
        let _rank = lock_rank(LockRank::Bus);
        self.state.lock().default_endpoint.clone()
    }

    pub(crate) fn default_endpoint_opt(&self) -> Option<Arc<Endpoint>> {
        self.default_endpoint()
    }

    /// Credentials are privileged on this bus when they carry the IPC
    /// owner capability or belong to the bus creator.
    pub fn cred_is_privileged(&self, creds: &Creds) -> bool {
        creds.privileged() || creds.uid == self.uid_owner
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.conn_seq_last.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn next_msg_seq(&self) -> u64 {
        self.msg_seq_last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Look up a connection by unique id.
    pub fn find_conn(&self, id: u64) -> Option<Arc<Connection>> {
        let _rank = lock_rank(LockRank::ConnMap);
        self.connections.read().conns.get(&id).cloned()
    }

    /// `(id, hello flags)` of every connection, for name listings.
    pub(crate) fn conn_ids(&self) -> Vec<(u64, u64)> {
        let _rank = lock_rank(LockRank::ConnMap);
        self.connections
            .read()
            .conns
            .values()
            .map(|c| (c.id(), c.flags().bits()))
            .collect()
    }

    pub(crate) fn queue_notification(&self, env: Envelope) {
        self.notifications.lock().push(env);
    }

    pub(crate) fn pop_notification(&self) -> Option<Envelope> {
        let mut pending = self.notifications.lock();
        if pending.is_empty() {
            None
        } else {
            Some(pending.remove(0))
        }
    }

    pub(crate) fn notify_flush_guard(&self) -> MutexGuard<'_, ()> {
        self.notify_flush_lock.lock()
    }

    /// Write an info record about the bus creator into `conn`'s pool.
    ///
    /// Denied when the caller lives in different namespaces than the
    /// creator; credentials must not leak across.
    pub fn creator_info(&self, conn: &Connection) -> Result<u64> {
        if !conn.meta().ns_eq(&self.meta) {
            return Err(Error::PermissionDenied);
        }
        let mut items = Vec::new();
        self.meta.encode_items(&mut items);
        let record = InfoRecord::encode(self.id, self.flags.bits(), &items);
        let offset = conn.pool().alloc(record)?;
        conn.pool().flush(offset)?;
        conn.pool().publish(offset)?;
        Ok(offset)
    }

    /// Tear the bus down: cascade through endpoints, which disconnect
    /// their connections.
    pub fn disconnect(self: &Arc<Self>) {
        {
            let _rank = lock_rank(LockRank::Bus);
            let mut state = self.state.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
        }
        {
            let _rank = lock_rank(LockRank::Domain);
            let mut domain_state = self.domain.state.lock();
            domain_state.buses.retain(|b| !Arc::ptr_eq(b, self));
        }
        loop {
            let ep = {
                let _rank = lock_rank(LockRank::Bus);
                self.state.lock().endpoints.first().cloned()
            };
            match ep {
                Some(ep) => ep.disconnect(),
                None => break,
            }
        }
        let _rank = lock_rank(LockRank::Bus);
        self.state.lock().default_endpoint = None;
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        if self.accounted {
            self.user.buses.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Bus names are single flat words (the uid prefix included).
fn is_valid_bus_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_names_are_flat_words() {
        assert!(is_valid_bus_name("1000-system"));
        assert!(is_valid_bus_name("0-a.b_c-d"));
        assert!(!is_valid_bus_name(""));
        assert!(!is_valid_bus_name("has space"));
        assert!(!is_valid_bus_name(&"x".repeat(64)));
    }
}
