//! The connection object.
//!
//! A connection is created by a hello on an endpoint and lives until it
//! disconnects or its endpoint or bus is torn down. It composes the
//! receive queue, the reply list, the match database and the receive
//! pool, and is shared: the bus hash, the endpoint list and every
//! in-flight operation hold strong references, while mutation is guarded
//! by the *active* counter so that teardown can drain users out.

use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
    Arc,
};

use enumflags2::{bitflags, BitFlags};
use event_listener::{Event, Listener};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    bus::{BloomParameters, Bus, BusFlags},
    dispatch::{self, SendReply},
    domain::DomainUser,
    endpoint::Endpoint,
    error::{Error, Result},
    limits,
    match_db::{MatchDb, MatchRule},
    message::{kind, put_item, Envelope, InfoRecord},
    metadata::{AttachFlags, Creds, Metadata},
    names::{is_valid_name, AcquireReply, NameFlags},
    notify,
    policy::{PolicyAccess, PolicyRule},
    pool::Pool,
    queue::Queue,
    reply::{ReplyTracker, TimeoutWorker},
    time,
    util::{lock_rank, LockRank},
};

/// Disconnect parks the active counter this far below zero; the counter
/// returns to exactly this value once every holder has drained out.
const ACTIVE_BIAS: i64 = i64::MIN / 2;

/// Connection kinds and capabilities declared at hello.
#[bitflags]
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelloFlags {
    /// The connection is willing to receive file descriptors.
    AcceptFd = 1,
    /// Passive observer of all bus traffic. Privileged.
    Monitor = 1 << 1,
    /// Stand-in owner of one well-known name. Privileged.
    Activator = 1 << 2,
    /// Supplies policy for a name without owning it. Privileged.
    PolicyHolder = 1 << 3,
}

/// Parameters of a hello.
#[derive(Debug)]
pub struct HelloRequest {
    pub flags: BitFlags<HelloFlags>,
    /// Which metadata items this connection wants on incoming messages.
    pub attach_flags: BitFlags<AttachFlags>,
    pub pool_size: u64,
    /// The name an activator or policy holder registers for.
    pub name: Option<String>,
    /// Impersonated credentials; privileged creators only.
    pub creds: Option<Creds>,
    /// Frozen security label; privileged creators only.
    pub seclabel: Option<String>,
    /// Human-readable description for debugging.
    pub description: Option<String>,
}

impl Default for HelloRequest {
    fn default() -> Self {
        Self {
            flags: BitFlags::empty(),
            attach_flags: BitFlags::empty(),
            pool_size: 1 << 20,
            name: None,
            creds: None,
            seclabel: None,
            description: None,
        }
    }
}

/// What a successful hello reports back.
#[derive(Clone, Debug)]
pub struct HelloReply {
    pub id: u64,
    pub bus_flags: BitFlags<BusFlags>,
    pub bloom: BloomParameters,
    pub id128: [u8; 16],
}

/// Receive modes.
#[bitflags]
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvFlags {
    /// Return the next entry without dequeueing it.
    Peek = 1,
    /// Discard the next entry instead of delivering it.
    Drop = 1 << 1,
    /// Only deliver entries at or below the given priority.
    UsePriority = 1 << 2,
}

/// Parameters of a receive.
#[derive(Debug, Default)]
pub struct RecvArgs {
    pub flags: BitFlags<RecvFlags>,
    pub priority: i64,
    /// Must be zero; the reply offset is written by the bus.
    pub offset: u64,
}

/// Outcome of a receive: the pool offset of the delivered record, or zero
/// for a drop.
#[derive(Debug)]
pub struct RecvReply {
    pub offset: u64,
}

/// Selector for connection info queries.
#[derive(Clone, Debug)]
pub enum InfoTarget {
    Id(u64),
    Name(String),
}

/// Mutable connection properties.
#[derive(Debug, Default)]
pub struct ConnUpdate {
    pub attach_flags: Option<BitFlags<AttachFlags>>,
    /// Replacement policy rules; policy holders only.
    pub policy_rules: Option<Vec<PolicyRule>>,
}

/// Which records a name-list query returns.
#[bitflags]
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameListFlags {
    /// Unique ids of all connections.
    Unique = 1,
    /// Owned well-known names.
    Names = 1 << 1,
    /// Names currently held by activators.
    Activators = 1 << 2,
    /// Queued claimers per name.
    Queued = 1 << 3,
}

#[derive(Debug)]
struct OwnedName {
    name: String,
    flags: u64,
}

#[derive(Debug)]
pub(crate) struct ConnState {
    pub(crate) queue: Queue,
    pub(crate) reply_list: Vec<Arc<ReplyTracker>>,
}

impl ConnState {
    /// Index of the tracker expecting a reply for `(reply_dst, cookie)`.
    pub(crate) fn find_reply(&self, reply_dst: &Arc<Connection>, cookie: u64) -> Option<usize> {
        self.reply_list
            .iter()
            .position(|r| Arc::ptr_eq(r.reply_dst(), reply_dst) && r.cookie() == cookie)
    }
}

/// A participant on the bus.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    flags: BitFlags<HelloFlags>,
    attach_flags: AtomicU64,
    description: Option<String>,
    creds: Creds,
    /// Cached metadata used for namespace gating and info queries.
    meta: Metadata,
    /// Frozen impersonation metadata; never augmented with live
    /// credential items.
    owner_meta: Option<Metadata>,
    user: Arc<DomainUser>,
    accounted: AtomicBool,
    bus: Arc<Bus>,
    ep: Arc<Endpoint>,
    pool: Pool,
    match_db: MatchDb,
    pub(crate) state: Mutex<ConnState>,
    names: Mutex<Vec<OwnedName>>,
    name_count: AtomicU32,
    reply_count: AtomicU32,
    active: AtomicI64,
    wait: Event,
    interrupt: AtomicBool,
    pub(crate) work: TimeoutWorker,
}

/// Holding this guard keeps the connection from completing disconnect.
#[must_use = "the active reference is released on drop"]
pub(crate) struct ActiveGuard<'a> {
    conn: &'a Connection,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.conn.release_active();
    }
}

impl Connection {
    pub(crate) fn connect(
        ep: &Arc<Endpoint>,
        req: HelloRequest,
        creds: Creds,
    ) -> Result<(Arc<Connection>, HelloReply)> {
        let HelloRequest {
            flags,
            attach_flags,
            pool_size,
            name,
            creds: faked,
            seclabel,
            description,
        } = req;
        let bus = ep.bus().clone();
        let is_monitor = flags.contains(HelloFlags::Monitor);
        let is_activator = flags.contains(HelloFlags::Activator);
        let is_policy_holder = flags.contains(HelloFlags::PolicyHolder);

        if is_monitor && (is_activator || is_policy_holder) {
            return Err(Error::InvalidArgument(
                "a monitor cannot be an activator or policy holder",
            ));
        }
        if is_activator && is_policy_holder {
            return Err(Error::InvalidArgument(
                "a connection cannot be both activator and policy holder",
            ));
        }
        let privileged = bus.cred_is_privileged(&creds);
        if (is_monitor || is_activator || is_policy_holder) && !privileged {
            return Err(Error::PermissionDenied);
        }
        if (faked.is_some() || seclabel.is_some()) && !privileged {
            return Err(Error::PermissionDenied);
        }
        match &name {
            Some(name) => {
                if !is_activator && !is_policy_holder {
                    return Err(Error::InvalidArgument(
                        "only activators and policy holders install a name",
                    ));
                }
                if !is_valid_name(name, is_policy_holder) {
                    return Err(Error::InvalidArgument("invalid well-known name"));
                }
            }
            None if is_activator || is_policy_holder => {
                return Err(Error::InvalidArgument(
                    "activators and policy holders need a name",
                ));
            }
            None => {}
        }

        let pool = Pool::new(pool_size)?;

        // Impersonated identities are frozen now; message dispatch can
        // only add name and description items on top of this.
        let owner_meta = if faked.is_some() || seclabel.is_some() {
            let identity = match faked {
                Some(faked) => Creds {
                    pid_ns: creds.pid_ns,
                    user_ns: creds.user_ns,
                    ..faked
                },
                None => creds.clone(),
            };
            let mut meta = Metadata::for_creds(&identity);
            if let Some(label) = &seclabel {
                meta.push_seclabel(label);
            }
            Some(meta)
        } else {
            None
        };
        let meta = owner_meta
            .clone()
            .unwrap_or_else(|| Metadata::for_creds(&creds));

        let user = match ep.user() {
            Some(user) => user.clone(),
            None => bus.domain().get_user(creds.uid),
        };
        let id = bus.next_conn_id();

        let conn = Arc::new(Connection {
            id,
            flags,
            attach_flags: AtomicU64::new(attach_flags.bits()),
            description,
            creds,
            meta,
            owner_meta,
            user: user.clone(),
            accounted: AtomicBool::new(false),
            bus: bus.clone(),
            ep: ep.clone(),
            pool,
            match_db: MatchDb::new(),
            state: Mutex::new(ConnState {
                queue: Queue::new(),
                reply_list: Vec::new(),
            }),
            names: Mutex::new(Vec::new()),
            name_count: AtomicU32::new(0),
            reply_count: AtomicU32::new(0),
            active: AtomicI64::new(0),
            wait: Event::new(),
            interrupt: AtomicBool::new(false),
            work: TimeoutWorker::new(),
        });

        if is_policy_holder {
            if let Some(name) = &name {
                bus.policy().update(
                    id,
                    vec![PolicyRule {
                        name: name.clone(),
                        uid: Some(conn.creds.uid),
                        gid: None,
                        access: PolicyAccess::Own,
                    }],
                )?;
            }
        }
        if is_activator {
            if let Some(name) = &name {
                bus.name_registry()
                    .acquire(&conn, name, NameFlags::Activator.into())?;
            }
        }

        let link_result = {
            let _bus_rank = lock_rank(LockRank::Bus);
            let bus_state = bus.state.lock();
            let _ep_rank = lock_rank(LockRank::Endpoint);
            let mut ep_state = ep.state.lock();
            if bus_state.disconnected || ep_state.disconnected {
                Err(Error::Shutdown)
            } else if !privileged
                && user.connections.fetch_add(1, Ordering::SeqCst) + 1 > limits::USER_MAX_CONN
            {
                user.connections.fetch_sub(1, Ordering::SeqCst);
                Err(Error::TooManyOpenFiles)
            } else {
                if !privileged {
                    conn.accounted.store(true, Ordering::SeqCst);
                }
                let _map_rank = lock_rank(LockRank::ConnMap);
                let mut map = bus.connections.write();
                map.conns.insert(id, conn.clone());
                if is_monitor {
                    map.monitors.push(conn.clone());
                }
                ep_state.conns.push(conn.clone());
                Ok(())
            }
        };
        if let Err(e) = link_result {
            if is_activator {
                bus.name_registry().remove_by_conn(&conn);
            }
            bus.policy().purge_owner(id);
            return Err(e);
        }

        conn.work.start(Arc::downgrade(&conn));
        notify::id_change(&bus, id, flags.bits(), true);
        notify::flush(&bus);
        debug!(id, monitor = is_monitor, activator = is_activator, "connection established");

        let reply = HelloReply {
            id,
            bus_flags: bus.flags(),
            bloom: bus.bloom(),
            id128: bus.id128(),
        };
        Ok((conn, reply))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flags(&self) -> BitFlags<HelloFlags> {
        self.flags
    }

    pub fn is_ordinary(&self) -> bool {
        !self
            .flags
            .intersects(HelloFlags::Monitor | HelloFlags::Activator | HelloFlags::PolicyHolder)
    }

    pub fn is_monitor(&self) -> bool {
        self.flags.contains(HelloFlags::Monitor)
    }

    pub fn is_activator(&self) -> bool {
        self.flags.contains(HelloFlags::Activator)
    }

    pub fn is_policy_holder(&self) -> bool {
        self.flags.contains(HelloFlags::PolicyHolder)
    }

    pub fn creds(&self) -> &Creds {
        &self.creds
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub(crate) fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub(crate) fn ep(&self) -> &Arc<Endpoint> {
        &self.ep
    }

    pub(crate) fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub(crate) fn owner_meta(&self) -> Option<&Metadata> {
        self.owner_meta.as_ref()
    }

    pub(crate) fn match_db(&self) -> &MatchDb {
        &self.match_db
    }

    pub(crate) fn reply_count(&self) -> &AtomicU32 {
        &self.reply_count
    }

    pub(crate) fn accepts_fds(&self) -> bool {
        self.flags.contains(HelloFlags::AcceptFd)
    }

    pub(crate) fn attach_flags(&self) -> BitFlags<AttachFlags> {
        BitFlags::from_bits_truncate(self.attach_flags.load(Ordering::SeqCst))
    }

    pub(crate) fn names_add(&self, name: &str, _name_id: u64, flags: u64) {
        let mut names = self.names.lock();
        names.push(OwnedName {
            name: name.to_string(),
            flags,
        });
        self.name_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn names_remove(&self, name: &str) {
        let mut names = self.names.lock();
        if let Some(pos) = names.iter().position(|n| n.name == name) {
            names.remove(pos);
            self.name_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn names_snapshot(&self) -> Vec<(String, u64)> {
        self.names
            .lock()
            .iter()
            .map(|n| (n.name.clone(), n.flags))
            .collect()
    }

    pub(crate) fn owns_name(&self, name: &str) -> bool {
        self.names.lock().iter().any(|n| n.name == name)
    }

    /// List of currently owned well-known names.
    pub fn owned_names(&self) -> Vec<String> {
        self.names.lock().iter().map(|n| n.name.clone()).collect()
    }

    pub(crate) fn name_count(&self) -> u32 {
        self.name_count.load(Ordering::SeqCst)
    }

    /// The connection has not started disconnecting.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) >= 0
    }

    /// Take an active reference, failing once disconnect has begun.
    pub(crate) fn acquire_active(&self) -> Result<ActiveGuard<'_>> {
        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current < 0 {
                return Err(Error::ConnectionReset);
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(ActiveGuard { conn: self }),
                Err(observed) => current = observed,
            }
        }
    }

    fn release_active(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) - 1 == ACTIVE_BIAS {
            self.wake();
        }
    }

    /// Wake receive pollers, synchronous waiters and the disconnect
    /// drain.
    pub(crate) fn wake(&self) {
        self.wait.notify(usize::MAX);
    }

    pub(crate) fn wait_event(&self) -> &Event {
        &self.wait
    }

    /// Deliver the equivalent of a signal to a caller blocked in a
    /// synchronous send on this connection.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn interrupt_pending(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Send a message. Blocks when the message asks for a synchronous
    /// reply; the returned offset then points at the reply record.
    pub fn send(self: &Arc<Self>, env: &mut Envelope) -> Result<SendReply> {
        if !self.is_ordinary() {
            return Err(Error::NotSupported);
        }
        let _active = self.acquire_active()?;
        env.msg.src_id = self.id;
        dispatch::send(&self.ep, Some(self), env)
    }

    /// Receive the next queued message.
    pub fn recv(&self, args: RecvArgs) -> Result<RecvReply> {
        if args.offset != 0 {
            return Err(Error::InvalidArgument("offset must be zero on input"));
        }
        if !self.is_ordinary() && !self.is_monitor() {
            return Err(Error::NotSupported);
        }
        let _active = self.acquire_active()?;
        let use_priority = args.flags.contains(RecvFlags::UsePriority);
        let mut reply_dead: Option<(u64, u64)> = None;
        let offset;
        {
            let _rank = lock_rank(LockRank::Connection);
            let mut st = self.state.lock();
            let key = st.queue.peek(args.priority, use_priority)?;
            if args.flags.contains(RecvFlags::Drop) {
                let Some(entry) = st.queue.remove(key) else {
                    return Err(Error::WouldBlock);
                };
                // The tracker attached to this entry may already be gone,
                // resolved by an incoming reply; only act on it while it
                // still sits on our reply list.
                if let Some(tracker) = &entry.reply {
                    if let Some(pos) = st
                        .reply_list
                        .iter()
                        .position(|r| Arc::ptr_eq(r, tracker))
                    {
                        let tracker = st.reply_list.remove(pos);
                        if tracker.is_sync() {
                            tracker.wake(Err(Error::BrokenPipe));
                        } else {
                            reply_dead = Some((entry.src_id, entry.cookie));
                        }
                    }
                }
                self.pool.free_any(entry.slice);
                offset = 0;
            } else if args.flags.contains(RecvFlags::Peek) {
                let entry = st.queue.get(key).ok_or(Error::WouldBlock)?;
                self.pool.flush(entry.slice)?;
                offset = entry.slice;
            } else {
                let Some(entry) = st.queue.remove(key) else {
                    return Err(Error::WouldBlock);
                };
                entry.install(&self.pool)?;
                offset = entry.slice;
            }
        }
        if let Some((src_id, cookie)) = reply_dead {
            notify::reply_dead(&self.bus, src_id, cookie);
        }
        notify::flush(&self.bus);
        Ok(RecvReply { offset })
    }

    /// Release a published pool slice.
    pub fn free(&self, offset: u64) -> Result<()> {
        let _active = self.acquire_active()?;
        self.pool.free_public(offset)
    }

    /// Cancel all pending synchronous requests carrying `cookie`.
    pub fn cancel(self: &Arc<Self>, cookie: u64) -> Result<()> {
        if self.reply_count.load(Ordering::SeqCst) == 0 {
            return Err(Error::NotFound);
        }
        let _active = self.acquire_active()?;
        let mut found = false;
        {
            let _map_rank = lock_rank(LockRank::ConnMap);
            let map = self.bus.connections.read();
            for other in map.conns.values() {
                if Arc::ptr_eq(other, self) {
                    continue;
                }
                let _rank = lock_rank(LockRank::Connection);
                let mut st = other.state.lock();
                if let Some(pos) = st.find_reply(self, cookie) {
                    if st.reply_list[pos].is_sync() {
                        let tracker = st.reply_list.remove(pos);
                        tracker.wake(Err(Error::Canceled));
                        found = true;
                    }
                }
            }
        }
        if found {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    /// Acquire a well-known name.
    pub fn acquire_name(
        self: &Arc<Self>,
        name: &str,
        flags: BitFlags<NameFlags>,
    ) -> Result<AcquireReply> {
        if !self.is_ordinary() {
            return Err(Error::NotSupported);
        }
        if flags.contains(NameFlags::Activator) {
            return Err(Error::InvalidArgument("activator names come from hello"));
        }
        let _active = self.acquire_active()?;
        self.bus.name_registry().acquire(self, name, flags)
    }

    /// Release a well-known name.
    pub fn release_name(self: &Arc<Self>, name: &str) -> Result<()> {
        if !self.is_ordinary() {
            return Err(Error::NotSupported);
        }
        let _active = self.acquire_active()?;
        self.bus.name_registry().release(self, name)
    }

    /// Write a listing of names and ids into the pool; returns its
    /// offset.
    pub fn name_list(&self, flags: BitFlags<NameListFlags>) -> Result<u64> {
        let _active = self.acquire_active()?;
        let mut items = Vec::new();
        if flags.intersects(NameListFlags::Names | NameListFlags::Activators | NameListFlags::Queued)
        {
            for entry in self.bus.name_registry().snapshot() {
                if self.ep.check_see_access(self, &entry.name).is_err() {
                    continue;
                }
                if flags.contains(NameListFlags::Names) {
                    if let Some(owner) = entry.owner_id {
                        put_list_item(&mut items, owner, entry.flags, Some(&entry.name));
                    }
                }
                if flags.contains(NameListFlags::Activators) {
                    if let Some(activator) = entry.activator_id {
                        put_list_item(
                            &mut items,
                            activator,
                            NameFlags::Activator as u64,
                            Some(&entry.name),
                        );
                    }
                }
                if flags.contains(NameListFlags::Queued) {
                    for (id, qflags) in entry.queued {
                        put_list_item(&mut items, id, qflags, Some(&entry.name));
                    }
                }
            }
        }
        if flags.contains(NameListFlags::Unique) {
            for (id, conn_flags) in self.bus.conn_ids() {
                put_list_item(&mut items, id, conn_flags, None);
            }
        }
        let record = InfoRecord::encode(0, flags.bits(), &items);
        let offset = self.pool.alloc(record)?;
        self.pool.flush(offset)?;
        self.pool.publish(offset)?;
        Ok(offset)
    }

    /// Install a match rule.
    pub fn add_match(&self, rule: MatchRule) -> Result<()> {
        if !self.is_ordinary() && !self.is_monitor() {
            return Err(Error::NotSupported);
        }
        let _active = self.acquire_active()?;
        if let Some(mask) = &rule.bloom_mask {
            if mask.len() * 8 != self.bus.bloom().size {
                return Err(Error::InvalidArgument(
                    "bloom mask does not match the bus parameters",
                ));
            }
        }
        self.match_db.add(rule);
        Ok(())
    }

    /// Remove the match rule registered under `cookie`.
    pub fn remove_match(&self, cookie: u64) -> Result<()> {
        let _active = self.acquire_active()?;
        self.match_db.remove(cookie);
        Ok(())
    }

    /// Write an info record about a peer into the pool; returns its
    /// offset.
    pub fn conn_info(&self, target: &InfoTarget, attach: BitFlags<AttachFlags>) -> Result<u64> {
        let _active = self.acquire_active()?;
        let owner = match target {
            InfoTarget::Name(name) => {
                if !is_valid_name(name, false) {
                    return Err(Error::InvalidArgument("invalid well-known name"));
                }
                self.ep.check_see_access(self, name)?;
                let resolved = self
                    .bus
                    .name_registry()
                    .resolve(name)
                    .ok_or(Error::NotFound)?;
                resolved.owner.ok_or(Error::NotFound)?
            }
            InfoTarget::Id(id) => {
                let owner = self.bus.find_conn(*id).ok_or(Error::NotFound)?;
                self.ep.check_src_names(&owner, self)?;
                owner
            }
        };

        let mut items = Vec::new();
        // Cached credentials stay within their namespaces.
        if self.meta.ns_eq(&owner.meta) {
            owner.meta.encode_items(&mut items);
        }
        let extra = attach & (AttachFlags::Names | AttachFlags::Description);
        if !extra.is_empty() {
            let mut meta = Metadata::new();
            meta.append(&owner, 0, extra);
            meta.encode_items(&mut items);
        }
        let record = InfoRecord::encode(owner.id, owner.flags.bits(), &items);
        let offset = self.pool.alloc(record)?;
        self.pool.flush(offset)?;
        self.pool.publish(offset)?;
        Ok(offset)
    }

    /// Update attach flags or, for policy holders, policy rules.
    pub fn update(&self, update: ConnUpdate) -> Result<()> {
        let _active = self.acquire_active()?;
        if let Some(attach) = update.attach_flags {
            if !self.is_ordinary() && !self.is_monitor() {
                return Err(Error::NotSupported);
            }
            self.attach_flags.store(attach.bits(), Ordering::SeqCst);
        }
        if let Some(rules) = update.policy_rules {
            if !self.is_policy_holder() {
                return Err(Error::NotSupported);
            }
            self.bus.policy().update(self.id, rules)?;
        }
        Ok(())
    }

    /// Disconnect from the bus.
    ///
    /// With `ensure_queue_empty`, refuses with [`Error::ResourceBusy`]
    /// while undelivered messages remain. A second disconnect reports
    /// [`Error::AlreadyFinished`].
    pub fn disconnect(self: &Arc<Self>, ensure_queue_empty: bool) -> Result<()> {
        {
            let _rank = lock_rank(LockRank::Connection);
            let st = self.state.lock();
            if !self.is_active() {
                return Err(Error::AlreadyFinished);
            }
            if ensure_queue_empty && st.queue.msg_count > 0 {
                return Err(Error::ResourceBusy);
            }
            self.active.fetch_add(ACTIVE_BIAS, Ordering::SeqCst);
        }
        self.wake();

        // Drain every active holder; pending synchronous waits observe
        // the inactive state and bail out with ConnectionReset.
        loop {
            if self.active.load(Ordering::SeqCst) == ACTIVE_BIAS {
                break;
            }
            let listener = self.wait.listen();
            if self.active.load(Ordering::SeqCst) == ACTIVE_BIAS {
                break;
            }
            listener.wait();
        }

        self.work.cancel_sync();

        {
            let _ep_rank = lock_rank(LockRank::Endpoint);
            let mut ep_state = self.ep.state.lock();
            let _map_rank = lock_rank(LockRank::ConnMap);
            let mut map = self.bus.connections.write();
            map.conns.remove(&self.id);
            map.monitors.retain(|m| !Arc::ptr_eq(m, self));
            ep_state.conns.retain(|c| !Arc::ptr_eq(c, self));
        }

        // Owned names pass on; messages queued under them migrate back to
        // their activators.
        self.bus.name_registry().remove_by_conn(self);
        self.bus.policy().purge_owner(self.id);

        let (entries, mut replies) = {
            let _rank = lock_rank(LockRank::Connection);
            let mut st = self.state.lock();
            (st.queue.drain_all(), std::mem::take(&mut st.reply_list))
        };
        for entry in entries {
            if let Some(tracker) = &entry.reply {
                if let Some(pos) = replies.iter().position(|r| Arc::ptr_eq(r, tracker)) {
                    replies.remove(pos);
                }
                notify::reply_dead(&self.bus, entry.src_id, entry.cookie);
                if tracker.is_sync() {
                    tracker.wake(Err(Error::BrokenPipe));
                }
            }
            self.pool.free_any(entry.slice);
        }
        for tracker in replies {
            if tracker.is_sync() {
                tracker.wake(Err(Error::BrokenPipe));
            } else {
                notify::reply_dead(&self.bus, tracker.reply_dst().id(), tracker.cookie());
            }
        }

        notify::id_change(&self.bus, self.id, self.flags.bits(), false);
        notify::flush(&self.bus);
        debug!(id = self.id, "connection closed");
        Ok(())
    }

    /// Move queued messages and reply trackers from `src` to `dst`,
    /// filtered to `name_id` when non-zero. Runs under the bus lock
    /// during name handoffs.
    pub(crate) fn move_messages(
        dst: &Arc<Connection>,
        src: &Arc<Connection>,
        name_id: u64,
    ) -> Result<()> {
        debug_assert!(!Arc::ptr_eq(dst, src));
        let (entries, mut replies) = {
            let _rank = lock_rank(LockRank::Connection);
            let mut st = src.state.lock();
            let entries = if name_id > 0 {
                st.queue.drain_for_name(name_id)
            } else {
                st.queue.drain_all()
            };
            let mut moved = Vec::new();
            st.reply_list.retain(|r| {
                if name_id > 0 && r.name_id() != name_id {
                    true
                } else {
                    moved.push(r.clone());
                    false
                }
            });
            (entries, moved)
        };
        {
            let _rank = lock_rank(LockRank::Connection);
            let mut st = dst.state.lock();
            if !dst.is_active() {
                for entry in &entries {
                    src.pool.free_any(entry.slice);
                }
                return Err(Error::ConnectionReset);
            }
            for mut entry in entries {
                match Pool::move_slice(&dst.pool, &src.pool, entry.slice) {
                    Ok(offset) => {
                        entry.slice = offset;
                        entry.user = None;
                        st.queue.add(entry);
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping a message during migration");
                    }
                }
            }
            st.reply_list.append(&mut replies);
        }
        dst.wake();
        Ok(())
    }

    /// Scan the reply list for expired deadlines; the timeout worker's
    /// body. Synchronous waiters handle their own deadline unless an
    /// interrupt left their tracker behind.
    pub(crate) fn reply_timeout_scan(self: &Arc<Self>) {
        let now = time::monotonic_ns();
        let mut next_deadline: Option<u64> = None;
        let mut expirations: Vec<(u64, u64)> = Vec::new();
        {
            let _rank = lock_rank(LockRank::Connection);
            let mut st = self.state.lock();
            if !self.is_active() {
                return;
            }
            st.reply_list.retain(|tracker| {
                let inner = tracker.inner.lock();
                if tracker.is_sync() && !inner.interrupted {
                    return true;
                }
                if inner.deadline_ns > now {
                    next_deadline = Some(
                        next_deadline
                            .map_or(inner.deadline_ns, |n| n.min(inner.deadline_ns)),
                    );
                    return true;
                }
                if inner.deadline_ns != 0 && !inner.interrupted {
                    expirations.push((tracker.reply_dst().id(), tracker.cookie()));
                }
                false
            });
        }
        for (dst_id, cookie) in expirations {
            notify::reply_timeout(&self.bus, dst_id, cookie);
        }
        if let Some(deadline) = next_deadline {
            self.work.schedule(deadline);
        }
        notify::flush(&self.bus);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.accounted.load(Ordering::SeqCst) {
            self.user.connections.fetch_sub(1, Ordering::SeqCst);
        }
        self.work.cancel_async();
    }
}

fn put_list_item(buf: &mut Vec<u8>, id: u64, flags: u64, name: Option<&str>) {
    let name = name.unwrap_or("");
    let mut payload = Vec::with_capacity(16 + name.len());
    payload.extend_from_slice(&id.to_le_bytes());
    payload.extend_from_slice(&flags.to_le_bytes());
    payload.extend_from_slice(name.as_bytes());
    put_item(buf, kind::LIST_NAME, &payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_bias_is_negative_and_roomy() {
        assert!(ACTIVE_BIAS < 0);
        // Even with a large holder count the biased value stays negative.
        assert!(ACTIVE_BIAS + 1_000_000 < 0);
    }
}
