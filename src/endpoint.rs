//! Endpoints.
//!
//! An endpoint is a named access point on one bus. The default endpoint
//! `bus` is created with the bus; custom endpoints carry their own policy
//! database (checked *in addition* to the bus policy) and account their
//! connections against an anonymous per-endpoint user. The layered access
//! checks of the dispatch path live here.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::{
    bus::Bus,
    connection::{Connection, HelloReply, HelloRequest},
    domain::DomainUser,
    error::{Error, Result},
    message::Envelope,
    metadata::Creds,
    policy::{Policy, PolicyDb},
    util::{lock_rank, LockRank},
};

#[derive(Debug)]
pub(crate) struct EpState {
    pub(crate) disconnected: bool,
    pub(crate) conns: Vec<Arc<Connection>>,
}

/// A named bind-point on a bus.
pub struct Endpoint {
    name: String,
    id: u64,
    bus: Arc<Bus>,
    /// Device-node properties for the transport layer.
    mode: u32,
    uid: u32,
    gid: u32,
    has_policy: bool,
    policy: PolicyDb,
    /// Anonymous accounting user of a custom endpoint.
    user: Option<Arc<DomainUser>>,
    pub(crate) state: Mutex<EpState>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("has_policy", &self.has_policy)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    pub(crate) fn make_default(
        bus: &Arc<Bus>,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<Arc<Endpoint>> {
        Self::make_on(bus, "bus", mode, uid, gid, None, false)
    }

    /// Create a custom endpoint. Custom endpoints always check their own
    /// policy first and never leak whether a denied name exists.
    pub fn make(
        bus: &Arc<Bus>,
        name: &str,
        mode: u32,
        creds: &Creds,
        policy: Option<Box<dyn Policy>>,
    ) -> Result<Arc<Endpoint>> {
        if !bus.cred_is_privileged(creds) {
            return Err(Error::PermissionDenied);
        }
        Self::make_on(bus, name, mode, creds.uid, creds.gid, policy, true)
    }

    fn make_on(
        bus: &Arc<Bus>,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        policy: Option<Box<dyn Policy>>,
        custom: bool,
    ) -> Result<Arc<Endpoint>> {
        if name.is_empty()
            || name.len() > 63
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(Error::InvalidArgument("invalid endpoint name"));
        }
        let has_policy = policy.is_some();
        let policy = match policy {
            Some(engine) => PolicyDb::with_engine(engine),
            None => PolicyDb::open(),
        };
        let user = custom.then(|| bus.domain().anonymous_user());

        let _rank = lock_rank(LockRank::Bus);
        let mut bus_state = bus.state.lock();
        if bus_state.disconnected {
            return Err(Error::Shutdown);
        }
        if bus_state.endpoints.iter().any(|e| e.name == name) {
            return Err(Error::AlreadyExists);
        }
        bus_state.ep_seq_last += 1;
        let ep = Arc::new(Endpoint {
            name: name.to_string(),
            id: bus_state.ep_seq_last,
            bus: bus.clone(),
            mode,
            uid,
            gid,
            has_policy,
            policy,
            user,
            state: Mutex::new(EpState {
                disconnected: false,
                conns: Vec::new(),
            }),
        });
        bus_state.endpoints.push(ep.clone());
        info!(bus = %bus.name(), name, "endpoint created");
        Ok(ep)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn device_node(&self) -> (u32, u32, u32) {
        (self.mode, self.uid, self.gid)
    }

    pub(crate) fn user(&self) -> Option<&Arc<DomainUser>> {
        self.user.as_ref()
    }

    /// Attach a new connection.
    pub fn hello(
        self: &Arc<Self>,
        req: HelloRequest,
        creds: Creds,
    ) -> Result<(Arc<Connection>, HelloReply)> {
        Connection::connect(self, req, creds)
    }

    /// Tear the endpoint down, disconnecting every connection on it.
    pub fn disconnect(self: &Arc<Self>) {
        {
            let _rank = lock_rank(LockRank::Endpoint);
            let mut state = self.state.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
        }
        {
            let _rank = lock_rank(LockRank::Bus);
            let mut bus_state = self.bus.state.lock();
            bus_state.endpoints.retain(|e| !Arc::ptr_eq(e, self));
        }
        loop {
            let conn = {
                let _rank = lock_rank(LockRank::Endpoint);
                self.state.lock().conns.first().cloned()
            };
            match conn {
                Some(conn) => {
                    let _ = conn.disconnect(false);
                }
                None => break,
            }
        }
        info!(name = %self.name, "endpoint closed");
    }

    /// May `conn` learn that `name` exists through this endpoint? Custom
    /// endpoints answer "no such name" rather than "denied".
    pub(crate) fn check_see_access(&self, conn: &Connection, name: &str) -> Result<()> {
        if !self.has_policy {
            return Ok(());
        }
        if self.policy.check_see(conn.creds(), name) {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    /// Gate a name notification on the visibility of its subject.
    pub(crate) fn check_notification(&self, conn: &Connection, env: &Envelope) -> Result<()> {
        if !env.is_notification() || !self.has_policy {
            return Ok(());
        }
        match env.notify.as_ref().and_then(|n| n.subject_name()) {
            Some(name) => self.check_see_access(conn, name),
            None => Ok(()),
        }
    }

    /// May `dst` see at least one of the names `src` owns?
    pub(crate) fn check_src_names(&self, src: &Connection, dst: &Connection) -> Result<()> {
        if !self.has_policy {
            return Ok(());
        }
        for (name, _) in src.names_snapshot() {
            if self.check_see_access(dst, &name).is_ok() {
                return Ok(());
            }
        }
        Err(Error::NotFound)
    }

    fn custom_talk_access(&self, src: &Connection, dst: &Connection) -> Result<()> {
        if !self.has_policy {
            return Ok(());
        }
        if self.policy.check_talk(src.creds(), dst.creds()) {
            Ok(())
        } else {
            // Don't leak whether the peer exists on a custom endpoint.
            Err(Error::NotFound)
        }
    }

    fn default_talk_access(&self, src: &Connection, dst: &Connection) -> bool {
        self.bus.cred_is_privileged(src.creds()) || src.creds().uid == dst.creds().uid
    }

    /// May `src` unicast to `dst`?
    pub(crate) fn check_talk_access(&self, src: &Connection, dst: &Connection) -> Result<()> {
        self.custom_talk_access(src, dst)?;
        if self.default_talk_access(src, dst) {
            return Ok(());
        }
        if self.bus.policy().check_talk(src.creds(), dst.creds()) {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    /// May `src` broadcast to `dst`?
    pub(crate) fn check_broadcast(&self, src: &Connection, dst: &Connection) -> Result<()> {
        self.custom_talk_access(src, dst)?;
        if self.default_talk_access(src, dst) {
            return Ok(());
        }
        // A sender owning names may always signal a destination owning
        // none; services signal their clients freely. Broadcasts aimed at
        // named services still go through the bus policy.
        if src.name_count() > 0 && dst.name_count() == 0 {
            return Ok(());
        }
        if self.bus.policy().check_talk(src.creds(), dst.creds()) {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    /// May `conn` own `name`?
    pub(crate) fn check_own_access(&self, conn: &Connection, name: &str) -> Result<()> {
        if self.has_policy && !self.policy.check_own(conn.creds(), name) {
            return Err(Error::PermissionDenied);
        }
        if self.bus.cred_is_privileged(conn.creds()) {
            return Ok(());
        }
        if self.bus.policy().check_own(conn.creds(), name) {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }
}
