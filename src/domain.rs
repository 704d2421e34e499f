//! Domains and per-user accounting.
//!
//! A domain is the container buses live in. It also owns the per-user
//! resource counters: how many buses and connections each uid holds.
//! Custom endpoints account against a shared anonymous user instead.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::info;

use crate::{
    bus::Bus,
    util::{lock_rank, LockRank},
};

/// Accounting bucket of custom-endpoint connections.
const ANONYMOUS_UID: u32 = u32::MAX;

/// Resource accounting for one uid on a domain.
#[derive(Debug, Default)]
pub struct DomainUser {
    pub uid: u32,
    pub(crate) buses: AtomicU32,
    pub(crate) connections: AtomicU32,
}

impl DomainUser {
    /// Number of buses this user currently holds.
    pub fn bus_count(&self) -> u32 {
        self.buses.load(Ordering::SeqCst)
    }

    /// Number of connections this user currently holds.
    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub(crate) struct DomainState {
    pub(crate) disconnected: bool,
    pub(crate) buses: Vec<Arc<Bus>>,
    pub(crate) bus_seq_last: u64,
}

/// A container of buses with per-user accounting.
#[derive(Debug)]
pub struct Domain {
    name: String,
    id: u64,
    pub(crate) state: Mutex<DomainState>,
    users: Mutex<HashMap<u32, Arc<DomainUser>>>,
}

static DOMAIN_SEQ: AtomicU64 = AtomicU64::new(0);

impl Domain {
    pub fn new(name: &str) -> Arc<Domain> {
        let domain = Arc::new(Domain {
            name: name.to_string(),
            id: DOMAIN_SEQ.fetch_add(1, Ordering::SeqCst) + 1,
            state: Mutex::new(DomainState {
                disconnected: false,
                buses: Vec::new(),
                bus_seq_last: 0,
            }),
            users: Mutex::new(HashMap::new()),
        });
        info!(name, "domain created");
        domain
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The accounting bucket for `uid`, created on first use.
    pub fn get_user(&self, uid: u32) -> Arc<DomainUser> {
        let mut users = self.users.lock();
        users
            .entry(uid)
            .or_insert_with(|| {
                Arc::new(DomainUser {
                    uid,
                    ..DomainUser::default()
                })
            })
            .clone()
    }

    pub(crate) fn anonymous_user(&self) -> Arc<DomainUser> {
        self.get_user(ANONYMOUS_UID)
    }

    /// Find a bus by name.
    pub fn find_bus(&self, name: &str) -> Option<Arc<Bus>> {
        let _rank = lock_rank(LockRank::Domain);
        self.state
            .lock()
            .buses
            .iter()
            .find(|b| b.name() == name)
            .cloned()
    }

    /// Tear the domain down, cascading through every bus.
    pub fn disconnect(&self) {
        {
            let _rank = lock_rank(LockRank::Domain);
            let mut state = self.state.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
        }
        loop {
            let bus = {
                let _rank = lock_rank(LockRank::Domain);
                self.state.lock().buses.first().cloned()
            };
            match bus {
                Some(bus) => bus.disconnect(),
                None => break,
            }
        }
        info!(name = %self.name, "domain closed");
    }
}
