//! Policy oracle seam.
//!
//! The bus consults policy as a boolean oracle: may these credentials see
//! a name, talk to a peer, own a name? The engine behind the oracle is
//! supplied by the embedder; [`PolicyDb::open`] yields the allow-all
//! default a bus or endpoint runs with when no policy was installed.

use crate::{
    error::Result,
    metadata::Creds,
};

/// Access classes a policy rule can grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyAccess {
    See,
    Talk,
    Own,
}

/// One rule handed to the engine, e.g. by a policy-holder connection.
#[derive(Clone, Debug)]
pub struct PolicyRule {
    pub name: String,
    /// Restrict the rule to one uid, if set.
    pub uid: Option<u32>,
    /// Restrict the rule to one gid, if set.
    pub gid: Option<u32>,
    pub access: PolicyAccess,
}

/// The boolean policy oracle.
pub trait Policy: Send + Sync {
    /// May `viewer` learn that `name` exists?
    fn can_see(&self, viewer: &Creds, name: &str) -> bool;

    /// May `src` send unicast messages to `dst`?
    fn can_talk(&self, src: &Creds, dst: &Creds) -> bool;

    /// May `requester` own `name`?
    fn can_own(&self, requester: &Creds, name: &str) -> bool;

    /// Install or replace the rules registered by `owner_id`.
    fn update(&self, owner_id: u64, rules: Vec<PolicyRule>) -> Result<()> {
        let _ = (owner_id, rules);
        Ok(())
    }

    /// Drop every rule registered by `owner_id`.
    fn purge_owner(&self, owner_id: u64) {}
}

/// The open policy: everything is allowed.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Policy for AllowAll {
    fn can_see(&self, _viewer: &Creds, _name: &str) -> bool {
        true
    }

    fn can_talk(&self, _src: &Creds, _dst: &Creds) -> bool {
        true
    }

    fn can_own(&self, _requester: &Creds, _name: &str) -> bool {
        true
    }
}

/// A policy database attached to a bus or a custom endpoint.
pub struct PolicyDb {
    engine: Option<Box<dyn Policy>>,
}

impl std::fmt::Debug for PolicyDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyDb")
            .field("engine", &self.engine.is_some())
            .finish()
    }
}

impl Default for PolicyDb {
    fn default() -> Self {
        Self::open()
    }
}

impl PolicyDb {
    /// No installed engine; every check passes.
    pub fn open() -> Self {
        Self { engine: None }
    }

    pub fn with_engine(engine: Box<dyn Policy>) -> Self {
        Self {
            engine: Some(engine),
        }
    }

    pub fn has_engine(&self) -> bool {
        self.engine.is_some()
    }

    pub(crate) fn check_see(&self, viewer: &Creds, name: &str) -> bool {
        self.engine
            .as_ref()
            .map(|e| e.can_see(viewer, name))
            .unwrap_or(true)
    }

    pub(crate) fn check_talk(&self, src: &Creds, dst: &Creds) -> bool {
        self.engine
            .as_ref()
            .map(|e| e.can_talk(src, dst))
            .unwrap_or(true)
    }

    pub(crate) fn check_own(&self, requester: &Creds, name: &str) -> bool {
        self.engine
            .as_ref()
            .map(|e| e.can_own(requester, name))
            .unwrap_or(true)
    }

    pub(crate) fn update(&self, owner_id: u64, rules: Vec<PolicyRule>) -> Result<()> {
        match &self.engine {
            Some(e) => e.update(owner_id, rules),
            None => Ok(()),
        }
    }

    pub(crate) fn purge_owner(&self, owner_id: u64) {
        if let Some(e) = &self.engine {
            e.purge_owner(owner_id);
        }
    }
}
