//! Per-connection match subscriptions.
//!
//! Broadcasts and bus-originated notifications are only delivered to
//! connections with a matching rule. A rule is a conjunction of
//! predicates; the rules of a connection OR together. Rules are keyed by a
//! caller-chosen cookie, and add/remove are idempotent per cookie.

use parking_lot::RwLock;

use crate::{
    connection::Connection,
    message::{Envelope, SRC_BUS},
    notify::Notify,
};

/// Predicates over bus-originated notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotifyMatch {
    /// A well-known name appeared; `None` matches any name.
    NameAdd(Option<String>),
    /// A well-known name vanished.
    NameRemove(Option<String>),
    /// A well-known name changed owner.
    NameChange(Option<String>),
    /// A connection appeared; `None` matches any id.
    IdAdd(Option<u64>),
    /// A connection vanished.
    IdRemove(Option<u64>),
}

/// One subscription rule.
///
/// An all-default rule (no predicates) matches every message.
#[derive(Clone, Debug, Default)]
pub struct MatchRule {
    pub cookie: u64,
    /// Match messages from this unique id.
    pub src_id: Option<u64>,
    /// Match messages from the current owner of this name.
    pub src_name: Option<String>,
    /// Bloom mask; the sender's filter must cover every set bit.
    pub bloom_mask: Option<Vec<u64>>,
    /// Notification predicates; any one of them matching suffices.
    pub notify: Vec<NotifyMatch>,
}

impl MatchRule {
    pub fn with_cookie(cookie: u64) -> Self {
        Self {
            cookie,
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.src_id.is_none()
            && self.src_name.is_none()
            && self.bloom_mask.is_none()
            && self.notify.is_empty()
    }

    fn matches_user(&self, src: Option<&Connection>, env: &Envelope) -> bool {
        // Notification predicates can never be satisfied by a user message.
        if !self.notify.is_empty() {
            return false;
        }
        if let Some(id) = self.src_id {
            if env.msg.src_id != id {
                return false;
            }
        }
        if let Some(name) = &self.src_name {
            match src {
                Some(src) if src.owns_name(name) => {}
                _ => return false,
            }
        }
        if let Some(mask) = &self.bloom_mask {
            let Some(filter) = &env.bloom else {
                return false;
            };
            if filter.len() != mask.len() {
                return false;
            }
            if !mask.iter().zip(filter).all(|(m, f)| f & m == *m) {
                return false;
            }
        }
        true
    }

    fn matches_notification(&self, env: &Envelope) -> bool {
        if self.is_empty() {
            return true;
        }
        // A rule carrying user-message predicates cannot match the bus.
        if self.src_id.is_some() || self.src_name.is_some() || self.bloom_mask.is_some() {
            return false;
        }
        let Some(notify) = &env.notify else {
            return false;
        };
        self.notify.iter().any(|pred| pred_matches(pred, notify))
    }
}

fn pred_matches(pred: &NotifyMatch, notify: &Notify) -> bool {
    let name_ok = |want: &Option<String>, got: &str| match want {
        Some(want) => want == got,
        None => true,
    };
    match (pred, notify) {
        (NotifyMatch::NameAdd(want), Notify::NameAdd { name, .. }) => name_ok(want, name),
        (NotifyMatch::NameRemove(want), Notify::NameRemove { name, .. }) => name_ok(want, name),
        (NotifyMatch::NameChange(want), Notify::NameChange { name, .. }) => name_ok(want, name),
        (NotifyMatch::IdAdd(want), Notify::IdAdd { id, .. }) => {
            want.map(|w| w == *id).unwrap_or(true)
        }
        (NotifyMatch::IdRemove(want), Notify::IdRemove { id, .. }) => {
            want.map(|w| w == *id).unwrap_or(true)
        }
        _ => false,
    }
}

/// The subscription store of one connection.
#[derive(Debug, Default)]
pub struct MatchDb {
    rules: RwLock<Vec<MatchRule>>,
}

impl MatchDb {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Install a rule, replacing any previous rule with the same cookie.
    pub(crate) fn add(&self, rule: MatchRule) {
        let mut rules = self.rules.write();
        rules.retain(|r| r.cookie != rule.cookie);
        rules.push(rule);
    }

    /// Remove the rule registered under `cookie`, if any.
    pub(crate) fn remove(&self, cookie: u64) {
        self.rules.write().retain(|r| r.cookie != cookie);
    }

    /// Does any rule accept this message? The hot-path query of the
    /// broadcast loop.
    pub(crate) fn matches(&self, src: Option<&Connection>, env: &Envelope) -> bool {
        let rules = self.rules.read();
        if env.msg.src_id == SRC_BUS {
            rules.iter().any(|r| r.matches_notification(env))
        } else {
            rules.iter().any(|r| r.matches_user(src, env))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Envelope;

    fn user_msg(src_id: u64, bloom: Option<Vec<u64>>) -> Envelope {
        let mut env = Envelope::broadcast(1, bloom, vec![]).unwrap();
        env.msg.src_id = src_id;
        env
    }

    fn notification(notify: Notify) -> Envelope {
        Envelope::for_notify(crate::message::DST_BROADCAST, 0, notify)
    }

    #[test]
    fn empty_rule_matches_everything() {
        let db = MatchDb::new();
        db.add(MatchRule::with_cookie(1));
        assert!(db.matches(None, &user_msg(5, None)));
        assert!(db.matches(
            None,
            &notification(Notify::IdAdd { id: 9, flags: 0 })
        ));
    }

    #[test]
    fn src_id_predicate_filters() {
        let db = MatchDb::new();
        db.add(MatchRule {
            src_id: Some(7),
            ..MatchRule::with_cookie(1)
        });
        assert!(db.matches(None, &user_msg(7, None)));
        assert!(!db.matches(None, &user_msg(8, None)));
    }

    #[test]
    fn bloom_superset_is_required() {
        let db = MatchDb::new();
        db.add(MatchRule {
            bloom_mask: Some(vec![0b1010]),
            ..MatchRule::with_cookie(1)
        });
        assert!(db.matches(None, &user_msg(1, Some(vec![0b1110]))));
        assert!(!db.matches(None, &user_msg(1, Some(vec![0b0110]))));
        // No filter at all: predicate cannot hold.
        assert!(!db.matches(None, &user_msg(1, None)));
    }

    #[test]
    fn notification_rules_do_not_catch_user_messages() {
        let db = MatchDb::new();
        db.add(MatchRule {
            notify: vec![NotifyMatch::NameAdd(Some("com.example.x".into()))],
            ..MatchRule::with_cookie(1)
        });
        assert!(!db.matches(None, &user_msg(1, None)));
        assert!(db.matches(
            None,
            &notification(Notify::NameAdd {
                name: "com.example.x".into(),
                old_id: 0,
                new_id: 3,
                flags: 0,
            })
        ));
        assert!(!db.matches(
            None,
            &notification(Notify::NameAdd {
                name: "com.example.y".into(),
                old_id: 0,
                new_id: 3,
                flags: 0,
            })
        ));
    }

    #[test]
    fn add_and_remove_are_idempotent_by_cookie() {
        let db = MatchDb::new();
        db.add(MatchRule {
            src_id: Some(1),
            ..MatchRule::with_cookie(5)
        });
        db.add(MatchRule {
            src_id: Some(2),
            ..MatchRule::with_cookie(5)
        });
        assert!(!db.matches(None, &user_msg(1, None)));
        assert!(db.matches(None, &user_msg(2, None)));
        db.remove(5);
        db.remove(5);
        assert!(!db.matches(None, &user_msg(2, None)));
    }
}
