//! Lock-ordering assertions.
//!
//! The cross-object lock order is `domain → bus → endpoint → name registry
//! → connection map → connection`. Leaf locks (pool, match db, reply
//! tracker, notification queue) may be taken below any of these. Each
//! ranked acquisition goes through [`lock_rank`], which asserts in debug
//! builds that the current thread only ever locks downward.

#![allow(dead_code)]

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum LockRank {
    Domain = 1,
    Bus = 2,
    Endpoint = 3,
    NameRegistry = 4,
    ConnMap = 5,
    Connection = 6,
}

#[cfg(debug_assertions)]
mod imp {
    use super::LockRank;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
    }

    #[must_use = "the rank is released when the token is dropped"]
    pub(crate) struct RankToken(LockRank);

    pub(crate) fn lock_rank(rank: LockRank) -> RankToken {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&top) = held.last() {
                assert!(
                    rank > top,
                    "lock order violation: acquiring {rank:?} while holding {top:?}"
                );
            }
            held.push(rank);
        });
        RankToken(rank)
    }

    impl Drop for RankToken {
        fn drop(&mut self) {
            HELD.with(|held| {
                let mut held = held.borrow_mut();
                if let Some(pos) = held.iter().rposition(|&r| r == self.0) {
                    held.remove(pos);
                }
            });
        }
    }
}

#[cfg(not(debug_assertions))]
mod imp {
    use super::LockRank;

    pub(crate) struct RankToken;

    #[inline]
    pub(crate) fn lock_rank(_rank: LockRank) -> RankToken {
        RankToken
    }
}

pub(crate) use imp::{lock_rank, RankToken};

/// Round up to the next multiple of eight.
pub(crate) fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_nest_downward() {
        let _bus = lock_rank(LockRank::Bus);
        let _ep = lock_rank(LockRank::Endpoint);
        let _conn = lock_rank(LockRank::Connection);
    }

    #[test]
    fn rank_released_on_drop() {
        {
            let _conn = lock_rank(LockRank::Connection);
        }
        let _bus = lock_rank(LockRank::Bus);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    #[cfg(debug_assertions)]
    fn upward_acquisition_panics() {
        let _conn = lock_rank(LockRank::Connection);
        let _bus = lock_rank(LockRank::Bus);
    }

    #[test]
    fn align8_rounds_up() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
    }
}
