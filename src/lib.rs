//! An embeddable, capability-aware message bus core with D-Bus-style
//! semantics.
//!
//! Clients connect to a named [`Bus`] through an [`Endpoint`], acquire
//! well-known names, exchange unicast, broadcast and synchronous
//! request/reply messages, and read delivered records out of a
//! per-connection receive [`Pool`]. Monitors passively observe all
//! traffic; activators hold a name until a real implementor takes over,
//! at which point queued messages migrate.
//!
//! ```no_run
//! use busk::{
//!     Bus, BusMake, BloomParameters, Creds, Domain, Envelope, HelloRequest, Item,
//!     PolicyDb, RecvArgs,
//! };
//!
//! # fn main() -> busk::Result<()> {
//! let domain = Domain::new("example");
//! let creds = Creds::current();
//! let bus = Bus::make(
//!     &domain,
//!     BusMake {
//!         name: format!("{}-example", creds.uid),
//!         bloom: BloomParameters::default(),
//!         flags: Default::default(),
//!         mode: 0o666,
//!     },
//!     creds.clone(),
//!     PolicyDb::open(),
//! )?;
//! let ep = bus.default_endpoint().expect("fresh bus");
//!
//! let (alice, _) = ep.hello(HelloRequest::default(), creds.clone())?;
//! let (bob, hello) = ep.hello(HelloRequest::default(), creds)?;
//!
//! let mut msg = Envelope::to_id(hello.id, 1, vec![Item::Payload(b"hi".to_vec())])?;
//! alice.send(&mut msg)?;
//! let received = bob.recv(RecvArgs::default())?;
//! let record = bob.pool().read(received.offset)?;
//! # let _ = record;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod connection;
mod dispatch;
pub mod domain;
pub mod endpoint;
pub mod error;
pub mod limits;
pub mod match_db;
pub mod message;
pub mod metadata;
pub mod names;
mod notify;
pub mod policy;
pub mod pool;
mod queue;
mod reply;
pub mod time;
#[cfg(feature = "tracing-subscriber")]
pub mod tracing_subscriber;
mod util;

pub use bus::{BloomParameters, Bus, BusFlags, BusMake};
pub use connection::{
    ConnUpdate, Connection, HelloFlags, HelloReply, HelloRequest, InfoTarget, NameListFlags,
    RecvArgs, RecvFlags, RecvReply,
};
pub use dispatch::SendReply;
pub use domain::{Domain, DomainUser};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use match_db::{MatchRule, NotifyMatch};
pub use message::{
    Envelope, InfoRecord, Item, Msg, MsgFlags, ReceivedItem, ReceivedMsg, DST_BROADCAST, DST_NAME,
    SRC_BUS,
};
pub use metadata::{AttachFlags, Capability, Creds, Metadata};
pub use names::{is_valid_name, AcquireReply, NameFlags, NameRegistry};
pub use policy::{AllowAll, Policy, PolicyAccess, PolicyDb, PolicyRule};
pub use pool::Pool;
