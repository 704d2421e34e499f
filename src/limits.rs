//! Fixed resource limits.
//!
//! Every limit is enforced at its acquisition point and bypassed by holders
//! of the IPC-owner capability.

/// Maximum number of messages a connection queues before senders are
/// turned away.
pub const CONN_MAX_MSGS: usize = 256;

/// Per-sending-user share of a receive queue. Accounting only starts once
/// the queue has grown beyond this many entries.
pub const CONN_MAX_MSGS_PER_USER: usize = 16;

/// Maximum number of outstanding method calls per connection.
pub const CONN_MAX_REQUESTS_PENDING: u32 = 128;

/// Maximum number of connections a single user may hold on one domain.
pub const USER_MAX_CONN: u32 = 256;

/// Maximum number of buses a single user may create on one domain.
pub const USER_MAX_BUSES: u32 = 16;

/// Maximum number of file descriptors carried by one message.
pub const MSG_MAX_FDS: usize = 253;

/// Maximum number of items (payload vectors, fd sets, memfds) per message.
pub const MSG_MAX_ITEMS: usize = 128;

/// Upper bound on the per-bus bloom filter size, in bytes.
pub const BLOOM_MAX_SIZE: usize = 112;

/// Maximum length of a well-known name.
pub const NAME_MAX_LEN: usize = 255;

/// Upper bound on a receive pool size, in bytes.
pub const POOL_MAX_SIZE: u64 = 1 << 32;
