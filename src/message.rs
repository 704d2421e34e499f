//! Message model and the record format delivered into receive pools.
//!
//! A message travels through the bus as an [`Envelope`]: the caller-visible
//! header plus payload items, the resolved destination name, the bus
//! sequence number and whatever metadata the dispatcher attaches on the
//! way. Delivery serializes the envelope into a flat record of typed,
//! 8-byte-aligned items inside the receiver's pool; [`ReceivedMsg`] parses
//! such a record back.

use enumflags2::{bitflags, BitFlags};

use crate::{
    error::{Error, Result},
    limits,
    metadata::Metadata,
    notify::Notify,
};

/// Destination id addressing every eligible connection on the bus.
pub const DST_BROADCAST: u64 = u64::MAX;

/// Destination id placeholder when a message is addressed by name only.
pub const DST_NAME: u64 = 0;

/// Source id of bus-originated notifications.
pub const SRC_BUS: u64 = 0;

/// Per-message flags.
#[bitflags]
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgFlags {
    /// The message is a method call and the sender expects a reply.
    ExpectReply = 1,
    /// Block the sender until the reply arrives (implies `ExpectReply`).
    SyncReply = 1 << 1,
    /// Fail instead of queueing on an activator.
    NoAutoStart = 1 << 2,
}

/// The caller-controlled message header.
#[derive(Clone, Debug, Default)]
pub struct Msg {
    pub src_id: u64,
    pub dst_id: u64,
    /// Caller-chosen correlator linking a call with its reply.
    pub cookie: u64,
    /// For replies, the cookie of the original call.
    pub cookie_reply: u64,
    pub flags: BitFlags<MsgFlags>,
    /// Lower values are delivered first.
    pub priority: i64,
    /// Absolute reply deadline on the crate's monotonic clock.
    pub timeout_ns: u64,
}

/// A payload item supplied by the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Item {
    /// Inline bytes.
    Payload(Vec<u8>),
    /// A set of file descriptors (modeled by count; installation is the
    /// transport layer's job).
    Fds(u32),
    /// A sealed memory region of the given size.
    Memfd(u64),
}

/// A message in flight through the dispatcher.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub msg: Msg,
    /// Destination well-known name, if addressed by name.
    pub dst_name: Option<String>,
    /// Bloom filter words for broadcast match filtering.
    pub bloom: Option<Vec<u64>>,
    pub items: Vec<Item>,
    pub(crate) dst_name_id: u64,
    pub(crate) seq: u64,
    pub(crate) meta: Option<Metadata>,
    pub(crate) notify: Option<Notify>,
    pub(crate) fds: u32,
}

impl Envelope {
    /// Validate and wrap a header plus payload items.
    pub fn new(msg: Msg, items: Vec<Item>) -> Result<Self> {
        if msg.flags.contains(MsgFlags::SyncReply) && !msg.flags.contains(MsgFlags::ExpectReply) {
            return Err(Error::InvalidArgument("SyncReply requires ExpectReply"));
        }
        if msg.flags.contains(MsgFlags::ExpectReply) {
            if msg.cookie == 0 {
                return Err(Error::InvalidArgument("calls need a non-zero cookie"));
            }
            if msg.cookie_reply != 0 {
                return Err(Error::InvalidArgument("a call cannot also be a reply"));
            }
            if msg.timeout_ns == 0 {
                return Err(Error::InvalidArgument("calls need a reply deadline"));
            }
        }
        if items.len() > limits::MSG_MAX_ITEMS {
            return Err(Error::ArgumentListTooLong);
        }
        let mut fds: u64 = 0;
        for item in &items {
            if let Item::Fds(n) = item {
                fds += u64::from(*n);
            }
        }
        if fds > limits::MSG_MAX_FDS as u64 {
            return Err(Error::TooManyOpenFiles);
        }
        Ok(Self {
            msg,
            dst_name: None,
            bloom: None,
            items,
            dst_name_id: 0,
            seq: 0,
            meta: None,
            notify: None,
            fds: fds as u32,
        })
    }

    /// A unicast message addressed by unique id.
    pub fn to_id(dst_id: u64, cookie: u64, items: Vec<Item>) -> Result<Self> {
        Self::new(
            Msg {
                dst_id,
                cookie,
                ..Msg::default()
            },
            items,
        )
    }

    /// A unicast message addressed by well-known name.
    pub fn to_name(name: impl Into<String>, cookie: u64, items: Vec<Item>) -> Result<Self> {
        let mut env = Self::new(
            Msg {
                dst_id: DST_NAME,
                cookie,
                ..Msg::default()
            },
            items,
        )?;
        env.dst_name = Some(name.into());
        Ok(env)
    }

    /// A synchronous method call addressed by unique id.
    pub fn call(dst_id: u64, cookie: u64, timeout_ns: u64, items: Vec<Item>) -> Result<Self> {
        Self::new(
            Msg {
                dst_id,
                cookie,
                cookie_reply: 0,
                flags: MsgFlags::ExpectReply | MsgFlags::SyncReply,
                timeout_ns,
                ..Msg::default()
            },
            items,
        )
    }

    /// A reply correlating to the call that carried `cookie_reply`.
    pub fn reply_to(dst_id: u64, cookie: u64, cookie_reply: u64, items: Vec<Item>) -> Result<Self> {
        let mut env = Self::to_id(dst_id, cookie, items)?;
        env.msg.cookie_reply = cookie_reply;
        Ok(env)
    }

    /// A broadcast message.
    pub fn broadcast(cookie: u64, bloom: Option<Vec<u64>>, items: Vec<Item>) -> Result<Self> {
        let mut env = Self::new(
            Msg {
                dst_id: DST_BROADCAST,
                cookie,
                ..Msg::default()
            },
            items,
        )?;
        env.bloom = bloom;
        Ok(env)
    }

    pub(crate) fn for_notify(dst_id: u64, cookie_reply: u64, notify: Notify) -> Self {
        Self {
            msg: Msg {
                src_id: SRC_BUS,
                dst_id,
                cookie_reply,
                ..Msg::default()
            },
            dst_name: None,
            bloom: None,
            items: Vec::new(),
            dst_name_id: 0,
            seq: 0,
            meta: None,
            notify: Some(notify),
            fds: 0,
        }
    }

    pub(crate) fn is_notification(&self) -> bool {
        self.msg.src_id == SRC_BUS
    }

    /// Serialize into the record format stored in a pool slice.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut items = Vec::new();
        for item in &self.items {
            match item {
                Item::Payload(bytes) => put_item(&mut items, kind::PAYLOAD, bytes),
                Item::Fds(n) => put_item(&mut items, kind::FDS, &n.to_le_bytes()),
                Item::Memfd(size) => put_item(&mut items, kind::MEMFD, &size.to_le_bytes()),
            }
        }
        if let Some(bloom) = &self.bloom {
            let mut payload = Vec::with_capacity(bloom.len() * 8);
            for word in bloom {
                payload.extend_from_slice(&word.to_le_bytes());
            }
            put_item(&mut items, kind::BLOOM_FILTER, &payload);
        }
        if let Some(meta) = &self.meta {
            meta.encode_items(&mut items);
        }
        if let Some(notify) = &self.notify {
            notify.encode_item(&mut items);
        }

        let mut buf = Vec::with_capacity(MSG_HEADER_LEN + items.len());
        let size = (MSG_HEADER_LEN + items.len()) as u64;
        for word in [
            size,
            self.msg.src_id,
            self.msg.dst_id,
            self.msg.cookie,
            self.msg.cookie_reply,
            self.msg.flags.bits(),
            self.msg.priority as u64,
            self.seq,
            self.dst_name_id,
        ] {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf.extend_from_slice(&items);
        buf
    }
}

const MSG_HEADER_LEN: usize = 9 * 8;

/// Item type tags in encoded records.
pub(crate) mod kind {
    pub const PAYLOAD: u32 = 1;
    pub const FDS: u32 = 2;
    pub const MEMFD: u32 = 3;
    pub const BLOOM_FILTER: u32 = 4;
    pub const TIMESTAMP: u32 = 5;
    pub const CREDS: u32 = 6;
    pub const OWNED_NAME: u32 = 7;
    pub const DESCRIPTION: u32 = 8;
    pub const SECLABEL: u32 = 9;
    pub const NAME_ADD: u32 = 10;
    pub const NAME_REMOVE: u32 = 11;
    pub const NAME_CHANGE: u32 = 12;
    pub const ID_ADD: u32 = 13;
    pub const ID_REMOVE: u32 = 14;
    pub const REPLY_TIMEOUT: u32 = 15;
    pub const REPLY_DEAD: u32 = 16;
    pub const LIST_NAME: u32 = 17;
}

/// Append one `{kind, len, payload, pad}` item to `buf`.
pub(crate) fn put_item(buf: &mut Vec<u8>, kind: u32, payload: &[u8]) {
    buf.extend_from_slice(&kind.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    let pad = (8 - payload.len() % 8) % 8;
    buf.extend_from_slice(&[0u8; 8][..pad]);
}

/// One parsed item of a delivered record.
#[derive(Clone, Debug, PartialEq)]
pub enum ReceivedItem {
    Payload(Vec<u8>),
    Fds(u32),
    Memfd(u64),
    BloomFilter(Vec<u64>),
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
    NameAdd {
        old_id: u64,
        new_id: u64,
        flags: u64,
        name: String,
    },
    NameRemove {
        old_id: u64,
        new_id: u64,
        flags: u64,
        name: String,
    },
    NameChange {
        old_id: u64,
        new_id: u64,
        flags: u64,
        name: String,
    },
    IdAdd {
        id: u64,
        flags: u64,
    },
    IdRemove {
        id: u64,
        flags: u64,
    },
    ReplyTimeout,
    ReplyDead,
    /// One entry of a name-list record.
    ListName {
        id: u64,
        flags: u64,
        name: Option<String>,
    },
}

/// A message record read back out of a receive pool.
#[derive(Clone, Debug)]
pub struct ReceivedMsg {
    pub src_id: u64,
    pub dst_id: u64,
    pub cookie: u64,
    pub cookie_reply: u64,
    pub flags: BitFlags<MsgFlags>,
    pub priority: i64,
    pub seq: u64,
    pub dst_name_id: u64,
    pub items: Vec<ReceivedItem>,
}

impl ReceivedMsg {
    /// Parse a record previously produced by message delivery.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let size = r.u64()?;
        if size as usize != bytes.len() {
            return Err(Error::InvalidArgument("record size mismatch"));
        }
        let src_id = r.u64()?;
        let dst_id = r.u64()?;
        let cookie = r.u64()?;
        let cookie_reply = r.u64()?;
        let flags = BitFlags::from_bits_truncate(r.u64()?);
        let priority = r.u64()? as i64;
        let seq = r.u64()?;
        let dst_name_id = r.u64()?;
        let items = decode_items(&mut r)?;
        Ok(Self {
            src_id,
            dst_id,
            cookie,
            cookie_reply,
            flags,
            priority,
            seq,
            dst_name_id,
            items,
        })
    }

    /// The first inline payload, if any.
    pub fn first_payload(&self) -> Option<&[u8]> {
        self.items.iter().find_map(|i| match i {
            ReceivedItem::Payload(bytes) => Some(bytes.as_slice()),
            _ => None,
        })
    }
}

/// An info record (connection info, bus creator info, name list).
#[derive(Clone, Debug)]
pub struct InfoRecord {
    pub id: u64,
    pub flags: u64,
    pub items: Vec<ReceivedItem>,
}

impl InfoRecord {
    pub(crate) fn encode(id: u64, flags: u64, items: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INFO_HEADER_LEN + items.len());
        let size = (INFO_HEADER_LEN + items.len()) as u64;
        for word in [size, id, flags] {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf.extend_from_slice(items);
        buf
    }

    /// Parse an info record read back out of a receive pool.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let size = r.u64()?;
        if size as usize != bytes.len() {
            return Err(Error::InvalidArgument("record size mismatch"));
        }
        let id = r.u64()?;
        let flags = r.u64()?;
        let items = decode_items(&mut r)?;
        Ok(Self { id, flags, items })
    }
}

const INFO_HEADER_LEN: usize = 3 * 8;

fn decode_items(r: &mut Reader<'_>) -> Result<Vec<ReceivedItem>> {
    let mut items = Vec::new();
    while !r.at_end() {
        let kind = r.u32()?;
        let len = r.u32()? as usize;
        let payload = r.bytes(len)?;
        r.skip_pad(len)?;
        items.push(decode_item(kind, payload)?);
    }
    Ok(items)
}

fn decode_item(kind: u32, payload: &[u8]) -> Result<ReceivedItem> {
    let mut r = Reader::new(payload);
    let item = match kind {
        kind::PAYLOAD => ReceivedItem::Payload(payload.to_vec()),
        kind::FDS => ReceivedItem::Fds(r.u32()?),
        kind::MEMFD => ReceivedItem::Memfd(r.u64()?),
        kind::BLOOM_FILTER => {
            let mut words = Vec::with_capacity(payload.len() / 8);
            while !r.at_end() {
                words.push(r.u64()?);
            }
            ReceivedItem::BloomFilter(words)
        }
        kind::TIMESTAMP => ReceivedItem::Timestamp {
            seq: r.u64()?,
            monotonic_ns: r.u64()?,
            realtime_ns: r.u64()?,
        },
        kind::CREDS => ReceivedItem::Creds {
            uid: r.u32()?,
            gid: r.u32()?,
            pid: r.u32()?,
            tid: r.u32()?,
        },
        kind::OWNED_NAME => {
            let flags = r.u64()?;
            ReceivedItem::OwnedName {
                flags,
                name: r.rest_str()?,
            }
        }
        kind::DESCRIPTION => ReceivedItem::Description(r.rest_str()?),
        kind::SECLABEL => ReceivedItem::Seclabel(r.rest_str()?),
        kind::NAME_ADD | kind::NAME_REMOVE | kind::NAME_CHANGE => {
            let old_id = r.u64()?;
            let new_id = r.u64()?;
            let flags = r.u64()?;
            let name = r.rest_str()?;
            match kind {
                kind::NAME_ADD => ReceivedItem::NameAdd {
                    old_id,
                    new_id,
                    flags,
                    name,
                },
                kind::NAME_REMOVE => ReceivedItem::NameRemove {
                    old_id,
                    new_id,
                    flags,
                    name,
                },
                _ => ReceivedItem::NameChange {
                    old_id,
                    new_id,
                    flags,
                    name,
                },
            }
        }
        kind::ID_ADD => ReceivedItem::IdAdd {
            id: r.u64()?,
            flags: r.u64()?,
        },
        kind::ID_REMOVE => ReceivedItem::IdRemove {
            id: r.u64()?,
            flags: r.u64()?,
        },
        kind::REPLY_TIMEOUT => ReceivedItem::ReplyTimeout,
        kind::REPLY_DEAD => ReceivedItem::ReplyDead,
        kind::LIST_NAME => {
            let id = r.u64()?;
            let flags = r.u64()?;
            let name = r.rest_str()?;
            ReceivedItem::ListName {
                id,
                flags,
                name: if name.is_empty() { None } else { Some(name) },
            }
        }
        _ => return Err(Error::InvalidArgument("unknown item kind")),
    };
    Ok(item)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.buf.len())
            .ok_or(Error::InvalidArgument("truncated record"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn skip_pad(&mut self, payload_len: usize) -> Result<()> {
        let pad = (8 - payload_len % 8) % 8;
        self.bytes(pad).map(|_| ())
    }

    fn rest_str(&mut self) -> Result<String> {
        let bytes = self.bytes(self.buf.len() - self.pos)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::InvalidArgument("record string is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_without_expect_is_rejected() {
        let msg = Msg {
            flags: MsgFlags::SyncReply.into(),
            cookie: 1,
            ..Msg::default()
        };
        assert_eq!(
            Envelope::new(msg, vec![]).unwrap_err(),
            Error::InvalidArgument("SyncReply requires ExpectReply")
        );
    }

    #[test]
    fn fd_limit_is_enforced() {
        let over = vec![Item::Fds(limits::MSG_MAX_FDS as u32 + 1)];
        assert_eq!(
            Envelope::to_id(1, 1, over).unwrap_err(),
            Error::TooManyOpenFiles
        );
        let at = vec![Item::Fds(limits::MSG_MAX_FDS as u32)];
        assert!(Envelope::to_id(1, 1, at).is_ok());
    }

    #[test]
    fn item_limit_is_enforced() {
        let items = vec![Item::Memfd(1); limits::MSG_MAX_ITEMS + 1];
        assert_eq!(
            Envelope::to_id(1, 1, items).unwrap_err(),
            Error::ArgumentListTooLong
        );
    }

    #[test]
    fn delivered_record_parses_back() {
        let mut env = Envelope::to_id(7, 42, vec![Item::Payload(b"hi".to_vec()), Item::Fds(2)])
            .unwrap();
        env.msg.src_id = 3;
        env.msg.priority = -5;
        env.seq = 99;
        let rec = ReceivedMsg::decode(&env.encode()).unwrap();
        assert_eq!(rec.src_id, 3);
        assert_eq!(rec.cookie, 42);
        assert_eq!(rec.priority, -5);
        assert_eq!(rec.seq, 99);
        assert_eq!(rec.first_payload(), Some(&b"hi"[..]));
        assert!(rec.items.contains(&ReceivedItem::Fds(2)));
    }
}
