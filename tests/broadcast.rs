mod common;

use std::sync::Arc;

use busk::{
    Connection, Creds, Envelope, Error, Item, MatchRule, Policy, PolicyDb, ReceivedMsg, RecvArgs,
    SRC_BUS,
};
use ntest::timeout;

use common::{hello, hello_as, monitor, setup, setup_with_policy, user_creds};

/// Drain a connection, keeping only user messages (notifications come
/// from the bus and would make counts brittle).
fn drain_user_msgs(conn: &Arc<Connection>) -> Vec<ReceivedMsg> {
    let mut msgs = Vec::new();
    while let Ok(received) = conn.recv(RecvArgs::default()) {
        let record = ReceivedMsg::decode(&conn.pool().read(received.offset).unwrap()).unwrap();
        conn.free(received.offset).unwrap();
        if record.src_id != SRC_BUS {
            msgs.push(record);
        }
    }
    msgs
}

#[test]
#[timeout(15000)]
fn broadcasts_reach_matching_subscribers_only() {
    let t = setup();
    let (sender, hs) = hello(&t.ep);
    let (interested, _) = hello(&t.ep);
    let (wrong_source, _) = hello(&t.ep);
    let (unsubscribed, _) = hello(&t.ep);

    interested
        .add_match(MatchRule {
            src_id: Some(hs.id),
            ..MatchRule::with_cookie(1)
        })
        .unwrap();
    wrong_source
        .add_match(MatchRule {
            src_id: Some(hs.id + 17),
            ..MatchRule::with_cookie(1)
        })
        .unwrap();

    let mut msg = Envelope::broadcast(5, None, vec![Item::Payload(b"news".to_vec())]).unwrap();
    sender.send(&mut msg).unwrap();

    let delivered = drain_user_msgs(&interested);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].cookie, 5);
    assert!(drain_user_msgs(&wrong_source).is_empty());
    assert!(drain_user_msgs(&unsubscribed).is_empty());
    // The sender never hears itself.
    assert!(drain_user_msgs(&sender).is_empty());
}

#[test]
#[timeout(15000)]
fn bloom_masks_filter_broadcasts() {
    let t = setup();
    let words = t.bus.bloom().size / 8;
    let (sender, _) = hello(&t.ep);
    let (subscriber, _) = hello(&t.ep);

    // Masks must match the bus geometry.
    assert!(matches!(
        subscriber.add_match(MatchRule {
            bloom_mask: Some(vec![1]),
            ..MatchRule::with_cookie(1)
        }),
        Err(Error::InvalidArgument(_))
    ));

    let mut mask = vec![0u64; words];
    mask[0] = 0b0101;
    subscriber
        .add_match(MatchRule {
            bloom_mask: Some(mask),
            ..MatchRule::with_cookie(1)
        })
        .unwrap();

    let mut covering = vec![0u64; words];
    covering[0] = 0b0111;
    let mut msg = Envelope::broadcast(1, Some(covering), vec![]).unwrap();
    sender.send(&mut msg).unwrap();

    let mut partial = vec![0u64; words];
    partial[0] = 0b0001;
    let mut msg = Envelope::broadcast(2, Some(partial), vec![]).unwrap();
    sender.send(&mut msg).unwrap();

    let delivered = drain_user_msgs(&subscriber);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].cookie, 1);
}

#[test]
#[timeout(15000)]
fn monitors_see_unicasts_and_cannot_speak() {
    let t = setup();
    let (a, _) = hello(&t.ep);
    let (b, hb) = hello(&t.ep);
    let (watcher, hw) = monitor(&t.ep);

    let mut msg = Envelope::to_id(hb.id, 21, vec![Item::Payload(b"secret".to_vec())]).unwrap();
    a.send(&mut msg).unwrap();

    let copies = drain_user_msgs(&watcher);
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].cookie, 21);
    assert_eq!(copies[0].first_payload(), Some(&b"secret"[..]));
    // The original still reaches its destination.
    assert_eq!(drain_user_msgs(&b).len(), 1);

    // Monitors are passive and unaddressable.
    let mut from_monitor = Envelope::to_id(hb.id, 1, vec![]).unwrap();
    assert_eq!(
        watcher.send(&mut from_monitor).unwrap_err(),
        Error::NotSupported
    );
    let mut to_monitor = Envelope::to_id(hw.id, 1, vec![]).unwrap();
    assert_eq!(a.send(&mut to_monitor).unwrap_err(), Error::NotFound);

    // Broadcasts only reach a monitor through its match rules.
    let mut news = Envelope::broadcast(33, None, vec![]).unwrap();
    a.send(&mut news).unwrap();
    assert!(drain_user_msgs(&watcher).is_empty());
    watcher.add_match(MatchRule::with_cookie(1)).unwrap();
    let mut news = Envelope::broadcast(34, None, vec![]).unwrap();
    a.send(&mut news).unwrap();
    assert_eq!(drain_user_msgs(&watcher).len(), 1);
}

/// Denies all cross-connection talk, so only the implicit rules apply.
struct NoTalk;

impl Policy for NoTalk {
    fn can_see(&self, _viewer: &Creds, _name: &str) -> bool {
        true
    }

    fn can_talk(&self, _src: &Creds, _dst: &Creds) -> bool {
        false
    }

    fn can_own(&self, _requester: &Creds, _name: &str) -> bool {
        true
    }
}

#[test]
#[timeout(15000)]
fn named_senders_reach_unnamed_receivers() {
    let t = setup_with_policy(PolicyDb::with_engine(Box::new(NoTalk)));
    let (service, _) = hello_as(&t.ep, user_creds(3001));
    let (client, _) = hello_as(&t.ep, user_creds(3002));
    service
        .acquire_name("com.example.Signals", Default::default())
        .unwrap();
    client.add_match(MatchRule::with_cookie(1)).unwrap();

    // A named sender may always signal a nameless destination.
    let mut signal = Envelope::broadcast(1, None, vec![]).unwrap();
    service.send(&mut signal).unwrap();
    assert_eq!(drain_user_msgs(&client).len(), 1);

    // Once the destination owns a name itself, the bus policy decides,
    // and this one says no.
    client
        .acquire_name("com.example.Client", Default::default())
        .unwrap();
    let mut signal = Envelope::broadcast(2, None, vec![]).unwrap();
    service.send(&mut signal).unwrap();
    assert!(drain_user_msgs(&client).is_empty());
}

#[test]
#[timeout(15000)]
fn message_sequence_is_strictly_increasing() {
    let t = setup();
    let (a, _) = hello(&t.ep);
    let (b, hb) = hello(&t.ep);

    for cookie in 1..=3 {
        let mut msg = Envelope::to_id(hb.id, cookie, vec![]).unwrap();
        a.send(&mut msg).unwrap();
    }
    let records = drain_user_msgs(&b);
    assert_eq!(records.len(), 3);
    assert!(records.windows(2).all(|w| w[0].seq < w[1].seq));
}
