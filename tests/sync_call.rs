mod common;

use std::{sync::Arc, thread, time::Duration};

use anyhow::ensure;
use busk::{
    time, Connection, Creds, Envelope, Error, HelloRequest, Item, PolicyDb, Policy, ReceivedItem,
    ReceivedMsg, RecvArgs,
};
use ntest::timeout;

use common::{hello, setup, setup_with_policy, user_creds};

/// Allows calls from one uid and nothing else; replies must therefore be
/// authorized by their reply tracker.
struct CallerOnly {
    caller_uid: u32,
}

impl Policy for CallerOnly {
    fn can_see(&self, _viewer: &Creds, _name: &str) -> bool {
        true
    }

    fn can_talk(&self, src: &Creds, _dst: &Creds) -> bool {
        src.uid == self.caller_uid
    }

    fn can_own(&self, _requester: &Creds, _name: &str) -> bool {
        true
    }
}

fn sync_call(
    caller: &Arc<Connection>,
    dst_id: u64,
    cookie: u64,
    timeout: Duration,
) -> thread::JoinHandle<busk::Result<Option<u64>>> {
    let caller = caller.clone();
    thread::spawn(move || -> busk::Result<Option<u64>> {
        let deadline = time::deadline_after(timeout);
        let mut call =
            Envelope::call(dst_id, cookie, deadline, vec![Item::Payload(b"req".to_vec())])?;
        caller.send(&mut call).map(|reply| reply.reply_offset)
    })
}

#[test]
#[timeout(20000)]
fn call_and_reply_roundtrip() {
    roundtrip().unwrap();
}

fn roundtrip() -> anyhow::Result<()> {
    let t = setup_with_policy(PolicyDb::with_engine(Box::new(CallerOnly {
        caller_uid: 7001,
    })));
    let (caller, hc) = t.ep.hello(HelloRequest::default(), user_creds(7001))?;
    let (server, hs) = t.ep.hello(HelloRequest::default(), user_creds(7002))?;

    let handle = sync_call(&caller, hs.id, 42, Duration::from_secs(10));

    // Wait for the call to land.
    let received = loop {
        match server.recv(RecvArgs::default()) {
            Ok(received) => break received,
            Err(Error::WouldBlock) => thread::sleep(Duration::from_millis(5)),
            Err(e) => return Err(e.into()),
        }
    };
    let record = ReceivedMsg::decode(&server.pool().read(received.offset)?)?;
    ensure!(record.cookie == 42, "unexpected call cookie");
    ensure!(record.src_id == hc.id, "unexpected caller id");

    // The reply is authorized by the outstanding tracker, not by policy.
    let mut reply = Envelope::reply_to(hc.id, 1, 42, vec![Item::Payload(b"resp".to_vec())])?;
    server.send(&mut reply)?;

    let offset = handle
        .join()
        .expect("caller thread")?
        .expect("synchronous call carries a reply offset");
    let record = ReceivedMsg::decode(&caller.pool().read(offset)?)?;
    ensure!(record.cookie_reply == 42, "reply correlates to the call");
    ensure!(
        record.first_payload() == Some(&b"resp"[..]),
        "reply payload survives"
    );

    // A second reply finds no tracker and the policy refuses it.
    let mut again = Envelope::reply_to(hc.id, 2, 42, vec![])?;
    ensure!(
        server.send(&mut again) == Err(Error::PermissionDenied),
        "duplicate replies are rejected"
    );
    Ok(())
}

#[test]
#[timeout(20000)]
fn sync_call_times_out() {
    let t = setup();
    let (caller, hc) = hello(&t.ep);
    let (server, hs) = hello(&t.ep);

    let handle = sync_call(&caller, hs.id, 7, Duration::from_millis(50));
    assert_eq!(handle.join().expect("caller thread"), Err(Error::TimedOut));

    // A reply-timeout notification lands on the caller.
    let received = caller.recv(RecvArgs::default()).expect("notification");
    let record = ReceivedMsg::decode(&caller.pool().read(received.offset).unwrap()).unwrap();
    assert_eq!(record.src_id, busk::SRC_BUS);
    assert_eq!(record.cookie_reply, 7);
    assert!(record
        .items
        .iter()
        .any(|i| matches!(i, ReceivedItem::ReplyTimeout)));

    // The server still holds the stale request; a late reply is refused
    // once the tracker is gone and... actually the open policy lets it
    // through as an ordinary message, so just verify the request body.
    let received = server.recv(RecvArgs::default()).unwrap();
    let record = ReceivedMsg::decode(&server.pool().read(received.offset).unwrap()).unwrap();
    assert_eq!(record.src_id, hc.id);
}

#[test]
#[timeout(20000)]
fn cancel_wakes_the_waiter() {
    let t = setup();
    let (caller, _) = hello(&t.ep);
    let (server, hs) = hello(&t.ep);

    let handle = sync_call(&caller, hs.id, 99, Duration::from_secs(30));
    // Give the call time to park.
    thread::sleep(Duration::from_millis(100));

    caller.cancel(99).unwrap();
    assert_eq!(handle.join().expect("caller thread"), Err(Error::Canceled));

    // Cancelling again finds nothing.
    assert_eq!(caller.cancel(99).unwrap_err(), Error::NotFound);
}

#[test]
#[timeout(20000)]
fn peer_death_breaks_the_call() {
    let t = setup();
    let (caller, _) = hello(&t.ep);
    let (server, hs) = hello(&t.ep);

    let handle = sync_call(&caller, hs.id, 13, Duration::from_secs(30));
    thread::sleep(Duration::from_millis(100));

    server.disconnect(false).unwrap();
    assert_eq!(
        handle.join().expect("caller thread"),
        Err(Error::BrokenPipe)
    );

    // A reply-dead notification is delivered to the caller.
    let received = caller.recv(RecvArgs::default()).expect("notification");
    let record = ReceivedMsg::decode(&caller.pool().read(received.offset).unwrap()).unwrap();
    assert_eq!(record.src_id, busk::SRC_BUS);
    assert_eq!(record.cookie_reply, 13);
    assert!(record
        .items
        .iter()
        .any(|i| matches!(i, ReceivedItem::ReplyDead)));
}

#[test]
#[timeout(20000)]
fn interrupted_call_restarts_without_duplicating() {
    let t = setup();
    let (caller, hc) = hello(&t.ep);
    let (server, hs) = hello(&t.ep);

    let first = sync_call(&caller, hs.id, 55, Duration::from_secs(30));
    thread::sleep(Duration::from_millis(100));

    // The equivalent of a signal: the wait returns, the tracker stays.
    caller.interrupt();
    assert_eq!(first.join().expect("caller thread"), Err(Error::Interrupted));

    // Restarting the same call adopts the tracker instead of enqueueing
    // the request again.
    let second = sync_call(&caller, hs.id, 55, Duration::from_secs(30));
    thread::sleep(Duration::from_millis(100));

    let received = server.recv(RecvArgs::default()).unwrap();
    let record = ReceivedMsg::decode(&server.pool().read(received.offset).unwrap()).unwrap();
    assert_eq!(record.cookie, 55);
    assert_eq!(
        server.recv(RecvArgs::default()).unwrap_err(),
        Error::WouldBlock,
        "the restarted call must not enqueue a second request"
    );

    let mut reply = Envelope::reply_to(hc.id, 1, 55, vec![Item::Payload(b"ok".to_vec())]).unwrap();
    server.send(&mut reply).unwrap();

    let offset = second
        .join()
        .expect("caller thread")
        .unwrap()
        .expect("reply offset");
    let record = ReceivedMsg::decode(&caller.pool().read(offset).unwrap()).unwrap();
    assert_eq!(record.cookie_reply, 55);
}

#[test]
#[timeout(20000)]
fn pending_request_cap_is_enforced() {
    let t = setup();
    // A capability-holding caller bypasses the receive-queue quotas, so
    // only the pending-request budget can stop it.
    let (caller, _) = common::hello_as(&t.ep, common::privileged_creds());
    let (server, hs) = hello(&t.ep);

    // Fill the pending-request budget with asynchronous calls.
    let deadline = time::deadline_after(Duration::from_secs(60));
    for cookie in 0..busk::limits::CONN_MAX_REQUESTS_PENDING as u64 {
        let mut call = Envelope::to_id(hs.id, cookie + 1, vec![]).unwrap();
        call.msg.flags = busk::MsgFlags::ExpectReply.into();
        call.msg.timeout_ns = deadline;
        caller.send(&mut call).unwrap();
    }
    let mut over = Envelope::to_id(hs.id, 10_000, vec![]).unwrap();
    over.msg.flags = busk::MsgFlags::ExpectReply.into();
    over.msg.timeout_ns = deadline;
    assert_eq!(caller.send(&mut over).unwrap_err(), Error::TooManyLinks);
    let _ = server;
}
