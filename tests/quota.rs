mod common;

use anyhow::ensure;
use busk::{limits, Envelope, Error, HelloFlags, HelloRequest, Item};
use ntest::timeout;

use common::{hello, hello_as, privileged_creds, setup, user_creds};

#[test]
#[timeout(20000)]
fn per_user_share_of_a_receive_queue() {
    flood().unwrap();
}

fn flood() -> anyhow::Result<()> {
    let t = setup();
    let (receiver, hr) = hello(&t.ep);
    let (flooder, _) = hello_as(&t.ep, user_creds(2001));
    let (other, _) = hello_as(&t.ep, user_creds(2002));

    // The flooding user gets the free share plus its accounted share,
    // then the queue turns it away.
    let mut sent = 0u64;
    let blocked = loop {
        let mut msg = Envelope::to_id(hr.id, sent + 1, vec![])?;
        match flooder.send(&mut msg) {
            Ok(_) => sent += 1,
            Err(e) => break e,
        }
    };
    ensure!(blocked == Error::NoBufferSpace, "flood ends in NoBufferSpace");
    ensure!(
        sent == 2 * limits::CONN_MAX_MSGS_PER_USER as u64,
        "free share plus accounted share, got {sent}"
    );

    // A different user still gets through.
    let mut msg = Envelope::to_id(hr.id, 9000, vec![])?;
    other.send(&mut msg)?;
    Ok(())
}

#[test]
#[timeout(20000)]
fn aggregate_queue_cap() {
    let t = setup();
    let (receiver, hr) = hello(&t.ep);
    // Capability holders are not accounted and can overfill the queue.
    let (firehose, _) = hello_as(&t.ep, privileged_creds());
    for cookie in 0..=limits::CONN_MAX_MSGS as u64 {
        let mut msg = Envelope::to_id(hr.id, cookie + 1, vec![]).unwrap();
        firehose.send(&mut msg).unwrap();
    }

    // An ordinary sender now hits the aggregate cap outright.
    let (mortal, _) = hello_as(&t.ep, user_creds(2003));
    let mut msg = Envelope::to_id(hr.id, 1, vec![]).unwrap();
    assert_eq!(mortal.send(&mut msg).unwrap_err(), Error::NoBufferSpace);
    let _ = receiver;
}

#[test]
#[timeout(20000)]
fn fd_delivery_needs_consent() {
    let t = setup();
    let (sender, _) = hello(&t.ep);
    let (deaf, hd) = hello(&t.ep);
    let (willing, hw) = t
        .ep
        .hello(
            HelloRequest {
                flags: HelloFlags::AcceptFd.into(),
                ..Default::default()
            },
            busk::Creds::current(),
        )
        .unwrap();

    let mut msg = Envelope::to_id(hd.id, 1, vec![Item::Fds(2)]).unwrap();
    assert_eq!(sender.send(&mut msg).unwrap_err(), Error::CommunicationError);

    let mut msg = Envelope::to_id(hw.id, 2, vec![Item::Fds(2)]).unwrap();
    sender.send(&mut msg).unwrap();
    let _ = (deaf, willing);
}

#[test]
#[timeout(20000)]
fn broadcasts_take_memfds_but_not_fds() {
    let t = setup();
    let (sender, _) = hello(&t.ep);
    let (listener, _) = hello(&t.ep);
    listener.add_match(busk::MatchRule::with_cookie(1)).unwrap();

    let mut with_fds = Envelope::broadcast(1, None, vec![Item::Fds(1)]).unwrap();
    assert!(matches!(
        sender.send(&mut with_fds).unwrap_err(),
        Error::InvalidArgument(_)
    ));

    let mut with_memfd = Envelope::broadcast(2, None, vec![Item::Memfd(4096)]).unwrap();
    sender.send(&mut with_memfd).unwrap();
    let received = listener.recv(busk::RecvArgs::default()).unwrap();
    let record =
        busk::ReceivedMsg::decode(&listener.pool().read(received.offset).unwrap()).unwrap();
    assert!(record
        .items
        .iter()
        .any(|i| matches!(i, busk::ReceivedItem::Memfd(4096))));
}
