#![allow(dead_code)]

use std::sync::Arc;

use busk::{
    BloomParameters, Bus, BusMake, Capability, Connection, Creds, Domain, Endpoint, HelloFlags,
    HelloReply, HelloRequest, PolicyDb,
};

pub struct TestBus {
    pub domain: Arc<Domain>,
    pub bus: Arc<Bus>,
    pub ep: Arc<Endpoint>,
}

/// A fresh bus owned by the current user, with the open policy.
pub fn setup() -> TestBus {
    setup_with_policy(PolicyDb::open())
}

pub fn setup_with_policy(policy: PolicyDb) -> TestBus {
    busk::tracing_subscriber::init();
    let domain = Domain::new("test");
    let creds = Creds::current();
    let bus = Bus::make(
        &domain,
        BusMake {
            name: format!("{}-test", creds.uid),
            bloom: BloomParameters::default(),
            flags: Default::default(),
            mode: 0o666,
        },
        creds,
        policy,
    )
    .expect("bus creation");
    let ep = bus.default_endpoint().expect("default endpoint");
    TestBus { domain, bus, ep }
}

/// An ordinary connection for the current user.
pub fn hello(ep: &Arc<Endpoint>) -> (Arc<Connection>, HelloReply) {
    ep.hello(HelloRequest::default(), Creds::current())
        .expect("hello")
}

pub fn hello_as(ep: &Arc<Endpoint>, creds: Creds) -> (Arc<Connection>, HelloReply) {
    ep.hello(HelloRequest::default(), creds).expect("hello")
}

pub fn hello_with(
    ep: &Arc<Endpoint>,
    req: HelloRequest,
    creds: Creds,
) -> (Arc<Connection>, HelloReply) {
    ep.hello(req, creds).expect("hello")
}

/// An unprivileged identity distinct from the bus owner.
pub fn user_creds(uid: u32) -> Creds {
    Creds::for_user(uid, uid, 100_000 + uid)
}

/// The current identity with the IPC owner capability.
pub fn privileged_creds() -> Creds {
    let mut creds = Creds::current();
    creds.caps |= Capability::IpcOwner;
    creds
}

/// A monitor connection.
pub fn monitor(ep: &Arc<Endpoint>) -> (Arc<Connection>, HelloReply) {
    ep.hello(
        HelloRequest {
            flags: HelloFlags::Monitor.into(),
            ..Default::default()
        },
        privileged_creds(),
    )
    .expect("monitor hello")
}

/// An activator for `name`.
pub fn activator(ep: &Arc<Endpoint>, name: &str) -> (Arc<Connection>, HelloReply) {
    ep.hello(
        HelloRequest {
            flags: HelloFlags::Activator.into(),
            name: Some(name.to_string()),
            ..Default::default()
        },
        privileged_creds(),
    )
    .expect("activator hello")
}
