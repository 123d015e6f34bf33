//! Shared scaffolding for the deterministic network tests: virtual
//! nodes on a test network, a settle loop, and a synchronous ask
//! helper built on an auxiliary actor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hive_core::{
    ActorRef, ActorSystem, Atom, Behavior, Error, HandlerResult, IntoMessage, Message,
    SystemConfig, TestProbe,
};
use hive_net::{Middleman, TestMultiplexer, TestNetwork};

pub struct TestNode {
    pub system: ActorSystem,
    pub probe: TestProbe,
    pub mm: Middleman,
}

pub fn node(net: &Arc<TestNetwork>, host: &str) -> TestNode {
    node_with(net, host, false)
}

pub fn node_with(net: &Arc<TestNetwork>, host: &str, auto_connect: bool) -> TestNode {
    let mut cfg = SystemConfig::testing();
    cfg.middleman_enable_automatic_connections = auto_connect;
    let system = ActorSystem::new(cfg);
    let probe = system.test_probe().expect("testing policy");
    let mm = Middleman::new(&system, TestMultiplexer::new(Arc::clone(net), host));
    probe.run();
    TestNode { system, probe, mm }
}

/// Run every node's scheduler until the whole network is quiescent.
pub fn settle(nodes: &[&TestNode]) {
    loop {
        let mut ran = false;
        for node in nodes {
            if node.probe.run() > 0 {
                ran = true;
            }
        }
        if !ran {
            return;
        }
    }
}

/// Issue one request from a throwaway actor on `from` and settle the
/// network until the reply (or error) arrived.
pub fn ask(
    from: &TestNode,
    all: &[&TestNode],
    dest: &ActorRef,
    msg: impl IntoMessage,
) -> Result<Message, Error> {
    let slot: Arc<Mutex<Option<Result<Message, Error>>>> = Arc::new(Mutex::new(None));
    let slot_in_actor = Arc::clone(&slot);
    let dest = dest.clone();
    let msg = msg.into_message();
    let asker = from.system.spawn(move |_ctx| {
        Behavior::new().on::<(Atom,), _>(move |ctx, _go| {
            let ok_slot = Arc::clone(&slot_in_actor);
            let err_slot = Arc::clone(&slot_in_actor);
            ctx.request(&dest, Duration::from_secs(30), msg.clone()).then(
                move |_ctx, reply| {
                    *ok_slot.lock().unwrap() = Some(Ok(reply.clone()));
                    HandlerResult::Continue
                },
                move |_ctx, err| {
                    *err_slot.lock().unwrap() = Some(Err(err));
                    HandlerResult::Continue
                },
            );
            HandlerResult::Continue
        })
    });
    asker.send((Atom::new("go"),));
    settle(all);
    let result = slot.lock().unwrap().take();
    result.expect("request did not settle")
}
