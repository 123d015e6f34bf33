//! Two-node scenarios over the virtual test network: publish, connect,
//! remote ping/pong, remote monitoring, handshake idempotence, remote
//! lookup.

mod common;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use hive_core::{
    ActorAddr, ActorRef, Atom, Behavior, DownMsg, ExitReason, HandlerResult, IntoMessage, NodeId,
};
use hive_net::basp_broker::{ConnectCmd, ConnectUdpCmd, LookupCmd, PublishCmd, PublishUdpCmd};
use hive_net::TestNetwork;

use common::{ask, node, settle, TestNode};

const ROUNDS: i64 = 10;

/// The usual pong actor: answers `(ping, n)` with `(pong, n + 1)` and
/// quits on `(done)`.
fn spawn_pong(node: &TestNode) -> ActorRef {
    node.system.spawn(|_ctx| {
        Behavior::new()
            .on::<(Atom, i64), _>(|ctx, msg| {
                let n = *msg.get::<i64>(1).expect("counter");
                if let Some(sender) = ctx.sender().cloned() {
                    ctx.send_to(&sender, (Atom::new("pong"), n + 1));
                }
                HandlerResult::Continue
            })
            .on::<(Atom,), _>(|_ctx, _msg| HandlerResult::Quit(ExitReason::Normal))
    })
}

fn publish(node: &TestNode, all: &[&TestNode], actor: &ActorRef, port: u16) -> u16 {
    let reply = ask(
        node,
        all,
        node.mm.broker(),
        (PublishCmd {
            aid: actor.id(),
            port,
            reuse_addr: false,
        },),
    )
    .expect("publish");
    *reply.get::<u16>(0).expect("bound port")
}

fn connect(node: &TestNode, all: &[&TestNode], host: &str, port: u16) -> (NodeId, ActorRef) {
    let reply = ask(
        node,
        all,
        node.mm.broker(),
        (ConnectCmd {
            host: host.to_string(),
            port,
        },),
    )
    .expect("connect");
    let peer = *reply.get::<NodeId>(0).expect("node id");
    let addr = reply.get::<ActorAddr>(1).expect("proxy address");
    (peer, addr.upgrade().expect("proxy alive"))
}

#[test]
fn test_remote_ping_pong() {
    let net = TestNetwork::new();
    let earth = node(&net, "earth");
    let mars = node(&net, "mars");
    let all = [&earth, &mars];

    let pong = spawn_pong(&earth);
    let port = publish(&earth, &all, &pong, 4000);
    assert_eq!(port, 4000);

    let (peer_node, proxy) = connect(&mars, &all, "earth", port);
    assert_eq!(peer_node, earth.system.node());
    // The proxy carries the remote actor's identity.
    assert_eq!(proxy.node(), earth.system.node());
    assert_eq!(proxy.id(), pong.id());

    // Ten round trips from mars.
    let observed = Arc::new(AtomicI64::new(0));
    let observed_in_ping = Arc::clone(&observed);
    let proxy_for_ping = proxy.clone();
    let ping = mars.system.spawn(move |_ctx| {
        Behavior::new().on::<(Atom, i64), _>(move |ctx, msg| {
            let n = *msg.get::<i64>(1).expect("counter");
            observed_in_ping.fetch_add(n, Ordering::SeqCst);
            if n >= ROUNDS {
                return HandlerResult::Quit(ExitReason::Normal);
            }
            ctx.send(&proxy_for_ping, (Atom::new("ping"), n));
            HandlerResult::Continue
        })
    });
    ping.send((Atom::new("pong"), 0i64));
    settle(&all);

    assert_eq!(observed.load(Ordering::SeqCst), 55);
    assert!(ping.is_terminated());
    assert!(!pong.is_terminated());
}

#[test]
fn test_remote_request_over_udp() {
    let net = TestNetwork::new();
    let earth = node(&net, "earth");
    let mars = node(&net, "mars");
    let all = [&earth, &mars];

    let doubler = earth.system.spawn(|_ctx| {
        Behavior::new().on::<(i64,), _>(|_ctx, msg| {
            let n = *msg.get::<i64>(0).expect("n");
            HandlerResult::Reply((n * 2,).into_message())
        })
    });
    let reply = ask(
        &earth,
        &all,
        earth.mm.broker(),
        (PublishUdpCmd {
            aid: doubler.id(),
            port: 0,
        },),
    )
    .expect("publish udp");
    let port = *reply.get::<u16>(0).expect("port");

    let reply = ask(
        &mars,
        &all,
        mars.mm.broker(),
        (ConnectUdpCmd {
            host: "earth".to_string(),
            port,
        },),
    )
    .expect("connect udp");
    assert_eq!(reply.get::<NodeId>(0), Some(&earth.system.node()));
    let proxy = reply
        .get::<ActorAddr>(1)
        .expect("proxy addr")
        .upgrade()
        .expect("proxy alive");

    let answer = ask(&mars, &all, &proxy, (21i64,)).expect("udp request");
    assert_eq!(answer.get::<i64>(0), Some(&42));
}

#[test]
fn test_remote_monitoring_sees_user_shutdown() {
    let net = TestNetwork::new();
    let earth = node(&net, "earth");
    let mars = node(&net, "mars");
    let all = [&earth, &mars];

    let pong = spawn_pong(&earth);
    let port = publish(&earth, &all, &pong, 0);
    let (_, proxy) = connect(&mars, &all, "earth", port);

    let observed = Arc::new(Mutex::new(None::<ExitReason>));
    let observed_in_actor = Arc::clone(&observed);
    let proxy_for_observer = proxy.clone();
    let observer = mars.system.spawn(move |_ctx| {
        let proxy = proxy_for_observer.clone();
        Behavior::new()
            .on::<(Atom,), _>(move |ctx, _msg| {
                ctx.monitor(&proxy);
                HandlerResult::Continue
            })
            .on::<(DownMsg,), _>(move |_ctx, msg| {
                let down = msg.get::<DownMsg>(0).expect("down");
                *observed_in_actor.lock().unwrap() = Some(down.reason);
                HandlerResult::Continue
            })
    });
    observer.send((Atom::new("watch"),));
    settle(&all);

    // Kill the published actor on earth; mars must observe the reason
    // through the proxy.
    pong.kill(ExitReason::UserShutdown);
    settle(&all);

    assert_eq!(*observed.lock().unwrap(), Some(ExitReason::UserShutdown));
    assert!(proxy.is_terminated());
    assert_eq!(proxy.exit_reason(), Some(ExitReason::UserShutdown));
}

#[test]
fn test_concurrent_connects_share_one_path() {
    let net = TestNetwork::new();
    let earth = node(&net, "earth");
    let mars = node(&net, "mars");
    let all = [&earth, &mars];

    let pong = spawn_pong(&earth);
    let port = publish(&earth, &all, &pong, 0);

    // Issue two connect requests back to back, processing nothing in
    // between: the second piggybacks on the in-flight handshake.
    let slots: Vec<Arc<Mutex<Option<(NodeId, ActorAddr)>>>> =
        (0..2).map(|_| Arc::new(Mutex::new(None))).collect();
    for slot in &slots {
        let slot_in_actor = Arc::clone(slot);
        let broker = mars.mm.broker().clone();
        let asker = mars.system.spawn(move |_ctx| {
            let broker = broker.clone();
            Behavior::new().on::<(Atom,), _>(move |ctx, _go| {
                let slot = Arc::clone(&slot_in_actor);
                ctx.request(
                    &broker,
                    std::time::Duration::from_secs(30),
                    (ConnectCmd {
                        host: "earth".to_string(),
                        port,
                    },),
                )
                .then(
                    move |_ctx, reply| {
                        let peer = *reply.get::<NodeId>(0).expect("node");
                        let addr = reply.get::<ActorAddr>(1).expect("addr").clone();
                        *slot.lock().unwrap() = Some((peer, addr));
                        HandlerResult::Continue
                    },
                    |_ctx, err| panic!("connect failed: {}", err),
                );
                HandlerResult::Continue
            })
        });
        asker.send((Atom::new("go"),));
    }
    settle(&all);

    let first = slots[0].lock().unwrap().clone().expect("first connect");
    let second = slots[1].lock().unwrap().clone().expect("second connect");
    assert_eq!(first.0, earth.system.node());
    assert_eq!(first.0, second.0);
    // Both resolve to the same proxy: one direct path, one stand-in.
    assert_eq!(first.1, second.1);
    let p1 = first.1.upgrade().expect("alive");
    let p2 = second.1.upgrade().expect("alive");
    assert_eq!(p1, p2);
}

#[test]
fn test_remote_lookup_by_name() {
    let net = TestNetwork::new();
    let earth = node(&net, "earth");
    let mars = node(&net, "mars");
    let all = [&earth, &mars];

    // A named service on earth.
    let answers = earth.system.spawn(|ctx| {
        ctx.register("oracle").expect("name free");
        Behavior::new().on::<(Atom,), _>(|_ctx, _msg| {
            HandlerResult::Reply((42i64,).into_message())
        })
    });
    let _ = answers;
    let port = publish(&earth, &all, &spawn_pong(&earth), 0);
    let (peer_node, _) = connect(&mars, &all, "earth", port);

    let reply = ask(
        &mars,
        &all,
        mars.mm.broker(),
        (LookupCmd {
            node: peer_node,
            name: "oracle".to_string(),
        },),
    )
    .expect("lookup");
    let oracle = reply
        .get::<ActorAddr>(0)
        .expect("addr")
        .upgrade()
        .expect("proxy alive");

    let answer = ask(&mars, &all, &oracle, (Atom::new("ask"),)).expect("oracle reply");
    assert_eq!(answer.get::<i64>(0), Some(&42));

    // Unknown names resolve to an error.
    let missing = ask(
        &mars,
        &all,
        mars.mm.broker(),
        (LookupCmd {
            node: peer_node,
            name: "nonesuch".to_string(),
        },),
    );
    assert!(missing.is_err());
}
