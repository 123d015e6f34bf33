//! End-to-end over real loopback sockets: two systems on the
//! work-stealing scheduler, wired through the default multiplexer and
//! the blocking middleman facade.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hive_core::{
    ActorSystem, Atom, Behavior, DownMsg, ExitReason, HandlerResult, SystemConfig,
};
use hive_net::{DefaultMultiplexer, Middleman};

const ROUNDS: i64 = 10;

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn test_remote_ping_pong_over_tcp() {
    let earth = ActorSystem::new(SystemConfig::default());
    let earth_mm = Middleman::new(&earth, DefaultMultiplexer::new());

    let pong = spawn_pong(&earth);
    let port = earth_mm.publish(&pong, 0, false).expect("publish");
    assert_ne!(port, 0);

    let mars = ActorSystem::new(SystemConfig::default());
    let mars_mm = Middleman::new(&mars, DefaultMultiplexer::new());
    let proxy = mars_mm
        .remote_actor("127.0.0.1", port)
        .expect("remote actor");
    assert_eq!(proxy.node(), earth.node());
    assert_eq!(proxy.id(), pong.id());

    // Ten round trips driven from mars.
    let observed = Arc::new(AtomicI64::new(0));
    let observed_in_ping = Arc::clone(&observed);
    let proxy_for_ping = proxy.clone();
    let ping = mars.spawn(move |_ctx| {
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

    assert!(
        wait_until(Duration::from_secs(10), || ping.is_terminated()),
        "ping did not finish its rounds"
    );
    assert_eq!(observed.load(Ordering::SeqCst), 55);

    // Remote monitoring: killing pong on earth surfaces the reason on
    // mars through the proxy.
    let down = Arc::new(Mutex::new(None::<ExitReason>));
    let down_in_actor = Arc::clone(&down);
    let proxy_for_observer = proxy.clone();
    let observer = mars.spawn(move |_ctx| {
        let proxy = proxy_for_observer.clone();
        Behavior::new()
            .on::<(Atom,), _>(move |ctx, _msg| {
                ctx.monitor(&proxy);
                HandlerResult::Continue
            })
            .on::<(DownMsg,), _>(move |_ctx, msg| {
                let msg = msg.get::<DownMsg>(0).expect("down");
                *down_in_actor.lock().unwrap() = Some(msg.reason);
                HandlerResult::Continue
            })
    });
    observer.send((Atom::new("watch"),));
    // Give the monitor registration a moment before the kill.
    std::thread::sleep(Duration::from_millis(100));

    pong.kill(ExitReason::UserShutdown);
    assert!(
        wait_until(Duration::from_secs(10), || down.lock().unwrap().is_some()),
        "down message never arrived"
    );
    assert_eq!(*down.lock().unwrap(), Some(ExitReason::UserShutdown));

    mars_mm.stop();
    earth_mm.stop();
}

#[test]
fn test_unpublish_frees_the_port() {
    let system = ActorSystem::new(SystemConfig::default());
    let mm = Middleman::new(&system, DefaultMultiplexer::new());

    let actor = system.spawn(|_ctx| {
        Behavior::new().on_any(|_ctx, _msg| HandlerResult::Continue)
    });
    let port = mm.publish(&actor, 0, false).expect("publish");
    mm.unpublish(port).expect("unpublish");
    // A second unpublish reports the missing binding.
    let err = mm.unpublish(port).expect_err("nothing published");
    assert_eq!(
        err.as_sec(),
        Some(hive_core::SecCode::NoActorPublishedAtPort)
    );

    // Connecting to the freed port fails cleanly.
    let err = mm.remote_actor("127.0.0.1", port).expect_err("port closed");
    assert!(err.as_sec().is_some());

    mm.stop();
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn spawn_pong(system: &ActorSystem) -> hive_core::ActorRef {
    system.spawn(|_ctx| {
        Behavior::new().on::<(Atom, i64), _>(|ctx, msg| {
            let n = *msg.get::<i64>(1).expect("counter");
            if let Some(sender) = ctx.sender().cloned() {
                ctx.send_to(&sender, (Atom::new("pong"), n + 1));
            }
            HandlerResult::Continue
        })
    })
}
