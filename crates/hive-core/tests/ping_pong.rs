//! Local ping/pong round-trips on both scheduler policies.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use hive_core::{
    ActorSystem, Atom, Behavior, HandlerResult, SystemConfig,
};

const ROUNDS: i64 = 10;

/// Spawn the ping/pong pair; returns the counter that accumulates the
/// values ping observes.
fn spawn_pair(system: &ActorSystem) -> Arc<AtomicI64> {
    let observed = Arc::new(AtomicI64::new(0));

    let pong = system.spawn(|_ctx| {
        Behavior::new()
            .on::<(Atom, i64), _>(|ctx, msg| {
                let n = *msg.get::<i64>(1).expect("counter");
                if let Some(sender) = ctx.sender().cloned() {
                    ctx.send_to(&sender, (Atom::new("pong"), n + 1));
                }
                HandlerResult::Continue
            })
            .on::<(Atom,), _>(|_ctx, _msg| {
                HandlerResult::Quit(hive_core::ExitReason::Normal)
            })
    });

    let observed_in_ping = Arc::clone(&observed);
    let pong_for_ping = pong.clone();
    let ping = system.spawn(move |_ctx| {
        Behavior::new().on::<(Atom, i64), _>(move |ctx, msg| {
            let n = *msg.get::<i64>(1).expect("counter");
            observed_in_ping.fetch_add(n, Ordering::SeqCst);
            if n >= ROUNDS {
                ctx.send(&pong_for_ping, (Atom::new("done"),));
                return HandlerResult::Quit(hive_core::ExitReason::Normal);
            }
            ctx.send(&pong_for_ping, (Atom::new("ping"), n));
            HandlerResult::Continue
        })
    });

    // Kick off the exchange: ping's handler reacts to pong messages,
    // so prime it with a zero round.
    ping.send((Atom::new("pong"), 0i64));
    observed
}

#[test]
fn test_ping_pong_deterministic() {
    let system = ActorSystem::new(SystemConfig::testing());
    let probe = system.test_probe().expect("testing policy");

    let observed = spawn_pair(&system);
    probe.run();

    // 1 + 2 + ... + 10, plus the priming zero.
    assert_eq!(observed.load(Ordering::SeqCst), 55);
    assert!(!probe.has_job());
    assert_eq!(system.registry().running(), 0);
}

#[test]
fn test_ping_pong_on_worker_pool() {
    let system = ActorSystem::new(SystemConfig::default());
    let observed = spawn_pair(&system);

    system.await_all_actors_done();
    assert_eq!(observed.load(Ordering::SeqCst), 55);
}

#[test]
fn test_detached_actor_blocks_without_stalling_workers() {
    use hive_core::SpawnOptions;

    let system = ActorSystem::new(SystemConfig::default());
    let sum = Arc::new(AtomicI64::new(0));
    let sum_in_actor = Arc::clone(&sum);
    // The detached actor may block its (private) thread in handlers.
    let slowpoke = system.spawn_opts(SpawnOptions::detached(), move |_ctx| {
        hive_core::Behavior::new().on::<(i64,), _>(move |_ctx, msg| {
            std::thread::sleep(std::time::Duration::from_millis(20));
            let n = *msg.get::<i64>(0).unwrap();
            let total = sum_in_actor.fetch_add(n, Ordering::SeqCst) + n;
            if total >= 6 {
                return hive_core::HandlerResult::Quit(hive_core::ExitReason::Normal);
            }
            hive_core::HandlerResult::Continue
        })
    });
    for n in [1i64, 2, 3] {
        slowpoke.send((n,));
    }
    // Regular actors keep running while the detached one sleeps.
    let observed = spawn_pair(&system);
    system.await_all_actors_done();

    assert_eq!(sum.load(Ordering::SeqCst), 6);
    assert_eq!(observed.load(Ordering::SeqCst), 55);
}

#[test]
fn test_messages_between_two_actors_stay_ordered() {
    let system = ActorSystem::new(SystemConfig::testing());
    let probe = system.test_probe().expect("testing policy");

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_in_actor = Arc::clone(&seen);
    let sink = system.spawn(move |_ctx| {
        Behavior::new().on::<(i64,), _>(move |_ctx, msg| {
            seen_in_actor.lock().unwrap().push(*msg.get::<i64>(0).unwrap());
            HandlerResult::Continue
        })
    });

    for n in 0..100i64 {
        sink.send((n,));
    }
    probe.run();

    assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
}
