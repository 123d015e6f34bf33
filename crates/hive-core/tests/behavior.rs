//! Behavior mechanics: state transitions, skipping, idle timeouts,
//! default-handler policies, delayed sends, groups.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hive_core::{
    ActorSystem, Atom, Behavior, DefaultHandler, HandlerResult, SystemConfig,
};

fn testing_system() -> ActorSystem {
    ActorSystem::new(SystemConfig::testing())
}

#[test]
fn test_become_replaces_behavior() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let log_in_actor = Arc::clone(&log);
    let actor = system.spawn(move |_ctx| {
        let log_first = Arc::clone(&log_in_actor);
        let log_outer = log_in_actor;
        Behavior::new().on::<(i64,), _>(move |_ctx, msg| {
            log_first
                .lock()
                .unwrap()
                .push(format!("first:{}", msg.get::<i64>(0).unwrap()));
            let log_second = Arc::clone(&log_outer);
            HandlerResult::Become(Behavior::new().on::<(i64,), _>(move |_ctx, msg| {
                log_second
                    .lock()
                    .unwrap()
                    .push(format!("second:{}", msg.get::<i64>(0).unwrap()));
                HandlerResult::Continue
            }))
        })
    });

    actor.send((1i64,));
    actor.send((2i64,));
    actor.send((3i64,));
    probe.run();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["first:1", "second:2", "second:3"]
    );
}

#[test]
fn test_become_kept_and_unbecome() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log_in_actor = Arc::clone(&log);
    let actor = system.spawn(move |_ctx| {
        let log_base = Arc::clone(&log_in_actor);
        let log_for_push = log_in_actor;
        Behavior::new()
            .on::<(i64,), _>(move |_ctx, msg| {
                log_base
                    .lock()
                    .unwrap()
                    .push(format!("base:{}", msg.get::<i64>(0).unwrap()));
                HandlerResult::Continue
            })
            .on::<(Atom,), _>(move |_ctx, _msg| {
                let log_pushed = Arc::clone(&log_for_push);
                HandlerResult::BecomeKept(
                    Behavior::new()
                        .on::<(i64,), _>(move |_ctx, msg| {
                            log_pushed
                                .lock()
                                .unwrap()
                                .push(format!("pushed:{}", msg.get::<i64>(0).unwrap()));
                            HandlerResult::Continue
                        })
                        .on::<(Atom,), _>(|_ctx, _msg| HandlerResult::Unbecome),
                )
            })
    });

    actor.send((1i64,));
    actor.send((Atom::new("push"),));
    actor.send((2i64,));
    actor.send((Atom::new("pop"),));
    actor.send((3i64,));
    probe.run();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["base:1", "pushed:2", "base:3"]
    );
    assert!(!actor.is_terminated());
}

#[test]
fn test_skipped_elements_replay_after_become() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_actor = Arc::clone(&seen);
    let actor = system.spawn(move |_ctx| {
        let seen_later = Arc::clone(&seen_in_actor);
        Behavior::new()
            .on::<(i64,), _>(|_ctx, _msg| {
                // Not ready for numbers yet.
                HandlerResult::Skip
            })
            .on::<(Atom,), _>(move |_ctx, _msg| {
                let seen = Arc::clone(&seen_later);
                HandlerResult::Become(Behavior::new().on::<(i64,), _>(move |_ctx, msg| {
                    seen.lock().unwrap().push(*msg.get::<i64>(0).unwrap());
                    HandlerResult::Continue
                }))
            })
    });

    actor.send((1i64,));
    actor.send((2i64,));
    actor.send((Atom::new("ready"),));
    actor.send((3i64,));
    probe.run();

    // The stash replays in original order, ahead of later arrivals.
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_after_fires_on_idle_mailbox() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let fired = Arc::new(AtomicU32::new(0));
    let fired_in_actor = Arc::clone(&fired);
    let actor = system.spawn(move |_ctx| {
        let fired = Arc::clone(&fired_in_actor);
        Behavior::new()
            .on::<(i64,), _>(|_ctx, _msg| HandlerResult::Continue)
            .after(Duration::from_millis(100), move |_ctx| {
                fired.fetch_add(1, Ordering::SeqCst);
                HandlerResult::Continue
            })
    });

    // The actor parks with an empty mailbox; the timeout arms.
    probe.run();
    assert_eq!(probe.pending_timeouts(), 1);
    probe.trigger_timeouts();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Parking again re-arms the single-shot timeout.
    assert_eq!(probe.pending_timeouts(), 1);

    // A message invalidates the armed timeout: the stale tick is
    // dropped.
    actor.send((1i64,));
    probe.run();
    probe.trigger_timeouts();
    // One stale tick dropped, one fresh tick fired after the re-park.
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn test_reflect_default_handler() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    // The mirror bounces anything it does not understand.
    let mirror = system.spawn(|ctx| {
        ctx.set_default_handler(DefaultHandler::Reflect);
        Behavior::new().on::<(Atom,), _>(|_ctx, _msg| HandlerResult::Continue)
    });

    let bounced = Arc::new(Mutex::new(None::<i64>));
    let bounced_in_actor = Arc::clone(&bounced);
    let mirror_for_client = mirror.clone();
    let client = system.spawn(move |_ctx| {
        let mirror = mirror_for_client.clone();
        Behavior::new()
            .on::<(Atom,), _>(move |ctx, _msg| {
                ctx.send(&mirror, (99i64,));
                HandlerResult::Continue
            })
            .on::<(i64,), _>(move |_ctx, msg| {
                *bounced_in_actor.lock().unwrap() = msg.get::<i64>(0).copied();
                HandlerResult::Continue
            })
    });

    client.send((Atom::new("go"),));
    probe.run();
    assert_eq!(*bounced.lock().unwrap(), Some(99));
}

#[test]
fn test_delayed_send_goes_through_the_clock() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let got = Arc::new(AtomicU32::new(0));
    let got_in_actor = Arc::clone(&got);
    let actor = system.spawn(move |_ctx| {
        let got = Arc::clone(&got_in_actor);
        Behavior::new()
            .on::<(Atom,), _>(|ctx, _msg| {
                let me = ctx.self_ref();
                ctx.delayed_send(&me, Duration::from_millis(50), (7u32,));
                HandlerResult::Continue
            })
            .on::<(u32,), _>(move |_ctx, msg| {
                got.fetch_add(*msg.get::<u32>(0).unwrap(), Ordering::SeqCst);
                HandlerResult::Continue
            })
    });

    actor.send((Atom::new("go"),));
    probe.run();
    assert_eq!(got.load(Ordering::SeqCst), 0);
    assert_eq!(probe.pending_timeouts(), 1);

    probe.advance_time(Duration::from_millis(49));
    assert_eq!(got.load(Ordering::SeqCst), 0);
    probe.advance_time(Duration::from_millis(1));
    assert_eq!(got.load(Ordering::SeqCst), 7);
}

#[test]
fn test_delayed_send_overtakes_normal_backlog() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    // Clock deliveries ride the urgent band: a due delayed send drains
    // before normal-priority elements that arrived while it was armed.
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let log_in_actor = Arc::clone(&log);
    let actor = system.spawn(move |_ctx| {
        let log_for_delayed = Arc::clone(&log_in_actor);
        let log_for_backlog = log_in_actor;
        Behavior::new()
            .on::<(Atom,), _>(|ctx, _msg| {
                let me = ctx.self_ref();
                ctx.delayed_send(&me, Duration::from_millis(50), (7u32,));
                HandlerResult::Continue
            })
            .on::<(u32,), _>(move |_ctx, _msg| {
                log_for_delayed.lock().unwrap().push("delayed");
                HandlerResult::Continue
            })
            .on::<(i64,), _>(move |_ctx, _msg| {
                log_for_backlog.lock().unwrap().push("normal");
                HandlerResult::Continue
            })
    });

    actor.send((Atom::new("go"),));
    probe.run();

    for n in 0..5i64 {
        actor.send((n,));
    }
    probe.advance_time(Duration::from_millis(50));

    let log = log.lock().unwrap();
    assert_eq!(log.first().copied(), Some("delayed"));
    assert_eq!(log.len(), 6);
}

#[test]
fn test_group_broadcast() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let group = system.groups().get_local("workers");
    let hits = Arc::new(AtomicU32::new(0));
    let mut members = Vec::new();
    for _ in 0..3 {
        let hits_in_actor = Arc::clone(&hits);
        let member = system.spawn(move |_ctx| {
            let hits = Arc::clone(&hits_in_actor);
            Behavior::new().on::<(Atom,), _>(move |_ctx, _msg| {
                hits.fetch_add(1, Ordering::SeqCst);
                HandlerResult::Continue
            })
        });
        group.join(member.addr());
        members.push(member);
    }
    // Joining twice adds nothing.
    group.join(members[0].addr());
    assert_eq!(group.len(), 3);

    group.send((Atom::new("tick"),));
    probe.run();
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    // A terminated subscriber is pruned on the next broadcast.
    members[2].kill(hive_core::ExitReason::Kill);
    probe.run();
    drop(members.pop());
    group.send((Atom::new("tick"),));
    probe.run();
    assert_eq!(hits.load(Ordering::SeqCst), 5);
}
