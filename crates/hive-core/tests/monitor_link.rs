//! Monitor and link semantics: down messages, exit cascades, trapping.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use hive_core::{
    ActorSystem, Atom, Behavior, DownMsg, ExitMsg, ExitReason, HandlerResult, SystemConfig,
};

fn testing_system() -> ActorSystem {
    ActorSystem::new(SystemConfig::testing())
}

/// An actor that idles until told to quit with a given reason.
fn idler(system: &ActorSystem) -> hive_core::ActorRef {
    system.spawn(|_ctx| {
        Behavior::new().on::<(Atom, u32), _>(|_ctx, msg| {
            let code = *msg.get::<u32>(1).unwrap();
            let reason = ExitReason::from_code(code).unwrap_or(ExitReason::Normal);
            HandlerResult::Quit(reason)
        })
    })
}

#[test]
fn test_monitor_delivers_down_message() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let target = idler(&system);
    let observed = Arc::new(Mutex::new(None::<ExitReason>));

    let observed_in_actor = Arc::clone(&observed);
    let target_for_observer = target.clone();
    let observer = system.spawn(move |_ctx| {
        let target = target_for_observer.clone();
        Behavior::new()
            .on::<(Atom,), _>(move |ctx, _msg| {
                ctx.monitor(&target);
                HandlerResult::Continue
            })
            .on::<(DownMsg,), _>(move |_ctx, msg| {
                let down = msg.get::<DownMsg>(0).unwrap();
                *observed_in_actor.lock().unwrap() = Some(down.reason);
                HandlerResult::Continue
            })
    });

    observer.send((Atom::new("watch"),));
    probe.run();

    target.send((Atom::new("quit"), ExitReason::UserShutdown.code()));
    probe.run();

    assert_eq!(*observed.lock().unwrap(), Some(ExitReason::UserShutdown));
    assert!(!observer.is_terminated());
}

#[test]
fn test_monitor_on_terminated_actor_fires_immediately() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let target = idler(&system);
    target.send((Atom::new("quit"), ExitReason::UserShutdown.code()));
    probe.run();
    assert!(target.is_terminated());

    let observed = Arc::new(Mutex::new(None::<ExitReason>));
    let observed_in_actor = Arc::clone(&observed);
    let target_for_observer = target.clone();
    let observer = system.spawn(move |_ctx| {
        let target = target_for_observer.clone();
        Behavior::new()
            .on::<(Atom,), _>(move |ctx, _msg| {
                ctx.monitor(&target);
                HandlerResult::Continue
            })
            .on::<(DownMsg,), _>(move |_ctx, msg| {
                let down = msg.get::<DownMsg>(0).unwrap();
                *observed_in_actor.lock().unwrap() = Some(down.reason);
                HandlerResult::Continue
            })
    });

    observer.send((Atom::new("watch"),));
    probe.run();
    assert_eq!(*observed.lock().unwrap(), Some(ExitReason::UserShutdown));
}

#[test]
fn test_link_cascades_abnormal_exit() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let left = idler(&system);
    let right = idler(&system);

    let left_for_helper = left.clone();
    let right_for_helper = right.clone();
    let helper = system.spawn(move |_ctx| {
        Behavior::new().on::<(Atom,), _>(move |ctx, _msg| {
            // Symmetric link between left and right via two one-sided
            // context calls.
            ctx.link_to(&left_for_helper);
            ctx.link_to(&right_for_helper);
            HandlerResult::Quit(ExitReason::User(300))
        })
    });

    helper.send((Atom::new("go"),));
    probe.run();

    // The helper quit with user reason 300; both linked idlers must
    // co-terminate observing it.
    assert!(left.is_terminated());
    assert!(right.is_terminated());
    assert_eq!(left.exit_reason(), Some(ExitReason::User(300)));
    assert_eq!(right.exit_reason(), Some(ExitReason::User(300)));
}

#[test]
fn test_normal_exit_is_absorbed_by_links() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let survivor = idler(&system);
    let survivor_for_helper = survivor.clone();
    let helper = system.spawn(move |_ctx| {
        Behavior::new().on::<(Atom,), _>(move |ctx, _msg| {
            ctx.link_to(&survivor_for_helper);
            HandlerResult::Quit(ExitReason::Normal)
        })
    });

    helper.send((Atom::new("go"),));
    probe.run();

    assert!(helper.is_terminated());
    assert!(!survivor.is_terminated());
}

#[test]
fn test_exit_trapping_observes_reason() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let doomed = idler(&system);
    let observed = Arc::new(Mutex::new(None::<ExitReason>));

    let observed_in_actor = Arc::clone(&observed);
    let doomed_for_trapper = doomed.clone();
    let trapper = system.spawn(move |_ctx| {
        let doomed = doomed_for_trapper.clone();
        Behavior::new()
            .on::<(Atom,), _>(move |ctx, _msg| {
                ctx.link_to(&doomed);
                HandlerResult::Continue
            })
            .on::<(ExitMsg,), _>(move |_ctx, msg| {
                let exit = msg.get::<ExitMsg>(0).unwrap();
                *observed_in_actor.lock().unwrap() = Some(exit.reason);
                HandlerResult::Continue
            })
    });

    trapper.send((Atom::new("link"),));
    probe.run();

    doomed.send((Atom::new("quit"), ExitReason::User(400).code()));
    probe.run();

    assert_eq!(*observed.lock().unwrap(), Some(ExitReason::User(400)));
    assert!(!trapper.is_terminated());
}

#[test]
fn test_kill_bypasses_trapping() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    let counter_in_actor = Arc::clone(&counter);
    let trapper = system.spawn(move |_ctx| {
        Behavior::new().on::<(ExitMsg,), _>(move |_ctx, _msg| {
            counter_in_actor.fetch_add(1, Ordering::SeqCst);
            HandlerResult::Continue
        })
    });

    trapper.kill(ExitReason::Kill);
    probe.run();

    assert!(trapper.is_terminated());
    assert_eq!(trapper.exit_reason(), Some(ExitReason::Kill));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn test_linked_pair_dies_in_either_order() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let bystander = idler(&system);
    let b = idler(&system);

    let b_for_a = b.clone();
    let a = system.spawn(move |_ctx| {
        Behavior::new().on::<(Atom,), _>(move |ctx, _msg| {
            ctx.link_to(&b_for_a);
            HandlerResult::Continue
        })
    });
    a.send((Atom::new("link"),));
    probe.run();

    b.send((Atom::new("quit"), ExitReason::User(500).code()));
    probe.run();

    assert!(b.is_terminated());
    assert!(a.is_terminated());
    assert_eq!(a.exit_reason(), Some(ExitReason::User(500)));
    assert_eq!(b.exit_reason(), Some(ExitReason::User(500)));
    // Unlinked actors are unaffected.
    assert!(!bystander.is_terminated());
}
