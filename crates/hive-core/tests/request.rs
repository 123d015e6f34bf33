//! Request/response: continuations, timeouts, receiver-down, promises.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hive_core::{
    ActorSystem, Atom, Behavior, Error, ExitReason, HandlerResult, IntoMessage, SecCode,
    SystemConfig,
};

fn testing_system() -> ActorSystem {
    ActorSystem::new(SystemConfig::testing())
}

#[test]
fn test_request_reply_runs_success_continuation() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let adder = system.spawn(|_ctx| {
        Behavior::new().on::<(i64, i64), _>(|_ctx, msg| {
            let a = *msg.get::<i64>(0).unwrap();
            let b = *msg.get::<i64>(1).unwrap();
            HandlerResult::Reply((a + b,).into_message())
        })
    });

    let result = Arc::new(AtomicI64::new(0));
    let result_in_actor = Arc::clone(&result);
    let client = system.spawn(move |_ctx| {
        let adder = adder.clone();
        Behavior::new().on::<(Atom,), _>(move |ctx, _msg| {
            let result = Arc::clone(&result_in_actor);
            ctx.request(&adder, Duration::from_secs(1), (20i64, 22i64)).then(
                move |_ctx, reply| {
                    result.store(*reply.get::<i64>(0).unwrap(), Ordering::SeqCst);
                    HandlerResult::Continue
                },
                |_ctx, _err| HandlerResult::Continue,
            );
            HandlerResult::Continue
        })
    });

    client.send((Atom::new("go"),));
    probe.run();
    assert_eq!(result.load(Ordering::SeqCst), 42);
}

#[test]
fn test_request_timeout_fires_error_continuation() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    // A sink that accepts the request but never answers.
    let silent = system.spawn(|_ctx| {
        Behavior::new().on::<(Atom,), _>(|_ctx, _msg| HandlerResult::Async)
    });

    let observed = Arc::new(AtomicU32::new(0));
    let observed_in_actor = Arc::clone(&observed);
    let client = system.spawn(move |_ctx| {
        let silent = silent.clone();
        Behavior::new().on::<(Atom,), _>(move |ctx, _msg| {
            let observed = Arc::clone(&observed_in_actor);
            ctx.request(&silent, Duration::from_millis(50), (Atom::new("hi"),))
                .then(
                    |_ctx, _reply| HandlerResult::Continue,
                    move |_ctx, err| {
                        if err.as_sec() == Some(SecCode::RequestTimeout) {
                            observed.fetch_add(1, Ordering::SeqCst);
                        }
                        HandlerResult::Continue
                    },
                );
            HandlerResult::Continue
        })
    });

    client.send((Atom::new("go"),));
    probe.run();
    assert_eq!(observed.load(Ordering::SeqCst), 0);

    // The armed deadline is the only pending timer.
    assert_eq!(probe.pending_timeouts(), 1);
    probe.trigger_timeouts();
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    // Firing again must not double-complete the request.
    probe.trigger_timeouts();
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_request_timeout_overtakes_normal_backlog() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let silent = system.spawn(|_ctx| {
        Behavior::new().on::<(Atom,), _>(|_ctx, _msg| HandlerResult::Async)
    });

    // The fired deadline arrives in the urgent band and must drain
    // ahead of normal-priority traffic that queued up before it.
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let log_in_actor = Arc::clone(&log);
    let client = system.spawn(move |_ctx| {
        let silent = silent.clone();
        let log_for_timeout = Arc::clone(&log_in_actor);
        let log_for_backlog = log_in_actor;
        Behavior::new()
            .on::<(Atom,), _>(move |ctx, _msg| {
                let log = Arc::clone(&log_for_timeout);
                ctx.request(&silent, Duration::from_millis(50), (Atom::new("hi"),))
                    .then(
                        |_ctx, _reply| HandlerResult::Continue,
                        move |_ctx, err| {
                            assert_eq!(err.as_sec(), Some(SecCode::RequestTimeout));
                            log.lock().unwrap().push("timeout");
                            HandlerResult::Continue
                        },
                    );
                HandlerResult::Continue
            })
            .on::<(i64,), _>(move |_ctx, _msg| {
                log_for_backlog.lock().unwrap().push("normal");
                HandlerResult::Continue
            })
    });

    client.send((Atom::new("go"),));
    probe.run();

    // Normal-band backlog piles up while the deadline is armed.
    for n in 0..5i64 {
        client.send((n,));
    }
    probe.trigger_timeouts();

    let log = log.lock().unwrap();
    assert_eq!(log.first().copied(), Some("timeout"));
    assert_eq!(log.len(), 6);
}

#[test]
fn test_request_receiver_down() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let doomed = system.spawn(|_ctx| {
        Behavior::new().on::<(Atom,), _>(|_ctx, _msg| HandlerResult::Async)
    });

    let observed = Arc::new(AtomicU32::new(0));
    let observed_in_actor = Arc::clone(&observed);
    let doomed_for_client = doomed.clone();
    let client = system.spawn(move |_ctx| {
        let doomed = doomed_for_client.clone();
        Behavior::new().on::<(Atom,), _>(move |ctx, _msg| {
            let observed = Arc::clone(&observed_in_actor);
            ctx.request(&doomed, Duration::from_secs(60), (Atom::new("hi"),))
                .then(
                    |_ctx, _reply| HandlerResult::Continue,
                    move |_ctx, err| {
                        if err.as_sec() == Some(SecCode::RequestReceiverDown) {
                            observed.fetch_add(1, Ordering::SeqCst);
                        }
                        HandlerResult::Continue
                    },
                );
            HandlerResult::Continue
        })
    });

    client.send((Atom::new("go"),));
    probe.run();

    doomed.kill(ExitReason::UserShutdown);
    probe.run();
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    // The stale deadline timer fires into the void.
    probe.trigger_timeouts();
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_response_promise_delivers_later() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    // The server parks each request's promise and fulfills it when a
    // flush message arrives.
    let parked = Arc::new(Mutex::new(Vec::new()));
    let parked_in_server = Arc::clone(&parked);
    let server = system.spawn(move |_ctx| {
        let parked = parked_in_server;
        Behavior::new()
            .on::<(i64,), _>({
                let parked = Arc::clone(&parked);
                move |ctx, msg| {
                    let n = *msg.get::<i64>(0).unwrap();
                    parked.lock().unwrap().push((n, ctx.make_response_promise()));
                    HandlerResult::Async
                }
            })
            .on::<(Atom,), _>(move |_ctx, _msg| {
                for (n, promise) in parked.lock().unwrap().drain(..) {
                    promise.deliver((n * 2,));
                }
                HandlerResult::Continue
            })
    });

    let total = Arc::new(AtomicI64::new(0));
    let total_in_client = Arc::clone(&total);
    let server_for_client = server.clone();
    let client = system.spawn(move |_ctx| {
        let server = server_for_client.clone();
        Behavior::new().on::<(Atom,), _>(move |ctx, _msg| {
            for n in [1i64, 2, 3] {
                let total = Arc::clone(&total_in_client);
                ctx.request(&server, Duration::from_secs(1), (n,)).then(
                    move |_ctx, reply| {
                        total.fetch_add(*reply.get::<i64>(0).unwrap(), Ordering::SeqCst);
                        HandlerResult::Continue
                    },
                    |_ctx, _err| HandlerResult::Continue,
                );
            }
            HandlerResult::Continue
        })
    });

    client.send((Atom::new("go"),));
    probe.run();
    assert_eq!(total.load(Ordering::SeqCst), 0);

    server.send((Atom::new("flush"),));
    probe.run();
    assert_eq!(total.load(Ordering::SeqCst), 12);
}

#[test]
fn test_dropped_promise_reports_broken_promise() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    let careless = system.spawn(|_ctx| {
        Behavior::new().on::<(Atom,), _>(|ctx, _msg| {
            // Captured and immediately dropped.
            let _ = ctx.make_response_promise();
            HandlerResult::Async
        })
    });

    let observed = Arc::new(AtomicU32::new(0));
    let observed_in_actor = Arc::clone(&observed);
    let client = system.spawn(move |_ctx| {
        let careless = careless.clone();
        Behavior::new().on::<(Atom,), _>(move |ctx, _msg| {
            let observed = Arc::clone(&observed_in_actor);
            ctx.request(&careless, Duration::from_secs(1), (Atom::new("hi"),))
                .then(
                    |_ctx, _reply| HandlerResult::Continue,
                    move |_ctx, err| {
                        if err.as_sec() == Some(SecCode::BrokenPromise) {
                            observed.fetch_add(1, Ordering::SeqCst);
                        }
                        HandlerResult::Continue
                    },
                );
            HandlerResult::Continue
        })
    });

    client.send((Atom::new("go"),));
    probe.run();
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unexpected_request_gets_error_response() {
    let system = testing_system();
    let probe = system.test_probe().unwrap();

    // Only speaks i64; the atom request is unexpected.
    let narrow = system.spawn(|_ctx| {
        Behavior::new().on::<(i64,), _>(|_ctx, _msg| HandlerResult::Continue)
    });

    let observed = Arc::new(Mutex::new(None::<Error>));
    let observed_in_actor = Arc::clone(&observed);
    let client = system.spawn(move |_ctx| {
        let narrow = narrow.clone();
        Behavior::new().on::<(Atom,), _>(move |ctx, _msg| {
            let observed = Arc::clone(&observed_in_actor);
            ctx.request(&narrow, Duration::from_secs(1), (Atom::new("hi"),))
                .then(
                    |_ctx, _reply| HandlerResult::Continue,
                    move |_ctx, err| {
                        *observed.lock().unwrap() = Some(err);
                        HandlerResult::Continue
                    },
                );
            HandlerResult::Continue
        })
    });

    client.send((Atom::new("go"),));
    probe.run();
    let err = observed.lock().unwrap().clone().expect("error response");
    assert_eq!(err.as_sec(), Some(SecCode::UnexpectedMessage));
}
