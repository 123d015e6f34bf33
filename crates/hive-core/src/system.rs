//! The actor system: owner of every piece of shared runtime state.
//!
//! There are no process-wide singletons. One [`ActorSystem`] value owns
//! the node identity, scheduler, clock, registries, type registry and
//! groups; everything else receives it explicitly or reaches it through
//! the handler [`Context`]. The system is constructed by the user and
//! destroyed last: `await_all_actors_done` is the teardown handshake.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::actor::blocking::ScopedActor;
use crate::actor::cell::{ActorCell, ResumeResult, SchedulingMode};
use crate::actor::{ActorId, ActorRef, Context};
use crate::behavior::Behavior;
use crate::config::{SchedulerPolicy, SystemConfig};
use crate::envelope::Envelope;
use crate::error::ExitReason;
use crate::group::GroupModule;
use crate::message::Message;
use crate::node::NodeId;
use crate::registry::Registry;
use crate::sched::{ClockHandle, PoolCore, SchedulerHandle, TestClock, TestCore, ThreadClock};
use crate::types::TypeRegistry;

// ---------------------------------------------------------------------------
// SystemCore
// ---------------------------------------------------------------------------

/// Shared state behind an [`ActorSystem`] handle.
pub struct SystemCore {
    node: NodeId,
    config: SystemConfig,
    sched: SchedulerHandle,
    clock: ClockHandle,
    registry: Registry,
    types: TypeRegistry,
    groups: GroupModule,
    next_actor_id: AtomicU64,
}

impl SystemCore {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn groups(&self) -> &GroupModule {
        &self.groups
    }

    pub(crate) fn clock(&self) -> &ClockHandle {
        &self.clock
    }
}

impl Drop for SystemCore {
    fn drop(&mut self) {
        self.clock.shutdown();
        self.sched.shutdown();
    }
}

// ---------------------------------------------------------------------------
// SpawnOptions
// ---------------------------------------------------------------------------

/// Options for [`ActorSystem::spawn_opts`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SpawnOptions {
    /// Do not schedule until the first message arrives.
    pub lazy: bool,
    /// Run on a dedicated OS thread instead of the shared scheduler
    /// (for behaviors that block).
    pub detached: bool,
}

impl SpawnOptions {
    pub fn lazy() -> SpawnOptions {
        SpawnOptions {
            lazy: true,
            ..SpawnOptions::default()
        }
    }

    pub fn detached() -> SpawnOptions {
        SpawnOptions {
            detached: true,
            ..SpawnOptions::default()
        }
    }
}

// ---------------------------------------------------------------------------
// ActorSystem
// ---------------------------------------------------------------------------

/// Handle to the runtime; cheap to clone.
#[derive(Clone)]
pub struct ActorSystem {
    core: Arc<SystemCore>,
}

impl ActorSystem {
    /// Build a system from `config`: generates the node id and starts
    /// scheduler and clock per the configured policy.
    pub fn new(config: SystemConfig) -> ActorSystem {
        let (sched, clock) = match config.scheduler_policy {
            SchedulerPolicy::Stealing => (
                SchedulerHandle::Pool(PoolCore::start(
                    config.scheduler_workers,
                    config.scheduler_max_throughput,
                )),
                ClockHandle::Thread(ThreadClock::start()),
            ),
            SchedulerPolicy::Testing => (
                SchedulerHandle::Testing(TestCore::new(config.scheduler_max_throughput)),
                ClockHandle::Test(TestClock::new()),
            ),
        };
        ActorSystem {
            core: Arc::new(SystemCore {
                node: NodeId::generate(),
                config,
                sched,
                clock,
                registry: Registry::new(),
                types: TypeRegistry::new(),
                groups: GroupModule::new(),
                next_actor_id: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn from_core(core: Arc<SystemCore>) -> ActorSystem {
        ActorSystem { core }
    }

    pub fn node(&self) -> NodeId {
        self.core.node
    }

    pub fn config(&self) -> &SystemConfig {
        &self.core.config
    }

    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.core.types
    }

    pub fn groups(&self) -> &GroupModule {
        &self.core.groups
    }

    pub(crate) fn clock(&self) -> &ClockHandle {
        self.core.clock()
    }

    // -- spawning ----------------------------------------------------------

    /// Spawn an actor; `init` runs on the calling thread and returns
    /// the initial behavior. An empty behavior terminates the actor
    /// right away.
    pub fn spawn(&self, init: impl FnOnce(&mut Context<'_>) -> Behavior) -> ActorRef {
        self.spawn_opts(SpawnOptions::default(), init)
    }

    pub fn spawn_opts(
        &self,
        opts: SpawnOptions,
        init: impl FnOnce(&mut Context<'_>) -> Behavior,
    ) -> ActorRef {
        let id = self.core.next_actor_id.fetch_add(1, Ordering::Relaxed);
        let mode = if opts.detached {
            SchedulingMode::Detached
        } else {
            SchedulingMode::Scheduled
        };
        let cell = ActorCell::new(
            self.node(),
            id,
            Arc::downgrade(&self.core),
            self.core.sched.clone(),
            mode,
            true,
            false,
        );
        self.core.registry.put(id, Arc::downgrade(&cell));
        self.finish_spawn(cell, opts, init)
    }

    /// Spawn a stand-in for a remote actor: the cell carries the given
    /// foreign identity, stays out of the local registry, and is always
    /// lazy. Used by the network layer for proxies.
    pub fn spawn_with_identity(
        &self,
        node: NodeId,
        id: ActorId,
        init: impl FnOnce(&mut Context<'_>) -> Behavior,
    ) -> ActorRef {
        let cell = ActorCell::new(
            node,
            id,
            Arc::downgrade(&self.core),
            self.core.sched.clone(),
            SchedulingMode::Scheduled,
            false,
            true,
        );
        self.finish_spawn(cell, SpawnOptions::lazy(), init)
    }

    fn finish_spawn(
        &self,
        cell: Arc<ActorCell>,
        opts: SpawnOptions,
        init: impl FnOnce(&mut Context<'_>) -> Behavior,
    ) -> ActorRef {
        let actor = ActorRef::from_cell(Arc::clone(&cell));
        let behavior = {
            let env = Envelope::asynchronous(None, Message::empty());
            let mut ctx = Context::new(&cell, &self.core, &env);
            init(&mut ctx)
        };
        if behavior.is_empty() {
            cell.terminate(ExitReason::Normal);
            return actor;
        }
        cell.push_initial_behavior(behavior);
        if opts.detached {
            let tput = self.core.config.scheduler_max_throughput;
            let worker = Arc::clone(&cell);
            std::thread::Builder::new()
                .name(format!("hive-detached-{}", cell.id()))
                .spawn(move || loop {
                    match worker.resume(tput) {
                        ResumeResult::Done => return,
                        ResumeResult::Awaiting => {
                            worker.mailbox().wait_nonempty(None);
                        }
                        ResumeResult::ResumeLater => {}
                    }
                })
                .expect("spawn detached actor thread");
        } else if !opts.lazy {
            cell.open_mailbox();
            self.core.sched.schedule(cell);
        }
        actor
    }

    /// A blocking actor owned by the calling thread, for synchronous
    /// request/receive outside any handler. Requires the stealing
    /// scheduler (under the test coordinator nothing would run the
    /// peer).
    pub fn scoped_actor(&self) -> ScopedActor {
        let id = self.core.next_actor_id.fetch_add(1, Ordering::Relaxed);
        let cell = ActorCell::new(
            self.node(),
            id,
            Arc::downgrade(&self.core),
            self.core.sched.clone(),
            SchedulingMode::Manual,
            true,
            false,
        );
        self.core.registry.put(id, Arc::downgrade(&cell));
        ScopedActor::new(self.clone(), cell)
    }

    // -- lifecycle ---------------------------------------------------------

    /// Block until every counted local actor has terminated.
    pub fn await_all_actors_done(&self) {
        self.core.registry.await_all_done();
    }

    /// Tear down scheduler and clock. Actors that have not terminated
    /// yet are abandoned; call [`ActorSystem::await_all_actors_done`]
    /// first for a clean handshake.
    pub fn shutdown(&self) {
        self.core.clock.shutdown();
        self.core.sched.shutdown();
    }

    // -- test driver -------------------------------------------------------

    /// Deterministic driver handles, when running under the testing
    /// policy.
    pub fn test_probe(&self) -> Option<TestProbe> {
        match (&self.core.sched, &self.core.clock) {
            (SchedulerHandle::Testing(sched), ClockHandle::Test(clock)) => Some(TestProbe {
                sched: Arc::clone(sched),
                clock: Arc::clone(clock),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSystem")
            .field("node", &self.node())
            .field("running", &self.core.registry.running())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TestProbe
// ---------------------------------------------------------------------------

/// Driver for the deterministic scheduler and clock.
pub struct TestProbe {
    sched: Arc<TestCore>,
    clock: Arc<TestClock>,
}

impl TestProbe {
    /// Resume the next runnable actor; false when idle.
    pub fn run_once(&self) -> bool {
        self.sched.run_once()
    }

    /// Drain the run queue; returns the number of resume steps.
    pub fn run(&self) -> usize {
        self.sched.run()
    }

    pub fn has_job(&self) -> bool {
        self.sched.has_job()
    }

    /// Fire the earliest armed timer, then drain the run queue.
    pub fn trigger_timeout(&self) -> bool {
        let fired = self.clock.trigger_timeout();
        self.sched.run();
        fired
    }

    /// Fire all armed timers, then drain the run queue. Returns the
    /// number fired.
    pub fn trigger_timeouts(&self) -> usize {
        let fired = self.clock.trigger_timeouts();
        self.sched.run();
        fired
    }

    /// Advance virtual time, firing due timers and draining the run
    /// queue.
    pub fn advance_time(&self, delta: std::time::Duration) -> usize {
        let fired = self.clock.advance(delta);
        self.sched.run();
        fired
    }

    pub fn pending_timeouts(&self) -> usize {
        self.clock.pending()
    }
}
