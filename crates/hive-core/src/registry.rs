//! Local and named actor registries.
//!
//! The id registry maps every locally spawned actor id to a weak
//! control-block pointer (the network layer resolves inbound dispatch
//! targets through it). The named registry maps string keys to strong
//! references; names keep their actors alive until released.
//!
//! The registry also tracks the count of live local actors, which
//! drives [`Registry::await_all_done`] during system teardown.

use std::sync::Weak;

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::actor::{ActorCell, ActorId, ActorRef};
use crate::error::{Error, SecCode};

/// Id and name registries plus the live-actor count.
pub struct Registry {
    by_id: Mutex<FxHashMap<ActorId, Weak<ActorCell>>>,
    names: RwLock<FxHashMap<String, ActorRef>>,
    /// Reverse index for name cleanup on termination.
    name_index: Mutex<FxHashMap<ActorId, Vec<String>>>,
    alive: Mutex<usize>,
    all_done: Condvar,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            by_id: Mutex::new(FxHashMap::default()),
            names: RwLock::new(FxHashMap::default()),
            name_index: Mutex::new(FxHashMap::default()),
            alive: Mutex::new(0),
            all_done: Condvar::new(),
        }
    }

    /// Insert a freshly spawned actor.
    pub(crate) fn put(&self, id: ActorId, cell: Weak<ActorCell>) {
        self.by_id.lock().insert(id, cell);
        *self.alive.lock() += 1;
    }

    /// Resolve a local actor id to a strong handle.
    pub fn get(&self, id: ActorId) -> Option<ActorRef> {
        self.by_id
            .lock()
            .get(&id)
            .and_then(|weak| weak.upgrade())
            .map(ActorRef::from_cell)
    }

    /// Register `actor` under `name`.
    ///
    /// Fails with `invalid-argument` when the name is taken by a
    /// different actor; re-registering the same actor is a no-op.
    pub fn register_name(&self, name: &str, actor: &ActorRef) -> Result<(), Error> {
        let mut names = self.names.write();
        if let Some(existing) = names.get(name) {
            if existing == actor {
                return Ok(());
            }
            return Err(Error::sec(SecCode::InvalidArgument));
        }
        names.insert(name.to_string(), actor.clone());
        drop(names);
        self.name_index
            .lock()
            .entry(actor.id())
            .or_default()
            .push(name.to_string());
        Ok(())
    }

    /// Release a name; unknown names are ignored.
    pub fn unregister_name(&self, name: &str) {
        let removed = self.names.write().remove(name);
        if let Some(actor) = removed {
            let mut index = self.name_index.lock();
            if let Some(list) = index.get_mut(&actor.id()) {
                list.retain(|n| n != name);
                if list.is_empty() {
                    index.remove(&actor.id());
                }
            }
        }
    }

    /// Resolve a registered name.
    pub fn get_named(&self, name: &str) -> Option<ActorRef> {
        self.names.read().get(name).cloned()
    }

    /// Live local actors.
    pub fn running(&self) -> usize {
        *self.alive.lock()
    }

    /// Block until every counted actor has terminated.
    pub fn await_all_done(&self) {
        let mut alive = self.alive.lock();
        while *alive > 0 {
            self.all_done.wait(&mut alive);
        }
    }

    /// Remove a terminated actor: id slot, registered names, live
    /// count.
    pub(crate) fn erase(&self, id: ActorId) {
        self.by_id.lock().remove(&id);
        let names = self.name_index.lock().remove(&id);
        if let Some(names) = names {
            let mut map = self.names.write();
            for name in names {
                map.remove(&name);
            }
        }
        let mut alive = self.alive.lock();
        *alive = alive.saturating_sub(1);
        if *alive == 0 {
            self.all_done.notify_all();
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("running", &self.running())
            .field("named", &self.names.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::behavior::{Behavior, HandlerResult};
    use crate::config::SystemConfig;
    use crate::error::ExitReason;
    use crate::system::ActorSystem;

    fn idle(system: &ActorSystem) -> crate::actor::ActorRef {
        system.spawn(|_ctx| Behavior::new().on_any(|_ctx, _msg| HandlerResult::Continue))
    }

    #[test]
    fn test_register_and_lookup_names() {
        let system = ActorSystem::new(SystemConfig::testing());
        let a = idle(&system);
        let registry = system.registry();

        registry.register_name("alpha", &a).unwrap();
        assert_eq!(registry.get_named("alpha"), Some(a.clone()));
        // Re-registering the same actor is a no-op; a different actor
        // is rejected.
        registry.register_name("alpha", &a).unwrap();
        let b = idle(&system);
        assert!(registry.register_name("alpha", &b).is_err());

        registry.unregister_name("alpha");
        assert!(registry.get_named("alpha").is_none());

        assert_eq!(registry.get(a.id()), Some(a.clone()));
        assert!(registry.get(9_999).is_none());
        assert_eq!(registry.running(), 2);
    }

    #[test]
    fn test_names_released_on_termination() {
        let system = ActorSystem::new(SystemConfig::testing());
        let probe = system.test_probe().unwrap();
        let a = idle(&system);
        system.registry().register_name("ephemeral", &a).unwrap();

        a.kill(ExitReason::Kill);
        probe.run();

        assert!(system.registry().get_named("ephemeral").is_none());
        assert!(system.registry().get(a.id()).is_none());
        assert_eq!(system.registry().running(), 0);
    }
}
