//! Local process groups: join/leave plus broadcast.
//!
//! A group is a named set of subscriber addresses. Sending to the group
//! broadcasts an asynchronous message to every current subscriber;
//! members whose actors terminated are pruned on the way.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::actor::ActorAddr;
use crate::envelope::Envelope;
use crate::message::IntoMessage;

/// One named broadcast group.
#[derive(Clone)]
pub struct Group {
    name: Arc<str>,
    members: Arc<RwLock<FxHashSet<ActorAddr>>>,
}

impl Group {
    fn new(name: &str) -> Group {
        Group {
            name: Arc::from(name),
            members: Arc::new(RwLock::new(FxHashSet::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe; idempotent.
    pub fn join(&self, member: ActorAddr) {
        self.members.write().insert(member);
    }

    /// Unsubscribe; unknown members are ignored.
    pub fn leave(&self, member: &ActorAddr) {
        self.members.write().remove(member);
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Broadcast an anonymous asynchronous message to all subscribers,
    /// pruning terminated ones.
    pub fn send(&self, msg: impl IntoMessage) {
        let msg = msg.into_message();
        let mut dead: Vec<ActorAddr> = Vec::new();
        {
            let members = self.members.read();
            for member in members.iter() {
                match member.upgrade() {
                    Some(actor) => {
                        actor.enqueue(Envelope::asynchronous(None, msg.clone()));
                    }
                    None => dead.push(member.clone()),
                }
            }
        }
        if !dead.is_empty() {
            let mut members = self.members.write();
            for member in dead {
                members.remove(&member);
            }
        }
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("members", &self.len())
            .finish()
    }
}

/// The per-system group table.
pub struct GroupModule {
    groups: RwLock<FxHashMap<String, Group>>,
}

impl GroupModule {
    pub(crate) fn new() -> GroupModule {
        GroupModule {
            groups: RwLock::new(FxHashMap::default()),
        }
    }

    /// Get or create the local group `name`.
    pub fn get_local(&self, name: &str) -> Group {
        if let Some(group) = self.groups.read().get(name) {
            return group.clone();
        }
        let mut groups = self.groups.write();
        groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name))
            .clone()
    }
}

impl std::fmt::Debug for GroupModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupModule")
            .field("groups", &self.groups.read().len())
            .finish()
    }
}
