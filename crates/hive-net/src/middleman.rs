//! The middleman: the per-process facade over the network layer.
//!
//! Owns the multiplexer and the BASP broker, registers the well-known
//! system actors (`BASP`, `ConfigServ`, `SpawnServ`), and exposes the
//! synchronous entry points: publish, unpublish, remote actor, remote
//! lookup, named brokers, stop. Each call is a scoped-actor message
//! exchange with the broker, so the facade requires the stealing
//! scheduler; deterministic tests talk to the broker directly instead.

use std::time::Duration;

use hive_core::{
    ActorAddr, ActorRef, ActorSystem, Atom, Behavior, Context, Error, ExitReason, HandlerResult,
    IntoMessage, NodeId, SecCode,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::basp_broker::{
    self, ConnectCmd, ConnectUdpCmd, LookupCmd, PublishCmd, PublishUdpCmd, StopCmd, UnpublishCmd,
    CONNECTIVITY_KEY,
};
use crate::broker::register_event_types;
use crate::mpx::MultiplexerPtr;

/// Deadline for one facade call.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// The network facade. One per process (per actor system).
pub struct Middleman {
    system: ActorSystem,
    mpx: MultiplexerPtr,
    broker: ActorRef,
    config_serv: ActorRef,
    spawn_serv: ActorRef,
    stopped: Mutex<bool>,
}

impl Middleman {
    /// Start the network layer: spawns the BASP broker and the named
    /// system actors and registers them in the system's named
    /// registry.
    pub fn new(system: &ActorSystem, mpx: MultiplexerPtr) -> Middleman {
        register_event_types(system.types());

        let config_serv = spawn_config_serv(system);
        system
            .registry()
            .register_name("ConfigServ", &config_serv)
            .expect("ConfigServ name is free");

        let spawn_serv = spawn_spawn_serv(system);
        system
            .registry()
            .register_name("SpawnServ", &spawn_serv)
            .expect("SpawnServ name is free");

        let broker = basp_broker::spawn(system, mpx.clone());
        system
            .registry()
            .register_name("BASP", &broker)
            .expect("BASP name is free");

        Middleman {
            system: system.clone(),
            mpx,
            broker,
            config_serv,
            spawn_serv,
            stopped: Mutex::new(false),
        }
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// The BASP broker actor.
    pub fn broker(&self) -> &ActorRef {
        &self.broker
    }

    pub fn config_serv(&self) -> &ActorRef {
        &self.config_serv
    }

    // -- publishing --------------------------------------------------------

    /// Publish `actor` on a TCP port; returns the actually bound port.
    pub fn publish(&self, actor: &ActorRef, port: u16, reuse_addr: bool) -> Result<u16, Error> {
        let scoped = self.system.scoped_actor();
        let reply = scoped.request(
            &self.broker,
            CALL_TIMEOUT,
            (PublishCmd {
                aid: actor.id(),
                port,
                reuse_addr,
            },),
        )?;
        let bound = *reply
            .get::<u16>(0)
            .ok_or(Error::sec(SecCode::UnexpectedMessage))?;
        self.announce_endpoint(bound);
        Ok(bound)
    }

    /// Publish `actor` on a UDP port.
    pub fn publish_udp(&self, actor: &ActorRef, port: u16) -> Result<u16, Error> {
        let scoped = self.system.scoped_actor();
        let reply = scoped.request(
            &self.broker,
            CALL_TIMEOUT,
            (PublishUdpCmd {
                aid: actor.id(),
                port,
            },),
        )?;
        let bound = *reply
            .get::<u16>(0)
            .ok_or(Error::sec(SecCode::UnexpectedMessage))?;
        Ok(bound)
    }

    /// Remove whatever is published at `port`.
    pub fn unpublish(&self, port: u16) -> Result<(), Error> {
        let scoped = self.system.scoped_actor();
        scoped
            .request(&self.broker, CALL_TIMEOUT, (UnpublishCmd { port },))
            .map(|_| ())
    }

    // -- connecting --------------------------------------------------------

    /// Connect to `host:port` and return a handle to the actor
    /// published there. Blocks until the handshake completed.
    pub fn remote_actor(&self, host: &str, port: u16) -> Result<ActorRef, Error> {
        self.contact(
            (ConnectCmd {
                host: host.to_string(),
                port,
            },)
                .into_message(),
        )
    }

    /// Datagram-transport variant of [`Middleman::remote_actor`].
    pub fn remote_actor_udp(&self, host: &str, port: u16) -> Result<ActorRef, Error> {
        self.contact(
            (ConnectUdpCmd {
                host: host.to_string(),
                port,
            },)
                .into_message(),
        )
    }

    fn contact(&self, cmd: hive_core::Message) -> Result<ActorRef, Error> {
        let scoped = self.system.scoped_actor();
        let reply = scoped.request(&self.broker, CALL_TIMEOUT, cmd)?;
        let addr = reply
            .get::<ActorAddr>(1)
            .ok_or(Error::sec(SecCode::CannotConnectToNode))?;
        addr.upgrade()
            .ok_or(Error::sec(SecCode::CannotConnectToNode))
    }

    /// Node id of a connected peer, by the handle obtained from
    /// [`Middleman::remote_actor`].
    pub fn node_of(&self, actor: &ActorRef) -> NodeId {
        actor.node()
    }

    /// Resolve the actor registered under `name` on `node`.
    pub fn remote_lookup(&self, name: &str, node: NodeId) -> Result<ActorRef, Error> {
        let scoped = self.system.scoped_actor();
        let reply = scoped.request(
            &self.broker,
            CALL_TIMEOUT,
            (LookupCmd {
                node,
                name: name.to_string(),
            },),
        )?;
        let addr = reply
            .get::<ActorAddr>(0)
            .ok_or(Error::sec(SecCode::UnexpectedMessage))?;
        addr.upgrade()
            .ok_or(Error::sec(SecCode::CannotConnectToNode))
    }

    // -- named brokers -----------------------------------------------------

    /// Get or lazily create the broker registered under `name`.
    ///
    /// `init` runs once, on creation, and returns the broker's
    /// behavior.
    pub fn named_broker(
        &self,
        name: &str,
        init: impl FnOnce(&mut Context<'_>) -> Behavior,
    ) -> ActorRef {
        if let Some(existing) = self.system.registry().get_named(name) {
            return existing;
        }
        let broker = self.system.spawn(init);
        match self.system.registry().register_name(name, &broker) {
            Ok(()) => broker,
            Err(_) => {
                // Lost the race; use the winner.
                broker.kill(ExitReason::UserShutdown);
                self.system
                    .registry()
                    .get_named(name)
                    .expect("registered by the race winner")
            }
        }
    }

    // -- teardown ----------------------------------------------------------

    /// Stop the network layer: unpublish everything, close endpoints,
    /// kill proxies, terminate the system actors. Idempotent.
    pub fn stop(&self) {
        {
            let mut stopped = self.stopped.lock();
            if *stopped {
                return;
            }
            *stopped = true;
        }
        if self.system.test_probe().is_some() {
            // Nothing drives the broker while we block; leave the stop
            // command in its mailbox for the test driver.
            self.broker.send((StopCmd {},));
        } else {
            let scoped = self.system.scoped_actor();
            if let Err(err) = scoped.request(&self.broker, CALL_TIMEOUT, (StopCmd {},)) {
                tracing::debug!(%err, "BASP broker stop failed");
            }
        }
        self.config_serv.kill(ExitReason::UserShutdown);
        self.spawn_serv.kill(ExitReason::UserShutdown);
        self.system.registry().unregister_name("BASP");
        self.system.registry().unregister_name("ConfigServ");
        self.system.registry().unregister_name("SpawnServ");
    }

    /// Store this node's reachable endpoint in ConfigServ, so peers
    /// can upgrade indirect routes to direct connections.
    fn announce_endpoint(&self, port: u16) {
        let value = format!("{}:{}", self.mpx.local_host(), port);
        self.config_serv.send((
            Atom::new("put"),
            CONNECTIVITY_KEY.to_string(),
            value,
        ));
    }
}

impl Drop for Middleman {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Middleman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleman")
            .field("node", &self.system.node())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// System actors
// ---------------------------------------------------------------------------

/// ConfigServ: the key/value store consulted for connectivity hints.
fn spawn_config_serv(system: &ActorSystem) -> ActorRef {
    system.spawn(|_ctx| {
        let store: std::sync::Arc<Mutex<FxHashMap<String, String>>> =
            std::sync::Arc::new(Mutex::new(FxHashMap::default()));
        let put_store = store.clone();
        let get_store = store;
        Behavior::new()
            .on::<(Atom, String, String), _>(move |_ctx, msg| {
                let tag = *msg.get::<Atom>(0).expect("atom");
                if tag != Atom::new("put") {
                    return HandlerResult::Fail(Error::sec(SecCode::UnexpectedMessage));
                }
                let key = msg.get::<String>(1).expect("key").clone();
                let value = msg.get::<String>(2).expect("value").clone();
                put_store.lock().insert(key, value);
                HandlerResult::Continue
            })
            .on::<(Atom, String), _>(move |_ctx, msg| {
                let tag = *msg.get::<Atom>(0).expect("atom");
                if tag != Atom::new("get") {
                    return HandlerResult::Fail(Error::sec(SecCode::UnexpectedMessage));
                }
                let key = msg.get::<String>(1).expect("key").clone();
                let value = get_store.lock().get(&key).cloned().unwrap_or_default();
                HandlerResult::Reply((key, value).into_message())
            })
    })
}

/// SpawnServ: reserved; remote spawning is not part of this runtime,
/// so every request is answered with an error.
fn spawn_spawn_serv(system: &ActorSystem) -> ActorRef {
    system.spawn(|_ctx| {
        Behavior::new().on_any(|_ctx, _msg| {
            HandlerResult::Fail(Error::sec(SecCode::UnexpectedMessage))
        })
    })
}
