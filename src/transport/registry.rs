//! Server side table of logical connections, keyed by identity.
//!
//! A socket completing a handshake either creates a new stack (fresh
//! identity) or is reattached to the stack its identity already names. The
//! registry also keeps the admission ledger in step with the stacks: every
//! admitted identity is released from the policy exactly once, whichever of
//! disconnect, close or removal happens first.
//!
//! A stack left without a socket for longer than the reconnect window is
//! closed, and so is a rebuild placeholder nobody claims in that time.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use hashbrown::HashMap;
use tokio::{
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    time::sleep,
};
use tracing::{debug, info};

use super::{
    config::{ServerConfig, TransportConfig},
    error::{Error, Result},
    handshake::SynRequest,
    identity::{ConnectionIdentity, IdentityFactory},
    link::{Side, Transport},
    listener::{ListenerSet, TransportListener},
    policy::ConnectionPolicy,
    wire::{FrameReader, FrameWriter},
};

struct StackEntry {
    /// None for a rebuild placeholder no client has reattached to yet
    transport: Option<Transport>,
    /// The identity currently holds a slot in the admission ledger
    admitted: bool,
    /// A socket is between SYN and ACK for this identity
    attaching: bool,
}

/// A stack claimed for a socket that has not completed its handshake yet.
/// Hand it back through [`ServerStackRegistry::complete_attach`] or
/// [`ServerStackRegistry::rollback`].
pub struct Reservation {
    pub identity: ConnectionIdentity,
    pub transport: Transport,
    fresh: bool,
    newly_admitted: bool,
}

impl Reservation {
    /// True if the identity was minted for this socket.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }
}

pub struct ServerStackRegistry {
    factory: IdentityFactory,
    policy: Arc<dyn ConnectionPolicy>,
    config: TransportConfig,
    allow_connection_replace: bool,
    reconnect_window: Option<Duration>,
    stacks: Mutex<HashMap<ConnectionIdentity, StackEntry>>,
    stack_listeners: ListenerSet,
    hook: Arc<dyn TransportListener>,
    me: Weak<Self>,
}

impl ServerStackRegistry {
    pub fn new(
        factory: IdentityFactory,
        policy: Arc<dyn ConnectionPolicy>,
        config: &ServerConfig,
    ) -> Arc<Self> {
        let rebuild = &config.rebuild;
        let mut stacks = HashMap::with_capacity(rebuild.len());
        for identity in rebuild {
            if factory.owns(identity) {
                factory.reserve(identity.channel());
            }
            stacks.insert(
                identity.clone(),
                StackEntry {
                    transport: None,
                    admitted: false,
                    attaching: false,
                },
            );
        }
        if !rebuild.is_empty() {
            info!("rebuilding {} connection stacks", rebuild.len());
        }
        let registry = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            factory,
            policy,
            config: config.transport.clone(),
            allow_connection_replace: config.allow_connection_replace,
            reconnect_window: config.reconnect_window,
            stacks: Mutex::new(stacks),
            stack_listeners: ListenerSet::new(),
            hook: Arc::new(RegistryHook(weak.clone())),
            me: weak.clone(),
        });
        for identity in rebuild {
            registry.schedule_expiry(identity.clone(), 0);
        }
        registry
    }

    pub fn factory(&self) -> &IdentityFactory {
        &self.factory
    }

    pub fn policy(&self) -> &Arc<dyn ConnectionPolicy> {
        &self.policy
    }

    /// Listener added to every transport the registry creates.
    pub fn add_stack_listener(&self, listener: Arc<dyn TransportListener>) {
        self.stack_listeners.add(listener);
    }

    /// Claims the stack a SYN asks for. A SYN without identity gets a freshly
    /// minted one, provided the policy admits its process.
    pub fn attach_new_connection(&self, request: &SynRequest) -> Result<Reservation> {
        match &request.identity {
            None => self.reserve_fresh(request),
            Some(identity) => self.reserve_existing(identity),
        }
    }

    fn reserve_fresh(&self, request: &SynRequest) -> Result<Reservation> {
        let identity = self
            .factory
            .mint(&request.process_id, request.credentials.clone())?;
        if !self.policy.connect_client(&identity) {
            Err(Error::MaxConnectionsExceeded {
                max: self.policy.max_connections(),
            })?
        }
        let transport = self.new_transport(&identity)?;
        self.stacks().insert(
            identity.clone(),
            StackEntry {
                transport: Some(transport.clone()),
                admitted: true,
                attaching: true,
            },
        );
        debug!("new stack for {}", identity);
        Ok(Reservation {
            identity,
            transport,
            fresh: true,
            newly_admitted: true,
        })
    }

    fn reserve_existing(&self, identity: &ConnectionIdentity) -> Result<Reservation> {
        let mut stacks = self.stacks();
        let Some(entry) = stacks.get_mut(identity) else {
            let reason = if self.factory.owns(identity) {
                format!("no stack for {identity}")
            } else {
                format!("{identity} was issued by another server epoch")
            };
            return Err(Error::ReconnectionRejected(reason));
        };
        if entry.attaching {
            Err(Error::ConnectionBusy(format!(
                "another socket is attaching to {identity}"
            )))?
        }
        let stale = match &entry.transport {
            Some(transport) if transport.is_closed() => {
                Err(Error::ReconnectionRejected(format!(
                    "{identity} is closed"
                )))?
            }
            Some(transport)
                if transport.is_connected() && !self.allow_connection_replace =>
            {
                Some(transport.clone())
            }
            _ => None,
        };
        if let Some(stale) = stale {
            drop(stacks);
            // a client only reconnects once it gave up on its old socket
            stale.force_disconnect();
            return Err(Error::ConnectionBusy(format!(
                "dropped the previous socket of {identity}, retry"
            )));
        }
        let transport = match &entry.transport {
            Some(transport) => transport.clone(),
            None => {
                let transport = self.new_transport(identity)?;
                entry.transport = Some(transport.clone());
                debug!("rebuilt stack for {}", identity);
                transport
            }
        };
        let newly_admitted = !entry.admitted;
        if newly_admitted {
            if !self.policy.connect_client(identity) {
                Err(Error::MaxConnectionsExceeded {
                    max: self.policy.max_connections(),
                })?
            }
            entry.admitted = true;
        }
        entry.attaching = true;
        Ok(Reservation {
            identity: identity.clone(),
            transport,
            fresh: false,
            newly_admitted,
        })
    }

    /// Binds the handshaken socket to the reserved stack.
    pub async fn complete_attach(
        &self,
        reservation: Reservation,
        reader: FrameReader<OwnedReadHalf>,
        writer: FrameWriter<OwnedWriteHalf>,
        remote_addr: SocketAddr,
        peer_callback_port: Option<u16>,
    ) -> Result<Transport> {
        let attached = reservation
            .transport
            .attach(reader, writer, remote_addr, peer_callback_port)
            .await;
        if let Some(entry) = self.stacks().get_mut(&reservation.identity) {
            entry.attaching = false;
        }
        attached?;
        Ok(reservation.transport)
    }

    /// Undoes a reservation whose handshake failed. No listener is told.
    pub fn rollback(&self, reservation: Reservation) {
        let mut stacks = self.stacks();
        let identity = &reservation.identity;
        if reservation.fresh {
            stacks.remove(identity);
            self.policy.client_disconnected(identity);
            debug!("rolled back new stack for {}", identity);
            return;
        }
        if let Some(entry) = stacks.get_mut(identity) {
            entry.attaching = false;
            if reservation.newly_admitted && entry.admitted {
                entry.admitted = false;
                self.policy.client_disconnected(identity);
            }
        }
        drop(stacks);
        self.schedule_expiry(identity.clone(), reservation.transport.epoch());
    }

    /// Drops the stack of `identity`, releasing its admission if held.
    pub fn remove_network_stack(
        &self,
        identity: &ConnectionIdentity,
    ) -> Option<Transport> {
        let entry = self.stacks().remove(identity)?;
        if entry.admitted {
            self.policy.client_disconnected(identity);
        }
        debug!("removed stack for {}", identity);
        entry.transport
    }

    pub fn get(&self, identity: &ConnectionIdentity) -> Option<Transport> {
        self.stacks().get(identity)?.transport.clone()
    }

    pub fn contains(&self, identity: &ConnectionIdentity) -> bool {
        self.stacks().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.stacks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn transports(&self) -> Vec<Transport> {
        self.stacks()
            .values()
            .filter_map(|entry| entry.transport.clone())
            .collect()
    }

    fn new_transport(&self, identity: &ConnectionIdentity) -> Result<Transport> {
        let transport = Transport::new(Side::Server, self.config.clone());
        transport.set_identity(identity.clone())?;
        transport.add_listener(self.hook.clone());
        for listener in self.stack_listeners.snapshot() {
            transport.add_listener(listener);
        }
        Ok(transport)
    }

    fn release(&self, identity: &ConnectionIdentity) {
        let mut stacks = self.stacks();
        if let Some(entry) = stacks.get_mut(identity) {
            if entry.admitted {
                entry.admitted = false;
                self.policy.client_disconnected(identity);
            }
        }
    }

    /// Closes the stack of `identity` unless a socket of a newer epoch is
    /// attached to it within the reconnect window.
    fn schedule_expiry(&self, identity: ConnectionIdentity, epoch: u64) {
        let Some(window) = self.reconnect_window else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = self.me.clone();
        runtime.spawn(async move {
            sleep(window).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire(&identity, epoch);
            }
        });
    }

    fn expire(&self, identity: &ConnectionIdentity, epoch: u64) {
        let expired = {
            let mut stacks = self.stacks();
            let Some(entry) = stacks.get(identity) else {
                return;
            };
            if entry.attaching {
                return;
            }
            let Some(transport) = entry.transport.clone() else {
                stacks.remove(identity);
                info!("rebuilt stack {} was never claimed, dropping it", identity);
                return;
            };
            if transport.is_connected() || transport.epoch() != epoch {
                return;
            }
            transport
        };
        info!("{} did not reconnect in time, closing its stack", identity);
        expired.close();
    }

    fn stacks(&self) -> MutexGuard<'_, HashMap<ConnectionIdentity, StackEntry>> {
        self.stacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Listens on every server transport on behalf of the registry without
/// keeping it alive.
struct RegistryHook(Weak<ServerStackRegistry>);

impl TransportListener for RegistryHook {
    fn notify_transport_disconnected(&self, transport: &Transport, _forced: bool) {
        let (Some(registry), Some(identity)) = (self.0.upgrade(), transport.identity())
        else {
            return;
        };
        registry.release(identity);
        registry.schedule_expiry(identity.clone(), transport.epoch());
    }

    fn notify_transport_closed(&self, transport: &Transport) {
        let (Some(registry), Some(identity)) = (self.0.upgrade(), transport.identity())
        else {
            return;
        };
        registry.remove_network_stack(identity);
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashSet;
    use tokio::time::timeout;

    use super::*;
    use crate::transport::{
        identity::ServerOriginId, link::tests::socket_pair,
        policy::ConnectionPolicyImpl, wire::StackFlags,
    };

    fn request(identity: Option<ConnectionIdentity>, process: &str) -> SynRequest {
        SynRequest {
            identity,
            process_id: process.into(),
            credentials: None,
            stack_flags: StackFlags::default(),
            callback_port: None,
        }
    }

    fn registry(
        max: usize,
        rebuild: &HashSet<ConnectionIdentity>,
    ) -> (Arc<ServerStackRegistry>, Arc<ConnectionPolicyImpl>) {
        with_config(
            ServerConfig::builder()
                .max_connections(max)
                .rebuild(rebuild.clone())
                .build(),
        )
    }

    fn with_config(
        config: ServerConfig,
    ) -> (Arc<ServerStackRegistry>, Arc<ConnectionPolicyImpl>) {
        let policy = Arc::new(ConnectionPolicyImpl::new(config.max_connections));
        let registry = ServerStackRegistry::new(
            IdentityFactory::new(ServerOriginId::generate()),
            policy.clone(),
            &config,
        );
        (registry, policy)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    type ClientHalf = (
        FrameReader<OwnedReadHalf>,
        FrameWriter<OwnedWriteHalf>,
        SocketAddr,
    );

    /// Attaches a fresh socket; the client half must outlive the assertions.
    async fn attach(
        registry: &ServerStackRegistry,
        reservation: Reservation,
    ) -> (Transport, ClientHalf) {
        let (client, (sr, sw, peer)) = socket_pair().await;
        let transport = registry
            .complete_attach(reservation, sr, sw, peer, None)
            .await
            .unwrap();
        (transport, client)
    }

    #[tokio::test]
    async fn rebuild_set_gates_reconnects() {
        let previous_epoch = ServerOriginId::generate();
        let rebuilt =
            ConnectionIdentity::new(7, previous_epoch.clone(), "jvm1").unwrap();
        let unknown = ConnectionIdentity::new(8, previous_epoch, "jvm1").unwrap();
        let (registry, policy) = registry(4, &HashSet::from([rebuilt.clone()]));
        assert!(registry.contains(&rebuilt));
        assert!(registry.get(&rebuilt).is_none());

        assert!(matches!(
            registry.attach_new_connection(&request(Some(unknown), "jvm1")),
            Err(Error::ReconnectionRejected(_))
        ));

        let reservation = registry
            .attach_new_connection(&request(Some(rebuilt.clone()), "jvm1"))
            .unwrap();
        assert!(!reservation.is_fresh());
        let (transport, _client) = attach(&registry, reservation).await;
        assert!(transport.is_connected());
        assert_eq!(transport.identity(), Some(&rebuilt));
        assert_eq!(policy.connected_clients(), 1);

        // still connected and replacement is off: the old socket is dropped
        // and the client told to retry
        assert!(matches!(
            registry.attach_new_connection(&request(Some(rebuilt.clone()), "jvm1")),
            Err(Error::ConnectionBusy(_))
        ));
        assert!(!transport.is_connected());
        assert_eq!(policy.connected_clients(), 0);

        let reservation = registry
            .attach_new_connection(&request(Some(rebuilt), "jvm1"))
            .unwrap();
        let (again, _client2) = attach(&registry, reservation).await;
        assert_eq!(again, transport);
        assert!(again.is_connected());
        assert_eq!(policy.connected_clients(), 1);
    }

    #[tokio::test]
    async fn fresh_reservations_roll_back() {
        let (registry, policy) = registry(1, &HashSet::new());
        let reservation = registry.attach_new_connection(&request(None, "jvm1")).unwrap();
        assert!(reservation.is_fresh());
        assert_eq!(policy.connected_processes(), 1);

        assert!(matches!(
            registry.attach_new_connection(&request(None, "jvm2")),
            Err(Error::MaxConnectionsExceeded { max: 1 })
        ));

        let identity = reservation.identity.clone();
        registry.rollback(reservation);
        assert!(!registry.contains(&identity));
        assert_eq!(policy.connected_processes(), 0);
        assert!(registry.attach_new_connection(&request(None, "jvm2")).is_ok());
    }

    #[tokio::test]
    async fn disconnect_releases_once_and_reattach_readmits() {
        let (registry, policy) = registry(4, &HashSet::new());
        let reservation = registry.attach_new_connection(&request(None, "jvm1")).unwrap();
        let identity = reservation.identity.clone();
        let (transport, _client) = attach(&registry, reservation).await;
        assert_eq!(policy.connected_clients(), 1);

        assert!(transport.force_disconnect());
        assert!(!transport.force_disconnect());
        assert_eq!(policy.connected_clients(), 0);

        let reservation = registry
            .attach_new_connection(&request(Some(identity.clone()), "jvm1"))
            .unwrap();
        let (again, _client2) = attach(&registry, reservation).await;
        assert_eq!(again, transport);
        assert_eq!(policy.connected_clients(), 1);

        again.close();
        assert!(!registry.contains(&identity));
        assert_eq!(policy.connected_clients(), 0);
        assert!(registry.remove_network_stack(&identity).is_none());
    }

    #[tokio::test]
    async fn stacks_expire_outside_the_reconnect_window() {
        let (registry, policy) = with_config(
            ServerConfig::builder()
                .reconnect_window(Duration::from_millis(50))
                .build(),
        );
        let reservation = registry.attach_new_connection(&request(None, "jvm1")).unwrap();
        let identity = reservation.identity.clone();
        let (transport, _client) = attach(&registry, reservation).await;

        assert!(transport.force_disconnect());
        eventually(|| !registry.contains(&identity)).await;
        assert!(transport.is_closed());
        assert_eq!(policy.connected_clients(), 0);
        assert!(matches!(
            registry.attach_new_connection(&request(Some(identity), "jvm1")),
            Err(Error::ReconnectionRejected(_))
        ));
    }

    #[tokio::test]
    async fn reattaching_in_time_cancels_the_expiry() {
        let (registry, _policy) = with_config(
            ServerConfig::builder()
                .reconnect_window(Duration::from_millis(100))
                .build(),
        );
        let reservation = registry.attach_new_connection(&request(None, "jvm1")).unwrap();
        let identity = reservation.identity.clone();
        let (transport, _client) = attach(&registry, reservation).await;

        assert!(transport.force_disconnect());
        let reservation = registry
            .attach_new_connection(&request(Some(identity.clone()), "jvm1"))
            .unwrap();
        let (_, _client2) = attach(&registry, reservation).await;

        sleep(Duration::from_millis(300)).await;
        assert!(registry.contains(&identity));
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn unclaimed_rebuild_entries_expire() {
        let rebuilt =
            ConnectionIdentity::new(3, ServerOriginId::generate(), "jvm1").unwrap();
        let (registry, _policy) = with_config(
            ServerConfig::builder()
                .rebuild(HashSet::from([rebuilt.clone()]))
                .reconnect_window(Duration::from_millis(50))
                .build(),
        );
        assert!(registry.contains(&rebuilt));
        eventually(|| registry.is_empty()).await;
    }
}
