use std::{net::SocketAddr, sync::Arc};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{
    config::ServerConfig,
    error::{Error, Result},
    handshake::ServerHandshake,
    health::HealthChecker,
    identity::{IdentityFactory, ServerOriginId},
    link::Transport,
    policy::{ConnectionPolicy, ConnectionPolicyImpl},
    registry::ServerStackRegistry,
    wire::{FrameReader, FrameWriter, HandshakeErrorKind},
};

struct Shared {
    config: ServerConfig,
    registry: Arc<ServerStackRegistry>,
    accepted_tx: mpsc::Sender<Transport>,
}

/// Accepts sockets, runs the server half of the handshake on each and binds
/// them to the logical connections they belong to.
pub struct TransportServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    health: Option<HealthChecker>,
    accepted_rx: tokio::sync::Mutex<mpsc::Receiver<Transport>>,
    stop: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
}

impl TransportServer {
    /// Binds with the default admission policy for
    /// `config.max_connections` client processes.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let policy = Arc::new(ConnectionPolicyImpl::new(config.max_connections));
        Self::bind_with_policy(config, policy).await
    }

    pub async fn bind_with_policy(
        config: ServerConfig,
        policy: Arc<dyn ConnectionPolicy>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let origin = ServerOriginId::generate();
        info!("listening on {} as server epoch {}", local_addr, origin);

        let registry =
            ServerStackRegistry::new(IdentityFactory::new(origin), policy, &config);
        let health = config.health.clone().map(HealthChecker::start);
        if let Some(checker) = &health {
            registry.add_stack_listener(Arc::new(checker.clone()));
        }

        let (accepted_tx, accepted_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (stop, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            registry,
            accepted_tx,
        });
        let acceptor = tokio::spawn(
            Self::start_acceptor(listener, shared.clone(), stop_rx)
                .instrument(debug_span!("acceptor", %local_addr)),
        );
        Ok(Self {
            local_addr,
            shared,
            health,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            stop,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn origin(&self) -> &ServerOriginId {
        self.shared.registry.factory().origin()
    }

    pub fn registry(&self) -> &Arc<ServerStackRegistry> {
        &self.shared.registry
    }

    pub fn policy(&self) -> &Arc<dyn ConnectionPolicy> {
        self.shared.registry.policy()
    }

    pub fn health(&self) -> Option<&HealthChecker> {
        self.health.as_ref()
    }

    /// Waits for the next brand-new logical connection. Reattached sockets
    /// are not reported here, they continue their existing transport.
    pub async fn accept(&self) -> Option<Transport> {
        self.accepted_rx.lock().await.recv().await
    }

    /// Stops accepting and closes every transport.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        self.acceptor.abort();
        if let Some(checker) = &self.health {
            checker.stop();
        }
        for transport in self.shared.registry.transports() {
            transport.close();
        }
        info!("server on {} shut down", self.local_addr);
    }

    /// Accepts incoming sockets and spawns a task to handshake each.
    /// This will run until the server is shut down, so it should be spawned
    /// in a dedicated task.
    async fn start_acceptor(
        listener: TcpListener,
        shared: Arc<Shared>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let (stream, peer) = select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                },
            };
            let shared = shared.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = Self::serve_socket(stream, peer, &shared).await {
                        debug!("handshake failed: {}", e);
                    }
                }
                .instrument(debug_span!("handshake", %peer)),
            );
        }
        debug!("acceptor stopped");
    }

    async fn serve_socket(
        stream: TcpStream,
        peer: SocketAddr,
        shared: &Shared,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let config = &shared.config;
        let registry = &shared.registry;
        let mut handshake = ServerHandshake::new(
            FrameReader::new(reader),
            FrameWriter::new(writer),
            config.handshake_timeout,
        );

        let request = handshake.receive_syn().await?;
        if request.stack_flags != config.stack_flags {
            handshake
                .refuse(
                    HandshakeErrorKind::StackMismatch,
                    config.stack_flags.layer_names(),
                )
                .await?;
            Err(Error::StackMismatch(format!(
                "client stacks {}",
                request.stack_flags.layer_names()
            )))?
        }

        let reservation = match registry.attach_new_connection(&request) {
            Ok(reservation) => reservation,
            Err(Error::MaxConnectionsExceeded { max }) => {
                handshake.refuse_max_connections(max).await?;
                Err(Error::MaxConnectionsExceeded { max })?
            }
            Err(Error::ReconnectionRejected(reason)) => {
                handshake
                    .refuse(HandshakeErrorKind::ReconnectionRejected, reason.clone())
                    .await?;
                Err(Error::ReconnectionRejected(reason))?
            }
            Err(Error::ConnectionBusy(reason)) => {
                handshake
                    .refuse(HandshakeErrorKind::Busy, reason.clone())
                    .await?;
                Err(Error::ConnectionBusy(reason))?
            }
            Err(e) => {
                handshake
                    .refuse(HandshakeErrorKind::Handshake, e.to_string())
                    .await?;
                Err(e)?
            }
        };

        // a new connection needs a slot in the accept queue before it is
        // acknowledged
        let slot = if reservation.is_fresh() {
            match shared.accepted_tx.try_reserve() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    registry.rollback(reservation);
                    let reason = String::from("accept backlog is full");
                    handshake
                        .refuse(HandshakeErrorKind::Busy, reason.clone())
                        .await?;
                    return Err(Error::ConnectionBusy(reason));
                }
            }
        } else {
            None
        };

        let max_connections = registry.policy().max_connections();
        if let Err(e) = handshake
            .accept(&reservation.identity, max_connections, None)
            .await
        {
            registry.rollback(reservation);
            return Err(e);
        }

        let identity = reservation.identity.clone();
        let (reader, writer) = handshake.into_parts();
        let transport = registry
            .complete_attach(reservation, reader, writer, peer, request.callback_port)
            .await?;
        match slot {
            Some(permit) => {
                info!("new logical connection {}", identity);
                permit.send(transport);
            }
            None => debug!("reattached {}", identity),
        }
        Ok(())
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        self.acceptor.abort();
    }
}
