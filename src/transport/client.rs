use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::{net::TcpStream, time::timeout};
use tracing::debug;

use super::{
    config::EstablisherConfig,
    error::{Error, Result},
    establisher::ClientConnectionEstablisher,
    health::HealthChecker,
    identity::ConnectionIdentity,
    link::{Side, Transport, TransportStatus},
    listener::TransportListener,
};

/// Source of raw sockets for the establisher.
pub trait Connector: Send + Sync {
    /// Opens a socket to `addr`, giving up after `limit`.
    fn connect(&self, addr: SocketAddr, limit: Duration) -> BoxFuture<'static, Result<TcpStream>>;
}

/// Plain TCP connects.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, addr: SocketAddr, limit: Duration) -> BoxFuture<'static, Result<TcpStream>> {
        Box::pin(async move {
            match timeout(limit, TcpStream::connect(addr)).await {
                Ok(stream) => Ok(stream?),
                Err(_) => Err(Error::ConnectTimeout(addr)),
            }
        })
    }
}

/// Application handle on a client side logical connection.
///
/// Sends issued while the connection is being repaired are queued and
/// delivered once the establisher has reattached the transport.
pub struct ClientTransport {
    transport: Transport,
    establisher: Arc<ClientConnectionEstablisher>,
    opened: AtomicBool,
}

impl ClientTransport {
    pub fn new(addresses: Vec<SocketAddr>, config: EstablisherConfig) -> Self {
        Self::with_connector(addresses, config, Arc::new(TcpConnector))
    }

    pub fn with_connector(
        addresses: Vec<SocketAddr>,
        config: EstablisherConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let transport = Transport::new(Side::Client, config.transport.clone());
        let establisher = ClientConnectionEstablisher::new(addresses, config, connector);
        transport.add_listener(establisher.clone());
        Self {
            transport,
            establisher,
            opened: AtomicBool::new(false),
        }
    }

    /// Connects for the first time. Opening twice is a caller bug.
    pub async fn open(&self) -> Result<()> {
        if self.opened.swap(true, Ordering::SeqCst) {
            Err(Error::ContractViolation("transport is already open"))?
        }
        let opened = self.establisher.open(&self.transport).await;
        if opened.is_err() {
            self.opened.store(false, Ordering::SeqCst);
        }
        opened
    }

    pub async fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.transport.send(payload).await
    }

    pub async fn recv(&self) -> Result<Vec<u8>> {
        self.transport.recv().await
    }

    /// Stops reconnecting and closes the transport for good.
    pub fn close(&self) {
        self.establisher.quit_reconnect_attempts();
        if self.transport.close() {
            debug!("client transport {} closed", self.transport.id());
        }
    }

    /// Drops the current socket as if the peer had been declared dead; the
    /// establisher then restores the connection.
    pub fn force_reconnect(&self) -> bool {
        self.transport.force_disconnect()
    }

    /// Lets `checker` probe the server over this connection.
    pub fn monitor_with(&self, checker: &HealthChecker) {
        self.transport.add_listener(Arc::new(checker.clone()));
        checker.monitor(&self.transport);
    }

    pub fn add_listener(&self, listener: Arc<dyn TransportListener>) {
        self.transport.add_listener(listener);
    }

    pub fn identity(&self) -> Option<&ConnectionIdentity> {
        self.transport.identity()
    }

    pub fn status(&self) -> TransportStatus {
        self.transport.status()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn establisher(&self) -> &Arc<ClientConnectionEstablisher> {
        &self.establisher
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        self.close();
    }
}
