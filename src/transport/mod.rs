// Each logical connection is a `Transport`: a handle that outlives any single
// socket. Sockets come and go underneath it, each one tagged with an epoch so
// late events from a replaced socket are ignored. Listeners observe the
// transitions and drive the rest of the system; on the client the establisher
// reconnects on every disconnect, on the server the registry releases the
// admission slot and the health checker stops probing.

// The wire carries rkyv archives framed by a little endian length prefix. The
// handshake is three messages (SYN, SYN_ACK, ACK) and has to complete before a
// socket is attached to anything.

#[cfg(feature = "client")]
pub mod client;
pub mod config;
pub mod error;
#[cfg(feature = "client")]
pub mod establisher;
pub mod handshake;
pub mod health;
pub mod identity;
pub mod link;
pub mod listener;
#[cfg(feature = "server")]
pub mod policy;
#[cfg(feature = "server")]
pub mod registry;
#[cfg(feature = "server")]
pub mod server;
pub mod wire;

#[cfg(feature = "client")]
pub use client::{ClientTransport, Connector, TcpConnector};
pub use config::{
    EstablisherConfig, HealthCheckerConfig, ServerConfig, TransportConfig,
};
pub use error::{Error, Result};
#[cfg(feature = "client")]
pub use establisher::{ClientConnectionEstablisher, RestoreOutcome};
pub use health::{CallbackListener, HealthChecker, ProbeStage};
pub use identity::{ConnectionIdentity, Credentials, ServerOriginId};
pub use link::{Side, Transport, TransportStatus};
pub use listener::TransportListener;
#[cfg(feature = "server")]
pub use policy::{ConnectionPolicy, ConnectionPolicyImpl, NullConnectionPolicy};
#[cfg(feature = "server")]
pub use registry::ServerStackRegistry;
#[cfg(feature = "server")]
pub use server::TransportServer;
pub use wire::StackFlags;
