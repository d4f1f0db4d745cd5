//! Configuration handed to each component when it is constructed.
//!
//! Nothing in the crate reads process-wide settings; whoever builds a server
//! or a client decides every value here.

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use hashbrown::HashSet;
use tracing::warn;
use typed_builder::TypedBuilder;

use super::{identity::ConnectionIdentity, wire::StackFlags};

/// Factor applied to the probe timings of a connection whose reverse
/// callback port could not be verified.
pub const CONFIG_UPGRADE_FACTOR: u32 = 10;

/// Reconnect attempts are never spaced closer than this.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Timing of the probe cycle run against each monitored connection.
#[derive(Clone, Debug, TypedBuilder)]
pub struct HealthCheckerConfig {
    /// Name used in logs
    #[builder(default = "health-checker".into(), setter(into))]
    pub name: String,
    /// Quiet time before the first probe is sent
    #[builder(default = Duration::from_secs(5))]
    pub idle_time: Duration,
    /// Spacing between consecutive probes
    #[builder(default = Duration::from_secs(1))]
    pub probe_interval: Duration,
    /// Unanswered probes tolerated before the peer is suspected dead
    #[builder(default = 3)]
    pub probe_count: u32,
    /// Verify suspected peers through their reverse callback port
    #[builder(default = true)]
    pub socket_connect: bool,
    #[builder(default = Duration::from_secs(5))]
    pub socket_connect_timeout: Duration,
    /// Successful callback verifications granted before a silent peer is
    /// declared dead anyway
    #[builder(default = 1)]
    pub socket_connect_max_count: u32,
    /// Compare the peer's clock carried by probes against ours
    #[builder(default = false)]
    pub check_time: bool,
    #[builder(default = Duration::from_secs(5 * 60))]
    pub time_diff_threshold: Duration,
    /// Resolution of the shared monitor loop
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HealthCheckerConfig {
    /// Time after which a connection without any traffic is declared dead
    /// when no callback verification is possible.
    pub fn max_silence(&self) -> Duration {
        self.idle_time + self.probe_interval * self.probe_count
    }
}

/// The timings a single connection is currently monitored with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeTimings {
    pub idle_time: Duration,
    pub probe_interval: Duration,
    pub probe_count: u32,
}

impl ProbeTimings {
    pub fn upgraded(self) -> Self {
        Self {
            idle_time: self.idle_time * CONFIG_UPGRADE_FACTOR,
            probe_interval: self.probe_interval * CONFIG_UPGRADE_FACTOR,
            probe_count: self.probe_count * CONFIG_UPGRADE_FACTOR,
        }
    }
}

impl From<&HealthCheckerConfig> for ProbeTimings {
    fn from(config: &HealthCheckerConfig) -> Self {
        Self {
            idle_time: config.idle_time,
            probe_interval: config.probe_interval,
            probe_count: config.probe_count,
        }
    }
}

/// Per-transport plumbing limits.
#[derive(Clone, Debug, TypedBuilder)]
pub struct TransportConfig {
    /// Application messages buffered while the transport has no socket
    #[builder(default = 1000)]
    pub max_pending_messages: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Client side connection and reconnection settings.
#[derive(Clone, Debug, TypedBuilder)]
pub struct EstablisherConfig {
    /// Bound on a single socket level connect
    #[builder(default = Duration::from_secs(10))]
    pub connect_timeout: Duration,
    /// Bound on waiting for the SYN_ACK
    #[builder(default = Duration::from_secs(10))]
    pub handshake_timeout: Duration,
    /// Reconnect rounds over the address list, `None` for unlimited
    #[builder(default = Some(10), setter(into))]
    pub max_reconnect_tries: Option<u32>,
    #[builder(default = true)]
    pub reconnect_enabled: bool,
    /// Pause after a failed attempt
    #[builder(default = Duration::from_secs(1))]
    pub retry_interval: Duration,
    /// Deadline for restoring a connection the health checker killed
    #[builder(default = Duration::from_secs(30))]
    pub restore_timeout: Duration,
    #[builder(default)]
    pub stack_flags: StackFlags,
    /// Reverse health check port advertised to the server
    #[builder(default, setter(strip_option))]
    pub callback_port: Option<u16>,
    #[builder(default = super::identity::local_process_id(), setter(into))]
    pub process_id: String,
    #[builder(default, setter(strip_option))]
    pub credentials: Option<super::identity::Credentials>,
    #[builder(default)]
    pub transport: TransportConfig,
}

impl Default for EstablisherConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EstablisherConfig {
    /// The retry interval, forced up to the minimum.
    pub fn effective_retry_interval(&self) -> Duration {
        if self.retry_interval < MIN_RETRY_INTERVAL {
            warn!(
                "forcing reconnect wait interval to {:?} (configured value was {:?})",
                MIN_RETRY_INTERVAL, self.retry_interval
            );
            MIN_RETRY_INTERVAL
        } else {
            self.retry_interval
        }
    }
}

/// Server side settings.
#[derive(Clone, Debug, TypedBuilder)]
pub struct ServerConfig {
    #[builder(default = SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))]
    pub bind_addr: SocketAddr,
    /// Distinct client processes admitted at once
    #[builder(default = usize::MAX)]
    pub max_connections: usize,
    /// Let a reconnect replace a socket the server still considers alive
    #[builder(default = false)]
    pub allow_connection_replace: bool,
    #[builder(default = Duration::from_secs(10))]
    pub handshake_timeout: Duration,
    #[builder(default)]
    pub stack_flags: StackFlags,
    /// Probe clients; `None` only answers their probes
    #[builder(default, setter(strip_option))]
    pub health: Option<HealthCheckerConfig>,
    /// Identities whose stacks are rebuilt at startup so their clients can
    /// reconnect to this server epoch
    #[builder(default)]
    pub rebuild: HashSet<ConnectionIdentity>,
    /// How long a disconnected stack waits for its client before it is
    /// closed; `None` keeps it until the server shuts down
    #[builder(default = Some(Duration::from_secs(5)), setter(into))]
    pub reconnect_window: Option<Duration>,
    /// Handshaken transports not yet taken by `accept`. New connections are
    /// refused while it is full.
    #[builder(default = 1024)]
    pub accept_backlog: usize,
    #[builder(default)]
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
