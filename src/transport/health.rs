//! Detection of silently dead peers.
//!
//! Every monitored transport runs through a small cycle:
//!
//! ```text
//! IDLE --idle_time without traffic--> PROBING --probe_count unanswered-->
//!   SOCKET-VERIFY --callback port unreachable--> DEAD (forced disconnect)
//! ```
//!
//! Any frame received from the peer sends the cycle back to IDLE. A
//! successful callback verification buys one more probe cycle, up to
//! `socket_connect_max_count` times, so a peer stalled by a long pause is not
//! mistaken for a dead one while its process is still reachable.
//!
//! A single monitor task serves every transport of a checker. It only makes
//! decisions; probes and callback connects run on their own tasks.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use hashbrown::HashMap;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{oneshot, watch},
    task::JoinHandle,
    time::{interval, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::{
    config::{HealthCheckerConfig, ProbeTimings},
    link::{Activity, Transport},
    listener::TransportListener,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeStage {
    /// Verifying the advertised callback port once, before any probing
    Init,
    Idle,
    Probing,
    SocketVerify,
    Dead,
}

/// What the monitor must do for one transport after a tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthAction {
    None,
    /// Send the probe with this sequence number
    Probe(u64),
    /// Try a TCP connect to the peer's callback port
    Verify(u16),
    /// Declare the peer dead
    Kill,
}

/// Monitoring state of a single transport.
#[derive(Debug)]
pub struct HealthCheckerContext {
    stage: ProbeStage,
    timings: ProbeTimings,
    upgraded: bool,
    callback_port: Option<u16>,
    verify_in_flight: bool,
    verify_successes: u32,
    last_activity: Instant,
    replies_seen: u64,
    clock_samples_seen: u64,
    desync_count: u64,
    last_probe_sent: Option<Instant>,
    probes_in_cycle: u32,
    next_sequence: u64,
}

impl HealthCheckerContext {
    pub fn new(
        config: &HealthCheckerConfig,
        callback_port: Option<u16>,
        activity: &Activity,
    ) -> Self {
        let callback_port = callback_port.filter(|_| config.socket_connect);
        Self {
            stage: if callback_port.is_some() {
                ProbeStage::Init
            } else {
                ProbeStage::Idle
            },
            timings: ProbeTimings::from(config),
            upgraded: false,
            callback_port,
            verify_in_flight: false,
            verify_successes: 0,
            last_activity: activity.last_received,
            replies_seen: activity.probe_replies,
            clock_samples_seen: activity.clock_samples,
            desync_count: 0,
            last_probe_sent: None,
            probes_in_cycle: 0,
            next_sequence: 1,
        }
    }

    pub fn stage(&self) -> ProbeStage {
        self.stage
    }

    pub fn timings(&self) -> ProbeTimings {
        self.timings
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    pub fn callback_port(&self) -> Option<u16> {
        self.callback_port
    }

    /// Probe and reply timestamps that were too far from our clock.
    pub fn desync_count(&self) -> u64 {
        self.desync_count
    }

    pub fn verify_successes(&self) -> u32 {
        self.verify_successes
    }

    pub fn tick(
        &mut self,
        now: Instant,
        activity: &Activity,
        config: &HealthCheckerConfig,
    ) -> HealthAction {
        self.observe_clock(activity, config);

        let traffic = activity.last_received > self.last_activity
            || activity.probe_replies > self.replies_seen;
        if traffic {
            self.last_activity = if activity.probe_replies > self.replies_seen {
                now.max(activity.last_received)
            } else {
                self.last_activity.max(activity.last_received)
            };
            self.replies_seen = activity.probe_replies;
            if matches!(self.stage, ProbeStage::Probing | ProbeStage::SocketVerify)
            {
                trace!("peer is alive again");
                self.stage = ProbeStage::Idle;
                self.probes_in_cycle = 0;
                self.last_probe_sent = None;
            }
        }

        match self.stage {
            ProbeStage::Init => match self.callback_port {
                Some(port) if !self.verify_in_flight => {
                    self.verify_in_flight = true;
                    HealthAction::Verify(port)
                }
                Some(_) => HealthAction::None,
                None => {
                    self.stage = ProbeStage::Idle;
                    HealthAction::None
                }
            },
            ProbeStage::Idle => {
                if now.saturating_duration_since(self.last_activity)
                    >= self.timings.idle_time
                {
                    self.stage = ProbeStage::Probing;
                    self.probes_in_cycle = 0;
                    self.send_probe(now)
                } else {
                    HealthAction::None
                }
            }
            ProbeStage::Probing => match self.last_probe_sent {
                None => self.send_probe(now),
                Some(sent)
                    if now.saturating_duration_since(sent)
                        >= self.timings.probe_interval =>
                {
                    if self.probes_in_cycle < self.timings.probe_count {
                        self.send_probe(now)
                    } else {
                        self.probes_exhausted(config)
                    }
                }
                Some(_) => HealthAction::None,
            },
            ProbeStage::SocketVerify | ProbeStage::Dead => HealthAction::None,
        }
    }

    /// Feeds back the outcome of a callback verification.
    pub fn on_verify_result(&mut self, reachable: bool) -> HealthAction {
        self.verify_in_flight = false;
        match self.stage {
            ProbeStage::Init => {
                if !reachable {
                    self.upgrade();
                }
                self.stage = ProbeStage::Idle;
                HealthAction::None
            }
            ProbeStage::SocketVerify if reachable => {
                self.verify_successes += 1;
                debug!(
                    "callback port answered, granting probe cycle {}",
                    self.verify_successes + 1
                );
                self.stage = ProbeStage::Probing;
                self.probes_in_cycle = 0;
                self.last_probe_sent = None;
                HealthAction::None
            }
            ProbeStage::SocketVerify => {
                self.stage = ProbeStage::Dead;
                HealthAction::Kill
            }
            // traffic arrived while the verify was running
            _ => HealthAction::None,
        }
    }

    fn send_probe(&mut self, now: Instant) -> HealthAction {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.probes_in_cycle += 1;
        self.last_probe_sent = Some(now);
        HealthAction::Probe(sequence)
    }

    fn probes_exhausted(&mut self, config: &HealthCheckerConfig) -> HealthAction {
        match self.callback_port {
            Some(port) if self.verify_successes < config.socket_connect_max_count => {
                self.stage = ProbeStage::SocketVerify;
                self.verify_in_flight = true;
                HealthAction::Verify(port)
            }
            _ => {
                self.stage = ProbeStage::Dead;
                HealthAction::Kill
            }
        }
    }

    /// Widens the timings for the rest of the connection and stops relying on
    /// the callback port. Never undone.
    fn upgrade(&mut self) {
        if self.upgraded {
            return;
        }
        self.timings = self.timings.upgraded();
        self.upgraded = true;
        self.callback_port = None;
        warn!(
            "callback port unreachable, probing with upgraded timings {:?}",
            self.timings
        );
    }

    fn observe_clock(&mut self, activity: &Activity, config: &HealthCheckerConfig) {
        if activity.clock_samples <= self.clock_samples_seen {
            return;
        }
        self.clock_samples_seen = activity.clock_samples;
        if !config.check_time {
            return;
        }
        let Some(skew) = activity.clock_skew_micros else {
            return;
        };
        let threshold = config.time_diff_threshold.as_micros();
        if u128::from(skew.unsigned_abs()) > threshold {
            self.desync_count += 1;
            warn!(
                "peer clock differs from ours by {:?} (seen {} times)",
                Duration::from_micros(skew.unsigned_abs()),
                self.desync_count
            );
        }
    }
}

struct Monitored {
    transport: Transport,
    context: HealthCheckerContext,
    verify: Option<oneshot::Receiver<bool>>,
}

struct CheckerInner {
    config: HealthCheckerConfig,
    contexts: Mutex<HashMap<u64, Monitored>>,
    probes_sent: AtomicU64,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

enum Job {
    Probe(Transport, u64),
    Verify(SocketAddr, oneshot::Sender<bool>),
    Kill(Transport),
}

/// Shared liveness monitor. Register it as a listener on transports (or call
/// [`HealthChecker::monitor`]) and it follows them from connect to
/// disconnect.
///
/// Can be cloned to obtain another handle to the same checker.
#[derive(Clone)]
pub struct HealthChecker {
    inner: Arc<CheckerInner>,
}

impl HealthChecker {
    /// Creates the checker and spawns its monitor task.
    pub fn start(config: HealthCheckerConfig) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let checker = Self {
            inner: Arc::new(CheckerInner {
                config,
                contexts: Mutex::new(HashMap::new()),
                probes_sent: AtomicU64::new(0),
                stop,
                task: Mutex::new(None),
            }),
        };
        let span = debug_span!("health", name = %checker.inner.config.name);
        let task = tokio::spawn(checker.clone().run(stop_rx).instrument(span));
        *checker.task() = Some(task);
        checker
    }

    pub fn config(&self) -> &HealthCheckerConfig {
        &self.inner.config
    }

    /// Starts monitoring a connected transport, replacing any context left
    /// from a previous socket.
    pub fn monitor(&self, transport: &Transport) {
        if *self.inner.stop.borrow() || !transport.is_connected() {
            return;
        }
        let context = HealthCheckerContext::new(
            &self.inner.config,
            transport.peer_callback_port(),
            &transport.activity(),
        );
        trace!("monitoring transport {}", transport.id());
        self.contexts().insert(
            transport.id(),
            Monitored {
                transport: transport.clone(),
                context,
                verify: None,
            },
        );
    }

    pub fn unmonitor(&self, transport: &Transport) {
        if self.contexts().remove(&transport.id()).is_some() {
            trace!("stopped monitoring transport {}", transport.id());
        }
    }

    pub fn total_probes_sent(&self) -> u64 {
        self.inner.probes_sent.load(Ordering::Relaxed)
    }

    pub fn monitored_connections(&self) -> usize {
        self.contexts().len()
    }

    pub fn stage(&self, transport: &Transport) -> Option<ProbeStage> {
        Some(self.contexts().get(&transport.id())?.context.stage())
    }

    pub fn desync_count(&self, transport: &Transport) -> Option<u64> {
        Some(self.contexts().get(&transport.id())?.context.desync_count())
    }

    pub fn timings(&self, transport: &Transport) -> Option<ProbeTimings> {
        Some(self.contexts().get(&transport.id())?.context.timings())
    }

    /// Stops the monitor task and forgets every context.
    pub fn stop(&self) {
        self.inner.stop.send_replace(true);
        self.contexts().clear();
        debug!("health checker {} stopped", self.inner.config.name);
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        debug!("monitor started");
        let mut ticker = interval(self.inner.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = ticker.tick() => {}
                _ = stop.wait_for(|stopped| *stopped) => break,
            }
            for job in self.sweep(Instant::now()) {
                self.execute(job);
            }
        }
        debug!("monitor stopped");
    }

    /// Advances every context and collects the work to do once the context
    /// table is unlocked.
    fn sweep(&self, now: Instant) -> Vec<Job> {
        let config = &self.inner.config;
        let mut jobs = Vec::new();
        let mut dead = Vec::new();
        let mut contexts = self.contexts();
        for (id, monitored) in contexts.iter_mut() {
            let mut actions = Vec::with_capacity(2);
            if let Some(verify) = monitored.verify.as_mut() {
                match verify.try_recv() {
                    Ok(reachable) => {
                        monitored.verify = None;
                        actions.push(monitored.context.on_verify_result(reachable));
                    }
                    Err(oneshot::error::TryRecvError::Empty) => {}
                    Err(oneshot::error::TryRecvError::Closed) => {
                        monitored.verify = None;
                        actions.push(monitored.context.on_verify_result(false));
                    }
                }
            }
            let activity = monitored.transport.activity();
            actions.push(monitored.context.tick(now, &activity, config));

            for action in actions {
                match action {
                    HealthAction::None => {}
                    HealthAction::Probe(sequence) => {
                        jobs.push(Job::Probe(monitored.transport.clone(), sequence))
                    }
                    HealthAction::Verify(port) => {
                        let (tx, rx) = oneshot::channel();
                        monitored.verify = Some(rx);
                        match monitored.transport.remote_addr() {
                            Some(remote) => jobs.push(Job::Verify(
                                SocketAddr::new(remote.ip(), port),
                                tx,
                            )),
                            None => {
                                let _ = tx.send(false);
                            }
                        }
                    }
                    HealthAction::Kill => dead.push(*id),
                }
            }
        }
        for id in dead {
            if let Some(monitored) = contexts.remove(&id) {
                jobs.push(Job::Kill(monitored.transport));
            }
        }
        jobs
    }

    fn execute(&self, job: Job) {
        match job {
            Job::Probe(transport, sequence) => {
                self.inner.probes_sent.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    if let Err(e) = transport.send_probe(sequence).await {
                        trace!("probe {} not sent: {}", sequence, e);
                    }
                });
            }
            Job::Verify(addr, reply) => {
                let limit = self.inner.config.socket_connect_timeout;
                tokio::spawn(async move {
                    let reachable =
                        matches!(timeout(limit, TcpStream::connect(addr)).await, Ok(Ok(_)));
                    debug!("callback port {} reachable: {}", addr, reachable);
                    let _ = reply.send(reachable);
                });
            }
            Job::Kill(transport) => {
                info!(
                    "no sign of life from {} within the probe cycle, disconnecting",
                    transport
                        .identity()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| format!("transport {}", transport.id()))
                );
                transport.force_disconnect();
            }
        }
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<u64, Monitored>> {
        self.inner
            .contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TransportListener for HealthChecker {
    fn notify_transport_connected(&self, transport: &Transport) {
        self.monitor(transport);
    }

    fn notify_transport_disconnected(&self, transport: &Transport, _forced: bool) {
        self.unmonitor(transport);
    }

    fn notify_transport_closed(&self, transport: &Transport) {
        self.unmonitor(transport);
    }
}

/// The endpoint a client advertises as its callback port. It accepts
/// connections and drops them at once; being reachable is the whole answer.
pub struct CallbackListener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl CallbackListener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let task = tokio::spawn(
            async move {
                loop {
                    match listener.accept().await {
                        Ok((_, peer)) => trace!("callback check from {}", peer),
                        Err(e) => {
                            warn!("callback listener accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            .instrument(debug_span!("callback", %local_addr)),
        );
        debug!("callback listener bound to {}", local_addr);
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
