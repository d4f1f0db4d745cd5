//! Client side connection orchestration.
//!
//! The establisher turns a candidate address list into a connected transport
//! and keeps it connected: it listens on its transports and queues a
//! reconnect whenever one loses its socket. Queued requests are served one at
//! a time by a background worker, and every socket level attempt, whether
//! from `open`, the worker or a direct call, is serialised by one async
//! mutex.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use tokio::{
    select,
    sync::{watch, Notify},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::{
    client::Connector,
    config::EstablisherConfig,
    error::{Error, Result},
    handshake::{ClientHandshake, ClientHello},
    link::Transport,
    listener::TransportListener,
    wire::{FrameReader, FrameWriter},
};

/// Connect failures inside one reconnect loop are logged at most this often.
const LOSSY_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    Failed,
    Rejected,
}

pub type RestoreCallback = Box<dyn FnOnce(RestoreOutcome) + Send>;

enum ConnectionRequest {
    Reconnect(Transport),
    Restore {
        transport: Transport,
        addr: SocketAddr,
        timeout: Duration,
        callback: RestoreCallback,
    },
}

impl ConnectionRequest {
    fn transport(&self) -> &Transport {
        match self {
            ConnectionRequest::Reconnect(transport) => transport,
            ConnectionRequest::Restore { transport, .. } => transport,
        }
    }

    /// Completes a request that will never be served.
    fn discard(self, outcome: RestoreOutcome) {
        if let ConnectionRequest::Restore { callback, .. } = self {
            callback(outcome);
        }
    }
}

#[derive(Default)]
struct RequestQueue {
    items: Mutex<VecDeque<ConnectionRequest>>,
    wakeup: Notify,
}

impl RequestQueue {
    fn items(&self) -> MutexGuard<'_, VecDeque<ConnectionRequest>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, request: ConnectionRequest) {
        self.items().push_back(request);
        self.wakeup.notify_one();
    }

    fn pop(&self) -> Option<ConnectionRequest> {
        self.items().pop_front()
    }

    fn drain(&self) -> Vec<ConnectionRequest> {
        self.items().drain(..).collect()
    }

    fn drain_for(&self, transport: &Transport) -> Vec<ConnectionRequest> {
        let mut items = self.items();
        let (matching, rest): (VecDeque<_>, VecDeque<_>) = items
            .drain(..)
            .partition(|request| request.transport() == transport);
        *items = rest;
        matching.into_iter().collect()
    }
}

/// Handle on the background worker serving queued requests.
struct AsyncReconnect {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AsyncReconnect {
    fn spawn(establisher: Weak<ClientConnectionEstablisher>, queue: Arc<RequestQueue>) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(
            Self::run(establisher, queue, stop_rx).instrument(debug_span!("reconnect")),
        );
        Self { stop, task }
    }

    fn stop(&self) {
        self.stop.send_replace(true);
    }

    async fn run(
        establisher: Weak<ClientConnectionEstablisher>,
        queue: Arc<RequestQueue>,
        mut stop: watch::Receiver<bool>,
    ) {
        debug!("reconnect worker started");
        loop {
            if *stop.borrow() {
                break;
            }
            let Some(request) = queue.pop() else {
                select! {
                    _ = stop.wait_for(|stopped| *stopped) => break,
                    _ = queue.wakeup.notified() => {}
                }
                continue;
            };
            let Some(establisher) = establisher.upgrade() else {
                break;
            };
            if !establisher.allow_reconnects.load(Ordering::SeqCst) {
                trace!("reconnects disabled, dropping request");
                request.discard(RestoreOutcome::Failed);
                continue;
            }
            establisher.async_reconnecting.store(true, Ordering::SeqCst);
            select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => {
                    establisher.async_reconnecting.store(false, Ordering::SeqCst);
                    break;
                }
                _ = establisher.serve(request) => {}
            }
            establisher.async_reconnecting.store(false, Ordering::SeqCst);
        }
        debug!("reconnect worker stopped");
    }
}

pub struct ClientConnectionEstablisher {
    addresses: Vec<SocketAddr>,
    config: EstablisherConfig,
    connector: Arc<dyn Connector>,
    attempt: tokio::sync::Mutex<()>,
    async_reconnecting: AtomicBool,
    allow_reconnects: AtomicBool,
    queue: Arc<RequestQueue>,
    worker: Mutex<Option<AsyncReconnect>>,
    me: Weak<Self>,
}

impl ClientConnectionEstablisher {
    pub fn new(
        addresses: Vec<SocketAddr>,
        config: EstablisherConfig,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            addresses,
            config,
            connector,
            attempt: tokio::sync::Mutex::new(()),
            async_reconnecting: AtomicBool::new(false),
            allow_reconnects: AtomicBool::new(true),
            queue: Arc::new(RequestQueue::default()),
            worker: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    pub fn config(&self) -> &EstablisherConfig {
        &self.config
    }

    /// Requests waiting for the worker.
    pub fn pending_requests(&self) -> usize {
        self.queue.items().len()
    }

    pub fn is_async_reconnecting(&self) -> bool {
        self.async_reconnecting.load(Ordering::SeqCst)
    }

    pub fn reconnects_allowed(&self) -> bool {
        self.allow_reconnects.load(Ordering::SeqCst)
    }

    /// Connects `transport` for the first time, trying every candidate once.
    pub async fn open(&self, transport: &Transport) -> Result<()> {
        if self.is_async_reconnecting() {
            Err(Error::ContractViolation(
                "open called while an async reconnect is in progress",
            ))?
        }
        if transport.is_closed() {
            Err(Error::TransportClosed)?
        }
        self.allow_reconnects.store(true, Ordering::SeqCst);
        let _attempt = self.attempt.lock().await;
        self.connect_try_all_once(transport).await
    }

    /// One pass over the candidate list; the first completed handshake wins.
    /// Stack mismatches and rejections end the pass at once.
    pub async fn connect_try_all_once(&self, transport: &Transport) -> Result<()> {
        let mut last_error = None;
        for &addr in &self.addresses {
            match self.attempt_at(addr, transport).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    debug!("connecting to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(Error::NoAddresses))
    }

    /// Opens exactly one new socket to `addr`, bounded by the connect
    /// timeout.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        transport: &Transport,
    ) -> Result<tokio::net::TcpStream> {
        transport.notify_connect_attempt();
        let stream = self
            .connector
            .connect(addr, self.config.connect_timeout)
            .await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Reconnects a transport that lost its socket, reusing its identity.
    /// Gives up after `max_reconnect_tries` rounds and closes the transport.
    pub async fn reconnect(&self, transport: &Transport) -> Result<()> {
        let _attempt = self.attempt.lock().await;
        self.reconnect_locked(transport).await
    }

    async fn reconnect_locked(&self, transport: &Transport) -> Result<()> {
        if transport.is_connected() {
            return Ok(());
        }
        if transport.is_closed() {
            Err(Error::TransportClosed)?
        }
        if self.addresses.is_empty() {
            Err(Error::NoAddresses)?
        }
        let retry_interval = self.config.effective_retry_interval();
        let previous = transport.remote_addr();
        let mut last_error = None;
        let mut last_logged: Option<Instant> = None;
        let mut round = 0;

        while self.config.max_reconnect_tries.map_or(true, |max| round < max) {
            round += 1;
            for addr in self.candidates(round, previous) {
                if !self.reconnects_allowed() || transport.is_closed() {
                    return Err(last_error.unwrap_or(Error::NotConnected));
                }
                if transport.is_connected() {
                    return Ok(());
                }
                match self.attempt_at(addr, transport).await {
                    Ok(()) => {
                        info!("reconnected to {} after {} rounds", addr, round);
                        return Ok(());
                    }
                    Err(e @ Error::MaxConnectionsExceeded { .. }) => return Err(e),
                    Err(e) if e.is_terminal() => return Err(e),
                    Err(e) => {
                        if last_logged.map_or(true, |at| at.elapsed() >= LOSSY_LOG_INTERVAL) {
                            warn!("reconnecting to {} failed: {}", addr, e);
                            last_logged = Some(Instant::now());
                        } else {
                            trace!("reconnecting to {} failed: {}", addr, e);
                        }
                        last_error = Some(e);
                        sleep(retry_interval).await;
                    }
                }
            }
        }

        warn!("giving up on reconnecting after {} rounds", round);
        transport.close();
        Err(last_error.unwrap_or(Error::NotConnected))
    }

    /// Candidate order for a reconnect round. The first round fails over
    /// away from the address that just went down, if there is another one.
    fn candidates(&self, round: u32, previous: Option<SocketAddr>) -> Vec<SocketAddr> {
        match previous {
            Some(previous) if round == 1 && self.addresses.len() > 1 => self
                .addresses
                .iter()
                .copied()
                .filter(|addr| *addr != previous)
                .collect(),
            _ => self.addresses.clone(),
        }
    }

    /// Keeps trying `addr` until the transport is back or `limit` elapses.
    pub async fn restore_connection(
        &self,
        transport: &Transport,
        addr: SocketAddr,
        limit: Duration,
    ) -> RestoreOutcome {
        let _attempt = self.attempt.lock().await;
        let deadline = Instant::now() + limit;
        let retry_interval = self.config.effective_retry_interval();
        loop {
            if transport.is_connected() {
                return RestoreOutcome::Restored;
            }
            if transport.is_closed() || !self.reconnects_allowed() {
                return RestoreOutcome::Failed;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return RestoreOutcome::Failed;
            }
            match timeout(remaining, self.attempt_at(addr, transport)).await {
                Ok(Ok(())) => {
                    info!("restored connection to {}", addr);
                    return RestoreOutcome::Restored;
                }
                Ok(Err(Error::ReconnectionRejected(_))) => return RestoreOutcome::Rejected,
                Ok(Err(e @ Error::MaxConnectionsExceeded { .. })) => {
                    debug!("restoring {} failed: {}", addr, e);
                    return RestoreOutcome::Failed;
                }
                Ok(Err(e)) if e.is_terminal() => {
                    debug!("restoring {} failed: {}", addr, e);
                    return RestoreOutcome::Failed;
                }
                Ok(Err(e)) => {
                    trace!("restoring {} failed: {}", addr, e);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    sleep(retry_interval.min(remaining)).await;
                }
                Err(_) => return RestoreOutcome::Failed,
            }
        }
    }

    /// Queues a reconnect of `transport` for the worker. Returns false if the
    /// request was refused.
    pub fn async_reconnect(&self, transport: &Transport) -> bool {
        if !self.accepts(transport) {
            trace!("not queueing reconnect of transport {}", transport.id());
            return false;
        }
        self.enqueue(ConnectionRequest::Reconnect(transport.clone()));
        true
    }

    /// Queues a restore of `transport` against `addr`. The callback receives
    /// the outcome unless the request is refused, in which case false is
    /// returned and the callback is dropped.
    pub fn async_restore_connection(
        &self,
        transport: &Transport,
        addr: SocketAddr,
        limit: Duration,
        callback: RestoreCallback,
    ) -> bool {
        if !self.accepts(transport) {
            trace!("not queueing restore of transport {}", transport.id());
            return false;
        }
        self.enqueue(ConnectionRequest::Restore {
            transport: transport.clone(),
            addr,
            timeout: limit,
            callback,
        });
        true
    }

    /// Stops the current worker and installs a fresh one. Queued requests
    /// are kept for the new worker.
    pub fn reset(&self) {
        let mut worker = self.worker();
        if let Some(previous) = worker.take() {
            previous.stop();
        }
        self.async_reconnecting.store(false, Ordering::SeqCst);
        *worker = Some(AsyncReconnect::spawn(self.me.clone(), self.queue.clone()));
        debug!("reconnect worker reset");
    }

    /// Disables reconnects until the next `open`, stops the worker and drops
    /// every queued request.
    pub fn quit_reconnect_attempts(&self) {
        self.allow_reconnects.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker().take() {
            worker.stop();
        }
        let dropped = self.queue.drain();
        if !dropped.is_empty() {
            debug!("dropped {} queued reconnect requests", dropped.len());
        }
        for request in dropped {
            request.discard(RestoreOutcome::Failed);
        }
    }

    fn accepts(&self, transport: &Transport) -> bool {
        self.reconnects_allowed()
            && transport.was_opened()
            && !transport.is_rejected()
            && !transport.is_closed()
    }

    fn enqueue(&self, request: ConnectionRequest) {
        {
            let mut worker = self.worker();
            if worker.as_ref().map_or(true, |w| w.task.is_finished()) {
                *worker = Some(AsyncReconnect::spawn(self.me.clone(), self.queue.clone()));
            }
        }
        self.queue.push(request);
    }

    async fn serve(&self, request: ConnectionRequest) {
        match request {
            ConnectionRequest::Reconnect(transport) => {
                if transport.is_rejected() {
                    return;
                }
                if let Err(e) = self.reconnect(&transport).await {
                    warn!("reconnecting transport {} failed: {}", transport.id(), e);
                }
            }
            ConnectionRequest::Restore {
                transport,
                addr,
                timeout,
                callback,
            } => {
                let outcome = self.restore_connection(&transport, addr, timeout).await;
                debug!("restore of transport {} ended: {:?}", transport.id(), outcome);
                callback(outcome);
            }
        }
    }

    /// One connect plus handshake against `addr`. On success the socket is
    /// attached to `transport`.
    async fn attempt_at(&self, addr: SocketAddr, transport: &Transport) -> Result<()> {
        let span = debug_span!("connect", %addr, transport = transport.id());
        async move {
            let stream = self.connect(addr, transport).await?;
            let (reader, writer) = stream.into_split();
            let mut handshake = ClientHandshake::new(
                FrameReader::new(reader),
                FrameWriter::new(writer),
                self.config.handshake_timeout,
            );
            let hello = ClientHello {
                identity: transport.identity().cloned(),
                process_id: self.config.process_id.clone(),
                credentials: self.config.credentials.clone(),
                stack_flags: self.config.stack_flags,
                callback_port: self.config.callback_port,
            };
            let established = match handshake.initiate(&hello).await {
                Ok(established) => established,
                Err(e @ Error::ReconnectionRejected(_)) => {
                    warn!("server rejected reconnect: {}", e);
                    transport.mark_rejected();
                    Err(e)?
                }
                Err(e) => Err(e)?,
            };
            transport.set_identity(established.identity)?;
            let (reader, writer) = handshake.into_parts();
            transport
                .attach(reader, writer, addr, established.peer_callback_port)
                .await?;
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn worker(&self) -> MutexGuard<'_, Option<AsyncReconnect>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TransportListener for ClientConnectionEstablisher {
    fn notify_transport_disconnected(&self, transport: &Transport, forced: bool) {
        if !self.config.reconnect_enabled {
            return;
        }
        let restore_addr = transport.remote_addr().filter(|_| forced);
        match restore_addr {
            Some(addr) => {
                let me = self.me.clone();
                let fallback = transport.clone();
                self.async_restore_connection(
                    transport,
                    addr,
                    self.config.restore_timeout,
                    Box::new(move |outcome| {
                        if outcome != RestoreOutcome::Failed {
                            return;
                        }
                        if let Some(establisher) = me.upgrade() {
                            establisher.async_reconnect(&fallback);
                        }
                    }),
                );
            }
            None => {
                self.async_reconnect(transport);
            }
        }
    }

    fn notify_transport_reconnection_rejected(&self, transport: &Transport) {
        let purged = self.queue.drain_for(transport);
        if !purged.is_empty() {
            debug!("dropped {} requests of a rejected transport", purged.len());
        }
        for request in purged {
            request.discard(RestoreOutcome::Rejected);
        }
    }
}

impl Drop for ClientConnectionEstablisher {
    fn drop(&mut self) {
        if let Some(worker) = self.worker().take() {
            worker.stop();
        }
    }
}
