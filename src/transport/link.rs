use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock,
    },
};

use chrono::Utc;
use tokio::{
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    config::TransportConfig,
    error::{Error, Result},
    identity::ConnectionIdentity,
    listener::{ListenerSet, TransportListener},
    wire::{FrameReader, FrameWriter, Probe, TransportMessage, MAX_PAYLOAD_LEN},
};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportStatus {
    Init,
    Connected,
    Disconnected,
    Closed,
}

/// Traffic seen on the current and previous sockets of a transport.
#[derive(Clone, Copy, Debug)]
pub struct Activity {
    /// Last time any frame arrived
    pub last_received: Instant,
    /// Probe replies received so far
    pub probe_replies: u64,
    /// Latest observed `our clock - peer clock`, in microseconds
    pub clock_skew_micros: Option<i64>,
    /// Number of clock samples taken so far
    pub clock_samples: u64,
}

struct State {
    status: TransportStatus,
    epoch: u64,
    remote_addr: Option<SocketAddr>,
    peer_callback_port: Option<u16>,
    was_opened: bool,
    rejected: bool,
}

struct Outbound {
    epoch: u64,
    writer: Option<FrameWriter<OwnedWriteHalf>>,
    pending: VecDeque<Vec<u8>>,
}

struct Inner {
    id: u64,
    side: Side,
    config: TransportConfig,
    identity: OnceLock<ConnectionIdentity>,
    state: Mutex<State>,
    outbound: tokio::sync::Mutex<Outbound>,
    reader: Mutex<Option<JoinHandle<()>>>,
    activity: Mutex<Activity>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
    listeners: ListenerSet,
}

/// One logical connection and its current binding to a socket.
///
/// Each socket bound to the transport gets a new epoch; events raised by the
/// reader of a replaced socket carry a stale epoch and are ignored, so every
/// socket produces at most one disconnect notification.
///
/// Can be cloned to obtain another handle to the same transport.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(side: Side, config: TransportConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
                side,
                config,
                identity: OnceLock::new(),
                state: Mutex::new(State {
                    status: TransportStatus::Init,
                    epoch: 0,
                    remote_addr: None,
                    peer_callback_port: None,
                    was_opened: false,
                    rejected: false,
                }),
                outbound: tokio::sync::Mutex::new(Outbound {
                    epoch: 0,
                    writer: None,
                    pending: VecDeque::new(),
                }),
                reader: Mutex::new(None),
                activity: Mutex::new(Activity {
                    last_received: Instant::now(),
                    probe_replies: 0,
                    clock_skew_micros: None,
                    clock_samples: 0,
                }),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                closed,
                listeners: ListenerSet::new(),
            }),
        }
    }

    /// Process-unique id of this transport.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn side(&self) -> Side {
        self.inner.side
    }

    pub fn identity(&self) -> Option<&ConnectionIdentity> {
        self.inner.identity.get()
    }

    /// Assigns the identity. Assigning the same identity again is a no-op,
    /// assigning a different one is a contract violation.
    pub fn set_identity(&self, identity: ConnectionIdentity) -> Result<()> {
        let current = self.inner.identity.get_or_init(|| identity.clone());
        if *current != identity {
            Err(Error::ContractViolation(
                "transport identity can't be reassigned",
            ))?
        }
        Ok(())
    }

    pub fn status(&self) -> TransportStatus {
        self.state().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == TransportStatus::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.status() == TransportStatus::Closed
    }

    /// Epoch of the most recently attached socket, 0 before the first one.
    pub fn epoch(&self) -> u64 {
        self.state().epoch
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.state().remote_addr
    }

    /// Reverse health check port the peer advertised during the handshake.
    pub fn peer_callback_port(&self) -> Option<u16> {
        self.state().peer_callback_port
    }

    /// True once any socket was attached to this transport.
    pub fn was_opened(&self) -> bool {
        self.state().was_opened
    }

    pub fn is_rejected(&self) -> bool {
        self.state().rejected
    }

    pub fn activity(&self) -> Activity {
        *self.activity_lock()
    }

    pub fn add_listener(&self, listener: Arc<dyn TransportListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn TransportListener>) {
        self.inner.listeners.remove(listener);
    }

    /// Messages queued while no socket is attached.
    pub async fn pending_messages(&self) -> usize {
        self.inner.outbound.lock().await.pending.len()
    }

    /// Sends an opaque application message. While no socket is attached the
    /// message is queued and flushed on the next attach.
    pub async fn send(&self, payload: Vec<u8>) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_LEN {
            Err(Error::PayloadTooLarge(payload.len()))?
        }
        let mut outbound = self.inner.outbound.lock().await;
        let epoch = outbound.epoch;
        let (status, current_epoch) = {
            let state = self.state();
            (state.status, state.epoch)
        };
        if status == TransportStatus::Closed {
            Err(Error::TransportClosed)?
        }
        let live = status == TransportStatus::Connected && current_epoch == epoch;
        if !live || outbound.writer.is_none() {
            return self.enqueue(&mut outbound, payload);
        }
        let msg = TransportMessage::Data(payload);
        let sent = match outbound.writer.as_mut() {
            Some(writer) => writer.send(&msg).await,
            None => Err(Error::NotConnected),
        };
        if let Err(e) = sent {
            debug!("send on transport {} failed: {}", self.id(), e);
            outbound.writer = None;
            if let TransportMessage::Data(payload) = msg {
                self.enqueue(&mut outbound, payload)?;
            }
            drop(outbound);
            self.socket_lost(epoch, false);
        }
        Ok(())
    }

    /// Waits for the next application message.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        let mut closed = self.inner.closed.subscribe();
        let mut inbound = self.inner.inbound_rx.lock().await;
        select! {
            biased;
            msg = inbound.recv() => msg.ok_or(Error::TransportClosed),
            _ = closed.wait_for(|closed| *closed) => Err(Error::TransportClosed),
        }
    }

    /// Sends a liveness probe on the current socket. Probes are never queued.
    pub async fn send_probe(&self, sequence: u64) -> Result<()> {
        let probe = Probe {
            sequence,
            sent_at: Utc::now().timestamp_micros(),
        };
        let epoch = self.epoch();
        self.send_control(epoch, TransportMessage::Probe(probe)).await
    }

    /// Drops the current socket on behalf of a local decision. Returns false
    /// if the transport was not connected, in which case no listener is
    /// notified.
    pub fn force_disconnect(&self) -> bool {
        let epoch = self.epoch();
        self.socket_lost(epoch, true)
    }

    /// Closes the transport for good. Queued messages are discarded and
    /// listeners are told once.
    pub fn close(&self) -> bool {
        let epoch = {
            let mut state = self.state();
            if state.status == TransportStatus::Closed {
                return false;
            }
            state.status = TransportStatus::Closed;
            state.epoch
        };
        debug!("closing transport {}", self.id());
        if let Some(reader) = self.take_reader() {
            reader.abort();
        }
        self.inner.closed.send_replace(true);
        self.release_writer(epoch, true);
        self.inner
            .listeners
            .for_each(|l| l.notify_transport_closed(self));
        true
    }

    pub(crate) fn mark_rejected(&self) {
        self.state().rejected = true;
        self.inner
            .listeners
            .for_each(|l| l.notify_transport_reconnection_rejected(self));
    }

    pub(crate) fn notify_connect_attempt(&self) {
        self.inner
            .listeners
            .for_each(|l| l.notify_transport_connect_attempt(self));
    }

    /// Binds a freshly handshaken socket to this transport, replacing any
    /// previous one. Queued messages are flushed before the reader starts.
    /// Returns the epoch of the new socket.
    pub(crate) async fn attach(
        &self,
        reader: FrameReader<OwnedReadHalf>,
        writer: FrameWriter<OwnedWriteHalf>,
        remote_addr: SocketAddr,
        peer_callback_port: Option<u16>,
    ) -> Result<u64> {
        let mut outbound = self.inner.outbound.lock().await;
        let epoch = {
            let mut state = self.state();
            if state.status == TransportStatus::Closed {
                Err(Error::TransportClosed)?
            }
            state.epoch += 1;
            state.status = TransportStatus::Connected;
            state.remote_addr = Some(remote_addr);
            state.peer_callback_port = peer_callback_port;
            state.was_opened = true;
            state.epoch
        };
        if let Some(previous) = self.take_reader() {
            previous.abort();
        }
        if let Some(mut previous) = outbound.writer.take() {
            let _ = previous.shutdown().await;
        }
        outbound.epoch = epoch;
        let mut writer = writer;
        while let Some(payload) = outbound.pending.pop_front() {
            let msg = TransportMessage::Data(payload);
            if let Err(e) = writer.send(&msg).await {
                // the reader will see the dead socket and report it
                debug!("flushing queued messages failed: {}", e);
                if let TransportMessage::Data(payload) = msg {
                    outbound.pending.push_front(payload);
                }
                break;
            }
        }
        outbound.writer = Some(writer);
        drop(outbound);

        self.activity_lock().last_received = Instant::now();
        debug!(
            "transport {} attached to {} (epoch {})",
            self.id(),
            remote_addr,
            epoch
        );
        self.inner
            .listeners
            .for_each(|l| l.notify_transport_connected(self));
        self.spawn_reader(reader, epoch);
        Ok(epoch)
    }

    fn enqueue(&self, outbound: &mut Outbound, payload: Vec<u8>) -> Result<()> {
        let max = self.inner.config.max_pending_messages;
        if outbound.pending.len() >= max {
            Err(Error::QueueFull(max))?
        }
        outbound.pending.push_back(payload);
        Ok(())
    }

    async fn send_control(&self, epoch: u64, msg: TransportMessage) -> Result<()> {
        let mut outbound = self.inner.outbound.lock().await;
        if outbound.epoch != epoch || !self.is_connected() {
            Err(Error::NotConnected)?
        }
        let sent = match outbound.writer.as_mut() {
            Some(writer) => writer.send(&msg).await,
            None => Err(Error::NotConnected),
        };
        if let Err(e) = sent {
            if outbound.writer.take().is_some() {
                drop(outbound);
                self.socket_lost(epoch, false);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Marks the socket of `epoch` as gone. Only the first caller for a given
    /// epoch wins and notifies listeners.
    fn socket_lost(&self, epoch: u64, forced: bool) -> bool {
        {
            let mut state = self.state();
            if state.status != TransportStatus::Connected || state.epoch != epoch
            {
                return false;
            }
            state.status = TransportStatus::Disconnected;
        }
        if forced {
            if let Some(reader) = self.take_reader() {
                reader.abort();
            }
        }
        self.release_writer(epoch, false);
        debug!(
            "transport {} lost its socket (epoch {}, forced: {})",
            self.id(),
            epoch,
            forced
        );
        self.inner
            .listeners
            .for_each(|l| l.notify_transport_disconnected(self, forced));
        true
    }

    /// Shuts down the writer of `epoch` off the calling task. With `drain`
    /// the pending queue is discarded as well.
    fn release_writer(&self, epoch: u64, drain: bool) {
        // without a runtime the writer simply goes away with the transport
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = self.inner.clone();
        runtime.spawn(async move {
            let mut outbound = inner.outbound.lock().await;
            if drain {
                outbound.pending.clear();
            }
            if outbound.epoch == epoch {
                if let Some(mut writer) = outbound.writer.take() {
                    let _ = writer.shutdown().await;
                }
            }
        });
    }

    fn spawn_reader(&self, mut reader: FrameReader<OwnedReadHalf>, epoch: u64) {
        let transport = self.clone();
        let span = debug_span!("reader", transport = self.id(), epoch);
        let handle = tokio::spawn(
            async move {
                loop {
                    match reader.receive().await {
                        Ok(msg) => {
                            if !transport.handle_frame(epoch, msg).await {
                                transport.socket_lost(epoch, false);
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("socket closed: {}", e);
                            transport.socket_lost(epoch, false);
                            break;
                        }
                    }
                }
            }
            .instrument(span),
        );
        let mut slot = self.reader_lock();
        let state = self.state();
        if state.epoch == epoch && state.status == TransportStatus::Connected {
            *slot = Some(handle);
        } else {
            handle.abort();
        }
    }

    /// Returns false if the frame violates the protocol and the socket has
    /// to be dropped.
    async fn handle_frame(&self, epoch: u64, msg: TransportMessage) -> bool {
        let now = Instant::now();
        self.activity_lock().last_received = now;
        match msg {
            TransportMessage::Data(payload) => {
                let _ = self.inner.inbound_tx.send(payload);
            }
            TransportMessage::Probe(probe) => {
                trace!("probe {} received", probe.sequence);
                self.record_clock(probe.sent_at);
                let reply = Probe {
                    sequence: probe.sequence,
                    sent_at: Utc::now().timestamp_micros(),
                };
                if let Err(e) = self
                    .send_control(epoch, TransportMessage::ProbeReply(reply))
                    .await
                {
                    debug!("could not answer probe: {}", e);
                }
            }
            TransportMessage::ProbeReply(probe) => {
                trace!("probe reply {} received", probe.sequence);
                self.record_clock(probe.sent_at);
                self.activity_lock().probe_replies += 1;
            }
            other @ TransportMessage::Handshake(_) => {
                warn!(
                    "dropping socket after unexpected {} on an established transport",
                    other.kind()
                );
                return false;
            }
        }
        true
    }

    fn record_clock(&self, peer_micros: i64) {
        let skew = Utc::now().timestamp_micros() - peer_micros;
        let mut activity = self.activity_lock();
        activity.clock_skew_micros = Some(skew);
        activity.clock_samples += 1;
    }

    fn take_reader(&self) -> Option<JoinHandle<()>> {
        self.reader_lock().take()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn activity_lock(&self) -> MutexGuard<'_, Activity> {
        self.inner
            .activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reader_lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PartialEq for Transport {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transport {}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Transport")
            .field("id", &self.inner.id)
            .field("side", &self.inner.side)
            .field("status", &state.status)
            .field("epoch", &state.epoch)
            .field("identity", &self.identity().map(ToString::to_string))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    /// Counts every event a transport raises.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub connected: AtomicUsize,
        pub disconnected: AtomicUsize,
        pub forced: AtomicUsize,
        pub closed: AtomicUsize,
        pub rejected: AtomicUsize,
        pub attempts: AtomicUsize,
    }

    impl TransportListener for Recorder {
        fn notify_transport_connected(&self, _: &Transport) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_transport_disconnected(&self, _: &Transport, forced: bool) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
            if forced {
                self.forced.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn notify_transport_connect_attempt(&self, _: &Transport) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_transport_closed(&self, _: &Transport) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_transport_reconnection_rejected(&self, _: &Transport) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A connected pair of raw sockets split into frame halves.
    pub(crate) async fn socket_pair() -> (
        (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>, SocketAddr),
        (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>, SocketAddr),
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (server, peer) = server.unwrap();
        let (cr, cw) = client.into_split();
        let (sr, sw) = server.into_split();
        (
            (FrameReader::new(cr), FrameWriter::new(cw), addr),
            (FrameReader::new(sr), FrameWriter::new(sw), peer),
        )
    }

    async fn linked() -> (Transport, Transport) {
        let ((cr, cw, caddr), (sr, sw, saddr)) = socket_pair().await;
        let client = Transport::new(Side::Client, TransportConfig::default());
        let server = Transport::new(Side::Server, TransportConfig::default());
        client.attach(cr, cw, caddr, None).await.unwrap();
        server.attach(sr, sw, saddr, None).await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn data_flows_both_ways() {
        let (client, server) = linked().await;
        client.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), b"ping");
        server.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn probes_are_echoed() {
        let (client, _server) = linked().await;
        client.send_probe(1).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while client.activity().probe_replies == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(client.activity().clock_samples >= 1);
    }

    #[tokio::test]
    async fn oversized_payloads_keep_the_connection() {
        let (client, server) = linked().await;
        assert!(matches!(
            client.send(vec![0; MAX_PAYLOAD_LEN + 1]).await,
            Err(Error::PayloadTooLarge(len)) if len == MAX_PAYLOAD_LEN + 1
        ));
        assert!(client.is_connected());
        client.send(b"after".to_vec()).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), b"after");

        // refused before it could take a slot in the queue
        client.force_disconnect();
        assert!(matches!(
            client.send(vec![0; MAX_PAYLOAD_LEN + 1]).await,
            Err(Error::PayloadTooLarge(_))
        ));
        assert_eq!(client.pending_messages().await, 0);
    }

    #[tokio::test]
    async fn sends_are_queued_until_attach() {
        let config = TransportConfig::builder().max_pending_messages(2).build();
        let client = Transport::new(Side::Client, config);
        client.send(b"one".to_vec()).await.unwrap();
        client.send(b"two".to_vec()).await.unwrap();
        assert!(matches!(
            client.send(b"three".to_vec()).await,
            Err(Error::QueueFull(2))
        ));

        let ((cr, cw, caddr), (sr, sw, saddr)) = socket_pair().await;
        let server = Transport::new(Side::Server, TransportConfig::default());
        server.attach(sr, sw, saddr, None).await.unwrap();
        client.attach(cr, cw, caddr, None).await.unwrap();
        assert_eq!(client.pending_messages().await, 0);
        assert_eq!(server.recv().await.unwrap(), b"one");
        assert_eq!(server.recv().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn forced_disconnect_is_reported_once() {
        let (client, server) = linked().await;
        let recorder = Arc::new(Recorder::default());
        client.add_listener(recorder.clone());
        let server_recorder = Arc::new(Recorder::default());
        server.add_listener(server_recorder.clone());

        assert!(client.force_disconnect());
        assert!(!client.force_disconnect());
        assert_eq!(client.status(), TransportStatus::Disconnected);
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.forced.load(Ordering::SeqCst), 1);

        // the peer sees the socket go away
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while server_recorder.disconnected.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!server.is_connected());
        assert_eq!(server_recorder.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(server_recorder.forced.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn identity_is_assigned_once() {
        use crate::transport::identity::ServerOriginId;

        let transport = Transport::new(Side::Client, TransportConfig::default());
        let origin = ServerOriginId::generate();
        let a = ConnectionIdentity::new(1, origin.clone(), "p").unwrap();
        let b = ConnectionIdentity::new(2, origin, "p").unwrap();
        transport.set_identity(a.clone()).unwrap();
        transport.set_identity(a.clone()).unwrap();
        assert!(matches!(
            transport.set_identity(b),
            Err(Error::ContractViolation(_))
        ));
        assert_eq!(transport.identity(), Some(&a));
    }

    #[tokio::test]
    async fn close_is_final() {
        let (client, _server) = linked().await;
        let recorder = Arc::new(Recorder::default());
        client.add_listener(recorder.clone());
        assert!(client.close());
        assert!(!client.close());
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 0);
        assert!(matches!(
            client.send(b"late".to_vec()).await,
            Err(Error::TransportClosed)
        ));
        assert!(matches!(client.recv().await, Err(Error::TransportClosed)));
    }
}
