//! SYN / SYN_ACK / ACK exchange binding a fresh socket to a logical
//! connection.
//!
//! The client opens with a SYN carrying the identity it was given by an
//! earlier handshake, if any. The server answers with a SYN_ACK that either
//! names the identity the socket is now bound to or explains why it was
//! refused. The client confirms with an ACK echoing the identity.

use std::{fmt, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::timeout,
};
use tracing::debug;

use super::{
    error::{Error, Result},
    identity::{ConnectionIdentity, Credentials},
    wire::{
        Ack, FrameReader, FrameWriter, HandshakeError, HandshakeErrorKind,
        HandshakeMessage, StackFlags, Syn, SynAck, TransportMessage,
        WireCredentials,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    SynSent,
    SynReceived,
    Established,
}

impl HandshakeState {
    fn awaiting(self) -> &'static str {
        match self {
            HandshakeState::Idle => "waiting for SYN",
            HandshakeState::SynSent => "waiting for SYN_ACK",
            HandshakeState::SynReceived => "waiting for ACK",
            HandshakeState::Established => "established",
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a client announces in its SYN.
#[derive(Clone, Debug)]
pub struct ClientHello {
    /// Identity of the logical connection being reconnected, none on the
    /// first connect
    pub identity: Option<ConnectionIdentity>,
    pub process_id: String,
    pub credentials: Option<Credentials>,
    pub stack_flags: StackFlags,
    pub callback_port: Option<u16>,
}

/// Result of a completed handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Established {
    pub identity: ConnectionIdentity,
    /// Reverse health check port of the peer
    pub peer_callback_port: Option<u16>,
}

/// A SYN as seen by the server, with the identity token already parsed.
#[derive(Clone, Debug)]
pub struct SynRequest {
    pub identity: Option<ConnectionIdentity>,
    pub process_id: String,
    pub credentials: Option<Credentials>,
    pub stack_flags: StackFlags,
    pub callback_port: Option<u16>,
}

async fn receive_within<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    limit: Duration,
) -> Result<TransportMessage> {
    timeout(limit, reader.receive()).await?
}

/// Client half of the handshake.
pub struct ClientHandshake<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    state: HandshakeState,
    timeout: Duration,
}

impl<R, W> ClientHandshake<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        reader: FrameReader<R>,
        writer: FrameWriter<W>,
        timeout: Duration,
    ) -> Self {
        Self {
            reader,
            writer,
            state: HandshakeState::Idle,
            timeout,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Runs the client side to completion. Refusals reported by the server
    /// map onto the matching [`Error`] variants.
    pub async fn initiate(&mut self, hello: &ClientHello) -> Result<Established> {
        if self.state != HandshakeState::Idle {
            Err(Error::ContractViolation("handshake already started"))?
        }
        let syn = Syn {
            identity: hello.identity.as_ref().map(ConnectionIdentity::token),
            process_id: hello.process_id.clone(),
            credentials: hello.credentials.as_ref().map(|c| WireCredentials {
                username: c.username.clone(),
                secret: c.secret.clone(),
            }),
            stack_flags: hello.stack_flags,
            callback_port: hello.callback_port,
        };
        self.writer.send(&HandshakeMessage::Syn(syn).into()).await?;
        self.state = HandshakeState::SynSent;
        debug!("sent SYN");

        let syn_ack = match receive_within(&mut self.reader, self.timeout).await? {
            TransportMessage::Handshake(HandshakeMessage::SynAck(syn_ack)) => {
                syn_ack
            }
            other => {
                debug!("got {} instead of SYN_ACK", other.kind());
                Err(Error::UnexpectedMessage(self.state.awaiting()))?
            }
        };
        debug!("received SYN_ACK");

        if let Some(HandshakeError { kind, context }) = syn_ack.error {
            Err(match kind {
                HandshakeErrorKind::StackMismatch => Error::StackMismatch(context),
                HandshakeErrorKind::ReconnectionRejected => {
                    Error::ReconnectionRejected(context)
                }
                HandshakeErrorKind::Busy => Error::ConnectionBusy(context),
                HandshakeErrorKind::InvalidConnectionId
                | HandshakeErrorKind::Handshake => Error::Handshake(context),
            })?
        }
        if syn_ack.max_connections_exceeded {
            Err(Error::MaxConnectionsExceeded {
                max: syn_ack.max_connections as usize,
            })?
        }

        let token = syn_ack.identity.ok_or_else(|| {
            Error::Handshake("SYN_ACK carries no identity".into())
        })?;
        let identity = ConnectionIdentity::parse(&token)?;
        if let Some(previous) = &hello.identity {
            if *previous != identity {
                Err(Error::Handshake(format!(
                    "reconnected as {identity} instead of {previous}"
                )))?
            }
        }

        self.writer
            .send(&HandshakeMessage::Ack(Ack { identity: token }).into())
            .await?;
        self.state = HandshakeState::Established;
        debug!("handshake complete as {}", identity);
        Ok(Established {
            identity,
            peer_callback_port: syn_ack.callback_port,
        })
    }

    pub fn into_parts(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}

/// Server half of the handshake, driven step by step by the acceptor so it
/// can consult the registry between SYN and SYN_ACK.
pub struct ServerHandshake<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    state: HandshakeState,
    timeout: Duration,
}

impl<R, W> ServerHandshake<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        reader: FrameReader<R>,
        writer: FrameWriter<W>,
        timeout: Duration,
    ) -> Self {
        Self {
            reader,
            writer,
            state: HandshakeState::Idle,
            timeout,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Waits for the SYN. A malformed identity token is answered with an
    /// `InvalidConnectionId` refusal before the error is returned.
    pub async fn receive_syn(&mut self) -> Result<SynRequest> {
        let syn = match receive_within(&mut self.reader, self.timeout).await? {
            TransportMessage::Handshake(HandshakeMessage::Syn(syn)) => syn,
            other => {
                debug!("got {} instead of SYN", other.kind());
                self.refuse(
                    HandshakeErrorKind::Handshake,
                    format!("expected SYN, got {}", other.kind()),
                )
                .await?;
                Err(Error::UnexpectedMessage(self.state.awaiting()))?
            }
        };
        self.state = HandshakeState::SynReceived;
        debug!("received SYN from process {}", syn.process_id);

        let identity = match syn.identity.as_deref().map(ConnectionIdentity::parse)
        {
            None => None,
            Some(Ok(identity)) => Some(identity),
            Some(Err(e)) => {
                self.refuse(HandshakeErrorKind::InvalidConnectionId, e.to_string())
                    .await?;
                Err(e)?
            }
        };
        Ok(SynRequest {
            identity,
            process_id: syn.process_id,
            credentials: syn
                .credentials
                .map(|c| Credentials::new(c.username, c.secret)),
            stack_flags: syn.stack_flags,
            callback_port: syn.callback_port,
        })
    }

    /// Answers the SYN with an error.
    pub async fn refuse(
        &mut self,
        kind: HandshakeErrorKind,
        context: String,
    ) -> Result<()> {
        debug!("refusing handshake: {:?} {}", kind, context);
        let syn_ack = SynAck {
            identity: None,
            max_connections_exceeded: false,
            max_connections: 0,
            callback_port: None,
            error: Some(HandshakeError { kind, context }),
        };
        self.writer.send(&HandshakeMessage::SynAck(syn_ack).into()).await
    }

    /// Tells the client the admission ceiling is reached.
    pub async fn refuse_max_connections(&mut self, max: usize) -> Result<()> {
        debug!("refusing handshake: {} client processes connected", max);
        let syn_ack = SynAck {
            identity: None,
            max_connections_exceeded: true,
            max_connections: u32::try_from(max).unwrap_or(u32::MAX),
            callback_port: None,
            error: None,
        };
        self.writer.send(&HandshakeMessage::SynAck(syn_ack).into()).await
    }

    /// Sends the SYN_ACK binding the socket to `identity` and waits for the
    /// matching ACK.
    pub async fn accept(
        &mut self,
        identity: &ConnectionIdentity,
        max_connections: usize,
        callback_port: Option<u16>,
    ) -> Result<()> {
        if self.state != HandshakeState::SynReceived {
            Err(Error::ContractViolation("SYN_ACK sent before SYN"))?
        }
        let token = identity.token();
        let syn_ack = SynAck {
            identity: Some(token.clone()),
            max_connections_exceeded: false,
            max_connections: u32::try_from(max_connections).unwrap_or(u32::MAX),
            callback_port,
            error: None,
        };
        self.writer.send(&HandshakeMessage::SynAck(syn_ack).into()).await?;
        debug!("sent SYN_ACK for {}", identity);

        match receive_within(&mut self.reader, self.timeout).await? {
            TransportMessage::Handshake(HandshakeMessage::Ack(ack))
                if ack.identity == token =>
            {
                self.state = HandshakeState::Established;
                debug!("handshake complete for {}", identity);
                Ok(())
            }
            TransportMessage::Handshake(HandshakeMessage::Ack(_)) => Err(
                Error::Handshake("ACK names a different identity".into()),
            ),
            other => {
                debug!("got {} instead of ACK", other.kind());
                Err(Error::UnexpectedMessage(self.state.awaiting()))
            }
        }
    }

    pub fn into_parts(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::transport::identity::ServerOriginId;

    type Half = (FrameReader<ReadHalf<DuplexStream>>, FrameWriter<WriteHalf<DuplexStream>>);

    fn pipe() -> (Half, Half) {
        let (a, b) = duplex(4096);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        (
            (FrameReader::new(ar), FrameWriter::new(aw)),
            (FrameReader::new(br), FrameWriter::new(bw)),
        )
    }

    fn hello(identity: Option<ConnectionIdentity>) -> ClientHello {
        ClientHello {
            identity,
            process_id: "jvm1".into(),
            credentials: None,
            stack_flags: StackFlags::default(),
            callback_port: Some(9510),
        }
    }

    const LIMIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn first_connect_gets_a_minted_identity() {
        let ((cr, cw), (sr, sw)) = pipe();
        let minted =
            ConnectionIdentity::new(1, ServerOriginId::generate(), "jvm1")
                .unwrap();

        let server = {
            let minted = minted.clone();
            tokio::spawn(async move {
                let mut hs = ServerHandshake::new(sr, sw, LIMIT);
                let request = hs.receive_syn().await.unwrap();
                assert!(request.identity.is_none());
                assert_eq!(request.process_id, "jvm1");
                assert_eq!(request.callback_port, Some(9510));
                hs.accept(&minted, 8, Some(9511)).await.unwrap();
                hs.state()
            })
        };

        let mut hs = ClientHandshake::new(cr, cw, LIMIT);
        let established = hs.initiate(&hello(None)).await.unwrap();
        assert_eq!(established.identity, minted);
        assert_eq!(established.peer_callback_port, Some(9511));
        assert_eq!(hs.state(), HandshakeState::Established);
        assert_eq!(server.await.unwrap(), HandshakeState::Established);
    }

    #[tokio::test]
    async fn reconnect_must_keep_the_identity() {
        let ((cr, cw), (sr, sw)) = pipe();
        let origin = ServerOriginId::generate();
        let previous = ConnectionIdentity::new(1, origin.clone(), "jvm1").unwrap();
        let other = ConnectionIdentity::new(2, origin, "jvm1").unwrap();

        tokio::spawn(async move {
            let mut hs = ServerHandshake::new(sr, sw, LIMIT);
            hs.receive_syn().await.unwrap();
            let _ = hs.accept(&other, 8, None).await;
        });

        let mut hs = ClientHandshake::new(cr, cw, LIMIT);
        assert!(matches!(
            hs.initiate(&hello(Some(previous))).await,
            Err(Error::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn refusals_map_to_errors() {
        for kind in [
            HandshakeErrorKind::StackMismatch,
            HandshakeErrorKind::ReconnectionRejected,
            HandshakeErrorKind::InvalidConnectionId,
        ] {
            let ((cr, cw), (sr, sw)) = pipe();
            tokio::spawn(async move {
                let mut hs = ServerHandshake::new(sr, sw, LIMIT);
                hs.receive_syn().await.unwrap();
                hs.refuse(kind, "transport".into()).await.unwrap();
            });
            let err = ClientHandshake::new(cr, cw, LIMIT)
                .initiate(&hello(None))
                .await
                .unwrap_err();
            let mapped = match kind {
                HandshakeErrorKind::StackMismatch => {
                    matches!(&err, Error::StackMismatch(c) if c.as_str() == "transport")
                }
                HandshakeErrorKind::ReconnectionRejected => {
                    matches!(err, Error::ReconnectionRejected(_))
                }
                _ => matches!(err, Error::Handshake(_)),
            };
            assert!(mapped, "{kind:?} -> {err}");
            assert!(!err.is_transient());
        }
    }

    #[tokio::test]
    async fn busy_servers_are_retried() {
        let ((cr, cw), (sr, sw)) = pipe();
        tokio::spawn(async move {
            let mut hs = ServerHandshake::new(sr, sw, LIMIT);
            hs.receive_syn().await.unwrap();
            hs.refuse(HandshakeErrorKind::Busy, "old socket dropped".into())
                .await
                .unwrap();
        });
        let err = ClientHandshake::new(cr, cw, LIMIT)
            .initiate(&hello(None))
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::ConnectionBusy(c) if c.as_str() == "old socket dropped"));
        assert!(err.is_transient());
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn max_connections_exceeded_is_reported() {
        let ((cr, cw), (sr, sw)) = pipe();
        tokio::spawn(async move {
            let mut hs = ServerHandshake::new(sr, sw, LIMIT);
            hs.receive_syn().await.unwrap();
            hs.refuse_max_connections(2).await.unwrap();
        });
        let err = ClientHandshake::new(cr, cw, LIMIT)
            .initiate(&hello(None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MaxConnectionsExceeded { max: 2 }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let ((cr, cw), (_sr, _sw)) = pipe();
        let err = ClientHandshake::new(cr, cw, Duration::from_millis(50))
            .initiate(&hello(None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn malformed_identity_is_refused() {
        let ((cr, mut cw), (sr, sw)) = pipe();
        let syn = Syn {
            identity: Some("not-a-token".into()),
            process_id: "jvm1".into(),
            credentials: None,
            stack_flags: StackFlags::default(),
            callback_port: None,
        };
        cw.send(&HandshakeMessage::Syn(syn).into()).await.unwrap();

        let mut hs = ServerHandshake::new(sr, sw, LIMIT);
        assert!(matches!(
            hs.receive_syn().await,
            Err(Error::MalformedIdentity(_))
        ));

        let mut cr = cr;
        match cr.receive().await.unwrap() {
            TransportMessage::Handshake(HandshakeMessage::SynAck(syn_ack)) => {
                assert_eq!(
                    syn_ack.error.map(|e| e.kind),
                    Some(HandshakeErrorKind::InvalidConnectionId)
                );
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }
}
