use byteorder::{ByteOrder, LittleEndian};
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::Error;

/// Frames longer than this are treated as a corrupt stream.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
/// Largest application payload that still fits in a frame once archived.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN as usize - 64;

/// Bit set describing the protocol layers a side stacks on top of the
/// transport. Both sides of a connection must agree on it.
#[derive(
    Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
)]
#[archive(check_bytes)]
pub struct StackFlags(pub u16);

impl StackFlags {
    pub const TRANSPORT: StackFlags = StackFlags(0b0000_0001);
    pub const ONCE_AND_ONLY_ONCE: StackFlags = StackFlags(0b0000_0010);
    pub const CHANNEL: StackFlags = StackFlags(0b0000_0100);

    const NAMES: [(StackFlags, &'static str); 3] = [
        (Self::TRANSPORT, "transport"),
        (Self::ONCE_AND_ONLY_ONCE, "once-and-only-once"),
        (Self::CHANNEL, "channel"),
    ];

    pub const fn union(self, other: StackFlags) -> StackFlags {
        StackFlags(self.0 | other.0)
    }

    pub fn contains(self, other: StackFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Human readable list of the layers present.
    pub fn layer_names(self) -> String {
        let names: Vec<_> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            "none".into()
        } else {
            names.join(", ")
        }
    }
}

impl Default for StackFlags {
    fn default() -> Self {
        Self::TRANSPORT.union(Self::CHANNEL)
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct WireCredentials {
    pub username: String,
    pub secret: String,
}

/// Reasons a server refuses a handshake.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum HandshakeErrorKind {
    /// The two sides were built with different protocol stacks
    StackMismatch,
    /// The server no longer knows the identity the client reconnects with
    ReconnectionRejected,
    /// The identity token in the SYN could not be parsed
    InvalidConnectionId,
    /// The server cannot take the connection right now, retry later
    Busy,
    /// Any other protocol violation
    Handshake,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct HandshakeError {
    pub kind: HandshakeErrorKind,
    pub context: String,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Syn {
    /// Identity token from a previous handshake, none on the first connect
    pub identity: Option<String>,
    pub process_id: String,
    pub credentials: Option<WireCredentials>,
    pub stack_flags: StackFlags,
    /// Port the peer may connect to for reverse health checks
    pub callback_port: Option<u16>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct SynAck {
    pub identity: Option<String>,
    pub max_connections_exceeded: bool,
    pub max_connections: u32,
    pub callback_port: Option<u16>,
    pub error: Option<HandshakeError>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Ack {
    pub identity: String,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum HandshakeMessage {
    Syn(Syn),
    SynAck(SynAck),
    Ack(Ack),
}

/// Liveness probe. `sent_at` is the sender's wall clock in microseconds.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Probe {
    pub sequence: u64,
    pub sent_at: i64,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum TransportMessage {
    Handshake(HandshakeMessage),
    Probe(Probe),
    ProbeReply(Probe),
    /// Opaque application payload
    Data(Vec<u8>),
}

impl TransportMessage {
    pub fn encode(&self) -> Result<AlignedVec, Error> {
        rkyv::to_bytes::<_, 256>(self).map_err(|_| Error::CouldNotEncodeMessage)
    }

    pub fn decode(buf: &AlignedVec) -> Result<Self, Error> {
        rkyv::from_bytes::<TransportMessage>(buf)
            .map_err(|_| Error::CouldNotDecodeMessage)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransportMessage::Handshake(HandshakeMessage::Syn(_)) => "SYN",
            TransportMessage::Handshake(HandshakeMessage::SynAck(_)) => {
                "SYN_ACK"
            }
            TransportMessage::Handshake(HandshakeMessage::Ack(_)) => "ACK",
            TransportMessage::Probe(_) => "PROBE",
            TransportMessage::ProbeReply(_) => "PROBE_REPLY",
            TransportMessage::Data(_) => "DATA",
        }
    }
}

impl From<HandshakeMessage> for TransportMessage {
    fn from(msg: HandshakeMessage) -> Self {
        TransportMessage::Handshake(msg)
    }
}

/// Writes length prefixed frames: `len: u32 LE | archived message`.
pub struct FrameWriter<W>(W);

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self(inner)
    }

    pub async fn send(&mut self, msg: &TransportMessage) -> Result<(), Error> {
        let body = msg.encode()?;
        let len = body.len();
        if len > MAX_FRAME_LEN as usize {
            Err(Error::MessageLengthOverflowed(
                u32::try_from(len).unwrap_or(u32::MAX),
            ))?
        }
        let mut buf = Vec::with_capacity(4 + len);
        buf.extend_from_slice(&(len as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        self.0.write_all(&buf).await?;
        self.0.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.0.shutdown().await?;
        Ok(())
    }
}

pub struct FrameReader<R>(R);

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self(inner)
    }

    /// Reads the next frame. A clean end of stream before a frame header is
    /// reported as `ConnectionClosed`.
    pub async fn receive(&mut self) -> Result<TransportMessage, Error> {
        let mut len_buf = [0u8; 4];
        match self.0.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(Error::ConnectionClosed)?
            }
            Err(e) => Err(e)?,
        }
        let len = LittleEndian::read_u32(&len_buf);
        if len > MAX_FRAME_LEN {
            Err(Error::MessageLengthOverflowed(len))?
        }
        let mut msg_buf = vec![0u8; len as usize];
        self.0.read_exact(&mut msg_buf).await?;
        // archived roots must be aligned
        let mut aligned = AlignedVec::with_capacity(msg_buf.len());
        aligned.extend_from_slice(&msg_buf);
        TransportMessage::decode(&aligned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_flag_names() {
        assert_eq!(StackFlags::default().layer_names(), "transport, channel");
        assert_eq!(StackFlags(0).layer_names(), "none");
        let full = StackFlags::default().union(StackFlags::ONCE_AND_ONLY_ONCE);
        assert!(full.contains(StackFlags::ONCE_AND_ONLY_ONCE));
        assert!(!StackFlags::default().contains(full));
    }

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let syn = TransportMessage::from(HandshakeMessage::Syn(Syn {
            identity: None,
            process_id: "p1".into(),
            credentials: Some(WireCredentials {
                username: "alice".into(),
                secret: String::new(),
            }),
            stack_flags: StackFlags::default(),
            callback_port: Some(9510),
        }));
        writer.send(&syn).await.unwrap();
        writer
            .send(&TransportMessage::Data(b"hello".to_vec()))
            .await
            .unwrap();

        assert_eq!(reader.receive().await.unwrap(), syn);
        assert_eq!(
            reader.receive().await.unwrap(),
            TransportMessage::Data(b"hello".to_vec())
        );

        drop(writer);
        assert!(matches!(
            reader.receive().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        client
            .write_all(&(MAX_FRAME_LEN + 1).to_le_bytes())
            .await
            .unwrap();
        assert!(matches!(
            reader.receive().await,
            Err(Error::MessageLengthOverflowed(_))
        ));
    }

    #[tokio::test]
    async fn writer_refuses_oversized_frames() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let huge = TransportMessage::Data(vec![0; MAX_FRAME_LEN as usize]);
        assert!(matches!(
            writer.send(&huge).await,
            Err(Error::MessageLengthOverflowed(_))
        ));
        // nothing of the refused frame reached the stream
        writer
            .send(&TransportMessage::Data(b"next".to_vec()))
            .await
            .unwrap();
        assert!(matches!(
            reader.receive().await.unwrap(),
            TransportMessage::Data(d) if d == b"next"
        ));

        let largest = TransportMessage::Data(vec![0; MAX_PAYLOAD_LEN]);
        assert!(largest.encode().unwrap().len() <= MAX_FRAME_LEN as usize);
    }

    #[tokio::test]
    async fn garbage_is_not_decoded() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        client.write_all(&3u32.to_le_bytes()).await.unwrap();
        client.write_all(&[0xff, 0xff, 0xff]).await.unwrap();
        assert!(matches!(
            reader.receive().await,
            Err(Error::CouldNotDecodeMessage)
        ));
    }
}
