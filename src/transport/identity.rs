//! Logical connection identities.
//!
//! An identity is minted by a server when it admits a brand-new logical
//! connection and is then carried verbatim by every reconnect of that logical
//! connection. On the wire it travels as a single token:
//!
//! ```text
//! channel "." server-origin "." process-id ["." username "." secret] [".!"]
//! ```
//!
//! The trailing `.!` marks a secured (authenticated) identity; only secured
//! tokens carry credentials.

use std::{
    fmt::{self, Write},
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use thiserror::Error;

/// Length in characters of a server origin id.
pub const SERVER_ORIGIN_ID_LEN: usize = 32;

const SEPARATOR: char = '.';
const SECURED_SUFFIX: &str = ".!";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedIdentity {
    #[error("empty identity token")]
    Empty,
    #[error("invalid channel number {0:?}")]
    ChannelNumber(String),
    #[error("invalid server origin id {0:?}")]
    ServerOrigin(String),
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("unexpected trailing fields {0:?} in an unsecured identity")]
    TrailingFields(String),
    #[error("{0} may not contain '.'")]
    IllegalSeparator(&'static str),
}

/// Identifies the server epoch that minted an identity. A restarted server
/// gets a new origin, so identities from its previous life are recognisable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerOriginId(String);

impl ServerOriginId {
    /// Derives a fresh origin from random bytes and the current time.
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        let mut hasher = blake3::Hasher::new();
        hasher.update(&seed);
        hasher.update(&Utc::now().timestamp_micros().to_le_bytes());
        let digest = hasher.finalize();
        Self(digest.to_hex()[..SERVER_ORIGIN_ID_LEN].to_string())
    }

    pub fn parse(s: &str) -> Result<Self, MalformedIdentity> {
        let hex = s.bytes().all(|b| b.is_ascii_hexdigit());
        if s.len() != SERVER_ORIGIN_ID_LEN || !hex {
            Err(MalformedIdentity::ServerOrigin(s.to_string()))?
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerOriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerOriginId {
    type Err = MalformedIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Credentials of an authenticated connection.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// The stable identity of a logical connection. Immutable once minted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    channel: u64,
    server_origin: ServerOriginId,
    process_id: String,
    credentials: Option<Credentials>,
}

impl ConnectionIdentity {
    pub fn new(
        channel: u64,
        server_origin: ServerOriginId,
        process_id: impl Into<String>,
    ) -> Result<Self, MalformedIdentity> {
        let process_id = process_id.into();
        validate_process_id(&process_id)?;
        Ok(Self {
            channel,
            server_origin,
            process_id,
            credentials: None,
        })
    }

    /// Turns this identity into a secured one carrying `credentials`.
    pub fn with_credentials(
        mut self,
        credentials: Credentials,
    ) -> Result<Self, MalformedIdentity> {
        validate_username(&credentials.username)?;
        self.credentials = Some(credentials);
        Ok(self)
    }

    pub fn parse(token: &str) -> Result<Self, MalformedIdentity> {
        use MalformedIdentity::*;

        if token.is_empty() {
            Err(Empty)?
        }
        let (body, secured) = match token.strip_suffix(SECURED_SUFFIX) {
            Some(body) => (body, true),
            None => (token, false),
        };

        // the secret is the last field and is allowed to contain separators
        let mut fields = body.splitn(if secured { 5 } else { 4 }, SEPARATOR);

        let channel = fields
            .next()
            .filter(|f| !f.is_empty())
            .ok_or(MissingField("channel number"))?;
        if !channel.bytes().all(|b| b.is_ascii_digit()) {
            Err(ChannelNumber(channel.to_string()))?
        }
        let channel = channel
            .parse::<u64>()
            .map_err(|_| ChannelNumber(channel.to_string()))?;

        let server_origin = ServerOriginId::parse(
            fields.next().ok_or(MissingField("server origin id"))?,
        )?;

        let process_id = fields
            .next()
            .filter(|f| !f.is_empty())
            .ok_or(MissingField("process id"))?
            .to_string();

        let credentials = if secured {
            let username = fields
                .next()
                .filter(|f| !f.is_empty())
                .ok_or(MissingField("username"))?;
            let secret = fields.next().ok_or(MissingField("secret"))?;
            Some(Credentials::new(username, secret))
        } else {
            if let Some(rest) = fields.next() {
                Err(TrailingFields(rest.to_string()))?
            }
            None
        };

        Ok(Self {
            channel,
            server_origin,
            process_id,
            credentials,
        })
    }

    /// Renders the wire token. Credentials and the secured suffix are only
    /// written when `include_credentials` is set and the identity has them.
    pub fn to_token(&self, include_credentials: bool) -> String {
        let mut token = format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.channel, self.server_origin, self.process_id
        );
        if include_credentials {
            if let Some(credentials) = &self.credentials {
                // writing into a String can't fail
                let _ = write!(
                    token,
                    "{SEPARATOR}{}{SEPARATOR}{}{SECURED_SUFFIX}",
                    credentials.username, credentials.secret
                );
            }
        }
        token
    }

    /// The token sent over the wire, secured if this identity is.
    pub fn token(&self) -> String {
        self.to_token(self.is_secured())
    }

    pub fn channel(&self) -> u64 {
        self.channel
    }

    pub fn server_origin(&self) -> &ServerOriginId {
        &self.server_origin
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.username.as_str())
    }

    pub fn is_secured(&self) -> bool {
        self.credentials.is_some()
    }
}

/// Log-safe rendering: never includes the secret.
impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_token(false))?;
        if let Some(username) = self.username() {
            write!(f, "({username})")?;
        }
        Ok(())
    }
}

impl FromStr for ConnectionIdentity {
    type Err = MalformedIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn validate_process_id(process_id: &str) -> Result<(), MalformedIdentity> {
    if process_id.is_empty() {
        Err(MalformedIdentity::MissingField("process id"))?
    }
    if process_id.contains(SEPARATOR) {
        Err(MalformedIdentity::IllegalSeparator("process id"))?
    }
    Ok(())
}

fn validate_username(username: &str) -> Result<(), MalformedIdentity> {
    if username.is_empty() {
        Err(MalformedIdentity::MissingField("username"))?
    }
    if username.contains(SEPARATOR) {
        Err(MalformedIdentity::IllegalSeparator("username"))?
    }
    Ok(())
}

/// Returns an identifier for the running process, used to group the logical
/// connections a client process opens.
pub fn local_process_id() -> String {
    format!("{}-{:08x}", std::process::id(), rand::random::<u32>())
}

/// Mints identities on behalf of one server epoch.
pub struct IdentityFactory {
    origin: ServerOriginId,
    next_channel: AtomicU64,
}

impl IdentityFactory {
    pub fn new(origin: ServerOriginId) -> Self {
        Self {
            origin,
            next_channel: AtomicU64::new(1),
        }
    }

    /// Makes sure freshly minted channels never collide with `channel`, e.g.
    /// one restored from a rebuild set.
    pub fn reserve(&self, channel: u64) {
        self.next_channel
            .fetch_max(channel.saturating_add(1), Ordering::SeqCst);
    }

    pub fn mint(
        &self,
        process_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<ConnectionIdentity, MalformedIdentity> {
        let channel = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let identity =
            ConnectionIdentity::new(channel, self.origin.clone(), process_id)?;
        match credentials {
            Some(credentials) => identity.with_credentials(credentials),
            None => Ok(identity),
        }
    }

    pub fn origin(&self) -> &ServerOriginId {
        &self.origin
    }

    /// True if the identity was minted by this server epoch.
    pub fn owns(&self, identity: &ConnectionIdentity) -> bool {
        identity.server_origin == self.origin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "0123456789abcdef0123456789ABCDEF";

    fn origin() -> ServerOriginId {
        ServerOriginId::parse(ORIGIN).unwrap()
    }

    #[test]
    fn unsecured_round_trip() {
        let id = ConnectionIdentity::new(42, origin(), "1234-jvm").unwrap();
        let token = id.token();
        assert_eq!(token, format!("42.{ORIGIN}.1234-jvm"));
        assert_eq!(ConnectionIdentity::parse(&token).unwrap(), id);
    }

    #[test]
    fn secured_round_trip_keeps_credentials() {
        let id = ConnectionIdentity::new(7, origin(), "p1")
            .unwrap()
            .with_credentials(Credentials::new("alice", "s.e.c"))
            .unwrap();
        let token = id.token();
        assert!(token.ends_with(".!"));
        let parsed = ConnectionIdentity::parse(&token).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.credentials().unwrap().secret, "s.e.c");
    }

    #[test]
    fn empty_secret_is_present_but_empty() {
        let token = format!("3.{ORIGIN}.p1.bob..!");
        let id = ConnectionIdentity::parse(&token).unwrap();
        assert!(id.is_secured());
        assert_eq!(id.credentials().unwrap().secret, "");
        assert_eq!(id.token(), token);
    }

    #[test]
    fn unsecured_token_omits_credentials() {
        let id = ConnectionIdentity::new(7, origin(), "p1")
            .unwrap()
            .with_credentials(Credentials::new("alice", "secret"))
            .unwrap();
        let plain = id.to_token(false);
        assert_eq!(plain, format!("7.{ORIGIN}.p1"));
        let parsed = ConnectionIdentity::parse(&plain).unwrap();
        assert!(!parsed.is_secured());
        assert_ne!(parsed, id);
    }

    #[test]
    fn display_never_leaks_secret() {
        let id = ConnectionIdentity::new(7, origin(), "p1")
            .unwrap()
            .with_credentials(Credentials::new("alice", "hunter2"))
            .unwrap();
        let shown = id.to_string();
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
        assert!(!format!("{:?}", id).contains("hunter2"));
    }

    #[test]
    fn rejects_malformed_tokens() {
        use MalformedIdentity::*;

        let cases = [
            (String::new(), Empty),
            (format!("-1.{ORIGIN}.p"), ChannelNumber("-1".into())),
            (format!("+1.{ORIGIN}.p"), ChannelNumber("+1".into())),
            (format!("x.{ORIGIN}.p"), ChannelNumber("x".into())),
            (
                "99999999999999999999999.0123456789abcdef0123456789abcdef.p"
                    .into(),
                ChannelNumber("99999999999999999999999".into()),
            ),
            ("1.abc.p".into(), ServerOrigin("abc".into())),
            (
                "1.0123456789abcdef0123456789abcdeg.p".into(),
                ServerOrigin("0123456789abcdef0123456789abcdeg".into()),
            ),
            (format!("1.{ORIGIN}"), MissingField("process id")),
            (format!("1.{ORIGIN}."), MissingField("process id")),
            (format!(".{ORIGIN}.p"), MissingField("channel number")),
            (format!("1.{ORIGIN}.p.!"), MissingField("username")),
            (format!("1.{ORIGIN}.p.bob.!"), MissingField("secret")),
            (format!("1.{ORIGIN}.p.bob.pw"), TrailingFields("bob.pw".into())),
        ];
        for (token, expected) in cases {
            assert_eq!(
                ConnectionIdentity::parse(&token),
                Err(expected),
                "{token}"
            );
        }
    }

    #[test]
    fn process_id_may_not_contain_separator() {
        assert_eq!(
            ConnectionIdentity::new(1, origin(), "host.example"),
            Err(MalformedIdentity::IllegalSeparator("process id"))
        );
    }

    #[test]
    fn generated_origins_are_valid_and_distinct() {
        let a = ServerOriginId::generate();
        let b = ServerOriginId::generate();
        assert_eq!(a.as_str().len(), SERVER_ORIGIN_ID_LEN);
        assert!(ServerOriginId::parse(a.as_str()).is_ok());
        assert_ne!(a, b);
    }

    #[test]
    fn factory_mints_monotonic_channels() {
        let factory = IdentityFactory::new(origin());
        let a = factory.mint("p1", None).unwrap();
        let b = factory.mint("p1", None).unwrap();
        assert!(b.channel() > a.channel());
        assert!(factory.owns(&a));

        factory.reserve(100);
        assert_eq!(factory.mint("p2", None).unwrap().channel(), 101);

        let foreign = ConnectionIdentity::new(
            1,
            ServerOriginId::generate(),
            "p1",
        )
        .unwrap();
        assert!(!factory.owns(&foreign));
    }
}
