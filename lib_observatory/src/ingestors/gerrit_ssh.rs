//! # Gerrit SSH Transport
//!
//! Dials the Gerrit SSH daemon, authenticates with a private key and runs
//! `gerrit stream-events` in a session channel. Channel data is the event
//! stream; extended data (stderr) is the diagnostic stream.
//!
//! `stream-events` can stay silent for hours, so a dead peer is only noticed
//! through SSH keepalives: once `keepalive_max` of them go unanswered the
//! connection is torn down, the session ends and the link reports
//! `Disconnected`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg};
use russh_keys::key::{KeyPair, PublicKey};

use super::event_stream::IngestError;
use super::transport::{EventLink, EventSession, EventTransport, SessionOutput};

/// The command whose output is the event stream.
pub const STREAM_EVENTS_COMMAND: &str = "gerrit stream-events";
/// Default pause between keepalive requests on an idle connection.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Default number of unanswered keepalives before the connection is dropped.
pub const DEFAULT_KEEPALIVE_MAX: usize = 3;

/// Where and how to reach the Gerrit SSH daemon.
#[derive(Debug, Clone)]
pub struct GerritSshConfig {
    /// Server host name.
    pub host: String,
    /// Gerrit SSH daemon port.
    pub port: u16,
    /// Account the key belongs to.
    pub user: String,
    /// Unencrypted private key used for public-key authentication.
    pub private_key: PathBuf,
    /// Remote command to execute.
    pub command: String,
    /// Keepalive period; `None` disables keepalives and with them dead-peer detection.
    pub keepalive_interval: Option<Duration>,
    /// Unanswered keepalives tolerated before the connection is dropped.
    pub keepalive_max: usize,
}

impl GerritSshConfig {
    /// The `russh` client settings for this server.
    pub fn client_config(&self) -> client::Config {
        client::Config {
            keepalive_interval: self.keepalive_interval,
            keepalive_max: self.keepalive_max,
            ..client::Config::default()
        }
    }
}

impl Default for GerritSshConfig {
    fn default() -> Self {
        Self {
            host: "git.example.com".to_string(),
            port: 29418,
            user: "autodeploy".to_string(),
            private_key: PathBuf::from("./.id_rsa"),
            command: STREAM_EVENTS_COMMAND.to_string(),
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            keepalive_max: DEFAULT_KEEPALIVE_MAX,
        }
    }
}

/// Accepts whatever host key the server presents.
struct AcceptHostKey {
    host: String,
}

#[async_trait]
impl client::Handler for AcceptHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        tracing::debug!(
            target: "ingest",
            "accepting unverified {} host key from {}",
            server_public_key.name(),
            self.host
        );
        Ok(true)
    }
}

/// `EventTransport` over SSH.
pub struct GerritSshTransport {
    config: GerritSshConfig,
    key: Arc<KeyPair>,
    ssh: Arc<client::Config>,
}

impl GerritSshTransport {
    /// Loads the private key. A missing or unreadable key is fatal.
    pub fn new(config: GerritSshConfig) -> Result<Self, IngestError> {
        let key = russh_keys::load_secret_key(&config.private_key, None).map_err(|e| IngestError::KeyLoad {
            path: config.private_key.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            ssh: Arc::new(config.client_config()),
            config,
            key: Arc::new(key),
        })
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

#[async_trait]
impl EventTransport for GerritSshTransport {
    type Link = GerritSshLink;

    async fn connect(&self) -> Result<GerritSshLink, IngestError> {
        let addr = self.addr();

        // Resolve separately so a bad host name is told apart from a refused dial.
        let resolved: Vec<_> = tokio::net::lookup_host(addr.as_str())
            .await
            .map_err(|e| IngestError::UnresolvableHost {
                host: self.config.host.clone(),
                reason: e.to_string(),
            })?
            .collect();
        if resolved.is_empty() {
            return Err(IngestError::UnresolvableHost {
                host: self.config.host.clone(),
                reason: "no addresses".to_string(),
            });
        }

        let handler = AcceptHostKey {
            host: self.config.host.clone(),
        };
        let mut handle = client::connect(Arc::clone(&self.ssh), &resolved[..], handler)
            .await
            .map_err(|e| IngestError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let accepted = handle
            .authenticate_publickey(self.config.user.as_str(), Arc::clone(&self.key))
            .await
            .map_err(|e| IngestError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        if !accepted {
            return Err(IngestError::AuthenticationRejected(self.config.user.clone()));
        }

        Ok(GerritSshLink {
            handle,
            command: self.config.command.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("ssh://{}@{}", self.config.user, self.addr())
    }
}

/// An authenticated SSH connection. Dropping it closes the connection.
pub struct GerritSshLink {
    handle: Handle<AcceptHostKey>,
    command: String,
}

impl GerritSshLink {
    fn session_error(&self, e: russh::Error) -> IngestError {
        if self.handle.is_closed() {
            IngestError::Disconnected(e.to_string())
        } else {
            IngestError::Channel(e.to_string())
        }
    }
}

#[async_trait]
impl EventLink for GerritSshLink {
    type Session = GerritSshSession;

    async fn open_session(&mut self) -> Result<GerritSshSession, IngestError> {
        if self.handle.is_closed() {
            return Err(IngestError::Disconnected("ssh connection closed".to_string()));
        }
        let channel = match self.handle.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => return Err(self.session_error(e)),
        };
        if let Err(e) = channel.exec(true, self.command.as_str()).await {
            return Err(self.session_error(e));
        }
        Ok(GerritSshSession { channel })
    }
}

/// A `gerrit stream-events` command running in a session channel.
pub struct GerritSshSession {
    channel: Channel<Msg>,
}

#[async_trait]
impl EventSession for GerritSshSession {
    async fn next_output(&mut self) -> Option<SessionOutput> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(SessionOutput::Events(data.to_vec())),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    return Some(SessionOutput::Diagnostics(data.to_vec()))
                }
                ChannelMsg::ExitStatus { exit_status } => return Some(SessionOutput::Exited(exit_status)),
                ChannelMsg::Eof | ChannelMsg::Close => return None,
                _ => continue,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.close().await {
            tracing::debug!(target: "ingest", "closing event session: {}", e);
        }
    }
}
