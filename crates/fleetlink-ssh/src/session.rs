//! Authenticated SSH session and its derived protocol clients

use crate::docker::{EngineClient, TunnelDialer};
use crate::exec::{run_command, CommandResult};
use crate::sftp::FileTransfer;
use crate::{Credentials, TransportError};
use async_trait::async_trait;
use fleetlink_proto::BusConnection;
use russh::client::{self, Handle};
use russh::keys::{decode_secret_key, HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelStream, Disconnect};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Command used to learn the remote user id
const UID_COMMAND: &str = "id -u";

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Limit for dialing and authenticating
    pub connect_timeout: Duration,
    /// Limit for each remote command
    pub command_timeout: Duration,
    /// SSH keepalive interval, `None` to disable
    pub keepalive_interval: Option<Duration>,
    /// Docker Engine socket on the remote host
    pub docker_socket: String,
    /// systemd private bus socket on the remote host
    pub systemd_socket: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            keepalive_interval: Some(Duration::from_secs(30)),
            docker_socket: "/var/run/docker.sock".to_string(),
            systemd_socket: "/run/systemd/private".to_string(),
        }
    }
}

/// Client-side protocol callbacks
pub struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        // Host keys are not pinned; trust is carried by the signed credentials
        debug!("Accepting host key {}", server_public_key.algorithm());
        async { Ok(true) }
    }
}

type SshHandle = Handle<ClientHandler>;

/// Stream to a unix socket on the remote host
pub type TunnelStream = ChannelStream<client::Msg>;

/// Bus connection to the remote systemd instance
pub type ServiceBus = BusConnection<TunnelStream>;

/// Opens `direct-streamlocal` channels on the session
pub struct SshTunnel {
    handle: Arc<Mutex<SshHandle>>,
}

#[async_trait]
impl TunnelDialer for SshTunnel {
    type Stream = TunnelStream;

    async fn dial(&self, socket_path: &str) -> Result<Self::Stream, TransportError> {
        let channel = self
            .handle
            .lock()
            .await
            .channel_open_direct_streamlocal(socket_path)
            .await
            .map_err(|e| TransportError::Channel(format!("{socket_path}: {e}")))?;
        Ok(channel.into_stream())
    }
}

/// One authenticated SSH connection and everything derived from it
pub struct SshSession {
    id: String,
    handle: Arc<Mutex<SshHandle>>,
    files: FileTransfer,
    shell: Mutex<Option<Channel<client::Msg>>>,
    engine: EngineClient<SshTunnel>,
    bus: Mutex<Option<Arc<ServiceBus>>>,
    uid: u32,
    config: SessionConfig,
    closed: AtomicBool,
}

impl SshSession {
    /// Dial, authenticate and derive the session's clients.
    ///
    /// Dial and authentication are bounded by `config.connect_timeout`. If any
    /// derivation step fails the transport is disconnected before returning.
    pub async fn connect(
        credentials: &Credentials,
        config: SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, TransportError> {
        credentials.validate()?;
        let key = parse_key(credentials)?;
        let id = credentials.id();

        info!("Connecting to {}", id);
        let handle = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = tokio::time::timeout(config.connect_timeout, dial(credentials, key, &config)) => {
                result.map_err(|_| TransportError::Timeout(id.clone()))??
            }
        };
        let handle = Arc::new(Mutex::new(handle));

        match Self::derive(id.clone(), handle.clone(), config, cancel).await {
            Ok(session) => {
                info!("Connected to {} (uid {})", id, session.uid);
                Ok(session)
            }
            Err(e) => {
                warn!("Setting up session for {} failed: {}", id, e);
                let guard = handle.lock().await;
                if let Err(e) = guard.disconnect(Disconnect::ByApplication, "", "en").await {
                    debug!("Disconnect from {} failed: {}", id, e);
                }
                Err(e)
            }
        }
    }

    async fn derive(
        id: String,
        handle: Arc<Mutex<SshHandle>>,
        config: SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, TransportError> {
        let (shell, sftp_channel, uid_channel) = {
            let guard = handle.lock().await;
            (
                guard.channel_open_session().await?,
                guard.channel_open_session().await?,
                guard.channel_open_session().await?,
            )
        };

        shell.request_shell(false).await?;
        let files = FileTransfer::open(sftp_channel).await?;
        let engine = EngineClient::new(
            SshTunnel {
                handle: handle.clone(),
            },
            config.docker_socket.clone(),
        );

        let result = run_command(uid_channel, UID_COMMAND, config.command_timeout, cancel).await?;
        let uid = parse_uid(&result)?;

        Ok(Self {
            id,
            handle,
            files,
            shell: Mutex::new(Some(shell)),
            engine,
            bus: Mutex::new(None),
            uid,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// `user@host` identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remote user id
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether the session was closed or the transport dropped
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self
                .handle
                .try_lock()
                .map(|handle| handle.is_closed())
                .unwrap_or(false)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Open a fresh session channel for one command
    pub async fn exec_channel(&self) -> Result<Channel<client::Msg>, TransportError> {
        self.ensure_open()?;
        let channel = self.handle.lock().await.channel_open_session().await?;
        Ok(channel)
    }

    /// Run `command` under the configured command timeout
    pub async fn run(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, TransportError> {
        let channel = self.exec_channel().await?;
        run_command(channel, command, self.config.command_timeout, cancel).await
    }

    /// Open a stream to a unix socket on the remote host
    pub async fn open_tunnel(
        &self,
        socket_path: &str,
    ) -> Result<TunnelStream, TransportError> {
        self.ensure_open()?;
        SshTunnel {
            handle: self.handle.clone(),
        }
        .dial(socket_path)
        .await
    }

    /// SFTP client
    pub fn files(&self) -> Result<&FileTransfer, TransportError> {
        self.ensure_open()?;
        Ok(&self.files)
    }

    /// Docker Engine client
    pub fn engine(&self) -> Result<&EngineClient<SshTunnel>, TransportError> {
        self.ensure_open()?;
        Ok(&self.engine)
    }

    /// Connection to the remote systemd instance.
    ///
    /// Established on first use and reused afterwards. If the socket cannot
    /// be reached the error is returned and the session stays usable. If
    /// authentication on it fails the whole session is closed so the pool
    /// replaces it.
    pub async fn service_bus(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<ServiceBus>, TransportError> {
        self.ensure_open()?;
        let mut slot = self.bus.lock().await;
        if let Some(bus) = slot.as_ref() {
            if !bus.is_closed() {
                return Ok(bus.clone());
            }
        }

        let establish = establish_bus(self.open_tunnel(&self.config.systemd_socket), self.uid);
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = establish => result,
        };

        match result {
            Ok(bus) => {
                debug!("Service bus ready on {}", self.id);
                let bus = Arc::new(bus);
                *slot = Some(bus.clone());
                Ok(bus)
            }
            Err(BusFailure::Unreachable(e)) => {
                debug!("Service bus on {} unreachable: {}", self.id, e);
                Err(e)
            }
            Err(BusFailure::Rejected(e)) => {
                drop(slot);
                warn!("Service bus on {} rejected us, closing session: {}", self.id, e);
                if let Err(close_error) = self.close().await {
                    debug!("Closing {} failed: {}", self.id, close_error);
                }
                Err(e)
            }
        }
    }

    /// Close the bus, SFTP, shell and transport in that order.
    ///
    /// Every step is attempted; the first failure is returned. Closing an
    /// already closed session is a no-op.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing session {}", self.id);

        let mut first_error = None;
        let mut record = |result: Result<(), TransportError>| {
            if let Err(e) = result {
                warn!("Close step on {} failed: {}", self.id, e);
                first_error.get_or_insert(e);
            }
        };

        if let Some(bus) = self.bus.lock().await.take() {
            record(bus.close().await.map_err(TransportError::from));
        }
        record(self.files.close().await);
        if let Some(shell) = self.shell.lock().await.take() {
            record(shell.close().await.map_err(TransportError::from));
        }
        record(
            self.handle
                .lock()
                .await
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(TransportError::from),
        );

        first_error.map_or(Ok(()), Err)
    }
}

/// Why a service bus could not be established
#[derive(Debug)]
enum BusFailure {
    /// The bus socket could not be opened
    Unreachable(TransportError),
    /// The socket was opened but authentication failed
    Rejected(TransportError),
}

async fn establish_bus<S, F>(open: F, uid: u32) -> Result<BusConnection<S>, BusFailure>
where
    F: Future<Output = Result<S, TransportError>>,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let stream = open.await.map_err(BusFailure::Unreachable)?;
    BusConnection::handshake(stream, uid)
        .await
        .map_err(|e| BusFailure::Rejected(e.into()))
}

fn parse_key(credentials: &Credentials) -> Result<Option<PrivateKey>, TransportError> {
    credentials
        .private_key
        .as_deref()
        .filter(|key| !key.trim().is_empty())
        .map(|key| {
            decode_secret_key(key, None).map_err(|e| TransportError::InvalidKey(e.to_string()))
        })
        .transpose()
}

async fn dial(
    credentials: &Credentials,
    key: Option<PrivateKey>,
    config: &SessionConfig,
) -> Result<SshHandle, TransportError> {
    let (host, port) = credentials.address()?;
    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| TransportError::Connection(format!("{host}:{port}: {e}")))?;

    let ssh_config = client::Config {
        keepalive_interval: config.keepalive_interval,
        keepalive_max: 3,
        ..Default::default()
    };
    let mut handle = client::connect_stream(Arc::new(ssh_config), stream, ClientHandler)
        .await
        .map_err(|e| TransportError::Connection(format!("{host}:{port}: {e}")))?;

    let mut authenticated = false;
    if let Some(key) = key {
        let hash_alg = if key.algorithm().is_rsa() {
            Some(HashAlg::Sha512)
        } else {
            None
        };
        let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
        authenticated = handle
            .authenticate_publickey(credentials.username.as_str(), key)
            .await?
            .success();
    }

    if !authenticated {
        if let Some(password) = credentials.password.as_deref().filter(|p| !p.is_empty()) {
            authenticated = handle
                .authenticate_password(credentials.username.as_str(), password)
                .await?
                .success();
        }
    }

    if !authenticated {
        return Err(TransportError::Authentication(credentials.id()));
    }
    Ok(handle)
}

fn parse_uid(result: &CommandResult) -> Result<u32, TransportError> {
    if !result.success() {
        return Err(TransportError::CommandFailed {
            command: UID_COMMAND.to_string(),
            message: result
                .error
                .clone()
                .unwrap_or_else(|| format!("exit code {}", result.code)),
        });
    }
    let output = result.stdout_lossy();
    let output = output.trim();
    output
        .parse()
        .map_err(|_| TransportError::UnexpectedOutput {
            command: UID_COMMAND.to_string(),
            output: output.to_string(),
        })
}
