//! Remote command execution with a hard timeout

use crate::TransportError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use russh::{client, Channel, ChannelMsg, Sig};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Value of [`CommandResult::error`] when the command outlived its timeout
pub const TIMEOUT_MARKER: &str = "timeout";

/// Outcome of one remote command.
///
/// A nonzero exit is data (`code`), not an error. A process killed by a
/// signal reports `128 + signal number`. `error` is only set for out-of-band
/// outcomes such as [`TIMEOUT_MARKER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Command text as sent
    pub command: String,
    /// Captured standard output
    #[serde(with = "base64_bytes")]
    pub stdout: Vec<u8>,
    /// Captured standard error
    #[serde(with = "base64_bytes")]
    pub stderr: Vec<u8>,
    /// Remote exit code
    pub code: i32,
    /// Out-of-band outcome marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    /// Empty result for `command`
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            code: 0,
            error: None,
        }
    }

    /// Result reported when the command did not exit in time
    pub fn timed_out(command: impl Into<String>) -> Self {
        Self {
            error: Some(TIMEOUT_MARKER.to_string()),
            ..Self::new(command)
        }
    }

    /// Whether the command timed out
    pub fn is_timeout(&self) -> bool {
        self.error.as_deref() == Some(TIMEOUT_MARKER)
    }

    /// Exited with code 0 and no out-of-band error
    pub fn success(&self) -> bool {
        self.code == 0 && self.error.is_none()
    }

    /// Standard output decoded lossily
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded lossily
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// One event read from an exec channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    /// Bytes on standard output
    Stdout(Bytes),
    /// Bytes on standard error
    Stderr(Bytes),
    /// Process exited with a status
    ExitStatus(u32),
    /// Process was killed by the named signal (`KILL`, `TERM`, ...)
    ExitSignal(String),
    /// Server refused the exec request
    Refused,
    /// Remote side will send no more data
    Eof,
}

/// A channel able to run one command
#[async_trait]
pub trait ExecChannel: Send {
    /// Start `command`
    async fn exec(&mut self, command: &str) -> Result<(), TransportError>;

    /// Next event, or `None` once the channel is closed
    async fn next_event(&mut self) -> Option<ExecEvent>;

    /// Close the channel
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl ExecChannel for Channel<client::Msg> {
    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        Channel::exec(self, true, command).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ExecEvent> {
        loop {
            let event = match self.wait().await? {
                ChannelMsg::Data { data } => ExecEvent::Stdout(Bytes::copy_from_slice(&data)),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    ExecEvent::Stderr(Bytes::copy_from_slice(&data))
                }
                ChannelMsg::ExitStatus { exit_status } => ExecEvent::ExitStatus(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    ExecEvent::ExitSignal(match signal_name {
                        Sig::Custom(name) => name,
                        other => format!("{other:?}"),
                    })
                }
                ChannelMsg::Failure => ExecEvent::Refused,
                ChannelMsg::Eof => ExecEvent::Eof,
                ChannelMsg::Close => return None,
                _ => continue,
            };
            return Some(event);
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Channel::close(self).await?;
        Ok(())
    }
}

/// Run `command` on `channel`, racing its exit against `timeout` and `cancel`.
///
/// Output is collected until the exit status arrives, then drained until the
/// channel closes. The whole run, drain included, is bounded by `timeout`:
/// if the process exited but the channel is still open at the deadline (a
/// background child holding its stdout), the exit code and the output read so
/// far are returned without the timeout marker. The channel is closed on
/// every path.
pub async fn run_command<C>(
    mut channel: C,
    command: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandResult, TransportError>
where
    C: ExecChannel,
{
    debug!("Running '{}'", command);
    let outcome = drive(&mut channel, command, timeout, cancel).await;

    if let Err(e) = channel.close().await {
        debug!("Closing channel for '{}' failed: {}", command, e);
    }

    match &outcome {
        Ok(result) if result.is_timeout() => warn!("'{}' timed out after {:?}", command, timeout),
        Ok(result) => debug!("'{}' exited with {}", command, result.code),
        Err(e) => debug!("'{}' failed: {}", command, e),
    }
    outcome
}

async fn drive<C>(
    channel: &mut C,
    command: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandResult, TransportError>
where
    C: ExecChannel,
{
    let fault = |message: &str| TransportError::CommandFailed {
        command: command.to_string(),
        message: message.to_string(),
    };

    channel.exec(command).await?;

    let mut result = CommandResult::new(command);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let code = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = &mut deadline => return Ok(CommandResult::timed_out(command)),
            event = channel.next_event() => event,
        };

        match event {
            Some(ExecEvent::Stdout(data)) => result.stdout.extend_from_slice(&data),
            Some(ExecEvent::Stderr(data)) => result.stderr.extend_from_slice(&data),
            Some(ExecEvent::ExitStatus(code)) => break code as i32,
            Some(ExecEvent::ExitSignal(signal)) => {
                debug!("'{}' terminated by signal {}", command, signal);
                break signal_exit_code(&signal);
            }
            Some(ExecEvent::Refused) => return Err(fault("exec request refused")),
            Some(ExecEvent::Eof) => {}
            None => return Err(fault("channel closed without an exit status")),
        }
    };
    result.code = code;

    // Output sent after the exit status still belongs to the result
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = &mut deadline => {
                warn!("'{}' exited but its channel is still open, returning early", command);
                break;
            }
            event = channel.next_event() => event,
        };

        match event {
            Some(ExecEvent::Stdout(data)) => result.stdout.extend_from_slice(&data),
            Some(ExecEvent::Stderr(data)) => result.stderr.extend_from_slice(&data),
            Some(_) => {}
            None => break,
        }
    }

    Ok(result)
}

/// Exit code reported for a process killed by `signal`.
///
/// Unknown signals report 128.
pub fn signal_exit_code(signal: &str) -> i32 {
    let number = match signal {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "ABRT" => 6,
        "FPE" => 8,
        "KILL" => 9,
        "USR1" => 10,
        "SEGV" => 11,
        "USR2" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        _ => 0,
    };
    128 + number
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
