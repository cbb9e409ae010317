//! SFTP operations used by the file helpers

use crate::TransportError;
use russh::{client, Channel};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Attributes of a remote path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    /// Path is a directory
    pub is_dir: bool,
    /// Size in bytes
    pub size: u64,
    /// Modification time in seconds since the Unix epoch
    pub modified: Option<u64>,
}

/// SFTP client derived from a session channel
pub struct FileTransfer {
    sftp: SftpSession,
}

impl FileTransfer {
    /// Start the `sftp` subsystem on `channel`
    pub async fn open(channel: Channel<client::Msg>) -> Result<Self, TransportError> {
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| sftp_error("<subsystem>", e))?;
        Ok(Self { sftp })
    }

    /// Attributes of `path`, or `None` when it does not exist
    pub async fn metadata(&self, path: &str) -> Result<Option<RemoteMetadata>, TransportError> {
        match self.sftp.metadata(path).await {
            Ok(attrs) => Ok(Some(RemoteMetadata {
                is_dir: attrs.is_dir(),
                size: attrs.size.unwrap_or(0),
                modified: attrs.mtime.map(u64::from),
            })),
            Err(e) => match sftp_error(path, e) {
                TransportError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    /// Read the file at `path`, stopping after `limit + 1` bytes.
    ///
    /// A result longer than `limit` means the file exceeds it.
    pub async fn read(&self, path: &str, limit: u64) -> Result<Vec<u8>, TransportError> {
        let file = self.sftp.open(path).await.map_err(|e| sftp_error(path, e))?;
        let mut contents = Vec::new();
        file.take(limit.saturating_add(1))
            .read_to_end(&mut contents)
            .await?;
        Ok(contents)
    }

    /// Create or truncate `path` and write `contents` to it
    pub async fn write(&self, path: &str, contents: &[u8]) -> Result<(), TransportError> {
        let mut file = self
            .sftp
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| sftp_error(path, e))?;
        file.write_all(contents).await?;
        file.shutdown().await?;
        debug!("Wrote {} bytes to {}", contents.len(), path);
        Ok(())
    }

    /// Create one directory
    pub async fn create_dir(&self, path: &str) -> Result<(), TransportError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| sftp_error(path, e))
    }

    /// Remove a file; returns `false` when it did not exist
    pub async fn remove_file(&self, path: &str) -> Result<bool, TransportError> {
        match self.sftp.remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) => match sftp_error(path, e) {
                TransportError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    /// End the SFTP session
    pub async fn close(&self) -> Result<(), TransportError> {
        self.sftp.close().await.map_err(|e| sftp_error("<subsystem>", e))
    }
}

fn sftp_error(path: &str, error: SftpError) -> TransportError {
    match error {
        SftpError::Status(status) if matches!(status.status_code, StatusCode::NoSuchFile) => {
            TransportError::NotFound(path.to_string())
        }
        other => TransportError::Sftp {
            path: path.to_string(),
            message: other.to_string(),
        },
    }
}
