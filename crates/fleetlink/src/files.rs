//! Remote file helpers
//!
//! Writes go to a temporary file first and are moved into place with
//! `mv --force`, so the target is never left half written.

use crate::{FleetlinkError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use fleetlink_ssh::{CommandResult, RemoteMetadata, SshSession, TransportError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default upper bound for [`read`]
pub const DEFAULT_READ_LIMIT: u64 = 10_000_000;

/// Runs commands on a remote host
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` under the session's command timeout
    async fn run(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<CommandResult, TransportError>;
}

/// File access on a remote host
#[async_trait]
pub trait RemoteFs: RemoteShell {
    /// Attributes of `path`, or `None` when it does not exist
    async fn metadata(
        &self,
        path: &str,
    ) -> std::result::Result<Option<RemoteMetadata>, TransportError>;

    /// Contents of `path`, at most `limit + 1` bytes
    async fn read(&self, path: &str, limit: u64) -> std::result::Result<Vec<u8>, TransportError>;

    /// Create or truncate `path` with `contents`
    async fn write(&self, path: &str, contents: &[u8]) -> std::result::Result<(), TransportError>;

    /// Create a single directory
    async fn create_dir(&self, path: &str) -> std::result::Result<(), TransportError>;

    /// Remove a file; `false` when it did not exist
    async fn remove_file(&self, path: &str) -> std::result::Result<bool, TransportError>;
}

#[async_trait]
impl RemoteShell for SshSession {
    async fn run(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<CommandResult, TransportError> {
        SshSession::run(self, command, cancel).await
    }
}

#[async_trait]
impl RemoteFs for SshSession {
    async fn metadata(
        &self,
        path: &str,
    ) -> std::result::Result<Option<RemoteMetadata>, TransportError> {
        self.files()?.metadata(path).await
    }

    async fn read(&self, path: &str, limit: u64) -> std::result::Result<Vec<u8>, TransportError> {
        self.files()?.read(path, limit).await
    }

    async fn write(&self, path: &str, contents: &[u8]) -> std::result::Result<(), TransportError> {
        self.files()?.write(path, contents).await
    }

    async fn create_dir(&self, path: &str) -> std::result::Result<(), TransportError> {
        self.files()?.create_dir(path).await
    }

    async fn remove_file(&self, path: &str) -> std::result::Result<bool, TransportError> {
        self.files()?.remove_file(path).await
    }
}

/// A file read from a remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContents {
    /// File bytes
    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,
    /// Modification time, RFC 3339 in UTC
    pub mod_time: String,
    /// Size in bytes
    pub size: u64,
}

/// Read `path`, refusing directories and files larger than `max_size`
pub async fn read<F>(fs: &F, path: &str, max_size: u64) -> Result<FileContents>
where
    F: RemoteFs + ?Sized,
{
    debug!("Reading file at {}", path);
    let read_error = |source| FleetlinkError::FileRead {
        path: path.to_string(),
        source,
    };

    let metadata = fs
        .metadata(path)
        .await
        .map_err(read_error)?
        .ok_or_else(|| read_error(TransportError::NotFound(path.to_string())))?;

    if metadata.is_dir {
        return Err(FleetlinkError::IsDirectory(path.to_string()));
    }
    if metadata.size > max_size {
        return Err(FleetlinkError::FileTooBig {
            path: path.to_string(),
            size: metadata.size,
            max: max_size,
        });
    }

    let contents = if metadata.size > 0 {
        fs.read(path, max_size).await.map_err(read_error)?
    } else {
        Vec::new()
    };
    let size = contents.len() as u64;

    // The file may have grown since it was stat'ed
    if size > max_size {
        return Err(FleetlinkError::FileTooBig {
            path: path.to_string(),
            size,
            max: max_size,
        });
    }

    Ok(FileContents {
        size,
        mod_time: format_mod_time(metadata.modified),
        contents,
    })
}

/// Replace `path` with `contents` through a temporary file
pub async fn write<F>(fs: &F, path: &str, contents: &[u8], cancel: &CancellationToken) -> Result<()>
where
    F: RemoteFs + ?Sized,
{
    let temp_path = format!("/tmp/{}", Uuid::new_v4());
    info!("Writing file at {} via {}", path, temp_path);
    let write_error = |source| FleetlinkError::FileWrite {
        path: path.to_string(),
        source,
    };

    if let Err(e) = fs.write(&temp_path, contents).await {
        remove_temp_file(fs, &temp_path).await;
        return Err(write_error(e));
    }

    let command = format!("mv --force {} {}", shell_quote(&temp_path), shell_quote(path));
    let result = match fs.run(&command, cancel).await {
        Ok(result) => result,
        Err(source) => {
            remove_temp_file(fs, &temp_path).await;
            return Err(FleetlinkError::Command { command, source });
        }
    };

    if !result.success() {
        remove_temp_file(fs, &temp_path).await;
        let message = match result.error {
            Some(marker) => marker,
            None => result.stderr_lossy().trim().to_string(),
        };
        return Err(write_error(TransportError::CommandFailed { command, message }));
    }
    Ok(())
}

async fn remove_temp_file<F>(fs: &F, temp_path: &str)
where
    F: RemoteFs + ?Sized,
{
    if let Err(e) = fs.remove_file(temp_path).await {
        warn!("Failed to remove temp file {}: {}", temp_path, e);
    }
}

/// Make sure `path` is a directory, creating it and its parents if missing
pub async fn ensure_directory<F>(fs: &F, path: &str) -> Result<()>
where
    F: RemoteFs + ?Sized,
{
    debug!("Ensuring directory exists at {}", path);
    let write_error = |source| FleetlinkError::FileWrite {
        path: path.to_string(),
        source,
    };

    match fs.metadata(path).await.map_err(write_error)? {
        Some(metadata) if metadata.is_dir => return Ok(()),
        Some(_) => return Err(FleetlinkError::NotADirectory(path.to_string())),
        None => {}
    }

    for dir in ancestors(path) {
        match fs.metadata(&dir).await.map_err(write_error)? {
            Some(metadata) if metadata.is_dir => continue,
            Some(_) => return Err(FleetlinkError::NotADirectory(dir)),
            None => {}
        }

        if let Err(e) = fs.create_dir(&dir).await {
            // Someone else may have created it in the meantime
            match fs.metadata(&dir).await {
                Ok(Some(metadata)) if metadata.is_dir => continue,
                _ => return Err(write_error(e)),
            }
        }
    }
    Ok(())
}

/// Write `contents` to `path` unless it already holds exactly those bytes.
///
/// Returns whether the file was written. With `create_dir` the parent
/// directory is created first when a write is needed.
pub async fn upsert<F>(
    fs: &F,
    path: &str,
    create_dir: bool,
    contents: &[u8],
    cancel: &CancellationToken,
) -> Result<bool>
where
    F: RemoteFs + ?Sized,
{
    debug!("Upserting file at {}", path);
    let read_error = |source| FleetlinkError::FileRead {
        path: path.to_string(),
        source,
    };

    let needs_write = match fs.metadata(path).await.map_err(read_error)? {
        None => true,
        Some(metadata) if metadata.is_dir => {
            return Err(FleetlinkError::IsDirectory(path.to_string()));
        }
        Some(metadata) if metadata.size != contents.len() as u64 => true,
        Some(_) => {
            fs.read(path, contents.len() as u64)
                .await
                .map_err(read_error)?
                != contents
        }
    };

    if needs_write {
        if create_dir {
            ensure_directory(fs, parent_dir(path)).await?;
        }
        write(fs, path, contents, cancel).await?;
    }
    Ok(needs_write)
}

/// Delete `path`. A missing file is not an error; returns whether it existed.
pub async fn delete<F>(fs: &F, path: &str) -> Result<bool>
where
    F: RemoteFs + ?Sized,
{
    info!("Deleting file at {}", path);
    fs.remove_file(path)
        .await
        .map_err(|source| FleetlinkError::FileDelete {
            path: path.to_string(),
            source,
        })
}

/// Parent directory of a remote path, following POSIX `dirname`
pub fn parent_dir(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(pos) => trimmed[..pos].trim_end_matches('/'),
        None if path.starts_with('/') => "/",
        None => ".",
    }
}

/// Every directory from the outermost down to `path` itself
fn ancestors(path: &str) -> Vec<String> {
    let absolute = path.starts_with('/');
    let mut current = String::new();
    let mut dirs = Vec::new();
    for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(component);
        dirs.push(current.clone());
    }
    dirs
}

/// Quote `value` for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn format_mod_time(seconds: Option<u64>) -> String {
    let seconds = seconds.and_then(|s| i64::try_from(s).ok()).unwrap_or(0);
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests;
