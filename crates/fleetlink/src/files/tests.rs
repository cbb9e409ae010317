//! Unit tests for the remote file helpers

use super::*;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// In-memory remote host understanding `mv --force 'a' 'b'`
#[derive(Default)]
struct MemoryFs {
    nodes: Mutex<BTreeMap<String, Node>>,
    commands: Mutex<Vec<String>>,
    writes: Mutex<Vec<String>>,
    failing_mv: bool,
    /// `mv` cannot even be started
    broken_shell: bool,
    /// Writes leave a truncated file and fail
    failing_write: bool,
    /// Metadata reports one byte for every file, as if it grew since
    stale_sizes: bool,
}

impl MemoryFs {
    fn with_dir(self, path: &str) -> Self {
        self.nodes.lock().insert(path.to_string(), Node::Dir);
        self
    }

    fn with_file(self, path: &str, contents: &[u8]) -> Self {
        self.nodes
            .lock()
            .insert(path.to_string(), Node::File(contents.to_vec()));
        self
    }

    fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(path) {
            Some(Node::File(contents)) => Some(contents.clone()),
            _ => None,
        }
    }

    fn temp_files(&self) -> usize {
        self.nodes
            .lock()
            .keys()
            .filter(|path| path.starts_with("/tmp/"))
            .count()
    }
}

#[async_trait]
impl RemoteShell for MemoryFs {
    async fn run(
        &self,
        command: &str,
        _cancel: &CancellationToken,
    ) -> std::result::Result<CommandResult, TransportError> {
        self.commands.lock().push(command.to_string());
        if self.broken_shell {
            return Err(TransportError::Channel("channel open refused".to_string()));
        }
        let mut result = CommandResult::new(command);

        let parts: Vec<&str> = command.split('\'').collect();
        if !command.starts_with("mv --force ") || parts.len() != 5 || self.failing_mv {
            result.code = 1;
            result.stderr = b"mv: cannot move\n".to_vec();
            return Ok(result);
        }

        let (from, to) = (parts[1], parts[3]);
        let mut nodes = self.nodes.lock();
        match nodes.remove(from) {
            Some(node) => {
                nodes.insert(to.to_string(), node);
            }
            None => result.code = 1,
        }
        Ok(result)
    }
}

#[async_trait]
impl RemoteFs for MemoryFs {
    async fn metadata(
        &self,
        path: &str,
    ) -> std::result::Result<Option<RemoteMetadata>, TransportError> {
        Ok(self.nodes.lock().get(path).map(|node| match node {
            Node::Dir => RemoteMetadata {
                is_dir: true,
                size: 4096,
                modified: Some(1_614_600_000),
            },
            Node::File(contents) => RemoteMetadata {
                is_dir: false,
                size: if self.stale_sizes { 1 } else { contents.len() as u64 },
                modified: Some(1_614_600_000),
            },
        }))
    }

    async fn read(&self, path: &str, limit: u64) -> std::result::Result<Vec<u8>, TransportError> {
        let mut contents = self
            .file(path)
            .ok_or_else(|| TransportError::NotFound(path.to_string()))?;
        contents.truncate(limit.saturating_add(1) as usize);
        Ok(contents)
    }

    async fn write(&self, path: &str, contents: &[u8]) -> std::result::Result<(), TransportError> {
        self.writes.lock().push(path.to_string());
        if self.failing_write {
            let partial = contents[..contents.len() / 2].to_vec();
            self.nodes
                .lock()
                .insert(path.to_string(), Node::File(partial));
            return Err(TransportError::Sftp {
                path: path.to_string(),
                message: "connection lost".to_string(),
            });
        }
        self.nodes
            .lock()
            .insert(path.to_string(), Node::File(contents.to_vec()));
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> std::result::Result<(), TransportError> {
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(path) {
            return Err(TransportError::Sftp {
                path: path.to_string(),
                message: "Failure".to_string(),
            });
        }
        nodes.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> std::result::Result<bool, TransportError> {
        Ok(self.nodes.lock().remove(path).is_some())
    }
}

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn test_read_file() {
    let fs = MemoryFs::default().with_file("/etc/hostname", b"web-1\n");

    let file = read(&fs, "/etc/hostname", DEFAULT_READ_LIMIT).await.unwrap();

    assert_eq!(file.contents, b"web-1\n");
    assert_eq!(file.size, 6);
    assert_eq!(file.mod_time, "2021-03-01T12:00:00Z");
}

#[tokio::test]
async fn test_read_rejects_directory() {
    let fs = MemoryFs::default().with_dir("/etc");
    assert!(matches!(
        read(&fs, "/etc", DEFAULT_READ_LIMIT).await,
        Err(FleetlinkError::IsDirectory(_))
    ));
}

#[tokio::test]
async fn test_read_rejects_oversize() {
    let fs = MemoryFs::default().with_file("/var/log/big.log", &[b'x'; 11]);

    match read(&fs, "/var/log/big.log", 10).await {
        Err(FleetlinkError::FileTooBig { size, max, .. }) => {
            assert_eq!(size, 11);
            assert_eq!(max, 10);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_read_rejects_file_grown_since_stat() {
    let fs = MemoryFs {
        stale_sizes: true,
        ..Default::default()
    }
    .with_file("/var/log/big.log", &[b'x'; 64]);

    match read(&fs, "/var/log/big.log", 10).await {
        Err(FleetlinkError::FileTooBig { size, max, .. }) => {
            assert_eq!(size, 11);
            assert_eq!(max, 10);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_read_missing_file() {
    let fs = MemoryFs::default();
    match read(&fs, "/nope", DEFAULT_READ_LIMIT).await {
        Err(FleetlinkError::FileRead { source, .. }) => {
            assert!(matches!(source, TransportError::NotFound(_)));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_read_empty_file() {
    let fs = MemoryFs::default().with_file("/etc/empty", b"");
    let file = read(&fs, "/etc/empty", DEFAULT_READ_LIMIT).await.unwrap();
    assert!(file.contents.is_empty());
    assert_eq!(file.size, 0);
}

#[tokio::test]
async fn test_write_goes_through_temp_file() {
    let fs = MemoryFs::default().with_file("/etc/app.conf", b"old");

    write(&fs, "/etc/app.conf", b"new", &cancel()).await.unwrap();

    assert_eq!(fs.file("/etc/app.conf").unwrap(), b"new");
    assert_eq!(fs.temp_files(), 0);

    let writes = fs.writes.lock().clone();
    assert_eq!(writes.len(), 1);
    assert!(writes[0].starts_with("/tmp/"));

    let commands = fs.commands.lock().clone();
    assert_eq!(
        commands,
        vec![format!("mv --force '{}' '/etc/app.conf'", writes[0])]
    );
}

#[tokio::test]
async fn test_written_contents_read_back() {
    let fs = MemoryFs::default().with_dir("/srv");
    let cases: [(&str, &[u8]); 3] = [
        ("/srv/empty", b""),
        ("/srv/blob.bin", &[0xff, 0x00, 0xfe, 0x80, b'\n', 0xc3]),
        ("/srv/app.conf", b"listen = 8080\n"),
    ];

    for (path, contents) in cases {
        write(&fs, path, contents, &cancel()).await.unwrap();

        let file = read(&fs, path, DEFAULT_READ_LIMIT).await.unwrap();
        assert_eq!(file.contents, contents, "{path}");
        assert_eq!(file.size, contents.len() as u64, "{path}");
    }
    assert_eq!(fs.temp_files(), 0);
}

#[tokio::test]
async fn test_failed_temp_write_is_cleaned_up() {
    let fs = MemoryFs {
        failing_write: true,
        ..Default::default()
    }
    .with_file("/etc/app.conf", b"old");

    let result = write(&fs, "/etc/app.conf", b"new contents", &cancel()).await;

    assert!(matches!(result, Err(FleetlinkError::FileWrite { .. })));
    assert_eq!(fs.file("/etc/app.conf").unwrap(), b"old");
    assert_eq!(fs.temp_files(), 0);
    assert!(fs.commands.lock().is_empty());
}

#[tokio::test]
async fn test_unstartable_move_is_cleaned_up() {
    let fs = MemoryFs {
        broken_shell: true,
        ..Default::default()
    }
    .with_file("/etc/app.conf", b"old");

    let result = write(&fs, "/etc/app.conf", b"new", &cancel()).await;

    match result {
        Err(FleetlinkError::Command { command, source }) => {
            assert!(command.starts_with("mv --force '/tmp/"));
            assert!(matches!(source, TransportError::Channel(_)));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(fs.file("/etc/app.conf").unwrap(), b"old");
    assert_eq!(fs.temp_files(), 0);
}

#[tokio::test]
async fn test_failed_move_is_an_error() {
    let fs = MemoryFs {
        failing_mv: true,
        ..Default::default()
    }
    .with_file("/etc/app.conf", b"old");

    let result = write(&fs, "/etc/app.conf", b"new", &cancel()).await;

    match result {
        Err(FleetlinkError::FileWrite { source, .. }) => {
            assert!(source.to_string().contains("mv: cannot move"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(fs.file("/etc/app.conf").unwrap(), b"old");
    assert_eq!(fs.temp_files(), 0);
}

#[tokio::test]
async fn test_upsert_creates_missing_file() {
    let fs = MemoryFs::default().with_dir("/etc");

    let updated = upsert(&fs, "/etc/app.conf", false, b"x=1", &cancel())
        .await
        .unwrap();

    assert!(updated);
    assert_eq!(fs.file("/etc/app.conf").unwrap(), b"x=1");
}

#[tokio::test]
async fn test_upsert_identical_contents_is_noop() {
    let fs = MemoryFs::default().with_file("/etc/app.conf", b"x=1");

    let updated = upsert(&fs, "/etc/app.conf", false, b"x=1", &cancel())
        .await
        .unwrap();

    assert!(!updated);
    assert!(fs.writes.lock().is_empty());
    assert!(fs.commands.lock().is_empty());
}

#[tokio::test]
async fn test_upsert_same_size_different_bytes() {
    let fs = MemoryFs::default().with_file("/etc/app.conf", b"x=1");

    let updated = upsert(&fs, "/etc/app.conf", false, b"x=2", &cancel())
        .await
        .unwrap();

    assert!(updated);
    assert_eq!(fs.file("/etc/app.conf").unwrap(), b"x=2");
}

#[tokio::test]
async fn test_upsert_rejects_directory() {
    let fs = MemoryFs::default().with_dir("/etc/app.conf");
    assert!(matches!(
        upsert(&fs, "/etc/app.conf", false, b"x", &cancel()).await,
        Err(FleetlinkError::IsDirectory(_))
    ));
}

#[tokio::test]
async fn test_upsert_creates_parent_directories() {
    let fs = MemoryFs::default();

    let updated = upsert(&fs, "/srv/app/conf.d/app.conf", true, b"x=1", &cancel())
        .await
        .unwrap();

    assert!(updated);
    let nodes = fs.nodes.lock();
    assert_eq!(nodes.get("/srv"), Some(&Node::Dir));
    assert_eq!(nodes.get("/srv/app"), Some(&Node::Dir));
    assert_eq!(nodes.get("/srv/app/conf.d"), Some(&Node::Dir));
}

#[tokio::test]
async fn test_ensure_directory_refuses_file_in_the_way() {
    let fs = MemoryFs::default().with_file("/srv", b"not a dir");

    match ensure_directory(&fs, "/srv/app").await {
        Err(FleetlinkError::NotADirectory(path)) => assert_eq!(path, "/srv"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_ensure_directory_existing() {
    let fs = MemoryFs::default().with_dir("/srv");
    ensure_directory(&fs, "/srv").await.unwrap();
    assert!(matches!(
        ensure_directory(&MemoryFs::default().with_file("/srv", b""), "/srv").await,
        Err(FleetlinkError::NotADirectory(_))
    ));
}

#[tokio::test]
async fn test_delete_missing_is_not_an_error() {
    let fs = MemoryFs::default().with_file("/tmp/x", b"1");
    assert!(delete(&fs, "/tmp/x").await.unwrap());
    assert!(!delete(&fs, "/tmp/x").await.unwrap());
}

#[test]
fn test_parent_dir() {
    assert_eq!(parent_dir("/etc/app/app.conf"), "/etc/app");
    assert_eq!(parent_dir("/app.conf"), "/");
    assert_eq!(parent_dir("/"), "/");
    assert_eq!(parent_dir("app.conf"), ".");
    assert_eq!(parent_dir("conf/app.conf"), "conf");
    assert_eq!(parent_dir("/etc/app/"), "/etc");
}

#[test]
fn test_shell_quote() {
    assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
}

#[test]
fn test_contents_serialize_as_base64() {
    let file = FileContents {
        contents: b"web-1\n".to_vec(),
        mod_time: "2021-03-01T12:00:00Z".to_string(),
        size: 6,
    };
    let json = serde_json::to_value(&file).unwrap();
    assert_eq!(json["contents"], "d2ViLTEK");
    assert_eq!(json["size"], 6);
}
