//! Unit tests for the Docker Engine client

use super::*;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Serves one canned HTTP response per dial and records request heads
#[derive(Default)]
struct ScriptedEngine {
    responses: Mutex<VecDeque<Vec<Vec<u8>>>>,
    requests: Arc<Mutex<Vec<String>>>,
    dialed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedEngine {
    fn respond(self, parts: Vec<&str>) -> Self {
        self.responses
            .lock()
            .push_back(parts.into_iter().map(|p| p.as_bytes().to_vec()).collect());
        self
    }
}

#[async_trait]
impl TunnelDialer for ScriptedEngine {
    type Stream = DuplexStream;

    async fn dial(&self, socket_path: &str) -> Result<Self::Stream, TransportError> {
        self.dialed.lock().push(socket_path.to_string());
        let parts = self
            .responses
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::Channel("no route to socket".to_string()))?;

        let (client, mut server) = duplex(64 * 1024);
        let requests = self.requests.clone();
        tokio::spawn(async move {
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                if server.read(&mut byte).await.unwrap_or(0) == 0 {
                    return;
                }
                head.push(byte[0]);
            }
            requests.lock().push(String::from_utf8_lossy(&head).into_owned());

            for part in parts {
                if server.write_all(&part).await.is_err() {
                    return;
                }
                server.flush().await.ok();
                tokio::task::yield_now().await;
            }
        });
        Ok(client)
    }
}

fn ok_json(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

#[tokio::test]
async fn test_list_compose_containers() {
    let engine = ScriptedEngine::default().respond(vec![ok_json(r#"[{"Id":"abc"}]"#).as_str()]);
    let requests = engine.requests.clone();
    let dialed = engine.dialed.clone();
    let client = EngineClient::new(engine, "/var/run/docker.sock");

    let body = client.list_compose_containers().await.unwrap();
    assert_eq!(&body[..], br#"[{"Id":"abc"}]"#);

    let head = requests.lock()[0].clone();
    let request_line = head.lines().next().unwrap().to_string();
    assert!(request_line.starts_with("GET /containers/json?size=true&filters="));
    assert!(request_line.contains("com.docker.compose.service"));
    assert!(!request_line.contains('{'));
    assert_eq!(dialed.lock().as_slice(), ["/var/run/docker.sock"]);
}

#[tokio::test]
async fn test_every_request_dials_a_new_stream() {
    let engine = ScriptedEngine::default()
        .respond(vec![ok_json(r#"{"Id":"one"}"#).as_str()])
        .respond(vec![ok_json(r#"{"Id":"two"}"#).as_str()]);
    let dialed = engine.dialed.clone();
    let client = EngineClient::new(engine, "/var/run/docker.sock");

    client.inspect_container("one").await.unwrap();
    client.inspect_container("two").await.unwrap();
    assert_eq!(dialed.lock().len(), 2);
}

#[tokio::test]
async fn test_engine_error_message() {
    let body = r#"{"message":"No such container: nope"}"#;
    let response = format!(
        "HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let client = EngineClient::new(
        ScriptedEngine::default().respond(vec![response.as_str()]),
        "/var/run/docker.sock",
    );

    match client.inspect_container("nope").await {
        Err(TransportError::Engine { status, message }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "No such container: nope");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_lines_across_chunks() {
    let body = "{\"read\":1}\n{\"read\":2}\n\n{\"read\":3}";
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let (first, second) = body.split_at(5);
    let client = EngineClient::new(
        ScriptedEngine::default().respond(vec![head.as_str(), first, second]),
        "/var/run/docker.sock",
    );

    let mut stats = client.container_stats("web-1").await.unwrap();
    assert_eq!(stats.status(), 200);

    let mut lines = Vec::new();
    while let Some(line) = stats.next_line().await.unwrap() {
        lines.push(String::from_utf8(line.to_vec()).unwrap());
    }
    assert_eq!(lines, vec![r#"{"read":1}"#, r#"{"read":2}"#, r#"{"read":3}"#]);
}

#[tokio::test]
async fn test_dial_failure_surfaces() {
    let client = EngineClient::new(ScriptedEngine::default(), "/var/run/docker.sock");
    assert!(matches!(
        client.events().await,
        Err(TransportError::Channel(_))
    ));
}

#[tokio::test]
async fn test_invalid_container_id_rejected() {
    let client = EngineClient::new(ScriptedEngine::default(), "/var/run/docker.sock");
    assert!(matches!(
        client.inspect_container("../images").await,
        Err(TransportError::InvalidContainerId(id)) if id == "../images"
    ));
    assert!(matches!(
        client.inspect_container("").await,
        Err(TransportError::InvalidContainerId(_))
    ));
}

#[test]
fn test_engine_message_falls_back_to_text() {
    assert_eq!(engine_message(b"page not found\n"), "page not found");
    assert_eq!(engine_message(br#"{"message":"conflict"}"#), "conflict");
}
