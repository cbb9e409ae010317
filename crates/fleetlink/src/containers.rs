//! Docker container listing and event streams

use crate::{FleetlinkError, Result};
use bytes::Bytes;
use fleetlink_ssh::{EngineClient, EngineResponse, TransportError, TunnelDialer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Buffered lines between the engine reader and the consumer
pub const STREAM_CAPACITY: usize = 32;

/// Receiving end of a line stream; each item is one JSON document
pub type LineStream = mpsc::Receiver<Result<String>>;

/// List compose-managed containers as the engine's JSON
pub async fn list<D: TunnelDialer>(engine: &EngineClient<D>) -> Result<Bytes> {
    debug!("Reading containers");
    engine
        .list_compose_containers()
        .await
        .map_err(|source| FleetlinkError::Container {
            target: "containers".to_string(),
            source,
        })
}

/// Inspect one container as the engine's JSON
pub async fn inspect<D: TunnelDialer>(engine: &EngineClient<D>, id: &str) -> Result<Bytes> {
    debug!("Inspecting container {}", id);
    engine
        .inspect_container(id)
        .await
        .map_err(|source| container_error(id, source))
}

/// Stream resource usage samples of one container
pub async fn stats<D: TunnelDialer>(
    engine: &EngineClient<D>,
    id: &str,
    cancel: &CancellationToken,
) -> Result<LineStream> {
    info!("Reading container stats for {}", id);
    let response = engine
        .container_stats(id)
        .await
        .map_err(|source| container_error(id, source))?;
    Ok(pump(response, id.to_string(), cancel.clone()))
}

/// Stream engine events
pub async fn events<D: TunnelDialer>(
    engine: &EngineClient<D>,
    cancel: &CancellationToken,
) -> Result<LineStream> {
    info!("Reading engine events");
    let response = engine
        .events()
        .await
        .map_err(|source| container_error("events", source))?;
    Ok(pump(response, "events".to_string(), cancel.clone()))
}

/// Forward normalized lines from `response` into a bounded channel.
///
/// The producer stops on end of body, on the first error (which is
/// forwarded), on cancellation or when the receiver goes away.
fn pump(mut response: EngineResponse, target: String, cancel: CancellationToken) -> LineStream {
    let (tx, rx) = mpsc::channel(STREAM_CAPACITY);

    tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
                line = response.next_line() => line,
            };

            let item = match line {
                Ok(Some(line)) => normalize(&line).map_err(|source| container_error(&target, source)),
                Ok(None) => break,
                Err(source) => Err(container_error(&target, source)),
            };
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
        debug!("Stream for {} ended", target);
    });

    rx
}

/// Re-serialize one JSON document onto a single line
fn normalize(line: &[u8]) -> std::result::Result<String, TransportError> {
    serde_json::from_slice::<serde_json::Value>(line)
        .map(|value| value.to_string())
        .map_err(|e| TransportError::EngineRequest(format!("malformed stream record: {e}")))
}

fn container_error(target: &str, source: TransportError) -> FleetlinkError {
    FleetlinkError::Container {
        target: target.to_string(),
        source,
    }
}
