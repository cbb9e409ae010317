//! Serialized method calls over one stream

use crate::{authenticate_external, Message, MessageCodec, MessageType, ProtocolError, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// A peer-to-peer bus connection.
///
/// Calls are serialized: one request is in flight at a time and the reply is
/// matched by serial. Signals and unrelated replies read while waiting are
/// discarded.
pub struct BusConnection<S> {
    inner: Mutex<Inner<S>>,
    next_serial: AtomicU32,
    closed: AtomicBool,
}

struct Inner<S> {
    stream: S,
    codec: MessageCodec,
}

impl<S> BusConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Authenticate as `uid` over `stream` and return a ready connection
    pub async fn handshake(mut stream: S, uid: u32) -> Result<Self, ProtocolError> {
        authenticate_external(&mut stream, uid).await?;
        Ok(Self::new(stream))
    }

    /// Wrap an already authenticated stream
    pub fn new(stream: S) -> Self {
        Self {
            inner: Mutex::new(Inner {
                stream,
                codec: MessageCodec::new(),
            }),
            next_serial: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Send `message` and wait for its reply.
    ///
    /// Error replies are returned as [`ProtocolError::MethodError`].
    pub async fn call(&self, mut message: Message) -> Result<Message, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let mut inner = self.inner.lock().await;
        let serial = self.allocate_serial();
        message.serial = serial;

        let Inner { stream, codec } = &mut *inner;
        codec.write_message(stream, &message).await?;
        debug!("Sent {} (serial {})", message.describe(), serial);

        loop {
            let Some(reply) = codec.read_message(stream).await? else {
                self.closed.store(true, Ordering::SeqCst);
                return Err(ProtocolError::ConnectionClosed);
            };

            if reply.reply_serial != Some(serial) {
                trace!(
                    "Discarding {:?} while waiting for serial {}",
                    reply.message_type,
                    serial
                );
                continue;
            }

            return match reply.message_type {
                MessageType::Error => Err(ProtocolError::MethodError {
                    name: reply.error_name.unwrap_or_default(),
                    message: reply
                        .body
                        .first()
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }),
                _ => Ok(reply),
            };
        }
    }

    /// Call a method and return the reply body
    pub async fn call_method(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Result<Vec<Value>, ProtocolError> {
        let message = Message::method_call(destination, path, interface, member).with_body(body);
        Ok(self.call(message).await?.body)
    }

    /// Shut the stream down; further calls fail with [`ProtocolError::ConnectionClosed`]
    pub async fn close(&self) -> Result<(), ProtocolError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        inner.stream.shutdown().await?;
        Ok(())
    }

    /// Whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn allocate_serial(&self) -> u32 {
        loop {
            let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
            // Zero is never a valid serial
            if serial != 0 {
                return serial;
            }
        }
    }
}
