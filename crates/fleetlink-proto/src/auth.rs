//! SASL authentication handshake

use crate::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Longest handshake line accepted from the peer
const MAX_LINE_LEN: usize = 1024;

/// Authenticate with the `EXTERNAL` mechanism as `uid` and begin the message stream.
///
/// Returns the server GUID from the `OK` reply.
pub async fn authenticate_external<S>(stream: &mut S, uid: u32) -> Result<String, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let identity = hex_encode(uid.to_string().as_bytes());
    stream
        .write_all(format!("\0AUTH EXTERNAL {identity}\r\n").as_bytes())
        .await?;
    stream.flush().await?;

    let reply = read_line(stream).await?;
    let guid = if let Some(guid) = reply.strip_prefix("OK ") {
        guid.trim().to_string()
    } else if reply.starts_with("REJECTED") {
        return Err(ProtocolError::AuthRejected(reply));
    } else {
        return Err(ProtocolError::Handshake(reply));
    };

    stream.write_all(b"BEGIN\r\n").await?;
    stream.flush().await?;
    debug!("Authenticated as uid {} (server {})", uid, guid);
    Ok(guid)
}

/// Read one `\r\n` terminated line without consuming anything after it
pub(crate) async fn read_line<S>(stream: &mut S) -> Result<String, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = match stream.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        };
        line.push(byte);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return String::from_utf8(line)
                .map_err(|_| ProtocolError::Handshake("non UTF-8 reply".to_string()));
        }
        if line.len() > MAX_LINE_LEN {
            return Err(ProtocolError::Handshake("reply line too long".to_string()));
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    #[test]
    fn test_identity_is_hex_of_decimal_uid() {
        assert_eq!(hex_encode(b"1000"), "31303030");
        assert_eq!(hex_encode(b"0"), "30");
    }

    #[tokio::test]
    async fn test_handshake_accepted() {
        let (mut client, server) = duplex(1024);

        let peer = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let mut line = String::new();
            server.read_line(&mut line).await.unwrap();
            assert_eq!(line, "\0AUTH EXTERNAL 31303030\r\n");
            server
                .get_mut()
                .write_all(b"OK 1234deadbeef\r\n")
                .await
                .unwrap();
            line.clear();
            server.read_line(&mut line).await.unwrap();
            assert_eq!(line, "BEGIN\r\n");
        });

        let guid = authenticate_external(&mut client, 1000).await.unwrap();
        assert_eq!(guid, "1234deadbeef");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let (mut client, server) = duplex(1024);

        tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let mut line = String::new();
            server.read_line(&mut line).await.unwrap();
            server
                .get_mut()
                .write_all(b"REJECTED EXTERNAL\r\n")
                .await
                .unwrap();
        });

        let result = authenticate_external(&mut client, 0).await;
        assert!(matches!(result, Err(ProtocolError::AuthRejected(_))));
    }

    #[tokio::test]
    async fn test_peer_hangs_up() {
        let (mut client, server) = duplex(1024);
        drop(server);

        let result = authenticate_external(&mut client, 0).await;
        assert!(result.is_err());
    }
}
