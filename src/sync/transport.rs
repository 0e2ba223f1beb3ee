//! TCP transport: one JSON-encoded [`SyncMessage`] per line.
//!
//! Each connection gets a writer task fed by an unbounded channel and a read
//! loop that hands decoded messages to the [`SyncNode`]. Peers are keyed by
//! the remote socket address.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::message::{decode, encode, SyncMessage};
use super::node::SyncNode;
use super::peer::{PeerId, PeerLink};
use super::SyncError;

/// Longest line a peer may send; a whole chain response must fit
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Peer reached over a TCP connection
#[derive(Debug)]
pub struct TcpPeer {
    id: PeerId,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl PeerLink for TcpPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: SyncMessage) -> Result<(), SyncError> {
        let line = encode(&message)?;
        self.outbound
            .send(line)
            .map_err(|_| SyncError::PeerDisconnected(self.id.clone()))
    }
}

/// Accepts inbound peers on `addr`
///
/// # Returns
///
/// The bound address (useful with port 0) and the accept loop's handle
pub async fn listen(
    node: SyncNode,
    addr: SocketAddr,
) -> Result<(SocketAddr, JoinHandle<()>), SyncError> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("Listening for peers on {}", local_addr);

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    tokio::spawn(serve(node.clone(), stream, remote.to_string()));
                }
                Err(err) => warn!("Failed to accept peer: {}", err),
            }
        }
    });

    Ok((local_addr, handle))
}

/// Dials a peer and starts serving the connection
pub async fn connect(node: &SyncNode, addr: &str) -> Result<PeerId, SyncError> {
    let stream = TcpStream::connect(addr).await?;
    let id = stream.peer_addr()?.to_string();
    tokio::spawn(serve(node.clone(), stream, id.clone()));
    Ok(id)
}

async fn serve(node: SyncNode, stream: TcpStream, id: PeerId) {
    let (reader, mut writer) = stream.into_split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        while let Some(mut line) = queue.recv().await {
            line.push('\n');
            if let Err(err) = writer.write_all(line.as_bytes()).await {
                debug!("Write failed: {}", err);
                break;
            }
        }
    });

    node.connect_peer(Arc::new(TcpPeer {
        id: id.clone(),
        outbound,
    }))
    .await;

    let mut reader = BufReader::new(reader);
    loop {
        match read_line(&mut reader, MAX_MESSAGE_SIZE).await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match decode(&line) {
                Ok(message) => node.process(&id, message).await,
                Err(err) => warn!("Dropping malformed message from {}: {}", id, err),
            },
            Ok(None) => break,
            Err(err) => {
                warn!("Connection to {} failed: {}", id, err);
                break;
            }
        }
    }

    node.disconnect_peer(&id);
    writer_task.abort();
}

/// Reads one newline-terminated line of at most `max_len` bytes
///
/// # Returns
///
/// `None` at end of stream. An oversized or non UTF-8 line is an
/// `InvalidData` error and the connection should be dropped.
async fn read_line<R>(reader: &mut BufReader<R>, max_len: usize) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(max_len).unwrap_or(u64::MAX).saturating_add(1);
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.len() > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes", max_len),
        ));
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
