use std::{io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, warn};

use crate::protocol::CommandProtocol;

/// Longest command line accepted, newline included. A client that sends more
/// without a newline gets an error reply and is disconnected.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Accepts TCP clients and runs one command loop per connection.
pub struct Server {
    listener: TcpListener,
    protocol: Arc<CommandProtocol>,
}

impl Server {
    pub fn new(listener: TcpListener, protocol: Arc<CommandProtocol>) -> Self {
        Self { listener, protocol }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until accepting fails. There is no other way out.
    pub async fn run(self) -> Result<()> {
        let Server { listener, protocol } = self;

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .context("failed to accept tcp connection")?;
            spawn_connection_handler(stream, peer, &protocol);
        }
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, protocol: &Arc<CommandProtocol>) {
    let protocol = Arc::clone(protocol);
    tokio::spawn(async move {
        info!(peer = %peer, "client connected");
        if let Err(err) = handle_connection(stream, protocol).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
        info!(peer = %peer, "client has left");
    });
}

async fn handle_connection(stream: TcpStream, protocol: Arc<CommandProtocol>) -> Result<()> {
    let local = stream.local_addr()?;
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let line = match read_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                write_reply(&mut writer, local, &err.to_string()).await?;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };
        debug!(?peer, bytes = line.len(), "command received");
        let response = protocol.handle_line(&line);
        write_reply(&mut writer, local, &response).await?;
    }
}

/// Reads one newline-terminated line of at most [`MAX_LINE_BYTES`], decoding
/// it lossily as UTF-8.
///
/// Returns `None` at end of stream. A trailing fragment with no newline is
/// dropped, since the peer closed before finishing the command.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    read_line_with_limit(reader, MAX_LINE_BYTES).await
}

/// Like [`read_line`], but fails with `InvalidData` once `limit` bytes have
/// been read without finding a newline.
pub async fn read_line_with_limit<R>(reader: &mut R, limit: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = Vec::new();
    let bytes = (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', &mut buffer)
        .await?;
    if buffer.last() == Some(&b'\n') {
        return Ok(Some(String::from_utf8_lossy(&buffer).into_owned()));
    }
    if bytes >= limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message exceeds {limit} bytes"),
        ));
    }
    Ok(None)
}

pub async fn write_reply<W>(writer: &mut W, local: SocketAddr, response: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reply = format!("Server {local} replied: {response}\n");
    writer.write_all(reply.as_bytes()).await?;
    writer.flush().await
}
