//! Unix domain socket transport.
//!
//! Newline-delimited JSON in both directions. Each accepted connection gets a
//! reader that feeds the channel's inbound queue and a writer that drains the
//! connection's outbound queue. Readers never buffer more than
//! `MAX_FRAME_BYTES` of a single line.

use std::path::Path;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::protocol::{
    self, CoordinatorCommand, OperatorRequest, Upstream, WorkerMessage, MAX_FRAME_BYTES,
};
use super::{Connector, WorkerLink};
use crate::error::Result;
use crate::{mlog, mlog_debug, mlog_warn};

/// Accept worker and operator connections until cancelled.
///
/// A stale socket file at `path` is replaced; the file is removed on exit.
pub async fn serve_unix(path: &Path, connector: Connector, cancel: CancellationToken) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    mlog!("channel: listening on {}", path.display());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_connection(stream, connector.clone()));
                }
                Err(e) => mlog_warn!("channel: accept failed: {}", e),
            }
        }
    }

    let _ = std::fs::remove_file(path);
    Ok(())
}

/// Line frames from a socket. An over-long line is an error as soon as the
/// limit is crossed, not once its newline arrives.
fn frames(read_half: OwnedReadHalf) -> FramedRead<OwnedReadHalf, LinesCodec> {
    FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME_BYTES))
}

async fn serve_connection(stream: UnixStream, connector: Connector) {
    let (conn, commands) = connector.open();
    let (read_half, write_half) = stream.into_split();
    tokio::spawn(write_frames(write_half, commands));

    let mut lines = frames(read_half);
    loop {
        match lines.next().await {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match protocol::decode::<Upstream>(&line) {
                    Ok(Upstream::Worker(message)) => connector.deliver(conn, message),
                    Ok(Upstream::Operator(request)) => connector.operator(conn, request),
                    Err(e) => {
                        connector.malformed(conn, e.to_string());
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                connector.malformed(conn, e.to_string());
                break;
            }
            None => {
                connector.disconnected(conn);
                break;
            }
        }
    }
    mlog_debug!("channel: reader for {} finished", conn);
}

async fn write_frames<T: serde::Serialize>(
    mut write_half: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<T>,
) {
    while let Some(frame) = frames.recv().await {
        let line = match protocol::encode(&frame) {
            Ok(line) => line,
            Err(e) => {
                mlog_warn!("channel: dropping unencodable frame: {}", e);
                continue;
            }
        };
        if write_half.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Connect a worker process to the coordinator socket.
pub async fn connect_unix(path: &Path) -> Result<WorkerLink> {
    let stream = UnixStream::connect(path).await?;
    let (read_half, write_half) = stream.into_split();

    let (tx, messages) = mpsc::unbounded_channel::<WorkerMessage>();
    let (commands_tx, rx) = mpsc::unbounded_channel::<CoordinatorCommand>();
    tokio::spawn(write_frames(write_half, messages));

    tokio::spawn(async move {
        let mut lines = frames(read_half);
        while let Some(Ok(line)) = lines.next().await {
            if line.trim().is_empty() {
                continue;
            }
            match protocol::decode::<CoordinatorCommand>(&line) {
                Ok(command) => {
                    if commands_tx.send(command).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    mlog_warn!("worker: malformed command from coordinator: {}", e);
                    break;
                }
            }
        }
    });

    Ok(WorkerLink { tx, rx })
}

/// Deliver one operator request to a running coordinator.
pub async fn send_operator(path: &Path, request: OperatorRequest) -> Result<()> {
    let mut stream = UnixStream::connect(path).await?;
    let line = protocol::encode(&request)?;
    stream.write_all(line.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
