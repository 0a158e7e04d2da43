//! Upload server.
//!
//! Accepts connections, reads envelope frames, and dispatches status, chunk,
//! merge and cleanup requests to the chunk store. Each connection runs in
//! its own task; the store serializes what must be serialized.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use barge_protocol::constants::{
    CHUNK_TRANSFER_TIMEOUT, CODE_BAD_REQUEST, CODE_CANCELLED, CODE_CHUNK_TOO_LARGE,
    CODE_COUNT_MISMATCH, CODE_INTERNAL, CODE_MERGE_IN_PROGRESS, IO_BUFFER_SIZE, MERGE_TIMEOUT,
};
use barge_protocol::messages::{
    ChunkHeader, ChunkResponse, CleanupRequest, MergeRequest, MergeResponse, MismatchDetail,
    OperationResult, StatusRequest, StatusResponse,
};
use barge_protocol::{Message, MessageType};
use barge_store::{ArtifactStatus, ChunkStore, StagedChunk, StoreError};

use crate::wire::{read_frame, write_frame};
use crate::ChannelError;

/// TCP upload server.
pub struct UploadServer {
    listener: TcpListener,
    store: Arc<ChunkStore>,
    cancel: CancellationToken,
}

impl UploadServer {
    /// Binds the listener. Pass port 0 for an ephemeral port.
    pub async fn bind(
        addr: &str,
        store: Arc<ChunkStore>,
        cancel: CancellationToken,
    ) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "upload server bound");
        Ok(Self {
            listener,
            store,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Returns cleanly when the cancellation token fires.
    pub async fn serve(self) -> Result<(), ChannelError> {
        loop {
            let (stream, addr) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("upload server shutting down");
                    return Ok(());
                }
                result = self.listener.accept() => result?,
            };

            debug!(%addr, "connection accepted");
            let store = Arc::clone(&self.store);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                match handle_connection(store, stream, cancel).await {
                    Ok(()) => debug!(%addr, "connection closed"),
                    Err(ChannelError::Cancelled) => debug!(%addr, "connection cancelled"),
                    Err(e) => warn!(%addr, error = %e, "connection ended with error"),
                }
            });
        }
    }
}

/// Serves one connection until the peer closes it.
///
/// Returning an error drops the connection; that is the only safe reaction
/// once the stream position is uncertain (a chunk body was interrupted or
/// an envelope failed to parse).
async fn handle_connection(
    store: Arc<ChunkStore>,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<(), ChannelError> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, reader);
    let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, writer);

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
            result = read_frame(&mut reader) => match result? {
                Some(m) => m,
                None => return Ok(()),
            },
        };

        let (reply, close) = match msg.msg_type {
            MessageType::Status => (handle_status(&store, &msg).await, false),
            MessageType::Chunk => handle_chunk(&store, &msg, &mut reader, &cancel).await?,
            MessageType::Merge => (handle_merge(&store, &msg, &cancel).await, false),
            MessageType::Cleanup => (handle_cleanup(&store, &msg).await, false),
            other => {
                warn!(msg_type = ?other, "unexpected message type");
                let reply = msg
                    .reply_error(CODE_BAD_REQUEST, format!("unexpected message type: {other:?}"));
                (reply, false)
            }
        };

        write_frame(&mut writer, &reply).await?;
        writer.flush().await?;
        if close {
            return Ok(());
        }
    }
}

async fn handle_status(store: &ChunkStore, msg: &Message) -> Message {
    let req: StatusRequest = match msg.parse_payload() {
        Ok(Some(r)) => r,
        Ok(None) => return msg.reply_error(CODE_BAD_REQUEST, "status payload is required"),
        Err(e) => return msg.reply_error(CODE_BAD_REQUEST, format!("bad status payload: {e}")),
    };

    match store.status(&req.fingerprint, &req.artifact_name).await {
        Ok(ArtifactStatus::Complete { location }) => {
            let resp = StatusResponse {
                exists: true,
                location: Some(location.display().to_string()),
                stored_indices: Vec::new(),
            };
            reply_or_internal(msg, MessageType::StatusResponse, &resp)
        }
        Ok(ArtifactStatus::Partial { stored }) => {
            let resp = StatusResponse {
                exists: false,
                location: None,
                stored_indices: stored.iter().map(u32::to_string).collect(),
            };
            reply_or_internal(msg, MessageType::StatusResponse, &resp)
        }
        Err(e) => store_error_reply(msg, &e),
    }
}

/// Handles a chunk frame. The raw body follows the envelope, so any error
/// that prevents consuming exactly `size` bytes must drop the connection.
/// Returns the reply and whether the connection must close after sending it
/// (the body was never drained, so the stream position is lost).
async fn handle_chunk(
    store: &ChunkStore,
    msg: &Message,
    reader: &mut (impl AsyncReadExt + Unpin),
    cancel: &CancellationToken,
) -> Result<(Message, bool), ChannelError> {
    let header: ChunkHeader = match msg.parse_payload() {
        Ok(Some(h)) => h,
        // Without a parsed size the body length is unknown; the client still
        // gets a bad-request reply, but it is the last frame on this
        // connection.
        Ok(None) => {
            return Ok((
                msg.reply_error(CODE_BAD_REQUEST, "chunk header payload is required"),
                true,
            ));
        }
        Err(e) => {
            return Ok((
                msg.reply_error(CODE_BAD_REQUEST, format!("bad chunk header: {e}")),
                true,
            ));
        }
    };

    let staged = match store
        .begin_chunk(&header.fingerprint, header.index, header.size, &header.checksum)
        .await
    {
        Ok(s) => s,
        Err(e) => {
            // The body was never read; draining it could mean swallowing up
            // to the maximum chunk size, so the reply is the last frame on
            // this connection.
            return Ok((store_error_reply(msg, &e), true));
        }
    };

    match receive_body(reader, staged, header.size, cancel).await? {
        Ok(bytes_written) => {
            debug!(
                fingerprint = %header.fingerprint,
                index = header.index,
                bytes_written,
                "chunk stored"
            );
            let resp = ChunkResponse {
                fingerprint: header.fingerprint,
                index: header.index,
                bytes_written,
            };
            Ok((reply_or_internal(msg, MessageType::ChunkResponse, &resp), false))
        }
        // Body fully consumed but the commit was refused (checksum); the
        // stream is still in sync, so reply and keep the connection.
        Err(e) => Ok((store_error_reply(msg, &e), false)),
    }
}

/// Streams exactly `size` body bytes into the staged chunk.
///
/// Outer error: the stream is desynchronized (I/O failure, timeout, client
/// abort, cancellation) and the connection must close; the partial chunk is
/// deleted by the staging guard. A client abort (EOF mid-body) surfaces as
/// `Cancelled`, not a generic failure. Inner error: the body was consumed
/// but the commit failed, which is reportable on the same connection.
async fn receive_body(
    reader: &mut (impl AsyncReadExt + Unpin),
    mut staged: StagedChunk,
    size: u64,
    cancel: &CancellationToken,
) -> Result<Result<u64, StoreError>, ChannelError> {
    let receive = async {
        let mut buf = vec![0u8; IO_BUFFER_SIZE.min(size.max(1) as usize)];
        let mut remaining = size;

        while remaining > 0 {
            if cancel.is_cancelled() {
                staged.abort().await;
                return Err(ChannelError::Cancelled);
            }

            let to_read = (remaining as usize).min(buf.len());
            let n = reader.read(&mut buf[..to_read]).await?;
            if n == 0 {
                staged.abort().await;
                debug!(remaining, "client aborted chunk body");
                return Err(ChannelError::Cancelled);
            }

            if let Err(e) = staged.write(&buf[..n]).await {
                return Err(ChannelError::Protocol(format!("chunk staging failed: {e}")));
            }
            remaining -= n as u64;
        }

        Ok(staged.commit().await)
    };

    match tokio::time::timeout(CHUNK_TRANSFER_TIMEOUT, receive).await {
        Ok(result) => result,
        // Dropping the receive future drops the staged chunk, which removes
        // the partial file.
        Err(_) => Err(ChannelError::Timeout),
    }
}

async fn handle_merge(store: &ChunkStore, msg: &Message, cancel: &CancellationToken) -> Message {
    let req: MergeRequest = match msg.parse_payload() {
        Ok(Some(r)) => r,
        Ok(None) => return msg.reply_error(CODE_BAD_REQUEST, "merge payload is required"),
        Err(e) => return msg.reply_error(CODE_BAD_REQUEST, format!("bad merge payload: {e}")),
    };

    let merge_cancel = cancel.child_token();
    let merge = store.merge(
        &req.fingerprint,
        &req.artifact_name,
        req.total_chunks,
        &merge_cancel,
    );
    tokio::pin!(merge);
    match tokio::time::timeout(MERGE_TIMEOUT, &mut merge).await {
        Ok(Ok(location)) => {
            let resp = MergeResponse {
                location: location.display().to_string(),
            };
            reply_or_internal(msg, MessageType::MergeResponse, &resp)
        }
        Ok(Err(e)) => store_error_reply(msg, &e),
        Err(_) => {
            // Cancel and await so the merge rolls back its partial output
            // instead of being dropped mid-write.
            merge_cancel.cancel();
            let _ = merge.await;
            msg.reply_error(CODE_INTERNAL, "merge timed out")
        }
    }
}

async fn handle_cleanup(store: &ChunkStore, msg: &Message) -> Message {
    let req: CleanupRequest = match msg.parse_payload() {
        Ok(Some(r)) => r,
        Ok(None) => return msg.reply_error(CODE_BAD_REQUEST, "cleanup payload is required"),
        Err(e) => return msg.reply_error(CODE_BAD_REQUEST, format!("bad cleanup payload: {e}")),
    };

    match store.cleanup(&req.fingerprint, req.index).await {
        Ok(()) => {
            let resp = OperationResult {
                success: true,
                message: String::new(),
            };
            reply_or_internal(msg, MessageType::OperationResult, &resp)
        }
        Err(e) => store_error_reply(msg, &e),
    }
}

fn reply_or_internal<T: serde::Serialize>(msg: &Message, msg_type: MessageType, payload: &T) -> Message {
    msg.reply(msg_type, Some(payload))
        .unwrap_or_else(|e| msg.reply_error(CODE_INTERNAL, format!("serialization failed: {e}")))
}

/// Maps a store error onto an envelope error reply.
fn store_error_reply(msg: &Message, err: &StoreError) -> Message {
    match err {
        StoreError::MissingIdentifier(_)
        | StoreError::InvalidIdentifier(_)
        | StoreError::Truncated { .. }
        | StoreError::ChecksumMismatch => msg.reply_error(CODE_BAD_REQUEST, err.to_string()),
        StoreError::ChunkTooLarge { .. } => {
            msg.reply_error(CODE_CHUNK_TOO_LARGE, err.to_string())
        }
        StoreError::MergeInProgress(_) => {
            msg.reply_error(CODE_MERGE_IN_PROGRESS, err.to_string())
        }
        StoreError::CountMismatch { expected, actual } => Message::error_with_payload(
            &msg.id,
            CODE_COUNT_MISMATCH,
            err.to_string(),
            &MismatchDetail {
                expected: *expected,
                actual: *actual,
            },
        )
        .unwrap_or_else(|_| msg.reply_error(CODE_COUNT_MISMATCH, err.to_string())),
        StoreError::Cancelled => msg.reply_error(CODE_CANCELLED, err.to_string()),
        StoreError::Io(_) => msg.reply_error(CODE_INTERNAL, err.to_string()),
    }
}
