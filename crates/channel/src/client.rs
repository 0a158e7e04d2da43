//! Upload client.
//!
//! One [`UploadChannel`] wraps one TCP connection. Requests are strictly
//! sequential per channel; the orchestrator opens several channels when it
//! wants parallel chunk uploads.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use barge_protocol::constants::{
    CHUNK_TRANSFER_TIMEOUT, CONNECT_TIMEOUT, IO_BUFFER_SIZE, MERGE_TIMEOUT, REQUEST_TIMEOUT,
};
use barge_protocol::messages::{
    ChunkHeader, ChunkResponse, CleanupRequest, MergeRequest, MergeResponse, OperationResult,
    StatusRequest, StatusResponse,
};
use barge_protocol::{Message, MessageType};

use crate::wire::{read_frame, write_frame};
use crate::ChannelError;

/// Client side of the upload channel.
pub struct UploadChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    cancel: CancellationToken,
}

impl UploadChannel {
    /// Connects with timeout and cancellation.
    pub async fn connect(
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<Self, ChannelError> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ChannelError::Cancelled);
            }
            result = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)) => {
                match result {
                    Ok(Ok(s)) => {
                        debug!(%addr, "upload channel connected");
                        s
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(ChannelError::Timeout),
                }
            }
        };

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::with_capacity(IO_BUFFER_SIZE, reader),
            writer: BufWriter::with_capacity(IO_BUFFER_SIZE, writer),
            cancel,
        })
    }

    /// Asks whether the artifact exists or which chunks are staged.
    pub async fn check_status(
        &mut self,
        req: &StatusRequest,
    ) -> Result<StatusResponse, ChannelError> {
        let reply = self
            .request(MessageType::Status, req, REQUEST_TIMEOUT)
            .await?;
        expect_payload(&reply)
    }

    /// Sends one chunk: envelope frame, then the raw body.
    ///
    /// `header.size` must equal `body.len()`; the server reads exactly that
    /// many bytes after the envelope. Cancellation is observed between
    /// buffer-sized writes, leaving the partial chunk for the server's
    /// staging guard to discard when the connection drops.
    pub async fn send_chunk(
        &mut self,
        header: &ChunkHeader,
        body: &[u8],
    ) -> Result<ChunkResponse, ChannelError> {
        if header.size != body.len() as u64 {
            return Err(ChannelError::Protocol(format!(
                "chunk header declares {} bytes but body is {}",
                header.size,
                body.len()
            )));
        }

        let msg = Message::new(new_request_id(), MessageType::Chunk, Some(header))?;
        write_frame(&mut self.writer, &msg).await?;

        for piece in body.chunks(IO_BUFFER_SIZE) {
            if self.cancel.is_cancelled() {
                return Err(ChannelError::Cancelled);
            }
            self.writer.write_all(piece).await?;
        }
        self.writer.flush().await?;

        let reply = self.read_reply(&msg.id, CHUNK_TRANSFER_TIMEOUT).await?;
        expect_payload(&reply)
    }

    /// Requests assembly of the staged chunk set into the artifact.
    pub async fn merge(&mut self, req: &MergeRequest) -> Result<MergeResponse, ChannelError> {
        let reply = self.request(MessageType::Merge, req, MERGE_TIMEOUT).await?;
        expect_payload(&reply)
    }

    /// Deletes one staged chunk on the server.
    pub async fn cleanup(&mut self, req: &CleanupRequest) -> Result<OperationResult, ChannelError> {
        let reply = self
            .request(MessageType::Cleanup, req, REQUEST_TIMEOUT)
            .await?;
        expect_payload(&reply)
    }

    async fn request<T: Serialize>(
        &mut self,
        msg_type: MessageType,
        payload: &T,
        timeout: Duration,
    ) -> Result<Message, ChannelError> {
        let msg = Message::new(new_request_id(), msg_type, Some(payload))?;
        write_frame(&mut self.writer, &msg).await?;
        self.writer.flush().await?;
        self.read_reply(&msg.id, timeout).await
    }

    async fn read_reply(&mut self, id: &str, timeout: Duration) -> Result<Message, ChannelError> {
        let reply = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(ChannelError::Cancelled);
            }
            result = tokio::time::timeout(timeout, read_frame(&mut self.reader)) => {
                match result {
                    Ok(Ok(Some(m))) => m,
                    Ok(Ok(None)) => {
                        return Err(ChannelError::Protocol(
                            "connection closed before response".into(),
                        ));
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(ChannelError::Timeout),
                }
            }
        };

        // Requests are sequential per channel, so the next frame must
        // answer the request just sent.
        if reply.id != id {
            return Err(ChannelError::Protocol(format!(
                "response id mismatch: expected {id}, got {}",
                reply.id
            )));
        }

        if let Some(err) = &reply.error {
            return Err(ChannelError::Remote {
                code: err.code,
                message: err.message.clone(),
            });
        }

        Ok(reply)
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn expect_payload<T: for<'de> serde::Deserialize<'de>>(msg: &Message) -> Result<T, ChannelError> {
    msg.parse_payload()?
        .ok_or_else(|| ChannelError::Protocol("missing response payload".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::UploadServer;
    use barge_protocol::constants::{
        CODE_BAD_REQUEST, CODE_CHUNK_TOO_LARGE, CODE_COUNT_MISMATCH,
    };
    use barge_store::{ChunkStore, StoreConfig};
    use std::sync::Arc;

    async fn start_server(
        dir: &std::path::Path,
        config: StoreConfig,
    ) -> (SocketAddr, Arc<ChunkStore>, CancellationToken) {
        let store = Arc::new(
            ChunkStore::new(dir.join("artifacts"), dir.join("staging"), config).unwrap(),
        );
        let cancel = CancellationToken::new();
        let server = UploadServer::bind("127.0.0.1:0", Arc::clone(&store), cancel.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        (addr, store, cancel)
    }

    fn chunk_header(fingerprint: &str, index: u32, body: &[u8]) -> ChunkHeader {
        ChunkHeader {
            fingerprint: fingerprint.into(),
            index,
            size: body.len() as u64,
            checksum: String::new(),
        }
    }

    /// Full pipeline: status, three chunks out of order, status again, merge.
    #[tokio::test]
    async fn upload_and_merge_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _store, server_cancel) = start_server(dir.path(), StoreConfig::default()).await;

        let mut channel = UploadChannel::connect(addr, CancellationToken::new())
            .await
            .unwrap();

        let status = channel
            .check_status(&StatusRequest {
                fingerprint: "fp1".into(),
                artifact_name: "out.bin".into(),
            })
            .await
            .unwrap();
        assert!(!status.exists);
        assert!(status.stored_indices.is_empty());

        let bodies: [&[u8]; 3] = [b"alpha-", b"beta-", b"gamma"];
        for index in [2u32, 0, 1] {
            let body = bodies[index as usize];
            let resp = channel
                .send_chunk(&chunk_header("fp1", index, body), body)
                .await
                .unwrap();
            assert_eq!(resp.index, index);
            assert_eq!(resp.bytes_written, body.len() as u64);
        }

        let status = channel
            .check_status(&StatusRequest {
                fingerprint: "fp1".into(),
                artifact_name: "out.bin".into(),
            })
            .await
            .unwrap();
        assert_eq!(status.stored_indices, vec!["0", "1", "2"]);

        let merged = channel
            .merge(&MergeRequest {
                fingerprint: "fp1".into(),
                artifact_name: "out.bin".into(),
                total_chunks: 3,
                total_size: 17,
            })
            .await
            .unwrap();

        let content = std::fs::read(&merged.location).unwrap();
        assert_eq!(&content, b"alpha-beta-gamma");

        server_cancel.cancel();
    }

    /// Status reports the finished artifact so a re-upload sends nothing.
    #[tokio::test]
    async fn fast_path_after_merge() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _store, server_cancel) = start_server(dir.path(), StoreConfig::default()).await;

        let mut channel = UploadChannel::connect(addr, CancellationToken::new())
            .await
            .unwrap();

        let body = b"payload";
        channel
            .send_chunk(&chunk_header("fp2", 0, body), body)
            .await
            .unwrap();
        channel
            .merge(&MergeRequest {
                fingerprint: "fp2".into(),
                artifact_name: "small.bin".into(),
                total_chunks: 1,
                total_size: body.len() as u64,
            })
            .await
            .unwrap();

        let status = channel
            .check_status(&StatusRequest {
                fingerprint: "fp2".into(),
                artifact_name: "small.bin".into(),
            })
            .await
            .unwrap();
        assert!(status.exists);
        assert!(status.location.unwrap().ends_with("small.bin"));

        server_cancel.cancel();
    }

    #[tokio::test]
    async fn merge_mismatch_reports_409() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _store, server_cancel) = start_server(dir.path(), StoreConfig::default()).await;

        let mut channel = UploadChannel::connect(addr, CancellationToken::new())
            .await
            .unwrap();

        let body = b"only-one";
        channel
            .send_chunk(&chunk_header("fp3", 0, body), body)
            .await
            .unwrap();

        let result = channel
            .merge(&MergeRequest {
                fingerprint: "fp3".into(),
                artifact_name: "out.bin".into(),
                total_chunks: 3,
                total_size: 0,
            })
            .await;

        match result {
            Err(ChannelError::Remote { code, message }) => {
                assert_eq!(code, CODE_COUNT_MISMATCH);
                assert!(message.contains("expected 3"));
                assert!(message.contains("stored 1"));
            }
            other => panic!("expected remote mismatch error, got {other:?}"),
        }

        // The staged chunk survived the refused merge.
        let status = channel
            .check_status(&StatusRequest {
                fingerprint: "fp3".into(),
                artifact_name: "out.bin".into(),
            })
            .await
            .unwrap();
        assert_eq!(status.stored_indices, vec!["0"]);

        server_cancel.cancel();
    }

    #[tokio::test]
    async fn oversized_chunk_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _store, server_cancel) = start_server(
            dir.path(),
            StoreConfig {
                max_chunk_size: 16,
            },
        )
        .await;

        let mut channel = UploadChannel::connect(addr, CancellationToken::new())
            .await
            .unwrap();

        let body = [0u8; 64];
        let result = channel
            .send_chunk(&chunk_header("fp4", 0, &body), &body)
            .await;

        match result {
            Err(ChannelError::Remote { code, .. }) => assert_eq!(code, CODE_CHUNK_TOO_LARGE),
            other => panic!("expected remote error, got {other:?}"),
        }

        server_cancel.cancel();
    }

    #[tokio::test]
    async fn empty_identifier_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _store, server_cancel) = start_server(dir.path(), StoreConfig::default()).await;

        let mut channel = UploadChannel::connect(addr, CancellationToken::new())
            .await
            .unwrap();

        let result = channel
            .check_status(&StatusRequest {
                fingerprint: String::new(),
                artifact_name: "out.bin".into(),
            })
            .await;

        match result {
            Err(ChannelError::Remote { code, message }) => {
                assert_eq!(code, CODE_BAD_REQUEST);
                assert!(message.contains("fingerprint"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }

        server_cancel.cancel();
    }

    #[tokio::test]
    async fn cleanup_removes_staged_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _store, server_cancel) = start_server(dir.path(), StoreConfig::default()).await;

        let mut channel = UploadChannel::connect(addr, CancellationToken::new())
            .await
            .unwrap();

        let body = b"to-be-removed";
        channel
            .send_chunk(&chunk_header("fp5", 4, body), body)
            .await
            .unwrap();

        let result = channel
            .cleanup(&CleanupRequest {
                fingerprint: "fp5".into(),
                index: 4,
            })
            .await
            .unwrap();
        assert!(result.success);

        let status = channel
            .check_status(&StatusRequest {
                fingerprint: "fp5".into(),
                artifact_name: "out.bin".into(),
            })
            .await
            .unwrap();
        assert!(status.stored_indices.is_empty());

        // Cleanup of an already-removed chunk still succeeds.
        let again = channel
            .cleanup(&CleanupRequest {
                fingerprint: "fp5".into(),
                index: 4,
            })
            .await
            .unwrap();
        assert!(again.success);

        server_cancel.cancel();
    }

    #[tokio::test]
    async fn cancelled_client_stops_before_sending() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _store, server_cancel) = start_server(dir.path(), StoreConfig::default()).await;

        let cancel = CancellationToken::new();
        let mut channel = UploadChannel::connect(addr, cancel.clone()).await.unwrap();
        cancel.cancel();

        let body = [0u8; 1024];
        let result = channel
            .send_chunk(&chunk_header("fp6", 0, &body), &body)
            .await;
        assert!(matches!(result, Err(ChannelError::Cancelled)));

        server_cancel.cancel();
    }

    #[tokio::test]
    async fn checksum_verified_by_server() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _store, server_cancel) = start_server(dir.path(), StoreConfig::default()).await;

        let mut channel = UploadChannel::connect(addr, CancellationToken::new())
            .await
            .unwrap();

        let body = b"checked-bytes";
        let mut header = chunk_header("fp7", 0, body);
        header.checksum = "0".repeat(64);

        let result = channel.send_chunk(&header, body).await;
        match result {
            Err(ChannelError::Remote { code, .. }) => assert_eq!(code, CODE_BAD_REQUEST),
            other => panic!("expected remote error, got {other:?}"),
        }

        // The connection survives a checksum rejection; a correct retry works.
        use sha2::{Digest, Sha256};
        header.checksum = hex::encode(Sha256::digest(body));
        let resp = channel.send_chunk(&header, body).await.unwrap();
        assert_eq!(resp.bytes_written, body.len() as u64);

        server_cancel.cancel();
    }
}
