//! Upload orchestrator.
//!
//! Runs each file through fingerprint, status check, chunk upload and
//! merge. Files in a batch run sequentially; chunks within a file run with
//! bounded concurrency. A single cancellation token covers the batch and is
//! observed at every stage boundary and between chunks.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use barge_channel::ChannelError;
use barge_protocol::messages::{ChunkHeader, CleanupRequest, MergeRequest, StatusRequest};
use barge_transfer::{ChunkRange, ChunkReader, UploadSession, fingerprint_bytes, fingerprint_file};

use crate::error::UploadError;
use crate::transport::Transport;
use crate::types::{UploadConfig, UploadEvent, UploadOutcome, UploadSpec};

/// Orchestrates a batch of file uploads over one transport.
pub struct UploadOrchestrator {
    config: UploadConfig,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
    cancel: CancellationToken,
}

impl UploadOrchestrator {
    pub fn new(config: UploadConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Returns the cancellation token for this batch.
    ///
    /// Cancelling stops in-flight chunk transfers, asks the server to drop
    /// interrupted chunks, and prevents any merge from being issued. Chunks
    /// already confirmed stay staged for a later resume.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uploads every file in order. One failed file does not stop the rest;
    /// cancellation does.
    pub async fn upload_all(
        &self,
        transport: Arc<dyn Transport>,
        specs: Vec<UploadSpec>,
    ) -> Vec<UploadOutcome> {
        let mut outcomes = Vec::with_capacity(specs.len());
        for spec in specs {
            outcomes.push(self.upload_single(&transport, spec).await);
        }
        outcomes
    }

    async fn upload_single(
        &self,
        transport: &Arc<dyn Transport>,
        spec: UploadSpec,
    ) -> UploadOutcome {
        let session = Arc::new(UploadSession::new(
            uuid::Uuid::new_v4().to_string(),
            spec.file_path,
            spec.artifact_name,
        ));

        match self.run_pipeline(transport, &session).await {
            Ok(()) => {
                info!(
                    upload = %session.id(),
                    artifact = %session.artifact_name(),
                    state = ?session.state(),
                    "upload finished"
                );
                let _ = self
                    .events_tx
                    .send(UploadEvent::Completed {
                        upload_id: session.id(),
                        location: session.location().unwrap_or_default(),
                    })
                    .await;
            }
            Err(e) if e.is_cancelled() || self.cancel.is_cancelled() => {
                info!(upload = %session.id(), "upload cancelled");
                session.cancel();
                let _ = self
                    .events_tx
                    .send(UploadEvent::Cancelled {
                        upload_id: session.id(),
                    })
                    .await;
            }
            Err(e) => {
                error!(upload = %session.id(), error = %e, "upload failed");
                session.fail(&e.to_string());
                let _ = self
                    .events_tx
                    .send(UploadEvent::Failed {
                        upload_id: session.id(),
                        error: e.to_string(),
                    })
                    .await;
            }
        }

        let error = session.error();
        UploadOutcome {
            upload_id: session.id(),
            artifact_name: session.artifact_name(),
            state: session.state(),
            location: session.location(),
            error: if error.is_empty() { None } else { Some(error) },
        }
    }

    async fn run_pipeline(
        &self,
        transport: &Arc<dyn Transport>,
        session: &Arc<UploadSession>,
    ) -> Result<(), UploadError> {
        self.check_cancelled()?;

        // 1. Fingerprint the file contents off the async runtime.
        let path = session.file_path();
        let fp_task = tokio::task::spawn_blocking(move || fingerprint_file(&path));
        let fingerprint = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
            joined = fp_task => joined??,
        };
        session.begin_check(fingerprint.clone());
        self.emit_progress(session).await;

        // 2. Ask the server what it already has.
        let status = transport
            .check_status(StatusRequest {
                fingerprint: fingerprint.clone(),
                artifact_name: session.artifact_name(),
            })
            .await?;

        if status.exists {
            debug!(upload = %session.id(), "artifact already on server, skipping transfer");
            session.fast_complete(status.location.unwrap_or_default());
            return Ok(());
        }

        // 3. Plan chunks and subtract what the server holds.
        let file_size = tokio::fs::metadata(session.file_path()).await?.len();
        let ranges = barge_transfer::plan_chunks(file_size, self.config.chunk_size);
        let stored: HashSet<u32> = status
            .stored_indices
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        session.begin_upload(ranges, &stored);
        self.emit_progress(session).await;

        // 4. Upload what is missing.
        let pending = session.pending_ranges();
        debug!(
            upload = %session.id(),
            total = session.total_chunks(),
            pending = pending.len(),
            "chunk plan ready"
        );
        if !pending.is_empty() {
            self.upload_chunks(transport, session, pending).await?;
        }

        // 5. Merge. Never issued once the batch is cancelled: a merge after
        // cancel could assemble an artifact the user asked to abandon.
        self.check_cancelled()?;
        session.begin_merge();
        self.emit_progress(session).await;

        let merged = transport
            .merge(MergeRequest {
                fingerprint,
                artifact_name: session.artifact_name(),
                total_chunks: session.total_chunks(),
                total_size: file_size,
            })
            .await?;
        session.complete(merged.location);
        Ok(())
    }

    /// Uploads pending ranges with bounded fan-out. The first failure stops
    /// the remaining tasks; cancellation additionally asks the server to
    /// drop the interrupted chunk.
    async fn upload_chunks(
        &self,
        transport: &Arc<dyn Transport>,
        session: &Arc<UploadSession>,
        pending: Vec<ChunkRange>,
    ) -> Result<(), UploadError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_chunks.max(1)));
        let failed = CancellationToken::new();
        let mut tasks = tokio::task::JoinSet::new();

        for range in pending {
            let transport = Arc::clone(transport);
            let session = Arc::clone(session);
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.cancel.clone();
            let failed = failed.clone();
            let events_tx = self.events_tx.clone();
            let with_checksums = self.config.with_checksums;

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| UploadError::Cancelled)?;
                if cancel.is_cancelled() || failed.is_cancelled() {
                    return Err(UploadError::Cancelled);
                }

                // Disk reads stay off the async runtime, like the
                // fingerprint pass.
                let path = session.file_path();
                let body = tokio::task::spawn_blocking(move || {
                    ChunkReader::open(&path)?.read_range(&range)
                })
                .await??;
                let checksum = if with_checksums {
                    fingerprint_bytes(&body)
                } else {
                    String::new()
                };
                let header = ChunkHeader {
                    fingerprint: session.fingerprint(),
                    index: range.index,
                    size: range.len,
                    checksum,
                };

                // Dropping the send future closes its connection, so the
                // server discards the half-received body.
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ChannelError::Cancelled),
                    _ = failed.cancelled() => Err(ChannelError::Cancelled),
                    r = transport.send_chunk(header, body) => r,
                };

                match result {
                    Ok(resp) => {
                        session.confirm_chunk(resp.index);
                        let _ = events_tx.try_send(UploadEvent::Progress {
                            upload_id: session.id(),
                            artifact_name: session.artifact_name(),
                            state: session.state(),
                            progress: session.progress(),
                        });
                        Ok(())
                    }
                    Err(e) => {
                        if cancel.is_cancelled() {
                            // Best effort: the server also discards partials
                            // on its own when the connection drops.
                            let _ = transport
                                .cleanup(CleanupRequest {
                                    fingerprint: session.fingerprint(),
                                    index: range.index,
                                })
                                .await;
                            Err(UploadError::Cancelled)
                        } else {
                            failed.cancel();
                            Err(e.into())
                        }
                    }
                }
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(r) => r,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn emit_progress(&self, session: &UploadSession) {
        let _ = self
            .events_tx
            .send(UploadEvent::Progress {
                upload_id: session.id(),
                artifact_name: session.artifact_name(),
                state: session.state(),
                progress: session.progress(),
            })
            .await;
    }

    fn check_cancelled(&self) -> Result<(), UploadError> {
        if self.cancel.is_cancelled() {
            Err(UploadError::Cancelled)
        } else {
            Ok(())
        }
    }
}
