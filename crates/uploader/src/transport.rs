//! Transport seam between orchestration and the wire.
//!
//! `Transport` is implemented over the TCP upload channel in production and
//! by mocks in tests, keeping upload logic decoupled from networking.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use barge_channel::{ChannelError, UploadChannel};
use barge_protocol::messages::{
    ChunkHeader, ChunkResponse, CleanupRequest, MergeRequest, MergeResponse, OperationResult,
    StatusRequest, StatusResponse,
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Abstract connection to an upload server.
pub trait Transport: Send + Sync {
    fn check_status(
        &self,
        req: StatusRequest,
    ) -> BoxFuture<'_, Result<StatusResponse, ChannelError>>;

    fn send_chunk(
        &self,
        header: ChunkHeader,
        body: Vec<u8>,
    ) -> BoxFuture<'_, Result<ChunkResponse, ChannelError>>;

    fn merge(&self, req: MergeRequest) -> BoxFuture<'_, Result<MergeResponse, ChannelError>>;

    fn cleanup(
        &self,
        req: CleanupRequest,
    ) -> BoxFuture<'_, Result<OperationResult, ChannelError>>;
}

/// Production transport: a small pool of TCP upload channels.
///
/// Channels are checked out per request, so concurrent chunk uploads each
/// ride their own connection. A channel is returned to the pool only after
/// a successful exchange; any error discards it and the next request dials
/// a fresh connection.
pub struct ChannelTransport {
    addr: SocketAddr,
    cancel: CancellationToken,
    idle: Mutex<Vec<UploadChannel>>,
}

impl ChannelTransport {
    pub fn new(addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            addr,
            cancel,
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn acquire(&self) -> Result<UploadChannel, ChannelError> {
        if let Some(channel) = self.idle.lock().await.pop() {
            return Ok(channel);
        }
        debug!(addr = %self.addr, "dialing upload server");
        UploadChannel::connect(self.addr, self.cancel.clone()).await
    }

    async fn release(&self, channel: UploadChannel) {
        self.idle.lock().await.push(channel);
    }
}

impl Transport for ChannelTransport {
    fn check_status(
        &self,
        req: StatusRequest,
    ) -> BoxFuture<'_, Result<StatusResponse, ChannelError>> {
        Box::pin(async move {
            let mut channel = self.acquire().await?;
            let resp = channel.check_status(&req).await?;
            self.release(channel).await;
            Ok(resp)
        })
    }

    fn send_chunk(
        &self,
        header: ChunkHeader,
        body: Vec<u8>,
    ) -> BoxFuture<'_, Result<ChunkResponse, ChannelError>> {
        Box::pin(async move {
            let mut channel = self.acquire().await?;
            let resp = channel.send_chunk(&header, &body).await?;
            self.release(channel).await;
            Ok(resp)
        })
    }

    fn merge(&self, req: MergeRequest) -> BoxFuture<'_, Result<MergeResponse, ChannelError>> {
        Box::pin(async move {
            let mut channel = self.acquire().await?;
            let resp = channel.merge(&req).await?;
            self.release(channel).await;
            Ok(resp)
        })
    }

    fn cleanup(
        &self,
        req: CleanupRequest,
    ) -> BoxFuture<'_, Result<OperationResult, ChannelError>> {
        Box::pin(async move {
            let mut channel = self.acquire().await?;
            let resp = channel.cleanup(&req).await?;
            self.release(channel).await;
            Ok(resp)
        })
    }
}
