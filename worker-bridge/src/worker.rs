//! Worker side of the bridge protocol.
//!
//! The controller side lives in `session.rs`. This module answers commands one at a time
//! and streams handler bodies back; how endpoints actually run is behind
//! [`EndpointHandler`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;

use crate::bridge::channel::{ChannelError, Inbound, WorkerChannel};
use crate::bridge::protocol::{Command, HandlerReply, RequestId, WorkerMessage};

/// Failure of a single command. Sent to the controller as the reply's error text.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Module failed to load or compile.
    #[error("{message}")]
    Load { message: String },

    #[error("endpoint not found: {path}")]
    NotFound { path: String },

    /// The handler itself failed.
    #[error("{message}")]
    Handler { message: String },
}

impl HandlerError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }
}

/// Streams body chunks of one invocation back to the controller.
#[derive(Clone)]
pub struct BodySender {
    id: RequestId,
    tx: mpsc::Sender<Inbound>,
    finished: Arc<AtomicBool>,
}

impl BodySender {
    fn new(id: RequestId, tx: mpsc::Sender<Inbound>) -> Self {
        Self {
            id,
            tx,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.id
    }

    pub async fn send_chunk(&self, chunk: impl Into<Bytes>) -> Result<(), ChannelError> {
        if self.is_finished() {
            tracing::warn!(request_id = %self.id, "Body chunk after end of body ignored");
            return Ok(());
        }
        self.tx
            .send(Ok(WorkerMessage::chunk(self.id, chunk)))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Send the end marker. Later calls are no-ops.
    pub async fn finish(&self) -> Result<(), ChannelError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.tx
            .send(Ok(WorkerMessage::end_of_body(self.id)))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Endpoint runtime driven by [`serve_worker`].
#[async_trait]
pub trait EndpointHandler: Send + Sync + 'static {
    async fn init_worker(&self, id: u64) -> Result<(), HandlerError>;

    async fn read_worker_channel(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn import_endpoint(
        &self,
        path: &str,
        api_version: &str,
        version: u64,
    ) -> Result<(), HandlerError>;

    async fn activate_endpoint(&self, path: &str) -> Result<(), HandlerError>;

    /// Run a handler, streaming its body through `body`. The end marker is sent for the
    /// handler if it does not call [`BodySender::finish`] itself.
    async fn call_handler(
        &self,
        path: &str,
        api_version: &str,
        body: &BodySender,
    ) -> Result<HandlerReply, HandlerError>;

    /// Request teardown. No reply is sent.
    fn end_of_request(&self, _id: RequestId) {}
}

/// Serve commands until the controller goes away.
///
/// Commands are handled strictly one at a time; each gets exactly one terminal reply,
/// except `endOfRequest` which gets none.
pub async fn serve_worker<H: EndpointHandler>(
    mut channel: WorkerChannel,
    handler: H,
) -> Result<(), ChannelError> {
    tracing::info!("Worker serving");

    while let Some(command) = channel.recv().await {
        tracing::debug!(cmd = command.name(), "Command received");

        let reply = match command {
            Command::InitWorker { id } => handler
                .init_worker(id)
                .await
                .map(|()| serde_json::Value::Null),
            Command::ReadWorkerChannel => handler
                .read_worker_channel()
                .await
                .map(|()| serde_json::Value::Null),
            Command::ImportEndpoint {
                path,
                api_version,
                version,
            } => handler
                .import_endpoint(&path, &api_version, version)
                .await
                .map(|()| serde_json::Value::Null),
            Command::ActivateEndpoint { path } => handler
                .activate_endpoint(&path)
                .await
                .map(|()| serde_json::Value::Null),
            Command::CallHandler {
                path,
                api_version,
                id,
            } => {
                let body = BodySender::new(id, channel.message_sender());
                let result = handler.call_handler(&path, &api_version, &body).await;
                body.finish().await?;
                result.and_then(|reply| {
                    serde_json::to_value(reply).map_err(|e| HandlerError::handler(e.to_string()))
                })
            }
            Command::EndOfRequest { id } => {
                tracing::debug!(request_id = %id, "End of request");
                handler.end_of_request(id);
                continue;
            }
        };

        let msg = match reply {
            Ok(value) => WorkerMessage::ok(value),
            Err(e) => {
                tracing::debug!(error = %e, "Command failed");
                WorkerMessage::err(e.to_string())
            }
        };
        channel.send(msg).await?;
    }

    tracing::info!("Controller gone, worker exiting");
    Ok(())
}
