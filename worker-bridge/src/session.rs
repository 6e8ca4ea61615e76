//! Bridge API - the controller's view of one worker.
//!
//! Flow:
//! 1. Build a [`Channel`] to the worker and hand it to [`WorkerBridge::new`]
//! 2. A dispatch loop task demultiplexes inbound messages: body fragments go to the
//!    [`BodyAssembler`], terminal replies to the [`CorrelationQueue`]
//! 3. API calls submit commands to the queue and suspend until their reply is routed back
//! 4. On a transport fault: fail every pending call, refuse new ones, stop the loop

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::body::{BodyAssembler, BodyReader};
use crate::bridge::channel::{Channel, CommandSender, Inbound};
use crate::bridge::protocol::{Command, HandlerReply, RequestId, WorkerMessage};
use crate::config::BridgeConfig;
use crate::queue::CorrelationQueue;

type SharedQueue = Arc<Mutex<CorrelationQueue<CommandSender>>>;

/// Identifies one bridge instance in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BridgeId(uuid::Uuid);

impl BridgeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for BridgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BridgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// The worker answered with an error. Recoverable; message is passed through verbatim.
    #[error("{0}")]
    Worker(String),
    /// The reply decoded, but not into the shape the command promises.
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    /// The command is never answered by the worker and cannot be awaited.
    #[error("{0} is not answered by the worker and cannot be submitted")]
    Unanswered(&'static str),
    /// The channel failed. The bridge is dead.
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("bridge closed")]
    Closed,
}

impl BridgeError {
    /// Whether the bridge instance is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Closed)
    }
}

/// Successful `callHandler` result. The body is complete when this is returned.
#[derive(Debug)]
pub struct HandlerResponse {
    pub status: u16,
    pub headers: u32,
    pub body: BodyReader,
}

impl HandlerResponse {
    /// Next body chunk, or `None` at end of body.
    pub fn read(&self) -> Option<tokio_util::bytes::Bytes> {
        self.body.read()
    }
}

fn lock_queue(queue: &SharedQueue) -> MutexGuard<'_, CorrelationQueue<CommandSender>> {
    queue.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Correlation queue mutex poisoned");
        poisoned.into_inner()
    })
}

/// Controller-side handle to one worker.
///
/// Commands are executed one at a time in submission order; concurrent callers queue
/// behind each other. Must be created inside a tokio runtime.
pub struct WorkerBridge {
    id: BridgeId,
    queue: SharedQueue,
    bodies: BodyAssembler,
    sender: CommandSender,
    dispatch_loop: JoinHandle<()>,
}

impl WorkerBridge {
    pub fn new(channel: Channel, config: BridgeConfig) -> Self {
        let id = BridgeId::new();
        let (sender, inbound) = channel.into_parts();
        let queue = Arc::new(Mutex::new(CorrelationQueue::new(sender.clone())));
        let bodies = BodyAssembler::new();

        tracing::info!(bridge = %id, name = %config.name, "Starting worker bridge");
        let dispatch_loop = tokio::spawn(run_dispatch_loop(
            id,
            inbound,
            Arc::clone(&queue),
            bodies.clone(),
        ));

        Self {
            id,
            queue,
            bodies,
            sender,
            dispatch_loop,
        }
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    pub fn bodies(&self) -> &BodyAssembler {
        &self.bodies
    }

    pub fn is_faulted(&self) -> bool {
        lock_queue(&self.queue).is_faulted()
    }

    /// Calls submitted and not yet answered, including the one at the worker.
    pub fn pending(&self) -> usize {
        lock_queue(&self.queue).pending()
    }

    /// Submit a command and wait for its terminal reply.
    ///
    /// `endOfRequest` is refused with [`BridgeError::Unanswered`]; use
    /// [`WorkerBridge::end_of_request`].
    pub async fn submit(&self, command: Command) -> Result<serde_json::Value, BridgeError> {
        let rx = lock_queue(&self.queue).submit(command);
        rx.await.map_err(|_| BridgeError::Closed)?
    }

    pub async fn init_worker(&self, id: u64) -> Result<(), BridgeError> {
        self.submit(Command::InitWorker { id }).await?;
        Ok(())
    }

    pub async fn read_worker_channel(&self) -> Result<(), BridgeError> {
        self.submit(Command::ReadWorkerChannel).await?;
        Ok(())
    }

    /// Load and compile the handler module at `path`. A compile failure comes back as
    /// [`BridgeError::Worker`] with the worker's message.
    pub async fn import_endpoint(
        &self,
        path: impl Into<String>,
        api_version: impl Into<String>,
        version: u64,
    ) -> Result<(), BridgeError> {
        self.submit(Command::ImportEndpoint {
            path: path.into(),
            api_version: api_version.into(),
            version,
        })
        .await?;
        Ok(())
    }

    pub async fn activate_endpoint(&self, path: impl Into<String>) -> Result<(), BridgeError> {
        self.submit(Command::ActivateEndpoint { path: path.into() })
            .await?;
        Ok(())
    }

    /// Invoke a handler and wait for both its reply and the end of its body stream.
    ///
    /// Call [`WorkerBridge::end_of_request`] afterwards whether this succeeds or not;
    /// the body buffer lives until then.
    pub async fn call_handler(
        &self,
        path: impl Into<String>,
        api_version: impl Into<String>,
        request_id: RequestId,
    ) -> Result<HandlerResponse, BridgeError> {
        self.bodies.begin(request_id);

        let value = self
            .submit(Command::CallHandler {
                path: path.into(),
                api_version: api_version.into(),
                id: request_id,
            })
            .await?;

        // The queue only resolves after the end marker, so this is normally immediate.
        self.bodies.wait_complete(request_id).await;

        let reply: HandlerReply = serde_json::from_value(value)
            .map_err(|e| BridgeError::MalformedReply(e.to_string()))?;

        tracing::debug!(
            %request_id,
            status = reply.status,
            "Handler finished"
        );

        Ok(HandlerResponse {
            status: reply.status,
            headers: reply.headers,
            body: self.bodies.reader(request_id),
        })
    }

    /// Tell the worker the request is over and drop its body buffer.
    ///
    /// Not correlated: sent immediately, bypassing the queue, never answered. Safe to call
    /// repeatedly or for unknown ids.
    pub fn end_of_request(&self, request_id: RequestId) {
        if let Err(e) = self.sender.send(Command::EndOfRequest { id: request_id }) {
            tracing::debug!(%request_id, error = %e, "Teardown notification not delivered");
        }
        self.bodies.end(request_id);
    }

    /// Stop the dispatch loop and reject everything pending with [`BridgeError::Closed`].
    pub fn shutdown(&self) {
        self.dispatch_loop.abort();
        lock_queue(&self.queue).close();
        self.bodies.finish_all();
        tracing::info!(bridge = %self.id, "Worker bridge shut down");
    }
}

impl Drop for WorkerBridge {
    fn drop(&mut self) {
        self.dispatch_loop.abort();
    }
}

async fn run_dispatch_loop(
    bridge: BridgeId,
    mut inbound: mpsc::Receiver<Inbound>,
    queue: SharedQueue,
    bodies: BodyAssembler,
) {
    let reason = loop {
        match inbound.recv().await {
            Some(Ok(WorkerMessage::Body {
                id,
                chunk: Some(chunk),
            })) => {
                if !bodies.push_chunk(id, chunk) {
                    tracing::debug!(request_id = %id, "Dropping body chunk with no open buffer");
                }
            }
            Some(Ok(WorkerMessage::Body { id, chunk: None })) => {
                tracing::trace!(request_id = %id, "End of body");
                bodies.finish(id);
                if !lock_queue(&queue).on_body_end(id) {
                    tracing::warn!(
                        request_id = %id,
                        "End of body for a request that is not in flight"
                    );
                }
            }
            Some(Ok(WorkerMessage::Reply(reply))) => {
                if let Err(e) = lock_queue(&queue).on_reply(reply) {
                    break e.to_string();
                }
            }
            Some(Err(e)) => break e.to_string(),
            None => break "channel closed".to_string(),
        }
    };

    tracing::error!(%bridge, %reason, "Worker channel fault");
    lock_queue(&queue).fail(reason);
    bodies.finish_all();
    tracing::info!(%bridge, "Dispatch loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::{ChannelError, WorkerChannel};
    use crate::bridge::protocol::RawWorkerMessage;
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::bytes::Bytes;

    fn connect() -> (WorkerBridge, WorkerChannel) {
        let config = BridgeConfig::new("test-worker");
        let (channel, worker) = Channel::pair(&config);
        (WorkerBridge::new(channel, config), worker)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn reply_ok(worker: &WorkerChannel, value: serde_json::Value) {
        worker.send(WorkerMessage::ok(value)).await.unwrap();
    }

    #[tokio::test]
    async fn end_to_end_scenario() {
        let (bridge, mut worker) = connect();
        let bridge = Arc::new(bridge);
        let id = RequestId::new(42);

        let script = tokio::spawn(async move {
            assert_eq!(worker.recv().await, Some(Command::InitWorker { id: 1 }));
            reply_ok(&worker, json!(null)).await;

            assert!(matches!(
                worker.recv().await,
                Some(Command::ImportEndpoint { version: 1, .. })
            ));
            reply_ok(&worker, json!(null)).await;

            assert!(matches!(
                worker.recv().await,
                Some(Command::CallHandler { id, .. }) if id == RequestId::new(42)
            ));
            worker.send(WorkerMessage::chunk(id, &b"ab"[..])).await.unwrap();
            worker.send(WorkerMessage::chunk(id, &b"cd"[..])).await.unwrap();
            worker.send(WorkerMessage::end_of_body(id)).await.unwrap();
            reply_ok(&worker, json!({"status": 200, "headers": 3})).await;

            assert_eq!(worker.recv().await, Some(Command::EndOfRequest { id }));
        });

        bridge.init_worker(1).await.unwrap();
        bridge.import_endpoint("/h.ts", "v1", 1).await.unwrap();

        let response = bridge.call_handler("/h.ts", "v1", id).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers, 3);
        assert_eq!(response.read(), Some(Bytes::from_static(b"ab")));
        assert_eq!(response.read(), Some(Bytes::from_static(b"cd")));
        assert_eq!(response.read(), None);

        bridge.end_of_request(id);
        assert_eq!(response.read(), None);
        assert_eq!(bridge.bodies().state(id), None);

        script.await.unwrap();
        assert_eq!(bridge.pending(), 0);
    }

    #[tokio::test]
    async fn import_error_is_recoverable() {
        let (bridge, mut worker) = connect();

        let script = tokio::spawn(async move {
            worker.recv().await.unwrap();
            worker.send(WorkerMessage::err("syntax error")).await.unwrap();
            assert_eq!(
                worker.recv().await,
                Some(Command::ActivateEndpoint {
                    path: "/other.ts".to_string()
                })
            );
            reply_ok(&worker, json!(null)).await;
            worker
        });

        let err = bridge.import_endpoint("/h.ts", "v1", 1).await.unwrap_err();
        assert!(matches!(&err, BridgeError::Worker(msg) if msg == "syntax error"));
        assert_eq!(err.to_string(), "syntax error");
        assert!(!err.is_fatal());

        bridge.activate_endpoint("/other.ts").await.unwrap();
        assert!(!bridge.is_faulted());
        let _worker = script.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_callers_complete_in_submission_order() {
        let (bridge, mut worker) = connect();

        let script = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..5 {
                match worker.recv().await {
                    Some(Command::ImportEndpoint { version, .. }) => {
                        seen.push(version);
                        reply_ok(&worker, json!(version)).await;
                    }
                    other => panic!("unexpected command: {other:?}"),
                }
            }
            seen
        });

        let calls = (0..5).map(|v| bridge.submit(Command::ImportEndpoint {
            path: format!("/h{v}.ts"),
            api_version: "v1".to_string(),
            version: v,
        }));
        let results = futures::future::join_all(calls).await;

        for (v, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!(v));
        }
        assert_eq!(script.await.unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn second_command_waits_for_first_reply() {
        let (bridge, mut worker) = connect();
        let bridge = Arc::new(bridge);

        let first = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.init_worker(1).await }
        });
        assert_eq!(worker.recv().await, Some(Command::InitWorker { id: 1 }));

        let second = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.read_worker_channel().await }
        });
        settle().await;
        assert_eq!(bridge.pending(), 2);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), worker.recv())
                .await
                .is_err(),
            "second command must not reach the worker yet"
        );

        reply_ok(&worker, json!(null)).await;
        first.await.unwrap().unwrap();

        assert_eq!(worker.recv().await, Some(Command::ReadWorkerChannel));
        reply_ok(&worker, json!(null)).await;
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_response_waits_for_end_marker() {
        let (bridge, mut worker) = connect();
        let bridge = Arc::new(bridge);
        let id = RequestId::new(9);

        let call = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.call_handler("/h.ts", "v1", id).await }
        });
        assert!(matches!(
            worker.recv().await,
            Some(Command::CallHandler { .. })
        ));

        worker.send(WorkerMessage::chunk(id, &b"x"[..])).await.unwrap();
        reply_ok(&worker, json!({"status": 201, "headers": 0})).await;
        settle().await;
        assert!(!call.is_finished(), "body not complete yet");

        worker.send(WorkerMessage::chunk(id, &b"y"[..])).await.unwrap();
        worker.send(WorkerMessage::end_of_body(id)).await.unwrap();

        let response = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("call should finish after end marker")
            .unwrap()
            .unwrap();
        assert_eq!(response.status, 201);
        let body: Vec<Bytes> = response.body.collect();
        assert_eq!(body, vec!["x", "y"]);

        bridge.end_of_request(id);
    }

    #[tokio::test]
    async fn handler_error_skips_body_and_keeps_buffer_until_end_of_request() {
        let (bridge, mut worker) = connect();
        let id = RequestId::new(5);

        let script = tokio::spawn(async move {
            worker.recv().await.unwrap();
            worker.send(WorkerMessage::err("handler threw")).await.unwrap();
            worker
        });

        let err = bridge.call_handler("/h.ts", "v1", id).await.unwrap_err();
        assert!(matches!(err, BridgeError::Worker(_)));
        assert!(bridge.bodies().state(id).is_some());

        bridge.end_of_request(id);
        assert!(bridge.bodies().is_empty());
        let _worker = script.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_handler_reply_rejects_call_only() {
        let (bridge, mut worker) = connect();
        let id = RequestId::new(5);

        let script = tokio::spawn(async move {
            worker.recv().await.unwrap();
            worker.send(WorkerMessage::end_of_body(id)).await.unwrap();
            reply_ok(&worker, json!("not a reply")).await;
            worker
        });

        let err = bridge.call_handler("/h.ts", "v1", id).await.unwrap_err();
        assert!(matches!(err, BridgeError::MalformedReply(_)));
        assert!(!bridge.is_faulted());
        bridge.end_of_request(id);
        let _worker = script.await.unwrap();
    }

    #[tokio::test]
    async fn end_of_request_is_idempotent() {
        let (bridge, mut worker) = connect();
        let id = RequestId::new(77);

        bridge.end_of_request(id);
        bridge.end_of_request(id);

        assert_eq!(worker.recv().await, Some(Command::EndOfRequest { id }));
        assert_eq!(worker.recv().await, Some(Command::EndOfRequest { id }));
        assert!(!bridge.is_faulted());
        assert_eq!(bridge.bodies().read(id), None);
    }

    #[tokio::test]
    async fn transport_fault_fails_pending_and_later_calls() {
        let (bridge, mut worker) = connect();
        let bridge = Arc::new(bridge);

        let pending = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.init_worker(1).await }
        });
        worker.recv().await.unwrap();

        worker.fault(ChannelError::Closed).await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert!(err.is_fatal());
        assert!(bridge.is_faulted());

        let err = bridge.read_worker_channel().await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
    }

    #[tokio::test]
    async fn malformed_message_is_fatal() {
        let (bridge, mut worker) = connect();
        let bridge = Arc::new(bridge);

        let pending = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.call_handler("/h.ts", "v1", RequestId::new(1)).await }
        });
        worker.recv().await.unwrap();

        worker
            .send_raw(RawWorkerMessage {
                msg: Some("body".to_string()),
                id: Some(RequestId::new(1)),
                value: Some(json!(12)),
                err: None,
            })
            .await
            .unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Transport(msg) if msg.contains("malformed")));
    }

    #[tokio::test]
    async fn unsolicited_reply_is_fatal() {
        let (bridge, worker) = connect();

        reply_ok(&worker, json!(null)).await;
        settle().await;

        assert!(bridge.is_faulted());
    }

    #[tokio::test]
    async fn second_reply_during_body_stream_is_fatal() {
        let (bridge, mut worker) = connect();
        let bridge = Arc::new(bridge);
        let id = RequestId::new(42);

        let call = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.call_handler("/h.ts", "v1", id).await }
        });
        assert!(matches!(
            worker.recv().await,
            Some(Command::CallHandler { .. })
        ));
        let next = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.read_worker_channel().await }
        });
        settle().await;

        reply_ok(&worker, json!({"status": 200, "headers": 3})).await;
        reply_ok(&worker, json!("stray")).await;
        // Ignored if the loop already stopped reading.
        let _ = worker.send(WorkerMessage::end_of_body(id)).await;

        let err = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("call should be rejected")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert!(matches!(
            next.await.unwrap().unwrap_err(),
            BridgeError::Transport(_)
        ));
        assert!(bridge.is_faulted());
    }

    #[tokio::test]
    async fn submitting_end_of_request_does_not_stall_the_queue() {
        let (bridge, mut worker) = connect();
        let id = RequestId::new(1);

        let err = bridge
            .submit(Command::EndOfRequest { id })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unanswered("endOfRequest")));
        assert!(!err.is_fatal());
        assert_eq!(bridge.pending(), 0);

        let script = tokio::spawn(async move {
            assert_eq!(worker.recv().await, Some(Command::InitWorker { id: 1 }));
            reply_ok(&worker, json!(null)).await;
            worker
        });
        tokio::time::timeout(Duration::from_secs(1), bridge.init_worker(1))
            .await
            .expect("queue must not be stuck")
            .unwrap();
        let _worker = script.await.unwrap();
    }

    #[tokio::test]
    async fn worker_gone_is_fatal() {
        let (bridge, worker) = connect();
        drop(worker);

        let err = bridge.init_worker(1).await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
    }

    #[tokio::test]
    async fn shutdown_rejects_pending_with_closed() {
        let (bridge, mut worker) = connect();
        let bridge = Arc::new(bridge);

        let pending = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.init_worker(1).await }
        });
        worker.recv().await.unwrap();

        bridge.shutdown();
        assert!(matches!(
            pending.await.unwrap().unwrap_err(),
            BridgeError::Closed
        ));
        assert!(matches!(
            bridge.init_worker(2).await.unwrap_err(),
            BridgeError::Closed
        ));
    }

    #[tokio::test]
    async fn chunks_for_unknown_request_are_dropped() {
        let (bridge, mut worker) = connect();
        let id = RequestId::new(3);

        let script = tokio::spawn(async move {
            worker.recv().await.unwrap();
            worker
                .send(WorkerMessage::chunk(RequestId::new(999), &b"stray"[..]))
                .await
                .unwrap();
            worker.send(WorkerMessage::end_of_body(id)).await.unwrap();
            reply_ok(&worker, json!({"status": 200, "headers": 1})).await;
            worker
        });

        let response = bridge.call_handler("/h.ts", "v1", id).await.unwrap();
        assert_eq!(response.read(), None);
        assert_eq!(bridge.bodies().state(RequestId::new(999)), None);
        bridge.end_of_request(id);
        let _worker = script.await.unwrap();
    }
}
