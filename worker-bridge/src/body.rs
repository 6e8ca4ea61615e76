//! Per-request reassembly of streamed response bodies.
//!
//! Body fragments arrive out-of-band from the command/reply cycle. Each invocation gets a
//! buffer keyed by [`RequestId`]; chunks are appended in arrival order and pulled by the
//! consumer through a [`BodyReader`].
//!
//! Lifecycle of one buffer:
//! `NotStarted` → `Buffering` (on [`BodyAssembler::begin`]) → `Complete` (on end marker)
//! → `Discarded` (on [`BodyAssembler::end`]). Nothing leaves `Discarded`.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::bytes::Bytes;

use crate::bridge::protocol::RequestId;

/// Observable state of a live buffer. Absent buffers are either not started or discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyState {
    Buffering,
    Complete,
}

struct BodyBuffer {
    chunks: VecDeque<Bytes>,
    complete: bool,
    completion: Arc<Notify>,
}

impl BodyBuffer {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            complete: false,
            completion: Arc::new(Notify::new()),
        }
    }
}

/// Shared map of body buffers. Clones refer to the same buffers.
#[derive(Clone, Default)]
pub struct BodyAssembler {
    buffers: Arc<DashMap<RequestId, BodyBuffer>>,
}

impl BodyAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an empty buffer for `id`, replacing any previous one.
    ///
    /// Must happen before the invocation is submitted, otherwise early chunks are dropped.
    pub fn begin(&self, id: RequestId) {
        if let Some(old) = self.buffers.insert(id, BodyBuffer::new()) {
            tracing::warn!(request_id = %id, "Replacing existing body buffer");
            old.completion.notify_waiters();
        }
    }

    /// Append a chunk. Returns `false` if no buffer is open for `id` (chunk dropped).
    pub fn push_chunk(&self, id: RequestId, chunk: Bytes) -> bool {
        match self.buffers.get_mut(&id) {
            Some(mut buffer) => {
                tracing::trace!(request_id = %id, len = chunk.len(), "Buffered body chunk");
                buffer.chunks.push_back(chunk);
                true
            }
            None => false,
        }
    }

    /// Mark the stream for `id` complete and wake anyone waiting on it.
    /// Returns `false` if no buffer is open for `id`.
    pub fn finish(&self, id: RequestId) -> bool {
        match self.buffers.get_mut(&id) {
            Some(mut buffer) => {
                buffer.complete = true;
                buffer.completion.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Complete every open buffer. Used when the connection dies and no more fragments
    /// can arrive.
    pub fn finish_all(&self) {
        for mut buffer in self.buffers.iter_mut() {
            buffer.complete = true;
            buffer.completion.notify_waiters();
        }
    }

    /// Oldest unread chunk, or `None` when drained, not yet received, or discarded.
    ///
    /// While the stream is still buffering `None` only means "nothing yet"; once
    /// [`BodyAssembler::is_complete`] holds it is the end of the body.
    pub fn read(&self, id: RequestId) -> Option<Bytes> {
        self.buffers
            .get_mut(&id)
            .and_then(|mut buffer| buffer.chunks.pop_front())
    }

    /// Discard the buffer for `id`. Idempotent; returns whether a buffer was removed.
    pub fn end(&self, id: RequestId) -> bool {
        match self.buffers.remove(&id) {
            Some((_, buffer)) => {
                buffer.completion.notify_waiters();
                true
            }
            None => false,
        }
    }

    pub fn state(&self, id: RequestId) -> Option<BodyState> {
        self.buffers.get(&id).map(|buffer| {
            if buffer.complete {
                BodyState::Complete
            } else {
                BodyState::Buffering
            }
        })
    }

    pub fn is_complete(&self, id: RequestId) -> bool {
        self.state(id) == Some(BodyState::Complete)
    }

    /// Wait until the stream for `id` is complete or its buffer is gone.
    pub async fn wait_complete(&self, id: RequestId) {
        loop {
            let completion = match self.buffers.get(&id) {
                Some(buffer) if !buffer.complete => Arc::clone(&buffer.completion),
                _ => return,
            };

            let notified = completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Re-check after registering so a finish() in between is not missed.
            if self.state(id) != Some(BodyState::Buffering) {
                return;
            }
            notified.await;
        }
    }

    /// Number of open buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn reader(&self, id: RequestId) -> BodyReader {
        BodyReader {
            id,
            assembler: self.clone(),
        }
    }
}

/// Pull-based reader bound to one request's body.
///
/// Call [`BodyReader::read`] until it returns `None`. After `endOfRequest` it yields nothing.
#[derive(Clone)]
pub struct BodyReader {
    id: RequestId,
    assembler: BodyAssembler,
}

impl BodyReader {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    pub fn read(&self) -> Option<Bytes> {
        self.assembler.read(self.id)
    }
}

impl Iterator for BodyReader {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        self.read()
    }
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyReader")
            .field("request_id", &self.id)
            .finish()
    }
}
