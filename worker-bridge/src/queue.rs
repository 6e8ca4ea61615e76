//! Single-flight command dispatcher.
//!
//! Commands are queued in submission order and only the head is ever sent to the worker.
//! Terminal replies carry no correlation id: a reply always belongs to the head. When the
//! head completes it is removed and the next command is dispatched immediately.
//!
//! A `callHandler` head holds the slot until both its reply and the end marker of its body
//! stream have arrived, in either order.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::bridge::channel::{ChannelError, CommandSender};
use crate::bridge::protocol::{Command, RequestId};
use crate::session::BridgeError;

/// Outcome delivered to a waiting caller.
pub type CallResult = Result<serde_json::Value, BridgeError>;

/// Where dispatched commands go.
///
/// Implemented by [`CommandSender`]; tests substitute a recorder.
pub trait Outbound {
    fn dispatch(&self, command: &Command) -> Result<(), ChannelError>;
}

impl Outbound for CommandSender {
    fn dispatch(&self, command: &Command) -> Result<(), ChannelError> {
        self.send(command.clone())
    }
}

/// Reply that no in-flight command is waiting for: either nothing is pending, or the head
/// already has its reply and only awaits its body. Protocol state can no longer be trusted.
#[derive(Debug, thiserror::Error)]
#[error("terminal reply received with no command awaiting one")]
pub struct UnsolicitedReply;

/// Body stream progress of an in-flight `callHandler`.
#[derive(Debug)]
struct BodyProgress {
    request_id: RequestId,
    done: bool,
}

/// A submitted command and its waiting caller.
pub struct PendingCall {
    command: Command,
    waiter: oneshot::Sender<CallResult>,
    body: Option<BodyProgress>,
    /// Successful reply parked until the body stream finishes.
    reply: Option<serde_json::Value>,
}

impl PendingCall {
    fn new(command: Command, waiter: oneshot::Sender<CallResult>) -> Self {
        let body = command.body_request().map(|request_id| BodyProgress {
            request_id,
            done: false,
        });
        Self {
            command,
            waiter,
            body,
            reply: None,
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    fn body_outstanding(&self) -> bool {
        self.body.as_ref().is_some_and(|b| !b.done)
    }

    fn resolve(self, result: CallResult) {
        if self.waiter.send(result).is_err() {
            tracing::debug!(cmd = self.command.name(), "Caller dropped before reply");
        }
    }
}

pub struct CorrelationQueue<O> {
    outbound: O,
    pending: VecDeque<PendingCall>,
    fault: Option<BridgeError>,
}

impl<O: Outbound> CorrelationQueue<O> {
    pub fn new(outbound: O) -> Self {
        Self {
            outbound,
            pending: VecDeque::new(),
            fault: None,
        }
    }

    /// Append a command. If nothing was pending it is dispatched before this returns.
    ///
    /// The receiver yields the reply value, the worker's error, or the fault that killed
    /// the bridge. Commands the worker never answers are rejected up front with
    /// [`BridgeError::Unanswered`]; queuing one would stall every later command.
    pub fn submit(&mut self, command: Command) -> oneshot::Receiver<CallResult> {
        let (tx, rx) = oneshot::channel();

        if let Some(fault) = &self.fault {
            let _ = tx.send(Err(fault.clone()));
            return rx;
        }

        if !command.expects_reply() {
            tracing::warn!(cmd = command.name(), "Refusing to queue unanswered command");
            let _ = tx.send(Err(BridgeError::Unanswered(command.name())));
            return rx;
        }

        self.pending.push_back(PendingCall::new(command, tx));
        if self.pending.len() == 1 {
            self.dispatch_head();
        } else {
            tracing::debug!(pending = self.pending.len(), "Worker busy, command queued");
        }
        rx
    }

    /// Route a terminal reply to the head of the queue.
    pub fn on_reply(
        &mut self,
        reply: Result<serde_json::Value, String>,
    ) -> Result<(), UnsolicitedReply> {
        let Some(head) = self.pending.front_mut() else {
            return Err(UnsolicitedReply);
        };
        if head.reply.is_some() {
            return Err(UnsolicitedReply);
        }

        match reply {
            Ok(value) if head.body_outstanding() => {
                tracing::debug!(
                    cmd = head.command.name(),
                    "Reply received, waiting for end of body"
                );
                head.reply = Some(value);
            }
            Ok(value) => self.complete_head(Ok(value)),
            Err(error) => {
                tracing::debug!(cmd = head.command.name(), %error, "Command failed");
                self.complete_head(Err(BridgeError::Worker(error)));
            }
        }
        Ok(())
    }

    /// Record the end marker for `id`. Returns `false` if the in-flight command is not the
    /// invocation producing that body.
    pub fn on_body_end(&mut self, id: RequestId) -> bool {
        let Some(head) = self.pending.front_mut() else {
            return false;
        };
        let Some(body) = head.body.as_mut().filter(|b| b.request_id == id) else {
            return false;
        };

        body.done = true;
        if let Some(value) = head.reply.take() {
            self.complete_head(Ok(value));
        }
        true
    }

    /// Enter the faulted state: every pending call and every later submission fails with
    /// a transport error.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.pending.is_empty() {
            tracing::warn!(
                pending = self.pending.len(),
                %reason,
                "Failing pending commands"
            );
        }
        for call in self.pending.drain(..) {
            call.resolve(Err(BridgeError::Transport(reason.clone())));
        }
        if self.fault.is_none() {
            self.fault = Some(BridgeError::Transport(reason));
        }
    }

    /// Reject everything pending with [`BridgeError::Closed`] and refuse new work.
    pub fn close(&mut self) {
        for call in self.pending.drain(..) {
            call.resolve(Err(BridgeError::Closed));
        }
        if self.fault.is_none() {
            self.fault = Some(BridgeError::Closed);
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    /// The error every new submission is rejected with, once faulted or closed.
    pub fn fault(&self) -> Option<&BridgeError> {
        self.fault.as_ref()
    }

    /// Number of calls submitted and not yet resolved, including the in-flight one.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// The command currently at the worker.
    pub fn in_flight(&self) -> Option<&Command> {
        self.pending.front().map(PendingCall::command)
    }

    fn complete_head(&mut self, result: CallResult) {
        if let Some(call) = self.pending.pop_front() {
            call.resolve(result);
        }
        if !self.pending.is_empty() {
            self.dispatch_head();
        }
    }

    fn dispatch_head(&mut self) {
        let Some(head) = self.pending.front() else {
            return;
        };
        tracing::debug!(
            cmd = head.command.name(),
            pending = self.pending.len(),
            "Dispatching command"
        );
        if let Err(e) = self.outbound.dispatch(&head.command) {
            tracing::error!(error = %e, cmd = head.command.name(), "Failed to dispatch command");
            self.fail(e.to_string());
        }
    }
}
