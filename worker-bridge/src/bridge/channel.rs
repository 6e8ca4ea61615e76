//! Duplex connection to one worker.
//!
//! - [`Channel`]: controller side. Fire-and-forget command sends, ordered inbound events.
//! - [`WorkerChannel`]: worker side of the same connection.
//!
//! [`Channel::pair`] connects both ends in memory. `from_io` runs either end over a byte
//! stream with [`JsonCodec`] framing. Every transport problem (undecodable frame, bad message
//! shape, EOF) is delivered in-band as an `Err` and ends the inbound stream.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::{Command, ProtocolError, RawWorkerMessage, WorkerMessage};
use crate::config::BridgeConfig;

/// One inbound event: a decoded message or a transport fault.
pub type Inbound = Result<WorkerMessage, ChannelError>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed worker message: {0}")]
    Malformed(#[from] ProtocolError),
    #[error("channel closed")]
    Closed,
}

/// Outbound half of the controller side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandSender {
    /// Queue a command for the worker without waiting for it to be written.
    pub fn send(&self, command: Command) -> Result<(), ChannelError> {
        self.tx.send(command).map_err(|_| ChannelError::Closed)
    }
}

/// Controller side of a worker connection.
pub struct Channel {
    sender: CommandSender,
    inbound: mpsc::Receiver<Inbound>,
}

impl Channel {
    /// In-memory connection. The worker end is usually driven by
    /// [`serve_worker`](crate::worker::serve_worker) on another task.
    pub fn pair(config: &BridgeConfig) -> (Channel, WorkerChannel) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::channel(config.inbound_capacity);

        let channel = Channel {
            sender: CommandSender { tx: cmd_tx },
            inbound: msg_rx,
        };
        let worker = WorkerChannel {
            commands: cmd_rx,
            messages: msg_tx,
        };
        (channel, worker)
    }

    /// Controller side over a byte stream. Spawns a reader and a writer task on the
    /// current runtime.
    pub fn from_io<R, W>(reader: R, writer: W, config: &BridgeConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (msg_tx, msg_rx) = mpsc::channel::<Inbound>(config.inbound_capacity);

        let mut framed_writer = FramedWrite::new(
            writer,
            JsonCodec::<Command>::with_max_frame_length(config.max_frame_length),
        );
        let fault_tx = msg_tx.clone();
        tokio::spawn(async move {
            while let Some(command) = cmd_rx.recv().await {
                tracing::trace!(cmd = command.name(), "Writing command frame");
                if let Err(e) = framed_writer.send(command).await {
                    tracing::error!(error = %e, "Failed to write command frame");
                    let _ = fault_tx.send(Err(ChannelError::Io(e))).await;
                    break;
                }
            }
            tracing::debug!("Command writer task exiting");
        });

        let mut framed_reader = FramedRead::new(
            reader,
            JsonCodec::<RawWorkerMessage>::with_max_frame_length(config.max_frame_length),
        );
        tokio::spawn(async move {
            loop {
                // EOF is reported explicitly: the writer task holds a sender too, so the
                // receiver would otherwise never observe the stream ending.
                let frame = tokio::select! {
                    frame = framed_reader.next() => frame,
                    _ = msg_tx.closed() => break,
                };
                let inbound = match frame {
                    Some(Ok(raw)) => WorkerMessage::try_from(raw).map_err(ChannelError::from),
                    Some(Err(e)) => Err(ChannelError::Io(e)),
                    None => Err(ChannelError::Closed),
                };
                let fatal = inbound.is_err();
                if msg_tx.send(inbound).await.is_err() || fatal {
                    break;
                }
            }
            tracing::debug!("Worker message reader task exiting");
        });

        Channel {
            sender: CommandSender { tx: cmd_tx },
            inbound: msg_rx,
        }
    }

    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    /// Next inbound event, or `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    pub(crate) fn into_parts(self) -> (CommandSender, mpsc::Receiver<Inbound>) {
        (self.sender, self.inbound)
    }
}

/// Worker side of a connection.
pub struct WorkerChannel {
    commands: mpsc::UnboundedReceiver<Command>,
    messages: mpsc::Sender<Inbound>,
}

impl WorkerChannel {
    /// Worker side over a byte stream. A fault reported through [`WorkerChannel::fault`]
    /// closes the stream, which the controller sees as a closed channel.
    pub fn from_io<R, W>(reader: R, writer: W, config: &BridgeConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (msg_tx, mut msg_rx) = mpsc::channel::<Inbound>(config.inbound_capacity);

        let mut framed_reader = FramedRead::new(
            reader,
            JsonCodec::<Command>::with_max_frame_length(config.max_frame_length),
        );
        tokio::spawn(async move {
            loop {
                // Stop reading once the worker end is dropped so the stream can close.
                let frame = tokio::select! {
                    frame = framed_reader.next() => frame,
                    _ = cmd_tx.closed() => break,
                };
                let Some(frame) = frame else {
                    break;
                };
                match frame {
                    Ok(command) => {
                        if cmd_tx.send(command).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read command frame");
                        break;
                    }
                }
            }
            tracing::debug!("Command reader task exiting");
        });

        let mut framed_writer = FramedWrite::new(
            writer,
            JsonCodec::<RawWorkerMessage>::with_max_frame_length(config.max_frame_length),
        );
        tokio::spawn(async move {
            while let Some(inbound) = msg_rx.recv().await {
                match inbound {
                    Ok(msg) => {
                        if let Err(e) = framed_writer.send(RawWorkerMessage::from(msg)).await {
                            tracing::error!(error = %e, "Failed to write worker message frame");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Closing worker channel after reported fault");
                        break;
                    }
                }
            }
            tracing::debug!("Worker message writer task exiting");
        });

        WorkerChannel {
            commands: cmd_rx,
            messages: msg_tx,
        }
    }

    /// Next command from the controller, or `None` once the controller is gone.
    pub async fn recv(&mut self) -> Option<Command> {
        self.commands.recv().await
    }

    pub async fn send(&self, msg: WorkerMessage) -> Result<(), ChannelError> {
        self.messages
            .send(Ok(msg))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Send a message in wire shape. A shape the protocol rejects reaches the controller
    /// as a transport fault.
    pub async fn send_raw(&self, raw: RawWorkerMessage) -> Result<(), ChannelError> {
        let inbound = WorkerMessage::try_from(raw).map_err(ChannelError::from);
        self.messages
            .send(inbound)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Surface a transport fault to the controller.
    pub async fn fault(&self, error: ChannelError) -> Result<(), ChannelError> {
        self.messages
            .send(Err(error))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    pub(crate) fn message_sender(&self) -> mpsc::Sender<Inbound> {
        self.messages.clone()
    }
}
