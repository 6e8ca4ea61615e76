//! worker-bridge: single-flight command bridge to an isolated endpoint worker.
//!
//! The controller talks to exactly one worker over a [`Channel`]. Commands are serialized so
//! only one is ever outstanding; replies are matched to commands by order alone. Response
//! bodies stream back out-of-band and are reassembled per request.

pub mod body;
pub mod bridge;
pub mod config;
pub mod logging;
pub mod queue;
pub mod session;
pub mod worker;

pub use body::{BodyAssembler, BodyReader, BodyState};
pub use bridge::channel::{Channel, ChannelError, CommandSender, WorkerChannel};
pub use bridge::protocol::{Command, HandlerReply, RequestId, WorkerMessage};
pub use config::BridgeConfig;
pub use logging::init_tracing;
pub use queue::{CorrelationQueue, Outbound};
pub use session::{BridgeError, BridgeId, HandlerResponse, WorkerBridge};
pub use worker::{BodySender, EndpointHandler, HandlerError, serve_worker};
