//! Transport layer between controller and worker.
//!
//! - **protocol**: Message types (Command, WorkerMessage, wire-level RawWorkerMessage)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **channel**: Controller and worker ends of one connection

pub mod channel;
pub mod codec;
pub mod protocol;
