//! Non-blocking connection engine
//!
//! ```text
//!            Acceptor thread                    SocketProcessor thread
//! listener ──accept──→ Admission queue ──→ admit → read → frame → process
//!                       (bounded)                                  │
//!                                           write ← route ← outbound queue
//!                                                                  ▲
//!                              other threads ── OutboundSender ────┘
//! ```
//!
//! [`Server`] wires the two threads together and hands back a
//! [`ServerHandle`] for shutdown and out-of-band sends.

pub mod accept;
pub mod connection;
pub mod outbound;
pub mod processor;
pub mod server;
pub mod writer;

use crate::buffer::PoolError;
use crate::framing::FrameError;
use std::io;
use thiserror::Error;

pub use accept::{Acceptor, Admission};
pub use connection::{Connection, ReadOutcome, ReadState};
pub use outbound::{processor_fn, MessageProcessor, OutboundSender, RemoteOutbound, WriteProxy};
pub use processor::{Backoff, CycleReport, SocketProcessor};
pub use server::{Server, ServerHandle};
pub use writer::{MessageWriter, WriteOutcome};

/// Failure confined to a single connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("processing error: {0}")]
    Processor(String),
}
