// PhotonWire - non-blocking message server engine
// Slab-backed message buffers, incremental framing and a single-threaded socket loop

#![warn(rust_2018_idioms)]

pub mod buffer;
pub mod config;
pub mod framing;
pub mod metrics;
pub mod network;

// Re-exports for convenience
pub use buffer::{Message, SlabPool, SocketId};
pub use crate::config::EngineConfig;
pub use framing::{FramerFactory, MessageFramer};
pub use network::{MessageProcessor, Server, ServerHandle, WriteProxy};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// PhotonWire error types
pub mod error {
    use crate::buffer::PoolError;
    use crate::framing::FrameError;
    use crate::network::ConnectionError;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Pool error: {0}")]
        Pool(#[from] PoolError),

        #[error("Framing error: {0}")]
        Framing(#[from] FrameError),

        #[error("Connection error: {0}")]
        Connection(#[from] ConnectionError),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}
