//! Peer-to-peer networking errors.

use std::fmt::Debug;
use std::io;

use thiserror::Error;

/// An error occuring in the networking code.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The listen socket could not be created or bound. Fatal for startup.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: std::net::SocketAddr,
        /// The underlying error.
        source: io::Error,
    },

    /// A channel send or receive error.
    #[error("channel error: {0}")]
    Channel(Box<dyn std::error::Error + Send + Sync + 'static>),
}
