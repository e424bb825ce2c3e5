//! The p2p client library: a runnable service wrapping the protocol state
//! machine, and the handle used to talk to it.
#![allow(clippy::type_complexity)]
mod controller;
pub use controller::*;
mod boot_nodes;
mod error;
pub mod peer;

pub mod handle;
mod service;
pub(crate) mod stream;

pub use error::Error;
pub use stream::{DecodeError, RECEIVE_BUFFER_LIMIT};
