//! Peer-to-peer networking core.
//!
//! Maintains a mesh of outbound and inbound connections to other nodes,
//! discovers and persists peer addresses, enforces network diversity,
//! frames and exchanges messages, and hands opaque frames to the
//! message-processing layer above.
//!
//! Protocol logic is implemented sans-IO in [`fsm`]; socket handling lives
//! in [`net`]; [`client`] ties the two into a runnable service.
#![allow(clippy::type_complexity)]
pub mod client;
pub mod common;
pub mod fsm;
pub mod net;
pub mod wire;
