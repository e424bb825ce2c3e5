//! Protocol state machines.
//!
//! Each sub-protocol of the network layer is implemented as its own
//! manager; [`handler::StateMachine`] ties them together and dispatches
//! network input between them.
pub mod addrmgr;
pub mod banmgr;
pub mod event;
pub mod handler;
pub mod output;
pub mod peermgr;
pub mod pingmgr;
pub mod relaymgr;
