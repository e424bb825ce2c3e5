//! The message-processing layer of this binary.
//!
//! `tesserad` ships the networking core; the application protocol on top
//! of it is pluggable. This handler accepts every frame, logs it, and
//! produces nothing, which is enough to take part in the mesh: the core
//! itself handles handshake, gossip, liveness, relay and subscriptions.
use async_trait::async_trait;
use bitcoin::network::message::CommandString;
use tracing::debug;

use tessera_p2p::fsm::handler::{FrameHandler, Peer, Violation};

#[derive(Default)]
pub struct LogHandler {
    frames: u64,
}

#[async_trait]
impl FrameHandler for LogHandler {
    async fn frame_received(
        &mut self,
        peer: &Peer,
        command: &CommandString,
        payload: &[u8],
    ) -> Result<(), Violation> {
        self.frames += 1;

        debug!(
            "{}: `{}` frame with {} byte(s) (total {})",
            peer.addr,
            command,
            payload.len(),
            self.frames
        );
        Ok(())
    }

    async fn produce_frames(&mut self, _peer: &Peer, _trickle: bool) -> Vec<(CommandString, Vec<u8>)> {
        vec![]
    }
}
