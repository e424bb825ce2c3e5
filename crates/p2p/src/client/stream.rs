//! Message stream utilities.
//!
//! Turns the raw byte stream of a peer socket into framed messages.
use std::io;

use bitcoin::consensus::{deserialize_partial, encode};
use bitcoin::network::Magic;
use thiserror::Error;

use crate::wire::RawNetworkMessage;

/// Cap on the bytes buffered for a peer without a complete decodable
/// frame. A peer exceeding it is flooding us and is dropped.
pub const RECEIVE_BUFFER_LIMIT: usize = 36 * 1024 * 1024;

/// How many magic-mismatch resynchronizations a peer is granted before it
/// is considered hopeless.
pub const DESYNC_BUDGET: usize = 32;

/// A framing error.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The frame could not be decoded.
    #[error(transparent)]
    Encode(#[from] encode::Error),
    /// The peer filled its receive buffer without producing a frame.
    #[error("receive buffer limit exceeded without a complete frame")]
    ReceiveFlood,
    /// The stream kept losing frame alignment.
    #[error("framing desync budget exceeded")]
    Desync,
}

impl DecodeError {
    /// Whether this error is a flood-control breach.
    pub fn is_flood(&self) -> bool {
        matches!(self, Self::ReceiveFlood)
    }
}

/// Message stream decoder.
///
/// Bytes are fed in as they arrive; complete frames are pulled out.
/// Partial frames stay buffered. A frame whose magic does not match the
/// network is skipped by scanning forward to the next occurrence of the
/// magic bytes.
#[derive(Debug)]
pub struct Decoder {
    unparsed: Vec<u8>,
    magic: [u8; 4],
    resyncs: usize,
}

impl Decoder {
    /// Create a new stream decoder for the given network magic.
    pub fn new(magic: Magic, capacity: usize) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
            magic: magic.to_bytes(),
            resyncs: 0,
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next message. Returns [`None`] if no complete
    /// frame is buffered.
    pub fn decode_next(&mut self) -> Result<Option<RawNetworkMessage>, DecodeError> {
        loop {
            if self.unparsed.len() < self.magic.len() {
                return Ok(None);
            }
            if self.unparsed[..self.magic.len()] != self.magic {
                self.resync()?;
                continue;
            }

            match deserialize_partial(self.unparsed.as_slice()) {
                Ok((msg, index)) => {
                    self.unparsed.drain(..index);
                    return Ok(Some(msg));
                }
                Err(encode::Error::Io(ref err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    if self.unparsed.len() > RECEIVE_BUFFER_LIMIT {
                        return Err(DecodeError::ReceiveFlood);
                    }
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Drop garbage up to the next occurrence of the magic bytes.
    fn resync(&mut self) -> Result<(), DecodeError> {
        self.resyncs += 1;
        if self.resyncs > DESYNC_BUDGET {
            return Err(DecodeError::Desync);
        }

        match self.unparsed[1..]
            .windows(self.magic.len())
            .position(|window| window == self.magic)
        {
            Some(pos) => {
                self.unparsed.drain(..pos + 1);
            }
            None => {
                // No magic in sight; keep the tail that could still be the
                // start of one.
                let keep = self.magic.len() - 1;
                let garbage = self.unparsed.len().saturating_sub(keep);
                self.unparsed.drain(..garbage);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::network::Network;
    use crate::wire::NetworkMessage;
    use bitcoin::consensus::serialize;

    fn frame(payload: NetworkMessage) -> Vec<u8> {
        serialize(&RawNetworkMessage {
            magic: Network::Mainnet.magic(),
            payload,
        })
    }

    fn decoder() -> Decoder {
        Decoder::new(Network::Mainnet.magic(), 1024)
    }

    #[test]
    fn test_partial_then_complete() {
        let bytes = frame(NetworkMessage::Ping(7));
        let mut decoder = decoder();

        decoder.input(&bytes[..10]);
        assert!(decoder.decode_next().unwrap().is_none());

        decoder.input(&bytes[10..]);
        let msg = decoder.decode_next().unwrap().unwrap();
        assert_eq!(msg.payload, NetworkMessage::Ping(7));
        assert!(decoder.decode_next().unwrap().is_none());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut bytes = frame(NetworkMessage::Ping(1));
        bytes.extend(frame(NetworkMessage::Pong(1)));

        let mut decoder = decoder();
        decoder.input(&bytes);

        assert_eq!(
            decoder.decode_next().unwrap().unwrap().payload,
            NetworkMessage::Ping(1)
        );
        assert_eq!(
            decoder.decode_next().unwrap().unwrap().payload,
            NetworkMessage::Pong(1)
        );
    }

    #[test]
    fn test_resync_on_bad_magic() {
        let mut bytes = vec![0xde, 0xad, 0xbe, 0xef, 0x00];
        bytes.extend(frame(NetworkMessage::Ping(7)));

        let mut decoder = decoder();
        decoder.input(&bytes);

        let msg = decoder.decode_next().unwrap().unwrap();
        assert_eq!(msg.payload, NetworkMessage::Ping(7));
    }

    #[test]
    fn test_desync_budget() {
        let mut decoder = decoder();
        let mut result = Ok(None);

        for _ in 0..DESYNC_BUDGET + 1 {
            decoder.input(&[0xde, 0xad, 0xbe, 0xef]);
            result = decoder.decode_next();
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(DecodeError::Desync)));
    }

    #[test]
    fn test_corrupt_frame_is_fatal() {
        let mut bytes = frame(NetworkMessage::Ping(7));
        // Corrupt the checksum, leaving the magic intact.
        bytes[20] ^= 0xff;

        let mut decoder = decoder();
        decoder.input(&bytes);

        assert!(matches!(decoder.decode_next(), Err(DecodeError::Encode(_))));
    }
}
