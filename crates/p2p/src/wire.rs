//! Wire format.
//!
//! Every message is exchanged as a framed blob:
//!
//! `[magic:4][command:12 NUL-padded ASCII][payload_len:u32 LE][checksum:u32 LE][payload]`
//!
//! where the checksum is the first four bytes of the double-SHA256 of the
//! payload. The framing (length, checksum) is handled by the consensus
//! [`CheckedData`] codec. Only a small set of commands is interpreted here;
//! everything else is carried as an opaque `(command, payload)` pair for the
//! layer above.
use std::io::{self, Read};

use bitcoin::consensus::{
    encode::{self, CheckedData, VarInt},
    Decodable, Encodable,
};
use bitcoin::network::{
    address::Address, message::CommandString, message_network::VersionMessage, Magic,
};

/// Maximum size of a message payload, in bytes. A frame declaring more than
/// this is fatal for the peer.
pub const MAX_MESSAGE_SIZE: u64 = 32 * 1024 * 1024;

/// Maximum number of entries in an `inv` or `getdata` message.
pub const MAX_INV_ENTRIES: u64 = 50_000;

/// A compact identifier for a relayed data object: an object kind plus the
/// object's hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inventory {
    /// Object kind. The core doesn't interpret kinds; they are defined by
    /// the message-processing layer.
    pub kind: u32,
    /// Object hash.
    pub hash: [u8; 32],
}

impl std::fmt::Display for Inventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.hash.iter().rev() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, " ({})", self.kind)
    }
}

impl Encodable for Inventory {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.kind.consensus_encode(w)?;
        len += self.hash.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for Inventory {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(Self {
            kind: Decodable::consensus_decode(r)?,
            hash: Decodable::consensus_decode(r)?,
        })
    }
}

/// Length-prefixed list of inventories.
struct InventoryList(Vec<Inventory>);

impl Encodable for InventoryList {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = VarInt(self.0.len() as u64).consensus_encode(w)?;
        for inv in &self.0 {
            len += inv.consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl Decodable for InventoryList {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let count = VarInt::consensus_decode(r)?.0;
        if count > MAX_INV_ENTRIES {
            return Err(encode::Error::OversizedVectorAllocation {
                requested: count as usize,
                max: MAX_INV_ENTRIES as usize,
            });
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(Inventory::consensus_decode(r)?);
        }
        Ok(Self(items))
    }
}

/// A complete framed message, as sent between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNetworkMessage {
    /// Network-identity constant.
    pub magic: Magic,
    /// Message payload.
    pub payload: NetworkMessage,
}

/// Messages the core knows about. Anything else travels as [`NetworkMessage::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    /// Handshake announcement.
    Version(VersionMessage),
    /// Handshake acknowledgement.
    Verack,
    /// Gossip of peer addresses, with their last-seen timestamps.
    Addr(Vec<(u32, Address)>),
    /// Request for address gossip.
    GetAddr,
    /// Liveness probe, with a random nonce.
    Ping(u64),
    /// Liveness reply, echoing the probe nonce.
    Pong(u64),
    /// Announcement of available data objects.
    Inv(Vec<Inventory>),
    /// Request for announced data objects.
    GetData(Vec<Inventory>),
    /// Channel subscription.
    Subscribe {
        /// Channel number.
        channel: u32,
        /// Remaining propagation hops.
        hops: u32,
    },
    /// Channel subscription cancellation.
    SubCancel {
        /// Channel number.
        channel: u32,
    },
    /// An opaque message, relayed to the message-processing layer.
    Unknown {
        /// The command of this message.
        command: CommandString,
        /// The payload of this message.
        payload: Vec<u8>,
    },
}

impl NetworkMessage {
    /// The wire command of this message.
    pub fn cmd(&self) -> &'static str {
        match *self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::Verack => "verack",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::Subscribe { .. } => "subscribe",
            NetworkMessage::SubCancel { .. } => "sub-cancel",
            NetworkMessage::Unknown { .. } => "unknown",
        }
    }

    /// Return the [`CommandString`] for the message command.
    pub fn command(&self) -> CommandString {
        match self {
            NetworkMessage::Unknown { command, .. } => command.clone(),
            _ => CommandString::try_from_static(self.cmd()).expect("cmd returns valid commands"),
        }
    }
}

impl RawNetworkMessage {
    /// Return the [`CommandString`] for the message command.
    pub fn command(&self) -> CommandString {
        self.payload.command()
    }
}

fn serialize<T: Encodable + ?Sized>(data: &T) -> Vec<u8> {
    let mut encoder = Vec::new();
    let len = data
        .consensus_encode(&mut encoder)
        .expect("in-memory writers don't error");
    debug_assert_eq!(len, encoder.len());
    encoder
}

impl Encodable for RawNetworkMessage {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.magic.consensus_encode(w)?;
        len += self.command().consensus_encode(w)?;
        len += CheckedData(match self.payload {
            NetworkMessage::Version(ref msg) => serialize(msg),
            NetworkMessage::Addr(ref addrs) => serialize(addrs),
            NetworkMessage::Ping(nonce) | NetworkMessage::Pong(nonce) => serialize(&nonce),
            NetworkMessage::Inv(ref inv) => serialize(&InventoryList(inv.to_vec())),
            NetworkMessage::GetData(ref inv) => serialize(&InventoryList(inv.to_vec())),
            NetworkMessage::Subscribe { channel, hops } => {
                let mut buf = serialize(&channel);
                buf.extend(serialize(&hops));
                buf
            }
            NetworkMessage::SubCancel { channel } => serialize(&channel),
            NetworkMessage::Verack | NetworkMessage::GetAddr => vec![],
            NetworkMessage::Unknown {
                payload: ref bytes, ..
            } => bytes.clone(),
        })
        .consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for RawNetworkMessage {
    fn consensus_decode_from_finite_reader<R: io::Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        let magic = Decodable::consensus_decode(r)?;
        let cmd = CommandString::consensus_decode(r)?;
        let raw_payload = CheckedData::consensus_decode(r)?.0;

        let mut reader = io::Cursor::new(raw_payload);

        let payload = match &cmd.to_string()[..] {
            "version" => NetworkMessage::Version(Decodable::consensus_decode(&mut reader)?),
            "verack" => NetworkMessage::Verack,
            "addr" => NetworkMessage::Addr(Decodable::consensus_decode(&mut reader)?),
            "getaddr" => NetworkMessage::GetAddr,
            "ping" => NetworkMessage::Ping(Decodable::consensus_decode(&mut reader)?),
            "pong" => NetworkMessage::Pong(Decodable::consensus_decode(&mut reader)?),
            "inv" => NetworkMessage::Inv(InventoryList::consensus_decode(&mut reader)?.0),
            "getdata" => NetworkMessage::GetData(InventoryList::consensus_decode(&mut reader)?.0),
            "subscribe" => NetworkMessage::Subscribe {
                channel: Decodable::consensus_decode(&mut reader)?,
                hops: Decodable::consensus_decode(&mut reader)?,
            },
            "sub-cancel" => NetworkMessage::SubCancel {
                channel: Decodable::consensus_decode(&mut reader)?,
            },
            _ => NetworkMessage::Unknown {
                command: cmd,
                payload: reader.into_inner(),
            },
        };
        Ok(RawNetworkMessage { magic, payload })
    }

    #[inline]
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Self::consensus_decode_from_finite_reader(r.take(MAX_MESSAGE_SIZE).by_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::network::Network;
    use bitcoin::consensus::{deserialize, serialize as consensus_serialize};
    use bitcoin_hashes::{sha256d, Hash};
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    fn raw(payload: NetworkMessage) -> RawNetworkMessage {
        RawNetworkMessage {
            magic: Network::Mainnet.magic(),
            payload,
        }
    }

    #[test]
    fn test_frame_layout() {
        let msg = raw(NetworkMessage::Ping(0x4242_4242_4242_4242));
        let bytes = consensus_serialize(&msg);

        // Magic, command, length, checksum, payload.
        assert_eq!(&bytes[..4], &Network::Mainnet.magic().to_bytes()[..]);
        assert_eq!(&bytes[4..16], &b"ping\0\0\0\0\0\0\0\0"[..]);
        assert_eq!(&bytes[16..20], &8u32.to_le_bytes()[..]);

        let payload = &bytes[24..];
        let checksum = sha256d::Hash::hash(payload);
        assert_eq!(&bytes[20..24], &checksum[..4]);
        assert_eq!(payload, &0x4242_4242_4242_4242u64.to_le_bytes()[..]);
    }

    #[test]
    fn test_corrupt_checksum() {
        let msg = raw(NetworkMessage::Ping(7));
        let mut bytes = consensus_serialize(&msg);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        deserialize::<RawNetworkMessage>(&bytes).unwrap_err();
    }

    #[test]
    fn test_roundtrip() {
        let addr: std::net::SocketAddr = ([83, 10, 9, 7], 9333).into();
        let messages = vec![
            NetworkMessage::Verack,
            NetworkMessage::GetAddr,
            NetworkMessage::Ping(17),
            NetworkMessage::Pong(17),
            NetworkMessage::Addr(vec![(
                1_700_000_000,
                Address::new(&addr, bitcoin::network::constants::ServiceFlags::NETWORK),
            )]),
            NetworkMessage::Inv(vec![Inventory {
                kind: 1,
                hash: [0xab; 32],
            }]),
            NetworkMessage::GetData(vec![Inventory {
                kind: 2,
                hash: [0xcd; 32],
            }]),
            NetworkMessage::Subscribe {
                channel: 3,
                hops: 2,
            },
            NetworkMessage::SubCancel { channel: 3 },
            NetworkMessage::Unknown {
                command: CommandString::try_from_static("block").unwrap(),
                payload: vec![1, 2, 3],
            },
        ];

        for payload in messages {
            let msg = raw(payload);
            let bytes = consensus_serialize(&msg);
            let decoded: RawNetworkMessage = deserialize(&bytes).unwrap();

            assert_eq!(decoded, msg);
        }
    }

    #[derive(Debug, Clone)]
    struct OpaqueFrame(String, Vec<u8>);

    impl Arbitrary for OpaqueFrame {
        fn arbitrary(g: &mut Gen) -> Self {
            let len = usize::arbitrary(g) % 12 + 1;
            let command: String = (0..len)
                .map(|_| char::from(*g.choose(b"abcdefghijklmnopqrstuvwxyz-").unwrap()))
                .collect();
            let payload: Vec<u8> = Vec::arbitrary(g);

            Self(command, payload)
        }
    }

    #[test]
    fn prop_unknown_roundtrip() {
        fn prop(frame: OpaqueFrame) -> bool {
            // Commands the codec interprets are not opaque.
            if [
                "version",
                "verack",
                "addr",
                "getaddr",
                "ping",
                "pong",
                "inv",
                "getdata",
                "subscribe",
                "sub-cancel",
            ]
            .contains(&frame.0.as_str())
            {
                return true;
            }
            let Ok(command) = CommandString::try_from(frame.0.clone()) else {
                return true;
            };
            let msg = raw(NetworkMessage::Unknown {
                command,
                payload: frame.1,
            });
            let bytes = consensus_serialize(&msg);

            deserialize::<RawNetworkMessage>(&bytes).ok() == Some(msg)
        }
        QuickCheck::new()
            .tests(100)
            .quickcheck(prop as fn(OpaqueFrame) -> bool);
    }
}
