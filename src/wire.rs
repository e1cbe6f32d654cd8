//! Kademlia DHT wire messages and stream framing.
//!
//! The overlay speaks varint length-delimited protobuf. Only the
//! FIND_NODE request and its `closer_peers` response are exercised by the
//! crawler, but the message structs carry the full tag layout of the DHT
//! schema so frames from conforming peers decode cleanly.
//!
//! Framing helpers ([`write_frame`] / [`read_frame`]) are shared by
//! transport implementations; message payloads cross the
//! [`crate::transport::MsgStream`] boundary as raw bytes.

use prost::Message as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::peer::{AddrInfo, PeerId};

/// Upper bound for a single wire message (matches the overlay's 4 MiB
/// stream message cap). Frames claiming more are rejected before any
/// allocation.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(message, repeated, tag = "8")]
    pub closer_peers: Vec<Peer>,
    #[prost(int32, tag = "10")]
    pub cluster_level_raw: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Peer {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
    #[prost(enumeration = "ConnectionType", tag = "3")]
    pub connection: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    PutValue = 0,
    GetValue = 1,
    AddProvider = 2,
    GetProviders = 3,
    FindNode = 4,
    Ping = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionType {
    NotConnected = 0,
    Connected = 1,
    CanConnect = 2,
    CannotConnect = 3,
}

/// Build a FIND_NODE request for the given keyspace target.
pub fn find_node(key: &[u8]) -> Message {
    Message {
        r#type: MessageType::FindNode as i32,
        key: key.to_vec(),
        closer_peers: Vec::new(),
        cluster_level_raw: 0,
    }
}

pub fn encode(msg: &Message) -> Vec<u8> {
    msg.encode_to_vec()
}

pub fn decode(bytes: &[u8]) -> Result<Message, prost::DecodeError> {
    Message::decode(bytes)
}

/// Convert a response's `closer_peers` into [`AddrInfo`]s. Peers with an
/// empty id are dropped; address entries that are not UTF-8 are skipped.
pub fn closer_addr_infos(msg: &Message) -> Vec<AddrInfo> {
    msg.closer_peers
        .iter()
        .filter(|p| !p.id.is_empty())
        .map(|p| {
            let addrs = p
                .addrs
                .iter()
                .filter_map(|a| String::from_utf8(a.clone()).ok())
                .collect();
            AddrInfo::new(PeerId::from_bytes(p.id.clone()), addrs)
        })
        .collect()
}

/// Write one unsigned-varint length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> std::io::Result<()> {
    let mut prefix = [0u8; 10];
    let mut len = data.len() as u64;
    let mut n = 0;
    loop {
        let byte = (len & 0x7f) as u8;
        len >>= 7;
        prefix[n] = if len > 0 { byte | 0x80 } else { byte };
        n += 1;
        if len == 0 {
            break;
        }
    }
    w.write_all(&prefix[..n]).await?;
    w.write_all(data).await?;
    w.flush().await
}

/// Read one unsigned-varint length-prefixed frame, rejecting lengths over
/// [`MAX_MESSAGE_SIZE`].
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len: u64 = 0;
    for shift in (0..70).step_by(7) {
        let byte = r.read_u8().await?;
        len |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            if len as usize > MAX_MESSAGE_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("frame of {len} bytes exceeds message size cap"),
                ));
            }
            let mut buf = vec![0u8; len as usize];
            r.read_exact(&mut buf).await?;
            return Ok(buf);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "frame length varint too long",
    ))
}
