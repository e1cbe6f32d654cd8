//! Peer identities and addresses.
//!
//! A [`PeerId`] is an opaque byte string (typically a multihash of the
//! peer's public key). The crawler never interprets it beyond byte equality
//! and lexicographic ordering; its position in the Kademlia keyspace is the
//! SHA-256 digest of the raw bytes ([`PeerId::kad_key`]).
//!
//! Addresses travel as strings, either multiaddr-style
//! (`/ip4/1.2.3.4/tcp/4001`) or plain `host:port`. Before dialling, the
//! crawler drops addresses that cannot be reached across the public
//! network ([`strip_local_addrs`]).

use std::fmt;
use std::net::IpAddr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// A position in the Kademlia keyspace: the SHA-256 digest of a key.
pub type KadKey = [u8; 32];

/// Opaque peer identifier. Equality is byte equality; ordering is
/// lexicographic over the raw bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }

    /// Keyspace position of this peer: `SHA-256(id_bytes)`.
    pub fn kad_key(&self) -> KadKey {
        Sha256::digest(&self.0).into()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        let short = if hex.len() > 16 { &hex[..16] } else { &hex };
        write!(f, "PeerId({}…)", short)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::from_hex(&s).map_err(de::Error::custom)
    }
}

/// A peer together with the addresses it was announced under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddrInfo {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

impl AddrInfo {
    pub fn new(id: PeerId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }
}

/// Drop addresses that cannot be dialled across the public network:
/// loopback, link-local, unspecified and RFC 1918 private ranges.
/// Addresses whose host does not parse as an IP (DNS names, relay
/// circuits) are kept; classifying them is the dialler's problem.
pub fn strip_local_addrs(info: &AddrInfo) -> AddrInfo {
    let addrs = info
        .addrs
        .iter()
        .filter(|a| match addr_host(a) {
            Some(ip) => !is_unroutable(ip),
            None => true,
        })
        .cloned()
        .collect();
    AddrInfo { id: info.id.clone(), addrs }
}

/// Addresses in `candidates` (after local stripping) that are not already
/// in `known`, in candidate order.
pub fn find_new_addrs(known: &[String], candidates: &[String]) -> Vec<String> {
    candidates
        .iter()
        .filter(|a| !known.contains(a))
        .cloned()
        .collect()
}

/// Extract the host IP of an address string.
///
/// Handles:
/// - multiaddr: `/ip4/192.0.2.1/tcp/4001`, `/ip6/::1/udp/4001/quic`
/// - socket form: `192.0.2.1:8080`, `[::1]:8080`
/// - bare host: `192.0.2.1`
fn addr_host(addr: &str) -> Option<IpAddr> {
    if let Some(rest) = addr.strip_prefix('/') {
        let mut parts = rest.split('/');
        return match (parts.next(), parts.next()) {
            (Some("ip4"), Some(host)) | (Some("ip6"), Some(host)) => host.parse().ok(),
            _ => None,
        };
    }
    let host = if let Some(bracket_end) = addr.find(']') {
        // IPv6: [::1]:port
        addr.get(1..bracket_end)?
    } else if let Some(colon_pos) = addr.rfind(':') {
        &addr[..colon_pos]
    } else {
        addr
    };
    host.parse().ok()
}

fn is_unroutable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_link_local() || v4.is_private() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            // fe80::/10 link-local
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
