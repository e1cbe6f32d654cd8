//! Crawl error taxonomy.
//!
//! Harvest failures are not all equal: some mean the peer was never
//! contactable (`NoRoutableAddress`, `DialFailed`), some happen after a
//! stream was established and may leave a usable partial result behind
//! (`ProtocolIo`, `Decode`, `Deadline`), and one is a non-fatal signal that
//! the bucket space was fully traversed (`PrefixLimitReached`). The
//! dispatcher and the harvester branch on these variants, so they are a
//! typed enum rather than opaque `anyhow` errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlError {
    /// Every advertised address was loopback, link-local or otherwise
    /// unroutable. The peer is uncontactable by design; no dial is attempted.
    #[error("peer {peer} advertises only unroutable addresses")]
    NoRoutableAddress { peer: String },

    /// No listed address accepted a connection before the attempt deadline.
    #[error("dial failed: {0}")]
    DialFailed(String),

    /// The connection was established but no DHT stream could be negotiated.
    #[error("stream negotiation failed: {0}")]
    StreamFailed(String),

    /// Write or read failure on an established stream. The stream is in an
    /// undefined state afterwards; callers must not reuse it.
    #[error("protocol i/o failed: {0}")]
    ProtocolIo(String),

    /// The remote's response did not parse as a DHT message.
    #[error("response decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    /// All precomputed buckets were queried and every round still returned
    /// new peers. Carries no data itself; the accumulated peer list is
    /// complete up to the precomputation depth and is reported as a success.
    #[error("prefix limit reached")]
    PrefixLimitReached,

    /// A bucket past the preimage table's depth was requested.
    #[error("no preimage for cpl {cpl}: table depth is {depth}")]
    PreimageDepthExceeded { cpl: u8, depth: u8 },

    /// A bucket inside the table's depth has no entry. Only reachable with
    /// sparse tables built via `PreimageTable::from_rows`; the file loader
    /// rejects gaps.
    #[error("preimage table has no entry for bucket {bucket}")]
    PreimageMissing { bucket: u32 },

    /// The per-attempt deadline expired during a dial, stream open, send or
    /// receive.
    #[error("deadline exceeded")]
    Deadline,
}
