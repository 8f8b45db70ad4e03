//! Orchestrated/passive adapter: interface only.
//!
//! The orchestration wire protocol is an external collaborator (spec.md
//! §1); this module fixes only the message shapes and the trait boundary
//! the transfer engine drives them through, matching spec.md §4.8 and §6.
//! A production build would implement `Orchestrator` against the real
//! coordinator RPC; tests implement it with an in-memory fake.
//!
//! The callback object a `Transfer` hands to its adapters is intentionally
//! narrow (spec.md §9 "cyclic ownership"): the adapters hold
//! `Arc<dyn TransferCallbacks>`, not a reference back to the full
//! `Transfer`, so the Transfer -> adapter -> Transfer cycle never has to
//! exist as an actual `Arc<Transfer>` cycle.

use std::io;
use std::sync::Arc;

use crate::error::Error;
use crate::intervals::IntervalSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateByteRanges {
    pub have: Vec<ByteRange>,
    pub readnow: Vec<ByteRange>,
    pub readahead: Vec<ByteRange>,
}

pub fn intervals_to_ranges(set: &IntervalSet) -> Vec<ByteRange> {
    set.export()
        .into_iter()
        .map(|iv| ByteRange {
            start: iv.start,
            end: iv.end,
        })
        .collect()
}

/// `download_id == 0` requests a new session (the server assigns an id);
/// a non-zero id joins the named session.
#[derive(Debug, Clone)]
pub struct StartOrchestrationRequest {
    pub download_id: i64,
    pub filename: String,
    pub hash: String,
}

/// Outbound operations the engine performs against an established
/// orchestration session.
pub trait OrchestratedSession: Send + Sync {
    fn download_id(&self) -> i64;
    fn set_byte_ranges(&self, ranges: UpdateByteRanges);
    fn set_have_handles(&self, have_handles: bool);
    /// Called by the initiator only, the first time the hash becomes
    /// known.
    fn set_hash(&self, hash: &str);
    fn upload_failed(&self, peer: &str);
    fn set_connected_peers(&self, peers: &[String]);
    fn close(&self);
}

/// One chunk of a peer-initiated push of bytes into this transfer, arriving
/// over the content-server RPC endpoint's inbound side during an
/// orchestrated session. That endpoint is external (spec.md §1); this is
/// only the shape the transfer engine forwards along.
pub struct PushedRange {
    pub start: u64,
    pub data: Vec<u8>,
}

/// A single inbound server-streamed push, handed to `Transfer` by whatever
/// hosts the content-server RPC endpoint.
pub trait PassiveTransferStream: Send {
    fn recv(&mut self) -> io::Result<Option<PushedRange>>;
}

/// The inbound half: receives pushed bytes from peers during a session.
pub trait PassiveAdapter: Send + Sync {
    /// Drains an inbound push stream, reporting received ranges back to the
    /// engine (typically by calling `TransferCallbacks::received_bytes` for
    /// each chunk as it arrives).
    fn handle_incoming(&self, stream: Box<dyn PassiveTransferStream>) -> Result<(), Error>;
    fn close(&self);
}

/// Narrow callback surface handed to the adapters by value, so they can
/// report inbound events without owning a reference to the whole
/// `Transfer`.
pub trait TransferCallbacks: Send + Sync {
    fn received_bytes(&self, start: u64, end: u64, peer: &str);
    fn upload_failed(&self, peer: &str);
    fn set_connected_peers(&self, peers: Vec<String>);
    fn orchestration_closed(&self);
}

/// Establishes (or joins) an orchestration session. The external
/// collaborator a real deployment plugs in here; see module docs.
pub trait Orchestrator: Send + Sync {
    fn start(
        &self,
        circle: &str,
        request: StartOrchestrationRequest,
        callbacks: Arc<dyn TransferCallbacks>,
    ) -> Result<(Arc<dyn OrchestratedSession>, Arc<dyn PassiveAdapter>), Error>;
}
