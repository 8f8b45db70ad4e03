//! Peer identity and the content-streaming RPC contract.
//!
//! The actual network transport (the content-server RPC endpoint) is an
//! external collaborator out of scope for this crate (spec.md §1); what's
//! in scope is the shape of the request/response the transfer engine
//! drives. `PeerClient` plays the role of the generated gRPC client stub in
//! the Go original (`t.peers[pno].ContentServiceClient().ReadFile(...)`).

use std::io;
use std::sync::Arc;

use crate::error::Error;

/// A remote member of a circle, named `user@circle`.
#[derive(Clone)]
pub struct Peer {
    pub name: String,
    pub client: Arc<dyn PeerClient>,
}

impl Peer {
    pub fn new(name: impl Into<String>, client: Arc<dyn PeerClient>) -> Self {
        Peer {
            name: name.into(),
            client,
        }
    }
}

/// Splits a `user@circle` peer name on its *last* `@`, returning the
/// circle component. Peer names without an `@` are rejected at this
/// boundary rather than left to silently misbehave further in (spec.md §9
/// "Peer name parsing ambiguity").
pub fn circle_from_peer(name: &str) -> Result<String, Error> {
    match name.rfind('@') {
        Some(idx) => Ok(name[idx + 1..].to_string()),
        None => Err(Error::InvalidPeerName(name.to_string())),
    }
}

#[derive(Debug, Clone)]
pub struct ReadFileRequest {
    pub filename: String,
    pub offset: u64,
    pub read_now: u64,
    pub read_ahead: u64,
}

/// One chunk of a server-streaming `ReadFile` response. `redirect` is
/// non-zero when the peer wants the receiver to join an orchestrated
/// session instead of continuing to be served point-to-point.
#[derive(Debug, Clone, Default)]
pub struct ReadFileChunk {
    pub data: Vec<u8>,
    pub redirect_to_orchestrated_download: i64,
}

/// A single in-flight server-streaming RPC. Chunks are received in order;
/// `recv` returning `Ok(None)` is a clean end of stream.
pub trait ContentStream: Send {
    fn recv(&mut self) -> io::Result<Option<ReadFileChunk>>;
}

/// What the transfer engine needs from a peer connection.
pub trait PeerClient: Send + Sync {
    fn read_file(&self, req: ReadFileRequest) -> io::Result<Box<dyn ContentStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circle_from_peer_splits_on_last_at() {
        assert_eq!(circle_from_peer("alice@home").unwrap(), "home");
        assert_eq!(circle_from_peer("a@b@home").unwrap(), "home");
    }

    #[test]
    fn circle_from_peer_rejects_missing_at() {
        assert!(circle_from_peer("alice").is_err());
    }
}
