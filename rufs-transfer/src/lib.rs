#![allow(clippy::new_without_default)]

pub mod actor;
pub mod error;
pub mod handle_watcher;
pub mod intervals;
pub mod orchestration;
pub mod peer;
pub mod registry;
pub mod storage;
pub mod transfer;

pub use error::Error;
pub use intervals::{Interval, IntervalSet};
pub use peer::{circle_from_peer, ContentStream, Peer, PeerClient, ReadFileChunk, ReadFileRequest};
pub use transfer::{open_local_file, open_remote_file, ReadResult, Transfer, TransferHandle};
