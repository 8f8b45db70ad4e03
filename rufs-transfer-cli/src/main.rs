//! Demo/smoke-test driver for the transfer engine: serves a local file
//! through a single in-process fake peer, then reads it back end to end
//! through `Transfer`, proving out open/read/close without any real network
//! stack (the content-server RPC endpoint and peer connectivity are out of
//! scope for this crate).

use std::{
    env, fs,
    io::{self, Write},
    sync::Arc,
};

use rufs_transfer::{
    open_remote_file, ContentStream, Peer, PeerClient, ReadFileChunk, ReadFileRequest, ReadResult,
};

/// Wire chunk size the fake peer hands back per `recv()` call, independent
/// of the engine's own `MAX_DOWNLOAD_SIZE` request clamp.
const WIRE_CHUNK_SIZE: usize = 16 * 1024;

struct LocalFilePeer {
    data: Vec<u8>,
}

struct ChunkedStream {
    remaining: Vec<ReadFileChunk>,
}

impl ContentStream for ChunkedStream {
    fn recv(&mut self) -> io::Result<Option<ReadFileChunk>> {
        if self.remaining.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.remaining.remove(0)))
        }
    }
}

impl PeerClient for LocalFilePeer {
    fn read_file(&self, req: ReadFileRequest) -> io::Result<Box<dyn ContentStream>> {
        let start = req.offset as usize;
        let end = ((req.offset + req.read_now) as usize).min(self.data.len());
        let mut chunks = Vec::new();
        let mut pos = start;
        while pos < end {
            let next = (pos + WIRE_CHUNK_SIZE).min(end);
            chunks.push(ReadFileChunk {
                data: self.data[pos..next].to_vec(),
                redirect_to_orchestrated_download: 0,
            });
            pos = next;
        }
        Ok(Box::new(ChunkedStream { remaining: chunks }))
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let path = args
        .get(1)
        .expect("usage: rufs-transfer-cli <path-to-file>");

    let data = fs::read(path).expect("failed to read source file");
    let size = data.len() as u64;

    let peer = Peer::new("demo@local", Arc::new(LocalFilePeer { data }));
    let mut handle =
        open_remote_file(path, None, size, vec![peer], None).expect("failed to open transfer");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut offset = 0u64;
    loop {
        match handle.read(offset, 64 * 1024).expect("read failed") {
            ReadResult::Eof => break,
            ReadResult::Data(buf) if buf.is_empty() => break,
            ReadResult::Data(buf) => {
                offset += buf.len() as u64;
                out.write_all(&buf).expect("write to stdout failed");
                log::debug!("served {offset}/{size} bytes");
            }
        }
    }
    handle.close();
}
