//! Content hashing compatible with the remote store's content_hash field
//!
//! The file is split into 4 MiB blocks, each block is hashed with SHA-256,
//! and the concatenated block digests are hashed once more. Local and remote
//! hashes are compared directly, so this must match the server bit for bit.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::Result;

/// Block size used by the remote store's content hash
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Hash the file at `path`.
pub fn content_hash(path: impl AsRef<Path>) -> Result<String> {
    let file = File::open(path.as_ref())?;
    Ok(content_hash_reader(file)?)
}

/// Hash everything readable from `reader`.
pub fn content_hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut combined = Sha256::new();
    let mut block = Vec::with_capacity(BLOCK_SIZE);

    loop {
        block.clear();
        let n = (&mut reader).take(BLOCK_SIZE as u64).read_to_end(&mut block)?;
        if n == 0 {
            break;
        }
        combined.update(Sha256::digest(&block));
        if n < BLOCK_SIZE {
            break;
        }
    }

    // No blocks leaves the digest of the empty sequence.
    Ok(hex::encode(combined.finalize()))
}

/// Hash an in-memory buffer.
pub fn content_hash_bytes(data: &[u8]) -> String {
    let mut combined = Sha256::new();
    for block in data.chunks(BLOCK_SIZE) {
        combined.update(Sha256::digest(block));
    }
    hex::encode(combined.finalize())
}
