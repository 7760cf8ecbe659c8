use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use crate::error::{Result, ShakerError};

/// Read size for streaming digests.
pub const HASH_CHUNK_SIZE: usize = 8 * 1024;

/// Compute the SHA-256 of a file's contents as lowercase hex.
///
/// The file is streamed in 8 KiB chunks, so size does not matter. Open and
/// read failures name the file.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|source| ShakerError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    hash_reader(BufReader::new(file)).map_err(|source| ShakerError::FileRead {
        path: path.to_path_buf(),
        source,
    })
}

/// Digest everything `reader` yields.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Digest of an in-memory buffer, identical to hashing a file with the same bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
