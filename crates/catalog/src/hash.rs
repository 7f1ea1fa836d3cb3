use crate::error::{ErrorKind, Result};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const CHUNK_SIZE: usize = 64 * 1024;

/// Content fingerprint of a file: hex-encoded BLAKE3 of its bytes, read in
/// chunks so large meshes aren't loaded whole.
pub async fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = File::open(path).await.map_err(|e| ErrorKind::io(e, path))?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).await.map_err(|e| ErrorKind::io(e, path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
