//! Content checksums
//!
//! SHA-256 of the audio file content. Analysis results are keyed to the
//! checksum so a consumer can tell whether a side-record still describes the
//! file next to it.

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read buffer size (1MB chunks)
const CHUNK_SIZE: usize = 1024 * 1024;

/// Calculate the hex-encoded SHA-256 of a file's content
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to open {} for hashing: {}", path.display(), e),
        ))
    })?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("abc.bin");
        std::fs::write(&path, b"abc").unwrap();

        // SHA-256("abc")
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_spans_read_chunks() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("audio.bin");
        let data = vec![7u8; CHUNK_SIZE + 17];
        std::fs::write(&path, &data).unwrap();

        let mut hasher = Sha256::new();
        hasher.update(&data);
        assert_eq!(sha256_file(&path).unwrap(), to_hex(&hasher.finalize()));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = sha256_file(Path::new("/nonexistent/songshare/audio.mp3"));
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
