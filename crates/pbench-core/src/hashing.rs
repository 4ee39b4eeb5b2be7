//! MD5 content hashing for tarballs and their checksum sidecars.
//!
//! A dataset's resource id is the MD5 of its tarball. Sidecar files use the
//! `md5sum` layout: `<hex digest>  <file name>`.

use crate::{PbenchError, Result};
use md5::{Digest, Md5};
use std::io::Read;
use std::path::Path;

/// Chunk size for reading files (8MB).
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Compute the MD5 of a file as lowercase hex.
pub fn compute_md5(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| PbenchError::io_with_path(e, path))?;

    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| PbenchError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Check that a string looks like an MD5 hex digest.
pub fn is_md5(value: &str) -> bool {
    value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Read the digest from a sidecar file.
pub fn read_md5_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| PbenchError::io_with_path(e, path))?;
    match text.split_whitespace().next() {
        Some(digest) if is_md5(digest) => Ok(digest.to_lowercase()),
        _ => Err(PbenchError::DatasetBadParameterType {
            value: text.trim().to_string(),
            expected: format!("MD5 digest in {}", path.display()),
        }),
    }
}

/// Write a sidecar file for `file_name`.
pub fn write_md5_file(path: impl AsRef<Path>, digest: &str, file_name: &str) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, format!("{digest}  {file_name}\n"))
        .map_err(|e| PbenchError::io_with_path(e, path))
}

/// Verify a file's MD5 against an expected digest.
pub fn verify_md5(path: impl AsRef<Path>, expected: &str) -> Result<bool> {
    Ok(compute_md5(path)?.eq_ignore_ascii_case(expected))
}
