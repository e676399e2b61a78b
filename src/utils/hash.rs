//! MD5 digests for chunk and whole-file integrity checks.
//!
//! All digests are rendered as 32-character lowercase hex, which is the
//! form that travels in `chunk_md5` / `file_md5`. Comparisons are
//! case-insensitive so peers that upper-case their hex still verify.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

/// Buffer size for streaming digests.
const READ_BUFFER: usize = 8 * 1024;

/// MD5 of a byte slice as lowercase hex.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// MD5 of everything readable from `reader`, computed in 8 KiB steps so the
/// input is never held in memory at once.
pub fn md5_stream<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Md5::new();
    let mut buffer = [0u8; READ_BUFFER];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// MD5 of a file's contents as lowercase hex.
pub fn md5_file(path: &Path) -> std::io::Result<String> {
    md5_stream(File::open(path)?)
}

/// Compare a file's MD5 against `expected`, ignoring hex case.
pub fn verify_file(path: &Path, expected: &str) -> std::io::Result<bool> {
    let actual = md5_file(path)?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}
