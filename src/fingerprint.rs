use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Modification time as nanoseconds since the epoch. All skip decisions
/// key on this unit.
pub fn mtime_ns(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Stat a file once, returning `(size, mtime_ns)`.
pub fn stat_file(path: &Path) -> Result<(i64, i64)> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    Ok((metadata.len() as i64, mtime_ns(&metadata)))
}

/// SHA-256 hex of the file bytes. Computed for integrity after a
/// successful parse; `(size, mtime)` remains the skip predicate.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("failed to open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {} for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex(&hasher.finalize()))
}

/// SHA-256 hex of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

fn hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_hash_known_vector() {
        // SHA-256 of the empty string
        assert_eq!(
            hash_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_file_matches_bytes() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"session content").unwrap();
        f.flush().unwrap();

        assert_eq!(hash_file(f.path()).unwrap(), hash_bytes(b"session content"));
    }

    #[test]
    fn test_stat_file() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"12345").unwrap();
        f.flush().unwrap();

        let (size, mtime) = stat_file(f.path()).unwrap();
        assert_eq!(size, 5);
        assert!(mtime > 0);
    }
}
