//! Checksum algorithms and streaming computation.
//!
//! This module provides:
//! - The algorithm registry (name -> streaming hasher constructor)
//! - Streaming file checksum computation with bounded memory
//! - `FileRecord` construction for files under a collection root

use crate::error::EngineError;
use crate::model::FileRecord;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// MD5 (deprecated, but still common in preservation manifests)
    Md5,
    /// SHA-1
    Sha1,
    /// SHA-224
    Sha224,
    /// SHA-256 (default)
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
    /// CRC32 (fast, 32-bit, not cryptographic)
    Crc32,
}

/// One entry of the algorithm registry.
pub struct AlgorithmEntry {
    pub algorithm: ChecksumAlgorithm,
    /// Lowercase name, also used as the checksum-tree sidecar extension
    pub name: &'static str,
    pub new_hasher: fn() -> Box<dyn ChecksumHasher>,
}

/// The algorithm registry. Adding an algorithm means adding one entry here.
pub static REGISTRY: &[AlgorithmEntry] = &[
    AlgorithmEntry { algorithm: ChecksumAlgorithm::Md5, name: "md5", new_hasher: new_md5 },
    AlgorithmEntry { algorithm: ChecksumAlgorithm::Sha1, name: "sha1", new_hasher: new_sha1 },
    AlgorithmEntry { algorithm: ChecksumAlgorithm::Sha224, name: "sha224", new_hasher: new_sha224 },
    AlgorithmEntry { algorithm: ChecksumAlgorithm::Sha256, name: "sha256", new_hasher: new_sha256 },
    AlgorithmEntry { algorithm: ChecksumAlgorithm::Sha384, name: "sha384", new_hasher: new_sha384 },
    AlgorithmEntry { algorithm: ChecksumAlgorithm::Sha512, name: "sha512", new_hasher: new_sha512 },
    AlgorithmEntry { algorithm: ChecksumAlgorithm::Blake3, name: "blake3", new_hasher: new_blake3 },
    AlgorithmEntry { algorithm: ChecksumAlgorithm::Crc32, name: "crc32", new_hasher: new_crc32 },
];

impl ChecksumAlgorithm {
    /// Look up an algorithm by registered name (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self, EngineError> {
        let wanted = name.trim().to_lowercase();
        REGISTRY
            .iter()
            .find(|entry| entry.name == wanted)
            .map(|entry| entry.algorithm)
            .ok_or_else(|| EngineError::UnsupportedAlgorithm {
                name: name.to_string(),
            })
    }

    /// Registered name of this algorithm.
    pub fn name(&self) -> &'static str {
        self.entry().name
    }

    /// Create a fresh streaming hasher for this algorithm.
    pub fn new_hasher(&self) -> Box<dyn ChecksumHasher> {
        (self.entry().new_hasher)()
    }

    /// All registered algorithms, in registry order.
    pub fn all() -> impl Iterator<Item = ChecksumAlgorithm> {
        REGISTRY.iter().map(|entry| entry.algorithm)
    }

    fn entry(&self) -> &'static AlgorithmEntry {
        // Every variant has exactly one registry entry
        REGISTRY
            .iter()
            .find(|entry| entry.algorithm == *self)
            .unwrap_or(&REGISTRY[3])
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
    size: u64,
}

impl ChecksumValue {
    /// Create a new checksum value. The hex digest is stored lowercase.
    pub fn new(algorithm: ChecksumAlgorithm, hex: String, size: u64) -> Self {
        ChecksumValue {
            algorithm,
            hex: hex.to_lowercase(),
            size,
        }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Number of bytes that went into the digest
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Format as "algo:hex"
    pub fn to_string_with_algo(&self) -> String {
        format!("{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Compare two hex digests case-insensitively.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Trait for streaming checksum computation
pub trait ChecksumHasher: Send {
    /// Update the hasher with new data
    fn update(&mut self, data: &[u8]);

    /// Finalize and return the lowercase hex digest
    fn finalize_hex(self: Box<Self>) -> String;
}

/// CRC32 hasher (IEEE polynomial, reflected)
struct Crc32Hasher {
    crc: u32,
}

impl Crc32Hasher {
    fn new() -> Self {
        Crc32Hasher { crc: 0xffffffff }
    }
}

impl ChecksumHasher for Crc32Hasher {
    fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let mut crc = self.crc ^ byte as u32;
            for _ in 0..8 {
                crc = if crc & 1 == 1 {
                    (crc >> 1) ^ 0xedb88320
                } else {
                    crc >> 1
                };
            }
            self.crc = crc;
        }
    }

    fn finalize_hex(self: Box<Self>) -> String {
        format!("{:08x}", self.crc ^ 0xffffffff)
    }
}

/// MD5 hasher (backed by md5 crate)
struct Md5Hasher {
    context: md5::Context,
}

impl ChecksumHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        format!("{:x}", self.context.compute())
    }
}

/// Any RustCrypto `Digest` implementation (SHA-1 and the SHA-2 family)
struct DigestHasher<D> {
    hasher: D,
}

impl<D> ChecksumHasher for DigestHasher<D>
where
    D: sha2::Digest + Send,
    sha2::digest::Output<D>: fmt::LowerHex,
{
    fn update(&mut self, data: &[u8]) {
        sha2::Digest::update(&mut self.hasher, data);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        format!("{:x}", sha2::Digest::finalize(self.hasher))
    }
}

/// BLAKE3 hasher (backed by blake3 crate)
struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

fn new_md5() -> Box<dyn ChecksumHasher> {
    Box::new(Md5Hasher {
        context: md5::Context::new(),
    })
}

fn new_sha1() -> Box<dyn ChecksumHasher> {
    Box::new(DigestHasher {
        hasher: <sha1::Sha1 as sha2::Digest>::new(),
    })
}

fn new_sha224() -> Box<dyn ChecksumHasher> {
    Box::new(DigestHasher {
        hasher: <sha2::Sha224 as sha2::Digest>::new(),
    })
}

fn new_sha256() -> Box<dyn ChecksumHasher> {
    Box::new(DigestHasher {
        hasher: <sha2::Sha256 as sha2::Digest>::new(),
    })
}

fn new_sha384() -> Box<dyn ChecksumHasher> {
    Box::new(DigestHasher {
        hasher: <sha2::Sha384 as sha2::Digest>::new(),
    })
}

fn new_sha512() -> Box<dyn ChecksumHasher> {
    Box::new(DigestHasher {
        hasher: <sha2::Sha512 as sha2::Digest>::new(),
    })
}

fn new_blake3() -> Box<dyn ChecksumHasher> {
    Box::new(Blake3Hasher {
        hasher: blake3::Hasher::new(),
    })
}

fn new_crc32() -> Box<dyn ChecksumHasher> {
    Box::new(Crc32Hasher::new())
}

/// Stream a reader through a hasher in `blocksize` chunks.
///
/// Every chunk is also handed to `sink`, which lets callers copy while hashing.
/// Returns the digest and the number of bytes read.
pub fn hash_stream<R, F>(
    reader: &mut R,
    algorithm: ChecksumAlgorithm,
    blocksize: usize,
    mut sink: F,
) -> io::Result<(String, u64)>
where
    R: Read,
    F: FnMut(&[u8]) -> io::Result<()>,
{
    let mut hasher = algorithm.new_hasher();
    let mut buffer = vec![0u8; blocksize.max(1)];
    let mut size = 0u64;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
        sink(&buffer[..n])?;
        size += n as u64;
    }

    Ok((hasher.finalize_hex(), size))
}

/// Compute the checksum of a file without loading it into memory.
///
/// # Errors
/// Returns `EngineError::SourceNotFound` if the file does not exist, or
/// `EngineError::ReadError` if it cannot be opened or read.
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    blocksize: usize,
) -> Result<ChecksumValue, EngineError> {
    let mut file = File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            EngineError::SourceNotFound {
                path: path.to_path_buf(),
            }
        } else {
            EngineError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;

    let (hex, size) =
        hash_stream(&mut file, algorithm, blocksize, |_| Ok(())).map_err(|e| {
            EngineError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }
        })?;

    Ok(ChecksumValue::new(algorithm, hex, size))
}

/// Compute a `FileRecord` for `relative_path` beneath `root`.
pub fn compute_record(
    root: &Path,
    relative_path: &str,
    algorithm: ChecksumAlgorithm,
    blocksize: usize,
) -> Result<FileRecord, EngineError> {
    let value = compute_file_checksum(&root.join(relative_path), algorithm, blocksize)?;
    Ok(FileRecord::new(
        relative_path,
        algorithm,
        value.hex().to_string(),
        Some(value.size()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn digest_of(algorithm: ChecksumAlgorithm, data: &[u8]) -> String {
        let mut hasher = algorithm.new_hasher();
        hasher.update(data);
        hasher.finalize_hex()
    }

    #[test]
    fn test_algorithm_display() {
        assert_eq!(ChecksumAlgorithm::Crc32.to_string(), "crc32");
        assert_eq!(ChecksumAlgorithm::Md5.to_string(), "md5");
        assert_eq!(ChecksumAlgorithm::Sha256.to_string(), "sha256");
        assert_eq!(ChecksumAlgorithm::Blake3.to_string(), "blake3");
    }

    #[test]
    fn test_algorithm_from_name() {
        assert_eq!(ChecksumAlgorithm::from_name("md5").unwrap(), ChecksumAlgorithm::Md5);
        assert_eq!(ChecksumAlgorithm::from_name("SHA512").unwrap(), ChecksumAlgorithm::Sha512);
        assert_eq!("sha1".parse::<ChecksumAlgorithm>().unwrap(), ChecksumAlgorithm::Sha1);

        let err = ChecksumAlgorithm::from_name("whirlpool").unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedAlgorithm { ref name } if name == "whirlpool"));
    }

    #[test]
    fn test_registry_names_round_trip() {
        for algorithm in ChecksumAlgorithm::all() {
            assert_eq!(ChecksumAlgorithm::from_name(algorithm.name()).unwrap(), algorithm);
        }
        assert_eq!(ChecksumAlgorithm::all().count(), 8);
    }

    #[test]
    fn test_empty_input_published_digests() {
        let expected = [
            (ChecksumAlgorithm::Md5, "d41d8cd98f00b204e9800998ecf8427e"),
            (ChecksumAlgorithm::Sha1, "da39a3ee5e6b4b0d3255bfef95601890afd80709"),
            (
                ChecksumAlgorithm::Sha224,
                "d14a028c2a3a2bc9476102bb288234c415a2b01f828ea62ac5b3e42f",
            ),
            (
                ChecksumAlgorithm::Sha256,
                "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            ),
            (
                ChecksumAlgorithm::Sha384,
                "38b060a751ac96384cd9327eb1b1e36a21fdb71114be07434c0cc7bf63f6e1da274edebfe76f65fbd51ad2f14898b95b",
            ),
            (
                ChecksumAlgorithm::Sha512,
                "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e",
            ),
            (
                ChecksumAlgorithm::Blake3,
                "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262",
            ),
            (ChecksumAlgorithm::Crc32, "00000000"),
        ];

        // Every registered algorithm must be covered
        assert_eq!(expected.len(), ChecksumAlgorithm::all().count());

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let empty = temp_dir.path().join("empty.bin");
        std::fs::write(&empty, b"").expect("Failed to write empty file");

        for (algorithm, digest) in expected {
            let value = compute_file_checksum(&empty, algorithm, 4096)
                .expect("Failed to hash empty file");
            assert_eq!(value.hex(), digest, "wrong empty digest for {}", algorithm);
            assert_eq!(value.size(), 0);
        }
    }

    #[test]
    fn test_known_hello_digests() {
        assert_eq!(digest_of(ChecksumAlgorithm::Md5, b"hello"), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(
            digest_of(ChecksumAlgorithm::Sha256, b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(digest_of(ChecksumAlgorithm::Crc32, b"hello"), "3610a686");
    }

    #[test]
    fn test_hash_stream_is_chunk_independent() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let (small, size_small) =
            hash_stream(&mut Cursor::new(&data), ChecksumAlgorithm::Blake3, 7, |_| Ok(()))
                .expect("Failed to hash");
        let (large, size_large) =
            hash_stream(&mut Cursor::new(&data), ChecksumAlgorithm::Blake3, 1 << 20, |_| Ok(()))
                .expect("Failed to hash");

        assert_eq!(small, large);
        assert_eq!(small, digest_of(ChecksumAlgorithm::Blake3, &data));
        assert_eq!(size_small, 10_000);
        assert_eq!(size_large, 10_000);
    }

    #[test]
    fn test_hash_stream_feeds_sink() {
        let mut copied = Vec::new();
        hash_stream(&mut Cursor::new(b"abcdef"), ChecksumAlgorithm::Md5, 4, |chunk| {
            copied.extend_from_slice(chunk);
            Ok(())
        })
        .expect("Failed to hash");
        assert_eq!(copied, b"abcdef");
    }

    #[test]
    fn test_compute_missing_file_is_source_not_found() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = compute_file_checksum(&temp_dir.path().join("nope"), ChecksumAlgorithm::Sha256, 1024);
        assert!(matches!(result, Err(EngineError::SourceNotFound { .. })));
    }

    #[test]
    fn test_compute_record_uses_relative_path() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        std::fs::create_dir(temp_dir.path().join("sub")).expect("Failed to create subdir");
        std::fs::write(temp_dir.path().join("sub").join("a.txt"), b"hello").expect("Failed to write file");

        let record = compute_record(temp_dir.path(), "sub/a.txt", ChecksumAlgorithm::Md5, 2)
            .expect("Failed to compute record");
        assert_eq!(record.relative_path, "sub/a.txt");
        assert_eq!(record.checksum, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(record.size, Some(5));
    }

    #[test]
    fn test_checksum_value_display() {
        let cs = ChecksumValue::new(ChecksumAlgorithm::Sha256, "ABC123".to_string(), 3);
        assert_eq!(cs.to_string(), "abc123");
        assert_eq!(cs.to_string_with_algo(), "sha256:abc123");
        assert!(digests_match("ABC123", cs.hex()));
    }
}
