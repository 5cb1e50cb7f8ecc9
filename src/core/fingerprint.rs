use memmap2::Mmap;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

use crate::settings::IdentityMode;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("IO error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Not a file: {path}")]
    NotAFile { path: String },
}

/// Fixed-length perceptual hash. Bits are packed MSB-first into bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    bit_len: u32,
    bytes: Box<[u8]>,
}

impl Fingerprint {
    /// Build from packed bytes. Returns `None` when `bytes` cannot hold exactly `bit_len` bits.
    pub fn from_bytes(bit_len: u32, bytes: impl Into<Box<[u8]>>) -> Option<Self> {
        let bytes = bytes.into();
        if bit_len == 0 || bytes.len() != (bit_len as usize).div_ceil(8) {
            return None;
        }
        Some(Self { bit_len, bytes })
    }

    /// Build from one `bool` per bit.
    pub fn from_bits(bits: &[bool]) -> Option<Self> {
        let mut bytes = vec![0u8; bits.len().div_ceil(8)];
        for (i, bit) in bits.iter().enumerate() {
            if *bit {
                bytes[i / 8] |= 0x80 >> (i % 8);
            }
        }
        Self::from_bytes(bits.len() as u32, bytes)
    }

    pub fn bit_len(&self) -> u32 {
        self.bit_len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bit(&self, index: u32) -> bool {
        index < self.bit_len && self.bytes[(index / 8) as usize] & (0x80 >> (index % 8)) != 0
    }

    /// Hamming distance, or `None` when the two fingerprints have different lengths.
    pub fn distance(&self, other: &Fingerprint) -> Option<u32> {
        if self.bit_len != other.bit_len {
            return None;
        }
        Some(
            self.bytes
                .iter()
                .zip(other.bytes.iter())
                .map(|(a, b)| (a ^ b).count_ones())
                .sum(),
        )
    }

    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(bit_len: u32, hex: &str) -> Option<Self> {
        if hex.len() % 2 != 0 || !hex.is_ascii() {
            return None;
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
            .collect::<Option<Vec<u8>>>()?;
        Self::from_bytes(bit_len, bytes)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}:{})", self.bit_len, self.to_hex())
    }
}

#[derive(Serialize, Deserialize)]
struct FingerprintRepr {
    bits: u32,
    hex: String,
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        FingerprintRepr {
            bits: self.bit_len,
            hex: self.to_hex(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = FingerprintRepr::deserialize(deserializer)?;
        Fingerprint::from_hex(repr.bits, &repr.hex)
            .ok_or_else(|| de::Error::custom("hex does not match bit length"))
    }
}

/// What makes a file's fingerprint reusable across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IdentitySignal {
    Metadata { size: u64, modified_nanos: u128 },
    Content { digest: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub signal: IdentitySignal,
}

impl FileIdentity {
    pub fn resolve(path: &Path, mode: IdentityMode) -> Result<Self, IdentityError> {
        match mode {
            IdentityMode::Metadata => Self::from_metadata(path),
            IdentityMode::Content => Self::from_content(path),
        }
    }

    /// Path + size + modification time. Cheap: a single `stat`.
    pub fn from_metadata(path: &Path) -> Result<Self, IdentityError> {
        let io_err = |source| IdentityError::Io {
            path: path.display().to_string(),
            source,
        };
        let meta = std::fs::metadata(path).map_err(io_err)?;
        if !meta.is_file() {
            return Err(IdentityError::NotAFile {
                path: path.display().to_string(),
            });
        }
        let modified_nanos = meta
            .modified()
            .map_err(io_err)?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            signal: IdentitySignal::Metadata {
                size: meta.len(),
                modified_nanos,
            },
        })
    }

    /// BLAKE3 digest of the file bytes, read through a memory map.
    pub fn from_content(path: &Path) -> Result<Self, IdentityError> {
        let io_err = |source| IdentityError::Io {
            path: path.display().to_string(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let meta = file.metadata().map_err(io_err)?;
        if !meta.is_file() {
            return Err(IdentityError::NotAFile {
                path: path.display().to_string(),
            });
        }
        let digest = if meta.len() == 0 {
            blake3::hash(&[])
        } else {
            // SAFETY: the map is read-only and dropped before returning; a concurrent
            // truncation would at worst produce a digest that no longer matches.
            let mmap = unsafe { Mmap::map(&file) }.map_err(io_err)?;
            blake3::hash(&mmap)
        };
        Ok(Self {
            path: path.to_path_buf(),
            signal: IdentitySignal::Content {
                digest: digest.to_hex().to_string(),
            },
        })
    }

    /// Stable cache key. Content identities ignore the path so identical copies share an entry.
    pub fn key(&self) -> String {
        match &self.signal {
            IdentitySignal::Metadata {
                size,
                modified_nanos,
            } => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(self.path.to_string_lossy().as_bytes());
                hasher.update(&size.to_le_bytes());
                hasher.update(&modified_nanos.to_le_bytes());
                format!("m:{}", hasher.finalize().to_hex())
            }
            IdentitySignal::Content { digest } => format!("c:{}", digest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_distance_counts_differing_bits() {
        let a = Fingerprint::from_bytes(16, vec![0b1111_0000, 0x00]).unwrap();
        let b = Fingerprint::from_bytes(16, vec![0b0000_0000, 0x01]).unwrap();
        assert_eq!(a.distance(&b), Some(5));
        assert_eq!(a.distance(&a), Some(0));
    }

    #[test]
    fn test_distance_rejects_length_mismatch() {
        let a = Fingerprint::from_bytes(8, vec![0]).unwrap();
        let b = Fingerprint::from_bytes(16, vec![0, 0]).unwrap();
        assert_eq!(a.distance(&b), None);
    }

    #[test]
    fn test_from_bytes_validates_length() {
        assert!(Fingerprint::from_bytes(64, vec![0u8; 7]).is_none());
        assert!(Fingerprint::from_bytes(0, Vec::new()).is_none());
        assert!(Fingerprint::from_bytes(64, vec![0u8; 8]).is_some());
    }

    #[test]
    fn test_from_bits_packs_msb_first() {
        let mut bits = vec![false; 8];
        bits[0] = true;
        bits[7] = true;
        let fp = Fingerprint::from_bits(&bits).unwrap();
        assert_eq!(fp.as_bytes(), &[0b1000_0001]);
        assert!(fp.bit(0));
        assert!(!fp.bit(1));
        assert!(fp.bit(7));
    }

    #[test]
    fn test_serde_uses_hex() {
        let fp = Fingerprint::from_bytes(16, vec![0xab, 0x01]).unwrap();
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, r#"{"bits":16,"hex":"ab01"}"#);
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);

        let bad = serde_json::from_str::<Fingerprint>(r#"{"bits":64,"hex":"ab01"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_metadata_identity_changes_with_content_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.jpg");
        fs::write(&path, b"first").unwrap();
        let first = FileIdentity::from_metadata(&path).unwrap();
        assert_eq!(first.key(), FileIdentity::from_metadata(&path).unwrap().key());

        fs::write(&path, b"second version").unwrap();
        let second = FileIdentity::from_metadata(&path).unwrap();
        assert_ne!(first.key(), second.key());
    }

    #[test]
    fn test_content_identity_ignores_path() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a.jpg");
        let b = temp_dir.path().join("b.jpg");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();

        let ia = FileIdentity::from_content(&a).unwrap();
        let ib = FileIdentity::from_content(&b).unwrap();
        assert_eq!(ia.key(), ib.key());
        assert!(ia.key().starts_with("c:"));
    }

    #[test]
    fn test_identity_of_missing_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("gone.jpg");
        assert!(FileIdentity::from_metadata(&missing).is_err());
        assert!(FileIdentity::from_content(&missing).is_err());
        assert!(matches!(
            FileIdentity::from_metadata(temp_dir.path()),
            Err(IdentityError::NotAFile { .. })
        ));
    }
}
