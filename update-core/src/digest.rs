use crate::error::{FileStoreError, IoOp, Result, UpdateError};
use serde::{Deserialize, Serialize};
use sha2::{Sha224, Sha256, Sha384, Sha512};
use std::fmt;
use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::str::FromStr;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
  Sha224,
  Sha256,
  Sha384,
  Sha512,
  Blake2,
}

impl DigestAlgorithm {
  /// Length of the lower-case hex rendering, or `None` when unsupported.
  pub fn hex_len(self) -> Option<usize> {
    match self {
      Self::Sha224 => Some(56),
      Self::Sha256 => Some(64),
      Self::Sha384 => Some(96),
      Self::Sha512 => Some(128),
      Self::Blake2 => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Sha224 => "sha224",
      Self::Sha256 => "sha256",
      Self::Sha384 => "sha384",
      Self::Sha512 => "sha512",
      Self::Blake2 => "blake2",
    }
  }

  fn ensure_supported(self) -> Result<()> {
    if self == Self::Blake2 {
      return Err(UpdateError::UnsupportedFeature(
        "BLAKE2 digests are not supported".to_string(),
      ));
    }
    Ok(())
  }
}

impl fmt::Display for DigestAlgorithm {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for DigestAlgorithm {
  type Err = UpdateError;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
      "sha224" => Ok(Self::Sha224),
      "sha256" => Ok(Self::Sha256),
      "sha384" => Ok(Self::Sha384),
      "sha512" => Ok(Self::Sha512),
      "blake2" | "blake2b" | "blake2s" => Ok(Self::Blake2),
      other => Err(UpdateError::UnsupportedFeature(format!(
        "unknown digest algorithm: {other}"
      ))),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
  pub algorithm: DigestAlgorithm,
  pub hex: String,
}

impl Digest {
  /// Builds a digest from caller-supplied hex; the value is lower-cased but
  /// not validated. Use [`Digest::is_well_formed`] before trusting it.
  pub fn new(algorithm: DigestAlgorithm, hex: impl Into<String>) -> Self {
    Self {
      algorithm,
      hex: hex.into().trim().to_ascii_lowercase(),
    }
  }

  /// True when the hex string has exactly the length of the algorithm's
  /// output and only hex digits.
  pub fn is_well_formed(&self) -> bool {
    let Some(len) = self.algorithm.hex_len() else {
      return false;
    };
    self.hex.len() == len && self.hex.bytes().all(|b| b.is_ascii_hexdigit())
  }
}

impl fmt::Display for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.algorithm, self.hex)
  }
}

pub fn compute_digest<R: Read>(reader: R, algorithm: DigestAlgorithm) -> std::io::Result<Digest> {
  let hex = match algorithm {
    DigestAlgorithm::Sha224 => hash_reader::<Sha224, _>(reader)?,
    DigestAlgorithm::Sha256 => hash_reader::<Sha256, _>(reader)?,
    DigestAlgorithm::Sha384 => hash_reader::<Sha384, _>(reader)?,
    DigestAlgorithm::Sha512 => hash_reader::<Sha512, _>(reader)?,
    DigestAlgorithm::Blake2 => {
      return Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "BLAKE2 digests are not supported",
      ))
    }
  };
  Ok(Digest { algorithm, hex })
}

pub fn digest_bytes(bytes: &[u8], algorithm: DigestAlgorithm) -> Result<Digest> {
  algorithm.ensure_supported()?;
  compute_digest(bytes, algorithm).map_err(|e| UpdateError::Unknown(e.to_string()))
}

/// Hashes the file at `path`. Unreadable files are an error, never a mismatch.
pub fn digest_file(path: &Path, algorithm: DigestAlgorithm) -> Result<Digest> {
  algorithm.ensure_supported()?;
  let file = fs::File::open(path).map_err(|e| FileStoreError::from_io(path, IoOp::Read, e))?;
  compute_digest(file, algorithm).map_err(|e| FileStoreError::from_io(path, IoOp::Read, e).into())
}

/// True only when both digests are well formed, use the same algorithm and
/// carry the same value.
pub fn validate(local: &Digest, expected: &Digest) -> bool {
  local.is_well_formed()
    && expected.is_well_formed()
    && local.algorithm == expected.algorithm
    && local.hex.eq_ignore_ascii_case(&expected.hex)
}

pub fn verify_file(path: &Path, expected: &Digest) -> Result<bool> {
  let local = digest_file(path, expected.algorithm)?;
  let ok = validate(&local, expected);
  if !ok {
    tracing::debug!(
      path = %path.display(),
      expected = %expected,
      actual = %local,
      "digest mismatch"
    );
  }
  Ok(ok)
}

/// Like [`verify_file`] but reports a mismatch as
/// [`UpdateError::UpdateChecksumMismatch`].
pub fn ensure_file_matches(path: &Path, expected: &Digest) -> Result<Digest> {
  let local = digest_file(path, expected.algorithm)?;
  if !validate(&local, expected) {
    return Err(UpdateError::UpdateChecksumMismatch {
      expected: expected.hex.clone(),
      actual: local.hex,
    });
  }
  Ok(local)
}

fn hash_reader<D: sha2::Digest + Write, R: Read>(reader: R) -> io::Result<String> {
  let mut hasher = D::new();
  io::copy(&mut BufReader::with_capacity(READ_CHUNK, reader), &mut hasher)?;
  Ok(hex::encode(hasher.finalize()))
}
