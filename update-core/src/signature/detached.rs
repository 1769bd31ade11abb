use super::{Certificate, RecordState, SigningProvider, SigningRecord, TrustFailure};
use crate::digest::{digest_file, Digest, DigestAlgorithm};
use crate::error::{FileStoreError, IoOp, Result, UpdateError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const RECORD_ALGORITHM: &str = "ed25519-sha256";
const MAX_CHAIN_DEPTH: usize = 8;

/// On-disk certificate. `not_after` stays a raw string so that a malformed
/// value surfaces as "unknown expiry" instead of a load failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateFile {
  pub subject: String,
  pub issuer: String,
  #[serde(default)]
  pub not_after: String,
  pub public_key: String,
  #[serde(default)]
  pub issuer_signature: String,
}

#[derive(Serialize)]
struct CertificateBody<'a> {
  subject: &'a str,
  issuer: &'a str,
  not_after: &'a str,
  public_key: &'a str,
}

#[derive(Debug, Clone)]
pub struct ReleaseCertificate {
  file: CertificateFile,
  key: VerifyingKey,
  not_after: Option<DateTime<Utc>>,
}

impl ReleaseCertificate {
  pub fn from_file(file: CertificateFile) -> Result<Self> {
    let key = decode_public_key(&file.public_key).map_err(|e| {
      UpdateError::SignatureVerificationFailed(format!("certificate `{}`: {e}", file.subject))
    })?;
    let not_after = DateTime::parse_from_rfc3339(file.not_after.trim())
      .ok()
      .map(|t| t.with_timezone(&Utc));
    Ok(Self { file, key, not_after })
  }

  pub fn load(path: &Path) -> Result<Self> {
    let raw = fs::read_to_string(path).map_err(|e| FileStoreError::from_io(path, IoOp::Read, e))?;
    let file: CertificateFile = toml::from_str(&raw)
      .map_err(|e| UpdateError::Parse(format!("certificate {}: {e}", path.display())))?;
    Self::from_file(file)
  }

  pub fn to_toml(&self) -> Result<String> {
    toml::to_string_pretty(&self.file).map_err(|e| UpdateError::Unknown(format!("serialize certificate: {e}")))
  }

  /// Issues a certificate for `subject_key`, signed by `issuer_key`.
  pub fn issue(
    subject: &str,
    not_after: DateTime<Utc>,
    subject_key: &VerifyingKey,
    issuer_subject: &str,
    issuer_key: &SigningKey,
  ) -> Result<Self> {
    let mut file = CertificateFile {
      subject: subject.to_string(),
      issuer: issuer_subject.to_string(),
      not_after: not_after.to_rfc3339_opts(SecondsFormat::Secs, true),
      public_key: URL_SAFE_NO_PAD.encode(subject_key.as_bytes()),
      issuer_signature: String::new(),
    };
    let body = body_bytes(&file)?;
    file.issuer_signature = URL_SAFE_NO_PAD.encode(issuer_key.sign(&body).to_bytes());
    Self::from_file(file)
  }

  pub fn self_signed(subject: &str, not_after: DateTime<Utc>, key: &SigningKey) -> Result<Self> {
    Self::issue(subject, not_after, &key.verifying_key(), subject, key)
  }

  pub fn file(&self) -> &CertificateFile {
    &self.file
  }

  pub fn subject(&self) -> &str {
    &self.file.subject
  }

  pub fn not_after(&self) -> Option<DateTime<Utc>> {
    self.not_after
  }

  fn expired_at(&self, at: DateTime<Utc>) -> bool {
    self.not_after.map_or(true, |t| t < at)
  }

  fn same_key(&self, other: &ReleaseCertificate) -> bool {
    self.key.as_bytes() == other.key.as_bytes()
  }

  fn is_issued_by(&self, issuer: &ReleaseCertificate) -> bool {
    if self.file.issuer != issuer.file.subject {
      return false;
    }
    let Ok(body) = body_bytes(&self.file) else {
      return false;
    };
    let Some(sig) = decode_signature(&self.file.issuer_signature) else {
      return false;
    };
    issuer.key.verify_strict(&body, &sig).is_ok()
  }
}

/// Leaf certificate plus whatever intermediates the signing record carried.
#[derive(Debug, Clone)]
pub struct SignerCertificate {
  pub leaf: ReleaseCertificate,
  pub intermediates: Vec<ReleaseCertificate>,
}

impl Certificate for SignerCertificate {
  fn subject(&self) -> &str {
    &self.leaf.file.subject
  }

  fn issuer(&self) -> &str {
    &self.leaf.file.issuer
  }

  fn not_after(&self) -> Option<DateTime<Utc>> {
    self.leaf.not_after
  }

  fn evaluate_trust(&self, roots: &TrustRoots, at: DateTime<Utc>) -> Option<std::result::Result<(), TrustFailure>> {
    if roots.is_empty() {
      return None;
    }

    let mut current = &self.leaf;
    for _ in 0..MAX_CHAIN_DEPTH {
      if current.expired_at(at) {
        return Some(Err(TrustFailure::Expired {
          subject: current.file.subject.clone(),
        }));
      }
      // A link carrying a root's key anchors only as an exact copy of that
      // root; re-issued copies must chain to the stored root instead.
      let anchor = roots
        .iter()
        .find(|r| r.same_key(current) && r.file == current.file)
        .or_else(|| roots.iter().find(|r| current.is_issued_by(r)));
      if let Some(root) = anchor {
        if root.expired_at(at) {
          return Some(Err(TrustFailure::Expired {
            subject: root.file.subject.clone(),
          }));
        }
        return Some(Ok(()));
      }
      match self.intermediates.iter().find(|c| current.is_issued_by(c)) {
        Some(next) => current = next,
        None => {
          return Some(Err(TrustFailure::NoAnchor {
            issuer: current.file.issuer.clone(),
          }))
        }
      }
    }
    Some(Err(TrustFailure::DepthExceeded))
  }
}

/// The only certificates allowed to anchor a chain.
#[derive(Debug, Clone, Default)]
pub struct TrustRoots {
  roots: Vec<ReleaseCertificate>,
}

impl TrustRoots {
  pub fn new(roots: Vec<ReleaseCertificate>) -> Self {
    Self { roots }
  }

  /// Loads every `*.toml` certificate in `dir`. A missing directory yields an
  /// empty set; unreadable or malformed files are skipped with a warning.
  pub fn load_dir(dir: &Path) -> Result<Self> {
    let entries = match fs::read_dir(dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        tracing::warn!(dir = %dir.display(), "trust roots directory missing; nothing will be trusted");
        return Ok(Self::default());
      }
      Err(e) => return Err(FileStoreError::from_io(dir, IoOp::Read, e).into()),
    };

    let mut paths: Vec<PathBuf> = entries
      .flatten()
      .map(|e| e.path())
      .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("toml"))
      .collect();
    paths.sort();

    let mut roots = Vec::new();
    for path in paths {
      match ReleaseCertificate::load(&path) {
        Ok(cert) => roots.push(cert),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping trust root"),
      }
    }
    tracing::debug!(dir = %dir.display(), count = roots.len(), "trust roots loaded");
    Ok(Self { roots })
  }

  pub fn is_empty(&self) -> bool {
    self.roots.is_empty()
  }

  pub fn len(&self) -> usize {
    self.roots.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &ReleaseCertificate> {
    self.roots.iter()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRecordFile {
  #[serde(default = "default_record_algorithm")]
  pub algorithm: String,
  pub signature: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub certificate: Option<CertificateFile>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub intermediates: Vec<CertificateFile>,
}

fn default_record_algorithm() -> String {
  RECORD_ALGORITHM.to_string()
}

/// Reads `<artifact>.<suffix>` next to the artifact. The signature covers the
/// artifact's SHA-256 digest.
#[derive(Debug, Clone)]
pub struct DetachedSignatureProvider {
  suffix: String,
}

impl Default for DetachedSignatureProvider {
  fn default() -> Self {
    Self::new("sig")
  }
}

impl DetachedSignatureProvider {
  pub fn new(suffix: impl Into<String>) -> Self {
    Self { suffix: suffix.into() }
  }

  pub fn record_path(&self, artifact: &Path) -> PathBuf {
    record_path(artifact, &self.suffix)
  }
}

impl SigningProvider for DetachedSignatureProvider {
  fn signing_record(&self, path: &Path) -> Result<SigningRecord> {
    let record_path = self.record_path(path);
    let raw = match fs::read_to_string(&record_path) {
      Ok(raw) => raw,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        return Ok(SigningRecord {
          state: RecordState::Invalid("unsigned".to_string()),
          certificate: None,
        })
      }
      Err(e) => {
        return Err(UpdateError::SignatureVerificationFailed(format!(
          "read {}: {e}",
          record_path.display()
        )))
      }
    };

    let record: SigningRecordFile = toml::from_str(&raw).map_err(|e| {
      UpdateError::SignatureVerificationFailed(format!("parse {}: {e}", record_path.display()))
    })?;
    if record.algorithm != RECORD_ALGORITHM {
      return Err(UpdateError::SignatureVerificationFailed(format!(
        "unsupported signing algorithm `{}`",
        record.algorithm
      )));
    }

    let Some(leaf_file) = record.certificate else {
      return Ok(SigningRecord {
        state: RecordState::Invalid("no certificate attached".to_string()),
        certificate: None,
      });
    };
    let leaf = ReleaseCertificate::from_file(leaf_file)?;
    let intermediates = record
      .intermediates
      .into_iter()
      .map(ReleaseCertificate::from_file)
      .collect::<Result<Vec<_>>>()?;

    let digest = digest_file(path, DigestAlgorithm::Sha256)?;
    let state = check_artifact_signature(&leaf, &digest, &record.signature);

    Ok(SigningRecord {
      state,
      certificate: Some(Arc::new(SignerCertificate { leaf, intermediates })),
    })
  }
}

/// Reads an Ed25519 signing key stored as the base64url of its 32-byte seed.
pub fn load_signing_key(path: &Path) -> Result<SigningKey> {
  let raw = fs::read_to_string(path).map_err(|e| FileStoreError::from_io(path, IoOp::Read, e))?;
  let seed = URL_SAFE_NO_PAD
    .decode(raw.trim().as_bytes())
    .map_err(|e| UpdateError::InvalidConfiguration(format!("signing key {}: {e}", path.display())))?;
  let seed: [u8; 32] = seed.as_slice().try_into().map_err(|_| {
    UpdateError::InvalidConfiguration(format!("signing key {} must be 32 bytes", path.display()))
  })?;
  Ok(SigningKey::from_bytes(&seed))
}

/// Signs `artifact` with `key` and writes the record next to it. Returns the
/// record path.
pub fn sign_artifact(
  artifact: &Path,
  key: &SigningKey,
  leaf: &ReleaseCertificate,
  intermediates: &[ReleaseCertificate],
  suffix: &str,
) -> Result<PathBuf> {
  if key.verifying_key() != leaf.key {
    return Err(UpdateError::InvalidConfiguration(format!(
      "signing key does not belong to certificate `{}`",
      leaf.file.subject
    )));
  }
  let digest = digest_file(artifact, DigestAlgorithm::Sha256)?;
  let raw = hex::decode(&digest.hex).map_err(|e| UpdateError::Unknown(format!("decode digest: {e}")))?;
  let record = SigningRecordFile {
    algorithm: RECORD_ALGORITHM.to_string(),
    signature: URL_SAFE_NO_PAD.encode(key.sign(&raw).to_bytes()),
    certificate: Some(leaf.file.clone()),
    intermediates: intermediates.iter().map(|c| c.file.clone()).collect(),
  };
  let text = toml::to_string_pretty(&record)
    .map_err(|e| UpdateError::Unknown(format!("serialize signing record: {e}")))?;

  let path = record_path(artifact, suffix);
  fs::write(&path, text).map_err(|e| FileStoreError::from_io(&path, IoOp::Write, e))?;
  Ok(path)
}

fn check_artifact_signature(leaf: &ReleaseCertificate, digest: &Digest, signature: &str) -> RecordState {
  let Some(sig) = decode_signature(signature) else {
    return RecordState::Invalid("malformed signature".to_string());
  };
  let Ok(raw) = hex::decode(&digest.hex) else {
    return RecordState::Invalid("malformed digest".to_string());
  };
  match leaf.key.verify_strict(&raw, &sig) {
    Ok(()) => RecordState::Valid,
    Err(e) => RecordState::Invalid(e.to_string()),
  }
}

fn record_path(artifact: &Path, suffix: &str) -> PathBuf {
  let mut s = artifact.as_os_str().to_owned();
  s.push(".");
  s.push(suffix);
  PathBuf::from(s)
}

fn body_bytes(file: &CertificateFile) -> Result<Vec<u8>> {
  let body = CertificateBody {
    subject: &file.subject,
    issuer: &file.issuer,
    not_after: &file.not_after,
    public_key: &file.public_key,
  };
  serde_json::to_vec(&body).map_err(|e| UpdateError::Unknown(format!("encode certificate body: {e}")))
}

fn decode_public_key(text: &str) -> std::result::Result<VerifyingKey, String> {
  let raw = URL_SAFE_NO_PAD
    .decode(text.trim().as_bytes())
    .map_err(|e| format!("decode public key base64url: {e}"))?;
  let arr: [u8; 32] = raw
    .as_slice()
    .try_into()
    .map_err(|_| "public key must be 32 bytes (ed25519)".to_string())?;
  VerifyingKey::from_bytes(&arr).map_err(|e| e.to_string())
}

fn decode_signature(text: &str) -> Option<Signature> {
  let raw = URL_SAFE_NO_PAD.decode(text.trim().as_bytes()).ok()?;
  let arr: [u8; 64] = raw.as_slice().try_into().ok()?;
  Some(Signature::from_bytes(&arr))
}
