//! Artifact signing checks.
//!
//! A [`SigningProvider`] locates the signing record of an artifact; the
//! functions here decide validity, expiry and whether the signer chains to a
//! caller-supplied set of roots. Nothing here consults a system trust store.

use crate::error::{Result, UpdateError};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod detached;

pub use detached::{
  load_signing_key, sign_artifact, CertificateFile, DetachedSignatureProvider, ReleaseCertificate,
  SignerCertificate, SigningRecordFile, TrustRoots,
};

/// Signer identity attached to a signing record. Opaque to the update
/// pipeline beyond these accessors.
pub trait Certificate: Send + Sync + fmt::Debug {
  fn subject(&self) -> &str;
  fn issuer(&self) -> &str;
  /// `None` when the field is missing or malformed.
  fn not_after(&self) -> Option<DateTime<Utc>>;
  /// Evaluates the chain anchored only on `roots`. `None` means no
  /// evaluation could be set up at all.
  fn evaluate_trust(&self, roots: &TrustRoots, at: DateTime<Utc>) -> Option<std::result::Result<(), TrustFailure>>;
}

pub type SigningCertificate = Arc<dyn Certificate>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustFailure {
  NoAnchor { issuer: String },
  Expired { subject: String },
  DepthExceeded,
}

impl fmt::Display for TrustFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::NoAnchor { issuer } => write!(f, "no trusted issuer found for `{issuer}`"),
      Self::Expired { subject } => write!(f, "certificate `{subject}` has expired"),
      Self::DepthExceeded => f.write_str("certificate chain too long"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
  Valid,
  Invalid(String),
}

#[derive(Debug, Clone)]
pub struct SigningRecord {
  pub state: RecordState,
  pub certificate: Option<SigningCertificate>,
}

pub trait SigningProvider: Send + Sync {
  fn signing_record(&self, path: &Path) -> Result<SigningRecord>;
}

#[derive(Clone)]
pub struct SignatureStatus {
  pub valid: bool,
  pub certificate: Option<SigningCertificate>,
}

impl fmt::Debug for SignatureStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SignatureStatus")
      .field("valid", &self.valid)
      .field("subject", &self.certificate.as_ref().map(|c| c.subject().to_string()))
      .finish()
  }
}

/// One artifact's outcome in a batch run.
#[derive(Debug)]
pub struct BatchOutcome {
  pub path: PathBuf,
  pub result: Result<SignatureStatus>,
}

#[derive(Clone)]
pub struct SignatureValidator {
  provider: Arc<dyn SigningProvider>,
}

impl SignatureValidator {
  pub fn new(provider: Arc<dyn SigningProvider>) -> Self {
    Self { provider }
  }

  pub fn verify_signature(&self, path: &Path) -> Result<SignatureStatus> {
    let record = self.provider.signing_record(path).map_err(|e| match e {
      UpdateError::SignatureVerificationFailed(_) => e,
      other => UpdateError::SignatureVerificationFailed(other.to_string()),
    })?;

    let Some(certificate) = record.certificate else {
      return Err(UpdateError::SignatureMissing);
    };

    let valid = record.state == RecordState::Valid;
    if let RecordState::Invalid(reason) = &record.state {
      tracing::debug!(path = %path.display(), reason = %reason, "signing record reports invalid signature");
    }

    Ok(SignatureStatus {
      valid,
      certificate: Some(certificate),
    })
  }

  /// Each artifact is verified independently; failures are reported per
  /// artifact rather than dropped.
  pub fn validate_many<P: AsRef<Path>>(&self, paths: &[P]) -> Vec<BatchOutcome> {
    paths
      .iter()
      .map(|p| {
        let path = p.as_ref();
        BatchOutcome {
          path: path.to_path_buf(),
          result: self.verify_signature(path),
        }
      })
      .collect()
  }

  /// Signature present and valid, signer unexpired and chaining to `roots`.
  /// The error names the first step that failed.
  pub fn check_chain(&self, path: &Path, roots: &TrustRoots) -> Result<SignatureStatus> {
    let status = self.verify_signature(path)?;
    if !status.valid {
      return Err(UpdateError::SignatureInvalid);
    }
    let cert = status
      .certificate
      .as_deref()
      .ok_or(UpdateError::SignatureMissing)?;
    if is_expired(cert) {
      return Err(UpdateError::CertificateExpired);
    }
    if !is_trusted(cert, roots) {
      return Err(UpdateError::UntrustedCertificate);
    }
    Ok(status)
  }

  pub fn validate_chain(&self, path: &Path, roots: &TrustRoots) -> bool {
    match self.check_chain(path, roots) {
      Ok(_) => true,
      Err(e) => {
        tracing::debug!(path = %path.display(), error = %e, "chain validation failed");
        false
      }
    }
  }
}

pub fn is_trusted(cert: &dyn Certificate, roots: &TrustRoots) -> bool {
  if roots.is_empty() {
    return false;
  }
  match cert.evaluate_trust(roots, Utc::now()) {
    Some(Ok(())) => true,
    Some(Err(failure)) => {
      tracing::debug!(subject = %cert.subject(), reason = %failure, "certificate not trusted");
      false
    }
    None => false,
  }
}

/// Fail-closed: a certificate whose expiry cannot be read counts as expired.
pub fn is_expired(cert: &dyn Certificate) -> bool {
  is_expired_at(cert, Utc::now())
}

pub fn is_expired_at(cert: &dyn Certificate, now: DateTime<Utc>) -> bool {
  match cert.not_after() {
    Some(not_after) => not_after < now,
    None => true,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[derive(Debug)]
  struct FixedCert {
    not_after: Option<DateTime<Utc>>,
    trust: Option<std::result::Result<(), TrustFailure>>,
  }

  impl Certificate for FixedCert {
    fn subject(&self) -> &str {
      "leaf"
    }
    fn issuer(&self) -> &str {
      "root"
    }
    fn not_after(&self) -> Option<DateTime<Utc>> {
      self.not_after
    }
    fn evaluate_trust(&self, _: &TrustRoots, _: DateTime<Utc>) -> Option<std::result::Result<(), TrustFailure>> {
      self.trust.clone()
    }
  }

  struct FixedProvider(fn() -> Result<SigningRecord>);

  impl SigningProvider for FixedProvider {
    fn signing_record(&self, _path: &Path) -> Result<SigningRecord> {
      (self.0)()
    }
  }

  fn some_root() -> TrustRoots {
    let key = ed25519_dalek::SigningKey::from_bytes(&[1u8; 32]);
    let root = ReleaseCertificate::self_signed("root", Utc::now() + Duration::days(30), &key).unwrap();
    TrustRoots::new(vec![root])
  }

  #[test]
  fn missing_expiry_counts_as_expired() {
    let cert = FixedCert { not_after: None, trust: Some(Ok(())) };
    assert!(is_expired(&cert));
  }

  #[test]
  fn expiry_compares_against_now() {
    let now = Utc::now();
    let past = FixedCert { not_after: Some(now - Duration::seconds(1)), trust: None };
    let future = FixedCert { not_after: Some(now + Duration::days(1)), trust: None };
    assert!(is_expired_at(&past, now));
    assert!(!is_expired_at(&future, now));
  }

  #[test]
  fn empty_roots_never_trust() {
    let cert = FixedCert { not_after: None, trust: Some(Ok(())) };
    assert!(!is_trusted(&cert, &TrustRoots::default()));
  }

  #[test]
  fn absent_evaluation_is_untrusted() {
    let cert = FixedCert { not_after: None, trust: None };
    assert!(!is_trusted(&cert, &some_root()));

    let cert = FixedCert { not_after: None, trust: Some(Err(TrustFailure::DepthExceeded)) };
    assert!(!is_trusted(&cert, &some_root()));

    let cert = FixedCert { not_after: None, trust: Some(Ok(())) };
    assert!(is_trusted(&cert, &some_root()));
  }

  #[test]
  fn record_without_certificate_is_signature_missing() {
    let v = SignatureValidator::new(Arc::new(FixedProvider(|| {
      Ok(SigningRecord { state: RecordState::Valid, certificate: None })
    })));
    let err = v.verify_signature(Path::new("/x")).unwrap_err();
    assert!(matches!(err, UpdateError::SignatureMissing));
  }

  #[test]
  fn unreadable_record_is_verification_failure() {
    let v = SignatureValidator::new(Arc::new(FixedProvider(|| Err(UpdateError::Unknown("gone".into())))));
    let err = v.verify_signature(Path::new("/x")).unwrap_err();
    assert!(matches!(err, UpdateError::SignatureVerificationFailed(_)));
    assert!(!v.validate_chain(Path::new("/x"), &some_root()));
  }

  #[test]
  fn validity_flag_follows_record_state() {
    let v = SignatureValidator::new(Arc::new(FixedProvider(|| {
      Ok(SigningRecord {
        state: RecordState::Invalid("bad".into()),
        certificate: Some(Arc::new(FixedCert {
          not_after: Some(Utc::now() + Duration::days(1)),
          trust: Some(Ok(())),
        })),
      })
    })));
    let status = v.verify_signature(Path::new("/x")).unwrap();
    assert!(!status.valid);
    assert!(matches!(
      v.check_chain(Path::new("/x"), &some_root()),
      Err(UpdateError::SignatureInvalid)
    ));
  }

  #[test]
  fn batch_keeps_failures_alongside_successes() {
    let v = SignatureValidator::new(Arc::new(FixedProvider(|| {
      Ok(SigningRecord { state: RecordState::Valid, certificate: None })
    })));
    let out = v.validate_many(&["/a", "/b"]);
    assert_eq!(out.len(), 2);
    assert_eq!(out[1].path, PathBuf::from("/b"));
    assert!(out.iter().all(|o| matches!(o.result, Err(UpdateError::SignatureMissing))));
  }
}
