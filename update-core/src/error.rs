use std::io;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, UpdateError>;

/// Coarse grouping of [`UpdateError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Network,
  Http,
  Data,
  UpdateManagement,
  Auth,
  Filesystem,
  Configuration,
  General,
}

#[derive(thiserror::Error, Debug)]
pub enum UpdateError {
  #[error("invalid URL: {0}")]
  InvalidUrl(String),
  #[error("transport failure: {0}")]
  Transport(String),
  #[error("request timed out")]
  Timeout,
  #[error("TLS failure: {0}")]
  Tls(String),

  #[error("HTTP client error (status {0})")]
  HttpClient(u16),
  #[error("HTTP server error (status {0})")]
  HttpServer(u16),
  #[error("unexpected HTTP status {0}")]
  HttpStatus(u16),

  #[error("response body is empty")]
  EmptyBody,
  #[error("invalid response body: {0}")]
  InvalidBody(String),
  #[error("feed parsing failed: {0}")]
  Parse(String),

  #[error("invalid release format: {0}")]
  InvalidReleaseFormat(String),
  #[error("no release found for the configured channels")]
  ReleaseNotFound,
  #[error("release is incompatible: {0}")]
  IncompatibleRelease(String),
  #[error("an update check is already in progress")]
  UpdateAlreadyInProgress,
  #[error("update was cancelled")]
  UpdateCancelled,
  #[error("insufficient permissions to apply the update")]
  InsufficientPermissions,
  #[error("checksum mismatch (expected {expected}, got {actual})")]
  UpdateChecksumMismatch { expected: String, actual: String },
  #[error("update file not found: {0}")]
  UpdateFileNotFound(PathBuf),

  #[error("artifact carries no signing certificate")]
  SignatureMissing,
  #[error("signature verification failed: {0}")]
  SignatureVerificationFailed(String),
  #[error("signature is not valid")]
  SignatureInvalid,
  #[error("signing certificate is not trusted")]
  UntrustedCertificate,
  #[error("signing certificate has expired")]
  CertificateExpired,

  #[error(transparent)]
  Filesystem(#[from] FileStoreError),

  #[error("missing configuration: {0}")]
  MissingConfiguration(String),
  #[error("invalid configuration: {0}")]
  InvalidConfiguration(String),
  #[error("unsupported: {0}")]
  UnsupportedFeature(String),

  #[error("invalid state: {0}")]
  InvalidState(String),
  #[error("dependency unavailable: {0}")]
  DependencyUnavailable(String),
  #[error("{0}")]
  Unknown(String),
}

impl UpdateError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::InvalidUrl(_) | Self::Transport(_) | Self::Timeout | Self::Tls(_) => ErrorKind::Network,
      Self::HttpClient(_) | Self::HttpServer(_) | Self::HttpStatus(_) => ErrorKind::Http,
      Self::EmptyBody | Self::InvalidBody(_) | Self::Parse(_) => ErrorKind::Data,
      Self::InvalidReleaseFormat(_)
      | Self::ReleaseNotFound
      | Self::IncompatibleRelease(_)
      | Self::UpdateAlreadyInProgress
      | Self::UpdateCancelled
      | Self::InsufficientPermissions
      | Self::UpdateChecksumMismatch { .. }
      | Self::UpdateFileNotFound(_) => ErrorKind::UpdateManagement,
      Self::SignatureMissing
      | Self::SignatureVerificationFailed(_)
      | Self::SignatureInvalid
      | Self::UntrustedCertificate
      | Self::CertificateExpired => ErrorKind::Auth,
      Self::Filesystem(_) => ErrorKind::Filesystem,
      Self::MissingConfiguration(_) | Self::InvalidConfiguration(_) | Self::UnsupportedFeature(_) => {
        ErrorKind::Configuration
      }
      Self::InvalidState(_) | Self::DependencyUnavailable(_) | Self::Unknown(_) => ErrorKind::General,
    }
  }

  /// Classifies a non-2xx status into the HTTP error group.
  pub fn from_status(status: u16) -> Self {
    match status {
      400..=499 => Self::HttpClient(status),
      500..=599 => Self::HttpServer(status),
      _ => Self::HttpStatus(status),
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum FileStoreError {
  #[error("file not found: {0}")]
  NotFound(PathBuf),
  #[error("file already exists: {0}")]
  AlreadyExists(PathBuf),
  #[error("permission denied: {0}")]
  PermissionDenied(PathBuf),
  #[error("write failed for {path}: {source}")]
  WriteFailed { path: PathBuf, source: io::Error },
  #[error("read failed for {path}: {source}")]
  ReadFailed { path: PathBuf, source: io::Error },
  #[error("insufficient storage writing {0}")]
  InsufficientStorage(PathBuf),
  #[error("filesystem error: {0}")]
  Unknown(#[from] io::Error),
}

/// Which side of the store an I/O error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
  Read,
  Write,
  Other,
}

impl FileStoreError {
  pub fn from_io(path: &Path, op: IoOp, err: io::Error) -> Self {
    match err.kind() {
      io::ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
      io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_path_buf()),
      io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
      io::ErrorKind::StorageFull => Self::InsufficientStorage(path.to_path_buf()),
      _ => match op {
        IoOp::Read => Self::ReadFailed {
          path: path.to_path_buf(),
          source: err,
        },
        IoOp::Write => Self::WriteFailed {
          path: path.to_path_buf(),
          source: err,
        },
        IoOp::Other => Self::Unknown(err),
      },
    }
  }
}
