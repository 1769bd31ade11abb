use crate::config::{ArtifactConfig, TransportConfig, TrustConfig};
use crate::digest::{Digest, DigestAlgorithm};
use crate::error::{FileStoreError, Result, UpdateError};
use crate::feed::fetch::{build_client, http_get, read_response_with_limit, safe_url_label};
use crate::file_store::FileStore;
use crate::model::Entry;
use reqwest::blocking::Client;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;

const MAX_SIDECAR_BYTES: usize = 4096;
const MAX_RECORD_BYTES: usize = 64 * 1024;

/// A downloaded release artifact and the digest it is expected to have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
  pub path: PathBuf,
  pub expected_digest: Digest,
}

pub trait ArtifactFetcher: Send + Sync {
  fn fetch_artifact(&self, entry: &Entry) -> Result<Artifact>;
}

/// Raw GET used by [`HttpArtifactFetcher`]. Non-2xx statuses are returned,
/// not turned into errors.
pub trait ArtifactSource: Send + Sync {
  fn get(&self, url: &Url, max_bytes: usize) -> Result<(u16, Vec<u8>)>;
}

pub struct HttpArtifactSource {
  client: Client,
}

impl HttpArtifactSource {
  pub fn new(transport: &TransportConfig) -> Result<Self> {
    Ok(Self {
      client: build_client(transport)?,
    })
  }
}

impl ArtifactSource for HttpArtifactSource {
  fn get(&self, url: &Url, max_bytes: usize) -> Result<(u16, Vec<u8>)> {
    let response = http_get(&self.client, url)?;
    let status = response.status().as_u16();
    let body = read_response_with_limit(response, max_bytes)?;
    Ok((status, body))
  }
}

/// Downloads `assetLink`, the sidecar digest `<assetLink>.<algorithm>`
/// (`sha256sum` layout) and the signing record `<assetLink>.<suffix>`. The
/// record is stored next to the artifact; a 404 leaves the artifact unsigned.
pub struct HttpArtifactFetcher {
  source: Arc<dyn ArtifactSource>,
  store: Arc<dyn FileStore>,
  download_dir: PathBuf,
  algorithm: DigestAlgorithm,
  signature_suffix: String,
  max_bytes: usize,
}

impl HttpArtifactFetcher {
  pub fn new(
    transport: &TransportConfig,
    artifacts: &ArtifactConfig,
    trust: &TrustConfig,
    download_dir: PathBuf,
    store: Arc<dyn FileStore>,
  ) -> Result<Self> {
    let source = Arc::new(HttpArtifactSource::new(transport)?);
    Self::with_source(source, artifacts, trust, download_dir, store)
  }

  pub fn with_source(
    source: Arc<dyn ArtifactSource>,
    artifacts: &ArtifactConfig,
    trust: &TrustConfig,
    download_dir: PathBuf,
    store: Arc<dyn FileStore>,
  ) -> Result<Self> {
    if artifacts.digest_algorithm.hex_len().is_none() {
      return Err(UpdateError::UnsupportedFeature(format!(
        "digest algorithm {} is not supported",
        artifacts.digest_algorithm
      )));
    }
    let suffix = trust.signature_suffix.trim();
    if suffix.is_empty() || suffix.contains(['/', '\\']) {
      return Err(UpdateError::InvalidConfiguration(format!(
        "signature suffix `{}` is not usable",
        trust.signature_suffix
      )));
    }
    Ok(Self {
      source,
      store,
      download_dir,
      algorithm: artifacts.digest_algorithm,
      signature_suffix: suffix.to_string(),
      max_bytes: artifacts.max_artifact_bytes,
    })
  }

  fn get_bytes(&self, url: &Url, max_bytes: usize) -> Result<Vec<u8>> {
    let (status, body) = self.source.get(url, max_bytes)?;
    if !(200..=299).contains(&status) {
      return Err(UpdateError::from_status(status));
    }
    if body.is_empty() {
      return Err(UpdateError::EmptyBody);
    }
    Ok(body)
  }

  fn get_record(&self, url: &Url) -> Result<Option<Vec<u8>>> {
    match self.get_bytes(url, MAX_RECORD_BYTES) {
      Ok(body) => Ok(Some(body)),
      Err(UpdateError::HttpClient(404)) => {
        tracing::warn!(url = %safe_url_label(url), "no signing record published");
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }
}

impl ArtifactFetcher for HttpArtifactFetcher {
  fn fetch_artifact(&self, entry: &Entry) -> Result<Artifact> {
    let name = artifact_file_name(&entry.asset_link)?;

    let sidecar = companion_url(&entry.asset_link, self.algorithm.as_str());
    let text = self.get_bytes(&sidecar, MAX_SIDECAR_BYTES)?;
    let expected_digest = parse_sidecar(&String::from_utf8_lossy(&text), self.algorithm)?;

    let record = self.get_record(&companion_url(&entry.asset_link, &self.signature_suffix))?;
    let bytes = self.get_bytes(&entry.asset_link, self.max_bytes)?;

    let path = self.download_dir.join(&name);
    let record_path = self.download_dir.join(format!("{name}.{}", self.signature_suffix));
    self.store.write(&path, &bytes)?;
    match record {
      Some(record) => self.store.write(&record_path, &record)?,
      None => match self.store.delete(&record_path) {
        Ok(()) | Err(FileStoreError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
      },
    }

    tracing::info!(
      url = %safe_url_label(&entry.asset_link),
      path = %path.display(),
      bytes = bytes.len(),
      signed = record_path.exists(),
      "artifact downloaded"
    );
    Ok(Artifact { path, expected_digest })
  }
}

/// Last non-empty path segment of the asset URL.
pub fn artifact_file_name(url: &Url) -> Result<String> {
  let name = url
    .path_segments()
    .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
    .ok_or_else(|| UpdateError::InvalidReleaseFormat(format!("asset link has no file name: {url}")))?;
  if name == "." || name == ".." || name.contains('\\') {
    return Err(UpdateError::InvalidReleaseFormat(format!(
      "asset file name is not usable: {name}"
    )));
  }
  Ok(name.to_string())
}

fn companion_url(asset: &Url, extension: &str) -> Url {
  let mut url = asset.clone();
  let path = format!("{}.{}", asset.path(), extension);
  url.set_path(&path);
  url.set_query(None);
  url
}

/// Reads `<hex>[ <file name>]` from the first non-blank line.
pub fn parse_sidecar(text: &str, algorithm: DigestAlgorithm) -> Result<Digest> {
  let token = text
    .lines()
    .map(str::trim)
    .find(|l| !l.is_empty())
    .and_then(|l| l.split_whitespace().next())
    .ok_or_else(|| UpdateError::InvalidReleaseFormat("digest sidecar is empty".to_string()))?;

  let digest = Digest::new(algorithm, token);
  if !digest.is_well_formed() {
    return Err(UpdateError::InvalidReleaseFormat(format!(
      "digest sidecar does not hold a {algorithm} value"
    )));
  }
  Ok(digest)
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::digest::digest_bytes;
  use crate::file_store::LocalFileStore;
  use crate::model::Author;
  use crate::signature::detached::tests::release_chain;
  use crate::signature::{sign_artifact, DetachedSignatureProvider, SignatureValidator};
  use chrono::Utc;
  use std::collections::HashMap;
  use std::fs;
  use std::sync::Mutex;

  const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

  /// Serves canned responses by URL; anything else is a 404.
  #[derive(Default)]
  pub(crate) struct MapSource {
    pub(crate) responses: HashMap<String, Vec<u8>>,
    pub(crate) requested: Mutex<Vec<String>>,
  }

  impl ArtifactSource for MapSource {
    fn get(&self, url: &Url, _max_bytes: usize) -> Result<(u16, Vec<u8>)> {
      if let Ok(mut requested) = self.requested.lock() {
        requested.push(url.to_string());
      }
      Ok(match self.responses.get(url.as_str()) {
        Some(body) => (200, body.clone()),
        None => (404, Vec::new()),
      })
    }
  }

  /// Publishes `payload` at `asset` with a sha256 sidecar and, when `signed`,
  /// a signing record from the shared test chain.
  pub(crate) fn published_release(asset: &str, payload: &[u8], signed: bool) -> (MapSource, crate::signature::TrustRoots) {
    let publish = tempfile::tempdir().unwrap();
    let local = publish.path().join("payload");
    fs::write(&local, payload).unwrap();
    let (leaf_key, leaf, roots) = release_chain();

    let mut source = MapSource::default();
    let digest = digest_bytes(payload, DigestAlgorithm::Sha256).unwrap();
    source.responses.insert(format!("{asset}.sha256"), format!("{}  payload\n", digest.hex).into_bytes());
    if signed {
      let record = sign_artifact(&local, &leaf_key, &leaf, &[], "sig").unwrap();
      source.responses.insert(format!("{asset}.sig"), fs::read(record).unwrap());
    }
    source.responses.insert(asset.to_string(), payload.to_vec());
    (source, roots)
  }

  pub(crate) fn release_entry(asset: &str) -> Entry {
    let now = Utc::now();
    Entry {
      title: "1.2.0".into(),
      link: Url::parse("https://example.com/notes").unwrap(),
      id: "urn:release:1.2.0".into(),
      updated: now,
      published: now,
      author: Author {
        name: "Release Bot".into(),
        uri: Url::parse("https://example.com/team").unwrap(),
      },
      summary: String::new(),
      asset_link: Url::parse(asset).unwrap(),
      category: "stable".into(),
    }
  }

  fn fetcher(source: Arc<MapSource>, dir: &std::path::Path) -> HttpArtifactFetcher {
    HttpArtifactFetcher::with_source(
      source,
      &ArtifactConfig::default(),
      &TrustConfig::default(),
      dir.to_path_buf(),
      Arc::new(LocalFileStore),
    )
    .unwrap()
  }

  #[test]
  fn signing_record_lands_next_to_artifact() {
    let asset = "https://cdn.example.com/releases/app-1.2.0.tar.gz";
    let (source, roots) = published_release(asset, b"release bytes", true);
    let source = Arc::new(source);
    let dir = tempfile::tempdir().unwrap();
    let fetcher = fetcher(source.clone(), dir.path());

    let artifact = fetcher.fetch_artifact(&release_entry(asset)).unwrap();
    assert_eq!(artifact.path, dir.path().join("app-1.2.0.tar.gz"));
    assert_eq!(fs::read(&artifact.path).unwrap(), b"release bytes");
    assert!(dir.path().join("app-1.2.0.tar.gz.sig").exists());
    assert_eq!(
      *source.requested.lock().unwrap(),
      vec![format!("{asset}.sha256"), format!("{asset}.sig"), asset.to_string()]
    );

    let validator = SignatureValidator::new(Arc::new(DetachedSignatureProvider::default()));
    let status = validator.check_chain(&artifact.path, &roots).unwrap();
    assert!(status.valid);
  }

  #[test]
  fn missing_record_leaves_artifact_unsigned() {
    let asset = "https://cdn.example.com/releases/app-1.2.0.tar.gz";
    let (source, roots) = published_release(asset, b"release bytes", false);
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join("app-1.2.0.tar.gz.sig");
    fs::write(&stale, "left over from an earlier download").unwrap();
    let fetcher = fetcher(Arc::new(source), dir.path());

    let artifact = fetcher.fetch_artifact(&release_entry(asset)).unwrap();
    assert!(!stale.exists());
    let validator = SignatureValidator::new(Arc::new(DetachedSignatureProvider::default()));
    assert!(matches!(validator.check_chain(&artifact.path, &roots), Err(UpdateError::SignatureMissing)));
  }

  #[test]
  fn missing_asset_fails_before_anything_is_written() {
    let asset = "https://cdn.example.com/releases/app-1.2.0.tar.gz";
    let (mut source, _) = published_release(asset, b"release bytes", false);
    source.responses.remove(asset);
    let dir = tempfile::tempdir().unwrap();
    let fetcher = fetcher(Arc::new(source), dir.path());
    assert!(matches!(fetcher.fetch_artifact(&release_entry(asset)), Err(UpdateError::HttpClient(404))));
    assert!(!dir.path().join("app-1.2.0.tar.gz").exists());
  }

  #[test]
  fn unusable_signature_suffix_is_refused() {
    let trust = TrustConfig {
      signature_suffix: "../sig".into(),
      ..TrustConfig::default()
    };
    let res = HttpArtifactFetcher::with_source(
      Arc::new(MapSource::default()),
      &ArtifactConfig::default(),
      &trust,
      PathBuf::from("."),
      Arc::new(LocalFileStore),
    );
    assert!(matches!(res, Err(UpdateError::InvalidConfiguration(_))));
  }

  #[test]
  fn sidecar_accepts_sha256sum_layout() {
    let text = format!("\n{}  app-1.2.0.tar.gz\n", ABC_SHA256.to_ascii_uppercase());
    let d = parse_sidecar(&text, DigestAlgorithm::Sha256).unwrap();
    assert_eq!(d.hex, ABC_SHA256);
    assert_eq!(d.algorithm, DigestAlgorithm::Sha256);
  }

  #[test]
  fn sidecar_rejects_wrong_length_and_empty() {
    assert!(parse_sidecar(ABC_SHA256, DigestAlgorithm::Sha512).is_err());
    assert!(parse_sidecar("  \n", DigestAlgorithm::Sha256).is_err());
  }

  #[test]
  fn file_name_and_sidecar_url() {
    let url = Url::parse("https://cdn.example.com/releases/app-1.2.0.tar.gz?sig=1").unwrap();
    assert_eq!(artifact_file_name(&url).unwrap(), "app-1.2.0.tar.gz");
    assert_eq!(
      companion_url(&url, DigestAlgorithm::Sha384.as_str()).as_str(),
      "https://cdn.example.com/releases/app-1.2.0.tar.gz.sha384"
    );

    let bare = Url::parse("https://cdn.example.com/").unwrap();
    assert!(artifact_file_name(&bare).is_err());
  }

  #[test]
  fn insecure_asset_link_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = HttpArtifactFetcher::new(
      &TransportConfig::default(),
      &ArtifactConfig::default(),
      &TrustConfig::default(),
      dir.path().to_path_buf(),
      Arc::new(LocalFileStore),
    )
    .unwrap();
    let entry = release_entry("http://cdn.example.com/app.tar.gz");
    assert!(matches!(fetcher.fetch_artifact(&entry), Err(UpdateError::InvalidUrl(_))));
  }

  #[test]
  fn blake2_is_rejected_up_front() {
    let cfg = ArtifactConfig {
      digest_algorithm: DigestAlgorithm::Blake2,
      ..ArtifactConfig::default()
    };
    let res = HttpArtifactFetcher::new(
      &TransportConfig::default(),
      &cfg,
      &TrustConfig::default(),
      PathBuf::from("."),
      Arc::new(LocalFileStore),
    );
    assert!(matches!(res, Err(UpdateError::UnsupportedFeature(_))));
  }
}
