use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use update_core::digest::{digest_file, DigestAlgorithm};
use update_core::signature::{
  is_expired, is_trusted, DetachedSignatureProvider, SignatureValidator, TrustRoots,
};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckMode {
  Digest(DigestAlgorithm),
  Verify { roots_dir: PathBuf },
}

impl CheckMode {
  pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
    if let Some(i) = args.iter().position(|a| a == "--digest") {
      let algorithm = algorithm_arg(args.get(i + 1)).unwrap_or(DigestAlgorithm::Sha256);
      if algorithm.hex_len().is_none() {
        anyhow::bail!("digest algorithm {algorithm} is not supported");
      }
      return Ok(Self::Digest(algorithm));
    }
    if let Some(i) = args.iter().position(|a| a == "--verify") {
      let dir = args
        .get(i + 1)
        .ok_or_else(|| anyhow::anyhow!("expected: --verify <trust-roots-dir>"))?;
      return Ok(Self::Verify {
        roots_dir: PathBuf::from(dir),
      });
    }
    Err(anyhow::anyhow!("expected `--digest [algorithm]` or `--verify <trust-roots-dir>`"))
  }

  fn label(&self) -> &'static str {
    match self {
      Self::Digest(_) => "digest",
      Self::Verify { .. } => "verify",
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct CheckConfig {
  pub targets: Vec<PathBuf>,
  pub excludes: Vec<String>,
  pub cancel_file: Option<PathBuf>,
  pub json: bool,
  pub signature_suffix: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ArtifactReport {
  pub path: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub digest: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub signature_valid: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub trusted: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub signer: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl ArtifactReport {
  fn new(path: &Path) -> Self {
    Self {
      path: path.to_string_lossy().into_owned(),
      digest: None,
      signature_valid: None,
      trusted: None,
      signer: None,
      error: None,
    }
  }

  pub fn passed(&self) -> bool {
    self.error.is_none() && self.signature_valid != Some(false) && self.trusted != Some(false)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckSummary {
  pub mode: &'static str,
  pub checked: u64,
  pub failures: u64,
  pub cancelled: bool,
  pub artifacts: Vec<ArtifactReport>,
}

pub fn parse_check_config(args: &[String]) -> CheckConfig {
  let mut cfg = CheckConfig {
    signature_suffix: "sig".to_string(),
    ..CheckConfig::default()
  };
  let mut i = 1;
  while i < args.len() {
    match args[i].as_str() {
      "--exclude" | "--cancel-file" | "--suffix" | "--verify" => {
        if let Some(v) = args.get(i + 1) {
          match args[i].as_str() {
            "--exclude" => cfg.excludes.push(v.to_ascii_lowercase()),
            "--cancel-file" => cfg.cancel_file = Some(PathBuf::from(v)),
            "--suffix" => cfg.signature_suffix = v.clone(),
            _ => {}
          }
          i += 2;
          continue;
        }
      }
      "--digest" => {
        if algorithm_arg(args.get(i + 1)).is_some() {
          i += 2;
          continue;
        }
      }
      "--json" => cfg.json = true,
      other if !other.starts_with("--") => cfg.targets.push(PathBuf::from(other)),
      _ => {}
    }
    i += 1;
  }
  cfg
}

/// The argument after `--digest` is an algorithm only when it parses as one;
/// anything else is left as a target.
fn algorithm_arg(arg: Option<&String>) -> Option<DigestAlgorithm> {
  arg.and_then(|a| a.parse().ok())
}

pub fn run(mode: &CheckMode, cfg: &CheckConfig) -> anyhow::Result<CheckSummary> {
  let files = collect_files(cfg);
  tracing::info!(mode = mode.label(), files = files.len(), "artifact check starting");

  let mut summary = CheckSummary {
    mode: mode.label(),
    checked: 0,
    failures: 0,
    cancelled: false,
    artifacts: Vec::new(),
  };

  match mode {
    CheckMode::Digest(algorithm) => {
      for path in &files {
        if should_cancel(cfg) {
          summary.cancelled = true;
          break;
        }
        let mut report = ArtifactReport::new(path);
        match digest_file(path, *algorithm) {
          Ok(d) => report.digest = Some(d.hex),
          Err(e) => report.error = Some(e.to_string()),
        }
        summary.push(report);
      }
    }
    CheckMode::Verify { roots_dir } => {
      let roots = TrustRoots::load_dir(roots_dir)?;
      let validator = SignatureValidator::new(Arc::new(DetachedSignatureProvider::new(
        cfg.signature_suffix.clone(),
      )));
      let suffix = format!(".{}", cfg.signature_suffix);
      let artifacts: Vec<&PathBuf> = files
        .iter()
        .filter(|p| !p.to_string_lossy().ends_with(&suffix))
        .collect();

      for chunk in artifacts.chunks(64) {
        if should_cancel(cfg) {
          summary.cancelled = true;
          break;
        }
        for outcome in validator.validate_many(chunk) {
          let mut report = ArtifactReport::new(&outcome.path);
          match outcome.result {
            Ok(status) => {
              report.signature_valid = Some(status.valid);
              if let Some(cert) = status.certificate.as_deref() {
                report.signer = Some(cert.subject().to_string());
                report.trusted = Some(status.valid && !is_expired(cert) && is_trusted(cert, &roots));
              }
            }
            Err(e) => report.error = Some(e.to_string()),
          }
          summary.push(report);
        }
      }
    }
  }

  if summary.cancelled {
    tracing::info!(checked = summary.checked, "artifact check cancelled");
  }
  Ok(summary)
}

impl CheckSummary {
  fn push(&mut self, report: ArtifactReport) {
    self.checked += 1;
    if !report.passed() {
      self.failures += 1;
    }
    if self.checked % 250 == 0 {
      tracing::info!(checked = self.checked, failures = self.failures, "progress");
    }
    self.artifacts.push(report);
  }
}

pub fn print_summary(summary: &CheckSummary, json: bool) -> anyhow::Result<()> {
  if json {
    println!("{}", serde_json::to_string_pretty(summary)?);
    return Ok(());
  }
  for r in &summary.artifacts {
    match (&r.digest, &r.error) {
      (_, Some(e)) => println!("FAIL  {}  {e}", r.path),
      (Some(d), None) => println!("{d}  {}", r.path),
      (None, None) => println!(
        "{}  {}  signer={}",
        if r.passed() { "OK  " } else { "FAIL" },
        r.path,
        r.signer.as_deref().unwrap_or("<none>")
      ),
    }
  }
  println!(
    "Check complete: mode={} checked={} failures={}{}",
    summary.mode,
    summary.checked,
    summary.failures,
    if summary.cancelled { " (cancelled)" } else { "" }
  );
  Ok(())
}

fn collect_files(cfg: &CheckConfig) -> Vec<PathBuf> {
  let mut out = Vec::new();
  for target in &cfg.targets {
    if !target.exists() {
      tracing::warn!(path = %target.display(), "target does not exist");
      continue;
    }
    let walker = WalkDir::new(target)
      .follow_links(false)
      .sort_by_file_name()
      .into_iter()
      .filter_entry(|e| !is_excluded(&cfg.excludes, e.path()));
    for entry in walker.flatten() {
      if entry.file_type().is_file() {
        out.push(entry.into_path());
      }
    }
  }
  out
}

fn should_cancel(cfg: &CheckConfig) -> bool {
  cfg.cancel_file.as_deref().is_some_and(Path::exists)
}

fn is_excluded(excludes: &[String], path: &Path) -> bool {
  let p = path.to_string_lossy().to_ascii_lowercase();
  excludes.iter().any(|ex| !ex.trim().is_empty() && p.starts_with(ex.as_str()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;

  fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn parses_modes_and_flags() {
    let a = args(&["artifact-check", "--digest", "sha512", "--exclude", "/Tmp/Skip", "--json", "/srv/out"]);
    assert_eq!(CheckMode::from_args(&a).unwrap(), CheckMode::Digest(DigestAlgorithm::Sha512));
    let cfg = parse_check_config(&a);
    assert_eq!(cfg.targets, vec![PathBuf::from("/srv/out")]);
    assert_eq!(cfg.excludes, vec!["/tmp/skip".to_string()]);
    assert!(cfg.json);

    let a = args(&["artifact-check", "--verify", "/etc/roots", "dist"]);
    assert_eq!(
      CheckMode::from_args(&a).unwrap(),
      CheckMode::Verify { roots_dir: PathBuf::from("/etc/roots") }
    );
    assert_eq!(parse_check_config(&a).targets, vec![PathBuf::from("dist")]);
    assert!(CheckMode::from_args(&args(&["artifact-check"])).is_err());
  }

  #[test]
  fn digest_target_is_not_mistaken_for_an_algorithm() {
    let a = args(&["artifact-check", "--digest", "missing-dist"]);
    assert_eq!(CheckMode::from_args(&a).unwrap(), CheckMode::Digest(DigestAlgorithm::Sha256));
    assert_eq!(parse_check_config(&a).targets, vec![PathBuf::from("missing-dist")]);

    let summary = run(&CheckMode::from_args(&a).unwrap(), &parse_check_config(&a)).unwrap();
    assert_eq!(summary.checked, 0);

    let a = args(&["artifact-check", "--digest", "SHA-384", "dist"]);
    assert_eq!(CheckMode::from_args(&a).unwrap(), CheckMode::Digest(DigestAlgorithm::Sha384));
    assert_eq!(parse_check_config(&a).targets, vec![PathBuf::from("dist")]);

    assert!(CheckMode::from_args(&args(&["artifact-check", "--digest", "blake2", "dist"])).is_err());
  }

  #[test]
  fn digests_every_file_and_honours_excludes() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.bin"), b"abc").unwrap();
    fs::create_dir(dir.path().join("skip")).unwrap();
    fs::write(dir.path().join("skip").join("b.bin"), b"x").unwrap();

    let cfg = CheckConfig {
      targets: vec![dir.path().to_path_buf()],
      excludes: vec![dir.path().join("skip").to_string_lossy().to_ascii_lowercase()],
      ..CheckConfig::default()
    };
    let summary = run(&CheckMode::Digest(DigestAlgorithm::Sha256), &cfg).unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.failures, 0);
    assert_eq!(
      summary.artifacts[0].digest.as_deref(),
      Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
    );
  }

  #[test]
  fn unsigned_artifacts_are_reported_not_dropped() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.bin"), b"abc").unwrap();
    fs::write(dir.path().join("b.bin"), b"def").unwrap();
    let cfg = CheckConfig {
      targets: vec![dir.path().to_path_buf()],
      signature_suffix: "sig".to_string(),
      ..CheckConfig::default()
    };
    let mode = CheckMode::Verify { roots_dir: dir.path().join("roots") };
    let summary = run(&mode, &cfg).unwrap();
    assert_eq!(summary.checked, 2);
    assert_eq!(summary.failures, 2);
    assert!(summary.artifacts.iter().all(|r| r.error.is_some()));

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["mode"], "verify");
    assert_eq!(json["artifacts"].as_array().unwrap().len(), 2);
  }

  #[test]
  fn cancel_file_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.bin"), b"abc").unwrap();
    let cancel = dir.path().join("cancel");
    fs::write(&cancel, b"").unwrap();
    let cfg = CheckConfig {
      targets: vec![dir.path().join("a.bin")],
      cancel_file: Some(cancel),
      ..CheckConfig::default()
    };
    let summary = run(&CheckMode::Digest(DigestAlgorithm::Sha256), &cfg).unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.checked, 0);
  }
}
