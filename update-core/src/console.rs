use crate::agent::build_orchestrator;
use crate::config::Settings;
use crate::digest::{digest_file, DigestAlgorithm};
use crate::feed::{self, FeedTransport, HttpFeedTransport};
use crate::orchestrator::UpdateSession;
use crate::paths;
use crate::signature::{
  load_signing_key, sign_artifact, DetachedSignatureProvider, ReleaseCertificate, SignatureValidator, TrustRoots,
};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;

pub enum ConsoleAction {
  RunAgent,
  ExitOk,
}

pub fn run_console_command(settings: &Settings, base: &Path, args: &[String]) -> anyhow::Result<ConsoleAction> {
  let args = strip_console_flag(args);

  if args.iter().any(|a| a == "--help" || a == "-h") {
    print_help();
    return Ok(ConsoleAction::ExitOk);
  }

  if args.iter().any(|a| a == "--check") {
    return run_check(settings, base);
  }

  if args.iter().any(|a| a == "--feed") {
    return run_feed(settings);
  }

  if let Some(i) = args.iter().position(|a| a == "--digest") {
    return run_digest(settings, &args[i + 1..]);
  }

  if let Some(i) = args.iter().position(|a| a == "--verify") {
    return run_verify(settings, base, &args[i + 1..]);
  }

  if let Some(i) = args.iter().position(|a| a == "--sign") {
    return run_sign(settings, &args[i + 1..]);
  }

  Ok(ConsoleAction::RunAgent)
}

fn run_check(settings: &Settings, base: &Path) -> anyhow::Result<ConsoleAction> {
  let orch = build_orchestrator(settings, base)?;
  let session = orch.check_now().context("run update check")?;
  orch.dispatcher().flush();
  print_session(&session);
  Ok(ConsoleAction::ExitOk)
}

fn run_feed(settings: &Settings) -> anyhow::Result<ConsoleAction> {
  let url = settings.update.feed_url();
  let transport = HttpFeedTransport::new(&settings.transport)?;
  let response = transport.fetch(url)?;
  if !response.is_success() {
    anyhow::bail!("feed request returned HTTP {}", response.status);
  }
  let parsed = feed::parse_feed_bytes(&response.body)?;

  println!("Feed: {} ({})", parsed.title, url);
  if let Some(d) = parsed.description.as_deref() {
    println!("Description: {d}");
  }
  println!("Updated: {}", parsed.updated.to_rfc3339());
  println!("Entries: {}", parsed.entries.len());
  for e in &parsed.entries {
    println!("  [{}] {} ({}) updated {}", e.category, e.title, e.id, e.updated.to_rfc3339());
    println!("      asset: {}", e.asset_link);
  }
  Ok(ConsoleAction::ExitOk)
}

fn run_digest(settings: &Settings, tail: &[String]) -> anyhow::Result<ConsoleAction> {
  let path = tail
    .first()
    .ok_or_else(|| anyhow::anyhow!("expected: --digest <path> [sha224|sha256|sha384|sha512]"))?;
  let algorithm = match tail.get(1) {
    Some(name) => name.parse::<DigestAlgorithm>()?,
    None => settings.artifacts.digest_algorithm,
  };
  let digest = digest_file(Path::new(path), algorithm)?;
  println!("{}  {}", digest.hex, path);
  Ok(ConsoleAction::ExitOk)
}

fn run_verify(settings: &Settings, base: &Path, tail: &[String]) -> anyhow::Result<ConsoleAction> {
  let path = tail
    .first()
    .ok_or_else(|| anyhow::anyhow!("expected: --verify <path-to-artifact>"))?;
  let roots_dir = paths::trust_roots_dir(base, settings.trust.roots_dir.as_deref());
  let roots = TrustRoots::load_dir(&roots_dir)?;
  let validator = SignatureValidator::new(Arc::new(DetachedSignatureProvider::new(
    settings.trust.signature_suffix.clone(),
  )));

  match validator.check_chain(Path::new(path), &roots) {
    Ok(status) => {
      let subject = status.certificate.as_ref().map(|c| c.subject().to_string()).unwrap_or_default();
      println!("Signature: valid, trusted (signer: {subject})");
    }
    Err(e) => println!("Signature: rejected ({e})"),
  }
  println!("Trust roots: {} from {}", roots.len(), roots_dir.display());
  Ok(ConsoleAction::ExitOk)
}

fn run_sign(settings: &Settings, tail: &[String]) -> anyhow::Result<ConsoleAction> {
  let [artifact, key_file, cert_file, rest @ ..] = tail else {
    anyhow::bail!("expected: --sign <artifact> <signing-key-file> <certificate-file> [intermediate-certificate...]");
  };
  let key = load_signing_key(Path::new(key_file))?;
  let leaf = ReleaseCertificate::load(Path::new(cert_file))?;
  let intermediates = rest
    .iter()
    .map(|p| ReleaseCertificate::load(Path::new(p)))
    .collect::<Result<Vec<_>, _>>()?;

  let record = sign_artifact(
    Path::new(artifact),
    &key,
    &leaf,
    &intermediates,
    &settings.trust.signature_suffix,
  )
  .with_context(|| format!("sign {artifact}"))?;
  tracing::info!(artifact = %artifact, record = %record.display(), signer = %leaf.subject(), "artifact signed");
  println!("Signing record: {} (signer: {})", record.display(), leaf.subject());
  Ok(ConsoleAction::ExitOk)
}

fn print_session(session: &UpdateSession) {
  println!("Session: {}", session.id);
  println!("Result: {:?}", session.phase);
  if let Some(e) = session.candidate.as_ref() {
    println!("Release: {} ({}, {})", e.title, e.id, e.category);
  }
  if let Some(a) = session.artifact.as_ref() {
    println!("Artifact: {}", a.path.display());
  }
  if let Some(d) = session.digest.as_ref() {
    println!("Digest: {d}");
  }
  if let Some(err) = session.error.as_ref() {
    println!("Error: {err} ({:?})", err.kind());
  }
}

fn strip_console_flag(args: &[String]) -> Vec<String> {
  args.iter().filter(|a| a.as_str() != "--console").cloned().collect()
}

fn print_help() {
  println!("update-agent v{} (console mode)", env!("CARGO_PKG_VERSION"));
  println!("Commands:");
  println!("  --check                      run one update check now");
  println!("  --feed                       fetch the feed and list its entries");
  println!("  --digest <path> [algorithm]  print the digest of a file");
  println!("  --verify <path>              check a signed artifact against the trust roots");
  println!("  --sign <path> <key> <cert> [intermediate...]");
  println!("                               write a signing record next to an artifact");
  println!("  (no command)                 run the scheduled agent loop until Ctrl-C");
}

#[cfg(test)]
mod tests {
  use super::*;

  fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn no_command_runs_agent() {
    let base = tempfile::tempdir().unwrap();
    let action = run_console_command(&Settings::default(), base.path(), &args(&["update-agent", "--console"])).unwrap();
    assert!(matches!(action, ConsoleAction::RunAgent));
  }

  #[test]
  fn digest_command_needs_a_readable_path() {
    let base = tempfile::tempdir().unwrap();
    let file = base.path().join("a.bin");
    std::fs::write(&file, b"abc").unwrap();
    let settings = Settings::default();

    let ok = run_console_command(&settings, base.path(), &args(&["x", "--digest", file.to_str().unwrap(), "sha512"]));
    assert!(matches!(ok, Ok(ConsoleAction::ExitOk)));

    assert!(run_console_command(&settings, base.path(), &args(&["x", "--digest"])).is_err());
    let missing = base.path().join("missing.bin");
    assert!(run_console_command(&settings, base.path(), &args(&["x", "--digest", missing.to_str().unwrap()])).is_err());
    assert!(run_console_command(&settings, base.path(), &args(&["x", "--digest", file.to_str().unwrap(), "blake2"])).is_err());
  }

  #[test]
  fn sign_command_writes_a_trusted_record() {
    use crate::signature::detached::tests::{key, release_chain};
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let base = tempfile::tempdir().unwrap();
    let file = base.path().join("app-1.2.0.tar.gz");
    std::fs::write(&file, b"release bytes").unwrap();
    let (leaf_key, leaf, roots) = release_chain();
    let key_file = base.path().join("release.key");
    std::fs::write(&key_file, URL_SAFE_NO_PAD.encode(leaf_key.to_bytes())).unwrap();
    let cert_file = base.path().join("release.toml");
    std::fs::write(&cert_file, leaf.to_toml().unwrap()).unwrap();
    let settings = Settings::default();

    let action = run_console_command(
      &settings,
      base.path(),
      &args(&["x", "--sign", file.to_str().unwrap(), key_file.to_str().unwrap(), cert_file.to_str().unwrap()]),
    );
    assert!(matches!(action, Ok(ConsoleAction::ExitOk)));
    assert!(base.path().join("app-1.2.0.tar.gz.sig").exists());
    let validator = SignatureValidator::new(Arc::new(DetachedSignatureProvider::default()));
    assert!(validator.validate_chain(&file, &roots));

    std::fs::write(&key_file, URL_SAFE_NO_PAD.encode(key(7).to_bytes())).unwrap();
    let mismatched = run_console_command(
      &settings,
      base.path(),
      &args(&["x", "--sign", file.to_str().unwrap(), key_file.to_str().unwrap(), cert_file.to_str().unwrap()]),
    );
    assert!(mismatched.is_err());
    assert!(run_console_command(&settings, base.path(), &args(&["x", "--sign", file.to_str().unwrap()])).is_err());
  }

  #[test]
  fn verify_reports_rejection_without_failing() {
    let base = tempfile::tempdir().unwrap();
    let file = base.path().join("a.bin");
    std::fs::write(&file, b"abc").unwrap();
    let action = run_console_command(&Settings::default(), base.path(), &args(&["x", "--verify", file.to_str().unwrap()]));
    assert!(matches!(action, Ok(ConsoleAction::ExitOk)));
  }
}
