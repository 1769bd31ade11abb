use crate::artifact::HttpArtifactFetcher;
use crate::config::Settings;
use crate::feed::HttpFeedTransport;
use crate::file_store::LocalFileStore;
use crate::lifecycle::LifecycleDispatcher;
use crate::orchestrator::{CheckHandle, CheckScheduler, Collaborators, UpdateOrchestrator, UpdateSession};
use crate::paths;
use crate::signature::{DetachedSignatureProvider, SignatureValidator, TrustRoots};
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Wires the HTTP, filesystem and signing collaborators from settings.
pub fn build_orchestrator(settings: &Settings, base: &Path) -> anyhow::Result<UpdateOrchestrator> {
  let transport = HttpFeedTransport::new(&settings.transport)?;
  let fetcher = HttpArtifactFetcher::new(
    &settings.transport,
    &settings.artifacts,
    &settings.trust,
    paths::downloads_dir(base, settings.artifacts.download_dir.as_deref()),
    Arc::new(LocalFileStore),
  )?;
  let roots_dir = paths::trust_roots_dir(base, settings.trust.roots_dir.as_deref());
  let roots = TrustRoots::load_dir(&roots_dir)?;
  if roots.is_empty() {
    tracing::warn!(dir = %roots_dir.display(), "no trust roots loaded; every artifact will be rejected");
  }

  let validator = SignatureValidator::new(Arc::new(DetachedSignatureProvider::new(
    settings.trust.signature_suffix.clone(),
  )));
  let dispatcher = LifecycleDispatcher::new()?;
  dispatcher.on_did_download(|entry| {
    tracing::info!(id = %entry.id, title = %entry.title, "verified release available");
  });
  dispatcher.on_did_fail(|err| {
    tracing::debug!(error = %err, "update check ended in failure");
  });

  Ok(UpdateOrchestrator::new(
    settings.update.clone(),
    Collaborators {
      transport: Arc::new(transport),
      fetcher: Arc::new(fetcher),
      validator,
      roots,
    },
    dispatcher,
  ))
}

pub struct UpdateAgent {
  orchestrator: UpdateOrchestrator,
}

impl UpdateAgent {
  pub fn new(orchestrator: UpdateOrchestrator) -> Self {
    Self { orchestrator }
  }

  pub fn run(&self, stop_rx: mpsc::Receiver<()>, tick: Duration) -> anyhow::Result<()> {
    let cfg = self.orchestrator.config();
    tracing::info!(
      feed = %cfg.feed_url(),
      interval_minutes = cfg.check_interval().minutes(),
      auto_update = cfg.auto_update(),
      "update agent loop started"
    );

    let mut scheduler = CheckScheduler::new(&cfg);
    let mut in_flight: Option<CheckHandle> = None;

    loop {
      if stop_rx.recv_timeout(tick).is_ok() {
        break;
      }

      if in_flight.as_ref().is_some_and(CheckHandle::is_finished) {
        if let Some(handle) = in_flight.take() {
          report(handle.wait()?);
        }
      }

      if let Some(handle) = scheduler.tick(&self.orchestrator) {
        in_flight = Some(handle);
      }
    }

    if let Some(handle) = in_flight.take() {
      self.orchestrator.cancel();
      report(handle.wait()?);
    }
    self.orchestrator.dispatcher().flush();
    tracing::info!("update agent loop exiting");
    Ok(())
  }
}

fn report(session: UpdateSession) {
  match (&session.candidate, &session.error) {
    (_, Some(err)) => tracing::warn!(session = %session.id, error = %err, "scheduled check failed"),
    (Some(entry), None) => tracing::info!(session = %session.id, id = %entry.id, "scheduled check ready"),
    (None, None) => tracing::info!(session = %session.id, phase = ?session.phase, "scheduled check finished"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{CheckInterval, TrustConfig};

  #[test]
  fn builds_from_default_settings_and_stops() {
    let base = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.update = settings.update.with_check_interval(CheckInterval::Never);
    settings.trust = TrustConfig::default();

    let orch = build_orchestrator(&settings, base.path()).unwrap();
    let agent = UpdateAgent::new(orch);
    let (tx, rx) = mpsc::channel();
    tx.send(()).unwrap();
    agent.run(rx, Duration::from_millis(10)).unwrap();
  }
}
