use super::{CheckHandle, UpdateOrchestrator};
use crate::config::Config;
use crate::error::UpdateError;
use std::time::{SystemTime, UNIX_EPOCH};

/// Starts automatic checks on the configured interval. Manual checks go
/// straight to the orchestrator and are not affected by this.
#[derive(Debug, Clone, Default)]
pub struct CheckScheduler {
  next_due_unix_ms: Option<u64>,
}

impl CheckScheduler {
  pub fn new(config: &Config) -> Self {
    let mut out = Self::default();
    if let Some(interval_ms) = interval_ms(config) {
      out.next_due_unix_ms = Some(now_unix_ms().saturating_add(interval_ms));
    }
    out
  }

  pub fn next_due_unix_ms(&self) -> Option<u64> {
    self.next_due_unix_ms
  }

  pub fn tick(&mut self, orchestrator: &UpdateOrchestrator) -> Option<CheckHandle> {
    self.tick_at(orchestrator, now_unix_ms())
  }

  pub fn tick_at(&mut self, orchestrator: &UpdateOrchestrator, now_ms: u64) -> Option<CheckHandle> {
    let Some(interval_ms) = interval_ms(&orchestrator.config()) else {
      self.next_due_unix_ms = None;
      return None;
    };

    let Some(next_due) = self.next_due_unix_ms else {
      self.next_due_unix_ms = Some(now_ms.saturating_add(interval_ms));
      return None;
    };
    if now_ms < next_due {
      return None;
    }

    self.next_due_unix_ms = Some(now_ms.saturating_add(interval_ms));
    match orchestrator.start_check() {
      Ok(handle) => {
        tracing::info!(session = %handle.id(), "scheduled update check started");
        Some(handle)
      }
      Err(UpdateError::UpdateAlreadyInProgress) => {
        tracing::info!("scheduled update check skipped; a check is already running");
        None
      }
      Err(e) => {
        tracing::warn!(error = %e, "scheduled update check could not start");
        None
      }
    }
  }
}

/// `None` when automatic checks are off.
fn interval_ms(config: &Config) -> Option<u64> {
  if !config.auto_update() {
    return None;
  }
  match config.check_interval().minutes() {
    0 => None,
    m => Some(m.saturating_mul(60_000)),
  }
}

fn now_unix_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifact::{Artifact, ArtifactFetcher};
  use crate::config::CheckInterval;
  use crate::error::Result;
  use crate::feed::{FeedResponse, FeedTransport};
  use crate::lifecycle::LifecycleDispatcher;
  use crate::model::Entry;
  use crate::orchestrator::{Collaborators, Phase};
  use crate::signature::{DetachedSignatureProvider, SignatureValidator, TrustRoots};
  use reqwest::Url;
  use std::sync::Arc;

  struct Unavailable;

  impl FeedTransport for Unavailable {
    fn fetch(&self, _url: &Url) -> Result<FeedResponse> {
      Ok(FeedResponse { status: 503, body: Vec::new() })
    }
  }

  impl ArtifactFetcher for Unavailable {
    fn fetch_artifact(&self, _entry: &Entry) -> Result<Artifact> {
      Err(UpdateError::DependencyUnavailable("no artifacts in this test".into()))
    }
  }

  fn orchestrator(config: Config) -> UpdateOrchestrator {
    UpdateOrchestrator::new(
      config,
      Collaborators {
        transport: Arc::new(Unavailable),
        fetcher: Arc::new(Unavailable),
        validator: SignatureValidator::new(Arc::new(DetachedSignatureProvider::default())),
        roots: TrustRoots::default(),
      },
      LifecycleDispatcher::new().unwrap(),
    )
  }

  fn config() -> Config {
    Config::new("https://updates.example.com/releases.atom")
      .unwrap()
      .with_check_interval(CheckInterval::Minutes(5))
  }

  #[test]
  fn arms_then_fires_when_due() {
    let orch = orchestrator(config());
    let mut s = CheckScheduler::default();

    assert!(s.tick_at(&orch, 1_000).is_none());
    assert_eq!(s.next_due_unix_ms(), Some(1_000 + 300_000));
    assert!(s.tick_at(&orch, 300_999).is_none());

    let handle = s.tick_at(&orch, 301_000).expect("check should start");
    let session = handle.wait().unwrap();
    assert_eq!(session.phase, Phase::Failed);
    assert!(matches!(session.error.as_deref(), Some(UpdateError::HttpServer(503))));
    assert_eq!(s.next_due_unix_ms(), Some(601_000));
  }

  #[test]
  fn disabled_by_never_or_auto_update_off() {
    let orch = orchestrator(config().with_check_interval(CheckInterval::Never));
    let mut s = CheckScheduler::new(&orch.config());
    assert!(s.next_due_unix_ms().is_none());
    assert!(s.tick_at(&orch, u64::MAX).is_none());
    assert!(s.next_due_unix_ms().is_none());

    let orch = orchestrator(config().with_auto_update(false));
    let mut s = CheckScheduler { next_due_unix_ms: Some(0) };
    assert!(s.tick_at(&orch, 10).is_none());
    assert!(s.next_due_unix_ms().is_none());

    // Manual checks still run.
    assert_eq!(orch.check_now().unwrap().phase, Phase::Failed);
  }
}
