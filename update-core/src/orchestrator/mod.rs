//! Drives one update check from feed fetch to a verified artifact.
//!
//! Only one session may be in flight. Each session runs on its own thread and
//! walks `CheckingFeed -> ParsingFeed -> SelectingCandidate ->
//! VerifyingIntegrity -> VerifyingTrust -> Ready`, dropping to `Failed` on the
//! first error. Lifecycle events are queued on the dispatcher; this module is
//! the only place a failure becomes a `DidFailUpdate`.

use crate::artifact::{Artifact, ArtifactFetcher};
use crate::config::Config;
use crate::digest::{self, Digest};
use crate::error::{Result, UpdateError};
use crate::feed::{self, FeedTransport};
use crate::lifecycle::LifecycleDispatcher;
use crate::model::{Entry, ReleaseFeed};
use crate::signature::{SignatureStatus, SignatureValidator, TrustRoots};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use uuid::Uuid;

pub mod scheduler;

pub use scheduler::CheckScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Idle,
  CheckingFeed,
  ParsingFeed,
  SelectingCandidate,
  VerifyingIntegrity,
  VerifyingTrust,
  Ready,
  Failed,
}

impl Phase {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Ready | Self::Failed)
  }
}

/// Outcome of one check cycle.
#[derive(Debug, Clone)]
pub struct UpdateSession {
  pub id: Uuid,
  pub phase: Phase,
  pub candidate: Option<Entry>,
  pub artifact: Option<Artifact>,
  pub digest: Option<Digest>,
  pub signature: Option<SignatureStatus>,
  pub error: Option<Arc<UpdateError>>,
}

impl UpdateSession {
  fn new(id: Uuid) -> Self {
    Self {
      id,
      phase: Phase::Idle,
      candidate: None,
      artifact: None,
      digest: None,
      signature: None,
      error: None,
    }
  }
}

/// The pieces a check talks to.
#[derive(Clone)]
pub struct Collaborators {
  pub transport: Arc<dyn FeedTransport>,
  pub fetcher: Arc<dyn ArtifactFetcher>,
  pub validator: SignatureValidator,
  pub roots: TrustRoots,
}

struct SessionState {
  id: Uuid,
  phase: Mutex<Phase>,
  cancelled: AtomicBool,
}

impl SessionState {
  fn phase(&self) -> Phase {
    *lock(&self.phase)
  }

  fn set_phase(&self, phase: Phase) {
    *lock(&self.phase) = phase;
  }
}

struct Inner {
  config: RwLock<Config>,
  collaborators: Collaborators,
  dispatcher: LifecycleDispatcher,
  active: Mutex<Option<Arc<SessionState>>>,
}

pub struct CheckHandle {
  id: Uuid,
  join: JoinHandle<UpdateSession>,
}

impl CheckHandle {
  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn is_finished(&self) -> bool {
    self.join.is_finished()
  }

  pub fn wait(self) -> Result<UpdateSession> {
    self
      .join
      .join()
      .map_err(|_| UpdateError::InvalidState("update check thread panicked".to_string()))
  }
}

#[derive(Clone)]
pub struct UpdateOrchestrator {
  inner: Arc<Inner>,
}

impl UpdateOrchestrator {
  pub fn new(config: Config, collaborators: Collaborators, dispatcher: LifecycleDispatcher) -> Self {
    Self {
      inner: Arc::new(Inner {
        config: RwLock::new(config),
        collaborators,
        dispatcher,
        active: Mutex::new(None),
      }),
    }
  }

  /// Replaces the configuration. A session already in flight keeps the
  /// configuration it started with.
  pub fn configure(&self, config: Config) {
    let mut slot = match self.inner.config.write() {
      Ok(slot) => slot,
      Err(poisoned) => poisoned.into_inner(),
    };
    *slot = config;
  }

  pub fn config(&self) -> Config {
    match self.inner.config.read() {
      Ok(cfg) => cfg.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  pub fn dispatcher(&self) -> &LifecycleDispatcher {
    &self.inner.dispatcher
  }

  pub fn phase(&self) -> Phase {
    lock(&self.inner.active)
      .as_ref()
      .map_or(Phase::Idle, |s| s.phase())
  }

  pub fn is_busy(&self) -> bool {
    lock(&self.inner.active).is_some()
  }

  /// Starts a check in the background. Fails immediately with
  /// [`UpdateError::UpdateAlreadyInProgress`] while another check runs.
  pub fn start_check(&self) -> Result<CheckHandle> {
    let mut active = lock(&self.inner.active);
    if active.is_some() {
      return Err(UpdateError::UpdateAlreadyInProgress);
    }

    let state = Arc::new(SessionState {
      id: Uuid::new_v4(),
      phase: Mutex::new(Phase::Idle),
      cancelled: AtomicBool::new(false),
    });
    let id = state.id;

    *active = Some(state.clone());
    let inner = self.inner.clone();
    let spawned = thread::Builder::new()
      .name(format!("update-check-{id}"))
      .spawn(move || run_session(&inner, &state));
    match spawned {
      Ok(join) => {
        tracing::info!(session = %id, "update check started");
        Ok(CheckHandle { id, join })
      }
      Err(e) => {
        *active = None;
        Err(UpdateError::DependencyUnavailable(format!("spawn update check: {e}")))
      }
    }
  }

  pub fn check_now(&self) -> Result<UpdateSession> {
    self.start_check()?.wait()
  }

  /// Marks the in-flight session cancelled. Returns false when idle.
  pub fn cancel(&self) -> bool {
    match lock(&self.inner.active).as_ref() {
      Some(state) => {
        state.cancelled.store(true, Ordering::SeqCst);
        tracing::info!(session = %state.id, "update check cancellation requested");
        true
      }
      None => false,
    }
  }
}

/// Highest-priority channel with at least one entry wins; inside it the most
/// recently updated entry, earlier feed position on ties.
pub fn select_candidate<'a>(feed: &'a ReleaseFeed, config: &Config) -> Option<&'a Entry> {
  for channel in config.effective_channel_order() {
    let mut best: Option<&Entry> = None;
    for entry in feed.entries.iter().filter(|e| channel.matches(&e.category)) {
      if best.map_or(true, |b| entry.updated > b.updated) {
        best = Some(entry);
      }
    }
    if best.is_some() {
      return best;
    }
  }
  None
}

/// Clears the active slot even if the session thread unwinds.
struct ActiveGuard<'a> {
  inner: &'a Inner,
  id: Uuid,
}

impl Drop for ActiveGuard<'_> {
  fn drop(&mut self) {
    let mut active = lock(&self.inner.active);
    if active.as_ref().is_some_and(|s| s.id == self.id) {
      *active = None;
    }
  }
}

fn run_session(inner: &Inner, state: &SessionState) -> UpdateSession {
  let guard = ActiveGuard { inner, id: state.id };
  let config = match inner.config.read() {
    Ok(cfg) => cfg.clone(),
    Err(poisoned) => poisoned.into_inner().clone(),
  };

  let mut session = UpdateSession::new(state.id);
  let outcome = drive(inner, state, &config, &mut session);
  drop(guard);

  let dispatcher = &inner.dispatcher;
  match outcome {
    Ok(()) => {
      session.phase = Phase::Ready;
      tracing::info!(
        session = %session.id,
        candidate = session.candidate.as_ref().map(|e| e.id.as_str()).unwrap_or(""),
        "update ready"
      );
      if let Some(entry) = session.candidate.clone() {
        dispatcher.trigger_did_download(entry);
      }
      dispatcher.trigger_did_finish();
    }
    Err(e) => {
      state.set_phase(Phase::Failed);
      session.phase = Phase::Failed;
      tracing::warn!(session = %session.id, error = %e, kind = ?e.kind(), "update check failed");
      let err = Arc::new(e);
      session.error = Some(err.clone());
      dispatcher.trigger_did_fail(err);
    }
  }
  session
}

fn drive(inner: &Inner, state: &SessionState, config: &Config, session: &mut UpdateSession) -> Result<()> {
  let collab = &inner.collaborators;

  advance(state, session, Phase::CheckingFeed)?;
  inner.dispatcher.trigger_will_start();
  let response = collab.transport.fetch(config.feed_url())?;
  if !response.is_success() {
    return Err(UpdateError::from_status(response.status));
  }
  if response.body.is_empty() {
    return Err(UpdateError::EmptyBody);
  }

  advance(state, session, Phase::ParsingFeed)?;
  let feed = feed::parse_feed_bytes(&response.body)?;
  tracing::debug!(session = %session.id, entries = feed.entries.len(), "feed parsed");

  advance(state, session, Phase::SelectingCandidate)?;
  let candidate = select_candidate(&feed, config)
    .cloned()
    .ok_or(UpdateError::ReleaseNotFound)?;
  tracing::info!(session = %session.id, id = %candidate.id, category = %candidate.category, "candidate selected");
  session.candidate = Some(candidate.clone());

  advance(state, session, Phase::VerifyingIntegrity)?;
  let artifact = collab.fetcher.fetch_artifact(&candidate)?;
  session.artifact = Some(artifact.clone());
  let digest = digest::ensure_file_matches(&artifact.path, &artifact.expected_digest)?;
  session.digest = Some(digest);

  advance(state, session, Phase::VerifyingTrust)?;
  let status = collab.validator.check_chain(&artifact.path, &collab.roots)?;
  session.signature = Some(status);

  advance(state, session, Phase::Ready)
}

fn advance(state: &SessionState, session: &mut UpdateSession, next: Phase) -> Result<()> {
  if state.cancelled.load(Ordering::SeqCst) {
    return Err(UpdateError::UpdateCancelled);
  }
  tracing::debug!(session = %state.id, from = ?state.phase(), to = ?next, "phase transition");
  state.set_phase(next);
  session.phase = next;
  Ok(())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  match m.lock() {
    Ok(g) => g,
    Err(poisoned) => poisoned.into_inner(),
  }
}
