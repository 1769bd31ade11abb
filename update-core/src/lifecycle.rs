//! Observer registry for update phase transitions.
//!
//! Registration and firing are queued to one dispatch thread, so callers never
//! block on handlers and every handler runs on the same thread in the order
//! jobs were submitted. Handlers cannot be removed. A panicking handler is
//! logged and otherwise ignored.

use crate::error::{Result, UpdateError};
use crate::model::Entry;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  WillStart,
  DidFinish,
  DidFail,
  DidDownload,
}

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
  WillStartUpdate,
  DidFinishUpdate,
  DidFailUpdate(Arc<UpdateError>),
  DidDownloadRelease(Entry),
}

impl LifecycleEvent {
  pub fn kind(&self) -> EventKind {
    match self {
      Self::WillStartUpdate => EventKind::WillStart,
      Self::DidFinishUpdate => EventKind::DidFinish,
      Self::DidFailUpdate(_) => EventKind::DidFail,
      Self::DidDownloadRelease(_) => EventKind::DidDownload,
    }
  }
}

pub type Handler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
  will_start: Vec<Handler>,
  did_finish: Vec<Handler>,
  did_fail: Vec<Handler>,
  did_download: Vec<Handler>,
}

impl Registry {
  fn list(&self, kind: EventKind) -> &Vec<Handler> {
    match kind {
      EventKind::WillStart => &self.will_start,
      EventKind::DidFinish => &self.did_finish,
      EventKind::DidFail => &self.did_fail,
      EventKind::DidDownload => &self.did_download,
    }
  }

  fn list_mut(&mut self, kind: EventKind) -> &mut Vec<Handler> {
    match kind {
      EventKind::WillStart => &mut self.will_start,
      EventKind::DidFinish => &mut self.did_finish,
      EventKind::DidFail => &mut self.did_fail,
      EventKind::DidDownload => &mut self.did_download,
    }
  }
}

enum Job {
  Register(EventKind, Handler),
  Fire(LifecycleEvent),
  Flush(mpsc::Sender<()>),
}

/// Cheap to clone; all clones share one registry and one dispatch thread.
/// The thread exits once the last clone is dropped.
#[derive(Clone)]
pub struct LifecycleDispatcher {
  tx: Arc<Mutex<mpsc::Sender<Job>>>,
  registry: Arc<RwLock<Registry>>,
  worker: thread::ThreadId,
}

impl LifecycleDispatcher {
  pub fn new() -> Result<Self> {
    let (tx, rx) = mpsc::channel::<Job>();
    let registry = Arc::new(RwLock::new(Registry::default()));
    let worker_registry = registry.clone();

    let worker = thread::Builder::new()
      .name("lifecycle-dispatch".to_string())
      .spawn(move || dispatch_loop(rx, worker_registry))
      .map_err(|e| UpdateError::DependencyUnavailable(format!("spawn dispatch thread: {e}")))?;

    Ok(Self {
      tx: Arc::new(Mutex::new(tx)),
      registry,
      worker: worker.thread().id(),
    })
  }

  pub fn on(&self, kind: EventKind, handler: impl Fn(&LifecycleEvent) + Send + Sync + 'static) {
    self.submit(Job::Register(kind, Arc::new(handler)));
  }

  pub fn on_will_start(&self, handler: impl Fn() + Send + Sync + 'static) {
    self.on(EventKind::WillStart, move |_| handler());
  }

  pub fn on_did_finish(&self, handler: impl Fn() + Send + Sync + 'static) {
    self.on(EventKind::DidFinish, move |_| handler());
  }

  pub fn on_did_fail(&self, handler: impl Fn(&UpdateError) + Send + Sync + 'static) {
    self.on(EventKind::DidFail, move |event| {
      if let LifecycleEvent::DidFailUpdate(err) = event {
        handler(err);
      }
    });
  }

  pub fn on_did_download(&self, handler: impl Fn(&Entry) + Send + Sync + 'static) {
    self.on(EventKind::DidDownload, move |event| {
      if let LifecycleEvent::DidDownloadRelease(entry) = event {
        handler(entry);
      }
    });
  }

  pub fn trigger(&self, event: LifecycleEvent) {
    self.submit(Job::Fire(event));
  }

  pub fn trigger_will_start(&self) {
    self.trigger(LifecycleEvent::WillStartUpdate);
  }

  pub fn trigger_did_finish(&self) {
    self.trigger(LifecycleEvent::DidFinishUpdate);
  }

  pub fn trigger_did_fail(&self, error: Arc<UpdateError>) {
    self.trigger(LifecycleEvent::DidFailUpdate(error));
  }

  pub fn trigger_did_download(&self, entry: Entry) {
    self.trigger(LifecycleEvent::DidDownloadRelease(entry));
  }

  /// Blocks until every job submitted before this call has been handled.
  /// Returns at once when called from a handler, since the queue cannot
  /// drain while that handler runs.
  pub fn flush(&self) {
    if thread::current().id() == self.worker {
      tracing::debug!("flush called on the dispatch thread; skipped");
      return;
    }
    let (done_tx, done_rx) = mpsc::channel();
    self.submit(Job::Flush(done_tx));
    let _ = done_rx.recv();
  }

  pub fn handler_count(&self, kind: EventKind) -> usize {
    match self.registry.read() {
      Ok(reg) => reg.list(kind).len(),
      Err(poisoned) => poisoned.into_inner().list(kind).len(),
    }
  }

  fn submit(&self, job: Job) {
    let tx = match self.tx.lock() {
      Ok(tx) => tx,
      Err(poisoned) => poisoned.into_inner(),
    };
    if tx.send(job).is_err() {
      tracing::warn!("lifecycle dispatch thread is gone; job dropped");
    }
  }
}

fn dispatch_loop(rx: mpsc::Receiver<Job>, registry: Arc<RwLock<Registry>>) {
  while let Ok(job) = rx.recv() {
    match job {
      Job::Register(kind, handler) => {
        let mut reg = match registry.write() {
          Ok(reg) => reg,
          Err(poisoned) => poisoned.into_inner(),
        };
        reg.list_mut(kind).push(handler);
      }
      Job::Fire(event) => {
        // Snapshot so handlers may register more handlers without deadlocking.
        let handlers: Vec<Handler> = match registry.read() {
          Ok(reg) => reg.list(event.kind()).clone(),
          Err(poisoned) => poisoned.into_inner().list(event.kind()).clone(),
        };
        for handler in handlers {
          if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
            tracing::warn!(kind = ?event.kind(), "lifecycle handler panicked");
          }
        }
      }
      Job::Flush(done) => {
        let _ = done.send(());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn handlers_run_in_registration_order() {
    let d = LifecycleDispatcher::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..3 {
      let seen = seen.clone();
      d.on_will_start(move || seen.lock().unwrap().push(i));
    }
    d.trigger_will_start();
    d.flush();
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(d.handler_count(EventKind::WillStart), 3);
    assert_eq!(d.handler_count(EventKind::DidFail), 0);
  }

  #[test]
  fn events_only_reach_their_kind() {
    let d = LifecycleDispatcher::new().unwrap();
    let fails = Arc::new(Mutex::new(Vec::new()));
    let finishes = Arc::new(AtomicUsize::new(0));
    {
      let fails = fails.clone();
      d.on_did_fail(move |e| fails.lock().unwrap().push(e.to_string()));
    }
    {
      let finishes = finishes.clone();
      d.on_did_finish(move || {
        finishes.fetch_add(1, Ordering::SeqCst);
      });
    }
    d.trigger_did_fail(Arc::new(UpdateError::ReleaseNotFound));
    d.flush();
    assert_eq!(fails.lock().unwrap().len(), 1);
    assert_eq!(finishes.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn panicking_handler_does_not_stop_others() {
    let d = LifecycleDispatcher::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    d.on_did_finish(|| panic!("handler failure"));
    {
      let ran = ran.clone();
      d.on_did_finish(move || {
        ran.fetch_add(1, Ordering::SeqCst);
      });
    }
    d.trigger_did_finish();
    d.trigger_did_finish();
    d.flush();
    assert_eq!(ran.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn handler_may_register_another_handler() {
    let d = LifecycleDispatcher::new().unwrap();
    let inner = d.clone();
    d.on_will_start(move || inner.on_did_finish(|| {}));
    d.trigger_will_start();
    d.flush();
    d.flush();
    assert_eq!(d.handler_count(EventKind::DidFinish), 1);
  }

  #[test]
  fn flush_inside_a_handler_returns() {
    let d = LifecycleDispatcher::new().unwrap();
    let inner = d.clone();
    let ran = Arc::new(AtomicUsize::new(0));
    {
      let ran = ran.clone();
      d.on_did_finish(move || {
        inner.flush();
        ran.fetch_add(1, Ordering::SeqCst);
      });
    }
    d.trigger_did_finish();
    d.flush();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn concurrent_registration_is_never_lost() {
    let d = LifecycleDispatcher::new().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let threads: Vec<_> = (0..8)
      .map(|_| {
        let d = d.clone();
        let hits = hits.clone();
        thread::spawn(move || {
          for _ in 0..25 {
            let hits = hits.clone();
            d.on_will_start(move || {
              hits.fetch_add(1, Ordering::SeqCst);
            });
            d.trigger_did_finish();
          }
        })
      })
      .collect();
    for t in threads {
      t.join().unwrap();
    }
    d.flush();
    assert_eq!(d.handler_count(EventKind::WillStart), 200);

    d.trigger_will_start();
    d.flush();
    assert_eq!(hits.load(Ordering::SeqCst), 200);
  }
}
