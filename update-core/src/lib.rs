pub mod agent;
pub mod artifact;
pub mod config;
pub mod console;
pub mod digest;
pub mod error;
pub mod feed;
pub mod file_store;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod paths;
pub mod signature;

pub use error::{ErrorKind, FileStoreError, Result, UpdateError};

use std::sync::mpsc;
use std::time::Duration;

pub fn run_console(args: &[String]) -> anyhow::Result<()> {
  let base = paths::base_dir()?;
  let config_path = paths::config_path(&base);
  let settings = config::load_or_create_default(&config_path)?;

  logging::init(&paths::logs_dir(&base), &settings.logging, logging::Output::FileAndStderr)?;

  match console::run_console_command(&settings, &base, args)? {
    console::ConsoleAction::ExitOk => return Ok(()),
    console::ConsoleAction::RunAgent => {}
  }

  tracing::info!(base = %base.display(), "starting update agent (console mode)");
  let (stop_tx, stop_rx) = mpsc::channel::<()>();

  let ctrlc_tx = stop_tx.clone();
  ctrlc::set_handler(move || {
    let _ = ctrlc_tx.send(());
  })?;

  let orchestrator = agent::build_orchestrator(&settings, &base)?;
  agent::UpdateAgent::new(orchestrator).run(stop_rx, Duration::from_millis(500))?;
  tracing::info!("update agent stopped");
  Ok(())
}
