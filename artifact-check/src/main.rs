use anyhow::Context;

fn main() -> anyhow::Result<()> {
  let args: Vec<String> = std::env::args().collect();

  if args.iter().any(|a| a == "--version") {
    println!("{}", env!("CARGO_PKG_VERSION"));
    return Ok(());
  }

  update_core::logging::init_stderr("warn");

  let mode = artifact_check::CheckMode::from_args(&args)?;
  let cfg = artifact_check::parse_check_config(&args);
  let summary = artifact_check::run(&mode, &cfg).context("artifact check run")?;
  artifact_check::print_summary(&summary, cfg.json)?;

  if summary.failures > 0 {
    std::process::exit(1);
  }
  Ok(())
}
