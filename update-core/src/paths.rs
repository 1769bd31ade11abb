use std::path::{Path, PathBuf};

pub const HOME_ENV: &str = "UPDATE_AGENT_HOME";

/// `UPDATE_AGENT_HOME` when set, otherwise a per-platform data directory.
pub fn base_dir() -> anyhow::Result<PathBuf> {
  if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
    return Ok(PathBuf::from(home));
  }
  if cfg!(windows) {
    let program_data = std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".into());
    return Ok(PathBuf::from(program_data).join("Update Agent"));
  }
  if let Some(data) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
    return Ok(PathBuf::from(data).join("update-agent"));
  }
  let home = std::env::var_os("HOME")
    .ok_or_else(|| anyhow::anyhow!("neither {HOME_ENV} nor HOME is set"))?;
  Ok(PathBuf::from(home).join(".local").join("share").join("update-agent"))
}

pub fn config_path(base: &Path) -> PathBuf {
  base.join("config.toml")
}

pub fn logs_dir(base: &Path) -> PathBuf {
  base.join("logs")
}

pub fn downloads_dir(base: &Path, configured: Option<&Path>) -> PathBuf {
  resolve(base, configured, "downloads")
}

pub fn trust_roots_dir(base: &Path, configured: Option<&Path>) -> PathBuf {
  resolve(base, configured, "trust-roots")
}

fn resolve(base: &Path, configured: Option<&Path>, default: &str) -> PathBuf {
  match configured {
    Some(p) if p.is_absolute() => p.to_path_buf(),
    Some(p) => base.join(p),
    None => base.join(default),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn configured_dirs_resolve_against_base() {
    let base = Path::new("/srv/agent");
    assert_eq!(downloads_dir(base, None), base.join("downloads"));
    assert_eq!(trust_roots_dir(base, Some(Path::new("roots"))), base.join("roots"));
    let abs = std::env::temp_dir().join("roots");
    assert_eq!(trust_roots_dir(base, Some(&abs)), abs);
  }
}
