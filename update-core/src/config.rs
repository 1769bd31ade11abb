use crate::digest::DigestAlgorithm;
use crate::error::{Result, UpdateError};
use anyhow::Context;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_FEED_URL: &str = "https://updates.example.com/releases.atom";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
  Stable,
  Beta,
  Alpha,
  Custom(String),
}

impl Channel {
  pub fn as_str(&self) -> &str {
    match self {
      Self::Stable => "stable",
      Self::Beta => "beta",
      Self::Alpha => "alpha",
      Self::Custom(name) => name,
    }
  }

  pub fn matches(&self, category: &str) -> bool {
    self.as_str().eq_ignore_ascii_case(category.trim())
  }
}

impl FromStr for Channel {
  type Err = UpdateError;

  fn from_str(s: &str) -> Result<Self> {
    let name = s.trim();
    if name.is_empty() {
      return Err(UpdateError::InvalidConfiguration(
        "channel name must not be empty".to_string(),
      ));
    }
    Ok(match name.to_ascii_lowercase().as_str() {
      "stable" => Self::Stable,
      "beta" => Self::Beta,
      "alpha" => Self::Alpha,
      other => Self::Custom(other.to_string()),
    })
  }
}

impl fmt::Display for Channel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInterval {
  Never,
  Daily,
  Weekly,
  Monthly,
  Minutes(u64),
}

impl CheckInterval {
  pub fn minutes(self) -> u64 {
    match self {
      Self::Never => 0,
      Self::Daily => 24 * 60,
      Self::Weekly => 7 * 24 * 60,
      Self::Monthly => 30 * 24 * 60,
      Self::Minutes(m) => m,
    }
  }
}

impl From<u64> for CheckInterval {
  fn from(minutes: u64) -> Self {
    match minutes {
      0 => Self::Never,
      1440 => Self::Daily,
      10080 => Self::Weekly,
      43200 => Self::Monthly,
      m => Self::Minutes(m),
    }
  }
}

/// Update configuration. Frozen once built; `with_*` return modified copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  feed_url: Url,
  check_interval: CheckInterval,
  channels: Vec<Channel>,
  auto_update: bool,
  delta_updates: bool,
  channel_priority: Vec<Channel>,
}

impl Config {
  /// Fails with [`UpdateError::InvalidConfiguration`] unless the feed URL is
  /// an absolute `https` URL.
  pub fn new(feed_url: &str) -> Result<Self> {
    Ok(Self {
      feed_url: secure_feed_url(feed_url)?,
      check_interval: CheckInterval::Daily,
      channels: vec![Channel::Stable],
      auto_update: true,
      delta_updates: true,
      channel_priority: vec![Channel::Stable],
    })
  }

  pub fn feed_url(&self) -> &Url {
    &self.feed_url
  }

  pub fn check_interval(&self) -> CheckInterval {
    self.check_interval
  }

  pub fn channels(&self) -> &[Channel] {
    &self.channels
  }

  pub fn auto_update(&self) -> bool {
    self.auto_update
  }

  pub fn delta_updates(&self) -> bool {
    self.delta_updates
  }

  pub fn channel_priority(&self) -> &[Channel] {
    &self.channel_priority
  }

  pub fn with_feed_url(&self, feed_url: &str) -> Result<Self> {
    Ok(Self {
      feed_url: secure_feed_url(feed_url)?,
      ..self.clone()
    })
  }

  pub fn with_check_interval(&self, check_interval: CheckInterval) -> Self {
    Self {
      check_interval,
      ..self.clone()
    }
  }

  pub fn with_channels(&self, channels: impl IntoIterator<Item = Channel>) -> Self {
    Self {
      channels: dedup(channels),
      ..self.clone()
    }
  }

  pub fn with_auto_update(&self, auto_update: bool) -> Self {
    Self {
      auto_update,
      ..self.clone()
    }
  }

  pub fn with_delta_updates(&self, delta_updates: bool) -> Self {
    Self {
      delta_updates,
      ..self.clone()
    }
  }

  pub fn with_channel_priority(&self, priority: impl IntoIterator<Item = Channel>) -> Self {
    Self {
      channel_priority: dedup(priority),
      ..self.clone()
    }
  }

  /// Channels to try, most preferred first: the priority list restricted to
  /// subscribed channels, then any subscribed channel the list leaves out.
  /// With no subscriptions the priority list is used as-is.
  pub fn effective_channel_order(&self) -> Vec<Channel> {
    if self.channels.is_empty() {
      return self.channel_priority.clone();
    }
    let mut out: Vec<Channel> = self
      .channel_priority
      .iter()
      .filter(|c| self.channels.contains(c))
      .cloned()
      .collect();
    for c in &self.channels {
      if !out.contains(c) {
        out.push(c.clone());
      }
    }
    out
  }
}

fn secure_feed_url(raw: &str) -> Result<Url> {
  let url = Url::parse(raw.trim())
    .map_err(|e| UpdateError::InvalidConfiguration(format!("invalid feed URL {raw}: {e}")))?;
  if url.scheme() != "https" {
    return Err(UpdateError::InvalidConfiguration(format!(
      "feed URL must use HTTPS: {raw}"
    )));
  }
  if url.host_str().is_none() {
    return Err(UpdateError::InvalidConfiguration(format!(
      "feed URL has no host: {raw}"
    )));
  }
  Ok(url)
}

fn dedup(items: impl IntoIterator<Item = Channel>) -> Vec<Channel> {
  let mut out = Vec::new();
  for c in items {
    if !out.contains(&c) {
      out.push(c);
    }
  }
  out
}

/// Everything read from `config.toml`.
#[derive(Debug, Clone)]
pub struct Settings {
  pub update: Config,
  pub logging: LoggingConfig,
  pub trust: TrustConfig,
  pub transport: TransportConfig,
  pub artifacts: ArtifactConfig,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      update: UpdateSection::default()
        .to_config()
        .expect("default update section is valid"),
      logging: LoggingConfig::default(),
      trust: TrustConfig::default(),
      transport: TransportConfig::default(),
      artifacts: ArtifactConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
  #[serde(default = "default_log_level")]
  pub level: String,

  #[serde(default = "default_retention_days")]
  pub retention_days: u64,
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_retention_days() -> u64 {
  14
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      retention_days: default_retention_days(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
  /// Directory of root certificates. Relative paths resolve against the base dir.
  #[serde(default)]
  pub roots_dir: Option<PathBuf>,

  #[serde(default = "default_signature_suffix")]
  pub signature_suffix: String,
}

fn default_signature_suffix() -> String {
  "sig".to_string()
}

impl Default for TrustConfig {
  fn default() -> Self {
    Self {
      roots_dir: None,
      signature_suffix: default_signature_suffix(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
  #[serde(default = "default_timeout_seconds")]
  pub timeout_seconds: u64,

  #[serde(default = "default_max_feed_bytes")]
  pub max_feed_bytes: usize,
}

fn default_timeout_seconds() -> u64 {
  30
}

fn default_max_feed_bytes() -> usize {
  4 * 1024 * 1024
}

impl Default for TransportConfig {
  fn default() -> Self {
    Self {
      timeout_seconds: default_timeout_seconds(),
      max_feed_bytes: default_max_feed_bytes(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
  #[serde(default = "default_digest_algorithm")]
  pub digest_algorithm: DigestAlgorithm,

  #[serde(default)]
  pub download_dir: Option<PathBuf>,

  #[serde(default = "default_max_artifact_bytes")]
  pub max_artifact_bytes: usize,
}

fn default_digest_algorithm() -> DigestAlgorithm {
  DigestAlgorithm::Sha256
}

fn default_max_artifact_bytes() -> usize {
  1024 * 1024 * 1024
}

impl Default for ArtifactConfig {
  fn default() -> Self {
    Self {
      digest_algorithm: default_digest_algorithm(),
      download_dir: None,
      max_artifact_bytes: default_max_artifact_bytes(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UpdateSection {
  #[serde(default = "default_feed_url")]
  feed_url: String,

  #[serde(default = "default_check_interval_minutes")]
  check_interval_minutes: u64,

  #[serde(default = "default_channels")]
  channels: Vec<String>,

  #[serde(default = "default_true")]
  auto_update: bool,

  #[serde(default = "default_true")]
  delta_updates: bool,

  #[serde(default = "default_channels")]
  channel_priority: Vec<String>,
}

fn default_feed_url() -> String {
  DEFAULT_FEED_URL.to_string()
}

fn default_check_interval_minutes() -> u64 {
  CheckInterval::Daily.minutes()
}

fn default_channels() -> Vec<String> {
  vec![Channel::Stable.to_string()]
}

fn default_true() -> bool {
  true
}

impl Default for UpdateSection {
  fn default() -> Self {
    Self {
      feed_url: default_feed_url(),
      check_interval_minutes: default_check_interval_minutes(),
      channels: default_channels(),
      auto_update: true,
      delta_updates: true,
      channel_priority: default_channels(),
    }
  }
}

impl UpdateSection {
  fn to_config(&self) -> Result<Config> {
    let channels = parse_channels(&self.channels)?;
    let priority = parse_channels(&self.channel_priority)?;
    Ok(
      Config::new(&self.feed_url)?
        .with_check_interval(CheckInterval::from(self.check_interval_minutes))
        .with_channels(channels)
        .with_auto_update(self.auto_update)
        .with_delta_updates(self.delta_updates)
        .with_channel_priority(priority),
    )
  }

  fn from_config(cfg: &Config) -> Self {
    Self {
      feed_url: cfg.feed_url().to_string(),
      check_interval_minutes: cfg.check_interval().minutes(),
      channels: cfg.channels().iter().map(|c| c.to_string()).collect(),
      auto_update: cfg.auto_update(),
      delta_updates: cfg.delta_updates(),
      channel_priority: cfg.channel_priority().iter().map(|c| c.to_string()).collect(),
    }
  }
}

fn parse_channels(raw: &[String]) -> Result<Vec<Channel>> {
  raw.iter().map(|s| s.parse()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SettingsFile {
  #[serde(default)]
  update: Option<UpdateSection>,

  #[serde(default)]
  logging: Option<LoggingConfig>,

  #[serde(default)]
  trust: Option<TrustConfig>,

  #[serde(default)]
  transport: Option<TransportConfig>,

  #[serde(default)]
  artifacts: Option<ArtifactConfig>,
}

impl SettingsFile {
  fn normalize(self) -> anyhow::Result<Settings> {
    let update = self.update.unwrap_or_default();
    let cfg = update.to_config().context("invalid [update] section")?;

    if cfg.auto_update() && cfg.check_interval() == CheckInterval::Never {
      tracing::warn!("auto_update is enabled but check interval is `never`; no scheduled checks will run");
    }

    Ok(Settings {
      update: cfg,
      logging: self.logging.unwrap_or_default(),
      trust: self.trust.unwrap_or_default(),
      transport: self.transport.unwrap_or_default(),
      artifacts: self.artifacts.unwrap_or_default(),
    })
  }

  fn needs_upgrade(&self) -> bool {
    self.update.is_none()
      || self.logging.is_none()
      || self.trust.is_none()
      || self.transport.is_none()
      || self.artifacts.is_none()
  }
}

pub fn load_or_create_default(path: &Path) -> anyhow::Result<Settings> {
  load_impl(path, true)
}

pub fn load_or_default_readonly(path: &Path) -> anyhow::Result<Settings> {
  load_impl(path, false)
}

fn load_impl(path: &Path, allow_writes: bool) -> anyhow::Result<Settings> {
  let parent = path
    .parent()
    .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", path.display()))?;
  if allow_writes {
    fs::create_dir_all(parent)?;
  }

  if !path.exists() {
    let settings = Settings::default();
    if allow_writes {
      write_atomic(path, &toml::to_string_pretty(&to_settings_file(&settings))?)?;
    } else {
      eprintln!(
        "update-agent: config missing at {}; using defaults (read-only).",
        path.display()
      );
    }
    return Ok(settings);
  }

  let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
  match toml::from_str::<SettingsFile>(&raw) {
    Ok(file) => {
      let needs_upgrade = file.needs_upgrade();
      let settings = file
        .normalize()
        .with_context(|| format!("load {}", path.display()))?;
      if allow_writes && needs_upgrade {
        let backup = parent.join(format!("config.toml.bak-{}", now_unix_s()));
        let _ = fs::copy(path, &backup);
        let _ = write_atomic(path, &toml::to_string_pretty(&to_settings_file(&settings))?);
        eprintln!(
          "update-agent: upgraded config defaults written to {} (backup: {})",
          path.display(),
          backup.display()
        );
      }
      Ok(settings)
    }
    Err(e) => {
      let settings = Settings::default();
      if allow_writes {
        let backup = parent.join(format!("config.toml.bad-{}", now_unix_s()));
        let _ = fs::rename(path, &backup);
        write_atomic(path, &toml::to_string_pretty(&to_settings_file(&settings))?)?;
        eprintln!(
          "update-agent: invalid config at {} (backed up to {}): {e}",
          path.display(),
          backup.display()
        );
      } else {
        eprintln!(
          "update-agent: invalid config at {}; using defaults (read-only): {e}",
          path.display()
        );
      }
      Ok(settings)
    }
  }
}

fn to_settings_file(settings: &Settings) -> SettingsFile {
  SettingsFile {
    update: Some(UpdateSection::from_config(&settings.update)),
    logging: Some(settings.logging.clone()),
    trust: Some(settings.trust.clone()),
    transport: Some(settings.transport.clone()),
    artifacts: Some(settings.artifacts.clone()),
  }
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
  let parent = path
    .parent()
    .ok_or_else(|| anyhow::anyhow!("file path has no parent: {}", path.display()))?;
  let tmp = parent.join(format!(
    ".{}.tmp",
    path.file_name().unwrap_or_default().to_string_lossy()
  ));

  fs::write(&tmp, contents)?;
  fs::rename(&tmp, path)?;
  Ok(())
}

fn now_unix_s() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}
