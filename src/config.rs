use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, bail};
use serde::Deserialize;
use std::str::FromStr;

use crate::mode::RecordingMode;

pub const CONFIG_FILE_NAME: &str = "test-proxy.toml";
pub const DEFAULT_PROXY_URL: &str = "http://localhost:5000";

pub const PROXY_URL_ENV: &str = "TEST_PROXY_URL";
pub const RUN_LIVE_ENV: &str = "TEST_RUN_LIVE";
pub const SKIP_LIVE_RECORDING_ENV: &str = "TEST_SKIP_LIVE_RECORDING";
pub const REVISION_ENV: &str = "TEST_PROXY_REVISION";
pub const LOG_LEVEL_ENV: &str = "TEST_PROXY_LOG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub mode: ModeConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Loads the nearest `test-proxy.toml` walking up from the current
    /// directory (defaults when there is none), then applies environment
    /// overrides.
    pub fn discover() -> anyhow::Result<Self> {
        let cwd = env::current_dir().context("resolve current directory")?;
        let mut config = match find_config_file(&cwd) {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| env::var(name).ok())?;
        Ok(config)
    }

    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(url) = lookup(PROXY_URL_ENV) {
            self.proxy.url = url;
        }
        if let Some(revision) = lookup(REVISION_ENV) {
            self.proxy.revision = Some(revision);
        }
        if let Some(live) = lookup(RUN_LIVE_ENV) {
            self.mode.live = parse_flag(RUN_LIVE_ENV, &live)?;
        }
        if let Some(skip) = lookup(SKIP_LIVE_RECORDING_ENV) {
            self.mode.skip_recording = parse_flag(SKIP_LIVE_RECORDING_ENV, &skip)?;
        }
        if let Some(level) = lookup(LOG_LEVEL_ENV) {
            self.logging.get_or_insert_with(LoggingConfig::default).level = Some(level);
        }
        Ok(())
    }

    pub fn recording_mode(&self) -> RecordingMode {
        RecordingMode::from_flags(self.mode.live, self.mode.skip_recording)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_url")]
    pub url: String,
    /// Pins the revision sent with each session start instead of asking git.
    pub revision: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            url: default_proxy_url(),
            revision: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeConfig {
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub skip_recording: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn default_proxy_url() -> String {
    DEFAULT_PROXY_URL.to_owned()
}

fn find_config_file(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

fn parse_flag(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" | "" => Ok(false),
        _ => bail!("invalid value `{raw}` for `{name}`; expected true or false"),
    }
}
