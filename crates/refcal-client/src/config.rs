use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use refcal_cache::CacheLayout;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

pub const PATH_ENV: &str = "REFCAL_PATH";
pub const CONTEXT_ENV: &str = "REFCAL_CONTEXT";
pub const SERVER_URL_ENV: &str = "REFCAL_SERVER_URL";
pub const MODE_ENV: &str = "REFCAL_MODE";
pub const ALLOW_FALLBACK_ENV: &str = "REFCAL_ALLOW_FALLBACK";

const DEFAULT_CACHE_ROOT: &str = "./refcal_cache";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Which resolution paths a client may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    /// Only the local cache.
    Local,
    /// Only the server.
    Remote,
    /// Local when the context is complete, otherwise the server.
    #[default]
    Auto,
}

impl ResolutionMode {
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    #[must_use]
    pub fn allows_local(self) -> bool {
        !matches!(self, Self::Remote)
    }

    #[must_use]
    pub fn allows_remote(self) -> bool {
        !matches!(self, Self::Local)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub cache_root: PathBuf,
    /// Configured context override.
    pub context: Option<String>,
    /// Context of last resort when nothing else names one.
    pub fallback_context: Option<String>,
    pub server_url: Option<String>,
    pub mode: ResolutionMode,
    /// Resolve locally when the server cannot be reached.
    pub allow_fallback: bool,
    /// Empty means the engine defaults.
    pub instrument_keywords: Vec<String>,
    pub timeout_ms: u64,
    #[serde(skip)]
    pub env_context: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from(DEFAULT_CACHE_ROOT),
            context: None,
            fallback_context: None,
            server_url: None,
            mode: ResolutionMode::Auto,
            allow_fallback: true,
            instrument_keywords: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            env_context: None,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl ClientConfig {
    /// Settings from an optional YAML file, then the `REFCAL_*` environment.
    ///
    /// # Errors
    /// Returns [`ClientError::Config`] when the file cannot be read or parsed, or an
    /// environment value is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ClientError> {
        let config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())
    }

    /// # Errors
    /// Returns [`ClientError::Config`] when the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ClientError> {
        let config_error =
            |message: String| ClientError::Config { origin: path.display().to_string(), message };
        let raw = fs::read_to_string(path).map_err(|err| config_error(err.to_string()))?;
        serde_yaml::from_str(&raw).map_err(|err| config_error(err.to_string()))
    }

    /// Overlay environment settings looked up through `lookup`.
    ///
    /// The environment context is kept apart from [`ClientConfig::context`] so a
    /// configured override still takes precedence over it.
    ///
    /// # Errors
    /// Returns [`ClientError::Config`] for an unrecognized `REFCAL_MODE`.
    pub fn apply_env(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ClientError> {
        if let Some(root) = lookup(PATH_ENV).and_then(non_empty) {
            self.cache_root = PathBuf::from(root);
        }
        if let Some(context) = lookup(CONTEXT_ENV).and_then(non_empty) {
            self.env_context = Some(context);
        }
        if let Some(url) = lookup(SERVER_URL_ENV).and_then(non_empty) {
            self.server_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Some(mode) = lookup(MODE_ENV).and_then(non_empty) {
            self.mode = ResolutionMode::parse(&mode).ok_or_else(|| ClientError::Config {
                origin: MODE_ENV.to_string(),
                message: format!("expected local, remote or auto, got '{mode}'"),
            })?;
        }
        if let Some(value) = lookup(ALLOW_FALLBACK_ENV) {
            self.allow_fallback = parse_bool(&value);
        }
        Ok(self)
    }

    #[must_use]
    pub fn layout(&self) -> CacheLayout {
        CacheLayout::new(&self.cache_root)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<HashMap<_, _>>();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn environment_overrides_defaults() -> Result<(), ClientError> {
        let config = ClientConfig::default().apply_env(env(&[
            (PATH_ENV, "/data/refcal"),
            (CONTEXT_ENV, "hst_0002.pmap"),
            (SERVER_URL_ENV, "https://refcal.example.org/"),
            (MODE_ENV, "Local"),
            (ALLOW_FALLBACK_ENV, "off"),
        ]))?;
        assert_eq!(config.cache_root, PathBuf::from("/data/refcal"));
        assert_eq!(config.env_context.as_deref(), Some("hst_0002.pmap"));
        assert_eq!(config.context, None);
        assert_eq!(config.server_url.as_deref(), Some("https://refcal.example.org"));
        assert_eq!(config.mode, ResolutionMode::Local);
        assert!(!config.allow_fallback);
        Ok(())
    }

    #[test]
    fn rejects_unknown_mode() {
        let result = ClientConfig::default().apply_env(env(&[(MODE_ENV, "sometimes")]));
        assert!(matches!(result, Err(ClientError::Config { .. })), "{result:?}");
    }

    #[test]
    fn reads_yaml_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("refcal.yaml");
        fs::write(
            &path,
            "cache_root: /srv/refcal\ncontext: hst_0001.pmap\nmode: remote\n\
             instrument_keywords: [INSTRUME]\n",
        )?;
        let config = ClientConfig::from_yaml_file(&path)?;
        assert_eq!(config.cache_root, PathBuf::from("/srv/refcal"));
        assert_eq!(config.context.as_deref(), Some("hst_0001.pmap"));
        assert_eq!(config.mode, ResolutionMode::Remote);
        assert!(config.allow_fallback);
        assert_eq!(config.timeout(), Duration::from_secs(30));

        fs::write(&path, "cache_rot: /srv/refcal\n")?;
        assert!(matches!(ClientConfig::from_yaml_file(&path), Err(ClientError::Config { .. })));
        Ok(())
    }

    #[test]
    fn mode_flags() {
        assert!(ResolutionMode::Auto.allows_local() && ResolutionMode::Auto.allows_remote());
        assert!(!ResolutionMode::Local.allows_remote());
        assert!(!ResolutionMode::Remote.allows_local());
    }
}
