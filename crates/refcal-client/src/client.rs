use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use refcal_cache::{install_file, CacheLayout, MappingCache};
use refcal_core::Header;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::engine::{get_best_references, BestRefsRequest, RefOutcome};
use crate::error::ClientError;
use crate::remote::RemoteResolver;

/// Version reported to, and compared against, the resolution server.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const CLIENT_STATE_FILE: &str = "client_state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerSource {
    Local,
    Remote,
    /// Local resolution after the server could not be reached.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub source: AnswerSource,
    pub context: String,
    pub refs: BTreeMap<String, RefOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ClientState {
    last_known_good: Option<String>,
    server_version: Option<String>,
}

/// Resolves best references locally when it can and through a server when it must.
///
/// A server reporting a version other than [`CLIENT_VERSION`] disables the local
/// fast path until a later answer reports a matching version again.
pub struct HeavyClient {
    config: ClientConfig,
    layout: CacheLayout,
    cache: MappingCache,
    remote: Option<Box<dyn RemoteResolver>>,
    version_mismatch: Mutex<Option<String>>,
    fallbacks: AtomicUsize,
}

impl std::fmt::Debug for HeavyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeavyClient")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("remote", &self.remote.is_some())
            .field("version_mismatch", &*self.version_mismatch.lock())
            .field("fallbacks", &self.fallback_count())
            .finish_non_exhaustive()
    }
}

impl HeavyClient {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let layout = config.layout();
        let cache = MappingCache::open(&layout);
        let client = Self {
            config,
            layout,
            cache,
            remote: None,
            version_mismatch: Mutex::new(None),
            fallbacks: AtomicUsize::new(0),
        };
        client.restore_version_state();
        client
    }

    /// Carry a version mismatch recorded by an earlier process over to this one.
    fn restore_version_state(&self) {
        match self.read_state() {
            Ok(ClientState { server_version: Some(version), .. }) if version != CLIENT_VERSION => {
                warn!(
                    server_version = %version,
                    client_version = CLIENT_VERSION,
                    "last server contact reported a different version, local resolution disabled"
                );
                *self.version_mismatch.lock() = Some(version);
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "ignoring unreadable client state"),
        }
    }

    #[must_use]
    pub fn with_remote(mut self, remote: impl RemoteResolver + 'static) -> Self {
        self.remote = Some(Box::new(remote));
        self
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &MappingCache {
        &self.cache
    }

    /// Number of calls answered by local fallback after a network failure.
    #[must_use]
    pub fn fallback_count(&self) -> usize {
        self.fallbacks.load(Ordering::SeqCst)
    }

    /// True while the last server contact reported a different version.
    #[must_use]
    pub fn local_disabled(&self) -> bool {
        self.version_mismatch.lock().is_some()
    }

    /// Forget memoized mappings so files installed since are seen.
    pub fn refresh(&self) {
        self.cache.clear_cache();
    }

    fn state_path(&self) -> PathBuf {
        self.layout.config_dir().join(CLIENT_STATE_FILE)
    }

    fn read_state(&self) -> Result<ClientState, ClientError> {
        let path = self.state_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(ClientState::default()),
            Err(err) => return Err(ClientError::State { path, message: err.to_string() }),
        };
        serde_json::from_slice(&raw)
            .map_err(|err| ClientError::State { path, message: err.to_string() })
    }

    fn write_state(&self, state: &ClientState) -> Result<(), ClientError> {
        let path = self.state_path();
        let json = serde_json::to_vec_pretty(state)
            .map_err(|err| ClientError::State { path: path.clone(), message: err.to_string() })?;
        install_file(&path, &json)?;
        Ok(())
    }

    /// Context most recently reported by the server.
    ///
    /// # Errors
    /// Returns [`ClientError::State`] when the persisted state cannot be read.
    pub fn last_known_good(&self) -> Result<Option<String>, ClientError> {
        Ok(self.read_state()?.last_known_good)
    }

    /// The context a call resolves against: `explicit`, else the configured
    /// override, the environment, the last known good context, and finally the
    /// configured fallback.
    ///
    /// # Errors
    /// Returns [`ClientError::NoContext`] when none of those name one.
    pub fn operative_context(&self, explicit: Option<&str>) -> Result<String, ClientError> {
        let chosen = [
            explicit.map(str::to_string),
            self.config.context.clone(),
            self.config.env_context.clone(),
        ]
        .into_iter()
        .flatten()
        .find(|context| !context.trim().is_empty());
        if let Some(context) = chosen {
            return Ok(context.trim().to_string());
        }
        if let Some(context) = self.last_known_good()? {
            return Ok(context);
        }
        self.config.fallback_context.clone().ok_or(ClientError::NoContext)
    }

    /// Whether a sync recorded `context` as complete and it still loads locally
    /// with valid checksums and nothing missing.
    #[must_use]
    pub fn is_complete_locally(&self, context: &str) -> bool {
        match self.layout.read_complete_contexts() {
            Ok(recorded) if recorded.contains(context) => {}
            Ok(_) => {
                debug!(context, "context has not been synced completely");
                return false;
            }
            Err(err) => {
                debug!(context, error = %err, "sync record is unreadable");
                return false;
            }
        }
        match self.cache.missing_mappings(context) {
            Ok(missing) if missing.is_empty() => true,
            Ok(missing) => {
                debug!(context, missing = ?missing, "context has missing mappings");
                false
            }
            Err(err) => {
                debug!(context, error = %err, "context does not load locally");
                false
            }
        }
    }

    fn request_with_defaults(&self, request: &BestRefsRequest) -> BestRefsRequest {
        let mut request = request.clone();
        if request.instrument_keywords.is_empty() {
            request.instrument_keywords.clone_from(&self.config.instrument_keywords);
        }
        request
    }

    fn resolve_local(
        &self,
        source: AnswerSource,
        context: &str,
        header: &Header,
        request: &BestRefsRequest,
    ) -> Result<Resolution, ClientError> {
        let request = self.request_with_defaults(request);
        let best = get_best_references(&self.cache, context, header, &request)?;
        Ok(Resolution { source, context: best.context, refs: best.refs })
    }

    fn record_server_contact(
        &self,
        context: &str,
        server_version: &str,
    ) -> Result<(), ClientError> {
        {
            let mut mismatch = self.version_mismatch.lock();
            if server_version == CLIENT_VERSION {
                if mismatch.take().is_some() {
                    info!(
                        server_version,
                        "server version matches again, local resolution re-enabled"
                    );
                }
            } else if mismatch.as_deref() != Some(server_version) {
                warn!(
                    server_version,
                    client_version = CLIENT_VERSION,
                    "server and client versions differ, local resolution disabled"
                );
                *mismatch = Some(server_version.to_string());
            }
        }
        let state = ClientState {
            last_known_good: Some(context.to_string()),
            server_version: Some(server_version.to_string()),
        };
        self.write_state(&state)
    }

    /// Resolve `header` against the operative context.
    ///
    /// # Errors
    /// Returns the local resolution error when the local path answers, the
    /// network error when the server fails and fallback is off, and
    /// [`ClientError::Unresolvable`] when no permitted path applies.
    pub fn get_references(
        &self,
        context: Option<&str>,
        header: &Header,
        request: &BestRefsRequest,
    ) -> Result<Resolution, ClientError> {
        let context = self.operative_context(context)?;
        let mode = self.config.mode;

        if mode.allows_local() && !self.local_disabled() && self.is_complete_locally(&context) {
            return self.resolve_local(AnswerSource::Local, &context, header, request);
        }

        let remote = self.remote.as_deref().filter(|_| mode.allows_remote());
        let Some(remote) = remote else {
            let reason = if mode.allows_local() && self.local_disabled() {
                "local resolution is disabled by a server version mismatch \
                 and no server is available"
            } else if mode.allows_local() {
                "not complete in the local cache and no server is available"
            } else {
                "no server is available"
            };
            return Err(ClientError::Unresolvable { context, reason: reason.to_string() });
        };

        match remote.resolve(&context, header, request.reftypes.as_deref()) {
            Ok(answer) => {
                self.record_server_contact(&answer.context, &answer.server_version)?;
                Ok(Resolution {
                    source: AnswerSource::Remote,
                    context: answer.context,
                    refs: answer.refs,
                })
            }
            Err(err) if self.config.allow_fallback => {
                let count = self.fallbacks.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    context = %context,
                    error = %err,
                    fallbacks = count,
                    "server unreachable, resolving locally"
                );
                self.resolve_local(AnswerSource::Fallback, &context, header, request)
            }
            Err(err) => Err(err.into()),
        }
    }
}
