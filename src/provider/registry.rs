//! Provider lookup and detection cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{info, info_span, Instrument};

use crate::config::ProviderOverride;
use crate::provider::base::{CliAdapter, DEFAULT_STOP_GRACE};
use crate::provider::claude::{self, ClaudeCodeProfile};
use crate::provider::codex::{self, CodexProfile};
use crate::provider::generic::GenericProfile;
use crate::provider::{DetectResult, SharedAdapter};
use crate::pty::PtyManager;
use crate::{AppError, BoxFuture, Result};

/// Source of per-session adapters, as seen by the runner.
pub trait AdapterFactory: Send + Sync {
    /// Build a new adapter for one session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an unknown provider id.
    fn create(&self, provider_id: &str) -> Result<SharedAdapter>;

    /// Detect every known provider and cache the results.
    fn detect_all(&self) -> BoxFuture<'_, BTreeMap<String, DetectResult>>;

    /// Installed provider ids from the last detection.
    fn installed(&self) -> Vec<String>;

    /// Version per installed provider.
    fn provider_versions(&self) -> BTreeMap<String, String>;
}

/// Builds a fresh adapter per session by provider id.
///
/// Built-in ids are `claude-code` (alias `claude`) and `codex`; any id with
/// a `binary` under `[providers.<id>]` is launched through the generic
/// profile.
pub struct ProviderRegistry {
    pty: Arc<dyn PtyManager>,
    overrides: HashMap<String, ProviderOverride>,
    stop_grace: Duration,
    detected: Mutex<BTreeMap<String, DetectResult>>,
}

impl ProviderRegistry {
    /// Create a registry spawning through `pty`.
    #[must_use]
    pub fn new(pty: Arc<dyn PtyManager>, overrides: HashMap<String, ProviderOverride>) -> Self {
        Self {
            pty,
            overrides,
            stop_grace: DEFAULT_STOP_GRACE,
            detected: Mutex::new(BTreeMap::new()),
        }
    }

    /// Override the adapters' terminate → kill grace window.
    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Canonical id for `provider_id`.
    #[must_use]
    pub fn resolve(provider_id: &str) -> &str {
        match provider_id {
            "claude" | "claude-code" => claude::PROVIDER_ID,
            other => other,
        }
    }

    /// Every provider id this registry can build.
    #[must_use]
    pub fn known_providers(&self) -> Vec<String> {
        let mut ids = vec![claude::PROVIDER_ID.to_owned(), codex::PROVIDER_ID.to_owned()];
        for (id, cfg) in &self.overrides {
            if cfg.binary.is_some() && !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids.sort();
        ids
    }

    /// Record a detection result obtained elsewhere.
    pub fn record_detection(&self, provider_id: &str, result: DetectResult) {
        self.lock()
            .insert(Self::resolve(provider_id).to_owned(), result);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, DetectResult>> {
        self.detected.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AdapterFactory for ProviderRegistry {
    fn create(&self, provider_id: &str) -> Result<SharedAdapter> {
        let id = Self::resolve(provider_id);
        let cfg = self.overrides.get(id).cloned().unwrap_or_default();
        let pty = Arc::clone(&self.pty);

        let adapter: SharedAdapter = match id {
            claude::PROVIDER_ID => Arc::new(
                CliAdapter::new(ClaudeCodeProfile::new(cfg.binary), pty)
                    .with_extra_args(cfg.extra_args)
                    .with_stop_grace(self.stop_grace),
            ),
            codex::PROVIDER_ID => Arc::new(
                CliAdapter::new(CodexProfile::new(cfg.binary), pty)
                    .with_extra_args(cfg.extra_args)
                    .with_stop_grace(self.stop_grace),
            ),
            other => {
                let binary = cfg.binary.ok_or_else(|| {
                    AppError::Validation(format!("unknown provider '{other}'"))
                })?;
                Arc::new(
                    CliAdapter::new(GenericProfile::new(other, binary), pty)
                        .with_extra_args(cfg.extra_args)
                        .with_stop_grace(self.stop_grace),
                )
            }
        };
        Ok(adapter)
    }

    fn detect_all(&self) -> BoxFuture<'_, BTreeMap<String, DetectResult>> {
        let span = info_span!("detect_providers");
        Box::pin(async move {
            for id in self.known_providers() {
                let Ok(adapter) = self.create(&id) else {
                    continue;
                };
                let result = adapter.detect().await;
                info!(
                    provider = %id,
                    installed = result.installed,
                    version = result.version.as_deref().unwrap_or("-"),
                    "provider detected"
                );
                self.lock().insert(id, result);
            }
            self.lock().clone()
        }
        .instrument(span))
    }

    fn installed(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, r)| r.installed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn provider_versions(&self) -> BTreeMap<String, String> {
        self.lock()
            .iter()
            .filter(|(_, r)| r.installed)
            .map(|(id, r)| {
                (
                    id.clone(),
                    r.version
                        .clone()
                        .unwrap_or_else(|| crate::provider::parse::UNKNOWN_VERSION.to_owned()),
                )
            })
            .collect()
    }
}
