//! Configuration surface for the admission engine (`spec.md` §6).
//!
//! Two distinct layering strategies are at work here, deliberately:
//!
//! - [`AdmissionConfig`] uses `ortho_config`'s layered CLI/file/environment
//!   merge for the global cancel-in-progress toggles.
//! - [`GithubCacheSettings`] is read directly from the process environment,
//!   because only two variables are involved (`PAC_GITHUB_CACHE_ENABLED`,
//!   `PAC_GITHUB_CACHE_TTL`) and `ortho_config` cannot source booleans from
//!   the environment, so a manual read is simplest here.
//!
//! Repository-level settings (`concurrency_limit`, `settings.comment_strategy`)
//! are not process-wide configuration: they live on [`RepositoryPolicy`],
//! supplied by the caller per repository, since the repository spec itself
//! lives in the excluded Kubernetes CRD layer.

use std::env;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default TTL applied when `PAC_GITHUB_CACHE_TTL` is absent or invalid.
pub const DEFAULT_GITHUB_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Global cancel-in-progress and other process-wide toggles, layered via
/// `ortho_config` CLI/file/environment precedence (`spec.md` §6).
#[derive(Debug, Clone, Default, Deserialize, Serialize, OrthoConfig)]
#[serde(default)]
#[ortho_config(
    prefix = "PAC",
    discovery(
        dotfile_name = ".pac-admit.toml",
        config_file_name = "pac-admit.toml",
        app_name = "pac-admit"
    )
)]
pub struct AdmissionConfig {
    /// `enable-cancel-in-progress-on-pull-requests`: cancel superseded
    /// in-flight pipelines when a newer commit lands on the same pull
    /// request.
    #[ortho_config()]
    pub enable_cancel_in_progress_on_pull_requests: bool,

    /// `enable-cancel-in-progress-on-push`: cancel superseded in-flight
    /// pipelines when a newer commit lands on the same branch.
    #[ortho_config()]
    pub enable_cancel_in_progress_on_push: bool,
}

/// Remote-resolver cache settings (`spec.md` §6), read directly from the
/// process environment rather than through `ortho_config`'s layering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GithubCacheSettings {
    /// Whether the resolver's TTL cache is consulted at all.
    pub enabled: bool,
    /// Fallback TTL handed to [`crate::cache::expiry::compute_expiry`] when
    /// response headers don't dictate one. `None` means "use the expiry
    /// policy's own defaults".
    pub fallback_ttl: Option<Duration>,
}

impl Default for GithubCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_ttl: None,
        }
    }
}

impl GithubCacheSettings {
    /// Reads `PAC_GITHUB_CACHE_ENABLED` and `PAC_GITHUB_CACHE_TTL` from the
    /// process environment.
    ///
    /// `PAC_GITHUB_CACHE_ENABLED` defaults to enabled when absent; any value
    /// other than a case-insensitive `"true"` disables the cache. An invalid
    /// `PAC_GITHUB_CACHE_TTL` falls back to [`DEFAULT_GITHUB_CACHE_TTL`] and
    /// emits a warning, matching `spec.md`'s "invalid ⇒ default + warn".
    #[must_use]
    pub fn from_env() -> Self {
        let enabled = env::var("PAC_GITHUB_CACHE_ENABLED")
            .ok()
            .map_or(true, |raw| raw.eq_ignore_ascii_case("true"));

        let fallback_ttl = env::var("PAC_GITHUB_CACHE_TTL").ok().map(|raw| {
            humantime::parse_duration(&raw).unwrap_or_else(|error| {
                warn!(value = %raw, %error, "invalid PAC_GITHUB_CACHE_TTL, using default");
                DEFAULT_GITHUB_CACHE_TTL
            })
        });

        Self { enabled, fallback_ttl }
    }
}

/// How a repository's status comments should be posted, per
/// `settings.comment_strategy` (`spec.md` §6). Posting itself is an external
/// collaborator; this only carries the caller's choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommentStrategy {
    /// Post status comments as usual.
    #[default]
    Default,
    /// Suppress all status comments.
    DisableAll,
}

/// Per-repository policy supplied by the caller (`spec.md` §6): the
/// repository spec itself is part of the excluded Kubernetes CRD layer, so
/// this is the plain value this crate's admission logic actually consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryPolicy {
    /// Concurrency limit (`N`). `0` means unlimited.
    pub concurrency_limit: u32,
    /// Status-comment posting strategy.
    pub comment_strategy: CommentStrategy,
}

impl RepositoryPolicy {
    /// Whether this policy suppresses status comments entirely.
    #[must_use]
    pub const fn suppresses_status_comments(&self) -> bool {
        matches!(self.comment_strategy, CommentStrategy::DisableAll)
    }
}
