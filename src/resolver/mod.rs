//! Fetches pipeline/task definitions and file blobs from remote forges,
//! memoized through the TTL cache and a per-resolution-pass map
//! (`spec.md` §4.5).
//!
//! The fetch trait is the seam tests mock against; the Octocrab type is the
//! only thing that talks HTTP.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use http::HeaderMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::cache::TtlCache;
use crate::cache::expiry::compute_expiry;
use crate::clock::Clock;
use crate::telemetry::{NoopTelemetrySink, TelemetryEvent, TelemetrySink};

/// Errors surfaced while resolving a remote resource.
#[derive(Debug, Error, Clone)]
pub enum ResolverError {
    /// The requested object or path does not exist at the given reference.
    #[error("not found: {message}")]
    NotFound {
        /// Human-readable detail.
        message: String,
    },

    /// A network-level failure (timeout, connection reset, DNS).
    #[error("network error: {message}")]
    Network {
        /// Human-readable detail.
        message: String,
    },

    /// The forge API rejected the request for a reason other than "not found".
    #[error("forge API error: {message}")]
    Api {
        /// Human-readable detail.
        message: String,
    },

    /// The resolution was cancelled by the caller.
    #[error("resolution cancelled")]
    Cancelled,
}

/// A single resolved resource: its bytes plus the response headers used to
/// derive its cache expiry.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    /// The raw resource bytes.
    pub bytes: Vec<u8>,
    /// Response headers, consulted by the expiry policy.
    pub headers: HeaderMap,
}

/// Fetches raw objects and repository-relative files from a forge.
///
/// The trait is the seam mocked in tests; [`OctocrabObjectFetcher`] is the
/// only implementation that performs real HTTP requests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteObjectFetcher: Send + Sync {
    /// Fetches a bare object (typically a git blob) by SHA.
    async fn fetch_object(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<FetchedObject, ResolverError>;

    /// Fetches a file's contents from inside a repository at `reference`.
    async fn fetch_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<FetchedObject, ResolverError>;
}

/// Octocrab-backed [`RemoteObjectFetcher`].
pub struct OctocrabObjectFetcher {
    client: octocrab::Octocrab,
}

impl OctocrabObjectFetcher {
    /// Wraps an already-constructed Octocrab client.
    #[must_use]
    pub const fn new(client: octocrab::Octocrab) -> Self {
        Self { client }
    }

    fn map_octocrab_error(operation: &str, error: &octocrab::Error) -> ResolverError {
        if let octocrab::Error::GitHub { source, .. } = error {
            return if source.status_code == http::StatusCode::NOT_FOUND {
                ResolverError::NotFound {
                    message: format!("{operation}: {message}", message = source.message),
                }
            } else {
                ResolverError::Api {
                    message: format!(
                        "{operation} failed with status {status}: {message}",
                        status = source.status_code,
                        message = source.message
                    ),
                }
            };
        }

        if matches!(
            error,
            octocrab::Error::Http { .. } | octocrab::Error::Hyper { .. } | octocrab::Error::Service { .. }
        ) {
            return ResolverError::Network {
                message: format!("{operation} failed: {error}"),
            };
        }

        ResolverError::Api {
            message: format!("{operation} failed: {error}"),
        }
    }
}

#[async_trait]
impl RemoteObjectFetcher for OctocrabObjectFetcher {
    async fn fetch_object(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<FetchedObject, ResolverError> {
        let response = self
            .client
            .repos(owner, repo)
            .get_raw_ref(sha)
            .await
            .map_err(|error| Self::map_octocrab_error("fetch object", &error))?;

        Ok(FetchedObject {
            headers: response.headers().clone(),
            bytes: response.into_body().to_vec(),
        })
    }

    async fn fetch_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<FetchedObject, ResolverError> {
        let response = self
            .client
            .repos(owner, repo)
            .raw_file(reference, path)
            .await
            .map_err(|error| Self::map_octocrab_error("fetch file", &error))?;

        Ok(FetchedObject {
            headers: response.headers().clone(),
            bytes: response.into_body().to_vec(),
        })
    }
}

/// Per-resolution-pass memoization, consulted before the global cache
/// (`spec.md` §4.5: "captures resources already materialized in this
/// resolution to avoid redundant decoding").
#[derive(Default)]
pub struct ResolutionRun {
    tasks: Mutex<HashMap<String, String>>,
    pipelines: Mutex<HashMap<String, String>>,
}

impl ResolutionRun {
    /// Creates an empty run scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn memo_get(lock: &Mutex<HashMap<String, String>>, name: &str) -> Option<String> {
        lock.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn memo_insert(lock: &Mutex<HashMap<String, String>>, name: String, value: String) {
        lock.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name, value);
    }
}

fn cache_key(owner: &str, repo: &str, reference: &str, path: &str) -> String {
    format!("{owner}/{repo}/{reference}/{path}")
}

fn is_sha(value: &str) -> bool {
    crate::cache::expiry::is_sha_reference(value)
}

/// Resolves remote objects and files, consulting the TTL cache according to
/// the read/write-skip rules in `spec.md` §4.5.
pub struct RemoteResolver {
    fetcher: Arc<dyn RemoteObjectFetcher>,
    cache: Arc<TtlCache<String, Vec<u8>>>,
    clock: Arc<dyn Clock>,
    cache_enabled: bool,
    fallback_ttl: Option<StdDuration>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl RemoteResolver {
    /// Builds a resolver over the given fetcher and cache, with telemetry
    /// events dropped. Use [`Self::with_telemetry`] to observe cache
    /// hit/miss/skip events.
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn RemoteObjectFetcher>,
        cache: Arc<TtlCache<String, Vec<u8>>>,
        clock: Arc<dyn Clock>,
        cache_enabled: bool,
        fallback_ttl: Option<StdDuration>,
    ) -> Self {
        Self {
            fetcher,
            cache,
            clock,
            cache_enabled,
            fallback_ttl,
            telemetry: Arc::new(NoopTelemetrySink),
        }
    }

    /// Replaces the telemetry sink events are recorded to.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Fetches a bare object (git blob) by SHA, per `spec.md`'s
    /// `GetObject(ctx, sha, event)`.
    ///
    /// # Errors
    ///
    /// Propagates [`ResolverError`] from the underlying fetch.
    pub async fn get_object(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<u8>, ResolverError> {
        let key = cache_key(owner, repo, sha, sha);
        self.resolve(&key, sha, || self.fetcher.fetch_object(owner, repo, sha))
            .await
    }

    /// Fetches a repository-relative file at `reference`, per `spec.md`'s
    /// `GetFileInsideRepo(ctx, event, path, ref)`.
    ///
    /// # Errors
    ///
    /// Propagates [`ResolverError`] from the underlying fetch. Returns
    /// [`ResolverError::Api`] (not [`ResolverError::NotFound`]) if the fetched
    /// bytes are not valid UTF-8.
    pub async fn get_file_inside_repo(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<String, ResolverError> {
        let key = cache_key(owner, repo, reference, path);
        let bytes = self
            .resolve(&key, reference, || {
                self.fetcher.fetch_file(owner, repo, path, reference)
            })
            .await?;

        String::from_utf8(bytes).map_err(|error| ResolverError::Api {
            message: format!("file at {path}@{reference} is not valid UTF-8: {error}"),
        })
    }

    /// Fetches a task definition by name, consulting `run`'s memo map before
    /// the global cache.
    ///
    /// # Errors
    ///
    /// Propagates [`ResolverError`] from the underlying fetch.
    pub async fn get_task(
        &self,
        run: &ResolutionRun,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
        name: &str,
    ) -> Result<String, ResolverError> {
        self.get_memoized(&run.tasks, owner, repo, path, reference, name)
            .await
    }

    /// Fetches a pipeline definition by name, consulting `run`'s memo map
    /// before the global cache.
    ///
    /// # Errors
    ///
    /// Propagates [`ResolverError`] from the underlying fetch.
    pub async fn get_pipeline(
        &self,
        run: &ResolutionRun,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
        name: &str,
    ) -> Result<String, ResolverError> {
        self.get_memoized(&run.pipelines, owner, repo, path, reference, name)
            .await
    }

    async fn get_memoized(
        &self,
        memo: &Mutex<HashMap<String, String>>,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
        name: &str,
    ) -> Result<String, ResolverError> {
        if let Some(hit) = ResolutionRun::memo_get(memo, name) {
            trace!(name, "resolution-run memo hit");
            return Ok(hit);
        }

        let contents = self.get_file_inside_repo(owner, repo, path, reference).await?;
        ResolutionRun::memo_insert(memo, name.to_owned(), contents.clone());
        Ok(contents)
    }

    async fn resolve<F, Fut>(&self, key: &str, reference: &str, fetch: F) -> Result<Vec<u8>, ResolverError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<FetchedObject, ResolverError>>,
    {
        let sha_reference = is_sha(reference);

        if self.cache_enabled && sha_reference {
            if let Some(cached) = self.cache.get(&key.to_owned()) {
                debug!(key, "resolver cache hit");
                self.telemetry.record(TelemetryEvent::CacheHit { key: key.to_owned() });
                return Ok(cached);
            }
        }

        if self.cache_enabled && !sha_reference {
            trace!(key, "resolver cache read skipped for non-SHA reference");
            self.telemetry.record(TelemetryEvent::CacheSkipped { key: key.to_owned() });
        }

        let fetched = fetch().await?;
        debug!(key, "resolver cache miss, fetched remotely");
        self.telemetry.record(TelemetryEvent::CacheMiss { key: key.to_owned() });

        if self.cache_enabled {
            let expiry = compute_expiry(&fetched.headers, reference, self.fallback_ttl, self.clock.now());
            self.cache.set(key.to_owned(), fetched.bytes.clone(), expiry);
        }

        Ok(fetched.bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()))
    }

    fn resolver(fetcher: MockRemoteObjectFetcher, cache_enabled: bool, clock: Arc<dyn Clock>) -> RemoteResolver {
        RemoteResolver::new(
            Arc::new(fetcher),
            Arc::new(TtlCache::new(clock.clone())),
            clock,
            cache_enabled,
            None,
        )
    }

    #[tokio::test]
    async fn second_get_object_for_a_sha_is_served_from_cache() {
        let mut fetcher = MockRemoteObjectFetcher::new();
        fetcher
            .expect_fetch_object()
            .times(1)
            .returning(|_, _, _| {
                Box::pin(async {
                    Ok(FetchedObject {
                        bytes: b"blob".to_vec(),
                        headers: HeaderMap::new(),
                    })
                })
            });

        let clock: Arc<dyn Clock> = clock();
        let resolver = resolver(fetcher, true, clock);

        let sha = "0123456789abcdef0123456789abcdef01234567";
        let first = resolver.get_object("acme", "widgets", sha).await.unwrap();
        let second = resolver.get_object("acme", "widgets", sha).await.unwrap();
        assert_eq!(first, b"blob");
        assert_eq!(second, b"blob");
    }

    #[tokio::test]
    async fn non_sha_reference_always_refetches() {
        let mut fetcher = MockRemoteObjectFetcher::new();
        fetcher
            .expect_fetch_file()
            .times(2)
            .returning(|_, _, _, _| {
                Box::pin(async {
                    Ok(FetchedObject {
                        bytes: b"file contents".to_vec(),
                        headers: HeaderMap::new(),
                    })
                })
            });

        let clock: Arc<dyn Clock> = clock();
        let resolver = resolver(fetcher, true, clock);

        resolver
            .get_file_inside_repo("acme", "widgets", "task.yaml", "main")
            .await
            .unwrap();
        resolver
            .get_file_inside_repo("acme", "widgets", "task.yaml", "main")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cache_disabled_always_refetches_even_for_a_sha() {
        let mut fetcher = MockRemoteObjectFetcher::new();
        fetcher
            .expect_fetch_object()
            .times(2)
            .returning(|_, _, _| {
                Box::pin(async {
                    Ok(FetchedObject {
                        bytes: b"blob".to_vec(),
                        headers: HeaderMap::new(),
                    })
                })
            });

        let clock: Arc<dyn Clock> = clock();
        let resolver = resolver(fetcher, false, clock);

        let sha = "0123456789abcdef0123456789abcdef01234567";
        resolver.get_object("acme", "widgets", sha).await.unwrap();
        resolver.get_object("acme", "widgets", sha).await.unwrap();
    }

    #[tokio::test]
    async fn resolution_run_memo_avoids_a_second_fetch_within_one_pass() {
        let mut fetcher = MockRemoteObjectFetcher::new();
        fetcher
            .expect_fetch_file()
            .times(1)
            .returning(|_, _, _, _| {
                Box::pin(async {
                    Ok(FetchedObject {
                        bytes: b"task: body".to_vec(),
                        headers: HeaderMap::new(),
                    })
                })
            });

        let clock: Arc<dyn Clock> = clock();
        let resolver = resolver(fetcher, true, clock);
        let run = ResolutionRun::new();

        let first = resolver
            .get_task(&run, "acme", "widgets", "tasks/build.yaml", "main", "build")
            .await
            .unwrap();
        let second = resolver
            .get_task(&run, "acme", "widgets", "tasks/build.yaml", "main", "build")
            .await
            .unwrap();
        assert_eq!(first, "task: body");
        assert_eq!(second, "task: body");
    }

    #[tokio::test]
    async fn not_found_error_propagates() {
        let mut fetcher = MockRemoteObjectFetcher::new();
        fetcher.expect_fetch_object().times(1).returning(|_, _, _| {
            Box::pin(async {
                Err(ResolverError::NotFound {
                    message: "no such object".to_owned(),
                })
            })
        });

        let clock: Arc<dyn Clock> = clock();
        let resolver = resolver(fetcher, true, clock);
        let sha = "0123456789abcdef0123456789abcdef01234567";
        let error = resolver.get_object("acme", "widgets", sha).await.unwrap_err();
        assert!(matches!(error, ResolverError::NotFound { .. }));
    }
}
