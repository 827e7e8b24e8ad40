//! Event-to-pipeline admission engine for forge webhooks.
//!
//! Turns a decoded webhook event into a semantic [`event::Event`], extracts
//! imperative GitOps instructions from comment text
//! ([`event::comment::classify`]), resolves remote pipeline/task definitions
//! through a TTL-aware cache ([`cache`], [`resolver`]), assembles the
//! whitelisted variable environment handed to user CEL expressions
//! ([`cel`]), and admits the resulting pipeline runs under a per-repository
//! concurrency limit ([`concurrency`], with [`queue`] providing FIFO
//! fairness for callers that choose to queue explicitly).
//!
//! Provider webhook decoding, Kubernetes client wiring, signature
//! verification, and status reporting are all external collaborators; this
//! crate only covers the admission decision itself.

pub mod cache;
pub mod cel;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod event;
pub mod queue;
pub mod resolver;
pub mod telemetry;

pub use cache::TtlCache;
pub use cel::{CelContext, FORBIDDEN_FIELDS};
pub use clock::{Clock, ManualClock, SystemClock};
pub use concurrency::{
    ConcurrencyDriver, ConcurrencyError, LeaseId, PipelineRunState, PrKey, RepositoryKey,
};
pub use config::{AdmissionConfig, CommentStrategy, GithubCacheSettings, RepositoryPolicy};
pub use error::AdmissionError;
pub use event::comment::{ClassificationOutcome, CommentParseError, GitOpsIntent, OnCommentPattern};
pub use event::{Event, EventKind, NormalizationInput, ProviderCredentials, TriggerTarget, normalize};
pub use queue::PriorityQueue;
pub use resolver::{
    FetchedObject, OctocrabObjectFetcher, RemoteObjectFetcher, RemoteResolver, ResolutionRun,
    ResolverError,
};
pub use telemetry::{NoopTelemetrySink, StderrJsonlTelemetrySink, TelemetryEvent, TelemetrySink};
