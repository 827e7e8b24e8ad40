//! Normalized representation of an incoming forge event.
//!
//! Provider-specific webhook payloads are decoded by an external adapter; this
//! module only normalizes an already-decoded [`NormalizationInput`] into the
//! canonical [`Event`] shape the rest of the admission pipeline consumes.

pub mod comment;

use crate::event::comment::GitOpsIntent;

/// The kind of event a webhook delivered, after normalization.
///
/// GitOps intents (`test-all`, `retest-one`, ...) are folded in here because
/// downstream matching treats them uniformly with `pull_request` (see
/// [`Event::matching_kind`]), but the original intent is preserved on
/// [`Event::gitops_intent`] for callers that need it verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A `git push` to a branch or tag.
    Push,
    /// A pull request was opened, synchronised, etc.
    PullRequest,
    /// A pull request was labeled.
    PullRequestLabeled,
    /// A comment was left on an issue or pull request.
    IssueComment,
    /// A comment was left on a commit.
    CommitComment,
}

/// Which pipeline-trigger class an event matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerTarget {
    /// Matches pipelines that trigger on pull requests.
    PullRequest,
    /// Matches pipelines that trigger on pushes.
    Push,
}

/// Raw, already-decoded fields a provider adapter extracts from a webhook
/// payload. [`normalize`] turns this into a canonical [`Event`].
#[derive(Debug, Clone, Default)]
pub struct NormalizationInput {
    /// The normalized event kind.
    pub kind: Option<EventKind>,
    /// Organization or user that owns the repository.
    pub organization: String,
    /// Repository name.
    pub repository: String,
    /// Default branch of the repository.
    pub default_branch: String,
    /// Repository HTML URL.
    pub url: String,
    /// Full git ref from the payload (`refs/heads/main`, `refs/tags/v1`, ...).
    pub git_ref: Option<String>,
    /// Base branch ref (pull requests only).
    pub base_ref: Option<String>,
    /// Head branch ref (pull requests only).
    pub head_ref: Option<String>,
    /// Base repository HTTP URL (pull requests only; may differ for forks).
    pub base_repo_url: Option<String>,
    /// Head repository HTTP URL (pull requests only; may differ for forks).
    pub head_repo_url: Option<String>,
    /// Commit SHA the event concerns.
    pub sha: String,
    /// Commit message title/summary.
    pub sha_title: Option<String>,
    /// URL to view the commit.
    pub sha_url: Option<String>,
    /// Login of the user who triggered the event.
    pub sender: String,
    /// Pull request number, when the event concerns one.
    pub pull_request_number: u64,
    /// Pull request title, when the event concerns one.
    pub pull_request_title: Option<String>,
    /// Pull request labels, in payload order.
    pub pull_request_labels: Vec<String>,
    /// Clone URL for the repository.
    pub clone_url: Option<String>,
    /// Raw body of the triggering comment, if any.
    pub trigger_comment: Option<String>,
    /// Tail of the `issue_url` field on an issue-comment payload, used to
    /// derive the pull request number (see `spec.md` §4.1).
    pub issue_url_tail: Option<String>,
    /// Provider credentials bundle. Never copied into a CEL context.
    pub provider_credentials: Option<ProviderCredentials>,
}

/// Opaque provider credentials carried on an [`Event`] but explicitly
/// excluded from any CEL context (`spec.md` §4.6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderCredentials {
    /// Installation or app identifier.
    pub installation_id: Option<String>,
    /// Account identifier.
    pub account_id: Option<String>,
    /// GitHub Enterprise base URL, when applicable.
    pub ghe_url: Option<String>,
}

/// A normalized representation of an incoming forge event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Normalized event kind.
    pub event_type: EventKind,
    /// Organization or user that owns the repository.
    pub organization: String,
    /// Repository name.
    pub repository: String,
    /// Default branch of the repository.
    pub default_branch: String,
    /// Repository HTML URL.
    pub url: String,
    /// Base branch, without the `refs/heads/` prefix.
    pub base_branch: String,
    /// Head branch, without the `refs/heads/` prefix.
    pub head_branch: String,
    /// Base repository HTTP URL.
    pub base_url: Option<String>,
    /// Head repository HTTP URL.
    pub head_url: Option<String>,
    /// Git tag name, present only for `refs/tags/<t>` push events.
    pub git_tag: Option<String>,
    /// Commit SHA the event concerns.
    pub sha: String,
    /// Commit message title/summary.
    pub sha_title: Option<String>,
    /// URL to view the commit.
    pub sha_url: Option<String>,
    /// Login of the user who triggered the event.
    pub sender: String,
    /// Pull request number (0 when the event is not PR-scoped).
    pub pull_request_number: u64,
    /// Pull request title.
    pub pull_request_title: Option<String>,
    /// Pull request labels, in payload order.
    pub pull_request_labels: Vec<String>,
    /// Clone URL for the repository.
    pub clone_url: Option<String>,
    /// Raw body of the triggering comment, if any.
    pub trigger_comment: Option<String>,
    /// Pipelinerun name targeted by an imperative retargeting comment.
    pub target_pipelinerun: Option<String>,
    /// Pipelinerun name targeted by an imperative cancel comment.
    pub target_cancel_pipelinerun: Option<String>,
    /// Whether the triggering comment was a blanket `/cancel`.
    pub cancel_all: bool,
    /// The GitOps intent parsed from the trigger comment, if any.
    pub gitops_intent: Option<GitOpsIntent>,
    /// Provider credentials. Never exposed to a CEL context.
    pub provider_credentials: Option<ProviderCredentials>,
}

impl Event {
    /// Returns the trigger target pipelines match against.
    ///
    /// Per `spec.md` §4.2's back-compat rule, any GitOps intent other than
    /// `on-comment` is treated as `pull_request` for matching purposes.
    #[must_use]
    pub const fn matching_kind(&self) -> TriggerTarget {
        match self.event_type {
            EventKind::Push | EventKind::CommitComment => TriggerTarget::Push,
            EventKind::PullRequest
            | EventKind::PullRequestLabeled
            | EventKind::IssueComment => TriggerTarget::PullRequest,
        }
    }

    /// Whether this event's kind is one of the GitOps intents rather than a
    /// bare provider event, and therefore subject to the back-compat
    /// deprecation notice in `spec.md` §4.2.
    #[must_use]
    pub const fn is_deprecated_gitops_remap(&self) -> bool {
        matches!(
            self.gitops_intent,
            Some(
                GitOpsIntent::TestAll
                    | GitOpsIntent::TestOne { .. }
                    | GitOpsIntent::RetestAll
                    | GitOpsIntent::RetestOne { .. }
                    | GitOpsIntent::CancelAll
                    | GitOpsIntent::CancelOne { .. }
                    | GitOpsIntent::OkToTest
            )
        )
    }
}

fn strip_refs_heads(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

fn derive_git_tag(git_ref: &str) -> Option<String> {
    git_ref
        .strip_prefix("refs/tags/")
        .map(std::borrow::ToOwned::to_owned)
}

/// Derives the pull request number from the tail segment of an issue-comment
/// payload's `issue_url` (`spec.md` §4.1).
fn pull_request_number_from_issue_url(issue_url_tail: &str) -> u64 {
    issue_url_tail
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse().ok())
        .unwrap_or(0)
}

/// Normalizes an already-decoded webhook payload into a canonical [`Event`].
///
/// # Panics
///
/// Does not panic; unrecognised or absent fields degrade to empty defaults
/// rather than failing, since the provider adapter is responsible for payload
/// validity (`spec.md` §1 excludes payload decoding from this crate).
#[must_use]
pub fn normalize(input: NormalizationInput) -> Event {
    let kind = input.kind.unwrap_or(EventKind::Push);

    let (base_branch, head_branch, git_tag) = match kind {
        EventKind::PullRequest | EventKind::PullRequestLabeled => (
            input
                .base_ref
                .as_deref()
                .map(strip_refs_heads)
                .unwrap_or_default()
                .to_owned(),
            input
                .head_ref
                .as_deref()
                .map(strip_refs_heads)
                .unwrap_or_default()
                .to_owned(),
            None,
        ),
        EventKind::Push | EventKind::CommitComment | EventKind::IssueComment => {
            let git_ref = input.git_ref.as_deref().unwrap_or_default();
            let branch = strip_refs_heads(git_ref).to_owned();
            let tag = derive_git_tag(git_ref);
            (branch.clone(), branch, tag)
        }
    };

    let pull_request_number = match kind {
        EventKind::IssueComment => input
            .issue_url_tail
            .as_deref()
            .map_or(input.pull_request_number, pull_request_number_from_issue_url),
        _ => input.pull_request_number,
    };

    let gitops_intent = input
        .trigger_comment
        .as_deref()
        .and_then(|body| comment::classify(body, &[]).ok())
        .and_then(|outcome| outcome.intent);

    let (target_pipelinerun, target_cancel_pipelinerun, cancel_all) = match &gitops_intent {
        Some(GitOpsIntent::TestOne { pipelinerun, .. } | GitOpsIntent::RetestOne { pipelinerun, .. }) => {
            (Some(pipelinerun.clone()), None, false)
        }
        Some(GitOpsIntent::CancelOne { pipelinerun }) => (None, Some(pipelinerun.clone()), false),
        Some(GitOpsIntent::CancelAll) => (None, None, true),
        _ => (None, None, false),
    };

    Event {
        event_type: kind,
        organization: input.organization,
        repository: input.repository,
        default_branch: input.default_branch,
        url: input.url,
        base_branch,
        head_branch,
        base_url: input.base_repo_url,
        head_url: input.head_repo_url,
        git_tag,
        sha: input.sha,
        sha_title: input.sha_title,
        sha_url: input.sha_url,
        sender: input.sender,
        pull_request_number,
        pull_request_title: input.pull_request_title,
        pull_request_labels: input.pull_request_labels,
        clone_url: input.clone_url,
        trigger_comment: input.trigger_comment,
        target_pipelinerun,
        target_cancel_pipelinerun,
        cancel_all,
        gitops_intent,
        provider_credentials: input.provider_credentials,
    }
}
