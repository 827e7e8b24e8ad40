//! Parses GitOps comment bodies into a semantic intent plus arguments.
//!
//! Directives are line-anchored: a webhook comment may contain prose before
//! or after the directive line, so each line is checked independently against
//! the fixed intent patterns before falling back to user-defined
//! `on-comment` patterns matched against the whole body.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Errors surfaced while classifying a comment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommentParseError {
    /// A `test-one`/`retest-one`/`cancel-one` directive had no pipelinerun
    /// name argument.
    #[error("directive is missing its pipelinerun name argument")]
    MissingArgument,

    /// The `branch:<name>` argument form was present but malformed (wrong
    /// prefix or an empty branch name).
    #[error("malformed branch argument: {token}")]
    MalformedBranchArgument {
        /// The offending token.
        token: String,
    },
}

/// A user-defined `on-comment` matcher: a pipeline annotation's regex pattern.
#[derive(Debug, Clone)]
pub struct OnCommentPattern {
    /// The compiled pattern from a pipeline's `on-comment` annotation.
    pub regex: Regex,
}

/// The GitOps intent parsed from a comment, with any associated arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitOpsIntent {
    /// `/test` — rerun all applicable pipelines.
    TestAll,
    /// `/test <pipelinerun> [branch:<name>]`.
    TestOne {
        /// Targeted pipelinerun name.
        pipelinerun: String,
        /// Optional branch override.
        branch: Option<String>,
    },
    /// `/retest` — rerun all applicable pipelines that previously ran.
    RetestAll,
    /// `/retest <pipelinerun> [branch:<name>]`.
    RetestOne {
        /// Targeted pipelinerun name.
        pipelinerun: String,
        /// Optional branch override.
        branch: Option<String>,
    },
    /// `/cancel` — cancel all in-flight pipelines for the pull request.
    CancelAll,
    /// `/cancel <pipelinerun>`.
    CancelOne {
        /// Targeted pipelinerun name.
        pipelinerun: String,
    },
    /// `/ok-to-test` — a maintainer approves running pipelines for an
    /// untrusted contributor.
    OkToTest,
    /// The comment matched a pipeline's user-defined `on-comment` pattern.
    OnComment {
        /// The full, unmodified comment body.
        comment: String,
    },
}

/// The outcome of classifying a comment: the intent (if any) matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationOutcome {
    /// `None` when the comment matched no fixed intent and no user pattern.
    pub intent: Option<GitOpsIntent>,
}

impl ClassificationOutcome {
    const fn none() -> Self {
        Self { intent: None }
    }

    const fn some(intent: GitOpsIntent) -> Self {
        Self {
            intent: Some(intent),
        }
    }
}

static TEST_ALL: LazyLock<Regex> = LazyLock::new(|| regex_unwrap(r"^/test\s*$"));
static TEST_ONE: LazyLock<Regex> = LazyLock::new(|| regex_unwrap(r"^/test[ \t]+\S+"));
static RETEST_ALL: LazyLock<Regex> = LazyLock::new(|| regex_unwrap(r"^/retest\s*$"));
static RETEST_ONE: LazyLock<Regex> = LazyLock::new(|| regex_unwrap(r"^/retest[ \t]+\S+"));
static CANCEL_ALL: LazyLock<Regex> = LazyLock::new(|| regex_unwrap(r"^/cancel\s*$"));
static CANCEL_ONE: LazyLock<Regex> = LazyLock::new(|| regex_unwrap(r"^/cancel[ \t]+\S+"));
static OK_TO_TEST: LazyLock<Regex> = LazyLock::new(|| regex_unwrap(r"^/ok-to-test\s*$"));

#[expect(
    clippy::unreachable,
    reason = "built-in patterns are fixed string literals verified to compile; a failure here is a programming error, not a runtime condition"
)]
fn regex_unwrap(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|error| {
        unreachable!("built-in GitOps comment pattern {pattern:?} must compile: {error}")
    })
}

/// Splits the text after a one-shot directive (`/test foo branch:bar`) into
/// its pipelinerun name and optional branch override.
fn parse_one_argument(line: &str, prefix_len: usize) -> Result<(String, Option<String>), CommentParseError> {
    let remainder = line.get(prefix_len..).unwrap_or_default().trim_start();
    let mut tokens = remainder.split_whitespace();

    let pipelinerun = tokens
        .next()
        .ok_or(CommentParseError::MissingArgument)?
        .to_owned();

    let branch = match tokens.next() {
        None => None,
        Some(token) => match token.strip_prefix("branch:") {
            Some(name) if !name.is_empty() => Some(name.to_owned()),
            _ => {
                return Err(CommentParseError::MalformedBranchArgument {
                    token: token.to_owned(),
                });
            }
        },
    };

    Ok((pipelinerun, branch))
}

/// Classifies a comment body into a [`GitOpsIntent`], checking fixed
/// directives line by line before falling back to `on-comment` patterns
/// matched against the whole body.
///
/// # Errors
///
/// Returns [`CommentParseError`] when a `test-one`/`retest-one`/`cancel-one`
/// directive's `branch:<name>` argument is present but malformed.
pub fn classify(
    body: &str,
    on_comment_patterns: &[OnCommentPattern],
) -> Result<ClassificationOutcome, CommentParseError> {
    for raw_line in body.lines() {
        let line = raw_line.trim_end_matches('\r');

        if TEST_ALL.is_match(line) {
            return Ok(ClassificationOutcome::some(GitOpsIntent::TestAll));
        }
        if TEST_ONE.is_match(line) {
            let (pipelinerun, branch) = parse_one_argument(line, "/test".len())?;
            return Ok(ClassificationOutcome::some(GitOpsIntent::TestOne {
                pipelinerun,
                branch,
            }));
        }
        if RETEST_ALL.is_match(line) {
            return Ok(ClassificationOutcome::some(GitOpsIntent::RetestAll));
        }
        if RETEST_ONE.is_match(line) {
            let (pipelinerun, branch) = parse_one_argument(line, "/retest".len())?;
            return Ok(ClassificationOutcome::some(GitOpsIntent::RetestOne {
                pipelinerun,
                branch,
            }));
        }
        if CANCEL_ALL.is_match(line) {
            return Ok(ClassificationOutcome::some(GitOpsIntent::CancelAll));
        }
        if CANCEL_ONE.is_match(line) {
            let (pipelinerun, _branch) = parse_one_argument(line, "/cancel".len())?;
            return Ok(ClassificationOutcome::some(GitOpsIntent::CancelOne {
                pipelinerun,
            }));
        }
        if OK_TO_TEST.is_match(line) {
            return Ok(ClassificationOutcome::some(GitOpsIntent::OkToTest));
        }
    }

    for pattern in on_comment_patterns {
        if pattern.regex.is_match(body) {
            return Ok(ClassificationOutcome::some(GitOpsIntent::OnComment {
                comment: body.to_owned(),
            }));
        }
    }

    Ok(ClassificationOutcome::none())
}
